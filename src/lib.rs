//! # pe-mapper: Manual mapping of Windows DLLs into remote processes.
//!
//! `pe-mapper` loads a DLL into another process without asking that process's
//! loader for help: it reads the PE file from disk, lays the image out in the
//! target's address space section by section, rebases it, links its import
//! graph (recursively mapping dependencies, with a cache that closes cyclic
//! import graphs), chases forwarded exports, applies per-section page
//! protections, and finally runs TLS callbacks and the entry point as remote
//! calls.
//!
//! ## Examples
//! ```ignore
//! use pe_mapper::{mapper::Mapper, process::WindowsProcess};
//! use std::path::Path;
//!
//! let process = WindowsProcess::open(pid)?;
//! let mut mapper = Mapper::new(process)?;
//!
//! // Map the DLL and everything it imports, then run its entry point.
//! let base = mapper.inject_dll(Path::new(r"C:\payload\hook.dll"), None, None)?;
//! println!("mapped at {base:#x}");
//! ```
//!
//! The engine itself is portable: it talks to the target process only through
//! the [`memory::ProcessMemory`] and [`modules::ModuleList`] traits, for which
//! [`process::WindowsProcess`] is the Win32-backed implementation.

#![warn(missing_docs)]

use std::io;
use thiserror::Error as ThisError;

/// COFF file header definitions and helper functions
pub mod coff;
/// Export directory parsing and forwarded-export descriptors
pub mod export;
/// Host-side queries: shim probe, well-known directories, local export lookup
pub mod host;
/// Import directory and thunk parsing
pub mod import;
/// The mapper facade orchestrating the whole injection pipeline
pub mod mapper;
/// The cross-process memory contract consumed by the engine
pub mod memory;
/// Enumeration of modules already loaded in the target process
pub mod modules;
/// Optional header definitions and helper functions
pub mod optional;
/// DOS/NT header validation and local/remote image views
pub mod pe;
/// Win32-backed target process implementation
#[cfg(windows)]
pub mod process;
/// Base relocation definitions and the rebasing walk
pub mod reloc;
/// DLL search-order emulation and cache-key normalization
pub mod resolve;
/// Section header definitions and helper functions
pub mod section;
/// TLS directory parsing
pub mod tls;

/// Errors reported while manually mapping an image.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The application-compatibility shim engine is loaded in the injecting
    /// process, which would poison export-address resolution.
    #[error("shim engine is loaded in the injecting process")]
    ShimsEnabled,
    /// DOS/NT header validation failed, or the image has an unsupported shape.
    #[error("invalid PE image: {0}")]
    BadImage(&'static str),
    /// Path resolution could not locate a module on disk.
    #[error("could not locate module `{0}`")]
    ModuleNotFound(String),
    /// The image contains a base relocation other than `ABSOLUTE`, `HIGHLOW`
    /// or `DIR64`.
    #[error("unsupported base relocation type {0:#x}")]
    UnsupportedReloc(u8),
    /// An imported function could not be located by ordinal, hint or name.
    #[error("unresolved import `{module}!{symbol}`")]
    UnresolvedImport {
        /// Name of the module the import was looked up in.
        module: String,
        /// Imported symbol, either a name or `#ordinal`.
        symbol: String,
    },
    /// A cross-process memory operation failed.
    #[error("remote memory operation failed")]
    RemoteMemory(#[source] io::Error),
    /// A remote invocation (TLS callback, entry point or export) could not be
    /// issued.
    #[error("remote call failed")]
    RemoteCallFailed(#[source] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
