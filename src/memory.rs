use crate::{Error, Result};
use bytemuck::AnyBitPattern;
use std::path::PathBuf;

/// Page protection applied to a region of the target process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageProtection {
    /// No access at all.
    NoAccess,
    /// Read-only.
    ReadOnly,
    /// Read and write.
    ReadWrite,
    /// Execute-only.
    Execute,
    /// Execute and read.
    ExecuteRead,
    /// Execute, read and write.
    ExecuteReadWrite,
}

/// Calling convention used for remote invocations.
///
/// On x64 targets there is only one convention and the distinction is
/// ignored; on x86 targets it decides who cleans the stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallConv {
    /// Whatever the loader ABI of the target architecture expects
    /// (`stdcall` on x86).
    #[default]
    Default,
    /// Callee-cleaned, the x86 loader ABI.
    StdCall,
    /// Caller-cleaned.
    Cdecl,
}

/// Outcome of a remote function invocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteCall {
    /// The register return value of the invoked function.
    pub return_value: u64,
    /// The target thread's last-error value after the call.
    pub last_error: u32,
}

/// Cross-process memory manager bound to one target process.
///
/// This is the contract the mapper consumes; [`crate::process::WindowsProcess`]
/// is the Win32-backed implementation and the test suite substitutes an
/// in-memory mock. Implementations of [`write`](Self::write) must succeed
/// against pages the mapper has already protected read-only (the system
/// loader patches import tables after protections are in place, and so does
/// the mapper).
pub trait ProcessMemory {
    /// Reserve and commit `size` bytes of writable memory in the target,
    /// returning the base address of the new region.
    fn alloc(&self, size: usize) -> Result<u64>;

    /// Read `buf.len()` bytes at `address` in the target.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `address` in the target.
    fn write(&self, address: u64, data: &[u8]) -> Result<()>;

    /// Change the protection of `[address, address + size)`, returning the
    /// previous protection of the first page.
    fn protect(&self, address: u64, size: usize, protection: PageProtection)
        -> Result<PageProtection>;

    /// Invoke the function at `address` in the target with the given
    /// arguments, blocking until it returns.
    fn call(&self, address: u64, convention: CallConv, args: &[u64]) -> Result<RemoteCall>;

    /// Filesystem path of the target's main executable.
    fn process_path(&self) -> Result<PathBuf>;

    /// Read a plain-old-data value at `address`.
    fn read_pod<T: AnyBitPattern>(&self, address: u64) -> Result<T> {
        let mut buf = vec![0u8; core::mem::size_of::<T>()];
        self.read(address, &mut buf)?;
        Ok(bytemuck::pod_read_unaligned(&buf))
    }

    /// Read a little-endian `u16` at `address`.
    fn read_u16(&self, address: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a little-endian `u32` at `address`.
    fn read_u32(&self, address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian `u64` at `address`.
    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a NUL-terminated ASCII string at `address`.
    fn read_c_string(&self, address: u64) -> Result<String> {
        // Import and forwarder names are short; a runaway read means the
        // image is lying about a string RVA.
        const MAX_LEN: u64 = 4096;

        let mut string = String::new();
        for index in 0..MAX_LEN {
            let mut byte = [0u8; 1];
            self.read(address + index, &mut byte)?;
            if byte[0] == 0 {
                return Ok(string);
            }
            string.push(byte[0] as char);
        }
        Err(Error::BadImage("unterminated string in image"))
    }

    /// Write a little-endian `u32` at `address`.
    fn write_u32(&self, address: u64, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Write a little-endian `u64` at `address`.
    fn write_u64(&self, address: u64, value: u64) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
}
