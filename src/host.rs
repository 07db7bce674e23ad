//! Queries against the injecting host: the shim-engine probe, the well-known
//! directories the search order consults, and the local data-only export
//! lookup used to translate an export name into an RVA.

use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Directory of the injecting executable, the default caller context for
/// explicit-path resolution.
pub fn self_directory() -> Result<PathBuf> {
    let executable = std::env::current_exe().map_err(Error::RemoteMemory)?;
    Ok(executable
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(executable))
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::ffi::OsStr;
    use std::io;
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use winapi::shared::minwindef::HMODULE;
    use winapi::um::libloaderapi::{
        FreeLibrary, GetModuleHandleW, GetProcAddress, LoadLibraryExW,
        DONT_RESOLVE_DLL_REFERENCES,
    };
    use winapi::um::sysinfoapi::{GetSystemDirectoryW, GetWindowsDirectoryW};

    fn to_wide(value: &OsStr) -> Vec<u16> {
        value.encode_wide().chain(std::iter::once(0)).collect()
    }

    /// Whether the application-compatibility shim engine is loaded in the
    /// injecting process. Shim redirection would poison the export-address
    /// lookups the invocation phase depends on.
    pub fn shim_engine_loaded() -> bool {
        let name = to_wide(OsStr::new("ShimEng.dll"));
        !unsafe { GetModuleHandleW(name.as_ptr()) }.is_null()
    }

    /// The system directory as reported by the OS.
    pub fn system_directory() -> Result<PathBuf> {
        let mut buffer = vec![0u16; 260];
        let len = unsafe { GetSystemDirectoryW(buffer.as_mut_ptr(), buffer.len() as u32) };
        if len == 0 {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }
        buffer.truncate(len as usize);
        Ok(PathBuf::from(std::ffi::OsString::from_wide(&buffer)))
    }

    /// The Windows directory as reported by the OS.
    pub fn windows_directory() -> Result<PathBuf> {
        let mut buffer = vec![0u16; 260];
        let len = unsafe { GetWindowsDirectoryW(buffer.as_mut_ptr(), buffer.len() as u32) };
        if len == 0 {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }
        buffer.truncate(len as usize);
        Ok(PathBuf::from(std::ffi::OsString::from_wide(&buffer)))
    }

    struct LoadedLibrary(HMODULE);

    impl Drop for LoadedLibrary {
        fn drop(&mut self) {
            unsafe { FreeLibrary(self.0) };
        }
    }

    /// Translate an export name of the DLL at `path` into its offset from
    /// the module base, by loading the DLL locally with
    /// `DONT_RESOLVE_DLL_REFERENCES` and asking `GetProcAddress`.
    ///
    /// Known weakness: if the export is itself a forwarder, the local VA
    /// lives in a different module and the returned delta is meaningless.
    pub fn local_export_delta(path: &Path, export: &str) -> Result<i64> {
        let wide_path = to_wide(path.as_os_str());
        let module = unsafe {
            LoadLibraryExW(wide_path.as_ptr(), std::ptr::null_mut(), DONT_RESOLVE_DLL_REFERENCES)
        };
        if module.is_null() {
            return Err(Error::ModuleNotFound(path.display().to_string()));
        }
        let module = LoadedLibrary(module);

        let name = std::ffi::CString::new(export).map_err(|_| {
            Error::UnresolvedImport {
                module: path.display().to_string(),
                symbol: export.to_string(),
            }
        })?;
        let Some(function) = (unsafe { GetProcAddress(module.0, name.as_ptr()) }) else {
            return Err(Error::UnresolvedImport {
                module: path.display().to_string(),
                symbol: export.to_string(),
            });
        };

        Ok(function as usize as i64 - module.0 as usize as i64)
    }
}

#[cfg(not(windows))]
mod imp {
    use super::*;
    use crate::export::ExportDirectory;
    use crate::pe::PeImage;
    use bytemuck::pod_read_unaligned;

    /// No shim engine exists off Windows.
    pub fn shim_engine_loaded() -> bool {
        false
    }

    /// Portable stand-in for the Win32 data-only load: the export table is
    /// read straight out of the file. Forwarded exports cannot be chased
    /// here and are reported unresolved.
    pub fn local_export_delta(path: &Path, export: &str) -> Result<i64> {
        let unresolved = || Error::UnresolvedImport {
            module: path.display().to_string(),
            symbol: export.to_string(),
        };

        let binary = std::fs::read(path)
            .map_err(|_| Error::ModuleNotFound(path.display().to_string()))?;
        let image = PeImage::parse(&binary)?;

        let directory = image.optional.data_directories().export_table;
        if !directory.is_present() {
            return Err(unresolved());
        }

        let read_u32 = |rva: u32| -> Result<u32> {
            let offset = image
                .rva_to_offset(rva)
                .ok_or(Error::BadImage("export directory outside the image"))?;
            binary
                .get(offset..offset + 4)
                .and_then(|slice| slice.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or(Error::BadImage("export directory is truncated"))
        };
        let read_string = |rva: u32| -> Result<String> {
            let offset = image
                .rva_to_offset(rva)
                .ok_or(Error::BadImage("export directory outside the image"))?;
            let tail = binary
                .get(offset..)
                .ok_or(Error::BadImage("export directory is truncated"))?;
            let len = tail
                .iter()
                .position(|&byte| byte == 0)
                .ok_or(Error::BadImage("unterminated string in image"))?;
            Ok(tail[..len].iter().map(|&byte| byte as char).collect())
        };

        let table_offset = image
            .rva_to_offset(directory.virtual_address)
            .ok_or(Error::BadImage("export directory outside the image"))?;
        let table_slice = binary
            .get(table_offset..table_offset + core::mem::size_of::<ExportDirectory>())
            .ok_or(Error::BadImage("export directory is truncated"))?;
        let table: ExportDirectory = pod_read_unaligned(table_slice);

        for index in 0..table.number_of_names {
            let name_rva = read_u32(table.address_of_names + index * 4)?;
            if read_string(name_rva)? != export {
                continue;
            }

            let ordinal_offset = image
                .rva_to_offset(table.address_of_name_ordinals + index * 2)
                .ok_or(Error::BadImage("export directory outside the image"))?;
            let ordinal_index = binary
                .get(ordinal_offset..ordinal_offset + 2)
                .and_then(|slice| slice.try_into().ok())
                .map(u16::from_le_bytes)
                .ok_or(Error::BadImage("export directory is truncated"))?;

            let rva = read_u32(table.address_of_functions + u32::from(ordinal_index) * 4)?;
            let is_forwarder = rva >= directory.virtual_address
                && rva < directory.virtual_address + directory.size;
            if is_forwarder {
                return Err(unresolved());
            }
            return Ok(i64::from(rva));
        }

        Err(unresolved())
    }
}

pub use imp::*;
