use crate::memory::{CallConv, PageProtection, ProcessMemory, RemoteCall};
use crate::modules::{ModuleInfo, ModuleList};
use crate::{Error, Result};
use std::ffi::OsString;
use std::io;
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;
use std::ptr;
use winapi::ctypes::c_void;
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{
    ReadProcessMemory, VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, WriteProcessMemory,
};
use winapi::um::processthreadsapi::{CreateRemoteThread, FlushInstructionCache, OpenProcess};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
    TH32CS_SNAPMODULE32,
};
use winapi::um::winbase::{QueryFullProcessImageNameW, INFINITE};
use winapi::um::winnt::{
    HANDLE, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    PAGE_WRITECOPY, PROCESS_ALL_ACCESS,
};

struct Handle(HANDLE);

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0) };
    }
}

/// A target process opened through the Win32 debug APIs.
///
/// Implements both collaborator contracts the mapper consumes:
/// [`ProcessMemory`] over `VirtualAllocEx`/`ReadProcessMemory`/
/// `WriteProcessMemory`/`VirtualProtectEx` plus a `CreateRemoteThread` call
/// stub, and [`ModuleList`] over a Toolhelp32 module snapshot.
pub struct WindowsProcess {
    handle: Handle,
    pid: u32,
}

impl WindowsProcess {
    /// Open the process with the given id for injection.
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, FALSE, pid) };
        if handle.is_null() {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }
        Ok(WindowsProcess {
            handle: Handle(handle),
            pid,
        })
    }

    /// The target's process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl PartialEq for WindowsProcess {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

fn protection_to_win32(protection: PageProtection) -> DWORD {
    match protection {
        PageProtection::NoAccess => PAGE_NOACCESS,
        PageProtection::ReadOnly => PAGE_READONLY,
        PageProtection::ReadWrite => PAGE_READWRITE,
        PageProtection::Execute => PAGE_EXECUTE,
        PageProtection::ExecuteRead => PAGE_EXECUTE_READ,
        PageProtection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
    }
}

fn protection_from_win32(value: DWORD) -> PageProtection {
    match value {
        PAGE_NOACCESS => PageProtection::NoAccess,
        PAGE_READONLY => PageProtection::ReadOnly,
        PAGE_READWRITE | PAGE_WRITECOPY => PageProtection::ReadWrite,
        PAGE_EXECUTE => PageProtection::Execute,
        PAGE_EXECUTE_READ => PageProtection::ExecuteRead,
        PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => PageProtection::ExecuteReadWrite,
        _ => PageProtection::NoAccess,
    }
}

impl ProcessMemory for WindowsProcess {
    fn alloc(&self, size: usize) -> Result<u64> {
        let base = unsafe {
            VirtualAllocEx(
                self.handle.0,
                ptr::null_mut(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if base.is_null() {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }
        Ok(base as u64)
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let ok = unsafe {
            ReadProcessMemory(
                self.handle.0,
                address as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        // The IAT and headers may already sit behind read-only pages; make
        // the range writable for the duration of the write, like the system
        // loader's own patching path.
        let mut previous = 0;
        let protected = unsafe {
            VirtualProtectEx(
                self.handle.0,
                address as *mut c_void,
                data.len(),
                PAGE_EXECUTE_READWRITE,
                &mut previous,
            )
        } != 0;

        let ok = unsafe {
            WriteProcessMemory(
                self.handle.0,
                address as *mut c_void,
                data.as_ptr().cast(),
                data.len(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }

        if protected {
            unsafe {
                VirtualProtectEx(
                    self.handle.0,
                    address as *mut c_void,
                    data.len(),
                    previous,
                    &mut previous,
                );
            }
        }
        unsafe {
            FlushInstructionCache(self.handle.0, address as *const c_void, data.len());
        }
        Ok(())
    }

    fn protect(
        &self,
        address: u64,
        size: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        let mut previous = 0;
        let ok = unsafe {
            VirtualProtectEx(
                self.handle.0,
                address as *mut c_void,
                size,
                protection_to_win32(protection),
                &mut previous,
            )
        };
        if ok == 0 {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }
        Ok(protection_from_win32(previous))
    }

    fn call(&self, address: u64, convention: CallConv, args: &[u64]) -> Result<RemoteCall> {
        let failed = |error: io::Error| Error::RemoteCallFailed(error);

        if args.len() > 4 {
            return Err(failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "remote calls take at most four arguments",
            )));
        }

        // Block layout: result value, last error, padding, then the stub.
        let stub = build_call_stub(address, convention, args, 0);
        let block = self.alloc(16 + stub.len())?;
        let stub = build_call_stub(address, convention, args, block);
        self.write(block + 16, &stub)?;
        self.protect(block, 16 + stub.len(), PageProtection::ExecuteReadWrite)?;

        let thread = unsafe {
            CreateRemoteThread(
                self.handle.0,
                ptr::null_mut(),
                0,
                Some(std::mem::transmute::<
                    usize,
                    unsafe extern "system" fn(*mut c_void) -> u32,
                >((block + 16) as usize)),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
            )
        };
        if thread.is_null() {
            return Err(failed(io::Error::last_os_error()));
        }
        let thread = Handle(thread);

        unsafe { WaitForSingleObject(thread.0, INFINITE) };

        let return_value = self.read_u64(block)?;
        let last_error = self.read_u32(block + 8)?;

        unsafe { VirtualFreeEx(self.handle.0, block as *mut c_void, 0, MEM_RELEASE) };

        Ok(RemoteCall {
            return_value,
            last_error,
        })
    }

    fn process_path(&self) -> Result<PathBuf> {
        let mut buffer = vec![0u16; 1024];
        let mut len = buffer.len() as u32;
        let ok = unsafe {
            QueryFullProcessImageNameW(self.handle.0, 0, buffer.as_mut_ptr(), &mut len)
        };
        if ok == 0 {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }
        buffer.truncate(len as usize);
        Ok(PathBuf::from(OsString::from_wide(&buffer)))
    }
}

impl ModuleList for WindowsProcess {
    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        let snapshot = unsafe {
            CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid)
        };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(Error::RemoteMemory(io::Error::last_os_error()));
        }
        let snapshot = Handle(snapshot);

        let mut entry: MODULEENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = std::mem::size_of::<MODULEENTRY32W>() as u32;

        let mut modules = Vec::new();
        let mut more = unsafe { Module32FirstW(snapshot.0, &mut entry) } != 0;
        while more {
            modules.push(ModuleInfo {
                base: entry.modBaseAddr as u64,
                name: wide_to_string(&entry.szModule),
                path: PathBuf::from(OsString::from_wide(trim_nul(&entry.szExePath))),
            });
            more = unsafe { Module32NextW(snapshot.0, &mut entry) } != 0;
        }

        Ok(modules)
    }
}

fn trim_nul(value: &[u16]) -> &[u16] {
    let len = value.iter().position(|&unit| unit == 0).unwrap_or(value.len());
    &value[..len]
}

fn wide_to_string(value: &[u16]) -> String {
    String::from_utf16_lossy(trim_nul(value))
}

/// Assemble the thread stub for one remote invocation: load the arguments,
/// call the target, store the return value and the thread's last-error into
/// the result block, and return cleanly.
#[cfg(target_arch = "x86_64")]
fn build_call_stub(address: u64, _convention: CallConv, args: &[u64], result_block: u64) -> Vec<u8> {
    let argument = |index: usize| args.get(index).copied().unwrap_or(0);

    let mut stub = Vec::with_capacity(80);
    // Thread entry leaves rsp 8 off a 16-byte boundary; reserve shadow
    // space and realign in one go.
    stub.extend_from_slice(&[0x48, 0x83, 0xec, 0x28]); // sub rsp, 0x28
    stub.extend_from_slice(&[0x48, 0xb9]); // mov rcx, arg0
    stub.extend_from_slice(&argument(0).to_le_bytes());
    stub.extend_from_slice(&[0x48, 0xba]); // mov rdx, arg1
    stub.extend_from_slice(&argument(1).to_le_bytes());
    stub.extend_from_slice(&[0x49, 0xb8]); // mov r8, arg2
    stub.extend_from_slice(&argument(2).to_le_bytes());
    stub.extend_from_slice(&[0x49, 0xb9]); // mov r9, arg3
    stub.extend_from_slice(&argument(3).to_le_bytes());
    stub.extend_from_slice(&[0x48, 0xb8]); // mov rax, target
    stub.extend_from_slice(&address.to_le_bytes());
    stub.extend_from_slice(&[0xff, 0xd0]); // call rax
    stub.extend_from_slice(&[0x49, 0xba]); // mov r10, result_block
    stub.extend_from_slice(&result_block.to_le_bytes());
    stub.extend_from_slice(&[0x49, 0x89, 0x02]); // mov [r10], rax
    // TEB LastErrorValue lives at gs:[0x68].
    stub.extend_from_slice(&[0x65, 0x8b, 0x04, 0x25, 0x68, 0x00, 0x00, 0x00]);
    stub.extend_from_slice(&[0x41, 0x89, 0x42, 0x08]); // mov [r10+8], eax
    stub.extend_from_slice(&[0x48, 0x83, 0xc4, 0x28]); // add rsp, 0x28
    stub.extend_from_slice(&[0x31, 0xc0]); // xor eax, eax
    stub.push(0xc3); // ret
    stub
}

#[cfg(target_arch = "x86")]
fn build_call_stub(address: u64, convention: CallConv, args: &[u64], result_block: u64) -> Vec<u8> {
    let mut stub = Vec::with_capacity(48);
    for &argument in args.iter().rev() {
        stub.push(0x68); // push imm32
        stub.extend_from_slice(&(argument as u32).to_le_bytes());
    }
    stub.push(0xb8); // mov eax, target
    stub.extend_from_slice(&(address as u32).to_le_bytes());
    stub.extend_from_slice(&[0xff, 0xd0]); // call eax
    if convention == CallConv::Cdecl {
        stub.extend_from_slice(&[0x83, 0xc4, (args.len() * 4) as u8]); // add esp, n
    }
    stub.push(0xa3); // mov [result], eax
    stub.extend_from_slice(&(result_block as u32).to_le_bytes());
    // TEB LastErrorValue lives at fs:[0x34].
    stub.extend_from_slice(&[0x64, 0xa1, 0x34, 0x00, 0x00, 0x00]);
    stub.push(0xa3); // mov [result+4], eax
    stub.extend_from_slice(&((result_block + 4) as u32).to_le_bytes());
    stub.extend_from_slice(&[0x31, 0xc0]); // xor eax, eax
    stub.extend_from_slice(&[0xc2, 0x04, 0x00]); // ret 4
    stub
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
fn build_call_stub(
    _address: u64,
    _convention: CallConv,
    _args: &[u64],
    _result_block: u64,
) -> Vec<u8> {
    unimplemented!("remote calls are only supported on x86 and x64 hosts")
}
