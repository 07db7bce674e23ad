//! In-memory stand-in for the target process: a handful of growable regions,
//! a call log, and a module list, behind the same contracts the Win32
//! implementation fulfils.

pub mod builder;

use pe_mapper::memory::{CallConv, PageProtection, ProcessMemory, RemoteCall};
use pe_mapper::modules::{ModuleInfo, ModuleList};
use pe_mapper::{Error, Result};
use std::cell::{Cell, RefCell};
use std::io;
use std::path::PathBuf;

struct Region {
    base: u64,
    data: Vec<u8>,
}

pub struct MockProcess {
    id: u32,
    regions: RefCell<Vec<Region>>,
    next_base: Cell<u64>,
    allocations: Cell<usize>,
    pub calls: RefCell<Vec<(u64, Vec<u64>)>>,
    pub protections: RefCell<Vec<(u64, usize, PageProtection)>>,
    modules: RefCell<Vec<ModuleInfo>>,
}

impl MockProcess {
    pub fn new() -> Self {
        MockProcess {
            id: 0x1234,
            regions: RefCell::new(Vec::new()),
            next_base: Cell::new(0x7000_0000),
            allocations: Cell::new(0),
            calls: RefCell::new(Vec::new()),
            protections: RefCell::new(Vec::new()),
            modules: RefCell::new(Vec::new()),
        }
    }

    /// Pretend `mapped` is a module the target already has loaded, the way
    /// the OS loader would have laid it out.
    pub fn preload_module(&self, name: &str, path: &str, mapped: Vec<u8>) -> u64 {
        let base = self.next_base.get();
        self.next_base.set(base + grow(mapped.len()));
        self.regions.borrow_mut().push(Region {
            base,
            data: mapped,
        });
        self.modules.borrow_mut().push(ModuleInfo {
            base,
            name: name.to_string(),
            path: PathBuf::from(path),
        });
        base
    }

    /// Remote allocations performed by the code under test (preloaded
    /// modules are not counted).
    pub fn allocation_count(&self) -> usize {
        self.allocations.get()
    }

    fn out_of_range() -> Error {
        Error::RemoteMemory(io::Error::new(
            io::ErrorKind::InvalidInput,
            "address range is not mapped in the target",
        ))
    }
}

fn grow(size: usize) -> u64 {
    ((size as u64).div_ceil(0x10000) + 1) * 0x10000
}

impl ProcessMemory for MockProcess {
    fn alloc(&self, size: usize) -> Result<u64> {
        let base = self.next_base.get();
        self.next_base.set(base + grow(size));
        self.allocations.set(self.allocations.get() + 1);
        self.regions.borrow_mut().push(Region {
            base,
            data: vec![0; size],
        });
        Ok(base)
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let regions = self.regions.borrow();
        for region in regions.iter() {
            if address >= region.base && address + buf.len() as u64 <= region.base + region.data.len() as u64 {
                let offset = (address - region.base) as usize;
                buf.copy_from_slice(&region.data[offset..offset + buf.len()]);
                return Ok(());
            }
        }
        Err(Self::out_of_range())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut regions = self.regions.borrow_mut();
        for region in regions.iter_mut() {
            if address >= region.base && address + data.len() as u64 <= region.base + region.data.len() as u64 {
                let offset = (address - region.base) as usize;
                region.data[offset..offset + data.len()].copy_from_slice(data);
                return Ok(());
            }
        }
        Err(Self::out_of_range())
    }

    fn protect(
        &self,
        address: u64,
        size: usize,
        protection: PageProtection,
    ) -> Result<PageProtection> {
        self.protections.borrow_mut().push((address, size, protection));
        Ok(PageProtection::ReadWrite)
    }

    fn call(&self, address: u64, _convention: CallConv, args: &[u64]) -> Result<RemoteCall> {
        self.calls.borrow_mut().push((address, args.to_vec()));
        Ok(RemoteCall {
            return_value: 0,
            last_error: 0,
        })
    }

    fn process_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/target/app.exe"))
    }
}

impl ModuleList for MockProcess {
    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        Ok(self.modules.borrow().clone())
    }
}

impl PartialEq for MockProcess {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
