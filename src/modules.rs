use crate::Result;
use std::path::PathBuf;

/// A module already loaded in the target process.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    /// Base address of the module in the target.
    pub base: u64,
    /// File name of the module, e.g. `ntdll.dll`.
    pub name: String,
    /// On-disk path the module was loaded from.
    pub path: PathBuf,
}

/// Enumeration of the modules the target process already has loaded.
///
/// The mapper needs this for exactly one thing: finding the target's own
/// `ntdll.dll`, which is never manually mapped (see the import linker).
pub trait ModuleList {
    /// Snapshot of the modules currently loaded in the target.
    fn modules(&self) -> Result<Vec<ModuleInfo>>;

    /// Case-insensitive lookup of a module by file name.
    fn module_by_name(&self, name: &str) -> Result<Option<ModuleInfo>> {
        Ok(self
            .modules()?
            .into_iter()
            .find(|module| module.name.eq_ignore_ascii_case(name)))
    }
}
