use crate::export::{Export, ExportTable, ForwardTarget};
use crate::import::{read_import_descriptors, read_thunks, ImportThunk};
use crate::memory::{CallConv, ProcessMemory};
use crate::modules::ModuleList;
use crate::pe::{PeImage, RemotePe};
use crate::resolve::{cache_key, SearchOrder};
use crate::{host, reloc, tls, Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const DLL_PROCESS_ATTACH: u64 = 1;

/// Manually maps DLLs into one target process.
///
/// A `Mapper` owns the mapped-module cache: an ordered mapping from
/// normalized absolute path to remote base address, the single source of
/// truth for "has this DLL been mapped yet in this session". The cache is
/// written *before* a module's dependencies are walked, which is what makes
/// cyclic import graphs terminate.
///
/// A `Mapper` is not safe to share across threads, and two mappers bound to
/// the same target must not run concurrently: the engine assumes exclusive
/// ownership of the target's address-space layout during a mapping.
pub struct Mapper<M: ProcessMemory + ModuleList> {
    memory: M,
    search: SearchOrder,
    mapped: BTreeMap<String, u64>,
}

enum MapOutcome {
    Mapped {
        base: u64,
        resolved: PathBuf,
        tls_callbacks: Vec<u32>,
        entry_point: u32,
    },
    AlreadyMapped {
        base: u64,
        resolved: PathBuf,
    },
}

impl<M: ProcessMemory + ModuleList> Mapper<M> {
    /// Create a mapper bound to a target process, with the search order the
    /// target itself would use.
    #[cfg(windows)]
    pub fn new(memory: M) -> Result<Self> {
        let search = SearchOrder::for_process(&memory)?;
        Ok(Self::with_search_order(memory, search))
    }

    /// Create a mapper with an explicit search order.
    pub fn with_search_order(memory: M, search: SearchOrder) -> Self {
        Mapper {
            memory,
            search,
            mapped: BTreeMap::new(),
        }
    }

    /// The memory manager this mapper is bound to.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// The modules mapped so far in this session, keyed by normalized path.
    pub fn mapped_modules(&self) -> impl Iterator<Item = (&str, u64)> {
        self.mapped.iter().map(|(key, &base)| (key.as_str(), base))
    }

    /// Manually map `path` and everything it imports into the target,
    /// returning the remote base address of the image.
    ///
    /// `parent` is the caller-context directory relative names are resolved
    /// against (the injecting executable's own directory when `None`).
    /// When `export` is given, that export of the mapped DLL is invoked in
    /// the target after the entry point, with the remote base as its only
    /// argument.
    ///
    /// Any error after the remote allocation leaves a half-mapped image in
    /// the target and its base in the cache; the target should be considered
    /// unrecoverable at that point.
    pub fn inject_dll(
        &mut self,
        path: &Path,
        parent: Option<&Path>,
        export: Option<&str>,
    ) -> Result<u64> {
        debug!("inject requested for {}", path.display());

        let caller_dir = match parent {
            Some(dir) => dir.to_path_buf(),
            None => host::self_directory()?,
        };

        // Retry applies only to failures from resolution or validation; a
        // grown cache means the image was already registered and the error
        // struck mid-layout, which no retry can undo.
        let before = self.mapped.len();
        let outcome = match self.map_image(path, &caller_dir, false) {
            Err(Error::ModuleNotFound(_) | Error::BadImage(_)) if self.mapped.len() == before => {
                debug!(
                    "explicit-path attempt for {} failed, retrying with search order",
                    path.display()
                );
                self.map_image(path, &caller_dir, true)?
            }
            other => other?,
        };

        match outcome {
            MapOutcome::Mapped {
                base,
                resolved,
                tls_callbacks,
                entry_point,
            } => {
                self.run_initializers(base, &tls_callbacks, entry_point)?;
                if let Some(export) = export {
                    self.run_export(&resolved, base, export)?;
                }
                debug!("{} mapped at {base:#x}", resolved.display());
                Ok(base)
            }
            MapOutcome::AlreadyMapped { base, resolved } => {
                if let Some(export) = export {
                    self.run_export(&resolved, base, export)?;
                }
                Ok(base)
            }
        }
    }

    /// Resolve, read, lay out and link one image. Initializers are left to
    /// the caller so dependencies run theirs before their importer's.
    fn map_image(
        &mut self,
        name: &Path,
        caller_dir: &Path,
        use_search_order: bool,
    ) -> Result<MapOutcome> {
        let resolved = self.search.resolve(name, use_search_order, caller_dir)?;
        let key = cache_key(&resolved);
        if let Some(&base) = self.mapped.get(&key) {
            debug!("{} already mapped in this session", resolved.display());
            return Ok(MapOutcome::AlreadyMapped { base, resolved });
        }

        debug!("reading {}", resolved.display());
        let mut scratch = fs::read(&resolved)
            .map_err(|_| Error::ModuleNotFound(resolved.display().to_string()))?;
        let image = PeImage::parse(&scratch)?;

        if host::shim_engine_loaded() {
            return Err(Error::ShimsEnabled);
        }

        // Only architecture-matching images are ever loaded, and the check
        // runs before the remote allocation so a rejected image leaks
        // nothing.
        let host_is_64 = core::mem::size_of::<usize>() == 8;
        let machine = image
            .coff
            .get_machine()
            .ok_or(Error::BadImage("unsupported machine type"))?;
        if image.is_64_bit() != host_is_64 || machine.is_64_bit() != host_is_64 {
            return Err(Error::BadImage(
                "image architecture does not match the injecting process",
            ));
        }

        let size_of_image = image.optional.size_of_image() as usize;
        let remote_base = self.memory.alloc(size_of_image)?;
        debug!("allocated {size_of_image:#x} bytes at {remote_base:#x}");

        // Register before walking dependencies; a cyclic import resolves to
        // this in-progress image through the cache.
        self.mapped.insert(key, remote_base);

        let tls_callbacks = tls::callback_rvas(&scratch, &image)?;

        trace!("writing headers");
        self.memory.write(remote_base, &scratch[image.dos_extent()])?;
        self.memory.write(
            remote_base + image.nt_offset() as u64,
            &scratch[image.nt_extent()],
        )?;

        reloc::apply_relocations(&mut scratch, &image, remote_base)?;

        for section in &image.sections {
            if section.virtual_address == 0 || section.size_of_raw_data == 0 {
                continue;
            }
            let start = section.pointer_to_raw_data as usize;
            let data = scratch
                .get(start..start + section.size_of_raw_data as usize)
                .ok_or(Error::BadImage("section data outside the file"))?;
            trace!(
                "mapping section {} at rva {:#x}",
                section.get_name().unwrap_or_default(),
                section.virtual_address
            );
            self.memory
                .write(remote_base + u64::from(section.virtual_address), data)?;
        }

        for section in &image.sections {
            if section.virtual_address == 0 || section.virtual_size == 0 {
                continue;
            }
            let protection = section.protection();
            trace!(
                "protecting section {} as {protection:?}",
                section.get_name().unwrap_or_default()
            );
            self.memory.protect(
                remote_base + u64::from(section.virtual_address),
                section.virtual_size as usize,
                protection,
            )?;
        }

        // Imports are linked through the remote image: in a cyclic graph a
        // dependency's export table may exist nowhere else yet.
        let importer_dir = resolved.parent().map(Path::to_path_buf).unwrap_or_default();
        self.fix_imports(remote_base, &importer_dir)?;

        Ok(MapOutcome::Mapped {
            base: remote_base,
            resolved,
            tls_callbacks,
            entry_point: image.optional.address_of_entry_point(),
        })
    }

    fn fix_imports(&mut self, base: u64, importer_dir: &Path) -> Result<()> {
        let pe = RemotePe::open(&self.memory, base)?;
        let descriptors = read_import_descriptors(&self.memory, &pe)?;
        if descriptors.is_empty() {
            debug!("image has no imports");
            return Ok(());
        }

        for descriptor in descriptors {
            let module_name = self
                .memory
                .read_c_string(pe.va(descriptor.name))?
                .to_lowercase();
            debug!("linking imports from {module_name}");

            let dependency_base = self.dependency_base(&module_name, importer_dir)?;
            let dependency = RemotePe::open(&self.memory, dependency_base)?;
            let exports = ExportTable::open(&self.memory, &dependency)?;

            let thunks = read_thunks(&self.memory, &pe, descriptor.lookup_thunks())?;
            let width: u64 = if pe.is_64_bit() { 8 } else { 4 };

            for (index, thunk) in thunks.iter().enumerate() {
                let unresolved = || Error::UnresolvedImport {
                    module: module_name.clone(),
                    symbol: thunk.to_string(),
                };

                let table = exports.as_ref().ok_or_else(unresolved)?;
                let export = match thunk {
                    ImportThunk::Ordinal(ordinal) => {
                        table.by_ordinal(&self.memory, u32::from(*ordinal))?
                    }
                    ImportThunk::Named { hint, name } => {
                        let mut found = table.by_hint(&self.memory, *hint, name)?;
                        if found.is_none() {
                            found = table.by_name(&self.memory, name)?;
                        }
                        found
                    }
                }
                .ok_or_else(unresolved)?;

                let address = self.resolve_export(dependency_base, export)?;

                // Positional correspondence: the address table mirrors the
                // lookup table index for index.
                let slot = pe.va(descriptor.first_thunk) + index as u64 * width;
                trace!("patching IAT slot {slot:#x} -> {address:#x} ({module_name}!{thunk})");
                if pe.is_64_bit() {
                    self.memory.write_u64(slot, address)?;
                } else {
                    self.memory.write_u32(slot, address as u32)?;
                }
            }
        }

        Ok(())
    }

    /// Remote base of an imported module: the cache if it is already mapped,
    /// the target's own `ntdll`, or a recursive mapping.
    fn dependency_base(&mut self, module_name: &str, importer_dir: &Path) -> Result<u64> {
        // Search-order resolution just for the cache probe; a miss is fine,
        // the recursive mapping below resolves for real.
        if let Ok(resolved) = self
            .search
            .resolve(Path::new(module_name), true, importer_dir)
        {
            if let Some(&base) = self.mapped.get(&cache_key(&resolved)) {
                debug!("dependency {module_name} already mapped at {base:#x}");
                return Ok(base);
            }
        }

        // ntdll is never manually mapped: it only works when bootstrapped
        // through LdrInitializeThunk, and doing that to a second copy makes
        // the target initialize everything twice. The copy already in the
        // target is used instead.
        if module_name == "ntdll.dll" {
            let module = self
                .memory
                .module_by_name("ntdll.dll")?
                .ok_or_else(|| Error::ModuleNotFound("ntdll.dll".to_string()))?;
            return Ok(module.base);
        }

        debug!("manually mapping dependency {module_name}");
        self.inject_dll(Path::new(module_name), Some(importer_dir), None)
    }

    /// Final remote address of an export, chasing forwarders transitively.
    ///
    /// Forwarder targets are looked up in the cache (or the target's own
    /// `ntdll`), never mapped here: an unseen module would have been mapped
    /// through the normal import path first.
    fn resolve_export(&self, owner_base: u64, export: Export) -> Result<u64> {
        let Some(forwarder) = export.forwarder else {
            return Ok(owner_base + u64::from(export.rva));
        };

        let mut module = forwarder.module.to_lowercase();
        if !module.contains('.') {
            module.push_str(".dll");
        }
        let symbol = match &forwarder.target {
            ForwardTarget::Name(name) => name.clone(),
            ForwardTarget::Ordinal(ordinal) => format!("#{ordinal}"),
        };
        debug!("chasing forwarded export {module}!{symbol}");

        let unresolved = || Error::UnresolvedImport {
            module: module.clone(),
            symbol: symbol.clone(),
        };

        let target_base = if module == "ntdll.dll" {
            self.memory
                .module_by_name("ntdll.dll")?
                .ok_or_else(|| Error::ModuleNotFound("ntdll.dll".to_string()))?
                .base
        } else {
            let resolved = self
                .search
                .resolve(Path::new(&module), true, Path::new(""))
                .map_err(|_| unresolved())?;
            *self.mapped.get(&cache_key(&resolved)).ok_or_else(unresolved)?
        };

        let pe = RemotePe::open(&self.memory, target_base)?;
        let table = ExportTable::open(&self.memory, &pe)?.ok_or_else(unresolved)?;
        let next = match forwarder.target {
            ForwardTarget::Ordinal(ordinal) => table.by_ordinal(&self.memory, u32::from(ordinal))?,
            ForwardTarget::Name(name) => table.by_name(&self.memory, &name)?,
        }
        .ok_or_else(unresolved)?;

        self.resolve_export(target_base, next)
    }

    /// Run the image's TLS callbacks and entry point in the target, each with
    /// the standard loader argument triple.
    fn run_initializers(&self, base: u64, tls_callbacks: &[u32], entry_point: u32) -> Result<()> {
        for &rva in tls_callbacks {
            let address = base + u64::from(rva);
            debug!("invoking TLS callback at {address:#x}");
            let result = self.memory.call(
                address,
                CallConv::Default,
                &[base, DLL_PROCESS_ATTACH, 0],
            )?;
            debug!("TLS callback returned {:#x}", result.return_value);
        }

        if entry_point != 0 {
            let address = base + u64::from(entry_point);
            debug!("invoking entry point at {address:#x}");
            let result = self.memory.call(
                address,
                CallConv::Default,
                &[base, DLL_PROCESS_ATTACH, 0],
            )?;
            debug!("entry point returned {:#x}", result.return_value);
        }

        Ok(())
    }

    /// Invoke a named export of the freshly mapped DLL in the target, with
    /// the remote base as its only argument.
    ///
    /// The export name is translated to an offset through a local data-only
    /// load of the same file, so a forwarded top-level export will not
    /// resolve correctly.
    fn run_export(&self, path: &Path, base: u64, export: &str) -> Result<()> {
        let delta = host::local_export_delta(path, export)?;
        let address = base.wrapping_add(delta as u64);
        debug!("invoking export {export} at {address:#x}");
        let result = self.memory.call(address, CallConv::Default, &[base])?;
        debug!("export returned {:#x}", result.return_value);
        Ok(())
    }
}

impl<M: ProcessMemory + ModuleList + PartialEq> PartialEq for Mapper<M> {
    /// Two mappers are equal iff they target the same process.
    fn eq(&self, other: &Self) -> bool {
        self.memory == other.memory
    }
}
