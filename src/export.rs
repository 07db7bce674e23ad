use crate::memory::ProcessMemory;
use crate::pe::RemotePe;
use crate::Result;
use bytemuck::{Pod, Zeroable};

/// The export directory table of an image.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct ExportDirectory {
    /// Reserved, must be zero.
    pub characteristics: u32,
    /// Time the export data was created.
    pub time_date_stamp: u32,
    /// Major version number.
    pub major_version: u16,
    /// Minor version number.
    pub minor_version: u16,
    /// RVA of the ASCII name of the DLL.
    pub name: u32,
    /// The starting ordinal number, usually 1.
    pub base: u32,
    /// The number of entries in the export address table.
    pub number_of_functions: u32,
    /// The number of entries in the name pointer table.
    pub number_of_names: u32,
    /// RVA of the export address table.
    pub address_of_functions: u32,
    /// RVA of the name pointer table.
    pub address_of_names: u32,
    /// RVA of the ordinal table.
    pub address_of_name_ordinals: u32,
}

/// A resolved entry of a module's export table.
#[derive(Clone, Debug)]
pub struct Export {
    /// Biased export ordinal.
    pub ordinal: u32,
    /// RVA of the exported code or data, or of the forwarder string.
    pub rva: u32,
    /// The forwarder halves, when the export redirects to another module.
    pub forwarder: Option<Forwarder>,
}

/// A forwarded export, split out of its `"<module>.<target>"` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forwarder {
    /// Module half, without extension.
    pub module: String,
    /// Function half.
    pub target: ForwardTarget,
}

/// The function half of a forwarder string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardTarget {
    /// Forwarded by name.
    Name(String),
    /// Forwarded by ordinal (`#` followed by a decimal ordinal).
    Ordinal(u16),
}

impl Forwarder {
    /// Split a forwarder string into its module and target halves.
    ///
    /// Returns `None` for strings without the mandatory dot or with an
    /// unparsable `#ordinal` tail.
    pub fn parse(forwarder: &str) -> Option<Forwarder> {
        let (module, function) = forwarder.split_once('.')?;
        let target = match function.strip_prefix('#') {
            Some(ordinal) => ForwardTarget::Ordinal(ordinal.parse().ok()?),
            None => ForwardTarget::Name(function.to_string()),
        };
        Some(Forwarder {
            module: module.to_string(),
            target,
        })
    }
}

/// Export-table view over a mapped image.
///
/// Like [`RemotePe`], the view is plain data and every lookup takes the
/// process memory to read through.
#[derive(Copy, Clone)]
pub struct ExportTable {
    pe: RemotePe,
    directory: ExportDirectory,
    directory_rva: u32,
    directory_size: u32,
}

impl ExportTable {
    /// Open the export table of a mapped image; `None` when it has no
    /// export directory.
    pub fn open<M: ProcessMemory + ?Sized>(memory: &M, pe: &RemotePe) -> Result<Option<Self>> {
        let directory = pe.directories().export_table;
        if !directory.is_present() {
            return Ok(None);
        }

        let table: ExportDirectory = memory.read_pod(pe.va(directory.virtual_address))?;
        Ok(Some(ExportTable {
            pe: *pe,
            directory: table,
            directory_rva: directory.virtual_address,
            directory_size: directory.size,
        }))
    }

    /// Number of entries in the name pointer table.
    pub fn number_of_names(&self) -> u32 {
        self.directory.number_of_names
    }

    /// The starting ordinal of the export address table.
    pub fn ordinal_base(&self) -> u32 {
        self.directory.base
    }

    /// Look up an export by its biased ordinal.
    pub fn by_ordinal<M: ProcessMemory + ?Sized>(
        &self,
        memory: &M,
        ordinal: u32,
    ) -> Result<Option<Export>> {
        let Some(index) = ordinal.checked_sub(self.directory.base) else {
            return Ok(None);
        };
        if index >= self.directory.number_of_functions {
            return Ok(None);
        }

        let rva = memory.read_u32(
            self.pe.va(self.directory.address_of_functions) + u64::from(index) * 4,
        )?;
        if rva == 0 {
            return Ok(None);
        }

        // An address inside the export directory's own extent is not code:
        // it is a forwarder string.
        let forwarder = if rva >= self.directory_rva
            && rva < self.directory_rva + self.directory_size
        {
            let text = memory.read_c_string(self.pe.va(rva))?;
            Forwarder::parse(&text)
        } else {
            None
        };

        Ok(Some(Export {
            ordinal,
            rva,
            forwarder,
        }))
    }

    /// Look up an export through the linker hint: if the name pointer at
    /// index `hint` matches, resolve through the ordinal table. A mismatch
    /// (or an out-of-range or zero hint) quietly yields `None` so the caller
    /// can fall back to a plain name lookup.
    pub fn by_hint<M: ProcessMemory + ?Sized>(
        &self,
        memory: &M,
        hint: u16,
        name: &str,
    ) -> Result<Option<Export>> {
        if hint == 0 || u32::from(hint) >= self.directory.number_of_names {
            return Ok(None);
        }

        let name_rva = memory.read_u32(
            self.pe.va(self.directory.address_of_names) + u64::from(hint) * 4,
        )?;
        let candidate = memory.read_c_string(self.pe.va(name_rva))?;
        if candidate != name {
            return Ok(None);
        }

        let index = memory.read_u16(
            self.pe.va(self.directory.address_of_name_ordinals) + u64::from(hint) * 2,
        )?;
        self.by_ordinal(memory, u32::from(index) + self.directory.base)
    }

    /// Look up an export by name with a linear scan of the name pointer table.
    pub fn by_name<M: ProcessMemory + ?Sized>(
        &self,
        memory: &M,
        name: &str,
    ) -> Result<Option<Export>> {
        for index in 0..self.directory.number_of_names {
            let name_rva = memory.read_u32(
                self.pe.va(self.directory.address_of_names) + u64::from(index) * 4,
            )?;
            let candidate = memory.read_c_string(self.pe.va(name_rva))?;
            if candidate == name {
                let ordinal_index = memory.read_u16(
                    self.pe.va(self.directory.address_of_name_ordinals) + u64::from(index) * 2,
                )?;
                return self.by_ordinal(memory, u32::from(ordinal_index) + self.directory.base);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarder_splits_module_and_name() {
        let forwarder = Forwarder::parse("NTDLL.RtlCaptureContext").unwrap();
        assert_eq!(forwarder.module, "NTDLL");
        assert_eq!(
            forwarder.target,
            ForwardTarget::Name("RtlCaptureContext".to_string())
        );
    }

    #[test]
    fn forwarder_parses_ordinal_targets() {
        let forwarder = Forwarder::parse("other.#42").unwrap();
        assert_eq!(forwarder.module, "other");
        assert_eq!(forwarder.target, ForwardTarget::Ordinal(42));
    }

    #[test]
    fn forwarder_rejects_garbage() {
        assert!(Forwarder::parse("no-dot-here").is_none());
        assert!(Forwarder::parse("mod.#notanumber").is_none());
    }
}
