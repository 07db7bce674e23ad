use crate::memory::ProcessMemory;
use crate::pe::RemotePe;
use crate::{Error, Result};
use bytemuck::{Pod, Zeroable};
use core::fmt;

/// One entry of the import directory, describing everything imported from a
/// single DLL.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct ImportDescriptor {
    /// RVA of the import lookup table naming what gets imported.
    /// Also known as `Characteristics`.
    pub original_first_thunk: u32,
    /// Zero until the image is bound.
    pub time_date_stamp: u32,
    /// Index of the first forwarder reference, or -1.
    pub forwarder_chain: u32,
    /// RVA of the NUL-terminated ASCII name of the imported DLL.
    pub name: u32,
    /// RVA of the import address table that gets patched in memory.
    pub first_thunk: u32,
}

impl ImportDescriptor {
    /// The directory is terminated by an all-zero descriptor.
    pub fn is_terminator(&self) -> bool {
        self.original_first_thunk == 0 && self.name == 0 && self.first_thunk == 0
    }

    /// RVA of the thunk array naming what gets imported.
    ///
    /// Images without a separate import lookup table describe their imports
    /// in the address table itself, like the system loader assumes.
    pub fn lookup_thunks(&self) -> u32 {
        if self.original_first_thunk != 0 {
            self.original_first_thunk
        } else {
            self.first_thunk
        }
    }
}

/// One entry of an import thunk array: what the image wants linked.
#[derive(Clone, Debug)]
pub enum ImportThunk {
    /// Import by export ordinal.
    Ordinal(u16),
    /// Import by name, with the linker's guess at the name-table index.
    Named {
        /// Index into the exporter's name-pointer table that *may* hold the name.
        hint: u16,
        /// The imported symbol name.
        name: String,
    },
}

impl fmt::Display for ImportThunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportThunk::Ordinal(ordinal) => write!(f, "#{ordinal}"),
            ImportThunk::Named { name, .. } => f.write_str(name),
        }
    }
}

/// Read the import directory of a mapped image.
///
/// Returns an empty list when the image imports nothing.
pub fn read_import_descriptors<M: ProcessMemory + ?Sized>(
    memory: &M,
    pe: &RemotePe,
) -> Result<Vec<ImportDescriptor>> {
    // A descriptor count past this means the directory never terminated.
    const MAX_DESCRIPTORS: usize = 4096;

    let directory = pe.directories().import_table;
    if !directory.is_present() {
        return Ok(Vec::new());
    }

    let entry_size = core::mem::size_of::<ImportDescriptor>() as u64;
    let mut descriptors = Vec::new();
    loop {
        let address = pe.va(directory.virtual_address) + descriptors.len() as u64 * entry_size;
        let descriptor: ImportDescriptor = memory.read_pod(address)?;
        if descriptor.is_terminator() {
            return Ok(descriptors);
        }
        descriptors.push(descriptor);
        if descriptors.len() > MAX_DESCRIPTORS {
            return Err(Error::BadImage("unterminated import directory"));
        }
    }
}

/// Read a zero-terminated thunk array out of a mapped image.
///
/// The width of each entry follows the image: 64-bit images carry 64-bit
/// thunks with the ordinal flag in bit 63, 32-bit images carry 32-bit thunks
/// with the flag in bit 31.
pub fn read_thunks<M: ProcessMemory + ?Sized>(
    memory: &M,
    pe: &RemotePe,
    thunk_rva: u32,
) -> Result<Vec<ImportThunk>> {
    const MAX_THUNKS: usize = 65536;

    let width: u64 = if pe.is_64_bit() { 8 } else { 4 };
    let ordinal_flag: u64 = if pe.is_64_bit() { 1 << 63 } else { 1 << 31 };

    let mut thunks = Vec::new();
    loop {
        let address = pe.va(thunk_rva) + thunks.len() as u64 * width;
        let value = if pe.is_64_bit() {
            memory.read_u64(address)?
        } else {
            u64::from(memory.read_u32(address)?)
        };
        if value == 0 {
            return Ok(thunks);
        }

        if value & ordinal_flag != 0 {
            thunks.push(ImportThunk::Ordinal(value as u16));
        } else {
            // The thunk points at an IMAGE_IMPORT_BY_NAME: hint, then name.
            let by_name = pe.va(value as u32);
            let hint = memory.read_u16(by_name)?;
            let name = memory.read_c_string(by_name + 2)?;
            thunks.push(ImportThunk::Named { hint, name });
        }

        if thunks.len() > MAX_THUNKS {
            return Err(Error::BadImage("unterminated import thunk array"));
        }
    }
}
