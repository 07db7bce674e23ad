use crate::Error;
use bytemuck::{pod_read_unaligned, Pod, Zeroable};
use core::fmt;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Magic values that determine if an Optional Header is
/// PE32 (32-bit) or PE32+ (64-bit)
#[derive(FromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u16)]
pub enum Magic {
    /// Magic value for 32-bit PEs
    PE32 = 0x10b,
    /// Magic value for 64-bit PEs
    PE64 = 0x20b,
}

/// Struct containing basic information (address and size) of each table.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DataDirectories {
    /// The export table (.edata) address and size. (Image Only)
    pub export_table: DataDirectory,
    /// The import table (.idata) address and size.
    pub import_table: DataDirectory,
    /// The resource table (.rsrc) address and size.
    pub resource_table: DataDirectory,
    /// The exception table (.pdata) address and size.
    pub exception_table: DataDirectory,
    /// The attribute certificate table address and size. (Image Only)
    pub certificate_table: DataDirectory,
    /// The base relocation table (.reloc) address and size. (Image Only)
    pub base_relocation_table: DataDirectory,
    /// The debug data (.debug) starting address and size.
    pub debug: DataDirectory,
    /// Reserved, must be 0.
    pub architecture: DataDirectory,
    /// The RVA of the value to be stored in the global pointer register.
    pub global_ptr: DataDirectory,
    /// The thread local storage (TLS) table (.tls) address and size.
    pub tls_table: DataDirectory,
    /// The load configuration table address and size. (Image Only)
    pub load_config_table: DataDirectory,
    /// The bound import table address and size.
    pub bound_import: DataDirectory,
    /// The import address table address and size.
    pub import_address_table: DataDirectory,
    /// The delay import descriptor address and size. (Image Only)
    pub delay_import_descriptor: DataDirectory,
    /// The CLR runtime header (.cormeta) address and size. (Object Only)
    pub clr_runtime_header: DataDirectory,
    /// Reserved, must be zero.
    pub reserved: DataDirectory,
}

/// Each data directory gives the address and size of a table or string that
/// Windows uses. A data directory is an 8-byte field.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DataDirectory {
    /// RVA of the table relative to the base address of the image when the table is loaded.
    pub virtual_address: u32,
    /// Size of the table in bytes.
    pub size: u32,
}

impl DataDirectory {
    /// A directory with a zero address or size is absent from the image.
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// PE32 Optional Header (Image Only)
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct OptionalHeader32 {
    /// The unsigned integer that identifies the state of the image file.
    pub magic: u16,
    /// The linker major version number.
    pub major_linker_version: u8,
    /// The linker minor version number.
    pub minor_linker_version: u8,
    /// The size of the code (text) section, or the sum of all code sections if there are multiple sections.
    pub size_of_code: u32,
    /// The size of the initialized data section, or the sum of all such sections if there are multiple data sections.
    pub size_of_initialized_data: u32,
    /// The size of the uninitialized data section (BSS), or the sum of all such sections if there are multiple BSS sections.
    pub size_of_uninitialized_data: u32,
    /// The address of the entry point relative to the image base when the
    /// executable file is loaded into memory. An entry point is optional for
    /// DLLs. When no entry point is present, this field must be zero.
    pub address_of_entry_point: u32,
    /// The address that is relative to the image base of the beginning-of-code section when it is loaded into memory.
    pub base_of_code: u32,
    /// (PE32 Only) The address that is relative to the image base of the beginning-of-data section when it is loaded into memory.
    pub base_of_data: u32,
    /// The preferred address of the first byte of image when loaded into memory; must be a multiple of 64 K.
    pub image_base: u32,
    /// The alignment (in bytes) of sections when they are loaded into memory.
    pub section_alignment: u32,
    /// The alignment factor (in bytes) that is used to align the raw data of sections in the image file.
    pub file_alignment: u32,
    /// The major version number of the required operating system.
    pub major_operating_system_version: u16,
    /// The minor version number of the required operating system.
    pub minor_operating_system_version: u16,
    /// The major version number of the image.
    pub major_image_version: u16,
    /// The minor version number of the image.
    pub minor_image_version: u16,
    /// The major version number of the subsystem.
    pub major_subsystem_version: u16,
    /// The minor version number of the subsystem.
    pub minor_subsystem_version: u16,
    /// Reserved, must be zero.
    pub win32_version_value: u32,
    /// The size (in bytes) of the image, including all headers, as the image
    /// is loaded in memory. It must be a multiple of `section_alignment`.
    pub size_of_image: u32,
    /// The combined size of an MS-DOS stub, PE header, and section headers rounded up to a multiple of `file_alignment`.
    pub size_of_headers: u32,
    /// The image file checksum.
    pub check_sum: u32,
    /// The subsystem that is required to run this image.
    pub subsystem: u16,
    /// Bitflag characteristics that describe how a DLL should be loaded.
    pub dll_characteristics: u16,
    /// The size of the stack to reserve.
    pub size_of_stack_reserve: u32,
    /// The size of the stack to commit.
    pub size_of_stack_commit: u32,
    /// The size of the local heap space to reserve.
    pub size_of_heap_reserve: u32,
    /// The size of the local heap space to commit.
    pub size_of_heap_commit: u32,
    /// Reserved, must be zero.
    pub loader_flags: u32,
    /// The number of data-directory entries in the remainder of the optional header.
    pub number_of_rva_and_sizes: u32,
    /// Struct containing basic information (address and size) of each table.
    pub data_directories: DataDirectories,
}

/// PE32+ Optional Header (Image Only)
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct OptionalHeader64 {
    /// The unsigned integer that identifies the state of the image file.
    pub magic: u16,
    /// The linker major version number.
    pub major_linker_version: u8,
    /// The linker minor version number.
    pub minor_linker_version: u8,
    /// The size of the code (text) section, or the sum of all code sections if there are multiple sections.
    pub size_of_code: u32,
    /// The size of the initialized data section, or the sum of all such sections if there are multiple data sections.
    pub size_of_initialized_data: u32,
    /// The size of the uninitialized data section (BSS), or the sum of all such sections if there are multiple BSS sections.
    pub size_of_uninitialized_data: u32,
    /// The address of the entry point relative to the image base when the
    /// executable file is loaded into memory. An entry point is optional for
    /// DLLs. When no entry point is present, this field must be zero.
    pub address_of_entry_point: u32,
    /// The address that is relative to the image base of the beginning-of-code section when it is loaded into memory.
    pub base_of_code: u32,
    /// The preferred address of the first byte of image when loaded into memory; must be a multiple of 64 K.
    pub image_base: u64,
    /// The alignment (in bytes) of sections when they are loaded into memory.
    pub section_alignment: u32,
    /// The alignment factor (in bytes) that is used to align the raw data of sections in the image file.
    pub file_alignment: u32,
    /// The major version number of the required operating system.
    pub major_operating_system_version: u16,
    /// The minor version number of the required operating system.
    pub minor_operating_system_version: u16,
    /// The major version number of the image.
    pub major_image_version: u16,
    /// The minor version number of the image.
    pub minor_image_version: u16,
    /// The major version number of the subsystem.
    pub major_subsystem_version: u16,
    /// The minor version number of the subsystem.
    pub minor_subsystem_version: u16,
    /// Reserved, must be zero.
    pub win32_version_value: u32,
    /// The size (in bytes) of the image, including all headers, as the image
    /// is loaded in memory. It must be a multiple of `section_alignment`.
    pub size_of_image: u32,
    /// The combined size of an MS-DOS stub, PE header, and section headers rounded up to a multiple of `file_alignment`.
    pub size_of_headers: u32,
    /// The image file checksum.
    pub check_sum: u32,
    /// The subsystem that is required to run this image.
    pub subsystem: u16,
    /// Bitflag characteristics that describe how a DLL should be loaded.
    pub dll_characteristics: u16,
    /// The size of the stack to reserve.
    pub size_of_stack_reserve: u64,
    /// The size of the stack to commit.
    pub size_of_stack_commit: u64,
    /// The size of the local heap space to reserve.
    pub size_of_heap_reserve: u64,
    /// The size of the local heap space to commit.
    pub size_of_heap_commit: u64,
    /// Reserved, must be zero.
    pub loader_flags: u32,
    /// The number of data-directory entries in the remainder of the optional header.
    pub number_of_rva_and_sizes: u32,
    /// Struct containing basic information (address and size) of each table.
    pub data_directories: DataDirectories,
}

/// Width-independent view over either optional header variant.
#[derive(Copy, Clone)]
pub enum OptionalHeader {
    /// PE32 Optional Header
    Pe32(OptionalHeader32),
    /// PE32+ Optional Header
    Pe64(OptionalHeader64),
}

impl OptionalHeader {
    /// Parse an optional header from a byte array at a given offset.
    ///
    /// The magic decides which variant is read; a header too short for its
    /// declared variant is rejected.
    pub fn parse(binary: &[u8], offset: usize) -> Result<Self, Error> {
        let magic_bytes: [u8; 2] = binary
            .get(offset..offset + 2)
            .and_then(|slice| slice.try_into().ok())
            .ok_or(Error::BadImage("optional header is truncated"))?;

        let magic = Magic::from_u16(u16::from_le_bytes(magic_bytes))
            .ok_or(Error::BadImage("unknown optional header magic"))?;

        match magic {
            Magic::PE32 => {
                let slice = binary
                    .get(offset..offset + core::mem::size_of::<OptionalHeader32>())
                    .ok_or(Error::BadImage("optional header is truncated"))?;
                Ok(OptionalHeader::Pe32(pod_read_unaligned(slice)))
            }
            Magic::PE64 => {
                let slice = binary
                    .get(offset..offset + core::mem::size_of::<OptionalHeader64>())
                    .ok_or(Error::BadImage("optional header is truncated"))?;
                Ok(OptionalHeader::Pe64(pod_read_unaligned(slice)))
            }
        }
    }

    /// Returns the magic of the parsed variant.
    pub fn magic(&self) -> Magic {
        match self {
            OptionalHeader::Pe32(_) => Magic::PE32,
            OptionalHeader::Pe64(_) => Magic::PE64,
        }
    }

    /// Whether the image addresses a 64-bit address space.
    pub fn is_64_bit(&self) -> bool {
        matches!(self, OptionalHeader::Pe64(_))
    }

    /// The preferred base address of the image.
    pub fn image_base(&self) -> u64 {
        match self {
            OptionalHeader::Pe32(header) => header.image_base.into(),
            OptionalHeader::Pe64(header) => header.image_base,
        }
    }

    /// The size of the image as loaded in memory.
    pub fn size_of_image(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(header) => header.size_of_image,
            OptionalHeader::Pe64(header) => header.size_of_image,
        }
    }

    /// The combined size of the headers, as laid out at the start of the image.
    pub fn size_of_headers(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(header) => header.size_of_headers,
            OptionalHeader::Pe64(header) => header.size_of_headers,
        }
    }

    /// Entry point RVA, zero when the image has none.
    pub fn address_of_entry_point(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(header) => header.address_of_entry_point,
            OptionalHeader::Pe64(header) => header.address_of_entry_point,
        }
    }

    /// The data directories of the image.
    pub fn data_directories(&self) -> &DataDirectories {
        match self {
            OptionalHeader::Pe32(header) => &header.data_directories,
            OptionalHeader::Pe64(header) => &header.data_directories,
        }
    }
}

impl fmt::Display for DataDirectories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Data Directories")?;
        writeln!(f, "----------------")?;
        writeln!(f, "Export Table:            {:#010x} ({})", self.export_table.virtual_address, self.export_table.size)?;
        writeln!(f, "Import Table:            {:#010x} ({})", self.import_table.virtual_address, self.import_table.size)?;
        writeln!(f, "Base Relocation Table:   {:#010x} ({})", self.base_relocation_table.virtual_address, self.base_relocation_table.size)?;
        writeln!(f, "TLS Table:               {:#010x} ({})", self.tls_table.virtual_address, self.tls_table.size)?;
        writeln!(f, "Import Address Table:    {:#010x} ({})", self.import_address_table.virtual_address, self.import_address_table.size)?;

        Ok(())
    }
}

impl fmt::Display for OptionalHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Optional Header")?;
        writeln!(f, "---------------")?;
        match self.magic() {
            Magic::PE32 => writeln!(f, "Magic:                      PE32")?,
            Magic::PE64 => writeln!(f, "Magic:                      PE32+")?,
        }
        writeln!(f, "Address of Entry Point:     {:#010x}", self.address_of_entry_point())?;
        writeln!(f, "Image Base:                 {:#018x}", self.image_base())?;
        writeln!(f, "Size of Image:              {}", self.size_of_image())?;
        writeln!(f, "Size of Headers:            {}", self.size_of_headers())?;
        write!(f, "\n{}", self.data_directories())?;

        Ok(())
    }
}
