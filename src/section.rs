use crate::memory::PageProtection;
use crate::Error;
use bitflags::bitflags;
use bytemuck::{pod_read_unaligned, Pod, Zeroable};
use core::fmt;

/// Contains information such as name, size, characteristics
/// and location of a section in the binary
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct SectionHeader {
    /// An 8-byte, null-padded UTF-8 encoded string.
    /// If the string is exactly 8 characters long, there is no terminating null.
    pub name: [u8; 8],
    /// The total size of the section when loaded into memory.
    /// If this value is greater than `size_of_raw_data`, the section is zero-padded.
    pub virtual_size: u32,
    /// The address of the first byte of the section relative to the image base
    /// when the section is loaded into memory.
    pub virtual_address: u32,
    /// The size of the initialized data on disk.
    /// When a section contains only uninitialized data, this field should be zero.
    pub size_of_raw_data: u32,
    /// The file pointer to the first page of the section within the COFF file.
    /// When a section contains only uninitialized data, this field should be zero.
    pub pointer_to_raw_data: u32,
    /// The file pointer to the beginning of relocation entries for the section.
    /// This is set to zero for executable images.
    pub pointer_to_relocations: u32,
    /// The file pointer to the beginning of line-number entries for the section.
    pub pointer_to_linenumbers: u32,
    /// The number of relocation entries for the section.
    /// This is set to zero for executable images.
    pub number_of_relocations: u16,
    /// The number of line-number entries for the section.
    pub number_of_linenumbers: u16,
    /// The flags that describe the characteristics of the section.
    pub characteristics: u32,
}

/// Parse the section table from a byte array at a given offset.
/// `number_of_sections` should be equal to number of sections
/// defined in the COFF header.
pub fn parse_section_table(
    binary: &[u8],
    offset: usize,
    number_of_sections: u16,
) -> Result<Vec<SectionHeader>, Error> {
    let header_size = core::mem::size_of::<SectionHeader>();
    let mut headers = Vec::with_capacity(number_of_sections.into());

    for index in 0..usize::from(number_of_sections) {
        let start = offset + index * header_size;
        let slice = binary
            .get(start..start + header_size)
            .ok_or(Error::BadImage("section table is truncated"))?;
        headers.push(pod_read_unaligned(slice));
    }

    Ok(headers)
}

bitflags! {
    /// Bitflags that contain various information about
    /// how a section should be loaded
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// The section contains executable code.
        const IMAGE_SCN_CNT_CODE = 0x00000020;
        /// The section contains initialized data.
        const IMAGE_SCN_CNT_INITIALIZED_DATA = 0x00000040;
        /// The section contains uninitialized data.
        const IMAGE_SCN_CNT_UNINITIALIZED_DATA = 0x00000080;
        /// The section can be discarded as needed.
        const IMAGE_SCN_MEM_DISCARDABLE = 0x02000000;
        /// The section can be shared in memory.
        const IMAGE_SCN_MEM_SHARED = 0x10000000;
        /// The section can be executed as code.
        const IMAGE_SCN_MEM_EXECUTE = 0x20000000;
        /// The section can be read.
        const IMAGE_SCN_MEM_READ = 0x40000000;
        /// The section can be written to.
        const IMAGE_SCN_MEM_WRITE = 0x80000000;
    }
}

/// Page protections keyed by the top four characteristic bits
/// (shared, execute, read, write).
const PROTECTION_FOR_CHARACTERISTICS: [PageProtection; 16] = [
    PageProtection::NoAccess,         // 0  = NONE
    PageProtection::NoAccess,         // 1  = SHARED
    PageProtection::Execute,          // 2  = EXECUTABLE
    PageProtection::Execute,          // 3  = EXECUTABLE, SHARED
    PageProtection::ReadOnly,         // 4  = READABLE
    PageProtection::ReadOnly,         // 5  = READABLE, SHARED
    PageProtection::ExecuteRead,      // 6  = READABLE, EXECUTABLE
    PageProtection::ExecuteRead,      // 7  = READABLE, EXECUTABLE, SHARED
    PageProtection::ReadWrite,        // 8  = WRITABLE
    PageProtection::ReadWrite,        // 9  = WRITABLE, SHARED
    PageProtection::ExecuteReadWrite, // 10 = WRITABLE, EXECUTABLE
    PageProtection::ExecuteReadWrite, // 11 = WRITABLE, EXECUTABLE, SHARED
    PageProtection::ReadWrite,        // 12 = WRITABLE, READABLE
    PageProtection::ReadWrite,        // 13 = WRITABLE, READABLE, SHARED
    PageProtection::ExecuteReadWrite, // 14 = WRITABLE, READABLE, EXECUTABLE
    PageProtection::ExecuteReadWrite, // 15 = WRITABLE, READABLE, EXECUTABLE, SHARED
];

impl SectionHeader {
    /// Get the name of a section as a string.
    /// Note that this string may contain null characters.
    pub fn get_name(&self) -> Option<String> {
        String::from_utf8(self.name.to_vec()).ok()
    }

    /// Returns the Section Characteristics as bitflags
    pub fn get_characteristics(&self) -> SectionFlags {
        SectionFlags::from_bits_retain(self.characteristics)
    }

    /// The page protection the section must carry once mapped.
    ///
    /// Sections with no explicit read/write/execute flags have them
    /// synthesized from their content flags before the table lookup.
    pub fn protection(&self) -> PageProtection {
        let mut flags = self.get_characteristics();

        if !flags.intersects(
            SectionFlags::IMAGE_SCN_MEM_EXECUTE
                | SectionFlags::IMAGE_SCN_MEM_READ
                | SectionFlags::IMAGE_SCN_MEM_WRITE,
        ) {
            if flags.contains(SectionFlags::IMAGE_SCN_CNT_CODE) {
                flags |= SectionFlags::IMAGE_SCN_MEM_EXECUTE | SectionFlags::IMAGE_SCN_MEM_READ;
            }
            if flags.contains(SectionFlags::IMAGE_SCN_CNT_INITIALIZED_DATA) {
                flags |= SectionFlags::IMAGE_SCN_MEM_READ | SectionFlags::IMAGE_SCN_MEM_WRITE;
            }
            if flags.contains(SectionFlags::IMAGE_SCN_CNT_UNINITIALIZED_DATA) {
                flags |= SectionFlags::IMAGE_SCN_MEM_READ | SectionFlags::IMAGE_SCN_MEM_WRITE;
            }
        }

        PROTECTION_FOR_CHARACTERISTICS[(flags.bits() >> 28) as usize]
    }
}

// Allow SectionFlags flags to be easily printed
impl fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for SectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Section Header")?;
        writeln!(f, "--------------")?;
        writeln!(f, "Name:                    {:?}", self.get_name().unwrap_or_default())?;
        writeln!(f, "Virtual Size:            {}", self.virtual_size)?;
        writeln!(f, "Virtual Address:         {:#010x}", self.virtual_address)?;
        writeln!(f, "Size of Raw Data:        {}", self.size_of_raw_data)?;
        writeln!(f, "Pointer to Raw Data:     {}", self.pointer_to_raw_data)?;
        writeln!(f, "Characteristics:         {:#010x}", self.characteristics)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_with(characteristics: u32) -> SectionHeader {
        SectionHeader {
            characteristics,
            ..SectionHeader::default()
        }
    }

    #[test]
    fn explicit_characteristics_use_the_table() {
        let text = section_with(0x6000_0020); // code, execute | read
        assert_eq!(text.protection(), PageProtection::ExecuteRead);

        let rdata = section_with(0x4000_0040); // initialized data, read
        assert_eq!(rdata.protection(), PageProtection::ReadOnly);

        let data = section_with(0xC000_0040); // initialized data, read | write
        assert_eq!(data.protection(), PageProtection::ReadWrite);

        let everything = section_with(0xF000_0000);
        assert_eq!(everything.protection(), PageProtection::ExecuteReadWrite);

        let nothing = section_with(0);
        assert_eq!(nothing.protection(), PageProtection::NoAccess);
    }

    #[test]
    fn missing_access_flags_are_synthesized_from_content() {
        let code_only = section_with(0x0000_0020);
        assert_eq!(code_only.protection(), PageProtection::ExecuteRead);

        let data_only = section_with(0x0000_0040);
        assert_eq!(data_only.protection(), PageProtection::ReadWrite);

        let bss_only = section_with(0x0000_0080);
        assert_eq!(bss_only.protection(), PageProtection::ReadWrite);
    }

    #[test]
    fn shared_bit_does_not_change_protection() {
        let shared_code = section_with(0x7000_0020);
        assert_eq!(shared_code.protection(), PageProtection::ExecuteRead);
    }
}
