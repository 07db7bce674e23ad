use crate::coff::CoffFileHeader;
use crate::memory::ProcessMemory;
use crate::optional::{DataDirectories, Magic, OptionalHeader};
use crate::section::{parse_section_table, SectionHeader};
use crate::Error;
use bytemuck::{pod_read_unaligned, Pod, Zeroable};
use core::fmt;
use num_traits::FromPrimitive;

/// `MZ`, the magic at offset zero of every PE file.
pub const DOS_MAGIC: u16 = 0x5a4d;
/// `PE\0\0`, the signature the DOS header points at.
pub const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";

/// MS-DOS stub header at the very start of the image.
///
/// Only `e_magic` and `e_lfanew` matter to the mapper; the rest is carried
/// so the header can be copied to the remote image verbatim.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DosHeader {
    /// Magic number, `MZ`.
    pub e_magic: u16,
    /// Bytes on last page of file.
    pub e_cblp: u16,
    /// Pages in file.
    pub e_cp: u16,
    /// Relocations.
    pub e_crlc: u16,
    /// Size of header in paragraphs.
    pub e_cparhdr: u16,
    /// Minimum extra paragraphs needed.
    pub e_minalloc: u16,
    /// Maximum extra paragraphs needed.
    pub e_maxalloc: u16,
    /// Initial (relative) SS value.
    pub e_ss: u16,
    /// Initial SP value.
    pub e_sp: u16,
    /// Checksum.
    pub e_csum: u16,
    /// Initial IP value.
    pub e_ip: u16,
    /// Initial (relative) CS value.
    pub e_cs: u16,
    /// File address of relocation table.
    pub e_lfarlc: u16,
    /// Overlay number.
    pub e_ovno: u16,
    /// Reserved words.
    pub e_res: [u16; 4],
    /// OEM identifier.
    pub e_oemid: u16,
    /// OEM information.
    pub e_oeminfo: u16,
    /// Reserved words.
    pub e_res2: [u16; 10],
    /// File offset of the NT headers.
    pub e_lfanew: u32,
}

/// An on-disk image parsed out of a scratch buffer.
///
/// The image still has file layout: RVAs are translated through the section
/// table rather than taken as offsets.
pub struct PeImage {
    /// DOS stub header.
    pub dos: DosHeader,
    /// COFF File Header (Object and Image)
    pub coff: CoffFileHeader,
    /// Optional header, either width.
    pub optional: OptionalHeader,
    /// Table containing a list of section headers
    pub sections: Vec<SectionHeader>,
    nt_offset: usize,
    headers_end: usize,
}

impl PeImage {
    /// Parse a Portable Executable from a given byte array.
    ///
    /// Validates the DOS magic and NT signature; any deviation is a
    /// [`Error::BadImage`].
    pub fn parse(binary: &[u8]) -> Result<Self, Error> {
        let dos_slice = binary
            .get(..core::mem::size_of::<DosHeader>())
            .ok_or(Error::BadImage("file is smaller than a DOS header"))?;
        let dos: DosHeader = pod_read_unaligned(dos_slice);

        if dos.e_magic != DOS_MAGIC {
            return Err(Error::BadImage("missing DOS magic"));
        }

        let nt_offset = dos.e_lfanew as usize;
        let signature = binary
            .get(nt_offset..nt_offset + 4)
            .ok_or(Error::BadImage("NT header offset is out of range"))?;
        if signature != PE_SIGNATURE {
            return Err(Error::BadImage("missing PE signature"));
        }

        let coff_offset = nt_offset + 4;
        let coff_slice = binary
            .get(coff_offset..coff_offset + core::mem::size_of::<CoffFileHeader>())
            .ok_or(Error::BadImage("COFF header is truncated"))?;
        let coff: CoffFileHeader = pod_read_unaligned(coff_slice);

        if coff.size_of_optional_header == 0 {
            return Err(Error::BadImage("image has no optional header"));
        }

        let optional_offset = coff_offset + core::mem::size_of::<CoffFileHeader>();
        let optional = OptionalHeader::parse(binary, optional_offset)?;

        let section_offset = optional_offset + usize::from(coff.size_of_optional_header);
        let sections = parse_section_table(binary, section_offset, coff.number_of_sections)?;

        let headers_end = section_offset
            + usize::from(coff.number_of_sections) * core::mem::size_of::<SectionHeader>();

        Ok(PeImage {
            dos,
            coff,
            optional,
            sections,
            nt_offset,
            headers_end,
        })
    }

    /// Whether the image addresses a 64-bit address space.
    pub fn is_64_bit(&self) -> bool {
        self.optional.is_64_bit()
    }

    /// Byte extent of the DOS header at the start of the file.
    pub fn dos_extent(&self) -> core::ops::Range<usize> {
        0..core::mem::size_of::<DosHeader>()
    }

    /// File offset of the NT headers.
    pub fn nt_offset(&self) -> usize {
        self.nt_offset
    }

    /// Byte extent of the NT headers plus the section-table slab.
    pub fn nt_extent(&self) -> core::ops::Range<usize> {
        self.nt_offset..self.headers_end
    }

    /// Translate an RVA to a file offset through the section table.
    ///
    /// RVAs inside the header region are offsets already. An RVA pointing
    /// past a section's raw data (zero-padded tail, BSS) has no file offset.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        if rva < self.optional.size_of_headers() {
            return Some(rva as usize);
        }

        self.sections.iter().find_map(|section| {
            let span = section.virtual_size.max(section.size_of_raw_data);
            let delta = rva.checked_sub(section.virtual_address)?;
            if delta < span && delta < section.size_of_raw_data {
                Some(section.pointer_to_raw_data as usize + delta as usize)
            } else {
                None
            }
        })
    }
}

impl fmt::Display for PeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.coff)?;
        writeln!(f, "{}", self.optional)?;

        for section in self.sections.iter() {
            writeln!(f, "{}", section)?;
        }

        Ok(())
    }
}

/// Header view over an image already resident in a (possibly remote) process.
///
/// The image has memory layout: an RVA is simply an offset from the base.
/// The view itself is plain data; every accessor takes the process memory it
/// should read through, so holding a view never borrows the target.
#[derive(Copy, Clone)]
pub struct RemotePe {
    base: u64,
    wide: bool,
    directories: DataDirectories,
}

impl RemotePe {
    /// Read and validate the headers of the image mapped at `base`.
    pub fn open<M: ProcessMemory + ?Sized>(memory: &M, base: u64) -> Result<Self, Error> {
        let dos: DosHeader = memory.read_pod(base)?;
        if dos.e_magic != DOS_MAGIC {
            return Err(Error::BadImage("mapped module is missing its DOS magic"));
        }

        let nt = base + u64::from(dos.e_lfanew);
        let mut signature = [0u8; 4];
        memory.read(nt, &mut signature)?;
        if signature != PE_SIGNATURE {
            return Err(Error::BadImage("mapped module is missing its PE signature"));
        }

        let magic = memory.read_u16(nt + 24)?;
        let wide = match Magic::from_u16(magic) {
            Some(Magic::PE32) => false,
            Some(Magic::PE64) => true,
            None => return Err(Error::BadImage("mapped module has an unknown magic")),
        };

        // The data directories sit at a fixed offset inside either variant.
        let directories_offset = nt + 24 + if wide { 112 } else { 96 };
        let directories: DataDirectories = memory.read_pod(directories_offset)?;

        Ok(RemotePe {
            base,
            wide,
            directories,
        })
    }

    /// Base address the image is mapped at.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Whether the image is PE32+.
    pub fn is_64_bit(&self) -> bool {
        self.wide
    }

    /// Virtual address of an RVA inside this image.
    pub fn va(&self, rva: u32) -> u64 {
        self.base + u64::from(rva)
    }

    /// The data directories of the image.
    pub fn directories(&self) -> &DataDirectories {
        &self.directories
    }
}
