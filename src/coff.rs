use bytemuck::{Pod, Zeroable};
use core::fmt;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// COFF File Header (Object and Image)
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct CoffFileHeader {
    /// The number that identifies the type of target machine.
    pub machine: u16,
    /// The number of sections. This indicates the size of the section table, which immediately follows the headers.
    pub number_of_sections: u16,
    /// The low 32 bits of the number of seconds since 00:00 January 1, 1970, which indicates when the file was created.
    pub time_date_stamp: u32,
    /// The file offset of the COFF symbol table, or zero if no COFF symbol table is present.
    pub pointer_to_symbol_table: u32,
    /// The number of entries in the symbol table.
    pub number_of_symbols: u32,
    /// The size of the optional header, which is required for executable files but not for object files.
    pub size_of_optional_header: u16,
    /// The flags that indicate the attributes of the file.
    pub characteristics: u16,
}

/// The Machine field specifies the CPU type an image file can run on.
///
/// Only the architectures the mapper can actually inject into are listed;
/// anything else is rejected by the architecture guard before any remote
/// state is touched.
#[derive(FromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u16)]
pub enum Machine {
    /// The content of this field is assumed to be applicable to any machine type
    Unknown = 0x0,
    /// Intel 386 or later processors and compatible processors
    I386 = 0x14c,
    /// x64
    AMD64 = 0x8664,
    /// ARM64 little endian
    ARM64 = 0xaa64,
}

impl Machine {
    /// Whether this machine type addresses a 64-bit address space.
    pub fn is_64_bit(&self) -> bool {
        matches!(self, Machine::AMD64 | Machine::ARM64)
    }
}

impl CoffFileHeader {
    /// Returns the machine type as an enum, or `None` for machine types the
    /// mapper does not know.
    pub fn get_machine(&self) -> Option<Machine> {
        Machine::from_u16(self.machine)
    }
}

impl fmt::Display for CoffFileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "COFF Header")?;
        writeln!(f, "-----------")?;
        match self.get_machine() {
            Some(machine) => writeln!(f, "Machine Type:            {:?}", machine)?,
            None => writeln!(f, "Machine Type:            {:#06x}", self.machine)?,
        }
        writeln!(f, "Number of Sections:      {}", self.number_of_sections)?;
        writeln!(f, "Time Date Stamp:         {}", self.time_date_stamp)?;
        writeln!(f, "Pointer of Symbol Table: {:#010x}", self.pointer_to_symbol_table)?;
        writeln!(f, "Number of Symbols:       {}", self.number_of_symbols)?;
        writeln!(f, "Size of Optional Header: {}", self.size_of_optional_header)?;
        writeln!(f, "Characteristics:         {:#06x}", self.characteristics)?;

        Ok(())
    }
}
