use crate::pe::PeImage;
use crate::Error;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tracing::{debug, trace};

/// Base relocation type indicators.
///
/// Only `Absolute`, `HighLow` and `Dir64` can actually be applied; meeting
/// any other type aborts the mapping.
#[derive(FromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum RelocationType {
    /// The relocation is skipped; used to pad blocks.
    Absolute = 0,
    /// The high 16 bits of the delta are added to the 16-bit field at the offset.
    High = 1,
    /// The low 16 bits of the delta are added to the 16-bit field at the offset.
    Low = 2,
    /// The full 32-bit delta is added to the 32-bit field at the offset.
    HighLow = 3,
    /// Same as `High`, with the low half used to round the result.
    HighAdj = 4,
    /// Machine-specific (MIPS jump, ARM MOV32).
    MachineSpecific5 = 5,
    /// Reserved, must be zero.
    Reserved = 6,
    /// Machine-specific (Thumb MOV32).
    MachineSpecific7 = 7,
    /// Machine-specific (RISC-V low12, LoongArch).
    MachineSpecific8 = 8,
    /// Machine-specific (MIPS jump16).
    MachineSpecific9 = 9,
    /// The full 64-bit delta is added to the 64-bit field at the offset.
    Dir64 = 10,
}

fn patch_u32(scratch: &mut [u8], offset: usize, delta: u64) -> Result<(), Error> {
    let slice = scratch
        .get_mut(offset..offset + 4)
        .ok_or(Error::BadImage("relocation points outside the image"))?;
    let bytes: [u8; 4] = (&*slice).try_into().unwrap();
    let patched = u32::from_le_bytes(bytes).wrapping_add(delta as u32);
    slice.copy_from_slice(&patched.to_le_bytes());
    Ok(())
}

fn patch_u64(scratch: &mut [u8], offset: usize, delta: u64) -> Result<(), Error> {
    let slice = scratch
        .get_mut(offset..offset + 8)
        .ok_or(Error::BadImage("relocation points outside the image"))?;
    let bytes: [u8; 8] = (&*slice).try_into().unwrap();
    let patched = u64::from_le_bytes(bytes).wrapping_add(delta);
    slice.copy_from_slice(&patched.to_le_bytes());
    Ok(())
}

/// Rebase the scratch image for its new remote base.
///
/// Walks the base-relocation directory block by block, patching absolute
/// addresses in place, so the section bodies written out afterwards already
/// carry corrected pointers. Stops at a zero-sized block or the end of the
/// directory, whichever comes first.
pub fn apply_relocations(
    scratch: &mut [u8],
    image: &PeImage,
    remote_base: u64,
) -> Result<(), Error> {
    let directory = image.optional.data_directories().base_relocation_table;
    if !directory.is_present() {
        debug!("image has no relocations");
        return Ok(());
    }

    let delta = remote_base.wrapping_sub(image.optional.image_base());
    if delta == 0 {
        debug!("image loaded at its preferred base, nothing to relocate");
        return Ok(());
    }

    let directory_start = image
        .rva_to_offset(directory.virtual_address)
        .ok_or(Error::BadImage("relocation directory outside the image"))?;
    let directory_end = directory_start + directory.size as usize;

    let mut block_offset = directory_start;
    while block_offset + 8 <= directory_end {
        let page_rva = read_u32(scratch, block_offset)?;
        let block_size = read_u32(scratch, block_offset + 4)? as usize;
        if block_size == 0 {
            break;
        }
        if block_size < 8 || block_offset + block_size > directory_end {
            return Err(Error::BadImage("malformed relocation block"));
        }

        let entries = (block_size - 8) / 2;
        trace!(page_rva, entries, "relocating block");

        for index in 0..entries {
            let entry = read_u16(scratch, block_offset + 8 + index * 2)?;
            let kind = (entry >> 12) as u8;
            let offset = u32::from(entry & 0xfff);

            // Absolute entries are padding and may carry any offset.
            if RelocationType::from_u8(kind) == Some(RelocationType::Absolute) {
                continue;
            }

            let target = image
                .rva_to_offset(page_rva + offset)
                .ok_or(Error::BadImage("relocation points outside the image"))?;

            match RelocationType::from_u8(kind) {
                Some(RelocationType::HighLow) => patch_u32(scratch, target, delta)?,
                Some(RelocationType::Dir64) => patch_u64(scratch, target, delta)?,
                _ => return Err(Error::UnsupportedReloc(kind)),
            }
        }

        block_offset += block_size;
    }

    Ok(())
}

fn read_u16(scratch: &[u8], offset: usize) -> Result<u16, Error> {
    scratch
        .get(offset..offset + 2)
        .and_then(|slice| slice.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or(Error::BadImage("relocation directory is truncated"))
}

fn read_u32(scratch: &[u8], offset: usize) -> Result<u32, Error> {
    scratch
        .get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(Error::BadImage("relocation directory is truncated"))
}
