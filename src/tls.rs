use crate::pe::PeImage;
use crate::Error;
use bytemuck::{pod_read_unaligned, Pod, Zeroable};
use tracing::debug;

/// TLS directory of a PE32+ image.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct TlsDirectory64 {
    /// VA of the start of the TLS template.
    pub start_address_of_raw_data: u64,
    /// VA of the end of the TLS template.
    pub end_address_of_raw_data: u64,
    /// VA of the slot the loader stores the TLS index in.
    pub address_of_index: u64,
    /// VA of the zero-terminated callback pointer array.
    pub address_of_callbacks: u64,
    /// Extra zeroed bytes appended to the template.
    pub size_of_zero_fill: u32,
    /// Alignment characteristics.
    pub characteristics: u32,
}

/// TLS directory of a PE32 image.
#[derive(Copy, Clone, Pod, Zeroable, Default)]
#[repr(C)]
pub struct TlsDirectory32 {
    /// VA of the start of the TLS template.
    pub start_address_of_raw_data: u32,
    /// VA of the end of the TLS template.
    pub end_address_of_raw_data: u32,
    /// VA of the slot the loader stores the TLS index in.
    pub address_of_index: u32,
    /// VA of the zero-terminated callback pointer array.
    pub address_of_callbacks: u32,
    /// Extra zeroed bytes appended to the template.
    pub size_of_zero_fill: u32,
    /// Alignment characteristics.
    pub characteristics: u32,
}

/// Collect the RVAs of the image's TLS callbacks from the scratch buffer.
///
/// The directory stores virtual addresses based at the image's preferred
/// base, so this must run before the scratch buffer is rebased.
pub fn callback_rvas(scratch: &[u8], image: &PeImage) -> Result<Vec<u32>, Error> {
    // Far more callbacks than any real image carries.
    const MAX_CALLBACKS: usize = 1024;

    let directory = image.optional.data_directories().tls_table;
    if !directory.is_present() {
        return Ok(Vec::new());
    }

    let offset = image
        .rva_to_offset(directory.virtual_address)
        .ok_or(Error::BadImage("TLS directory outside the image"))?;

    let preferred_base = image.optional.image_base();
    let callbacks_va = if image.is_64_bit() {
        let slice = scratch
            .get(offset..offset + core::mem::size_of::<TlsDirectory64>())
            .ok_or(Error::BadImage("TLS directory is truncated"))?;
        let tls: TlsDirectory64 = pod_read_unaligned(slice);
        tls.address_of_callbacks
    } else {
        let slice = scratch
            .get(offset..offset + core::mem::size_of::<TlsDirectory32>())
            .ok_or(Error::BadImage("TLS directory is truncated"))?;
        let tls: TlsDirectory32 = pod_read_unaligned(slice);
        u64::from(tls.address_of_callbacks)
    };

    if callbacks_va == 0 {
        return Ok(Vec::new());
    }

    let array_rva = callbacks_va
        .checked_sub(preferred_base)
        .and_then(|rva| u32::try_from(rva).ok())
        .ok_or(Error::BadImage("TLS callback array below the image base"))?;

    let width = if image.is_64_bit() { 8 } else { 4 };
    let mut rvas = Vec::new();
    for index in 0..MAX_CALLBACKS {
        let entry_offset = image
            .rva_to_offset(array_rva + (index * width) as u32)
            .ok_or(Error::BadImage("TLS callback array outside the image"))?;
        let slice = scratch
            .get(entry_offset..entry_offset + width)
            .ok_or(Error::BadImage("TLS callback array is truncated"))?;

        let callback_va = if image.is_64_bit() {
            u64::from_le_bytes(slice.try_into().unwrap())
        } else {
            u64::from(u32::from_le_bytes(slice.try_into().unwrap()))
        };
        if callback_va == 0 {
            debug!(count = rvas.len(), "collected TLS callbacks");
            return Ok(rvas);
        }

        let rva = callback_va
            .checked_sub(preferred_base)
            .and_then(|rva| u32::try_from(rva).ok())
            .ok_or(Error::BadImage("TLS callback below the image base"))?;
        rvas.push(rva);
    }

    Err(Error::BadImage("unterminated TLS callback array"))
}
