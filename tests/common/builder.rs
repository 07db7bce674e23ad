//! Crafts minimal PE images for exercising the mapper end to end: a file
//! layout the engine reads from disk, and a memory layout for modules that
//! are pretended to be already loaded in the target.

use bytemuck::bytes_of;
use pe_mapper::coff::CoffFileHeader;
use pe_mapper::export::ExportDirectory;
use pe_mapper::import::ImportDescriptor;
use pe_mapper::optional::{DataDirectories, DataDirectory, OptionalHeader32, OptionalHeader64};
use pe_mapper::pe::DosHeader;
use pe_mapper::section::SectionHeader;
use pe_mapper::tls::{TlsDirectory32, TlsDirectory64};
use std::collections::HashMap;

/// Executable, readable code section.
pub const CODE: u32 = 0x6000_0020;
/// Readable, writable initialized-data section.
pub const DATA: u32 = 0xC000_0040;

const FILE_ALIGN: u32 = 0x200;
const SECTION_ALIGN: u32 = 0x1000;
const HEADERS_SIZE: u32 = 0x400;
const NT_OFFSET: u32 = 0x40;

pub const IMAGE_REL_BASED_HIGH: u8 = 1;
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

pub enum ImportItem {
    Ordinal(u16),
    Named { name: String, hint: u16 },
}

impl ImportItem {
    pub fn named(name: &str, hint: u16) -> Self {
        ImportItem::Named {
            name: name.to_string(),
            hint,
        }
    }
}

enum ExportTarget {
    Rva(u32),
    Forward(String),
}

struct ExportSpec {
    name: Option<String>,
    target: ExportTarget,
}

pub struct PeBuilder {
    is_64: bool,
    image_base: u64,
    entry_point: u32,
    ordinal_base: u32,
    sections: Vec<(String, Vec<u8>, u32)>,
    imports: Vec<(String, Vec<ImportItem>)>,
    exports: Vec<ExportSpec>,
    relocs: Vec<(u32, u8)>,
    tls_callbacks: Vec<u32>,
}

pub struct BuiltImage {
    /// File layout, as the engine reads it from disk.
    pub bytes: Vec<u8>,
    /// Memory layout, for seeding already-loaded modules into the mock.
    pub mapped: Vec<u8>,
    /// Per imported DLL, the RVA of its import address table.
    pub iat_rva: HashMap<String, u32>,
}

fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

fn section_name(name: &str) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    bytes
}

impl PeBuilder {
    /// A PE32+ image preferring base `0x1000_0000`.
    pub fn new() -> Self {
        PeBuilder {
            is_64: true,
            image_base: 0x1000_0000,
            entry_point: 0,
            ordinal_base: 1,
            sections: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            relocs: Vec::new(),
            tls_callbacks: Vec::new(),
        }
    }

    /// A PE32 image, for exercising the architecture guard.
    pub fn pe32() -> Self {
        PeBuilder {
            is_64: false,
            ..PeBuilder::new()
        }
    }

    pub fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    pub fn ordinal_base(mut self, base: u32) -> Self {
        self.ordinal_base = base;
        self
    }

    /// User sections are laid out in order starting at RVA `0x1000`, each
    /// aligned to `0x1000`.
    pub fn section(mut self, name: &str, data: Vec<u8>, characteristics: u32) -> Self {
        self.sections.push((name.to_string(), data, characteristics));
        self
    }

    pub fn import(mut self, dll: &str, items: Vec<ImportItem>) -> Self {
        self.imports.push((dll.to_string(), items));
        self
    }

    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push(ExportSpec {
            name: Some(name.to_string()),
            target: ExportTarget::Rva(rva),
        });
        self
    }

    /// An unnamed export reachable only by ordinal.
    pub fn export_ordinal(mut self, rva: u32) -> Self {
        self.exports.push(ExportSpec {
            name: None,
            target: ExportTarget::Rva(rva),
        });
        self
    }

    pub fn export_forwarder(mut self, name: &str, target: &str) -> Self {
        self.exports.push(ExportSpec {
            name: Some(name.to_string()),
            target: ExportTarget::Forward(target.to_string()),
        });
        self
    }

    pub fn reloc(mut self, rva: u32, kind: u8) -> Self {
        self.relocs.push((rva, kind));
        self
    }

    pub fn tls_callback(mut self, rva: u32) -> Self {
        self.tls_callbacks.push(rva);
        self
    }

    pub fn build(self) -> BuiltImage {
        let mut plans: Vec<([u8; 8], u32, Vec<u8>, u32)> = Vec::new();
        let mut va = SECTION_ALIGN;
        for (name, data, characteristics) in &self.sections {
            let len = data.len().max(1) as u32;
            plans.push((section_name(name), va, data.clone(), *characteristics));
            va += align_up(len, SECTION_ALIGN);
        }

        let mut directories = DataDirectories::default();
        let mut iat_rva = HashMap::new();

        if !self.exports.is_empty() {
            let content = self.build_edata(va);
            directories.export_table = DataDirectory {
                virtual_address: va,
                size: content.len() as u32,
            };
            plans.push((section_name(".edata"), va, content, 0x4000_0040));
            va += align_up(plans.last().unwrap().2.len() as u32, SECTION_ALIGN);
        }

        if !self.imports.is_empty() {
            let (content, tables) = self.build_idata(va);
            directories.import_table = DataDirectory {
                virtual_address: va,
                size: content.len() as u32,
            };
            iat_rva = tables;
            plans.push((section_name(".idata"), va, content, DATA));
            va += align_up(plans.last().unwrap().2.len() as u32, SECTION_ALIGN);
        }

        if !self.tls_callbacks.is_empty() {
            let content = self.build_tls(va);
            directories.tls_table = DataDirectory {
                virtual_address: va,
                size: if self.is_64 { 40 } else { 24 },
            };
            plans.push((section_name(".tls"), va, content, DATA));
            va += align_up(plans.last().unwrap().2.len() as u32, SECTION_ALIGN);
        }

        if !self.relocs.is_empty() {
            let content = self.build_reloc();
            directories.base_relocation_table = DataDirectory {
                virtual_address: va,
                size: content.len() as u32,
            };
            plans.push((section_name(".reloc"), va, content, 0x4200_0040));
            va += align_up(plans.last().unwrap().2.len() as u32, SECTION_ALIGN);
        }

        let size_of_image = va;

        let mut headers = Vec::new();
        for (index, (name, section_va, data, characteristics)) in plans.iter().enumerate() {
            let file_offset: u32 = HEADERS_SIZE
                + plans[..index]
                    .iter()
                    .map(|(_, _, data, _)| align_up(data.len().max(1) as u32, FILE_ALIGN))
                    .sum::<u32>();
            headers.push(SectionHeader {
                name: *name,
                virtual_size: data.len().max(1) as u32,
                virtual_address: *section_va,
                size_of_raw_data: align_up(data.len().max(1) as u32, FILE_ALIGN),
                pointer_to_raw_data: file_offset,
                characteristics: *characteristics,
                ..SectionHeader::default()
            });
        }

        let file_size = headers
            .last()
            .map(|header| header.pointer_to_raw_data + header.size_of_raw_data)
            .unwrap_or(HEADERS_SIZE);
        let mut bytes = vec![0u8; file_size as usize];

        let dos = DosHeader {
            e_magic: 0x5a4d,
            e_lfanew: NT_OFFSET,
            ..DosHeader::default()
        };
        bytes[..64].copy_from_slice(bytes_of(&dos));
        bytes[0x40..0x44].copy_from_slice(b"PE\0\0");

        let coff = CoffFileHeader {
            machine: if self.is_64 { 0x8664 } else { 0x14c },
            number_of_sections: plans.len() as u16,
            size_of_optional_header: if self.is_64 { 0xf0 } else { 0xe0 },
            characteristics: 0x2022, // executable image, large-address-aware, DLL
            ..CoffFileHeader::default()
        };
        bytes[0x44..0x58].copy_from_slice(bytes_of(&coff));

        if self.is_64 {
            let optional = OptionalHeader64 {
                magic: 0x20b,
                address_of_entry_point: self.entry_point,
                image_base: self.image_base,
                section_alignment: SECTION_ALIGN,
                file_alignment: FILE_ALIGN,
                size_of_image,
                size_of_headers: HEADERS_SIZE,
                subsystem: 2,
                number_of_rva_and_sizes: 16,
                data_directories: directories,
                ..OptionalHeader64::default()
            };
            bytes[0x58..0x58 + 0xf0].copy_from_slice(bytes_of(&optional));
        } else {
            let optional = OptionalHeader32 {
                magic: 0x10b,
                address_of_entry_point: self.entry_point,
                image_base: self.image_base as u32,
                section_alignment: SECTION_ALIGN,
                file_alignment: FILE_ALIGN,
                size_of_image,
                size_of_headers: HEADERS_SIZE,
                subsystem: 2,
                number_of_rva_and_sizes: 16,
                data_directories: directories,
                ..OptionalHeader32::default()
            };
            bytes[0x58..0x58 + 0xe0].copy_from_slice(bytes_of(&optional));
        }

        let table_offset = 0x58 + usize::from(coff.size_of_optional_header);
        for (index, header) in headers.iter().enumerate() {
            let offset = table_offset + index * 40;
            bytes[offset..offset + 40].copy_from_slice(bytes_of(header));
        }

        for (plan, header) in plans.iter().zip(&headers) {
            let offset = header.pointer_to_raw_data as usize;
            bytes[offset..offset + plan.2.len()].copy_from_slice(&plan.2);
        }

        let mut mapped = vec![0u8; size_of_image as usize];
        mapped[..HEADERS_SIZE as usize].copy_from_slice(&bytes[..HEADERS_SIZE as usize]);
        for (plan, header) in plans.iter().zip(&headers) {
            let offset = header.virtual_address as usize;
            mapped[offset..offset + plan.2.len()].copy_from_slice(&plan.2);
        }

        BuiltImage {
            bytes,
            mapped,
            iat_rva,
        }
    }

    fn build_edata(&self, base_va: u32) -> Vec<u8> {
        let function_count = self.exports.len() as u32;
        let named: Vec<(u16, &str)> = self
            .exports
            .iter()
            .enumerate()
            .filter_map(|(index, export)| {
                export.name.as_deref().map(|name| (index as u16, name))
            })
            .collect();
        let name_count = named.len() as u32;

        let functions_offset = 40u32;
        let names_offset = functions_offset + function_count * 4;
        let ordinals_offset = names_offset + name_count * 4;
        let mut strings_offset = ordinals_offset + name_count * 2;

        // First pass sizes the string blob so function RVAs for forwarders
        // are known up front.
        let mut string_offsets = Vec::new();
        for export in &self.exports {
            if let Some(name) = &export.name {
                string_offsets.push(strings_offset);
                strings_offset += name.len() as u32 + 1;
            } else {
                string_offsets.push(0);
            }
        }
        let mut forward_offsets = Vec::new();
        for export in &self.exports {
            if let ExportTarget::Forward(target) = &export.target {
                forward_offsets.push(strings_offset);
                strings_offset += target.len() as u32 + 1;
            } else {
                forward_offsets.push(0);
            }
        }

        let mut content = vec![0u8; strings_offset as usize];
        let directory = ExportDirectory {
            base: self.ordinal_base,
            number_of_functions: function_count,
            number_of_names: name_count,
            address_of_functions: base_va + functions_offset,
            address_of_names: base_va + names_offset,
            address_of_name_ordinals: base_va + ordinals_offset,
            ..ExportDirectory::default()
        };
        content[..40].copy_from_slice(bytes_of(&directory));

        for (index, export) in self.exports.iter().enumerate() {
            let rva = match &export.target {
                ExportTarget::Rva(rva) => *rva,
                ExportTarget::Forward(_) => base_va + forward_offsets[index],
            };
            let offset = (functions_offset + index as u32 * 4) as usize;
            content[offset..offset + 4].copy_from_slice(&rva.to_le_bytes());
        }

        for (slot, (ordinal_index, name)) in named.iter().enumerate() {
            let name_rva = base_va + string_offsets[usize::from(*ordinal_index)];
            let offset = (names_offset + slot as u32 * 4) as usize;
            content[offset..offset + 4].copy_from_slice(&name_rva.to_le_bytes());

            let offset = (ordinals_offset + slot as u32 * 2) as usize;
            content[offset..offset + 2].copy_from_slice(&ordinal_index.to_le_bytes());

            let offset = string_offsets[usize::from(*ordinal_index)] as usize;
            content[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        }

        for (index, export) in self.exports.iter().enumerate() {
            if let ExportTarget::Forward(target) = &export.target {
                let offset = forward_offsets[index] as usize;
                content[offset..offset + target.len()].copy_from_slice(target.as_bytes());
            }
        }

        content
    }

    fn build_idata(&self, base_va: u32) -> (Vec<u8>, HashMap<String, u32>) {
        let width = if self.is_64 { 8u32 } else { 4u32 };
        let ordinal_flag: u64 = if self.is_64 { 1 << 63 } else { 1 << 31 };

        let descriptor_bytes = (self.imports.len() as u32 + 1) * 20;

        // Pass one: lay out the per-DLL tables after the descriptor array.
        let mut cursor = descriptor_bytes;
        let mut layouts = Vec::new();
        for (dll, items) in &self.imports {
            let lookup_offset = cursor;
            cursor += (items.len() as u32 + 1) * width;
            let address_offset = cursor;
            cursor += (items.len() as u32 + 1) * width;

            let mut hint_name_offsets = Vec::new();
            for item in items {
                match item {
                    ImportItem::Ordinal(_) => hint_name_offsets.push(0),
                    ImportItem::Named { name, .. } => {
                        hint_name_offsets.push(cursor);
                        cursor += 2 + name.len() as u32 + 1;
                        cursor += cursor % 2; // keep hint fields even-aligned
                    }
                }
            }

            let name_offset = cursor;
            cursor += dll.len() as u32 + 1;

            layouts.push((lookup_offset, address_offset, hint_name_offsets, name_offset));
        }

        let mut content = vec![0u8; cursor as usize];
        let mut iat_rva = HashMap::new();

        for (index, ((dll, items), layout)) in self.imports.iter().zip(&layouts).enumerate() {
            let (lookup_offset, address_offset, hint_name_offsets, name_offset) = layout;

            let descriptor = ImportDescriptor {
                original_first_thunk: base_va + lookup_offset,
                name: base_va + name_offset,
                first_thunk: base_va + address_offset,
                ..ImportDescriptor::default()
            };
            let offset = index * 20;
            content[offset..offset + 20].copy_from_slice(bytes_of(&descriptor));

            for (slot, item) in items.iter().enumerate() {
                let value = match item {
                    ImportItem::Ordinal(ordinal) => ordinal_flag | u64::from(*ordinal),
                    ImportItem::Named { name, hint } => {
                        let entry = hint_name_offsets[slot] as usize;
                        content[entry..entry + 2].copy_from_slice(&hint.to_le_bytes());
                        content[entry + 2..entry + 2 + name.len()]
                            .copy_from_slice(name.as_bytes());
                        u64::from(base_va + hint_name_offsets[slot])
                    }
                };

                // The address table starts as a copy of the lookup table,
                // as linkers emit it.
                for table in [lookup_offset, address_offset] {
                    let offset = (table + slot as u32 * width) as usize;
                    content[offset..offset + width as usize]
                        .copy_from_slice(&value.to_le_bytes()[..width as usize]);
                }
            }

            let offset = *name_offset as usize;
            content[offset..offset + dll.len()].copy_from_slice(dll.as_bytes());

            iat_rva.insert(dll.clone(), base_va + address_offset);
        }

        (content, iat_rva)
    }

    fn build_tls(&self, base_va: u32) -> Vec<u8> {
        if self.is_64 {
            let directory = TlsDirectory64 {
                start_address_of_raw_data: self.image_base,
                end_address_of_raw_data: self.image_base,
                address_of_index: self.image_base,
                address_of_callbacks: self.image_base + u64::from(base_va) + 40,
                ..TlsDirectory64::default()
            };
            let mut content = bytes_of(&directory).to_vec();
            for rva in &self.tls_callbacks {
                content.extend_from_slice(&(self.image_base + u64::from(*rva)).to_le_bytes());
            }
            content.extend_from_slice(&0u64.to_le_bytes());
            content
        } else {
            let directory = TlsDirectory32 {
                start_address_of_raw_data: self.image_base as u32,
                end_address_of_raw_data: self.image_base as u32,
                address_of_index: self.image_base as u32,
                address_of_callbacks: self.image_base as u32 + base_va + 24,
                ..TlsDirectory32::default()
            };
            let mut content = bytes_of(&directory).to_vec();
            for rva in &self.tls_callbacks {
                content.extend_from_slice(&(self.image_base as u32 + rva).to_le_bytes());
            }
            content.extend_from_slice(&0u32.to_le_bytes());
            content
        }
    }

    fn build_reloc(&self) -> Vec<u8> {
        let mut pages: std::collections::BTreeMap<u32, Vec<u16>> = std::collections::BTreeMap::new();
        for (rva, kind) in &self.relocs {
            let entry = (u16::from(*kind) << 12) | (rva & 0xfff) as u16;
            pages.entry(rva & !0xfff).or_default().push(entry);
        }

        let mut content = Vec::new();
        for (page, mut entries) in pages {
            if entries.len() % 2 != 0 {
                entries.push(0); // absolute padding entry
            }
            content.extend_from_slice(&page.to_le_bytes());
            content.extend_from_slice(&((8 + entries.len() * 2) as u32).to_le_bytes());
            for entry in entries {
                content.extend_from_slice(&entry.to_le_bytes());
            }
        }
        content
    }
}
