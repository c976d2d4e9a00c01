//! Synthetic PE images for the unit and integration tests.
//!
//! [`PeBuilder`] writes a DOS header, NT headers, the section table and section contents into a
//! flat buffer. Defaults produce a valid image that every Windows version maps: `e_lfanew` at
//! 0x80, headers in the first 0x400 bytes and one `.text` section at RVA 0x1000 backed by file
//! offset 0x400.
//!
//! The integration tests include this file as well, so it only reaches the library through the
//! `pemapper` path.

use pemapper::file::io::{write_le_at, PeIO};

const SECTION_TABLE_PREFIX: u32 = 4 + 20;
const SIZEOF_SECTION_HEADER: u32 = 40;

/// One section header plus the bytes that back it
#[derive(Clone, Debug)]
pub struct SectionSpec {
    name: [u8; 8],
    virtual_address: u32,
    virtual_size: u32,
    pointer_to_raw_data: u32,
    size_of_raw_data: u32,
    characteristics: u32,
    content: Option<Vec<u8>>,
}

impl SectionSpec {
    /// Readable code section at the given layout; raw data is filled with a nonzero pattern.
    pub fn new(
        name: [u8; 8],
        virtual_address: u32,
        virtual_size: u32,
        pointer_to_raw_data: u32,
        size_of_raw_data: u32,
    ) -> SectionSpec {
        SectionSpec {
            name,
            virtual_address,
            virtual_size,
            pointer_to_raw_data,
            size_of_raw_data,
            characteristics: 0x6000_0020,
            content: None,
        }
    }

    pub fn characteristics(mut self, characteristics: u32) -> SectionSpec {
        self.characteristics = characteristics;
        self
    }
}

/// Builder for a PE32 or PE32+ file
#[derive(Clone, Debug)]
pub struct PeBuilder {
    is_64bit: bool,
    e_lfanew: u32,
    machine: u16,
    characteristics: u16,
    number_of_sections: Option<u16>,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    image_base: u64,
    section_alignment: u32,
    file_alignment: u32,
    size_of_image: Option<u32>,
    size_of_headers: u32,
    dll_characteristics: u16,
    number_of_rva_and_sizes: u32,
    sections: Vec<SectionSpec>,
    relocations: Vec<(u32, Vec<u16>)>,
    file_size: Option<usize>,
}

impl PeBuilder {
    fn base(is_64bit: bool) -> PeBuilder {
        PeBuilder {
            is_64bit,
            e_lfanew: 0x80,
            machine: if is_64bit { 0x8664 } else { 0x014C },
            characteristics: if is_64bit { 0x0022 } else { 0x0102 },
            number_of_sections: None,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            image_base: if is_64bit { 0x1_4000_0000 } else { 0x40_0000 },
            section_alignment: 0x1000,
            file_alignment: 0x200,
            size_of_image: None,
            size_of_headers: 0x400,
            dll_characteristics: 0,
            number_of_rva_and_sizes: 16,
            sections: vec![SectionSpec::new(*b".text\0\0\0", 0x1000, 0x50, 0x400, 0x200)],
            relocations: Vec::new(),
            file_size: None,
        }
    }

    /// I386 executable at 0x400000
    pub fn pe32() -> PeBuilder {
        PeBuilder::base(false)
    }

    /// AMD64 executable at 0x140000000
    pub fn pe64() -> PeBuilder {
        PeBuilder::base(true)
    }

    pub fn e_lfanew(mut self, e_lfanew: u32) -> PeBuilder {
        self.e_lfanew = e_lfanew;
        self
    }

    pub fn machine(mut self, machine: u16) -> PeBuilder {
        self.machine = machine;
        self
    }

    pub fn characteristics(mut self, characteristics: u16) -> PeBuilder {
        self.characteristics = characteristics;
        self
    }

    /// Overrides `NumberOfSections` without changing the written table
    pub fn number_of_sections(mut self, count: u16) -> PeBuilder {
        self.number_of_sections = Some(count);
        self
    }

    pub fn symbol_table(mut self, pointer: u32, count: u32) -> PeBuilder {
        self.pointer_to_symbol_table = pointer;
        self.number_of_symbols = count;
        self
    }

    pub fn image_base(mut self, image_base: u64) -> PeBuilder {
        self.image_base = image_base;
        self
    }

    pub fn section_alignment(mut self, alignment: u32) -> PeBuilder {
        self.section_alignment = alignment;
        self
    }

    pub fn file_alignment(mut self, alignment: u32) -> PeBuilder {
        self.file_alignment = alignment;
        self
    }

    /// Fixed `SizeOfImage`; otherwise it ends at the last section, section aligned
    pub fn size_of_image(mut self, size: u32) -> PeBuilder {
        self.size_of_image = Some(size);
        self
    }

    pub fn size_of_headers(mut self, size: u32) -> PeBuilder {
        self.size_of_headers = size;
        self
    }

    pub fn dll_characteristics(mut self, characteristics: u16) -> PeBuilder {
        self.dll_characteristics = characteristics;
        self
    }

    pub fn number_of_rva_and_sizes(mut self, count: u32) -> PeBuilder {
        self.number_of_rva_and_sizes = count;
        self
    }

    /// Moves the raw data of the first section
    pub fn raw_pointer(mut self, pointer: u32) -> PeBuilder {
        if let Some(first) = self.sections.first_mut() {
            first.pointer_to_raw_data = pointer;
        }
        self
    }

    pub fn sections(mut self, sections: Vec<SectionSpec>) -> PeBuilder {
        self.sections = sections;
        self
    }

    /// Appends a `.reloc` section holding one block per `(page rva, entries)` and points the
    /// base relocation directory at it.
    pub fn base_relocations(mut self, blocks: &[(u32, &[u16])]) -> PeBuilder {
        self.relocations = blocks
            .iter()
            .map(|(rva, entries)| (*rva, entries.to_vec()))
            .collect();
        self
    }

    /// Truncates or zero-extends the finished file
    pub fn file_size(mut self, size: usize) -> PeBuilder {
        self.file_size = Some(size);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut sections = self.sections.clone();
        let mut directories = [(0u32, 0u32); 16];

        if !self.relocations.is_empty() {
            let blob = self.relocation_blob();
            let (virtual_end, raw_end) = sections.iter().fold(
                (self.size_of_headers, self.size_of_headers),
                |(va, raw), section| {
                    (
                        va.max(section.virtual_address + section.virtual_size),
                        raw.max(section.pointer_to_raw_data + section.size_of_raw_data),
                    )
                },
            );

            let reloc = SectionSpec {
                name: *b".reloc\0\0",
                virtual_address: align(virtual_end, self.section_alignment),
                virtual_size: blob.len() as u32,
                pointer_to_raw_data: align(raw_end, self.file_alignment),
                size_of_raw_data: align(blob.len() as u32, self.file_alignment),
                characteristics: 0x4200_0040,
                content: Some(blob),
            };
            directories[5] = (reloc.virtual_address, reloc.virtual_size);
            sections.push(reloc);
        }

        let size_of_image = self.size_of_image.unwrap_or_else(|| {
            let end = sections
                .iter()
                .map(|section| section.virtual_address + section.virtual_size)
                .max()
                .unwrap_or(self.size_of_headers);
            align(end, self.section_alignment)
        });

        let optional_size: u32 = if self.is_64bit { 240 } else { 224 };
        let table = self.e_lfanew + SECTION_TABLE_PREFIX + optional_size;
        let headers_end = table + sections.len() as u32 * SIZEOF_SECTION_HEADER;

        let length = sections
            .iter()
            .map(|section| section.pointer_to_raw_data + section.size_of_raw_data)
            .fold(self.size_of_headers.max(headers_end), u32::max);
        let mut data = vec![0u8; length as usize];

        // DOS header
        data[0..2].copy_from_slice(b"MZ");
        put(&mut data, 0x3C, self.e_lfanew);

        // NT signature and file header
        let nt = self.e_lfanew as usize;
        put(&mut data, nt, 0x0000_4550_u32);
        put(&mut data, nt + 4, self.machine);
        put(
            &mut data,
            nt + 6,
            self.number_of_sections.unwrap_or(sections.len() as u16),
        );
        put(&mut data, nt + 12, self.pointer_to_symbol_table);
        put(&mut data, nt + 16, self.number_of_symbols);
        put(&mut data, nt + 20, optional_size as u16);
        put(&mut data, nt + 22, self.characteristics);

        self.write_optional_header(&mut data, nt + 24, size_of_image, &directories);

        for (index, section) in sections.iter().enumerate() {
            let offset = table as usize + index * SIZEOF_SECTION_HEADER as usize;
            data[offset..offset + 8].copy_from_slice(&section.name);
            put(&mut data, offset + 8, section.virtual_size);
            put(&mut data, offset + 12, section.virtual_address);
            put(&mut data, offset + 16, section.size_of_raw_data);
            put(&mut data, offset + 20, section.pointer_to_raw_data);
            put(&mut data, offset + 36, section.characteristics);

            let start = section.pointer_to_raw_data as usize;
            let end = start + section.size_of_raw_data as usize;
            for (position, byte) in data[start..end].iter_mut().enumerate() {
                *byte = match &section.content {
                    Some(content) => content.get(position).copied().unwrap_or(0),
                    None => ((start + position) % 255) as u8 + 1,
                };
            }
        }

        if let Some(size) = self.file_size {
            data.resize(size, 0);
        }
        data
    }

    fn write_optional_header(
        &self,
        data: &mut [u8],
        offset: usize,
        size_of_image: u32,
        directories: &[(u32, u32); 16],
    ) {
        put(data, offset, if self.is_64bit { 0x020B_u16 } else { 0x010B_u16 });
        put(data, offset + 4, 0x200_u32);
        put(data, offset + 16, 0x1000_u32);
        put(data, offset + 20, 0x1000_u32);
        if self.is_64bit {
            put(data, offset + 24, self.image_base);
        } else {
            put(data, offset + 28, self.image_base as u32);
        }
        put(data, offset + 32, self.section_alignment);
        put(data, offset + 36, self.file_alignment);
        put(data, offset + 40, 6_u16);
        put(data, offset + 48, 6_u16);
        put(data, offset + 56, size_of_image);
        put(data, offset + 60, self.size_of_headers);
        put(data, offset + 68, 3_u16);
        put(data, offset + 70, self.dll_characteristics);

        let (count_offset, directory_offset) = if self.is_64bit {
            put(data, offset + 72, 0x10_0000_u64);
            put(data, offset + 80, 0x1000_u64);
            put(data, offset + 88, 0x10_0000_u64);
            put(data, offset + 96, 0x1000_u64);
            (offset + 108, offset + 112)
        } else {
            put(data, offset + 72, 0x10_0000_u32);
            put(data, offset + 76, 0x1000_u32);
            put(data, offset + 80, 0x10_0000_u32);
            put(data, offset + 84, 0x1000_u32);
            (offset + 92, offset + 96)
        };
        put(data, count_offset, self.number_of_rva_and_sizes);

        for (index, (virtual_address, size)) in directories.iter().enumerate() {
            put(data, directory_offset + index * 8, *virtual_address);
            put(data, directory_offset + index * 8 + 4, *size);
        }
    }

    fn relocation_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        for (rva, entries) in &self.relocations {
            blob.extend_from_slice(&rva.to_le_bytes());
            blob.extend_from_slice(&(8 + 2 * entries.len() as u32).to_le_bytes());
            for entry in entries {
                blob.extend_from_slice(&entry.to_le_bytes());
            }
        }
        blob
    }
}

fn put<T: PeIO>(data: &mut [u8], offset: usize, value: T) {
    let mut offset = offset;
    write_le_at(data, &mut offset, value).unwrap();
}

fn align(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}
