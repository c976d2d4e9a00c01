//! Structural edits of the captured headers.
//!
//! These operate on the header copies held by the loader and never touch the page table. They
//! exist for tools that rebuild an image (unpackers, section injectors) and then serialize the
//! headers themselves; [`ImageLoader::make_valid`] recomputes the derived header fields afterwards.

use crate::{
    loader::{HeaderField, ImageLoader},
    pe::{
        machine, FileCharacteristics, SectionCharacteristics, SectionHeader,
        NUMBER_OF_DIRECTORY_ENTRIES, NT_SIGNATURE, OPTIONAL_HDR32_MAGIC, OPTIONAL_HDR64_MAGIC,
        PAGE_SIZE, SECTOR_SIZE, SIZEOF_FILE_HEADER, SIZEOF_NT_SIGNATURE, SIZEOF_SECTION_HEADER,
    },
    utils::align_to_size,
    Error, Result,
};

/// Characteristics given to sections created by [`ImageLoader::add_section`] and
/// [`ImageLoader::split_section`]
fn new_section_characteristics() -> u32 {
    (SectionCharacteristics::MEM_WRITE
        | SectionCharacteristics::MEM_READ
        | SectionCharacteristics::CNT_INITIALIZED_DATA
        | SectionCharacteristics::CNT_CODE)
        .bits()
}

impl ImageLoader {
    /// Set `FileHeader.PointerToSymbolTable`
    pub fn set_pointer_to_symbol_table(&mut self, pointer_to_symbol_table: u32) {
        self.file_header.pointer_to_symbol_table = pointer_to_symbol_table;
    }

    /// Set `FileHeader.Characteristics`
    pub fn set_characteristics(&mut self, characteristics: u16) {
        self.file_header.characteristics = characteristics;
    }

    /// Set `OptionalHeader.AddressOfEntryPoint`
    pub fn set_address_of_entry_point(&mut self, address_of_entry_point: u32) {
        self.optional_header.address_of_entry_point = address_of_entry_point;
    }

    /// Set `SizeOfCode` and `BaseOfCode`; `None` leaves a field unchanged.
    pub fn set_size_of_code(&mut self, size_of_code: Option<u32>, base_of_code: Option<u32>) {
        if let Some(size_of_code) = size_of_code {
            self.optional_header.size_of_code = size_of_code;
        }
        if let Some(base_of_code) = base_of_code {
            self.optional_header.base_of_code = base_of_code;
        }
    }

    /// Update data directory `index`, growing `NumberOfRvaAndSizes` to cover it.
    ///
    /// # Errors
    /// Returns [`crate::Error::EntryNotFound`] if `index` is 16 or more.
    pub fn set_data_directory(
        &mut self,
        index: usize,
        virtual_address: Option<u32>,
        size: Option<u32>,
    ) -> Result<()> {
        if index >= NUMBER_OF_DIRECTORY_ENTRIES {
            return Err(Error::EntryNotFound);
        }

        if index as u32 >= self.optional_header.number_of_rva_and_sizes {
            self.optional_header.number_of_rva_and_sizes = index as u32 + 1;
        }

        let directory = &mut self.optional_header.data_directory[index];
        if let Some(virtual_address) = virtual_address {
            directory.virtual_address = virtual_address;
        }
        if let Some(size) = size {
            directory.size = size;
        }
        Ok(())
    }

    /// Append a read/write section of `size` bytes after the last section in memory and file.
    ///
    /// # Errors
    /// - [`crate::Error::NoFileAlignment`] / [`crate::Error::NoSectionAlignment`] if an
    ///   alignment is zero
    /// - [`crate::Error::NotEnoughSpace`] if the section table is full
    pub fn add_section(&mut self, name: &str, size: u32) -> Result<&mut SectionHeader> {
        let file_alignment = self.optional_header.file_alignment;
        let section_alignment = self.optional_header.section_alignment;
        if file_alignment == 0 {
            return Err(Error::NoFileAlignment);
        }
        if section_alignment == 0 {
            return Err(Error::NoSectionAlignment);
        }
        if self.sections.len() >= usize::from(u16::MAX) {
            return Err(Error::NotEnoughSpace);
        }

        let (virtual_address, pointer_to_raw_data) = self.next_section_addresses();

        let mut section = SectionHeader {
            virtual_address,
            virtual_size: align_to_size(size, section_alignment),
            pointer_to_raw_data,
            size_of_raw_data: align_to_size(size, file_alignment),
            characteristics: new_section_characteristics(),
            ..Default::default()
        };
        section.set_name(name);

        self.sections.push(section);
        let index = self.sections.len() - 1;
        Ok(&mut self.sections[index])
    }

    /// First free RVA and file offset past every section and the headers
    fn next_section_addresses(&self) -> (u32, u32) {
        let size_of_headers = self.optional_header.size_of_headers;
        let (next_rva, next_raw) = self.sections.iter().fold(
            (size_of_headers, size_of_headers),
            |(rva, raw), section| {
                (
                    rva.max(section.virtual_address.wrapping_add(section.virtual_size)),
                    raw.max(
                        section
                            .pointer_to_raw_data
                            .wrapping_add(section.size_of_raw_data),
                    ),
                )
            },
        );

        (
            align_to_size(next_rva, self.optional_header.section_alignment),
            align_to_size(next_raw, self.optional_header.file_alignment),
        )
    }

    fn section_mut(&mut self, index: usize) -> Result<&mut SectionHeader> {
        self.sections.get_mut(index).ok_or(Error::EntryNotFound)
    }

    /// Rename section `index`
    ///
    /// # Errors
    /// Returns [`crate::Error::EntryNotFound`] if there is no such section.
    pub fn set_section_name(&mut self, index: usize, name: &str) -> Result<()> {
        self.section_mut(index)?.set_name(name);
        Ok(())
    }

    /// Update `VirtualAddress` and `VirtualSize` of section `index`; `None` keeps a field.
    ///
    /// # Errors
    /// Returns [`crate::Error::EntryNotFound`] if there is no such section.
    pub fn set_section_virtual_range(
        &mut self,
        index: usize,
        virtual_address: Option<u32>,
        virtual_size: Option<u32>,
    ) -> Result<()> {
        let section = self.section_mut(index)?;
        if let Some(virtual_address) = virtual_address {
            section.virtual_address = virtual_address;
        }
        if let Some(virtual_size) = virtual_size {
            section.virtual_size = virtual_size;
        }
        Ok(())
    }

    /// Update `PointerToRawData` and `SizeOfRawData` of section `index`; `None` keeps a field.
    ///
    /// # Errors
    /// Returns [`crate::Error::EntryNotFound`] if there is no such section.
    pub fn set_section_raw_data_range(
        &mut self,
        index: usize,
        pointer_to_raw_data: Option<u32>,
        size_of_raw_data: Option<u32>,
    ) -> Result<()> {
        let section = self.section_mut(index)?;
        if let Some(pointer_to_raw_data) = pointer_to_raw_data {
            section.pointer_to_raw_data = pointer_to_raw_data;
        }
        if let Some(size_of_raw_data) = size_of_raw_data {
            section.size_of_raw_data = size_of_raw_data;
        }
        Ok(())
    }

    /// Replace the characteristics of section `index`
    ///
    /// # Errors
    /// Returns [`crate::Error::EntryNotFound`] if there is no such section.
    pub fn set_section_characteristics(&mut self, index: usize, characteristics: u32) -> Result<()> {
        self.section_mut(index)?.characteristics = characteristics;
        Ok(())
    }

    /// Split section `index` at `split_offset` into `prev_name` and `next_name`.
    ///
    /// The second part starts `split_offset` bytes into the original section, in memory and in
    /// the file, and covers the rest of the original raw data.
    ///
    /// # Errors
    /// - [`crate::Error::NoFileAlignment`] / [`crate::Error::NoSectionAlignment`] if an
    ///   alignment is zero
    /// - [`crate::Error::EntryNotFound`] if there is no such section
    /// - [`crate::Error::NotEnoughSpace`] if `split_offset` is not section aligned or does not
    ///   lie inside the section
    pub fn split_section(
        &mut self,
        index: usize,
        prev_name: &str,
        next_name: &str,
        split_offset: u32,
    ) -> Result<()> {
        if self.optional_header.file_alignment == 0 {
            return Err(Error::NoFileAlignment);
        }
        let section_alignment = self.optional_header.section_alignment;
        if section_alignment == 0 {
            return Err(Error::NoSectionAlignment);
        }

        let original = self.sections.get(index).ok_or(Error::EntryNotFound)?.clone();
        if split_offset & (section_alignment - 1) != 0 || split_offset >= original.virtual_size {
            return Err(Error::NotEnoughSpace);
        }

        let remaining = original.size_of_raw_data.wrapping_sub(split_offset);

        let mut next = original.clone();
        next.set_name(next_name);
        next.pointer_to_raw_data = original.pointer_to_raw_data.wrapping_add(split_offset);
        next.size_of_raw_data = remaining;
        next.virtual_address = original.virtual_address.wrapping_add(split_offset);
        next.virtual_size = remaining;
        next.characteristics = new_section_characteristics();

        let first = &mut self.sections[index];
        first.set_name(prev_name);
        first.size_of_raw_data = split_offset;
        first.virtual_size = split_offset;

        self.sections.insert(index + 1, next);
        Ok(())
    }

    /// Grow the last section by `increment` bytes and extend `SizeOfImage` to its end.
    pub fn enlarge_last_section(&mut self, increment: u32) {
        let file_alignment = self.optional_header.file_alignment;
        if let Some(last) = self.sections.last_mut() {
            let size = align_to_size(last.size_of_raw_data.wrapping_add(increment), file_alignment);
            last.virtual_size = size;
            last.size_of_raw_data = size;
            self.optional_header.size_of_image = last.virtual_address.wrapping_add(size);
        }
    }

    /// Remove section `index`, moving later sections down in memory and file.
    ///
    /// # Errors
    /// Returns [`crate::Error::EntryNotFound`] if there is no such section.
    pub fn remove_section(&mut self, index: usize) -> Result<()> {
        let removed = self.sections.get(index).ok_or(Error::EntryNotFound)?;
        let virtual_diff = removed.virtual_size;
        let raw_diff = removed.size_of_raw_data;

        for section in &mut self.sections[index + 1..] {
            section.virtual_address = section.virtual_address.wrapping_sub(virtual_diff);
            section.pointer_to_raw_data = section.pointer_to_raw_data.wrapping_sub(raw_diff);
        }

        self.sections.remove(index);
        Ok(())
    }

    /// Recompute the derived header fields after structural edits.
    ///
    /// Fixes signature, machine, section count, optional header size and magic, rounds the
    /// alignments up to page and sector size, recomputes `SizeOfHeaders` and `SizeOfImage`, and
    /// moves all raw data when the header size changed.
    pub fn make_valid(&mut self) {
        let is_64bit = self.image_bitability() == 64;

        self.nt_signature = NT_SIGNATURE;

        let size_of_optional_header = self.field_offset(HeaderField::OptionalHeaderSize) as u16;
        let file_header = &mut self.file_header;
        file_header.machine = if is_64bit {
            machine::AMD64
        } else {
            machine::I386
        };
        file_header.number_of_sections = self.sections.len() as u16;
        file_header.size_of_optional_header = size_of_optional_header;
        if file_header.characteristics == 0 {
            file_header.characteristics = (FileCharacteristics::EXECUTABLE_IMAGE
                | FileCharacteristics::MACHINE_32BIT)
                .bits();
        }

        let header = &mut self.optional_header;
        header.magic = if is_64bit {
            OPTIONAL_HDR64_MAGIC
        } else {
            OPTIONAL_HDR32_MAGIC
        };
        header.number_of_rva_and_sizes = NUMBER_OF_DIRECTORY_ENTRIES as u32;

        header.section_alignment = match align_to_size(header.section_alignment, PAGE_SIZE) {
            0 => PAGE_SIZE,
            alignment => alignment,
        };
        header.file_alignment = match align_to_size(header.file_alignment, SECTOR_SIZE) {
            0 => SECTOR_SIZE,
            alignment => alignment,
        };

        let headers_end = self
            .dos_header
            .e_lfanew
            .wrapping_add((SIZEOF_NT_SIGNATURE + SIZEOF_FILE_HEADER) as u32)
            .wrapping_add(u32::from(self.file_header.size_of_optional_header))
            .wrapping_add(
                u32::from(self.file_header.number_of_sections)
                    .wrapping_mul(SIZEOF_SECTION_HEADER as u32),
            );
        let header = &mut self.optional_header;
        header.size_of_headers = align_to_size(headers_end, header.file_alignment);

        let section_alignment = header.section_alignment;
        let mut size_of_image = align_to_size(header.size_of_headers, section_alignment);
        let offset_diff = self.sections.first().map_or(0, |first| {
            header.size_of_headers.wrapping_sub(first.pointer_to_raw_data)
        });

        for section in &mut self.sections {
            size_of_image =
                size_of_image.wrapping_add(align_to_size(section.virtual_size, section_alignment));
            if offset_diff != 0 {
                section.pointer_to_raw_data = section.pointer_to_raw_data.wrapping_add(offset_diff);
            }
        }

        header.size_of_image = align_to_size(size_of_image, section_alignment);
    }
}
