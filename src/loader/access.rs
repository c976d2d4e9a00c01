//! Reading and writing the loaded image by RVA.
//!
//! A mapped image is accessed page by page; zero and inaccessible pages read as zeros. When the
//! image could not be mapped, RVAs are translated to file offsets through the section table and
//! served from the retained file buffer instead. Nothing here fails: out-of-range requests
//! transfer fewer bytes, or none.

use widestring::U16Str;

use crate::{
    loader::{ImageData, ImageLoader, Page},
    pe::{SectionHeader, PAGE_SIZE, SECTOR_SIZE},
    utils::align_to_size,
};

impl ImageLoader {
    /// Copy image bytes at `rva` into `buffer`, returning how many bytes were read.
    ///
    /// Reads of a mapped image stop at `SizeOfImage` rounded up to whole pages.
    pub fn read_image(&self, rva: u32, buffer: &mut [u8]) -> usize {
        match &self.image {
            ImageData::Mapped(pages) => {
                let (start, end) = self.image_range(rva, buffer.len());
                let mut done = 0;
                for_each_page_chunk(start, end, |index, offset, count| {
                    let Some(page) = pages.get(index) else {
                        return false;
                    };
                    page.read(offset, &mut buffer[done..done + count]);
                    done += count;
                    true
                });
                done
            }
            ImageData::Raw(_) => self.read_image_file(rva, buffer),
            ImageData::Unmapped => 0,
        }
    }

    /// Write `buffer` into the image at `rva`, returning how many bytes were consumed.
    ///
    /// Writing to a zero page turns it into a data page. Bytes aimed at inaccessible pages are
    /// counted but dropped.
    pub fn write_image(&mut self, rva: u32, buffer: &[u8]) -> usize {
        let (start, end) = self.image_range(rva, buffer.len());
        let file_offset = self.file_offset_from_rva(rva);

        match &mut self.image {
            ImageData::Mapped(pages) => {
                let mut done = 0;
                for_each_page_chunk(start, end, |index, offset, count| {
                    let Some(page) = pages.get_mut(index) else {
                        return false;
                    };
                    page.write(offset, &buffer[done..done + count]);
                    done += count;
                    true
                });
                done
            }
            ImageData::Raw(data) => {
                let Some(offset) = file_offset.map(|offset| offset as usize) else {
                    return 0;
                };
                if offset > data.len() {
                    return 0;
                }
                let count = buffer.len().min(data.len() - offset);
                data[offset..offset + count].copy_from_slice(&buffer[..count]);
                count
            }
            ImageData::Unmapped => 0,
        }
    }

    /// Read through the RVA to file offset translation from the retained file buffer.
    ///
    /// Only available when the image fell back to raw access; returns 0 otherwise.
    pub fn read_image_file(&self, rva: u32, buffer: &mut [u8]) -> usize {
        let ImageData::Raw(data) = &self.image else {
            return 0;
        };
        let Some(offset) = self.file_offset_from_rva(rva).map(|offset| offset as usize) else {
            return 0;
        };
        if offset > data.len() {
            return 0;
        }

        let count = buffer.len().min(data.len() - offset);
        buffer[..count].copy_from_slice(&data[offset..offset + count]);
        count
    }

    /// Length of the zero-terminated string at `rva`, at most `max_length`.
    ///
    /// A zero or inaccessible page terminates the string.
    #[must_use]
    pub fn string_length(&self, rva: u32, max_length: u32) -> u32 {
        match &self.image {
            ImageData::Mapped(pages) => {
                let (start, end) = self.image_range(rva, max_length as usize);
                let mut length = 0u64;

                for_each_page_chunk(start, end, |index, offset, count| {
                    let Some(data) = pages.get(index).and_then(Page::data) else {
                        return false;
                    };
                    match data[offset..offset + count].iter().position(|&b| b == 0) {
                        Some(position) => {
                            length += position as u64;
                            false
                        }
                        None => {
                            length += count as u64;
                            true
                        }
                    }
                });

                length as u32
            }
            ImageData::Raw(data) => {
                let Some(offset) = self.file_offset_from_rva(rva).map(|o| o as usize) else {
                    return 0;
                };
                let Some(tail) = data.get(offset..) else {
                    return 0;
                };
                let window = &tail[..tail.len().min(max_length as usize)];
                window
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(window.len()) as u32
            }
            ImageData::Unmapped => 0,
        }
    }

    /// Read the zero-terminated string at `rva`, lossily decoded.
    #[must_use]
    pub fn read_string(&self, rva: u32, max_length: u32) -> String {
        let length = self.string_length(rva, max_length) as usize;
        let mut buffer = vec![0u8; length];
        let read = self.read_image(rva, &mut buffer);
        String::from_utf8_lossy(&buffer[..read]).into_owned()
    }

    /// Read a pointer of the image's bitness at `rva`.
    ///
    /// Returns `None` unless the whole pointer could be read.
    #[must_use]
    pub fn read_pointer(&self, rva: u32) -> Option<u64> {
        if self.image_bitability() == 64 {
            let mut bytes = [0u8; 8];
            (self.read_image(rva, &mut bytes) == bytes.len()).then(|| u64::from_le_bytes(bytes))
        } else {
            let mut bytes = [0u8; 4];
            (self.read_image(rva, &mut bytes) == bytes.len())
                .then(|| u64::from(u32::from_le_bytes(bytes)))
        }
    }

    /// Read a resource-style string: a `u16` character count followed by UTF-16 units.
    ///
    /// Characters beyond the end of the image are dropped; invalid surrogates are replaced.
    #[must_use]
    pub fn read_string_rc(&self, rva: u32) -> String {
        let mut length = [0u8; 2];
        self.read_image(rva, &mut length);
        let length = usize::from(u16::from_le_bytes(length));

        let mut bytes = vec![0u8; length * 2];
        let read = self.read_image(rva.wrapping_add(2), &mut bytes);

        let units: Vec<u16> = bytes[..read]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        U16Str::from_slice(&units).to_string_lossy()
    }

    /// File offset backing `rva`, using the section table the way the memory manager does.
    ///
    /// RVAs outside every section map one to one while below `SizeOfHeaders`; images without
    /// sections map every RVA one to one.
    #[must_use]
    pub fn file_offset_from_rva(&self, rva: u32) -> Option<u32> {
        if self.sections.is_empty() {
            return Some(rva);
        }

        for section in &self.sections {
            if section.pointer_to_raw_data == 0 || section.size_of_raw_data == 0 {
                continue;
            }

            let (real_pointer, start, virtual_size) = self.section_layout(section);
            if start <= rva && u64::from(rva) < u64::from(start) + u64::from(virtual_size) {
                return Some(real_pointer.wrapping_add(rva - start));
            }
        }

        (rva < self.optional_header.size_of_headers).then_some(rva)
    }

    /// RVA at which the byte at file `offset` is mapped, the inverse of
    /// [`ImageLoader::file_offset_from_rva`] over the raw data of each section.
    #[must_use]
    pub fn rva_from_file_offset(&self, offset: u32) -> Option<u32> {
        if self.sections.is_empty() {
            return Some(offset);
        }

        for section in &self.sections {
            if section.pointer_to_raw_data == 0 || section.size_of_raw_data == 0 {
                continue;
            }

            let (real_pointer, start, virtual_size) = self.section_layout(section);
            let extent = section.size_of_raw_data.min(virtual_size);
            if real_pointer <= offset
                && u64::from(offset) < u64::from(real_pointer) + u64::from(extent)
            {
                return Some(start.wrapping_add(offset - real_pointer));
            }
        }

        (offset < self.optional_header.size_of_headers).then_some(offset)
    }

    /// Effective raw pointer, aligned start RVA and extent of a section.
    fn section_layout(&self, section: &SectionHeader) -> (u32, u32, u32) {
        let section_alignment = self.optional_header.section_alignment;

        let mut real_pointer = section.pointer_to_raw_data;
        if section_alignment >= PAGE_SIZE {
            real_pointer &= !(SECTOR_SIZE - 1);
        }

        let start = if section_alignment != 0 {
            align_to_size(section.virtual_address, section_alignment)
        } else {
            section.virtual_address
        };

        let virtual_size = if section.virtual_size != 0 {
            section.virtual_size
        } else {
            section.size_of_raw_data
        };

        (real_pointer, start, virtual_size)
    }

    /// `true` when `[rva, rva + size)` lies inside `SizeOfImage`
    #[must_use]
    pub fn is_valid_image_block(&self, rva: u32, size: u32) -> bool {
        let size_of_image = self.optional_header.size_of_image;
        if rva >= size_of_image || size >= size_of_image {
            return false;
        }

        rva.checked_add(size)
            .is_some_and(|end| end <= size_of_image)
    }

    /// `true` when the page containing `rva` is mapped and accessible
    #[must_use]
    pub fn is_good_mapped_page(&self, rva: u32) -> bool {
        self.page((rva / PAGE_SIZE) as usize)
            .is_some_and(Page::is_accessible)
    }

    /// `true` when the page containing `rva` is a committed page of zeros
    #[must_use]
    pub fn is_zero_page(&self, rva: u32) -> bool {
        matches!(self.page((rva / PAGE_SIZE) as usize), Some(Page::Zero))
    }

    /// `[rva, rva + length)` clipped to the page-aligned image size
    fn image_range(&self, rva: u32, length: usize) -> (u64, u64) {
        let start = u64::from(rva);
        let end = (start + length as u64).min(u64::from(self.size_of_image_aligned()));
        (start, end.max(start))
    }
}

/// Splits `[start, end)` at page boundaries and calls `f(page_index, offset_in_page, count)`
/// until it returns `false`.
fn for_each_page_chunk(start: u64, end: u64, mut f: impl FnMut(usize, usize, usize) -> bool) {
    let page_size = u64::from(PAGE_SIZE);
    let mut cursor = start;

    while cursor < end {
        let offset = cursor % page_size;
        let count = (page_size - offset).min(end - cursor);
        if !f((cursor / page_size) as usize, offset as usize, count as usize) {
            break;
        }
        cursor += count;
    }
}
