//! Capture of the section table and the `MiCreateImageFileMap` layout checks.

use log::trace;

use crate::{
    loader::{ImageLoader, LoaderError},
    pe::{
        SectionHeader, PAGE_SIZE, SIZEOF_COFF_SYMBOL, SIZEOF_FILE_HEADER, SIZEOF_MAX_NAME,
        SIZEOF_NT_SIGNATURE, SIZEOF_SECTION_HEADER, SIZEOF_SHORT_NAME,
    },
    utils::{align_to_size, bytes_to_pages},
};

/// Offset of `PointerToRawData` within a section header
const OFFSET_POINTER_TO_RAW_DATA: usize = 20;

impl ImageLoader {
    /// Reads the section table and validates the section layout against `SizeOfImage`.
    ///
    /// With the Borland fix active, `PointerToRawData` of sections without raw data is zeroed
    /// in `data` itself so the mapped header page matches what Windows produces. The captured
    /// headers keep the original value.
    pub(crate) fn capture_section_headers(&mut self, data: &mut [u8]) {
        let file_size = data.len() as u64;
        let header = &self.optional_header;
        let size_of_headers = header.size_of_headers;
        let size_of_image = header.size_of_image;
        let section_alignment = header.section_alignment;
        let file_alignment_mask = header.file_alignment.wrapping_sub(1);
        let single_subsection = self.is_single_subsection();

        let mut offset = u64::from(self.dos_header.e_lfanew)
            + (SIZEOF_NT_SIGNATURE + SIZEOF_FILE_HEADER) as u64
            + u64::from(self.file_header.size_of_optional_header);
        if offset > file_size {
            self.status.set(LoaderError::SectionHeadersOutOfImage);
            return;
        }

        let mut next_va: u64 = 0;
        let mut image_ptes = bytes_to_pages(size_of_image);

        if single_subsection {
            let image_pages = align_to_size(size_of_image, PAGE_SIZE) / PAGE_SIZE;
            image_ptes = image_ptes.wrapping_sub(image_pages);
        } else {
            if size_of_headers
                .wrapping_add(section_alignment - 1)
                < size_of_headers
            {
                self.status.set(LoaderError::SectionHeadersOverflow);
            }

            let header_ptes = align_to_size(size_of_headers, section_alignment) / PAGE_SIZE;
            if header_ptes > image_ptes {
                self.status.set(LoaderError::SizeOfHeadersInvalid);
            }

            next_va += u64::from(header_ptes) * u64::from(PAGE_SIZE);
            image_ptes = image_ptes.wrapping_sub(header_ptes);
        }

        let count = usize::from(self.file_header.number_of_sections);
        let mut beyond_eof = false;

        for index in 0..count {
            if offset + SIZEOF_SECTION_HEADER as u64 > file_size {
                break;
            }

            let header_offset = offset as usize;
            let Ok(mut section) = SectionHeader::read(data, header_offset) else {
                break;
            };

            if self.config.borland_fix()
                && section.pointer_to_raw_data != 0
                && section.size_of_raw_data == 0
            {
                let field = header_offset + OFFSET_POINTER_TO_RAW_DATA;
                data[field..field + 4].fill(0);
            }

            let raw_size = section.size_of_raw_data;
            let pointer = if raw_size != 0 {
                section.pointer_to_raw_data
            } else {
                0
            };
            let end_of_raw = pointer.wrapping_add(raw_size);
            let virtual_size = if section.virtual_size != 0 {
                section.virtual_size
            } else {
                raw_size
            };

            if end_of_raw < pointer {
                self.status.set(LoaderError::RawDataOverflow);
            }

            if single_subsection {
                // Flat mapping: memory layout must equal file layout
                if section.virtual_address != pointer || raw_size < virtual_size {
                    self.status.set(LoaderError::SectionSizeMismatch);
                }
            } else {
                if next_va != u64::from(section.virtual_address) {
                    self.status.set(LoaderError::InvalidSectionVa);
                }

                if next_va + u64::from(virtual_size) <= next_va {
                    self.status.set(LoaderError::InvalidSectionVSize);
                }
                if virtual_size.wrapping_add(PAGE_SIZE - 1) <= virtual_size {
                    self.status.set(LoaderError::InvalidSectionVSize);
                }

                let section_ptes = align_to_size(virtual_size, section_alignment) / PAGE_SIZE;
                if section_ptes > image_ptes {
                    self.status.set(LoaderError::InvalidSectionVSize);
                }
                image_ptes = image_ptes.wrapping_sub(section_ptes);

                let aligned_end =
                    pointer.wrapping_add(raw_size).wrapping_add(file_alignment_mask)
                        & !file_alignment_mask;
                if aligned_end < pointer {
                    self.status.set(LoaderError::InvalidSectionRawSize);
                }

                if index == count - 1
                    && raw_size != 0
                    && u64::from(section.pointer_to_raw_data.wrapping_add(raw_size)) > file_size
                {
                    self.status.set(LoaderError::FileIsCut);
                }

                next_va += u64::from(section_ptes) * u64::from(PAGE_SIZE);
            }

            if pointer != 0 && u64::from(end_of_raw) > file_size {
                beyond_eof = true;
            }

            section.section_name = self.capture_section_name(data, &section.name);
            trace!(
                "Section {index} '{}': va {:#x}, vsize {:#x}, raw {:#x}+{:#x}",
                section.section_name,
                section.virtual_address,
                section.virtual_size,
                section.pointer_to_raw_data,
                section.size_of_raw_data
            );

            self.sections.push(section);
            offset += SIZEOF_SECTION_HEADER as u64;
        }

        if self.config.size_of_image_must_match() {
            let threshold = if single_subsection {
                1
            } else {
                section_alignment / PAGE_SIZE
            };
            if image_ptes >= threshold {
                self.status.set(LoaderError::InvalidSizeOfImage);
            }
        }

        if beyond_eof {
            if single_subsection || self.last_section_within_file(file_size) {
                self.status.set(LoaderError::FileIsCutLoadable);
            } else {
                self.status.set(LoaderError::FileIsCut);
            }
        }
    }

    /// Only the last section decides whether a cut file still loads.
    fn last_section_within_file(&self, file_size: u64) -> bool {
        self.sections.last().is_some_and(|last| {
            let raw_size = last.size_of_raw_data;
            let pointer = if raw_size != 0 {
                last.pointer_to_raw_data
            } else {
                0
            };
            raw_size == 0 || u64::from(pointer.wrapping_add(raw_size)) <= file_size
        })
    }

    /// Resolves `/nnn` names through the COFF string table, else drops the zero bytes.
    fn capture_section_name(&self, data: &[u8], name: &[u8; SIZEOF_SHORT_NAME]) -> String {
        let symbol_table = self.file_header.pointer_to_symbol_table;

        if symbol_table != 0 && name[0] == b'/' {
            let string_table = symbol_table.wrapping_add(
                self.file_header
                    .number_of_symbols
                    .wrapping_mul(SIZEOF_COFF_SYMBOL),
            );
            let index = name[1..]
                .iter()
                .take_while(|byte| byte.is_ascii_digit())
                .fold(0u32, |acc, &digit| {
                    acc.wrapping_mul(10).wrapping_add(u32::from(digit - b'0'))
                });

            let resolved = Self::read_string_raw(
                data,
                string_table.wrapping_add(index) as usize,
                SIZEOF_MAX_NAME,
                true,
                true,
            );
            if !resolved.is_empty() {
                return resolved;
            }
        }

        let bytes: Vec<u8> = name.iter().copied().filter(|&byte| byte != 0).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Read a zero-terminated string directly from a file buffer.
    ///
    /// At most `max_length` bytes are considered. Without a terminator in that window the
    /// string is cut there, or rejected when `must_not_be_too_long` is set. With
    /// `must_be_printable`, any byte outside `0x20..=0x7E` rejects the whole string. Rejected
    /// and out-of-range reads return an empty string.
    #[must_use]
    pub fn read_string_raw(
        data: &[u8],
        offset: usize,
        max_length: usize,
        must_be_printable: bool,
        must_not_be_too_long: bool,
    ) -> String {
        let Some(tail) = data.get(offset..) else {
            return String::new();
        };
        let window = &tail[..tail.len().min(max_length)];

        let string = match window.iter().position(|&byte| byte == 0) {
            Some(end) => &window[..end],
            None if must_not_be_too_long => return String::new(),
            None => window,
        };

        if must_be_printable && !string.iter().all(|byte| (0x20..=0x7E).contains(byte)) {
            return String::new();
        }

        String::from_utf8_lossy(string).into_owned()
    }
}
