//! Comparison of the mapped image against an image mapped by Windows.
//!
//! The reference image is a copy of the memory of a process (or a section view) in which
//! Windows mapped the same file. Because inaccessible pages cannot be copied out of a process,
//! the caller reports page accessibility of the reference through a callback.

use std::path::Path;

use log::debug;

use crate::{
    loader::{ImageLoader, Page},
    pe::{PAGE_SIZE, SIZEOF_FILE_HEADER, SIZEOF_NT_SIGNATURE, SIZEOF_SECTION_HEADER},
    Result,
};

/// Offset of `PointerToRawData` within `IMAGE_SECTION_HEADER`
const OFFSET_POINTER_TO_RAW_DATA: u32 = 0x14;

/// Result of [`ImageLoader::compare_with_mapped_image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageCompare {
    /// Both images are identical, or neither side mapped the file
    Equal,
    /// Only one side mapped the image
    NotMapped {
        /// `true` when Windows mapped the file and the loader did not
        by_windows: bool,
    },
    /// The reference image does not have the page-aligned `SizeOfImage` of the loaded image
    ImageSizeMismatch,
    /// The reference page at `rva` is accessible, the mapped page is not
    PageNotAccessible {
        /// Start of the page
        rva: u32,
    },
    /// The mapped page at `rva` is accessible, the reference page is not
    PageShouldNotBeAccessible {
        /// Start of the page
        rva: u32,
    },
    /// First byte that differs
    DataMismatch {
        /// RVA of the differing byte
        rva: u32,
    },
}

impl ImageLoader {
    /// Compare the mapped pages with `image`, a copy of the same file mapped by Windows.
    ///
    /// `image` is `None` when Windows refused to map the file. `is_page_accessible` is called
    /// with the RVA of every page and reports whether that page of the reference is accessible.
    ///
    /// Differences in the `PointerToRawData` field of sections without raw data are ignored;
    /// Windows sometimes zeroes it.
    pub fn compare_with_mapped_image(
        &self,
        image: Option<&[u8]>,
        mut is_page_accessible: impl FnMut(u32) -> bool,
    ) -> ImageCompare {
        let mapped_ok = self.is_image_mapped_ok();

        match image {
            Some(image) if mapped_ok => {
                if image.len() != self.size_of_image_aligned() as usize {
                    return ImageCompare::ImageSizeMismatch;
                }

                let mut page_buffer = [0u8; PAGE_SIZE as usize];
                for (index, reference) in image.chunks(PAGE_SIZE as usize).enumerate() {
                    let rva = index as u32 * PAGE_SIZE;
                    let reference_good = is_page_accessible(rva);
                    let mapped_good = self.is_good_mapped_page(rva);

                    if reference_good && mapped_good {
                        let read = self.read_image(rva, &mut page_buffer[..reference.len()]);
                        let mismatch = self.mismatch_offset(reference, &page_buffer[..read], rva);
                        if let Some(offset) = mismatch {
                            debug!("Mapped image differs at RVA {:#x}", rva + offset);
                            return ImageCompare::DataMismatch { rva: rva + offset };
                        }
                    } else if reference_good {
                        return ImageCompare::PageNotAccessible { rva };
                    } else if mapped_good {
                        return ImageCompare::PageShouldNotBeAccessible { rva };
                    }
                }

                ImageCompare::Equal
            }
            Some(_) => ImageCompare::NotMapped { by_windows: true },
            None if mapped_ok => ImageCompare::NotMapped { by_windows: false },
            None => ImageCompare::Equal,
        }
    }

    /// Offset of the first relevant difference within one page at `rva`
    fn mismatch_offset(&self, reference: &[u8], mapped: &[u8], rva: u32) -> Option<u32> {
        let file_offset = self.file_offset_from_rva(rva);

        reference
            .iter()
            .zip(mapped)
            .enumerate()
            .filter(|(_, (left, right))| left != right)
            .map(|(offset, _)| offset as u32)
            .find(|&offset| {
                !file_offset.is_some_and(|base| {
                    self.is_section_pointer_to_raw_data(base.wrapping_add(offset))
                })
            })
    }

    /// `true` when `file_offset` is inside `PointerToRawData` of a section header whose
    /// `SizeOfRawData` is zero
    fn is_section_pointer_to_raw_data(&self, file_offset: u32) -> bool {
        let table = self
            .dos_header
            .e_lfanew
            .wrapping_add((SIZEOF_NT_SIGNATURE + SIZEOF_FILE_HEADER) as u32)
            .wrapping_add(u32::from(self.file_header.size_of_optional_header));

        self.sections
            .iter()
            .enumerate()
            .filter(|(_, section)| section.size_of_raw_data == 0)
            .any(|(index, _)| {
                let field = table
                    .wrapping_add(index as u32 * SIZEOF_SECTION_HEADER as u32)
                    .wrapping_add(OFFSET_POINTER_TO_RAW_DATA);
                (field..field.wrapping_add(4)).contains(&file_offset)
            })
    }

    /// Write the mapped image to `path`, one page after another. Pages without data are
    /// written as zeros.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be written.
    pub fn dump_image(&self, path: impl AsRef<Path>) -> Result<usize> {
        let pages = (0..self.page_count()).filter_map(|index| self.page(index));

        let mut dump = Vec::with_capacity(self.page_count() * PAGE_SIZE as usize);
        for page in pages {
            match page {
                Page::Data(data) => dump.extend_from_slice(data),
                Page::Zero | Page::Inaccessible => {
                    dump.resize(dump.len() + PAGE_SIZE as usize, 0);
                }
            }
        }

        std::fs::write(path, &dump)?;
        Ok(dump.len())
    }
}
