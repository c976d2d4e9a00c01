//! Builds the page table of the mapped image.
//!
//! Section-granular images (`SectionAlignment >= PAGE_SIZE`) are mapped header first, then
//! section by section at their virtual addresses. Single-subsection images are mapped flat,
//! the file laid over the image one to one with full access.

use log::{debug, trace};

use crate::{
    loader::{ImageLoader, LoaderError, Page},
    pe::{PageProtection, SectionCharacteristics, PAGE_SIZE, SECTOR_SIZE},
    utils::align_to_size,
    Error, Result,
};

impl ImageLoader {
    /// Maps the captured image into pages.
    ///
    /// Returns an empty table when a section could not be placed; the caller then serves the
    /// image from the raw file.
    ///
    /// # Errors
    /// - [`crate::Error::InvalidFile`] if the header region cannot be mapped
    /// - [`crate::Error::NotEnoughSpace`] if the page table cannot be allocated
    pub(crate) fn capture_image_sections(&mut self, data: &[u8]) -> Result<Vec<Page>> {
        let size_of_image = self.optional_header.size_of_image;
        let section_alignment = self.optional_header.section_alignment;

        if self.is_single_subsection() {
            let mut image_size = align_to_size(size_of_image, self.config.ssi_image_alignment32());
            if self.config.is_64bit_windows() {
                image_size = align_to_size(image_size, PAGE_SIZE);
            }
            image_size = image_size.max(PAGE_SIZE);

            let mut pages = Self::allocate_pages(image_size.div_ceil(PAGE_SIZE))?;
            let flags = SectionCharacteristics::MEM_WRITE
                | SectionCharacteristics::MEM_READ
                | SectionCharacteristics::MEM_EXECUTE;

            let mapping = SectionMapping {
                virtual_address: 0,
                virtual_size: image_size,
                pointer_to_raw_data: 0,
                size_of_raw_data: image_size,
                characteristics: flags.bits(),
                is_header: true,
            };
            if self.capture_image_section(data, &mut pages, &mapping)? == 0 {
                return Err(Error::InvalidFile);
            }

            return Ok(pages);
        }

        let mut pages = Self::allocate_pages(align_to_size(size_of_image, PAGE_SIZE) / PAGE_SIZE)?;

        // Windows XP maps the header up to SectionAlignment unless the section table fits
        // into the first page
        let mut size_of_headers = self.optional_header.size_of_headers;
        if self.config.header_size_check() && self.section_table_exceeds_header_page() {
            size_of_headers = align_to_size(size_of_headers, section_alignment);
        }

        let header = SectionMapping {
            virtual_address: 0,
            virtual_size: size_of_headers,
            pointer_to_raw_data: 0,
            size_of_raw_data: size_of_headers,
            characteristics: SectionCharacteristics::MEM_READ.bits(),
            is_header: true,
        };
        let header_end = self.capture_image_section(data, &mut pages, &header)?;
        if header_end == 0 {
            return Err(Error::InvalidFile);
        }

        if self.sections.is_empty() {
            // Without sections the header must span the image
            if header_end > size_of_image || size_of_image - header_end > section_alignment {
                self.status.set(LoaderError::InvalidSizeOfImage);
            }
            return Ok(pages);
        }

        for index in 0..self.sections.len() {
            let section = &self.sections[index];
            let mapping = SectionMapping {
                virtual_address: section.virtual_address,
                virtual_size: section.virtual_size,
                pointer_to_raw_data: section.pointer_to_raw_data,
                size_of_raw_data: section.size_of_raw_data,
                characteristics: section.characteristics,
                is_header: false,
            };

            if self.capture_image_section(data, &mut pages, &mapping)? == 0 {
                debug!("Section {index} cannot be placed in the image, mapping abandoned");
                self.status.set(LoaderError::InvalidSectionVa);
                return Ok(Vec::new());
            }
        }

        Ok(pages)
    }

    fn allocate_pages(count: u32) -> Result<Vec<Page>> {
        let count = count as usize;
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(count)
            .map_err(|_| Error::NotEnoughSpace)?;
        pages.resize(count, Page::Inaccessible);
        Ok(pages)
    }

    /// Maps one section and returns the RVA where the next one should begin, zero on failure.
    ///
    /// Pages backed by the file become [`Page::Data`], the remainder of the virtual size
    /// becomes [`Page::Zero`]. Padding up to `SectionAlignment` stays inaccessible.
    fn capture_image_section(
        &self,
        data: &[u8],
        pages: &mut [Page],
        mapping: &SectionMapping,
    ) -> Result<u32> {
        let file_size = data.len();
        let file_alignment = self.optional_header.file_alignment;
        let section_alignment = self.optional_header.section_alignment;

        let mut virtual_size = if mapping.virtual_size != 0 {
            mapping.virtual_size
        } else {
            mapping.size_of_raw_data
        };
        virtual_size = align_to_size(virtual_size, PAGE_SIZE);
        let size_of_raw_data = mapping.size_of_raw_data.min(virtual_size);

        let initialized_size = align_to_size(size_of_raw_data, PAGE_SIZE);
        let valid_size = align_to_size(virtual_size, PAGE_SIZE);
        let section_size = align_to_size(virtual_size, section_alignment);

        // The memory manager addresses raw data in whole sectors
        let mut raw_ptr = (mapping.pointer_to_raw_data & !(SECTOR_SIZE - 1)) as usize;
        let raw_end = if mapping.is_header {
            raw_ptr + size_of_raw_data as usize
        } else {
            align_to_size(
                mapping
                    .pointer_to_raw_data
                    .wrapping_add(size_of_raw_data),
                file_alignment,
            ) as usize
        };

        trace!(
            "Mapping {:#x}+{:#x}: {:#x} initialized, {:#x} valid",
            mapping.virtual_address,
            virtual_size,
            initialized_size,
            valid_size
        );

        let mut page_index = (mapping.virtual_address / PAGE_SIZE) as usize;
        let mut page_offset = 0;

        if PageProtection::from_characteristics(mapping.characteristics) != PageProtection::NoAccess
        {
            if mapping.pointer_to_raw_data != 0 || mapping.is_header {
                while page_offset < initialized_size {
                    let Some(page) = pages.get_mut(page_index) else {
                        return Ok(0);
                    };

                    *page = if raw_ptr < file_size {
                        let available = (file_size - raw_ptr)
                            .min(PAGE_SIZE as usize)
                            .min(raw_end.saturating_sub(raw_ptr));
                        Page::from_bytes(&data[raw_ptr..raw_ptr + available])?
                    } else {
                        Page::Zero
                    };

                    raw_ptr += PAGE_SIZE as usize;
                    page_offset += PAGE_SIZE;
                    page_index += 1;
                }
            }

            while page_offset < valid_size {
                let Some(page) = pages.get_mut(page_index) else {
                    return Ok(0);
                };

                *page = Page::Zero;
                page_offset += PAGE_SIZE;
                page_index += 1;
            }
        }

        Ok(mapping.virtual_address.wrapping_add(section_size))
    }
}

/// One region to place into the page table
struct SectionMapping {
    virtual_address: u32,
    virtual_size: u32,
    pointer_to_raw_data: u32,
    size_of_raw_data: u32,
    characteristics: u32,
    is_header: bool,
}

#[cfg(test)]
mod tests {
    use crate::{
        loader::{ImageLoader, LoaderConfig, LoaderError, Page, WindowsVersion},
        test::{PeBuilder, SectionSpec},
    };

    fn map(config: LoaderConfig, data: Vec<u8>) -> ImageLoader {
        let mut loader = ImageLoader::new(config);
        loader.load(data).unwrap();
        loader
    }

    #[test]
    fn header_and_section_pages() {
        let data = PeBuilder::pe64().build();
        let loader = map(LoaderConfig::default(), data.clone());

        assert_eq!(loader.page_count(), 2);
        let header = loader.page(0).unwrap().data().unwrap();
        assert_eq!(&header[..0x400], &data[..0x400]);
        assert!(header[0x400..].iter().all(|&b| b == 0));

        let text = loader.page(1).unwrap().data().unwrap();
        assert_eq!(&text[..0x200], &data[0x400..0x600]);
        assert!(text[0x200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn virtual_tail_is_zero_and_padding_inaccessible() {
        let data = PeBuilder::pe32()
            .section_alignment(0x2000)
            .size_of_image(0x6000)
            .sections(vec![SectionSpec::new(*b".data\0\0\0", 0x2000, 0x2800, 0x400, 0x200)])
            .build();
        let loader = map(LoaderConfig::default(), data);
        assert_eq!(loader.loader_error(), None);

        assert_eq!(loader.page_count(), 6);
        assert!(loader.page(0).unwrap().data().is_some());
        assert_eq!(loader.page(1), Some(&Page::Inaccessible));
        assert!(loader.page(2).unwrap().data().is_some());
        assert_eq!(loader.page(3), Some(&Page::Zero));
        assert_eq!(loader.page(4), Some(&Page::Zero));
        assert_eq!(loader.page(5), Some(&Page::Inaccessible));
    }

    #[test]
    fn no_access_section_stays_inaccessible() {
        let data = PeBuilder::pe32()
            .size_of_image(0x3000)
            .sections(vec![
                SectionSpec::new(*b".text\0\0\0", 0x1000, 0x50, 0x400, 0x200),
                SectionSpec::new(*b".none\0\0\0", 0x2000, 0x50, 0x600, 0x200).characteristics(0),
            ])
            .build();
        let loader = map(LoaderConfig::default(), data);
        assert_eq!(loader.page(2), Some(&Page::Inaccessible));
    }

    #[test]
    fn flat_mapping_for_single_subsection() {
        let data = PeBuilder::pe32()
            .section_alignment(0x200)
            .file_alignment(0x200)
            .size_of_image(0x600)
            .sections(vec![SectionSpec::new(*b".text\0\0\0", 0x400, 0x200, 0x400, 0x200)])
            .build();
        let loader = map(LoaderConfig::new(WindowsVersion::Win10), data.clone());
        assert_eq!(loader.loader_error(), None);
        assert_eq!(loader.page_count(), 1);

        let page = loader.page(0).unwrap().data().unwrap();
        assert_eq!(&page[..0x600], &data[..0x600]);
    }

    #[test]
    fn flat_mapping_despite_size_mismatch() {
        let data = PeBuilder::pe32()
            .section_alignment(0x200)
            .file_alignment(0x200)
            .size_of_image(0x600)
            .sections(vec![SectionSpec::new(*b".text\0\0\0", 0x400, 0x300, 0x400, 0x200)])
            .build();
        let loader = map(LoaderConfig::default(), data);
        assert_eq!(loader.loader_error(), Some(LoaderError::SectionSizeMismatch));
        assert!(!loader.is_image_mapped_ok());
        assert_eq!(loader.page_count(), 1);
    }

    #[test]
    fn unloadable_image_is_served_raw() {
        let data = PeBuilder::pe32()
            .size_of_image(0x2000)
            .sections(vec![SectionSpec::new(*b".text\0\0\0", 0x1000, 0x3000, 0x400, 0x200)])
            .build();
        let loader = map(LoaderConfig::default(), data);

        assert_eq!(loader.loader_error(), Some(LoaderError::InvalidSectionVSize));
        assert_eq!(loader.page_count(), 0);

        let mut signature = [0u8; 2];
        assert_eq!(loader.read_image(0, &mut signature), 2);
        assert_eq!(&signature, b"MZ");
    }

    #[test]
    fn xp_maps_whole_header_when_table_leaves_first_page() {
        let mut data = PeBuilder::pe32()
            .e_lfanew(0x7F0)
            .size_of_headers(0xA00)
            .sections(vec![SectionSpec::new(*b".text\0\0\0", 0x1000, 0x50, 0x1000, 0x200)])
            .build();
        data[0xC00] = 0xAB;

        let loader = map(LoaderConfig::new(WindowsVersion::Xp), data.clone());
        assert_eq!(loader.loader_error(), None);
        let header = loader.page(0).unwrap().data().unwrap();
        assert_eq!(header[0xC00], 0xAB);

        let loader = map(LoaderConfig::new(WindowsVersion::Win7), data);
        assert_eq!(loader.loader_error(), None);
        let header = loader.page(0).unwrap().data().unwrap();
        assert_eq!(header[0xC00], 0);
    }
}
