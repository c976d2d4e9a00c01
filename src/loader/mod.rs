//! The Windows NT compatible image loader.
//!
//! [`ImageLoader`] reproduces what `NtCreateSection(SEC_IMAGE)` and the memory manager do with a
//! PE file: the headers are captured and validated with the same rules, and the file is turned
//! into a page-granular virtual image with the same alignment, zero-padding and cut-file
//! behavior. Consumers then read the image by RVA and see exactly what a running process sees.
//!
//! # Architecture
//!
//! Loading runs in fixed stages, each implemented in its own submodule:
//!
//! 1. **Header capture** (`headers`) - DOS header, NT signature, file header and the optional
//!    header normalized to one layout
//! 2. **Section capture** (`sections`) - section table, long names, layout checks
//! 3. **Mapping** (`mapper`) - builds the [`Page`] table, or falls back to the raw file
//! 4. **Access** (`access`) - RVA reads and writes, strings, RVA and file offset translation
//! 5. **Relocation** (`relocate`) and **mutation** (`mutate`) - optional edits afterwards
//!
//! Structural problems do not abort the load. They are latched as a [`LoaderError`] and the
//! loader decides from it whether the image would be mapped by Windows at all.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pemapper::{ImageLoader, LoaderConfig, WindowsVersion};
//!
//! let mut loader = ImageLoader::new(LoaderConfig::new(WindowsVersion::Win10));
//! loader.load_file("sample.exe")?;
//!
//! if let Some(error) = loader.loader_error() {
//!     println!("{}: {}", error.name(), error.description());
//! }
//!
//! let mut entry = [0u8; 16];
//! let read = loader.read_image(loader.entry_point(), &mut entry);
//! println!("{read} bytes at the entry point: {:02x?}", &entry[..read]);
//! # Ok::<(), pemapper::Error>(())
//! ```

mod access;
mod compare;
mod config;
mod headers;
mod mapper;
mod mutate;
mod page;
mod relocate;
mod sections;
mod status;

pub use compare::ImageCompare;
pub use config::{LoaderConfig, WindowsVersion};
pub use page::Page;
pub use relocate::RelocationType;
pub use status::{LoaderError, LoaderStatus};

use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use log::debug;

use crate::{
    file::{Backend, Physical},
    pe::{
        DataDirectoryType, DosHeader, FileHeader, OptionalHeader, PageProtection, SectionHeader,
        OFFSET_DATA_DIRECTORY32, OFFSET_DATA_DIRECTORY64, OFFSET_NUMBER_OF_RVA32,
        OFFSET_NUMBER_OF_RVA64, PAGE_SIZE, SECTOR_SIZE, SIZEOF_DATA_DIRECTORY, SIZEOF_DOS_HEADER,
        SIZEOF_FILE_HEADER, SIZEOF_NT_SIGNATURE, SIZEOF_OPTIONAL_HEADER32,
        SIZEOF_OPTIONAL_HEADER64,
    },
    utils::{align_to_size, to_u32},
    Error, Result,
};

/// Header fields whose file offset within the NT headers can be queried.
///
/// Offsets are relative to `e_lfanew` and depend on the image bitness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderField {
    /// Size of the optional header structure itself (224 or 240)
    OptionalHeaderSize,
    /// `OptionalHeader.NumberOfRvaAndSizes`
    NumberOfRvaAndSizes,
    /// Start of `OptionalHeader.DataDirectory`
    DataDirectory,
    /// RVA of the export directory entry
    ExportDirectoryRva,
    /// RVA of the resource directory entry
    ResourceDirectoryRva,
    /// RVA of the load configuration directory entry
    LoadConfigDirectoryRva,
}

/// Contents of the loaded image.
#[derive(Debug, Default)]
enum ImageData {
    /// Nothing loaded, or headers only
    #[default]
    Unmapped,
    /// Page table built the way Windows maps the image
    Mapped(Vec<Page>),
    /// Mapping was refused or failed; RVAs are translated to offsets in the file
    Raw(Vec<u8>),
}

/// Loads a PE file the way the Windows NT loader maps it into memory.
///
/// One loader holds one image. Every `load*` call starts from a clean state, keeping only the
/// [`LoaderConfig`].
#[derive(Debug, Default)]
pub struct ImageLoader {
    config: LoaderConfig,
    status: LoaderStatus,
    dos_header: DosHeader,
    nt_signature: u32,
    file_header: FileHeader,
    optional_header: OptionalHeader,
    sections: Vec<SectionHeader>,
    image: ImageData,
    real_number_of_rva_and_sizes: u32,
    checksum_file_offset: u32,
    security_dir_file_offset: u32,
}

impl ImageLoader {
    /// Create an empty loader emulating the given Windows version.
    #[must_use]
    pub fn new(config: LoaderConfig) -> ImageLoader {
        ImageLoader {
            config,
            ..Default::default()
        }
    }

    /// Load and map an image from an owned file buffer.
    ///
    /// Structural problems are latched and available through [`ImageLoader::loader_error`];
    /// only inputs that cannot be a PE file at all fail.
    ///
    /// # Errors
    /// - [`crate::Error::InvalidFile`] if the DOS header, `e_lfanew` or the NT signature are bad
    /// - [`crate::Error::FileTooBig`] if the buffer exceeds 4 GB
    /// - [`crate::Error::NotEnoughSpace`] if the page table cannot be allocated
    pub fn load(&mut self, data: Vec<u8>) -> Result<()> {
        self.load_data(data, false)
    }

    /// Capture headers and sections without mapping the image.
    ///
    /// # Errors
    /// Same as [`ImageLoader::load`], except for allocation failures of the page table.
    pub fn load_headers(&mut self, data: Vec<u8>) -> Result<()> {
        self.load_data(data, true)
    }

    /// Load an image from any [`crate::file::Backend`].
    ///
    /// The DOS header is verified in place, so non-PE inputs are rejected before the backend
    /// data is copied.
    ///
    /// # Errors
    /// Same as [`ImageLoader::load`]; copying the backend data can fail with
    /// [`crate::Error::NotEnoughSpace`].
    pub fn load_backend(&mut self, backend: &dyn Backend) -> Result<()> {
        self.reset();

        if SIZEOF_DOS_HEADER >= backend.len() {
            return Err(Error::InvalidFile);
        }
        let header = backend.data_slice(0, SIZEOF_DOS_HEADER)?;
        self.verify_dos_header(&DosHeader::read(header)?, backend.len() as u64)?;

        self.load(backend.to_vec()?)
    }

    /// Memory-map a file from disk and load it.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened, and everything
    /// [`ImageLoader::load`] returns.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let physical = Physical::new(path)?;
        self.load_backend(&physical)
    }

    /// Load an image embedded in a stream at `offset`.
    ///
    /// The DOS header is verified before the remaining data is read, so large non-PE inputs are
    /// rejected without reading them.
    ///
    /// # Errors
    /// - [`crate::Error::InvalidFile`] if `offset` is past the end or the DOS header is bad
    /// - [`crate::Error::FileTooBig`] if more than 4 GB follow `offset`
    /// - [`crate::Error::NotEnoughSpace`] if the buffer cannot be allocated or the read is short
    /// - [`crate::Error::FileError`] on I/O errors while seeking or reading
    pub fn load_reader<R: Read + Seek>(&mut self, mut reader: R, offset: u64) -> Result<()> {
        self.reset();

        let file_size = reader.seek(SeekFrom::End(0))?;
        if offset > file_size {
            return Err(Error::InvalidFile);
        }

        let size = file_size - offset;
        if size > u64::from(u32::MAX) {
            self.status.set(LoaderError::FileTooBig);
            return Err(Error::FileTooBig);
        }

        if SIZEOF_DOS_HEADER as u64 >= size {
            return Err(Error::InvalidFile);
        }

        let mut header = [0u8; SIZEOF_DOS_HEADER];
        reader.seek(SeekFrom::Start(offset))?;
        reader
            .read_exact(&mut header)
            .map_err(|_| Error::InvalidFile)?;
        self.verify_dos_header(&DosHeader::read(&header)?, size)?;

        // Bounded by the 4 GB check above
        let size = size as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::NotEnoughSpace)?;

        reader.seek(SeekFrom::Start(offset))?;
        reader.take(size as u64).read_to_end(&mut data)?;
        if data.len() < size {
            return Err(Error::NotEnoughSpace);
        }

        self.load(data)
    }

    fn load_data(&mut self, mut data: Vec<u8>, headers_only: bool) -> Result<()> {
        self.reset();

        if to_u32(data.len()).is_err() {
            self.status.set(LoaderError::FileTooBig);
            return Err(Error::FileTooBig);
        }

        self.capture_dos_header(&data)?;
        self.capture_nt_headers(&data)?;
        self.capture_section_headers(&mut data);

        if headers_only {
            return Ok(());
        }

        let mut pages = Vec::new();
        if self.status.is_loadable() || self.is_flat_mismatch() {
            pages = self.capture_image_sections(&data)?;
        }

        if pages.is_empty() {
            debug!("Image not mapped, serving reads from the raw file");
            self.image = ImageData::Raw(data);
        } else {
            self.image = ImageData::Mapped(pages);
        }

        Ok(())
    }

    /// Single-subsection images map flat, so a section geometry mismatch does not stop mapping.
    fn is_flat_mismatch(&self) -> bool {
        self.is_single_subsection()
            && self.status.get() == Some(LoaderError::SectionSizeMismatch)
    }

    fn reset(&mut self) {
        *self = ImageLoader::new(self.config);
    }

    /// The configuration this loader was created with
    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// The first structural problem recorded during the last load
    #[must_use]
    pub fn loader_error(&self) -> Option<LoaderError> {
        self.status.get()
    }

    /// `true` when Windows would map the image: no error, or a cut file that still loads
    #[must_use]
    pub fn is_image_loadable(&self) -> bool {
        self.status.is_loadable()
    }

    /// `true` when the image is loadable and a page table was built
    #[must_use]
    pub fn is_image_mapped_ok(&self) -> bool {
        self.is_image_loadable() && self.page_count() != 0
    }

    /// `true` for images with `SectionAlignment` below the page size, mapped as one unit
    #[must_use]
    pub fn is_single_subsection(&self) -> bool {
        self.optional_header.section_alignment < PAGE_SIZE
    }

    /// Number of pages in the mapped image, zero when not mapped
    #[must_use]
    pub fn page_count(&self) -> usize {
        match &self.image {
            ImageData::Mapped(pages) => pages.len(),
            ImageData::Unmapped | ImageData::Raw(_) => 0,
        }
    }

    /// The page at `index` of the mapped image
    #[must_use]
    pub fn page(&self, index: usize) -> Option<&Page> {
        match &self.image {
            ImageData::Mapped(pages) => pages.get(index),
            ImageData::Unmapped | ImageData::Raw(_) => None,
        }
    }

    /// The captured DOS header
    #[must_use]
    pub fn dos_header(&self) -> &DosHeader {
        &self.dos_header
    }

    /// The captured COFF file header
    #[must_use]
    pub fn file_header(&self) -> &FileHeader {
        &self.file_header
    }

    /// The normalized optional header
    #[must_use]
    pub fn optional_header(&self) -> &OptionalHeader {
        &self.optional_header
    }

    /// The captured section headers in table order
    #[must_use]
    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// The section header at `index`
    #[must_use]
    pub fn section_header(&self, index: usize) -> Option<&SectionHeader> {
        self.sections.get(index)
    }

    /// Number of captured section headers
    #[must_use]
    pub fn number_of_sections(&self) -> usize {
        self.sections.len()
    }

    /// The NT signature as read from the file
    #[must_use]
    pub fn nt_signature(&self) -> u32 {
        self.nt_signature
    }

    /// `IMAGE_FILE_HEADER.Machine`
    #[must_use]
    pub fn machine(&self) -> u16 {
        self.file_header.machine
    }

    /// `OptionalHeader.ImageBase`
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.optional_header.image_base
    }

    /// `OptionalHeader.AddressOfEntryPoint`
    #[must_use]
    pub fn entry_point(&self) -> u32 {
        self.optional_header.address_of_entry_point
    }

    /// `OptionalHeader.SizeOfHeaders`
    #[must_use]
    pub fn size_of_headers(&self) -> u32 {
        self.optional_header.size_of_headers
    }

    /// `OptionalHeader.SizeOfImage`
    #[must_use]
    pub fn size_of_image(&self) -> u32 {
        self.optional_header.size_of_image
    }

    /// `SizeOfImage` rounded up to whole pages
    #[must_use]
    pub fn size_of_image_aligned(&self) -> u32 {
        align_to_size(self.optional_header.size_of_image, PAGE_SIZE)
    }

    /// `OptionalHeader.SectionAlignment`
    #[must_use]
    pub fn section_alignment(&self) -> u32 {
        self.optional_header.section_alignment
    }

    /// `OptionalHeader.FileAlignment`
    #[must_use]
    pub fn file_alignment(&self) -> u32 {
        self.optional_header.file_alignment
    }

    /// RVA of the data directory entry `index`, zero when out of range
    #[must_use]
    pub fn data_dir_rva(&self, index: usize) -> u32 {
        self.optional_header
            .directory(index)
            .map_or(0, |dir| dir.virtual_address)
    }

    /// Size of the data directory entry `index`, zero when out of range
    #[must_use]
    pub fn data_dir_size(&self, index: usize) -> u32 {
        self.optional_header.directory(index).map_or(0, |dir| dir.size)
    }

    /// `NumberOfRvaAndSizes`, capped at 16
    #[must_use]
    pub fn number_of_rva_and_sizes(&self) -> u32 {
        self.optional_header.number_of_rva_and_sizes
    }

    /// Number of directory entries that are actually present in the file
    #[must_use]
    pub fn real_number_of_rva_and_sizes(&self) -> u32 {
        self.real_number_of_rva_and_sizes
    }

    /// File offset of `OptionalHeader.CheckSum`
    #[must_use]
    pub fn checksum_file_offset(&self) -> u32 {
        self.checksum_file_offset
    }

    /// File offset of the security (certificate) directory entry
    #[must_use]
    pub fn security_dir_file_offset(&self) -> u32 {
        self.security_dir_file_offset
    }

    /// 64 for PE32+ images, 32 otherwise
    #[must_use]
    pub fn image_bitability(&self) -> u32 {
        if self.optional_header.is_64bit() {
            64
        } else {
            32
        }
    }

    /// Size of a pointer in the image, in bytes
    #[must_use]
    pub fn pointer_size(&self) -> u32 {
        self.image_bitability() / 8
    }

    /// Bit that marks an import by ordinal in a thunk of this image
    #[must_use]
    pub fn ordinal_mask(&self) -> u64 {
        if self.image_bitability() == 64 {
            1 << 63
        } else {
            1 << 31
        }
    }

    /// Offset of a header field relative to `e_lfanew`
    #[must_use]
    pub fn field_offset(&self, field: HeaderField) -> u32 {
        let is_64bit = self.image_bitability() == 64;
        let nt_prefix = SIZEOF_NT_SIGNATURE + SIZEOF_FILE_HEADER;
        let directories = nt_prefix
            + if is_64bit {
                OFFSET_DATA_DIRECTORY64
            } else {
                OFFSET_DATA_DIRECTORY32
            };

        let offset = match field {
            HeaderField::OptionalHeaderSize => {
                if is_64bit {
                    SIZEOF_OPTIONAL_HEADER64
                } else {
                    SIZEOF_OPTIONAL_HEADER32
                }
            }
            HeaderField::NumberOfRvaAndSizes => {
                nt_prefix
                    + if is_64bit {
                        OFFSET_NUMBER_OF_RVA64
                    } else {
                        OFFSET_NUMBER_OF_RVA32
                    }
            }
            HeaderField::DataDirectory => directories,
            HeaderField::ExportDirectoryRva => {
                directories + DataDirectoryType::Export as usize * SIZEOF_DATA_DIRECTORY
            }
            HeaderField::ResourceDirectoryRva => {
                directories + DataDirectoryType::Resource as usize * SIZEOF_DATA_DIRECTORY
            }
            HeaderField::LoadConfigDirectoryRva => {
                directories + DataDirectoryType::LoadConfig as usize * SIZEOF_DATA_DIRECTORY
            }
        };

        // All offsets are below 0x200
        offset as u32
    }

    /// `PointerToRawData` of section `index` as the memory manager uses it.
    ///
    /// Section-granular images round the pointer down to the sector size.
    #[must_use]
    pub fn real_pointer_to_raw_data(&self, index: usize) -> Option<u32> {
        let section = self.sections.get(index)?;
        if self.is_single_subsection() {
            Some(section.pointer_to_raw_data)
        } else {
            Some(section.pointer_to_raw_data & !(SECTOR_SIZE - 1))
        }
    }

    /// Page protection for the given section characteristics
    #[must_use]
    pub fn image_protection(&self, characteristics: u32) -> PageProtection {
        PageProtection::from_characteristics(characteristics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::PeBuilder;
    use std::io::Cursor;

    #[test]
    fn load_minimal_image() {
        let data = PeBuilder::pe64().build();
        let mut loader = ImageLoader::default();
        loader.load(data).unwrap();

        assert_eq!(loader.loader_error(), None);
        assert!(loader.is_image_mapped_ok());
        assert_eq!(loader.page_count(), 2);
        assert_eq!(loader.image_bitability(), 64);
        assert_eq!(loader.pointer_size(), 8);
        assert_eq!(loader.ordinal_mask(), 1 << 63);
        assert_eq!(loader.number_of_sections(), 1);
        assert_eq!(loader.section_header(0).unwrap().name(), ".text");
        assert_eq!(loader.nt_signature(), crate::pe::NT_SIGNATURE);
    }

    #[test]
    fn load_headers_only() {
        let data = PeBuilder::pe32().build();
        let mut loader = ImageLoader::default();
        loader.load_headers(data).unwrap();

        assert_eq!(loader.page_count(), 0);
        assert_eq!(loader.number_of_sections(), 1);
        assert_eq!(loader.image_bitability(), 32);
        assert_eq!(loader.ordinal_mask(), 1 << 31);

        let mut buffer = [0u8; 4];
        assert_eq!(loader.read_image(0, &mut buffer), 0);
    }

    #[test]
    fn load_rejects_short_file() {
        let mut loader = ImageLoader::default();
        assert!(matches!(
            loader.load(b"MZ".to_vec()),
            Err(Error::InvalidFile)
        ));
        assert_eq!(loader.page_count(), 0);
    }

    #[test]
    fn load_resets_previous_state() {
        let mut loader = ImageLoader::default();
        loader.load(PeBuilder::pe64().build()).unwrap();
        assert_eq!(loader.page_count(), 2);

        assert!(loader.load(vec![0u8; 32]).is_err());
        assert_eq!(loader.page_count(), 0);
        assert_eq!(loader.number_of_sections(), 0);
    }

    #[test]
    fn load_reader_with_offset() {
        let mut data = vec![0xCC_u8; 0x30];
        data.extend(PeBuilder::pe64().build());

        let mut loader = ImageLoader::default();
        loader.load_reader(Cursor::new(data.clone()), 0x30).unwrap();
        assert!(loader.is_image_mapped_ok());
        assert_eq!(loader.page_count(), 2);

        assert!(matches!(
            loader.load_reader(Cursor::new(data.clone()), 0x10000),
            Err(Error::InvalidFile)
        ));
        assert!(matches!(
            loader.load_reader(Cursor::new(data), 0),
            Err(Error::InvalidFile)
        ));
    }

    /// Stream that reports `len` bytes of zeros without holding them
    struct SparseReader {
        len: u64,
        position: u64,
    }

    impl Read for SparseReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let left = self.len.saturating_sub(self.position);
            let count = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
            buf[..count].fill(0);
            self.position += count as u64;
            Ok(count)
        }
    }

    impl Seek for SparseReader {
        fn seek(&mut self, position: SeekFrom) -> std::io::Result<u64> {
            self.position = match position {
                SeekFrom::Start(offset) => offset,
                SeekFrom::End(delta) => self.len.wrapping_add_signed(delta),
                SeekFrom::Current(delta) => self.position.wrapping_add_signed(delta),
            };
            Ok(self.position)
        }
    }

    #[test]
    fn load_reader_file_too_big() {
        let reader = SparseReader {
            len: 0x1_0000_1000,
            position: 0,
        };
        let mut loader = ImageLoader::default();
        assert!(matches!(
            loader.load_reader(reader, 0),
            Err(Error::FileTooBig)
        ));
        assert_eq!(loader.loader_error(), Some(LoaderError::FileTooBig));

        // What follows the offset fits into 4 GB, but it is not a PE file
        let reader = SparseReader {
            len: 0x1_0000_1000,
            position: 0,
        };
        assert!(matches!(
            loader.load_reader(reader, 0x2000),
            Err(Error::InvalidFile)
        ));
        assert_eq!(loader.loader_error(), None);
    }

    #[test]
    fn load_backend_checks_dos_header_first() {
        let mut loader = ImageLoader::default();
        loader
            .load_backend(&crate::file::Memory::new(PeBuilder::pe32().build()))
            .unwrap();
        assert_eq!(loader.page_count(), 2);

        let mut data = PeBuilder::pe32().build();
        data[0x3C..0x40].copy_from_slice(&0x81_u32.to_le_bytes());
        assert!(matches!(
            loader.load_backend(&crate::file::Memory::new(data)),
            Err(Error::InvalidFile)
        ));
        assert_eq!(loader.loader_error(), Some(LoaderError::ELfanewUnaligned));
        assert_eq!(loader.page_count(), 0);

        assert!(matches!(
            loader.load_backend(&crate::file::Memory::new(vec![b'M', b'Z'])),
            Err(Error::InvalidFile)
        ));
    }

    #[test]
    fn field_offsets() {
        let mut loader = ImageLoader::default();
        loader.load_headers(PeBuilder::pe32().build()).unwrap();
        assert_eq!(loader.field_offset(HeaderField::OptionalHeaderSize), 224);
        assert_eq!(loader.field_offset(HeaderField::NumberOfRvaAndSizes), 116);
        assert_eq!(loader.field_offset(HeaderField::DataDirectory), 120);
        assert_eq!(loader.field_offset(HeaderField::ResourceDirectoryRva), 136);

        loader.load_headers(PeBuilder::pe64().build()).unwrap();
        assert_eq!(loader.field_offset(HeaderField::OptionalHeaderSize), 240);
        assert_eq!(loader.field_offset(HeaderField::ExportDirectoryRva), 136);
        assert_eq!(loader.field_offset(HeaderField::LoadConfigDirectoryRva), 216);
    }

    #[test]
    fn real_pointer_to_raw_data_is_sector_aligned() {
        let data = PeBuilder::pe64().raw_pointer(0x410).build();
        let mut loader = ImageLoader::default();
        loader.load_headers(data).unwrap();

        assert_eq!(loader.real_pointer_to_raw_data(0), Some(0x400));
        assert_eq!(loader.real_pointer_to_raw_data(1), None);
    }
}
