//! Capture and validation of the DOS, file and optional headers.
//!
//! The checks follow `MiVerifyImageHeader` and its predecessors. Only a missing `MZ` or `PE`
//! signature and a bad `e_lfanew` abort the load; everything else is latched into the
//! [`crate::loader::LoaderStatus`] and capture continues with whatever could be read.

use log::trace;

use crate::{
    file::io::read_le_at,
    loader::{ImageLoader, LoaderError},
    pe::{
        machine, DataDirectoryType, DllCharacteristics, DosHeader, FileCharacteristics,
        FileHeader, OptionalHeader, DOS_SIGNATURE, NT_SIGNATURE, OFFSET_CHECKSUM,
        OFFSET_DATA_DIRECTORY32, OFFSET_DATA_DIRECTORY64, OPTIONAL_HDR32_MAGIC,
        OPTIONAL_HDR64_MAGIC, PAGE_SIZE, SIZEOF_DATA_DIRECTORY, SIZEOF_DOS_HEADER,
        SIZEOF_FILE_HEADER, SIZEOF_NT_SIGNATURE, SIZEOF_OPTIONAL_HEADER32,
        SIZEOF_OPTIONAL_HEADER64, SIZEOF_SECTION_HEADER, SIZE_64KB, SIZE_OF_LARGEST_IMAGE,
    },
    utils::bytes_to_pages,
    Error, Result,
};

impl ImageLoader {
    pub(crate) fn capture_dos_header(&mut self, data: &[u8]) -> Result<()> {
        if SIZEOF_DOS_HEADER >= data.len() {
            return Err(Error::InvalidFile);
        }

        let header = DosHeader::read(data)?;
        self.verify_dos_header(&header, data.len() as u64)?;
        self.dos_header = header;
        Ok(())
    }

    /// `MZ` and a 4-aligned `e_lfanew` inside the file, else the input is not a PE file.
    pub(crate) fn verify_dos_header(&mut self, header: &DosHeader, file_size: u64) -> Result<()> {
        if header.e_magic != DOS_SIGNATURE {
            return Err(Error::InvalidFile);
        }

        if header.e_lfanew & 3 != 0 {
            self.status.set(LoaderError::ELfanewUnaligned);
            return Err(Error::InvalidFile);
        }

        if u64::from(header.e_lfanew) > file_size {
            self.status.set(LoaderError::ELfanewOutOfFile);
            return Err(Error::InvalidFile);
        }

        Ok(())
    }

    pub(crate) fn capture_nt_headers(&mut self, data: &[u8]) -> Result<()> {
        let e_lfanew = self.dos_header.e_lfanew;
        let file_size = data.len() as u64;

        // Windows 7 and newer want a complete 32-bit NT header in the file
        if self.config.nt_headers_size_check() {
            let min_size = u64::from(e_lfanew)
                + (SIZEOF_NT_SIGNATURE + SIZEOF_FILE_HEADER + SIZEOF_OPTIONAL_HEADER32) as u64;
            if min_size > file_size {
                self.status.set(LoaderError::NtHeaderOutOfFile);
                return Ok(());
            }
        }

        let mut offset = e_lfanew as usize;
        if offset + SIZEOF_NT_SIGNATURE >= data.len() {
            self.status.set(LoaderError::NtHeaderOutOfFile);
            return Err(Error::InvalidFile);
        }

        self.nt_signature = read_le_at(data, &mut offset)?;
        if self.nt_signature != NT_SIGNATURE {
            self.status.set(LoaderError::NoNtSignature);
            return Err(Error::InvalidFile);
        }

        if offset + SIZEOF_FILE_HEADER < data.len() {
            self.file_header = FileHeader::read(data, offset)?;
        } else {
            self.status.set(LoaderError::NtHeaderOutOfFile);
        }

        if self.file_header.machine == 0 && self.file_header.size_of_optional_header == 0 {
            self.status.set(LoaderError::FileHeaderInvalid);
        }
        if !self
            .file_header
            .flags()
            .contains(FileCharacteristics::EXECUTABLE_IMAGE)
        {
            self.status.set(LoaderError::ImageNonExecutable);
        }
        offset += SIZEOF_FILE_HEADER;

        if u32::from(self.file_header.number_of_sections) > self.config.max_sections() {
            self.status.set(LoaderError::ImageNonExecutable);
        }

        if nt_headers_end(e_lfanew, self.file_header.size_of_optional_header).is_none() {
            self.status.set(LoaderError::NtHeaderOffsetOverflow);
        }

        // The optional header layout follows its magic, not SizeOfOptionalHeader
        let mut magic = OPTIONAL_HDR32_MAGIC;
        if offset + 2 < data.len() {
            let mut magic_offset = offset;
            magic = read_le_at(data, &mut magic_offset)?;
        }
        self.capture_optional_header(data, offset, magic == OPTIONAL_HDR64_MAGIC)?;

        self.verify_optional_header();
        Ok(())
    }

    /// Copies as much of the optional header as the file holds and normalizes it.
    fn capture_optional_header(&mut self, data: &[u8], offset: usize, is_64bit: bool) -> Result<()> {
        let (struct_size, directory_offset) = if is_64bit {
            (SIZEOF_OPTIONAL_HEADER64, OFFSET_DATA_DIRECTORY64)
        } else {
            (SIZEOF_OPTIONAL_HEADER32, OFFSET_DATA_DIRECTORY32)
        };

        // SizeOfOptionalHeader is ignored; the loader assumes the full structure is present
        let mut buffer = [0u8; SIZEOF_OPTIONAL_HEADER64];
        let available = data.len().saturating_sub(offset).min(struct_size);
        if let Some(source) = data.get(offset..offset + available) {
            buffer[..available].copy_from_slice(source);
        }

        let header = if is_64bit {
            OptionalHeader::read64(&buffer)?
        } else {
            OptionalHeader::read32(&buffer)?
        };

        if is_64bit && header.magic != OPTIONAL_HDR64_MAGIC {
            self.status.set(LoaderError::NoOptHdrMagic);
            return Ok(());
        }
        if !is_64bit && header.magic != OPTIONAL_HDR32_MAGIC {
            self.status.set(LoaderError::NoOptHdrMagic);
        }

        // Directory entries cut by the end of the file still count when partially present
        let mut real_count = header.number_of_rva_and_sizes as usize;
        let directories = offset + directory_offset;
        if directories < data.len() && directories + real_count * SIZEOF_DATA_DIRECTORY > data.len()
        {
            real_count = (data.len() - directories).div_ceil(SIZEOF_DATA_DIRECTORY);
        }

        trace!(
            "Optional header: magic {:#x}, {} of {} directories in file",
            header.magic,
            real_count,
            header.number_of_rva_and_sizes
        );

        self.real_number_of_rva_and_sizes = real_count as u32;
        self.checksum_file_offset = (offset + OFFSET_CHECKSUM) as u32;
        self.security_dir_file_offset = (directories
            + DataDirectoryType::Security as usize * SIZEOF_DATA_DIRECTORY)
            as u32;
        self.optional_header = header;
        Ok(())
    }

    /// The `MiVerifyImageHeader` cascade over the normalized optional header.
    fn verify_optional_header(&mut self) {
        let header = &self.optional_header;
        let file_alignment = header.file_alignment;
        let section_alignment = header.section_alignment;
        let mut errors = Vec::new();

        if self.config.app_container_check() && self.is_bad_app_container() {
            errors.push(LoaderError::ImageNonExecutable);
        }
        if section_alignment >= PAGE_SIZE && header.size_of_headers == 0 {
            errors.push(LoaderError::SizeOfHeadersZero);
        }
        if file_alignment == 0 {
            errors.push(LoaderError::FileAlignmentZero);
        }
        if file_alignment & file_alignment.wrapping_sub(1) != 0 {
            errors.push(LoaderError::FileAlignmentNotPow2);
        }
        if section_alignment == 0 {
            errors.push(LoaderError::SectionAlignmentZero);
        }
        if section_alignment & section_alignment.wrapping_sub(1) != 0 {
            errors.push(LoaderError::SectionAlignmentNotPow2);
        }
        if section_alignment < file_alignment {
            errors.push(LoaderError::SectionAlignmentTooSmall);
        }
        // Sub-sector file alignment is only valid for images mapped as one subsection
        if file_alignment & 511 != 0 && section_alignment != file_alignment {
            errors.push(LoaderError::SectionAlignmentInvalid);
        }
        if header.size_of_image > SIZE_OF_LARGEST_IMAGE {
            errors.push(LoaderError::SizeOfImageTooBig);
        }
        if header.magic == OPTIONAL_HDR32_MAGIC && !self.is_valid_32bit_machine() {
            errors.push(LoaderError::InvalidMachine32);
        }
        if header.magic == OPTIONAL_HDR64_MAGIC && !self.is_valid_64bit_machine() {
            errors.push(LoaderError::InvalidMachine64);
        }
        if header.size_of_headers > header.size_of_image {
            errors.push(LoaderError::SizeOfHeadersInvalid);
        }
        if self.config.is_64bit_windows() && self.file_header.size_of_optional_header & 7 != 0 {
            errors.push(LoaderError::SizeOfOptHdrNotAligned);
        }
        if bytes_to_pages(header.size_of_image) == 0 {
            errors.push(LoaderError::SizeOfImageZero);
        }
        if header.image_base & (SIZE_64KB - 1) != 0 {
            errors.push(LoaderError::ImageBaseNotAligned);
        }

        for error in errors {
            self.status.set(error);
        }
    }

    /// `MiIsLegacyImageArchitecture`
    fn is_legacy_architecture(&self) -> bool {
        matches!(self.file_header.machine, machine::I386 | machine::AMD64)
    }

    fn is_valid_32bit_machine(&self) -> bool {
        match self.file_header.machine {
            machine::I386 => true,
            machine::ARMNT => self.config.load_arm_images(),
            _ => false,
        }
    }

    fn is_valid_64bit_machine(&self) -> bool {
        match self.file_header.machine {
            machine::AMD64 | machine::IA64 => true,
            machine::ARM64 => self.config.load_arm_images(),
            _ => false,
        }
    }

    /// x86 and x64 AppContainer images must be relocatable.
    pub(crate) fn is_bad_app_container(&self) -> bool {
        self.is_legacy_architecture()
            && self
                .optional_header
                .dll_flags()
                .contains(DllCharacteristics::APPCONTAINER)
            && self
                .file_header
                .flags()
                .contains(FileCharacteristics::RELOCS_STRIPPED)
    }

    /// The Windows XP `MiCreateImageFileMap` test whether the section table ends inside the
    /// first page. When it does not, XP maps the whole header page.
    pub(crate) fn section_table_exceeds_header_page(&self) -> bool {
        let e_lfanew = self.dos_header.e_lfanew;
        let offset_to_section_table = (SIZEOF_NT_SIGNATURE + SIZEOF_FILE_HEADER) as u32
            + u32::from(self.file_header.size_of_optional_header);
        let table_size = (u32::from(self.file_header.number_of_sections) + 1)
            * SIZEOF_SECTION_HEADER as u32;
        let nt_header_size = PAGE_SIZE.wrapping_sub(e_lfanew);

        e_lfanew
            .wrapping_add(offset_to_section_table)
            .wrapping_add(table_size)
            > nt_header_size
    }
}

/// End of the NT headers as declared by the file header, `None` past 4 GB.
fn nt_headers_end(e_lfanew: u32, size_of_optional_header: u16) -> Option<u32> {
    let nt_header_size =
        (SIZEOF_NT_SIGNATURE + SIZEOF_FILE_HEADER) as u32 + u32::from(size_of_optional_header);
    e_lfanew.checked_add(nt_header_size)
}
