//! The optional header, normalized across PE32 and PE32+.
//!
//! Both on-disk layouts decode into one [`OptionalHeader`] whose pointer-sized fields are
//! widened to `u64`. The loader always hands the decoders a zero-padded copy of the header,
//! so a header that is cut by the end of the file decodes with its missing tail as zeros.

use bitflags::bitflags;
use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::{
    file::io::read_le_at,
    pe::{
        NUMBER_OF_DIRECTORY_ENTRIES, OPTIONAL_HDR64_MAGIC, SIZEOF_OPTIONAL_HEADER32,
        SIZEOF_OPTIONAL_HEADER64,
    },
    Error::OutOfBounds,
    Result,
};

/// Offset of `ImageBase` within `IMAGE_OPTIONAL_HEADER32`
pub(crate) const OFFSET_IMAGE_BASE32: usize = 28;
/// Offset of `ImageBase` within `IMAGE_OPTIONAL_HEADER64`
pub(crate) const OFFSET_IMAGE_BASE64: usize = 24;
/// Offset of `CheckSum`, identical in both layouts
pub(crate) const OFFSET_CHECKSUM: usize = 64;
/// Offset of `NumberOfRvaAndSizes` within `IMAGE_OPTIONAL_HEADER32`
pub(crate) const OFFSET_NUMBER_OF_RVA32: usize = 92;
/// Offset of `NumberOfRvaAndSizes` within `IMAGE_OPTIONAL_HEADER64`
pub(crate) const OFFSET_NUMBER_OF_RVA64: usize = 108;
/// Offset of `DataDirectory` within `IMAGE_OPTIONAL_HEADER32`
pub(crate) const OFFSET_DATA_DIRECTORY32: usize = 96;
/// Offset of `DataDirectory` within `IMAGE_OPTIONAL_HEADER64`
pub(crate) const OFFSET_DATA_DIRECTORY64: usize = 112;

bitflags! {
    /// `IMAGE_DLLCHARACTERISTICS_*` flags of the optional header
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DllCharacteristics: u16 {
        /// Image can handle a high entropy 64-bit virtual address space
        const HIGH_ENTROPY_VA = 0x0020;
        /// DLL can be relocated at load time
        const DYNAMIC_BASE = 0x0040;
        /// Code integrity checks are enforced
        const FORCE_INTEGRITY = 0x0080;
        /// Image is NX compatible
        const NX_COMPAT = 0x0100;
        /// Isolation aware, but do not isolate the image
        const NO_ISOLATION = 0x0200;
        /// Does not use structured exception handling
        const NO_SEH = 0x0400;
        /// Do not bind the image
        const NO_BIND = 0x0800;
        /// Image must execute in an AppContainer
        const APPCONTAINER = 0x1000;
        /// A WDM driver
        const WDM_DRIVER = 0x2000;
        /// Image supports Control Flow Guard
        const GUARD_CF = 0x4000;
        /// Terminal Server aware
        const TERMINAL_SERVER_AWARE = 0x8000;
    }
}

/// Index of an entry in the data directory array
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr, IntoStaticStr,
)]
#[repr(usize)]
#[allow(missing_docs)]
pub enum DataDirectoryType {
    Export = 0,
    Import = 1,
    Resource = 2,
    Exception = 3,
    Security = 4,
    BaseReloc = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImport = 13,
    ComDescriptor = 14,
    Reserved = 15,
}

/// One `IMAGE_DATA_DIRECTORY` entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDirectory {
    /// RVA of the table
    pub virtual_address: u32,
    /// Size of the table in bytes
    pub size: u32,
}

/// `IMAGE_OPTIONAL_HEADER32` and `IMAGE_OPTIONAL_HEADER64` in one representation.
///
/// `base_of_data` only exists in PE32 and stays zero for PE32+. `number_of_rva_and_sizes` is
/// capped at 16 during capture; entries beyond that count are zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct OptionalHeader {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [DataDirectory; NUMBER_OF_DIRECTORY_ENTRIES],
}

impl OptionalHeader {
    /// Decode an `IMAGE_OPTIONAL_HEADER32` from a buffer of at least 224 bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer is too short.
    pub fn read32(data: &[u8]) -> Result<OptionalHeader> {
        if data.len() < SIZEOF_OPTIONAL_HEADER32 {
            return Err(OutOfBounds);
        }

        let mut offset = 0;
        let mut header = OptionalHeader {
            magic: read_le_at(data, &mut offset)?,
            major_linker_version: read_le_at(data, &mut offset)?,
            minor_linker_version: read_le_at(data, &mut offset)?,
            size_of_code: read_le_at(data, &mut offset)?,
            size_of_initialized_data: read_le_at(data, &mut offset)?,
            size_of_uninitialized_data: read_le_at(data, &mut offset)?,
            address_of_entry_point: read_le_at(data, &mut offset)?,
            base_of_code: read_le_at(data, &mut offset)?,
            base_of_data: read_le_at(data, &mut offset)?,
            image_base: u64::from(read_le_at::<u32>(data, &mut offset)?),
            section_alignment: read_le_at(data, &mut offset)?,
            file_alignment: read_le_at(data, &mut offset)?,
            major_operating_system_version: read_le_at(data, &mut offset)?,
            minor_operating_system_version: read_le_at(data, &mut offset)?,
            major_image_version: read_le_at(data, &mut offset)?,
            minor_image_version: read_le_at(data, &mut offset)?,
            major_subsystem_version: read_le_at(data, &mut offset)?,
            minor_subsystem_version: read_le_at(data, &mut offset)?,
            win32_version_value: read_le_at(data, &mut offset)?,
            size_of_image: read_le_at(data, &mut offset)?,
            size_of_headers: read_le_at(data, &mut offset)?,
            checksum: read_le_at(data, &mut offset)?,
            subsystem: read_le_at(data, &mut offset)?,
            dll_characteristics: read_le_at(data, &mut offset)?,
            size_of_stack_reserve: u64::from(read_le_at::<u32>(data, &mut offset)?),
            size_of_stack_commit: u64::from(read_le_at::<u32>(data, &mut offset)?),
            size_of_heap_reserve: u64::from(read_le_at::<u32>(data, &mut offset)?),
            size_of_heap_commit: u64::from(read_le_at::<u32>(data, &mut offset)?),
            loader_flags: read_le_at(data, &mut offset)?,
            number_of_rva_and_sizes: read_le_at(data, &mut offset)?,
            data_directory: [DataDirectory::default(); NUMBER_OF_DIRECTORY_ENTRIES],
        };

        debug_assert_eq!(offset, OFFSET_DATA_DIRECTORY32);
        header.read_directories(data, offset)?;
        Ok(header)
    }

    /// Decode an `IMAGE_OPTIONAL_HEADER64` from a buffer of at least 240 bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the buffer is too short.
    pub fn read64(data: &[u8]) -> Result<OptionalHeader> {
        if data.len() < SIZEOF_OPTIONAL_HEADER64 {
            return Err(OutOfBounds);
        }

        let mut offset = 0;
        let mut header = OptionalHeader {
            magic: read_le_at(data, &mut offset)?,
            major_linker_version: read_le_at(data, &mut offset)?,
            minor_linker_version: read_le_at(data, &mut offset)?,
            size_of_code: read_le_at(data, &mut offset)?,
            size_of_initialized_data: read_le_at(data, &mut offset)?,
            size_of_uninitialized_data: read_le_at(data, &mut offset)?,
            address_of_entry_point: read_le_at(data, &mut offset)?,
            base_of_code: read_le_at(data, &mut offset)?,
            base_of_data: 0,
            image_base: read_le_at(data, &mut offset)?,
            section_alignment: read_le_at(data, &mut offset)?,
            file_alignment: read_le_at(data, &mut offset)?,
            major_operating_system_version: read_le_at(data, &mut offset)?,
            minor_operating_system_version: read_le_at(data, &mut offset)?,
            major_image_version: read_le_at(data, &mut offset)?,
            minor_image_version: read_le_at(data, &mut offset)?,
            major_subsystem_version: read_le_at(data, &mut offset)?,
            minor_subsystem_version: read_le_at(data, &mut offset)?,
            win32_version_value: read_le_at(data, &mut offset)?,
            size_of_image: read_le_at(data, &mut offset)?,
            size_of_headers: read_le_at(data, &mut offset)?,
            checksum: read_le_at(data, &mut offset)?,
            subsystem: read_le_at(data, &mut offset)?,
            dll_characteristics: read_le_at(data, &mut offset)?,
            size_of_stack_reserve: read_le_at(data, &mut offset)?,
            size_of_stack_commit: read_le_at(data, &mut offset)?,
            size_of_heap_reserve: read_le_at(data, &mut offset)?,
            size_of_heap_commit: read_le_at(data, &mut offset)?,
            loader_flags: read_le_at(data, &mut offset)?,
            number_of_rva_and_sizes: read_le_at(data, &mut offset)?,
            data_directory: [DataDirectory::default(); NUMBER_OF_DIRECTORY_ENTRIES],
        };

        debug_assert_eq!(offset, OFFSET_DATA_DIRECTORY64);
        header.read_directories(data, offset)?;
        Ok(header)
    }

    /// Copies the first `NumberOfRvaAndSizes` directories and caps the count at 16.
    fn read_directories(&mut self, data: &[u8], offset: usize) -> Result<()> {
        let count = (self.number_of_rva_and_sizes as usize).min(NUMBER_OF_DIRECTORY_ENTRIES);
        let mut offset = offset;

        for entry in self.data_directory.iter_mut().take(count) {
            entry.virtual_address = read_le_at(data, &mut offset)?;
            entry.size = read_le_at(data, &mut offset)?;
        }

        self.number_of_rva_and_sizes = count as u32;
        Ok(())
    }

    /// Returns `true` for a PE32+ header
    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.magic == OPTIONAL_HDR64_MAGIC
    }

    /// DLL characteristics as typed flags
    #[must_use]
    pub fn dll_flags(&self) -> DllCharacteristics {
        DllCharacteristics::from_bits_retain(self.dll_characteristics)
    }

    /// Directory entry at `index`, if the index is within the fixed array
    #[must_use]
    pub fn directory(&self, index: usize) -> Option<&DataDirectory> {
        self.data_directory.get(index)
    }
}
