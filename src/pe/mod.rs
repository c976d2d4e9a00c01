//! On-disk PE structures and the constants of the NT memory manager.
//!
//! The types in this module are plain copies of the corresponding Windows structures. They do
//! no validation of their own; every consistency rule is applied by the loader in
//! [`crate::loader`], which records violations instead of rejecting the input.
//!
//! # Key Components
//!
//! - [`crate::pe::DosHeader`] - `IMAGE_DOS_HEADER`
//! - [`crate::pe::FileHeader`] - `IMAGE_FILE_HEADER` with [`crate::pe::FileCharacteristics`]
//! - [`crate::pe::OptionalHeader`] - `IMAGE_OPTIONAL_HEADER32/64` normalized into one type
//! - [`crate::pe::SectionHeader`] - `IMAGE_SECTION_HEADER` with the resolved section name

mod coff;
mod dos;
mod optional;
mod section;

pub use coff::{machine, FileCharacteristics, FileHeader};
pub use dos::DosHeader;
pub use optional::{DataDirectory, DataDirectoryType, DllCharacteristics, OptionalHeader};
pub(crate) use optional::{
    OFFSET_CHECKSUM, OFFSET_DATA_DIRECTORY32, OFFSET_DATA_DIRECTORY64, OFFSET_IMAGE_BASE32,
    OFFSET_IMAGE_BASE64, OFFSET_NUMBER_OF_RVA32, OFFSET_NUMBER_OF_RVA64,
};
pub use section::{PageProtection, SectionCharacteristics, SectionHeader};

/// Size of one page of the mapped image
pub const PAGE_SIZE: u32 = 0x1000;

/// Disk sector size. Raw data pointers are rounded down to it when a section is mapped.
pub const SECTOR_SIZE: u32 = 0x200;

/// Required alignment of `ImageBase`
pub const SIZE_64KB: u64 = 0x10000;

/// Relocation directories larger than this are refused
pub const SIZE_10MB: u32 = 0xA0_0000;

/// `MM_SIZE_OF_LARGEST_IMAGE` of the NT memory manager
pub const SIZE_OF_LARGEST_IMAGE: u32 = 0x7700_0000;

/// `MZ`
pub const DOS_SIGNATURE: u16 = 0x5A4D;

/// `PE\0\0`
pub const NT_SIGNATURE: u32 = 0x0000_4550;

/// Magic of a PE32 optional header
pub const OPTIONAL_HDR32_MAGIC: u16 = 0x10B;

/// Magic of a PE32+ optional header
pub const OPTIONAL_HDR64_MAGIC: u16 = 0x20B;

/// Capacity of the data directory array
pub const NUMBER_OF_DIRECTORY_ENTRIES: usize = 16;

/// Size of `IMAGE_DOS_HEADER`
pub const SIZEOF_DOS_HEADER: usize = 64;

/// Size of `IMAGE_FILE_HEADER`
pub const SIZEOF_FILE_HEADER: usize = 20;

/// Size of the NT signature preceding the file header
pub const SIZEOF_NT_SIGNATURE: usize = 4;

/// Size of `IMAGE_OPTIONAL_HEADER32`, data directories included
pub const SIZEOF_OPTIONAL_HEADER32: usize = 224;

/// Size of `IMAGE_OPTIONAL_HEADER64`, data directories included
pub const SIZEOF_OPTIONAL_HEADER64: usize = 240;

/// Size of `IMAGE_SECTION_HEADER`
pub const SIZEOF_SECTION_HEADER: usize = 40;

/// Size of `IMAGE_DATA_DIRECTORY`
pub const SIZEOF_DATA_DIRECTORY: usize = 8;

/// Size of `IMAGE_BASE_RELOCATION`
pub const SIZEOF_BASE_RELOCATION: usize = 8;

/// Size of one COFF symbol record. The string table follows the last record.
pub const SIZEOF_COFF_SYMBOL: u32 = 18;

/// Length of the inline section name
pub const SIZEOF_SHORT_NAME: usize = 8;

/// Longest section name accepted from the COFF string table
pub const SIZEOF_MAX_NAME: usize = 1024;
