use bitflags::bitflags;
use strum::{EnumIter, FromRepr, IntoStaticStr};

use crate::{
    file::io::{read_le_at, write_le_at},
    pe::SIZEOF_SHORT_NAME,
    Result,
};

bitflags! {
    /// `IMAGE_SCN_*` section characteristics
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SectionCharacteristics: u32 {
        /// Section contains executable code
        const CNT_CODE = 0x0000_0020;
        /// Section contains initialized data
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// Section contains uninitialized data
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// Section contains comments or other information
        const LNK_INFO = 0x0000_0200;
        /// Section will not become part of the image
        const LNK_REMOVE = 0x0000_0800;
        /// Section contains COMDAT data
        const LNK_COMDAT = 0x0000_1000;
        /// Data referenced through the global pointer
        const GPREL = 0x0000_8000;
        /// Section contains extended relocations
        const LNK_NRELOC_OVFL = 0x0100_0000;
        /// Section can be discarded as needed
        const MEM_DISCARDABLE = 0x0200_0000;
        /// Section cannot be cached
        const MEM_NOT_CACHED = 0x0400_0000;
        /// Section is not pageable
        const MEM_NOT_PAGED = 0x0800_0000;
        /// Section can be shared in memory
        const MEM_SHARED = 0x1000_0000;
        /// Section can be executed as code
        const MEM_EXECUTE = 0x2000_0000;
        /// Section can be read
        const MEM_READ = 0x4000_0000;
        /// Section can be written to
        const MEM_WRITE = 0x8000_0000;
    }
}

/// Page protection the memory manager assigns to a mapped section.
///
/// The values are the `PAGE_*` constants of the Windows API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, FromRepr, IntoStaticStr)]
#[repr(u32)]
pub enum PageProtection {
    /// `PAGE_NOACCESS`
    NoAccess = 0x01,
    /// `PAGE_READONLY`
    ReadOnly = 0x02,
    /// `PAGE_READWRITE`
    ReadWrite = 0x04,
    /// `PAGE_WRITECOPY`
    WriteCopy = 0x08,
    /// `PAGE_EXECUTE`
    Execute = 0x10,
    /// `PAGE_EXECUTE_READ`
    ExecuteRead = 0x20,
    /// `PAGE_EXECUTE_READWRITE`
    ExecuteReadWrite = 0x40,
    /// `PAGE_EXECUTE_WRITECOPY`
    ExecuteWriteCopy = 0x80,
}

/// Protection by index `execute | read << 1 | write << 2 | shared << 3`.
/// Private writable sections are copy-on-write; shared ones are plain read/write.
const IMAGE_PROTECTION: [PageProtection; 16] = [
    PageProtection::NoAccess,
    PageProtection::Execute,
    PageProtection::ReadOnly,
    PageProtection::ExecuteRead,
    PageProtection::WriteCopy,
    PageProtection::ExecuteWriteCopy,
    PageProtection::WriteCopy,
    PageProtection::ExecuteWriteCopy,
    PageProtection::NoAccess,
    PageProtection::Execute,
    PageProtection::ReadOnly,
    PageProtection::ExecuteRead,
    PageProtection::ReadWrite,
    PageProtection::ExecuteReadWrite,
    PageProtection::ReadWrite,
    PageProtection::ExecuteReadWrite,
];

impl PageProtection {
    /// Protection the NT memory manager derives from section characteristics
    #[must_use]
    pub fn from_characteristics(characteristics: u32) -> PageProtection {
        let flags = SectionCharacteristics::from_bits_retain(characteristics);
        let mut index = 0;

        if flags.contains(SectionCharacteristics::MEM_EXECUTE) {
            index |= 1;
        }
        if flags.contains(SectionCharacteristics::MEM_READ) {
            index |= 2;
        }
        if flags.contains(SectionCharacteristics::MEM_WRITE) {
            index |= 4;
        }
        if flags.contains(SectionCharacteristics::MEM_SHARED) {
            index |= 8;
        }

        IMAGE_PROTECTION[index]
    }
}

/// An `IMAGE_SECTION_HEADER` plus the resolved display name.
///
/// `name` holds the raw 8 bytes from the section table. `section_name` is what the loader
/// resolved from them: either the string-table entry referenced by a `/nnn` name, or the raw
/// bytes with zeros removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionHeader {
    /// Raw name bytes
    pub name: [u8; SIZEOF_SHORT_NAME],
    /// Size of the section in memory, `Misc.VirtualSize`
    pub virtual_size: u32,
    /// RVA of the section
    pub virtual_address: u32,
    /// Size of the raw data in the file
    pub size_of_raw_data: u32,
    /// File offset of the raw data
    pub pointer_to_raw_data: u32,
    /// File offset of COFF relocations
    pub pointer_to_relocations: u32,
    /// File offset of COFF line numbers
    pub pointer_to_linenumbers: u32,
    /// Number of COFF relocations
    pub number_of_relocations: u16,
    /// Number of COFF line numbers
    pub number_of_linenumbers: u16,
    /// Raw [`SectionCharacteristics`] bits
    pub characteristics: u32,
    /// Resolved section name
    pub section_name: String,
}

impl SectionHeader {
    /// Decode a section header at `offset`. The display name is left empty.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the 40 bytes do not fit into `data`.
    pub fn read(data: &[u8], offset: usize) -> Result<SectionHeader> {
        let mut offset = offset;
        let mut name = [0u8; SIZEOF_SHORT_NAME];
        for byte in &mut name {
            *byte = read_le_at(data, &mut offset)?;
        }

        Ok(SectionHeader {
            name,
            virtual_size: read_le_at(data, &mut offset)?,
            virtual_address: read_le_at(data, &mut offset)?,
            size_of_raw_data: read_le_at(data, &mut offset)?,
            pointer_to_raw_data: read_le_at(data, &mut offset)?,
            pointer_to_relocations: read_le_at(data, &mut offset)?,
            pointer_to_linenumbers: read_le_at(data, &mut offset)?,
            number_of_relocations: read_le_at(data, &mut offset)?,
            number_of_linenumbers: read_le_at(data, &mut offset)?,
            characteristics: read_le_at(data, &mut offset)?,
            section_name: String::new(),
        })
    }

    /// Encode the 40-byte on-disk form at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the 40 bytes do not fit into `data`.
    pub fn write(&self, data: &mut [u8], offset: usize) -> Result<()> {
        let mut offset = offset;
        for byte in self.name {
            write_le_at(data, &mut offset, byte)?;
        }
        write_le_at(data, &mut offset, self.virtual_size)?;
        write_le_at(data, &mut offset, self.virtual_address)?;
        write_le_at(data, &mut offset, self.size_of_raw_data)?;
        write_le_at(data, &mut offset, self.pointer_to_raw_data)?;
        write_le_at(data, &mut offset, self.pointer_to_relocations)?;
        write_le_at(data, &mut offset, self.pointer_to_linenumbers)?;
        write_le_at(data, &mut offset, self.number_of_relocations)?;
        write_le_at(data, &mut offset, self.number_of_linenumbers)?;
        write_le_at(data, &mut offset, self.characteristics)
    }

    /// Set both names. The raw name receives at most the first 8 bytes, zero padded.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0u8; SIZEOF_SHORT_NAME];
        for (dst, src) in self.name.iter_mut().zip(name.bytes()) {
            *dst = src;
        }
        name.clone_into(&mut self.section_name);
    }

    /// The resolved display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.section_name
    }

    /// The raw name with every zero byte removed, decoded lossily
    #[must_use]
    pub fn short_name(&self) -> String {
        let bytes: Vec<u8> = self.name.iter().copied().filter(|&b| b != 0).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Characteristics as typed flags
    #[must_use]
    pub fn flags(&self) -> SectionCharacteristics {
        SectionCharacteristics::from_bits_retain(self.characteristics)
    }

    /// Page protection of the mapped section
    #[must_use]
    pub fn protection(&self) -> PageProtection {
        PageProtection::from_characteristics(self.characteristics)
    }
}
