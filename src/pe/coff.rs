use bitflags::bitflags;

use crate::{
    file::io::{read_le_at, write_le_at},
    Result,
};

/// `IMAGE_FILE_MACHINE_*` values the loader distinguishes
pub mod machine {
    /// Unknown or unspecified machine
    pub const UNKNOWN: u16 = 0x0000;
    /// Intel 386
    pub const I386: u16 = 0x014C;
    /// ARM Thumb-2
    pub const ARMNT: u16 = 0x01C4;
    /// Intel Itanium
    pub const IA64: u16 = 0x0200;
    /// x64
    pub const AMD64: u16 = 0x8664;
    /// ARM64
    pub const ARM64: u16 = 0xAA64;
}

bitflags! {
    /// `IMAGE_FILE_*` characteristics of the COFF file header
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FileCharacteristics: u16 {
        /// Relocation information was stripped from the file
        const RELOCS_STRIPPED = 0x0001;
        /// The file is executable
        const EXECUTABLE_IMAGE = 0x0002;
        /// COFF line numbers were stripped
        const LINE_NUMS_STRIPPED = 0x0004;
        /// COFF symbol table entries were stripped
        const LOCAL_SYMS_STRIPPED = 0x0008;
        /// Aggressively trim the working set
        const AGGRESIVE_WS_TRIM = 0x0010;
        /// The application can handle addresses above 2 GB
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// Little endian (obsolete)
        const BYTES_REVERSED_LO = 0x0080;
        /// 32-bit word architecture
        const MACHINE_32BIT = 0x0100;
        /// Debugging information was removed
        const DEBUG_STRIPPED = 0x0200;
        /// Copy to swap when run from removable media
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        /// Copy to swap when run from the network
        const NET_RUN_FROM_SWAP = 0x0800;
        /// System file
        const SYSTEM = 0x1000;
        /// Dynamic-link library
        const DLL = 0x2000;
        /// Uniprocessor only
        const UP_SYSTEM_ONLY = 0x4000;
        /// Big endian (obsolete)
        const BYTES_REVERSED_HI = 0x8000;
    }
}

/// The COFF `IMAGE_FILE_HEADER` following the NT signature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileHeader {
    /// Target machine, see [`machine`]
    pub machine: u16,
    /// Number of entries in the section table
    pub number_of_sections: u16,
    /// Link time
    pub time_date_stamp: u32,
    /// File offset of the COFF symbol table, zero if absent
    pub pointer_to_symbol_table: u32,
    /// Number of COFF symbol records
    pub number_of_symbols: u32,
    /// Size of the optional header in bytes
    pub size_of_optional_header: u16,
    /// Raw [`FileCharacteristics`] bits
    pub characteristics: u16,
}

impl FileHeader {
    /// Decode a file header at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the 20 bytes do not fit into `data`.
    pub fn read(data: &[u8], offset: usize) -> Result<FileHeader> {
        let mut offset = offset;
        Ok(FileHeader {
            machine: read_le_at(data, &mut offset)?,
            number_of_sections: read_le_at(data, &mut offset)?,
            time_date_stamp: read_le_at(data, &mut offset)?,
            pointer_to_symbol_table: read_le_at(data, &mut offset)?,
            number_of_symbols: read_le_at(data, &mut offset)?,
            size_of_optional_header: read_le_at(data, &mut offset)?,
            characteristics: read_le_at(data, &mut offset)?,
        })
    }

    /// Encode the file header at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the 20 bytes do not fit into `data`.
    pub fn write(&self, data: &mut [u8], offset: usize) -> Result<()> {
        let mut offset = offset;
        write_le_at(data, &mut offset, self.machine)?;
        write_le_at(data, &mut offset, self.number_of_sections)?;
        write_le_at(data, &mut offset, self.time_date_stamp)?;
        write_le_at(data, &mut offset, self.pointer_to_symbol_table)?;
        write_le_at(data, &mut offset, self.number_of_symbols)?;
        write_le_at(data, &mut offset, self.size_of_optional_header)?;
        write_le_at(data, &mut offset, self.characteristics)
    }

    /// Characteristics as typed flags. Unknown bits are kept.
    #[must_use]
    pub fn flags(&self) -> FileCharacteristics {
        FileCharacteristics::from_bits_retain(self.characteristics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_read_write() {
        let header = FileHeader {
            machine: machine::AMD64,
            number_of_sections: 3,
            time_date_stamp: 0x6000_0000,
            pointer_to_symbol_table: 0x1200,
            number_of_symbols: 7,
            size_of_optional_header: 240,
            characteristics: 0x0022,
        };

        let mut data = vec![0u8; 24];
        header.write(&mut data, 4).unwrap();
        assert_eq!(&data[4..6], &[0x64, 0x86]);

        let parsed = FileHeader::read(&data, 4).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.flags().contains(FileCharacteristics::EXECUTABLE_IMAGE));
        assert!(!parsed.flags().contains(FileCharacteristics::RELOCS_STRIPPED));
    }

    #[test]
    fn file_header_truncated() {
        let data = vec![0u8; 19];
        assert!(FileHeader::read(&data, 0).is_err());
    }
}
