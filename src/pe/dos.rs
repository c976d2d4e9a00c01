use crate::{
    file::io::{read_le_at, write_le_at},
    pe::SIZEOF_DOS_HEADER,
    Result,
};

/// The `IMAGE_DOS_HEADER` at the start of every PE file.
///
/// Only `e_magic` and `e_lfanew` matter to the loader; the remaining fields are kept so the
/// header can be written back unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DosHeader {
    /// Magic number, `MZ`
    pub e_magic: u16,
    /// Bytes on last page of file
    pub e_cblp: u16,
    /// Pages in file
    pub e_cp: u16,
    /// Relocations
    pub e_crlc: u16,
    /// Size of header in paragraphs
    pub e_cparhdr: u16,
    /// Minimum extra paragraphs needed
    pub e_minalloc: u16,
    /// Maximum extra paragraphs needed
    pub e_maxalloc: u16,
    /// Initial (relative) SS value
    pub e_ss: u16,
    /// Initial SP value
    pub e_sp: u16,
    /// Checksum
    pub e_csum: u16,
    /// Initial IP value
    pub e_ip: u16,
    /// Initial (relative) CS value
    pub e_cs: u16,
    /// File address of relocation table
    pub e_lfarlc: u16,
    /// Overlay number
    pub e_ovno: u16,
    /// Reserved words
    pub e_res: [u16; 4],
    /// OEM identifier
    pub e_oemid: u16,
    /// OEM information
    pub e_oeminfo: u16,
    /// Reserved words
    pub e_res2: [u16; 10],
    /// File address of the NT headers
    pub e_lfanew: u32,
}

impl DosHeader {
    /// Decode a DOS header from the first 64 bytes of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than 64 bytes.
    pub fn read(data: &[u8]) -> Result<DosHeader> {
        let mut offset = 0;
        let mut header = DosHeader {
            e_magic: read_le_at(data, &mut offset)?,
            e_cblp: read_le_at(data, &mut offset)?,
            e_cp: read_le_at(data, &mut offset)?,
            e_crlc: read_le_at(data, &mut offset)?,
            e_cparhdr: read_le_at(data, &mut offset)?,
            e_minalloc: read_le_at(data, &mut offset)?,
            e_maxalloc: read_le_at(data, &mut offset)?,
            e_ss: read_le_at(data, &mut offset)?,
            e_sp: read_le_at(data, &mut offset)?,
            e_csum: read_le_at(data, &mut offset)?,
            e_ip: read_le_at(data, &mut offset)?,
            e_cs: read_le_at(data, &mut offset)?,
            e_lfarlc: read_le_at(data, &mut offset)?,
            e_ovno: read_le_at(data, &mut offset)?,
            ..Default::default()
        };

        for word in &mut header.e_res {
            *word = read_le_at(data, &mut offset)?;
        }
        header.e_oemid = read_le_at(data, &mut offset)?;
        header.e_oeminfo = read_le_at(data, &mut offset)?;
        for word in &mut header.e_res2 {
            *word = read_le_at(data, &mut offset)?;
        }
        header.e_lfanew = read_le_at(data, &mut offset)?;

        debug_assert_eq!(offset, SIZEOF_DOS_HEADER);
        Ok(header)
    }

    /// Encode the header into the first 64 bytes of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than 64 bytes.
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        for value in [
            self.e_magic,
            self.e_cblp,
            self.e_cp,
            self.e_crlc,
            self.e_cparhdr,
            self.e_minalloc,
            self.e_maxalloc,
            self.e_ss,
            self.e_sp,
            self.e_csum,
            self.e_ip,
            self.e_cs,
            self.e_lfarlc,
            self.e_ovno,
        ] {
            write_le_at(data, &mut offset, value)?;
        }
        for value in self.e_res {
            write_le_at(data, &mut offset, value)?;
        }
        write_le_at(data, &mut offset, self.e_oemid)?;
        write_le_at(data, &mut offset, self.e_oeminfo)?;
        for value in self.e_res2 {
            write_le_at(data, &mut offset, value)?;
        }
        write_le_at(data, &mut offset, self.e_lfanew)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::DOS_SIGNATURE;

    #[test]
    fn read_dos_header() {
        let mut data = vec![0u8; 64];
        data[0] = b'M';
        data[1] = b'Z';
        data[2] = 0x90;
        data[0x3C..0x40].copy_from_slice(&0x80_u32.to_le_bytes());

        let header = DosHeader::read(&data).unwrap();
        assert_eq!(header.e_magic, DOS_SIGNATURE);
        assert_eq!(header.e_cblp, 0x90);
        assert_eq!(header.e_lfanew, 0x80);

        let mut out = vec![0u8; 64];
        header.write(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn read_dos_header_short() {
        let data = vec![0u8; 63];
        assert!(DosHeader::read(&data).is_err());
    }
}
