//! Base relocation of a mapped image.
//!
//! Rebasing follows `LdrProcessRelocationBlockLongLong`: the base relocation directory is read
//! through the normal image accessors, so fixups honor zero and inaccessible pages exactly like
//! every other write.

use log::{trace, warn};
use strum::FromRepr;

use crate::{
    file::io::{read_le, read_le_at, write_le},
    loader::ImageLoader,
    pe::{
        DataDirectoryType, FileCharacteristics, OFFSET_IMAGE_BASE32, OFFSET_IMAGE_BASE64,
        PAGE_SIZE, SIZEOF_BASE_RELOCATION, SIZEOF_FILE_HEADER, SIZEOF_NT_SIGNATURE, SIZE_10MB,
    },
};

/// `IMAGE_REL_BASED_*` fixup types understood by the loader
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum RelocationType {
    /// Padding entry, no fixup
    Absolute = 0,
    /// High 16 bits of a 32-bit address
    High = 1,
    /// Low 16 bits of a 32-bit address
    Low = 2,
    /// Full 32-bit address
    HighLow = 3,
    /// High 16 bits, the low half follows in the next entry
    HighAdj = 4,
    /// MIPS `jal` target, 26 bits shifted by two
    MipsJmpAddr = 5,
    /// 64-bit immediate spread over an IA64 instruction bundle
    Ia64Imm64 = 9,
    /// Full 64-bit address
    Dir64 = 10,
}

/// Placement of one IA64 `movl` immediate fragment: bundle word, width, position in the word
/// and position in the 64-bit value.
struct Imm64Field {
    word: usize,
    size: u32,
    inst_pos: u32,
    val_pos: u32,
}

/// `EMARCH_ENC_I17_*` of the I17 `movl` encoding
const IMM64_FIELDS: [Imm64Field; 8] = [
    // IMM7B
    Imm64Field { word: 3, size: 7, inst_pos: 4, val_pos: 0 },
    // IMM9D
    Imm64Field { word: 3, size: 9, inst_pos: 18, val_pos: 7 },
    // IMM5C
    Imm64Field { word: 3, size: 5, inst_pos: 13, val_pos: 16 },
    // IC
    Imm64Field { word: 3, size: 1, inst_pos: 12, val_pos: 21 },
    // IMM41a
    Imm64Field { word: 1, size: 10, inst_pos: 14, val_pos: 22 },
    // IMM41b
    Imm64Field { word: 1, size: 8, inst_pos: 24, val_pos: 32 },
    // IMM41c
    Imm64Field { word: 2, size: 23, inst_pos: 0, val_pos: 40 },
    // SIGN
    Imm64Field { word: 3, size: 1, inst_pos: 27, val_pos: 63 },
];

fn extract_imm64(bundle: &[u32; 4]) -> u64 {
    IMM64_FIELDS.iter().fold(0u64, |value, field| {
        let mask = (1u64 << field.size) - 1;
        value | ((u64::from(bundle[field.word] >> field.inst_pos) & mask) << field.val_pos)
    })
}

fn insert_imm64(bundle: &mut [u32; 4], value: u64) {
    for field in &IMM64_FIELDS {
        let mask = (1u64 << field.size) - 1;
        let bits = ((value >> field.val_pos) & mask) as u32;
        let word = &mut bundle[field.word];
        *word = (*word & !((mask as u32) << field.inst_pos)) | (bits << field.inst_pos);
    }
}

impl ImageLoader {
    /// Rebase the mapped image to `new_base`.
    ///
    /// Returns `true` when the image already sits at `new_base` or all relocation blocks were
    /// applied. The `ImageBase` field in the mapped header is rewritten as soon as the image
    /// qualifies for relocation, even when the relocation directory turns out to be missing.
    pub fn relocate_image(&mut self, new_base: u64) -> bool {
        let old_base = self.optional_header.image_base;
        if new_base == old_base {
            return true;
        }

        if self.page_count() == 0 {
            return false;
        }
        if self
            .file_header
            .flags()
            .contains(FileCharacteristics::RELOCS_STRIPPED)
        {
            return false;
        }
        if self.config.app_container_check() && self.is_bad_app_container() {
            return false;
        }
        if !self.optional_header.is_64bit() && new_base >> 32 != 0 {
            return false;
        }

        self.write_new_image_base(new_base);

        let index = DataDirectoryType::BaseReloc as usize;
        if self.optional_header.number_of_rva_and_sizes as usize <= index {
            return false;
        }

        let virtual_address = self.data_dir_rva(index);
        let size = self.data_dir_size(index);
        if virtual_address == 0 || size == 0 {
            return false;
        }
        if !self.is_valid_image_block(virtual_address, size) {
            return false;
        }

        self.process_image_relocations(old_base, new_base, virtual_address, size)
    }

    fn write_new_image_base(&mut self, new_base: u64) {
        let optional_header = self
            .dos_header
            .e_lfanew
            .wrapping_add((SIZEOF_NT_SIGNATURE + SIZEOF_FILE_HEADER) as u32);

        if self.optional_header.is_64bit() {
            let offset = optional_header.wrapping_add(OFFSET_IMAGE_BASE64 as u32);
            self.write_image(offset, &new_base.to_le_bytes());
        } else {
            let offset = optional_header.wrapping_add(OFFSET_IMAGE_BASE32 as u32);
            self.write_image(offset, &(new_base as u32).to_le_bytes());
        }

        self.optional_header.image_base = new_base;
    }

    fn process_image_relocations(
        &mut self,
        old_base: u64,
        new_base: u64,
        virtual_address: u32,
        size: u32,
    ) -> bool {
        let difference = new_base.wrapping_sub(old_base);

        if (size as usize) < SIZEOF_BASE_RELOCATION || size > SIZE_10MB {
            return false;
        }

        let mut buffer = vec![0u8; size as usize];
        let read = self.read_image(virtual_address, &mut buffer);
        buffer.truncate(read);

        let mut cursor = 0usize;
        while cursor + SIZEOF_BASE_RELOCATION <= buffer.len() {
            let Some((block_rva, mut block_size)) = block_header(&buffer, cursor) else {
                return false;
            };

            if !self.is_valid_image_block(block_rva, block_size) {
                return false;
            }

            if block_size as usize <= SIZEOF_BASE_RELOCATION {
                cursor += SIZEOF_BASE_RELOCATION;
                continue;
            }

            // Blocks aimed at the header page are ignored
            if block_rva / PAGE_SIZE == 0 {
                cursor += block_size as usize;
                continue;
            }

            if cursor + block_size as usize > buffer.len() {
                block_size = (buffer.len() - cursor) as u32;
            }

            let count = (block_size as usize - SIZEOF_BASE_RELOCATION) / 2;
            let mut offset = cursor + SIZEOF_BASE_RELOCATION;
            let entries: Vec<u16> = (0..count)
                .map_while(|_| read_le_at(&buffer, &mut offset).ok())
                .collect();

            trace!("Relocation block {block_rva:#x}: {count} entries");
            if !self.apply_relocation_block(block_rva, &entries, difference) {
                return false;
            }

            cursor += block_size as usize;
        }

        true
    }

    /// Applies the entries of one block; `false` on an unknown fixup type.
    fn apply_relocation_block(&mut self, block_rva: u32, entries: &[u16], difference: u64) -> bool {
        let mut index = 0;

        while index < entries.len() {
            let entry = entries[index];
            let fixup = block_rva.wrapping_add(u32::from(entry & 0x0FFF));

            match RelocationType::from_repr((entry >> 12) as u8) {
                Some(RelocationType::Dir64) => {
                    if let Some(value) = self.read_fixup::<8>(fixup) {
                        let value = i64::from_le_bytes(value).wrapping_add(difference as i64);
                        self.write_image(fixup, &value.to_le_bytes());
                    }
                }
                Some(RelocationType::HighLow) => {
                    if let Some(value) = self.read_fixup::<4>(fixup) {
                        let value = i32::from_le_bytes(value).wrapping_add(difference as i32);
                        self.write_image(fixup, &value.to_le_bytes());
                    }
                }
                Some(RelocationType::High) => {
                    if let Some(value) = self.read_fixup::<2>(fixup) {
                        let temp = (i32::from(i16::from_le_bytes(value)) << 16)
                            .wrapping_add(difference as i32);
                        self.write_image(fixup, &((temp >> 16) as i16).to_le_bytes());
                    }
                }
                Some(RelocationType::HighAdj) => {
                    // The low half of the target is the next entry
                    let Some(&low) = entries.get(index + 1) else {
                        break;
                    };
                    index += 1;

                    if let Some(value) = self.read_fixup::<2>(fixup) {
                        let temp = (i32::from(i16::from_le_bytes(value)) << 16)
                            .wrapping_add(i32::from(low))
                            .wrapping_add(difference as i32)
                            .wrapping_add(0x8000);
                        self.write_image(fixup, &((temp >> 16) as i16).to_le_bytes());
                    }
                }
                Some(RelocationType::Low) => {
                    if let Some(value) = self.read_fixup::<2>(fixup) {
                        let value =
                            i32::from(i16::from_le_bytes(value)).wrapping_add(difference as i32);
                        self.write_image(fixup, &(value as i16).to_le_bytes());
                    }
                }
                Some(RelocationType::MipsJmpAddr) => {
                    if let Some(value) = self.read_fixup::<4>(fixup) {
                        let value = u32::from_le_bytes(value);
                        let temp = (((value & 0x03FF_FFFF) << 2) as i32)
                            .wrapping_add(difference as i32);
                        let value = (value & !0x03FF_FFFF) | ((temp >> 2) as u32 & 0x03FF_FFFF);
                        self.write_image(fixup, &value.to_le_bytes());
                    }
                }
                Some(RelocationType::Ia64Imm64) => self.relocate_ia64_imm64(fixup, difference),
                Some(RelocationType::Absolute) => {}
                None => {
                    warn!(
                        "Unknown relocation type {} at {fixup:#x}, relocation aborted",
                        entry >> 12
                    );
                    return false;
                }
            }

            index += 1;
        }

        true
    }

    /// Patches the `movl` immediate of the bundle containing `fixup`.
    fn relocate_ia64_imm64(&mut self, fixup: u32, difference: u64) {
        let bundle_rva = fixup & !0x0F;
        let Some(bytes) = self.read_fixup::<16>(bundle_rva) else {
            return;
        };

        let mut bundle = [0u32; 4];
        for (word, chunk) in bundle.iter_mut().zip(bytes.chunks_exact(4)) {
            let Ok(value) = read_le(chunk) else {
                return;
            };
            *word = value;
        }

        let value = extract_imm64(&bundle).wrapping_add(difference);
        insert_imm64(&mut bundle, value);

        let mut patched = [0u8; 16];
        for (chunk, word) in patched.chunks_exact_mut(4).zip(bundle) {
            if write_le(chunk, word).is_err() {
                return;
            }
        }
        self.write_image(bundle_rva, &patched);
    }

    /// Reads exactly `N` bytes at `rva`, `None` on a short read.
    fn read_fixup<const N: usize>(&self, rva: u32) -> Option<[u8; N]> {
        let mut bytes = [0u8; N];
        (self.read_image(rva, &mut bytes) == N).then_some(bytes)
    }
}

/// `VirtualAddress` and `SizeOfBlock` of the block at `cursor`
fn block_header(buffer: &[u8], cursor: usize) -> Option<(u32, u32)> {
    let mut offset = cursor;
    let virtual_address = read_le_at(buffer, &mut offset).ok()?;
    let size_of_block = read_le_at(buffer, &mut offset).ok()?;
    Some((virtual_address, size_of_block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        loader::{LoaderConfig, WindowsVersion},
        test::PeBuilder,
    };

    /// PE32 at 0x400000 with `.text` (file 0x400) and relocation blocks in `.reloc`
    fn image_with_relocations(blocks: &[(u32, &[u16])]) -> Vec<u8> {
        let mut data = PeBuilder::pe32().base_relocations(blocks).build();
        data[0x410..0x414].copy_from_slice(&0x0040_1000_u32.to_le_bytes());
        data[0x420..0x422].copy_from_slice(&0x0040_u16.to_le_bytes());
        data[0x430..0x434].copy_from_slice(&0x0C00_0400_u32.to_le_bytes());
        data
    }

    fn loaded(data: Vec<u8>) -> ImageLoader {
        let mut loader = ImageLoader::default();
        loader.load(data).unwrap();
        assert!(loader.is_image_mapped_ok());
        loader
    }

    fn read_u32_at(loader: &ImageLoader, rva: u32) -> u32 {
        let mut bytes = [0u8; 4];
        loader.read_image(rva, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn text_bytes(loader: &ImageLoader) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x1000];
        loader.read_image(0x1000, &mut bytes);
        bytes
    }

    #[test]
    fn highlow_by_64kb() {
        let mut loader = loaded(image_with_relocations(&[(0x1000, &[0x3010])]));
        let before = text_bytes(&loader);

        assert!(loader.relocate_image(0x0041_0000));
        assert_eq!(read_u32_at(&loader, 0x1010), 0x0041_1000);
        assert_eq!(loader.image_base(), 0x0041_0000);

        let after = text_bytes(&loader);
        let changed: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
        assert!(changed.iter().all(|&i| (0x10..0x14).contains(&i)));

        // ImageBase in the mapped optional header
        assert_eq!(read_u32_at(&loader, 0x80 + 24 + 28), 0x0041_0000);
    }

    #[test]
    fn relocating_twice_is_idempotent() {
        let mut loader = loaded(image_with_relocations(&[(0x1000, &[0x3010, 0x0000])]));
        assert!(loader.relocate_image(0x0050_0000));
        let first = text_bytes(&loader);
        assert!(loader.relocate_image(0x0050_0000));
        assert_eq!(text_bytes(&loader), first);
    }

    #[test]
    fn high_low_and_mips() {
        let mut loader = loaded(image_with_relocations(&[(
            0x1000,
            &[0x1020, 0x2010, 0x5030],
        )]));
        assert!(loader.relocate_image(0x0041_0000));

        let mut half = [0u8; 2];
        loader.read_image(0x1020, &mut half);
        assert_eq!(u16::from_le_bytes(half), 0x0041);
        loader.read_image(0x1010, &mut half);
        assert_eq!(u16::from_le_bytes(half), 0x1000);

        // 26-bit target 0x400 << 2 = 0x1000, plus 0x10000
        assert_eq!(read_u32_at(&loader, 0x1030), 0x0C00_0000 | (0x11000 >> 2));
    }

    #[test]
    fn highadj_consumes_next_entry() {
        let mut loader = loaded(image_with_relocations(&[(0x1000, &[0x4020, 0x9000])]));
        assert!(loader.relocate_image(0x0041_0000));

        // (0x0040 << 16) + 0x9000 + 0x10000 + 0x8000 = 0x0042_1000
        let mut half = [0u8; 2];
        loader.read_image(0x1020, &mut half);
        assert_eq!(u16::from_le_bytes(half), 0x0042);
    }

    #[test]
    fn truncated_highadj_stops() {
        let mut loader = loaded(image_with_relocations(&[(0x1000, &[0x4020])]));
        let before = text_bytes(&loader);
        assert!(loader.relocate_image(0x0041_0000));
        assert_eq!(text_bytes(&loader), before);
    }

    #[test]
    fn directory_cut_inside_block() {
        let mut data = image_with_relocations(&[(0x1000, &[0x3010, 0x3030])]);
        // Base relocation directory size: one byte short of the second entry
        data[0x124..0x128].copy_from_slice(&11_u32.to_le_bytes());

        let mut loader = loaded(data);
        assert!(loader.relocate_image(0x0041_0000));
        assert_eq!(read_u32_at(&loader, 0x1010), 0x0041_1000);
        assert_eq!(read_u32_at(&loader, 0x1030), 0x0C00_0400);
    }

    #[test]
    fn unknown_type_aborts() {
        let mut loader = loaded(image_with_relocations(&[(0x1000, &[0x7010])]));
        assert!(!loader.relocate_image(0x0041_0000));
        assert_eq!(loader.image_base(), 0x0041_0000);
    }

    #[test]
    fn block_outside_image_fails() {
        let mut loader = loaded(image_with_relocations(&[(0x10_0000, &[0x3010])]));
        assert!(!loader.relocate_image(0x0041_0000));
    }

    #[test]
    fn header_block_is_skipped() {
        let mut loader = loaded(image_with_relocations(&[(0, &[0x3010]), (0x1000, &[0x3010])]));
        let mut header = [0u8; 4];
        loader.read_image(0x10, &mut header);

        assert!(loader.relocate_image(0x0041_0000));
        let mut after = [0u8; 4];
        loader.read_image(0x10, &mut after);
        assert_eq!(header, after);
        assert_eq!(read_u32_at(&loader, 0x1010), 0x0041_1000);
    }

    #[test]
    fn preconditions() {
        let mut loader = loaded(image_with_relocations(&[(0x1000, &[0x3010])]));
        assert!(loader.relocate_image(0x0040_0000));
        assert!(!loader.relocate_image(0x1_0000_0000));

        let data = PeBuilder::pe32().characteristics(0x0103).build();
        let mut loader = loaded(data);
        assert!(!loader.relocate_image(0x0041_0000));
        assert_eq!(loader.image_base(), 0x0040_0000);

        let mut unmapped = ImageLoader::default();
        unmapped.load_headers(PeBuilder::pe32().build()).unwrap();
        assert!(!unmapped.relocate_image(0x0041_0000));

        // No relocation directory: the base is still rewritten
        let mut loader = loaded(PeBuilder::pe32().build());
        assert!(!loader.relocate_image(0x0041_0000));
        assert_eq!(read_u32_at(&loader, 0x80 + 24 + 28), 0x0041_0000);
    }

    #[test]
    fn dir64_on_pe32_plus() {
        let mut data = PeBuilder::pe64()
            .base_relocations(&[(0x1000, &[0xA008])])
            .build();
        data[0x408..0x410].copy_from_slice(&0x1_4000_1234_u64.to_le_bytes());

        let mut loader = ImageLoader::new(LoaderConfig::new(WindowsVersion::Win10));
        loader.load(data).unwrap();
        assert!(loader.relocate_image(0x1_5000_0000));
        assert_eq!(loader.read_pointer(0x1008), Some(0x1_5000_1234));

        let mut base = [0u8; 8];
        loader.read_image(0x80 + 24 + 24, &mut base);
        assert_eq!(u64::from_le_bytes(base), 0x1_5000_0000);
    }

    #[test]
    fn ia64_immediate_roundtrip() {
        let mut bundle = [0xFFFF_FFFF_u32; 4];
        insert_imm64(&mut bundle, 0x8123_4567_89AB_CDEF);
        assert_eq!(extract_imm64(&bundle), 0x8123_4567_89AB_CDEF);
        // Bits outside the immediate fields are preserved
        assert_eq!(bundle[0], 0xFFFF_FFFF);
    }

    #[test]
    fn ia64_bundle_relocation() {
        let mut bundle = [0u32; 4];
        insert_imm64(&mut bundle, 0x1_4000_2000);
        let mut data = PeBuilder::pe64()
            .machine(crate::pe::machine::IA64)
            .base_relocations(&[(0x1000, &[0x9024])])
            .build();
        for (i, word) in bundle.iter().enumerate() {
            data[0x420 + i * 4..0x424 + i * 4].copy_from_slice(&word.to_le_bytes());
        }

        let mut loader = ImageLoader::default();
        loader.load(data).unwrap();
        assert!(loader.relocate_image(0x1_4001_0000));

        let mut bytes = [0u8; 16];
        loader.read_image(0x1020, &mut bytes);
        let mut patched = [0u32; 4];
        for (word, chunk) in patched.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        assert_eq!(extract_imm64(&patched), 0x1_4001_2000);
    }

    #[test]
    fn relocation_type_from_repr() {
        assert_eq!(RelocationType::from_repr(3), Some(RelocationType::HighLow));
        assert_eq!(RelocationType::from_repr(10), Some(RelocationType::Dir64));
        assert_eq!(RelocationType::from_repr(6), None);
    }
}
