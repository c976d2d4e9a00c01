//! End-to-end loading of synthetic images through the public API.

mod common;

use common::{put32, PeBuilder, SectionSpec, OPTIONAL_HEADER};
use pemapper::prelude::*;

fn load(config: LoaderConfig, data: Vec<u8>) -> ImageLoader {
    let mut loader = ImageLoader::new(config);
    loader.load(data).unwrap();
    loader
}

fn read_u32(loader: &ImageLoader, rva: u32) -> u32 {
    let mut bytes = [0u8; 4];
    assert_eq!(loader.read_image(rva, &mut bytes), 4);
    u32::from_le_bytes(bytes)
}

/// `.text` with an absolute pointer at RVA 0x1010 and a `.reloc` section fixing it up
fn relocatable_image() -> Vec<u8> {
    let mut data = PeBuilder::pe32()
        .base_relocations(&[(0x1000, &[0x3010])])
        .build();
    put32(&mut data, 0x410, 0x0040_1000);
    data
}

#[test]
fn two_page_image() {
    let data = PeBuilder::pe32().build();
    let loader = load(LoaderConfig::new(WindowsVersion::Win10), data.clone());

    assert_eq!(loader.loader_error(), None);
    assert!(loader.is_image_mapped_ok());
    assert_eq!(loader.page_count(), 2);

    let header = loader.page(0).unwrap().data().unwrap();
    assert_eq!(&header[..0x400], &data[..0x400]);
    assert!(header[0x400..].iter().all(|&byte| byte == 0));

    let text = loader.page(1).unwrap().data().unwrap();
    assert_eq!(&text[..0x200], &data[0x400..0x600]);
    assert!(text[0x200..].iter().all(|&byte| byte == 0));

    let mut buffer = [0u8; 0x10];
    assert_eq!(loader.read_image(0x1FF8, &mut buffer), 8);
    assert_eq!(loader.read_image(0x2000, &mut buffer), 0);
}

#[test]
fn every_version_maps_a_valid_image() {
    for version in [
        WindowsVersion::Generic,
        WindowsVersion::Xp,
        WindowsVersion::Win7,
        WindowsVersion::Win10,
    ] {
        let loader = load(LoaderConfig::new(version), PeBuilder::pe32().build());
        assert_eq!(loader.loader_error(), None, "{version:?}");
        assert_eq!(loader.page_count(), 2, "{version:?}");
    }
}

#[test]
fn oversized_image_depends_on_version() {
    let data = PeBuilder::pe32().size_of_image(0x3000).build();

    let loader = load(LoaderConfig::new(WindowsVersion::Win7), data.clone());
    assert_eq!(loader.loader_error(), Some(LoaderError::InvalidSizeOfImage));
    assert!(!loader.is_image_mapped_ok());

    let loader = load(LoaderConfig::new(WindowsVersion::Win10), data);
    assert_eq!(loader.loader_error(), None);
    assert_eq!(loader.page_count(), 3);
    assert_eq!(loader.page(2), Some(&Page::Inaccessible));
}

#[test]
fn rebase_by_64kb() {
    let mut loader = load(LoaderConfig::new(WindowsVersion::Win10), relocatable_image());
    assert!(loader.is_image_mapped_ok());

    assert!(loader.relocate_image(0x0041_0000));
    assert_eq!(read_u32(&loader, 0x1010), 0x0041_1000);
    assert_eq!(loader.image_base(), 0x0041_0000);
    assert_eq!(
        read_u32(&loader, OPTIONAL_HEADER as u32 + 28),
        0x0041_0000
    );

    // Same base again: nothing changes
    assert!(loader.relocate_image(0x0041_0000));
    assert_eq!(read_u32(&loader, 0x1010), 0x0041_1000);
}

#[test]
fn truncated_file_is_served_raw() {
    let data = PeBuilder::pe32().build();
    let loader = load(LoaderConfig::new(WindowsVersion::Win10), data[..0x500].to_vec());

    assert_eq!(loader.loader_error(), Some(LoaderError::FileIsCut));
    assert!(!loader.is_image_loadable());
    assert_eq!(loader.page_count(), 0);

    let mut signature = [0u8; 2];
    assert_eq!(loader.read_image(0, &mut signature), 2);
    assert_eq!(&signature, b"MZ");
}

#[test]
fn short_and_foreign_inputs_fail() {
    let mut loader = ImageLoader::default();
    assert!(matches!(loader.load(b"MZ".to_vec()), Err(Error::InvalidFile)));
    assert!(matches!(loader.load(vec![0u8; 0x400]), Err(Error::InvalidFile)));
}

#[test]
fn single_subsection_mismatch_still_maps() {
    let data = PeBuilder::pe32()
        .section_alignment(0x200)
        .file_alignment(0x200)
        .size_of_image(0x700)
        .sections(vec![SectionSpec::new(*b".text\0\0\0", 0x400, 0x300, 0x400, 0x200)])
        .build();
    let loader = load(LoaderConfig::default(), data.clone());

    assert_eq!(loader.loader_error(), Some(LoaderError::SectionSizeMismatch));
    assert_eq!(loader.page_count(), 1);
    let page = loader.page(0).unwrap().data().unwrap();
    assert_eq!(&page[..data.len()], &data[..]);
}

#[test]
fn rva_and_file_offset_translation() {
    let mut loader = ImageLoader::default();
    loader.load_headers(PeBuilder::pe32().build()).unwrap();

    assert_eq!(loader.file_offset_from_rva(0x1010), Some(0x410));
    assert_eq!(loader.rva_from_file_offset(0x410), Some(0x1010));
    assert_eq!(loader.file_offset_from_rva(0x20), Some(0x20));
    assert_eq!(loader.file_offset_from_rva(0x1800), None);
}

#[test]
fn add_section_and_rebuild_headers() {
    let mut loader = ImageLoader::default();
    loader.load_headers(PeBuilder::pe32().build()).unwrap();

    let section = loader.add_section(".extra", 0x800).unwrap();
    assert_eq!(section.virtual_address, 0x2000);
    assert_eq!(section.pointer_to_raw_data, 0x600);

    loader.make_valid();
    assert_eq!(loader.file_header().number_of_sections, 2);
    assert_eq!(loader.size_of_image(), 0x3000);

    loader.remove_section(1).unwrap();
    loader.make_valid();
    assert_eq!(loader.size_of_image(), 0x2000);
}

#[test]
fn backends_load_the_same_image() {
    let data = PeBuilder::pe32().build();

    let mut from_memory = ImageLoader::default();
    from_memory.load_backend(&Memory::new(data.clone())).unwrap();

    let path = std::env::temp_dir().join(format!("pemapper_it_{}.exe", std::process::id()));
    std::fs::write(&path, &data).unwrap();
    let mut from_file = ImageLoader::default();
    let result = from_file.load_file(&path);
    std::fs::remove_file(&path).unwrap();
    result.unwrap();

    let mut reference = vec![0u8; 0x2000];
    from_memory.read_image(0, &mut reference);
    assert_eq!(
        from_file.compare_with_mapped_image(Some(&reference), |_| true),
        ImageCompare::Equal
    );
}
