#![no_main]

use libfuzzer_sys::fuzz_target;
use pemapper::{ImageLoader, LoaderConfig, WindowsVersion};

fuzz_target!(|data: &[u8]| {
    for version in [WindowsVersion::Xp, WindowsVersion::Win7, WindowsVersion::Win10] {
        let mut loader = ImageLoader::new(LoaderConfig::new(version));
        if loader.load(data.to_vec()).is_err() {
            continue;
        }

        let mut buffer = [0u8; 64];
        let _ = loader.read_image(loader.entry_point(), &mut buffer);
        let _ = loader.read_string(loader.data_dir_rva(0), 256);
        let _ = loader.file_offset_from_rva(loader.entry_point());
        let _ = loader.relocate_image(loader.image_base().wrapping_add(0x10000));
    }
});
