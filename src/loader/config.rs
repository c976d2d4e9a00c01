//! Loader configuration per emulated Windows version.
//!
//! The NT loader changed its validation rules between releases. A [`LoaderConfig`] selects one
//! of those rule sets and derives every version-dependent parameter once, so the capture and
//! mapping code only consults plain fields.
//!
//! # Examples
//!
//! ```rust
//! use pemapper::{LoaderConfig, WindowsVersion};
//!
//! let config = LoaderConfig::new(WindowsVersion::Win7).with_64bit_windows(true);
//! assert_eq!(config.max_sections(), 192);
//! assert!(config.size_of_image_must_match());
//! assert!(!config.load_arm_images());
//! ```

use strum::{EnumIter, IntoStaticStr};

use crate::pe::PAGE_SIZE;

/// The Windows loader whose behavior is reproduced
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
pub enum WindowsVersion {
    /// Lenient loader without any version-specific checks
    #[default]
    Generic,
    /// Windows XP
    Xp,
    /// Windows 7
    Win7,
    /// Windows 10
    Win10,
}

/// Immutable loader parameters derived from a [`WindowsVersion`].
///
/// | version | single-subsection alignment | max sections | ARM images |
/// |---------|-----------------------------|--------------|------------|
/// | Generic | 0x1000                      | 255          | yes        |
/// | Xp      | 0x200                       | 96           | no         |
/// | Win7    | 1                           | 192          | no         |
/// | Win10   | 1                           | 192          | yes        |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct LoaderConfig {
    version: WindowsVersion,
    ssi_image_alignment32: u32,
    max_sections: u32,
    is_64bit_windows: bool,
    size_of_image_must_match: bool,
    header_size_check: bool,
    nt_headers_size_check: bool,
    app_container_check: bool,
    load_arm_images: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::new(WindowsVersion::Generic)
    }
}

impl LoaderConfig {
    /// Configuration for the given Windows version on a 32-bit host.
    #[must_use]
    pub fn new(version: WindowsVersion) -> Self {
        let generic = LoaderConfig {
            version,
            ssi_image_alignment32: PAGE_SIZE,
            max_sections: 255,
            is_64bit_windows: false,
            size_of_image_must_match: false,
            header_size_check: false,
            nt_headers_size_check: false,
            app_container_check: false,
            load_arm_images: true,
        };

        match version {
            WindowsVersion::Generic => generic,
            WindowsVersion::Xp => LoaderConfig {
                ssi_image_alignment32: 0x200,
                max_sections: 96,
                size_of_image_must_match: true,
                header_size_check: true,
                load_arm_images: false,
                ..generic
            },
            WindowsVersion::Win7 => LoaderConfig {
                ssi_image_alignment32: 1,
                max_sections: 192,
                size_of_image_must_match: true,
                nt_headers_size_check: true,
                load_arm_images: false,
                ..generic
            },
            WindowsVersion::Win10 => LoaderConfig {
                ssi_image_alignment32: 1,
                max_sections: 192,
                nt_headers_size_check: true,
                app_container_check: true,
                load_arm_images: true,
                ..generic
            },
        }
    }

    /// Emulate the loader of a 64-bit Windows
    #[must_use]
    pub fn with_64bit_windows(mut self, enabled: bool) -> Self {
        self.is_64bit_windows = enabled;
        self
    }

    /// Accept ARM and ARM64 machine types regardless of the version default
    #[must_use]
    pub fn with_arm_images(mut self, enabled: bool) -> Self {
        self.load_arm_images = enabled;
        self
    }

    /// The emulated version
    #[must_use]
    pub fn version(&self) -> WindowsVersion {
        self.version
    }

    /// Image size granularity for single-subsection images on 32-bit Windows
    #[must_use]
    pub fn ssi_image_alignment32(&self) -> u32 {
        self.ssi_image_alignment32
    }

    /// Most sections an executable image may declare
    #[must_use]
    pub fn max_sections(&self) -> u32 {
        self.max_sections
    }

    /// Emulating a 64-bit Windows host
    #[must_use]
    pub fn is_64bit_windows(&self) -> bool {
        self.is_64bit_windows
    }

    /// `SizeOfImage` must be consumed exactly by the sections
    #[must_use]
    pub fn size_of_image_must_match(&self) -> bool {
        self.size_of_image_must_match
    }

    /// Header region is widened to `SectionAlignment` when the section table fits in one page
    #[must_use]
    pub fn header_size_check(&self) -> bool {
        self.header_size_check
    }

    /// A full 32-bit NT header must fit into the file
    #[must_use]
    pub fn nt_headers_size_check(&self) -> bool {
        self.nt_headers_size_check
    }

    /// Reject AppContainer images whose relocations were stripped
    #[must_use]
    pub fn app_container_check(&self) -> bool {
        self.app_container_check
    }

    /// Accept ARMNT and ARM64 images
    #[must_use]
    pub fn load_arm_images(&self) -> bool {
        self.load_arm_images
    }

    /// Zero `PointerToRawData` of sections without raw data, as every real loader mode does
    #[must_use]
    pub fn borland_fix(&self) -> bool {
        self.version != WindowsVersion::Generic
    }
}
