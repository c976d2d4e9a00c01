//! The latched diagnostic register of the loader.
//!
//! Most structural problems of a PE file do not stop the capture; the NT loader itself would
//! only refuse the image later, or not at all. Each problem has a [`LoaderError`] code, and the
//! first one recorded during a load is kept in a [`LoaderStatus`]. Later codes are discarded so
//! the register always names the root cause.

use log::debug;
use strum::{EnumCount, EnumIter, EnumMessage, IntoStaticStr};

/// Structural problems recorded while capturing and mapping an image.
///
/// Every code has a stable `LDR_ERROR_*` name (via `Into<&'static str>`) and a short
/// description (via [`strum::EnumMessage::get_message`]).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, EnumCount, EnumMessage, IntoStaticStr,
)]
pub enum LoaderError {
    /// The file is larger than 4 GB
    #[strum(serialize = "LDR_ERROR_FILE_TOO_BIG", message = "The file is larger than 4 GB")]
    FileTooBig,
    /// `e_lfanew` is not a multiple of four
    #[strum(
        serialize = "LDR_ERROR_E_LFANEW_UNALIGNED",
        message = "The NT header offset is not aligned to 4 bytes"
    )]
    ELfanewUnaligned,
    /// `e_lfanew` points past the end of the file
    #[strum(
        serialize = "LDR_ERROR_E_LFANEW_OUT_OF_FILE",
        message = "The NT header offset points outside the file"
    )]
    ELfanewOutOfFile,
    /// `e_lfanew` plus the size of the NT headers overflows 32 bits
    #[strum(
        serialize = "LDR_ERROR_NTHEADER_OFFSET_OVERFLOW",
        message = "The NT header offset plus the header size overflows"
    )]
    NtHeaderOffsetOverflow,
    /// The NT headers do not fit into the file
    #[strum(
        serialize = "LDR_ERROR_NTHEADER_OUT_OF_FILE",
        message = "The NT headers are cut by the end of the file"
    )]
    NtHeaderOutOfFile,
    /// The `PE\0\0` signature is missing
    #[strum(
        serialize = "LDR_ERROR_NO_NT_SIGNATURE",
        message = "The NT signature is missing"
    )]
    NoNtSignature,
    /// Machine and optional header size are both zero
    #[strum(
        serialize = "LDR_ERROR_FILE_HEADER_INVALID",
        message = "The file header is invalid"
    )]
    FileHeaderInvalid,
    /// The image is not executable, has too many sections, or is a bad AppContainer image
    #[strum(
        serialize = "LDR_ERROR_IMAGE_NON_EXECUTABLE",
        message = "The image is not executable"
    )]
    ImageNonExecutable,
    /// The optional header magic does not match the selected layout
    #[strum(
        serialize = "LDR_ERROR_NO_OPTHDR_MAGIC",
        message = "The optional header magic is invalid"
    )]
    NoOptHdrMagic,
    /// `SizeOfHeaders` is zero
    #[strum(
        serialize = "LDR_ERROR_SIZE_OF_HEADERS_ZERO",
        message = "The size of headers is zero"
    )]
    SizeOfHeadersZero,
    /// `FileAlignment` is zero
    #[strum(
        serialize = "LDR_ERROR_FILE_ALIGNMENT_ZERO",
        message = "The file alignment is zero"
    )]
    FileAlignmentZero,
    /// `FileAlignment` is not a power of two
    #[strum(
        serialize = "LDR_ERROR_FILE_ALIGNMENT_NOT_POW2",
        message = "The file alignment is not a power of two"
    )]
    FileAlignmentNotPow2,
    /// `SectionAlignment` is zero
    #[strum(
        serialize = "LDR_ERROR_SECTION_ALIGNMENT_ZERO",
        message = "The section alignment is zero"
    )]
    SectionAlignmentZero,
    /// `SectionAlignment` is not a power of two
    #[strum(
        serialize = "LDR_ERROR_SECTION_ALIGNMENT_NOT_POW2",
        message = "The section alignment is not a power of two"
    )]
    SectionAlignmentNotPow2,
    /// `SectionAlignment` is smaller than `FileAlignment`
    #[strum(
        serialize = "LDR_ERROR_SECTION_ALIGNMENT_TOO_SMALL",
        message = "The section alignment is smaller than the file alignment"
    )]
    SectionAlignmentTooSmall,
    /// Sub-sector file alignment without matching section alignment
    #[strum(
        serialize = "LDR_ERROR_SECTION_ALIGNMENT_INVALID",
        message = "The section alignment must equal a file alignment below 512"
    )]
    SectionAlignmentInvalid,
    /// `SizeOfImage` exceeds the largest image the memory manager maps
    #[strum(
        serialize = "LDR_ERROR_SIZE_OF_IMAGE_TOO_BIG",
        message = "The size of image is too big"
    )]
    SizeOfImageTooBig,
    /// Unsupported machine for a PE32 image
    #[strum(
        serialize = "LDR_ERROR_INVALID_MACHINE32",
        message = "The machine is not supported for 32-bit images"
    )]
    InvalidMachine32,
    /// Unsupported machine for a PE32+ image
    #[strum(
        serialize = "LDR_ERROR_INVALID_MACHINE64",
        message = "The machine is not supported for 64-bit images"
    )]
    InvalidMachine64,
    /// `SizeOfHeaders` exceeds `SizeOfImage`
    #[strum(
        serialize = "LDR_ERROR_SIZE_OF_HEADERS_INVALID",
        message = "The size of headers is larger than the image"
    )]
    SizeOfHeadersInvalid,
    /// `SizeOfOptionalHeader` is not a multiple of 8 on 64-bit Windows
    #[strum(
        serialize = "LDR_ERROR_SIZE_OF_OPTHDR_NOT_ALIGNED",
        message = "The size of the optional header is not aligned to 8 bytes"
    )]
    SizeOfOptHdrNotAligned,
    /// `SizeOfImage` covers no page
    #[strum(
        serialize = "LDR_ERROR_SIZE_OF_IMAGE_ZERO",
        message = "The size of image is zero"
    )]
    SizeOfImageZero,
    /// `ImageBase` is not aligned to 64 KB
    #[strum(
        serialize = "LDR_ERROR_IMAGE_BASE_NOT_ALIGNED",
        message = "The image base is not aligned to 64 KB"
    )]
    ImageBaseNotAligned,
    /// The section table starts outside the file
    #[strum(
        serialize = "LDR_ERROR_SECTION_HEADERS_OUT_OF_IMAGE",
        message = "The section headers are outside the file"
    )]
    SectionHeadersOutOfImage,
    /// `SizeOfHeaders` aligned to `SectionAlignment` overflows
    #[strum(
        serialize = "LDR_ERROR_SECTION_HEADERS_OVERFLOW",
        message = "The size of headers overflows when aligned"
    )]
    SectionHeadersOverflow,
    /// A section's raw data range overflows 32 bits
    #[strum(
        serialize = "LDR_ERROR_RAW_DATA_OVERFLOW",
        message = "The raw data of a section overflows"
    )]
    RawDataOverflow,
    /// Single-subsection image with a section whose file and memory layout differ
    #[strum(
        serialize = "LDR_ERROR_SECTION_SIZE_MISMATCH",
        message = "The section layout differs between file and memory"
    )]
    SectionSizeMismatch,
    /// A section does not start where the previous one ended
    #[strum(
        serialize = "LDR_ERROR_INVALID_SECTION_VA",
        message = "The section virtual address is invalid"
    )]
    InvalidSectionVa,
    /// A section's virtual size overflows or exceeds the image
    #[strum(
        serialize = "LDR_ERROR_INVALID_SECTION_VSIZE",
        message = "The section virtual size is invalid"
    )]
    InvalidSectionVSize,
    /// A section's aligned raw end overflows
    #[strum(
        serialize = "LDR_ERROR_INVALID_SECTION_RAWSIZE",
        message = "The section raw size is invalid"
    )]
    InvalidSectionRawSize,
    /// The sections do not consume `SizeOfImage`
    #[strum(
        serialize = "LDR_ERROR_INVALID_SIZE_OF_IMAGE",
        message = "The size of image does not match the sections"
    )]
    InvalidSizeOfImage,
    /// Raw data of the last section extends past the end of the file
    #[strum(serialize = "LDR_ERROR_FILE_IS_CUT", message = "The file is cut")]
    FileIsCut,
    /// The file is cut but Windows still loads it
    #[strum(
        serialize = "LDR_ERROR_FILE_IS_CUT_LOADABLE",
        message = "The file is cut, but still loadable"
    )]
    FileIsCutLoadable,
}

impl LoaderError {
    /// The stable `LDR_ERROR_*` name
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// A one-line human readable description
    #[must_use]
    pub fn description(self) -> &'static str {
        self.get_message().unwrap_or_default()
    }
}

impl std::fmt::Display for LoaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.name())
    }
}

/// First-error-wins register for [`LoaderError`] codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStatus {
    error: Option<LoaderError>,
}

impl LoaderStatus {
    /// Record `error` unless an earlier error is already latched.
    pub fn set(&mut self, error: LoaderError) {
        if self.error.is_none() {
            debug!("Latched loader error {}", error.name());
            self.error = Some(error);
        }
    }

    /// The latched error, if any
    #[must_use]
    pub fn get(&self) -> Option<LoaderError> {
        self.error
    }

    /// Forget the latched error
    pub fn clear(&mut self) {
        self.error = None;
    }

    /// `true` when the image passes the loader: nothing latched, or only a loadable cut
    #[must_use]
    pub fn is_loadable(&self) -> bool {
        matches!(self.error, None | Some(LoaderError::FileIsCutLoadable))
    }
}
