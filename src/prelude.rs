//! # pemapper Prelude
//!
//! The types needed to load an image, inspect the result and read it by RVA.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all pemapper operations
pub use crate::Error;

/// The result type used throughout pemapper
pub use crate::Result;

// ================================================================================================
// Loader
// ================================================================================================

/// The image loader and its configuration
pub use crate::loader::{ImageLoader, LoaderConfig, WindowsVersion};

/// Load diagnostics
pub use crate::loader::{LoaderError, LoaderStatus};

/// Mapped image pages and comparison results
pub use crate::loader::{ImageCompare, Page};

/// Header field offsets and relocation types
pub use crate::loader::{HeaderField, RelocationType};

// ================================================================================================
// PE Structures
// ================================================================================================

/// Captured headers
pub use crate::pe::{DosHeader, FileHeader, OptionalHeader, SectionHeader};

/// Flag types of the headers
pub use crate::pe::{
    DllCharacteristics, FileCharacteristics, PageProtection, SectionCharacteristics,
};

/// Data directory indices
pub use crate::pe::{DataDirectory, DataDirectoryType};

// ================================================================================================
// File Backends
// ================================================================================================

/// Input backends for [`ImageLoader::load_backend`]
pub use crate::file::{Backend, Memory, Physical};
