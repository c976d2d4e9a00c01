//! Input sources for the image loader.
//!
//! The loader always works on an owned copy of the file, because section-table capture
//! patches the source bytes in place before they are mapped (see
//! [`crate::loader::ImageLoader::load`]). This module abstracts over where those bytes come
//! from.
//!
//! # Key Components
//!
//! - [`crate::file::Backend`] - Trait for data sources (disk files, memory buffers)
//! - [`crate::file::physical::Physical`] - Memory-mapped file backend for disk access
//! - [`crate::file::memory::Memory`] - In-memory buffer backend
//! - [`crate::file::io`] - Bounds-checked little-endian readers and writers
//!
//! # Examples
//!
//! ```rust,no_run
//! use pemapper::{file::Physical, ImageLoader};
//!
//! let backend = Physical::new("sample.exe")?;
//! let mut loader = ImageLoader::default();
//! loader.load_backend(&backend)?;
//! # Ok::<(), pemapper::Error>(())
//! ```

pub mod io;
mod memory;
mod physical;

pub use memory::Memory;
pub use physical::Physical;

use crate::{Error, Result};

/// Backend trait for file data sources
///
/// Implementations expose a contiguous, read-only view of the input bytes. The trait is
/// object safe so the loader can accept `&dyn Backend`.
pub trait Backend: Send + Sync {
    /// Get a slice of the data at `offset` with `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range does not lie within the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Get the complete data of this backend
    fn data(&self) -> &[u8];

    /// Get the size of the data of this backend
    fn len(&self) -> usize;

    /// Returns `true` if the backend holds no data
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the backend contents into a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotEnoughSpace`] if the buffer cannot be allocated.
    fn to_vec(&self) -> Result<Vec<u8>> {
        let data = self.data();
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(data.len())
            .map_err(|_| Error::NotEnoughSpace)?;
        buffer.extend_from_slice(data);
        Ok(buffer)
    }
}
