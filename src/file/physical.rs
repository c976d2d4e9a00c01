//! Physical file backend for memory-mapped I/O.
//!
//! [`crate::file::physical::Physical`] maps a file from disk read-only into the address space
//! and exposes it through [`crate::file::Backend`]. The loader copies the mapping once into its
//! own buffer, so the mapping only needs to live for the duration of the load.
//!
//! # Examples
//!
//! ```rust,ignore
//! use pemapper::file::{Backend, Physical};
//!
//! let physical = Physical::new("sample.exe")?;
//! assert_eq!(physical.data_slice(0, 2)?, b"MZ");
//! # Ok::<(), pemapper::Error>(())
//! ```

use super::Backend;
use crate::{
    Error::{Error, FileError, OutOfBounds},
    Result,
};

use memmap2::Mmap;
use std::{fs, path::Path};

/// A file backend that uses memory-mapped I/O.
#[derive(Debug)]
pub struct Physical {
    /// Memory-mapped file data
    data: Mmap,
}

impl Physical {
    /// Create a new physical file backend by memory-mapping the specified file.
    ///
    /// # Arguments
    /// * `path` - Path to the PE file on disk
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or
    /// [`crate::Error::Error`] if memory mapping fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(error) => return Err(FileError(error)),
        };

        Self::from_std_file(&file)
    }

    /// Creates a new physical file backend from an already opened file.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if memory mapping fails.
    pub fn from_std_file(file: &fs::File) -> Result<Physical> {
        // The mapping is read-only and private to this process; concurrent truncation of the
        // file by another process is outside the loader's control.
        let mmap = unsafe { Mmap::map(file) }.map_err(|error| Error(error.to_string()))?;

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if offset_end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(&self.data[offset..offset_end])
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("pemapper_{}_{name}", std::process::id()));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn physical() {
        let path = temp_file("physical.bin", &[0x4D, 0x5A, 0x90, 0x00, 0x03]);
        let physical = Physical::new(&path).unwrap();

        assert_eq!(physical.len(), 5);
        assert_eq!(physical.data_slice(0, 2).unwrap(), b"MZ");
        assert_eq!(physical.to_vec().unwrap(), vec![0x4D, 0x5A, 0x90, 0x00, 0x03]);

        if physical
            .data_slice(u32::MAX as usize, u32::MAX as usize)
            .is_ok()
        {
            panic!("This should not work!")
        }

        assert!(matches!(physical.data_slice(4, 2), Err(OutOfBounds)));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn physical_invalid_file_path() {
        let result = Physical::new("/nonexistent/path/to/file.dll");
        match result.unwrap_err() {
            FileError(io_error) => {
                assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected FileError"),
        }
    }

    #[test]
    fn physical_empty_file() {
        let path = temp_file("empty.bin", b"");
        let physical = Physical::new(&path).unwrap();
        assert!(physical.is_empty());
        assert!(physical.data_slice(0, 1).is_err());
        let empty_slice: &[u8] = &[];
        assert_eq!(physical.data_slice(0, 0).unwrap(), empty_slice);

        fs::remove_file(&path).unwrap();
    }
}
