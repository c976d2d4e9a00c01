// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # pemapper
//!
//! A cross-platform reimplementation of the Windows NT image loader for PE files.
//!
//! `pemapper` takes a PE file and produces the virtual image that `NtCreateSection(SEC_IMAGE)`
//! would produce on a given Windows version: the same header validation, the same section
//! placement, the same zero-filled and inaccessible pages, and the same handling of cut and
//! malformed files. Tools that analyze malware or packed binaries can then read the image by RVA
//! and see exactly the bytes a running process sees, without running Windows.
//!
//! ## Features
//!
//! - **Version aware** - Windows XP, 7 and 10 rules, plus a lenient generic mode
//! - **Faithful mapping** - page table with data, zero and inaccessible pages
//! - **Anomaly tracking** - structural problems latched as a [`LoaderError`] instead of failing
//! - **Rebasing** - applies base relocations like `LdrProcessRelocationBlockLongLong`
//! - **Editing** - add, split, remove and resize sections, then recompute the headers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pemapper::prelude::*;
//!
//! let mut loader = ImageLoader::new(LoaderConfig::new(WindowsVersion::Win10));
//! loader.load_file("sample.exe")?;
//!
//! if loader.is_image_mapped_ok() {
//!     let mut bytes = [0u8; 2];
//!     loader.read_image(0, &mut bytes);
//!     assert_eq!(&bytes, b"MZ");
//! }
//! # Ok::<(), pemapper::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`pe`] - On-disk PE structures and memory manager constants
//! - [`loader`] - Header capture, mapping, RVA access, relocation and header edits
//! - [`file`] - Input backends (memory-mapped files, in-memory buffers)
//! - [`Error`] and [`Result`] - Hard failures; loader anomalies use [`LoaderError`]

// `pemapper::` paths in the image builder shared with `tests/`
#[cfg(test)]
extern crate self as pemapper;

#[macro_use]
pub(crate) mod error;

/// Input sources and low-level little-endian readers
pub mod file;

/// Windows NT compatible image loader
///
/// See [`ImageLoader`] for the entry point.
pub mod loader;

/// PE on-disk structures and constants
pub mod pe;

/// Convenient re-exports of the most commonly used types.
///
/// ```rust,no_run
/// use pemapper::prelude::*;
///
/// let mut loader = ImageLoader::default();
/// loader.load_file("sample.dll")?;
/// # Ok::<(), pemapper::Error>(())
/// ```
pub mod prelude;

pub(crate) mod utils;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// `pemapper` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `pemapper` Error type
///
/// Hard failures of loading, I/O and section edits. Structural problems the Windows loader
/// tolerates are reported through [`LoaderError`] instead.
///
/// # Examples
///
/// ```rust,no_run
/// use pemapper::{Error, ImageLoader};
///
/// let mut loader = ImageLoader::default();
/// match loader.load_file("notes.txt") {
///     Ok(()) => println!("Loaded"),
///     Err(Error::InvalidFile) => println!("Not a PE file"),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

pub use loader::{
    HeaderField, ImageCompare, ImageLoader, LoaderConfig, LoaderError, LoaderStatus, Page,
    RelocationType, WindowsVersion,
};
