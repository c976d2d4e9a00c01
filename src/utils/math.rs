//! Alignment and size arithmetic used throughout the loader.
//!
//! All helpers work on `u32` with wrap-around, matching the 32-bit arithmetic the overflow
//! checks of the Windows loader are written against.

use crate::{pe::PAGE_SIZE, Result};

/// Converts a `usize` to `u32`, returning an error if the value exceeds `u32::MAX`.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if `value` exceeds `u32::MAX`.
pub fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Value {value} exceeds u32::MAX"))
}

/// Rounds `value` up to the next multiple of `alignment` with 32-bit wrap-around.
///
/// `alignment` is expected to be a power of two. An alignment of zero yields zero, and a
/// value whose rounded result does not fit into 32 bits wraps to a small number, both exactly
/// like the `ALIGN_TO_SIZE` arithmetic of the NT loader.
///
/// # Examples
///
/// ```rust,ignore
/// use pemapper::utils::align_to_size;
///
/// assert_eq!(align_to_size(0x401, 0x200), 0x600);
/// assert_eq!(align_to_size(0x400, 0x200), 0x400);
/// assert_eq!(align_to_size(0xFFFF_FFFF, 0x1000), 0);
/// ```
#[must_use]
pub fn align_to_size(value: u32, alignment: u32) -> u32 {
    value.wrapping_add(alignment.wrapping_sub(1)) & !alignment.wrapping_sub(1)
}

/// Number of pages needed to hold `size` bytes.
#[must_use]
pub fn bytes_to_pages(size: u32) -> u32 {
    let pages = (u64::from(size) + u64::from(PAGE_SIZE) - 1) / u64::from(PAGE_SIZE);
    // ceil(u32::MAX / 4096) fits into u32
    pages as u32
}
