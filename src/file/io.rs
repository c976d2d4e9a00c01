//! Bounds-checked little-endian reading and writing of PE primitives.
//!
//! Every on-disk PE structure is little-endian. The helpers in this module decode and encode
//! the primitive field types from byte slices without any unsafe code, returning
//! [`crate::Error::OutOfBounds`] instead of panicking when the slice is too short.
//!
//! # Key Components
//!
//! - [`crate::file::io::PeIO`] - Trait implemented by all primitive field types
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Decode a value
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Encode a value
//!
//! # Examples
//!
//! ```rust,ignore
//! use pemapper::file::io::{read_le_at, write_le_at};
//!
//! let mut header = [0u8; 8];
//! let mut offset = 0;
//! write_le_at(&mut header, &mut offset, 0x5A4D_u16)?;
//! write_le_at(&mut header, &mut offset, 0x80_u32)?;
//!
//! let mut offset = 0;
//! let magic: u16 = read_le_at(&header, &mut offset)?;
//! let e_lfanew: u32 = read_le_at(&header, &mut offset)?;
//! assert_eq!((magic, e_lfanew), (0x5A4D, 0x80));
//! # Ok::<(), pemapper::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// Trait for primitive types that can be decoded from and encoded to little-endian bytes.
///
/// Implemented for the unsigned and signed integer types that appear in PE headers,
/// relocation blocks and IA64 instruction bundles.
pub trait PeIO: Sized {
    /// The fixed-size byte array for this type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode `Self` from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encode `Self` into little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_pe_io {
    ($($ty:ty),*) => {
        $(
            impl PeIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_pe_io!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Reads a value of type `T` from the start of `data`.
///
/// # Arguments
///
/// * `data` - The byte buffer to read from
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn read_le<T: PeIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a value of type `T` at `offset` and advances `offset` past it.
///
/// # Arguments
///
/// * `data` - The byte buffer to read from
/// * `offset` - Position to read at, advanced by `size_of::<T>()` on success
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit, including when
/// `offset + size_of::<T>()` overflows.
pub fn read_le_at<T: PeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };

    let Some(slice) = data.get(*offset..end) else {
        return Err(OutOfBounds);
    };

    let Ok(bytes) = T::Bytes::try_from(slice) else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(bytes))
}

/// Writes `value` to the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn write_le<T: PeIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Writes `value` at `offset` and advances `offset` past it.
///
/// # Arguments
///
/// * `data` - The mutable byte buffer to write to
/// * `offset` - Position to write at, advanced by `size_of::<T>()` on success
/// * `value` - The value to write
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit.
pub fn write_le_at<T: PeIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };

    let Some(slice) = data.get_mut(*offset..end) else {
        return Err(OutOfBounds);
    };

    slice.copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;
    Ok(())
}
