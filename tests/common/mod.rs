//! Helpers shared by the integration tests.
#![allow(dead_code)]

#[path = "../../src/test/builder.rs"]
mod builder;

pub use builder::{PeBuilder, SectionSpec};

/// File offset of the optional header in a `PeBuilder` image
pub const OPTIONAL_HEADER: usize = 0x80 + 24;

pub fn put32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
