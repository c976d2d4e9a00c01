//! Small numeric helpers shared by the header capture, mapper and mutator.

mod math;

pub use math::{align_to_size, bytes_to_pages, to_u32};
