//! Shared fixtures for the unit tests.

mod builder;

pub use builder::{PeBuilder, SectionSpec};
