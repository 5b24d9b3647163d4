//! Pyramid construction.
//!
//! Opening an image produces its identity, metadata and overviews. Tiles are
//! left to the [`crate::tile`] layer, except for an explicit complete build
//! which walks the whole grid up front.

mod builder;

pub use builder::{BuildOutcome, CompleteBuild, Progress, PyramidBuilder};
