//! On-disk persistence for cache entries.
//!
//! - [`CacheStore`]: all filesystem I/O for one cache root
//! - [`PyramidMetadata`]: the `metadata.json` document and tile-grid math
//! - [`TileNamespace`]: base and affine tile subtrees

mod disk;
mod metadata;

pub use disk::{
    check_metadata, CacheStats, CacheStore, InvalidReason, TileNamespace, Validity,
    DEFAULT_EXTENSION, METADATA_FILE,
};
pub use metadata::{PyramidMetadata, CACHE_VERSION};
