//! Tile layer.
//!
//! Tiles are produced lazily: nothing is generated when an image is opened,
//! and each tile is extracted the first time it is requested.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              CacheManager               │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             TileExtractor               │
//! │  ┌──────────────────┐  ┌─────────────┐  │
//! │  │ TileMemoryCache  │  │ single-     │  │
//! │  │ (hot bytes, LRU) │  │ flight map  │  │
//! │  └──────────────────┘  └─────────────┘  │
//! └──────────┬─────────────────────┬────────┘
//!            │ miss                │ generate
//!            ▼                     ▼
//! ┌────────────────────┐ ┌──────────────────┐
//! │     CacheStore     │ │    CodecPool     │
//! └────────────────────┘ └──────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileExtractor`]: memory → disk → generate, with write-through
//! - [`TileMemoryCache`]: byte-bounded LRU of encoded tiles
//! - [`TileKey`]: identity, namespace and grid coordinates of a tile
//! - [`TileResponse`]: encoded bytes plus whether they were already cached

mod extractor;
mod memory;

pub use extractor::{pad_tile, TileExtractor, TileResponse, TILE_BACKGROUND};
pub use memory::{TileKey, TileMemoryCache, DEFAULT_MEMORY_CACHE_BYTES};
