//! # Pyramid Cache
//!
//! A persistent tile cache for arbitrarily large raster images.
//!
//! Opening an image computes a cheap identity (path and size, no content read),
//! records its dimensions and builds a small thumbnail, plus a medium overview
//! for large sources. Full-resolution tiles are generated only when first
//! requested and are kept on disk from then on, so a viewer can pan and zoom
//! over multi-gigapixel images without a full decode on open.
//!
//! ## Features
//!
//! - **Lazy tiling**: fixed-size tiles generated on demand, edge tiles padded
//! - **Persistent layout**: `<root>/<identity>/{metadata.json, thumbnail.jpg, medium.jpg, tiles/}`
//! - **Atomic writes**: no truncated tile is ever visible
//! - **Request coalescing**: concurrent requests for one tile decode once
//! - **Bounded decoding**: a semaphore and an allocation ceiling cap codec memory
//! - **HTTP API**: axum router over every cache operation
//!
//! ## Architecture
//!
//! - [`identity`] - Identity derivation
//! - [`store`] - On-disk layout and metadata
//! - [`codec`] - Decode/encode capability and throttling
//! - [`tile`] - Tile generation and memory layer
//! - [`pyramid`] - Entry building
//! - [`manager`] - Façade over all of the above
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use pyramid_cache::{CacheConfig, CacheManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pyramid_cache::CacheError> {
//!     let manager = CacheManager::with_default_codec(CacheConfig::new("/tmp/pyramids"))?;
//!
//!     let image = manager.load_image(Path::new("/data/scan.tif")).await?;
//!     println!("{} is {}x{}", image.identity, image.metadata.width, image.metadata.height);
//!
//!     let tile = manager.load_tile(&image.identity, 0, 0).await?;
//!     println!("tile (0, 0): {} bytes", tile.data.len());
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
mod flight;
pub mod identity;
pub mod manager;
pub mod pyramid;
pub mod server;
pub mod store;
pub mod tile;

// Re-export commonly used types
pub use codec::{fit_within, CodecPool, ImageCodec, ImageCrateCodec, Region, RegionSource};
pub use config::{CacheArgs, CacheConfig, Cli, Command, ServeConfig};
pub use error::{CacheError, CodecError, TiffError};
pub use identity::{identify, ImageIdentity};
pub use manager::{CacheManager, CacheState, LoadedImage};
pub use pyramid::{BuildOutcome, CompleteBuild, Progress, PyramidBuilder};
pub use server::{create_router, AppState, ErrorResponse, RouterConfig};
pub use store::{CacheStats, CacheStore, PyramidMetadata, TileNamespace, CACHE_VERSION};
pub use tile::{TileExtractor, TileKey, TileMemoryCache, TileResponse};
