//! Configuration management for Pyramid Cache.
//!
//! Two layers:
//! - [`CacheConfig`]: plain library configuration injected into
//!   [`crate::CacheManager::new`]. No global default root is ever assumed.
//! - [`Cli`]: command-line arguments via clap, with `PYRAMID_`-prefixed
//!   environment variables for every option.
//!
//! # Environment Variables
//!
//! - `PYRAMID_CACHE_DIR` - Cache root (default: platform cache dir + `pyramid-cache`)
//! - `PYRAMID_TILE_SIZE` - Tile edge in pixels (default: 256)
//! - `PYRAMID_THUMBNAIL_SIZE` - Thumbnail bounding box (default: 512)
//! - `PYRAMID_MEDIUM_SIZE` - Medium overview bounding box (default: 2048)
//! - `PYRAMID_OVERVIEW_QUALITY` - JPEG quality of overviews (default: 85)
//! - `PYRAMID_TILE_QUALITY` - JPEG quality of tiles (default: 92)
//! - `PYRAMID_DECODE_CONCURRENCY` - Simultaneous codec jobs (default: 2)
//! - `PYRAMID_DECODE_CACHE_BYTES` - Decoded pixels kept in memory (default: 64 MiB)
//! - `PYRAMID_DECODE_MAX_ALLOC` - Per-decode allocation ceiling (default: 512 MiB)
//! - `PYRAMID_MEMORY_CACHE_BYTES` - In-memory tile cache (default: 64 MiB)
//! - `PYRAMID_HOST` / `PYRAMID_PORT` - Server bind address (default: 0.0.0.0:3000)
//! - `PYRAMID_CORS_ORIGINS` - Allowed CORS origins, comma-separated
//! - `PYRAMID_CACHE_MAX_AGE` - HTTP cache max-age seconds (default: 3600)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::codec::{
    is_valid_quality, DEFAULT_DECODE_CACHE_BYTES, DEFAULT_DECODE_CONCURRENCY,
    DEFAULT_DECODE_MAX_ALLOC, DEFAULT_OVERVIEW_QUALITY, DEFAULT_TILE_QUALITY,
};
use crate::tile::DEFAULT_MEMORY_CACHE_BYTES;

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default HTTP cache max-age in seconds (1 hour).
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

/// Default tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default thumbnail bounding box.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 512;

/// Default medium overview bounding box.
pub const DEFAULT_MEDIUM_SIZE: u32 = 2048;

/// Directory created under the platform cache dir when no root is given.
pub const DEFAULT_CACHE_DIR_NAME: &str = "pyramid-cache";

/// Largest accepted tile edge.
const MAX_TILE_SIZE: u32 = 8192;

// =============================================================================
// Library Configuration
// =============================================================================

/// Settings for a [`crate::CacheManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Cache root; one subdirectory per image identity
    pub root_dir: PathBuf,

    pub tile_size: u32,
    pub thumbnail_size: u32,
    pub medium_size: u32,
    pub overview_quality: u8,
    pub tile_quality: u8,

    /// Codec jobs allowed to run at once
    pub decode_concurrency: usize,

    /// Bytes of decoded pixels kept by the default codec (0 disables)
    pub decode_cache_bytes: usize,

    /// Allocation ceiling for a single decode, in bytes
    pub decode_max_alloc: u64,

    /// Byte capacity of the in-memory tile layer (0 disables)
    pub memory_cache_bytes: usize,
}

impl CacheConfig {
    /// Default settings rooted at `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            tile_size: DEFAULT_TILE_SIZE,
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            medium_size: DEFAULT_MEDIUM_SIZE,
            overview_quality: DEFAULT_OVERVIEW_QUALITY,
            tile_quality: DEFAULT_TILE_QUALITY,
            decode_concurrency: DEFAULT_DECODE_CONCURRENCY,
            decode_cache_bytes: DEFAULT_DECODE_CACHE_BYTES,
            decode_max_alloc: DEFAULT_DECODE_MAX_ALLOC,
            memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
        }
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.root_dir.as_os_str().is_empty() {
            return Err("cache root directory must not be empty".to_string());
        }

        if self.tile_size == 0 || self.tile_size > MAX_TILE_SIZE {
            return Err(format!("tile_size must be between 1 and {}", MAX_TILE_SIZE));
        }
        if self.thumbnail_size == 0 {
            return Err("thumbnail_size must be greater than 0".to_string());
        }
        if self.medium_size < self.thumbnail_size {
            return Err("medium_size must not be smaller than thumbnail_size".to_string());
        }

        if !is_valid_quality(self.overview_quality) {
            return Err("overview_quality must be between 1 and 100".to_string());
        }
        if !is_valid_quality(self.tile_quality) {
            return Err("tile_quality must be between 1 and 100".to_string());
        }

        if self.decode_concurrency == 0 {
            return Err("decode_concurrency must be greater than 0".to_string());
        }
        if self.decode_max_alloc == 0 {
            return Err("decode_max_alloc must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Platform default cache root, e.g. `~/.cache/pyramid-cache` on Linux.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join(DEFAULT_CACHE_DIR_NAME))
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pyramid Cache - persistent tile pyramids for very large images.
///
/// Opens raster images, caches a thumbnail and medium overview, and serves
/// fixed-size tiles generated on demand.
#[derive(Parser, Debug, Clone)]
#[command(name = "pyramid-cache")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP tile server.
    Serve(ServeConfig),

    /// Open an image: compute its identity and build metadata and overviews.
    Open(ImageCommand),

    /// Build an image's entry and every tile of its grid.
    Warm(ImageCommand),

    /// Print cache statistics.
    Stats(CacheArgs),

    /// Remove one cache entry, or the whole cache.
    Clear(ClearCommand),
}

/// Cache options shared by every subcommand.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct CacheArgs {
    /// Cache root directory.
    #[arg(long, env = "PYRAMID_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Tile edge in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "PYRAMID_TILE_SIZE")]
    pub tile_size: u32,

    /// Thumbnail bounding box in pixels.
    #[arg(long, default_value_t = DEFAULT_THUMBNAIL_SIZE, env = "PYRAMID_THUMBNAIL_SIZE")]
    pub thumbnail_size: u32,

    /// Medium overview bounding box in pixels.
    ///
    /// Images larger than this get a medium overview when opened; smaller ones
    /// get it on first request.
    #[arg(long, default_value_t = DEFAULT_MEDIUM_SIZE, env = "PYRAMID_MEDIUM_SIZE")]
    pub medium_size: u32,

    /// JPEG quality of thumbnail and medium overviews (1-100).
    #[arg(long, default_value_t = DEFAULT_OVERVIEW_QUALITY, env = "PYRAMID_OVERVIEW_QUALITY")]
    pub overview_quality: u8,

    /// JPEG quality of tiles (1-100).
    #[arg(long, default_value_t = DEFAULT_TILE_QUALITY, env = "PYRAMID_TILE_QUALITY")]
    pub tile_quality: u8,

    /// Maximum number of simultaneous decode/encode jobs.
    #[arg(long, default_value_t = DEFAULT_DECODE_CONCURRENCY, env = "PYRAMID_DECODE_CONCURRENCY")]
    pub decode_concurrency: usize,

    /// Bytes of decoded pixels (TIFF chunks, small whole images) kept in memory (0 disables).
    #[arg(long, default_value_t = DEFAULT_DECODE_CACHE_BYTES, env = "PYRAMID_DECODE_CACHE_BYTES")]
    pub decode_cache_bytes: usize,

    /// Allocation ceiling for one decode, in bytes.
    ///
    /// Non-TIFF sources are decoded whole, so this also caps their size.
    #[arg(long, default_value_t = DEFAULT_DECODE_MAX_ALLOC, env = "PYRAMID_DECODE_MAX_ALLOC")]
    pub decode_max_alloc: u64,

    /// Byte capacity of the in-memory tile cache (0 disables).
    #[arg(long, default_value_t = DEFAULT_MEMORY_CACHE_BYTES, env = "PYRAMID_MEMORY_CACHE_BYTES")]
    pub memory_cache_bytes: usize,
}

impl CacheArgs {
    /// Resolve the cache root: explicit flag first, then the platform default.
    pub fn resolve_root(&self) -> Result<PathBuf, String> {
        self.cache_dir.clone().or_else(default_cache_dir).ok_or_else(|| {
            "No cache directory available. Set --cache-dir or PYRAMID_CACHE_DIR".to_string()
        })
    }

    /// Build and validate the library configuration.
    pub fn to_cache_config(&self) -> Result<CacheConfig, String> {
        let config = CacheConfig {
            root_dir: self.resolve_root()?,
            tile_size: self.tile_size,
            thumbnail_size: self.thumbnail_size,
            medium_size: self.medium_size,
            overview_quality: self.overview_quality,
            tile_quality: self.tile_quality,
            decode_concurrency: self.decode_concurrency,
            decode_cache_bytes: self.decode_cache_bytes,
            decode_max_alloc: self.decode_max_alloc,
            memory_cache_bytes: self.memory_cache_bytes,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Options for `serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "PYRAMID_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "PYRAMID_PORT")]
    pub port: u16,

    /// HTTP Cache-Control max-age in seconds for tiles and overviews.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "PYRAMID_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "PYRAMID_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    #[command(flatten)]
    pub cache: CacheArgs,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        if let Some(origins) = &self.cors_origins {
            if origins.iter().any(|o| o.trim().is_empty()) {
                return Err("cors_origins must not contain empty entries".to_string());
            }
        }
        self.cache.to_cache_config().map(|_| ())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Options for `open` and `warm`.
#[derive(Args, Debug, Clone)]
pub struct ImageCommand {
    /// Path of the source image.
    pub path: PathBuf,

    #[command(flatten)]
    pub cache: CacheArgs,
}

/// Options for `clear`.
#[derive(Args, Debug, Clone)]
pub struct ClearCommand {
    /// Identity of the entry to remove. Without it the whole cache is cleared.
    #[arg(long)]
    pub identity: Option<String>,

    #[command(flatten)]
    pub cache: CacheArgs,
}

// =============================================================================
// Tests
// =============================================================================
