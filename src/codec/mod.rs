//! Image codec capability.
//!
//! The cache never talks to a concrete decoder. It depends on the
//! [`ImageCodec`] trait, injected at construction:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ PyramidBuilder TileExtractor │
//! └──────────────┬───────────────┘
//!                │  run(|codec| ...)
//!                ▼
//! ┌──────────────────────────────┐
//! │          CodecPool           │  semaphore-bounded spawn_blocking
//! └──────────────┬───────────────┘
//!                ▼
//! ┌──────────────────────────────┐
//! │      impl ImageCodec         │  e.g. ImageCrateCodec
//! └──────────────────────────────┘
//! ```
//!
//! Codec calls are synchronous and CPU bound, so they always run on the
//! blocking thread pool. [`CodecPool`] caps how many run at once: together with
//! the codec's byte-bounded decode cache and per-decode allocation ceiling this
//! puts a hard limit on peak memory when several very large sources are touched
//! together.

mod decode_cache;
mod encoder;
mod image_codec;
pub mod tiff;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use image::RgbImage;
use tokio::sync::Semaphore;

use crate::error::{CacheError, CodecError};

pub use encoder::{
    clamp_quality, is_valid_quality, JpegTileEncoder, DEFAULT_OVERVIEW_QUALITY,
    DEFAULT_TILE_QUALITY, MAX_JPEG_QUALITY, MIN_JPEG_QUALITY,
};
pub use decode_cache::{DecodeCache, DecodedPart, SourceKey, DEFAULT_DECODE_CACHE_BYTES};
pub use image_codec::{ImageCrateCodec, DEFAULT_DECODE_MAX_ALLOC};

/// Default number of codec jobs allowed to run at once.
pub const DEFAULT_DECODE_CONCURRENCY: usize = 2;

// =============================================================================
// Region
// =============================================================================

/// A rectangle of source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Whether the region lies entirely inside a `width × height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= width)
            && self.y.checked_add(self.height).is_some_and(|b| b <= height)
    }
}

/// Largest `(w, h)` that fits inside a `max × max` box with the same aspect ratio.
///
/// Never upscales and never returns a zero dimension.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max || longest == 0 {
        return (width, height);
    }
    let scale = max as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).clamp(1, max);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max);
    (w, h)
}

// =============================================================================
// Codec Trait
// =============================================================================

/// Format-specific decode/encode capability consumed by the cache.
pub trait ImageCodec: Send + Sync + 'static {
    /// Read `(width, height)` from the image header without decoding pixels.
    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), CodecError>;

    /// Extract one rectangle of pixels.
    fn extract_region(&self, path: &Path, region: Region) -> Result<RgbImage, CodecError>;

    /// Produce a copy of the whole image fitting inside `max_dimension` pixels.
    fn downsample(&self, path: &Path, max_dimension: u32) -> Result<RgbImage, CodecError>;

    /// Encode pixels at the given quality (1-100).
    fn encode(&self, pixels: &RgbImage, quality: u8) -> Result<Bytes, CodecError>;

    /// Open the source for several region extractions.
    ///
    /// Codecs that must decode the whole image anyway override this to decode
    /// once and share the buffer. The default extracts each region separately.
    fn open_source<'a>(&'a self, path: &Path) -> Result<Box<dyn RegionSource + 'a>, CodecError> {
        Ok(Box::new(WindowedSource {
            codec: self,
            path: path.to_path_buf(),
        }))
    }

    /// File extension of encoded output.
    fn extension(&self) -> &'static str {
        "jpg"
    }

    /// MIME type of encoded output.
    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }
}

/// An opened source that regions can be pulled from repeatedly.
pub trait RegionSource {
    fn extract(&self, region: Region) -> Result<RgbImage, CodecError>;
}

struct WindowedSource<'a, C: ?Sized> {
    codec: &'a C,
    path: PathBuf,
}

impl<C: ImageCodec + ?Sized> RegionSource for WindowedSource<'_, C> {
    fn extract(&self, region: Region) -> Result<RgbImage, CodecError> {
        self.codec.extract_region(&self.path, region)
    }
}

// =============================================================================
// Codec Pool
// =============================================================================

/// Runs codec jobs on the blocking pool, at most `concurrency` at a time.
pub struct CodecPool<C> {
    codec: Arc<C>,
    permits: Arc<Semaphore>,
}

impl<C> Clone for CodecPool<C> {
    fn clone(&self) -> Self {
        Self {
            codec: Arc::clone(&self.codec),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<C: ImageCodec> CodecPool<C> {
    pub fn new(codec: C, concurrency: usize) -> Self {
        Self::with_shared_codec(Arc::new(codec), concurrency)
    }

    pub fn with_shared_codec(codec: Arc<C>, concurrency: usize) -> Self {
        Self {
            codec,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    /// Run `job` against the codec on a blocking thread.
    ///
    /// The permit is held by the blocking task itself, so it is released only
    /// when the codec work finishes, even if the awaiting future is dropped.
    pub async fn run<T, F>(&self, job: F) -> Result<T, CacheError>
    where
        F: FnOnce(&C) -> Result<T, CodecError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?;
        let codec = Arc::clone(&self.codec);

        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job(&*codec)
        })
        .await?;

        Ok(result?)
    }

    /// Number of jobs that could start right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

// =============================================================================
// Tests
// =============================================================================
