//! [`ImageCodec`] implementation backed by the `image` crate.
//!
//! # Decode strategies
//!
//! - **Tiled or striped TIFF** (8-bit, uncompressed or JPEG): header-only
//!   dimensions, windowed region reads that decode only the chunks a region
//!   touches, overviews from the coarsest stored level. Memory use is bounded
//!   by chunk size, not image size, so gigapixel sources work under a small
//!   `max_alloc`.
//! - **Everything else** (PNG, JPEG, BMP, TIFF encodings the chunk reader does
//!   not handle): `image` decoders produce whole frames, so the source is
//!   decoded once and cropped. This path is limited to sources whose RGB frame
//!   fits in `max_alloc`; larger ones fail with a decode error and should be
//!   stored as tiled TIFF.
//!
//! Decoded chunks and frames share one LRU bounded by bytes of pixel data.

use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use image::{imageops, ImageReader, Limits, RgbImage};
use lru::LruCache;
use tracing::debug;

use crate::error::CodecError;

use super::decode_cache::{DecodeCache, DecodedPart, SourceKey, DEFAULT_DECODE_CACHE_BYTES};
use super::encoder::JpegTileEncoder;
use super::tiff::{has_tiff_signature, SourceFile, TiffLayout, TiffWindow, BIGTIFF_HEADER_SIZE};
use super::{fit_within, ImageCodec, Region, RegionSource};

/// Default ceiling on a single decode allocation (512 MiB).
pub const DEFAULT_DECODE_MAX_ALLOC: u64 = 512 * 1024 * 1024;

/// Parsed TIFF layouts kept per codec.
const LAYOUT_CACHE_ENTRIES: usize = 32;

/// Codec for JPEG, PNG, TIFF and BMP sources; encodes JPEG.
pub struct ImageCrateCodec {
    encoder: JpegTileEncoder,
    max_alloc: u64,
    decoded: DecodeCache,
    /// `None` records a source that is not a windowable TIFF
    layouts: Mutex<LruCache<SourceKey, Option<Arc<TiffLayout>>>>,
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCrateCodec {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_DECODE_CACHE_BYTES, DEFAULT_DECODE_MAX_ALLOC)
    }

    /// Create a codec with a byte-bounded decode cache and allocation ceiling.
    ///
    /// `decode_cache_bytes == 0` disables the decode cache entirely.
    pub fn with_limits(decode_cache_bytes: usize, max_alloc: u64) -> Self {
        let layout_entries = NonZeroUsize::new(LAYOUT_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            encoder: JpegTileEncoder::new(),
            max_alloc,
            decoded: DecodeCache::with_capacity(decode_cache_bytes),
            layouts: Mutex::new(LruCache::new(layout_entries)),
        }
    }

    fn unavailable(path: &Path, err: impl ToString) -> CodecError {
        CodecError::SourceUnavailable {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    fn open_reader(&self, path: &Path) -> Result<ImageReader<BufReader<File>>, CodecError> {
        let mut reader = ImageReader::open(path)
            .map_err(|e| Self::unavailable(path, e))?
            .with_guessed_format()
            .map_err(|e| Self::unavailable(path, e))?;

        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_alloc);
        reader.limits(limits);
        Ok(reader)
    }

    /// Chunk layout of `path` when it is a TIFF the window reader can serve.
    ///
    /// Reads only the header, IFDs and offset arrays. The answer, positive or
    /// negative, is remembered per source key.
    fn tiff_layout(&self, key: &SourceKey) -> Result<Option<Arc<TiffLayout>>, CodecError> {
        {
            let mut layouts = self.layouts.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(cached) = layouts.get(key) {
                return Ok(cached.clone());
            }
        }

        let source = SourceFile::open(&key.path).map_err(|e| Self::unavailable(&key.path, e))?;
        let head = source.read_prefix(0, BIGTIFF_HEADER_SIZE)?;
        let layout = if has_tiff_signature(&head) {
            match TiffLayout::parse(&source) {
                Ok(layout) if layout.base().is_windowable() => Some(Arc::new(layout)),
                Ok(layout) => {
                    debug!(
                        path = %key.path.display(),
                        reason = ?layout.base().unsupported_reason(),
                        "TIFF encoding not windowable, using full decode"
                    );
                    None
                }
                Err(err) => {
                    debug!(path = %key.path.display(), error = %err, "TIFF parse failed, using full decode");
                    None
                }
            }
        } else {
            None
        };

        let mut layouts = self.layouts.lock().unwrap_or_else(|p| p.into_inner());
        layouts.put(key.clone(), layout.clone());
        Ok(layout)
    }

    /// Open a chunk window on `path`, or `None` if it needs a full decode.
    fn window(&self, path: &Path) -> Result<Option<TiffWindow<'_>>, CodecError> {
        let key = SourceKey::for_path(path)?;
        let Some(layout) = self.tiff_layout(&key)? else {
            return Ok(None);
        };
        let source = SourceFile::open(path).map_err(|e| Self::unavailable(path, e))?;
        Ok(Some(TiffWindow::new(
            source,
            layout,
            &self.decoded,
            key,
            self.max_alloc,
        )))
    }

    /// Decode the full source to RGB, consulting the decode cache first.
    fn decode_rgb(&self, path: &Path) -> Result<Arc<RgbImage>, CodecError> {
        let key = SourceKey::for_path(path)?;
        if let Some(image) = self.decoded.get(&key, DecodedPart::Whole) {
            return Ok(image);
        }

        debug!(path = %path.display(), "Decoding whole source image");
        let decoded = self
            .open_reader(path)?
            .decode()
            .map_err(|e| match e {
                image::ImageError::IoError(io) if io.kind() == ErrorKind::NotFound => {
                    Self::unavailable(path, io)
                }
                other => CodecError::Decode {
                    message: other.to_string(),
                },
            })?;
        let rgb = Arc::new(decoded.into_rgb8());

        self.decoded.put(key, DecodedPart::Whole, Arc::clone(&rgb));
        Ok(rgb)
    }

    /// Number of decoded frames and chunks currently held.
    pub fn decoded_entries(&self) -> usize {
        self.decoded.len()
    }

    /// Bytes of decoded pixels currently held.
    pub fn decoded_bytes(&self) -> usize {
        self.decoded.size()
    }
}

fn crop(image: &RgbImage, region: Region) -> Result<RgbImage, CodecError> {
    if !region.fits_within(image.width(), image.height()) {
        return Err(CodecError::Decode {
            message: format!(
                "region {}x{}+{}+{} outside {}x{} image",
                region.width,
                region.height,
                region.x,
                region.y,
                image.width(),
                image.height()
            ),
        });
    }
    Ok(imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image())
}

struct DecodedSource {
    image: Arc<RgbImage>,
}

impl RegionSource for DecodedSource {
    fn extract(&self, region: Region) -> Result<RgbImage, CodecError> {
        crop(&self.image, region)
    }
}

impl ImageCodec for ImageCrateCodec {
    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), CodecError> {
        let key = SourceKey::for_path(path)?;
        if let Some(layout) = self.tiff_layout(&key)? {
            return Ok(layout.dimensions());
        }
        self.open_reader(path)?
            .into_dimensions()
            .map_err(|e| CodecError::Decode {
                message: e.to_string(),
            })
    }

    fn extract_region(&self, path: &Path, region: Region) -> Result<RgbImage, CodecError> {
        if let Some(window) = self.window(path)? {
            return Ok(window.read_region(0, region)?);
        }
        let image = self.decode_rgb(path)?;
        crop(&image, region)
    }

    fn downsample(&self, path: &Path, max_dimension: u32) -> Result<RgbImage, CodecError> {
        if let Some(window) = self.window(path)? {
            let (width, height) = window.layout().dimensions();
            let (w, h) = fit_within(width, height, max_dimension);
            return Ok(window.downsample(w, h)?);
        }

        let image = self.decode_rgb(path)?;
        let (width, height) = fit_within(image.width(), image.height(), max_dimension);
        if (width, height) == image.dimensions() {
            return Ok((*image).clone());
        }
        Ok(imageops::thumbnail(&*image, width, height))
    }

    fn encode(&self, pixels: &RgbImage, quality: u8) -> Result<Bytes, CodecError> {
        self.encoder.encode(pixels, quality)
    }

    fn open_source<'a>(&'a self, path: &Path) -> Result<Box<dyn RegionSource + 'a>, CodecError> {
        if let Some(window) = self.window(path)? {
            return Ok(Box::new(window));
        }
        Ok(Box::new(DecodedSource {
            image: self.decode_rgb(path)?,
        }))
    }
}
