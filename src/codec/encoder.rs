//! JPEG encoder for tiles and overviews.
//!
//! # Design Decisions
//!
//! - **Opaque RGB only**: tiles are padded with an opaque background, so
//!   there is never an alpha channel to carry.
//!
//! - **Two quality tiers**: overviews are viewed scaled down and use a moderate
//!   quality; full-resolution tiles are viewed at 1:1 and use a higher one.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageReader, RgbImage};
use std::io::Cursor;

use crate::error::CodecError;

/// Quality for thumbnail and medium overviews.
pub const DEFAULT_OVERVIEW_QUALITY: u8 = 85;

/// Quality for full-resolution tiles.
pub const DEFAULT_TILE_QUALITY: u8 = 92;

/// Minimum allowed JPEG quality.
pub const MIN_JPEG_QUALITY: u8 = 1;

/// Maximum allowed JPEG quality.
pub const MAX_JPEG_QUALITY: u8 = 100;

// =============================================================================
// JPEG Encoder
// =============================================================================

/// Stateless JPEG encoder for RGB pixel buffers.
#[derive(Debug, Clone, Default)]
pub struct JpegTileEncoder {}

impl JpegTileEncoder {
    pub fn new() -> Self {
        Self {}
    }

    /// Encode pixels as JPEG. Quality is clamped to 1-100.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] for empty buffers or encoder failures.
    pub fn encode(&self, pixels: &RgbImage, quality: u8) -> Result<Bytes, CodecError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(CodecError::Encode {
                message: "cannot encode an empty image".to_string(),
            });
        }

        let quality = clamp_quality(quality);
        let mut output = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut output, quality);

        encoder
            .encode_image(pixels)
            .map_err(|e| CodecError::Encode {
                message: e.to_string(),
            })?;

        Ok(Bytes::from(output))
    }

    /// Read the dimensions of encoded JPEG data without decoding pixels.
    pub fn dimensions(&self, data: &[u8]) -> Result<(u32, u32), CodecError> {
        let reader = ImageReader::with_format(Cursor::new(data), image::ImageFormat::Jpeg);
        reader.into_dimensions().map_err(|e| CodecError::Decode {
            message: e.to_string(),
        })
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Returns `true` if quality is in the valid range (1-100).
#[inline]
pub fn is_valid_quality(quality: u8) -> bool {
    (MIN_JPEG_QUALITY..=MAX_JPEG_QUALITY).contains(&quality)
}

/// Clamp quality to the valid range.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY)
}

// =============================================================================
// Tests
// =============================================================================
