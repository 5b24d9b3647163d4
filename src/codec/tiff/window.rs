//! Region reads and overviews that decode only the chunks they touch.
//!
//! ```text
//!   region ┌─────────┐
//!          │  ┌──────┼──┐      chunks (tiles or strips) intersecting the
//!          │  │ read │  │      region are decoded one at a time and copied
//!          └──┼──────┘  │      into the output; nothing else is read
//!             └─────────┘
//! ```
//!
//! Overviews stream the chosen level one band of chunk rows at a time and
//! box-average into the output, so peak memory is one band plus one output
//! row of accumulators, whatever the source size.

use std::sync::Arc;

use image::RgbImage;
use tracing::debug;

use crate::codec::decode_cache::{DecodeCache, DecodedPart, SourceKey};
use crate::codec::{Region, RegionSource};
use crate::error::{CodecError, TiffError};

use super::jpeg::{decode_jpeg, prepare_chunk_jpeg};
use super::layout::{TiffLayout, TiffLevel};
use super::tags::{Compression, Photometric};
use super::values::SourceFile;

/// An open TIFF source read chunk by chunk.
pub struct TiffWindow<'a> {
    source: SourceFile,
    layout: Arc<TiffLayout>,
    cache: &'a DecodeCache,
    key: SourceKey,
    max_alloc: u64,
}

impl<'a> TiffWindow<'a> {
    pub fn new(
        source: SourceFile,
        layout: Arc<TiffLayout>,
        cache: &'a DecodeCache,
        key: SourceKey,
        max_alloc: u64,
    ) -> Self {
        Self {
            source,
            layout,
            cache,
            key,
            max_alloc,
        }
    }

    pub fn layout(&self) -> &TiffLayout {
        &self.layout
    }

    fn level(&self, index: usize) -> Result<&TiffLevel, TiffError> {
        self.layout
            .level(index)
            .ok_or_else(|| TiffError::InvalidTagValue {
                tag: "IFD",
                message: format!("no level {}", index),
            })
    }

    fn check_alloc(&self, width: u32, height: u32) -> Result<(), TiffError> {
        let needed = width as u64 * height as u64 * 3;
        if needed > self.max_alloc {
            return Err(TiffError::MemoryLimit {
                needed,
                limit: self.max_alloc,
            });
        }
        Ok(())
    }

    /// Decoded pixels of one chunk, from the cache when present.
    fn chunk(&self, level_index: usize, index: usize) -> Result<Arc<RgbImage>, TiffError> {
        let part = DecodedPart::Chunk {
            level: level_index,
            index,
        };
        if let Some(pixels) = self.cache.get(&self.key, part) {
            return Ok(pixels);
        }

        let pixels = Arc::new(self.decode_chunk(self.level(level_index)?, index)?);
        self.cache.put(self.key.clone(), part, Arc::clone(&pixels));
        Ok(pixels)
    }

    fn decode_chunk(&self, level: &TiffLevel, index: usize) -> Result<RgbImage, TiffError> {
        let (offset, len) = level
            .chunk_location(index)
            .ok_or_else(|| TiffError::ChunkDecode {
                index,
                message: "no offset recorded".to_string(),
            })?;
        let (width, height) = level.chunk_dimensions(index);
        self.check_alloc(width, height)?;
        if len > self.max_alloc {
            return Err(TiffError::MemoryLimit {
                needed: len,
                limit: self.max_alloc,
            });
        }
        let data = self.source.read_exact_at(offset, len as usize)?;

        match level.compression() {
            Some(Compression::None) => unpack_raw(level, &data, width, height)
                .ok_or_else(|| TiffError::ChunkDecode {
                    index,
                    message: format!("{} bytes for a {}x{} chunk", data.len(), width, height),
                }),
            Some(Compression::Jpeg) => {
                let stream = prepare_chunk_jpeg(level.jpeg_tables.as_deref(), &data);
                decode_jpeg(&stream, self.max_alloc).map_err(|e| TiffError::ChunkDecode {
                    index,
                    message: e.to_string(),
                })
            }
            None => Err(TiffError::ChunkDecode {
                index,
                message: format!("compression {}", level.compression_raw),
            }),
        }
    }

    /// Read a rectangle of one level's pixels.
    pub fn read_region(&self, level_index: usize, region: Region) -> Result<RgbImage, TiffError> {
        let level = self.level(level_index)?;
        if !region.fits_within(level.width, level.height) {
            return Err(TiffError::InvalidTagValue {
                tag: "region",
                message: format!(
                    "{}x{}+{}+{} outside {}x{} image",
                    region.width, region.height, region.x, region.y, level.width, level.height
                ),
            });
        }
        self.check_alloc(region.width, region.height)?;

        let mut out = RgbImage::new(region.width, region.height);
        let right = region.x + region.width;
        let bottom = region.y + region.height;

        for cy in region.y / level.chunk_height..=(bottom - 1) / level.chunk_height {
            for cx in region.x / level.chunk_width..=(right - 1) / level.chunk_width {
                let Some(index) = level.chunk_index(cx, cy) else {
                    continue;
                };
                let chunk = self.chunk(level_index, index)?;
                let (ox, oy) = level.chunk_origin(index);

                // Intersection in level coordinates
                let x0 = region.x.max(ox);
                let x1 = right.min(ox + chunk.width());
                let y0 = region.y.max(oy);
                let y1 = bottom.min(oy + chunk.height());
                if x0 >= x1 || y0 >= y1 {
                    continue;
                }

                let span = (x1 - x0) as usize * 3;
                let src = chunk.as_raw();
                let dst_width = region.width as usize;
                let dst = &mut *out;
                for y in y0..y1 {
                    let s = ((y - oy) as usize * chunk.width() as usize + (x0 - ox) as usize) * 3;
                    let d = ((y - region.y) as usize * dst_width + (x0 - region.x) as usize) * 3;
                    dst[d..d + span].copy_from_slice(&src[s..s + span]);
                }
            }
        }

        Ok(out)
    }

    /// Box-filtered copy of the image at exactly `width × height`.
    ///
    /// Reads from the coarsest level that still covers the target size.
    pub fn downsample(&self, width: u32, height: u32) -> Result<RgbImage, TiffError> {
        let level_index = self.layout.best_level_for_size(width, height);
        let level = self.level(level_index)?;
        let (lw, lh) = (level.width, level.height);
        debug!(
            level = level_index,
            level_width = lw,
            level_height = lh,
            width,
            height,
            "Building overview from TIFF level"
        );

        if (lw, lh) == (width, height) {
            return self.read_region(
                level_index,
                Region {
                    x: 0,
                    y: 0,
                    width,
                    height,
                },
            );
        }
        if lw < width || lh < height {
            return Err(TiffError::InvalidTagValue {
                tag: "overview",
                message: format!("{}x{} level cannot cover {}x{}", lw, lh, width, height),
            });
        }
        self.check_alloc(width, height)?;

        // Output column of every source column; each output column gets >= 1
        let columns: Vec<usize> = (0..lw as u64)
            .map(|sx| (sx * width as u64 / lw as u64) as usize)
            .collect();

        let mut out = RgbImage::new(width, height);
        let mut sums = vec![[0u64; 3]; width as usize];
        let mut counts = vec![0u64; width as usize];
        let mut out_row = 0u32;

        let band_height = level.chunk_height;
        let mut band_index = u32::MAX;
        let mut band = RgbImage::new(0, 0);

        for sy in 0..lh {
            let oy = (sy as u64 * height as u64 / lh as u64) as u32;
            if oy != out_row {
                flush_row(&mut out, out_row, &mut sums, &mut counts);
                out_row = oy;
            }

            if sy / band_height != band_index {
                band_index = sy / band_height;
                let top = band_index * band_height;
                band = self.read_region(
                    level_index,
                    Region {
                        x: 0,
                        y: top,
                        width: lw,
                        height: band_height.min(lh - top),
                    },
                )?;
            }

            let row_start = (sy - band_index * band_height) as usize * lw as usize * 3;
            let row = &band.as_raw()[row_start..row_start + lw as usize * 3];
            for (pixel, &ox) in row.chunks_exact(3).zip(&columns) {
                let sum = &mut sums[ox];
                sum[0] += pixel[0] as u64;
                sum[1] += pixel[1] as u64;
                sum[2] += pixel[2] as u64;
                counts[ox] += 1;
            }
        }
        flush_row(&mut out, out_row, &mut sums, &mut counts);

        Ok(out)
    }
}

impl RegionSource for TiffWindow<'_> {
    fn extract(&self, region: Region) -> Result<RgbImage, CodecError> {
        Ok(self.read_region(0, region)?)
    }
}

/// Write averaged accumulators to output row `y` and reset them.
fn flush_row(out: &mut RgbImage, y: u32, sums: &mut [[u64; 3]], counts: &mut [u64]) {
    for (x, (sum, count)) in sums.iter_mut().zip(counts.iter_mut()).enumerate() {
        if *count > 0 {
            let half = *count / 2;
            let pixel = out.get_pixel_mut(x as u32, y);
            for c in 0..3 {
                pixel.0[c] = ((sum[c] + half) / *count) as u8;
            }
        }
        *sum = [0; 3];
        *count = 0;
    }
}

/// Convert uncompressed 8-bit samples to RGB.
///
/// Returns `None` when `data` is too short for the chunk.
fn unpack_raw(level: &TiffLevel, data: &[u8], width: u32, height: u32) -> Option<RgbImage> {
    let spp = level.samples_per_pixel as usize;
    let pixels = width as usize * height as usize;
    let data = data.get(..pixels.checked_mul(spp)?)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    match level.photometric()? {
        Photometric::Rgb => {
            for px in data.chunks_exact(spp) {
                rgb.extend_from_slice(&px[..3]);
            }
        }
        Photometric::BlackIsZero => {
            for px in data.chunks_exact(spp) {
                rgb.extend_from_slice(&[px[0]; 3]);
            }
        }
        Photometric::WhiteIsZero => {
            for px in data.chunks_exact(spp) {
                rgb.extend_from_slice(&[255 - px[0]; 3]);
            }
        }
        Photometric::YCbCr => return None,
    }
    RgbImage::from_raw(width, height, rgb)
}

// =============================================================================
// Tests
// =============================================================================
