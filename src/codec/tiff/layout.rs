//! Chunk layout of a TIFF file and its reduced-resolution levels.
//!
//! A TIFF stores pixels in independently compressed *chunks*: square tiles
//! (TileWidth/TileLength) or full-width strips (RowsPerStrip). Knowing each
//! chunk's byte range is enough to decode any rectangle by reading only the
//! chunks it touches.
//!
//! # Levels
//!
//! The first IFD is the full-resolution image (level 0). Later IFDs that are
//! smaller with the same aspect ratio are treated as reduced-resolution copies
//! and become further levels, sorted by downsample factor. Masks and IFDs of
//! a different shape (labels, previews of other content) are ignored.

use std::collections::HashSet;

use tracing::debug;

use crate::error::TiffError;

use super::parser::{Ifd, TiffHeader, BIGTIFF_HEADER_SIZE};
use super::tags::{Compression, Photometric, TiffTag};
use super::values::{SourceFile, ValueReader};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of IFDs to parse (safety limit)
const MAX_IFDS: usize = 100;

/// Largest relative difference between horizontal and vertical downsample
/// for an IFD to count as a level of the base image
const ASPECT_TOLERANCE: f64 = 0.1;

/// NewSubfileType bit marking a transparency mask
const SUBFILE_MASK: u32 = 4;

/// RowsPerStrip default: the whole image is one strip
const DEFAULT_ROWS_PER_STRIP: u32 = u32::MAX;

// =============================================================================
// TiffLevel
// =============================================================================

/// One resolution of the image and the location of its chunks.
#[derive(Debug, Clone)]
pub struct TiffLevel {
    /// Index of the IFD in the file's IFD chain
    pub ifd_index: usize,

    pub width: u32,
    pub height: u32,

    /// Tile size, or `(width, rows_per_strip)` for strips
    pub chunk_width: u32,
    pub chunk_height: u32,

    pub chunks_across: u32,
    pub chunks_down: u32,

    pub tiled: bool,

    /// Byte offset of each chunk in the file
    pub offsets: Vec<u64>,

    /// Byte count of each chunk
    pub byte_counts: Vec<u64>,

    pub compression_raw: u16,
    pub photometric_raw: u16,
    pub samples_per_pixel: u16,
    pub bits_per_sample: Vec<u16>,
    pub planar_configuration: u16,

    /// JPEGTables shared by every chunk of this level
    pub jpeg_tables: Option<Vec<u8>>,

    /// Downsample factor relative to level 0 (1.0 for level 0)
    pub downsample: f64,
}

impl TiffLevel {
    /// Build a level from a parsed IFD.
    ///
    /// Returns `None` when the IFD lacks image dimensions.
    fn from_ifd(
        ifd: &Ifd,
        ifd_index: usize,
        values: &ValueReader<'_>,
    ) -> Result<Option<Self>, TiffError> {
        let order = values.byte_order();
        let (Some(width), Some(height)) = (ifd.image_width(order), ifd.image_height(order)) else {
            return Ok(None);
        };
        if width == 0 || height == 0 {
            return Ok(None);
        }

        let tiled = ifd.is_tiled();
        let (chunk_width, chunk_height, offsets_tag, counts_tag) = if tiled {
            (
                ifd.tile_width(order).ok_or(TiffError::MissingTag("TileWidth"))?,
                ifd.tile_height(order).ok_or(TiffError::MissingTag("TileLength"))?,
                TiffTag::TileOffsets,
                TiffTag::TileByteCounts,
            )
        } else {
            let rows = ifd
                .get_u32(TiffTag::RowsPerStrip, order)
                .unwrap_or(DEFAULT_ROWS_PER_STRIP);
            (width, rows.min(height), TiffTag::StripOffsets, TiffTag::StripByteCounts)
        };
        if chunk_width == 0 || chunk_height == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: if tiled { "TileWidth" } else { "RowsPerStrip" },
                message: "chunk dimension is zero".to_string(),
            });
        }

        let read_array = |tag: TiffTag| -> Result<Vec<u64>, TiffError> {
            let entry = ifd
                .get_entry_by_tag(tag)
                .ok_or(TiffError::MissingTag(tag.name()))?;
            values.read_u64_array(entry)
        };
        let offsets = read_array(offsets_tag)?;
        let byte_counts = read_array(counts_tag)?;

        let bits_per_sample = match ifd.get_entry_by_tag(TiffTag::BitsPerSample) {
            Some(entry) => values
                .read_u64_array(entry)?
                .into_iter()
                .map(|v| v.min(u16::MAX as u64) as u16)
                .collect(),
            None => vec![1],
        };

        let jpeg_tables = ifd
            .get_entry_by_tag(TiffTag::JpegTables)
            .map(|entry| values.read_bytes(entry))
            .transpose()?;

        let short = |tag: TiffTag, default: u16| {
            ifd.get_u32(tag, order)
                .map(|v| v.min(u16::MAX as u32) as u16)
                .unwrap_or(default)
        };

        Ok(Some(TiffLevel {
            ifd_index,
            width,
            height,
            chunk_width,
            chunk_height,
            chunks_across: width.div_ceil(chunk_width),
            chunks_down: height.div_ceil(chunk_height),
            tiled,
            offsets,
            byte_counts,
            compression_raw: short(TiffTag::Compression, 1),
            photometric_raw: short(TiffTag::PhotometricInterpretation, 1),
            samples_per_pixel: short(TiffTag::SamplesPerPixel, 1),
            bits_per_sample,
            planar_configuration: short(TiffTag::PlanarConfiguration, 1),
            jpeg_tables,
            downsample: 1.0,
        }))
    }

    pub fn compression(&self) -> Option<Compression> {
        Compression::from_u16(self.compression_raw)
    }

    pub fn photometric(&self) -> Option<Photometric> {
        Photometric::from_u16(self.photometric_raw)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks_across as usize * self.chunks_down as usize
    }

    /// Why the chunk reader cannot decode this level, if it cannot.
    pub fn unsupported_reason(&self) -> Option<String> {
        let Some(compression) = self.compression() else {
            return Some(format!("compression {}", self.compression_raw));
        };
        if self.planar_configuration != 1 {
            return Some("planar configuration 2".to_string());
        }
        if self.bits_per_sample.iter().any(|&b| b != 8) {
            return Some(format!("bits per sample {:?}", self.bits_per_sample));
        }
        let spp = self.samples_per_pixel;
        let color_ok = match (self.photometric(), compression) {
            (Some(Photometric::WhiteIsZero | Photometric::BlackIsZero), _) => (1..=2).contains(&spp),
            (Some(Photometric::Rgb), _) => spp >= 3,
            (Some(Photometric::YCbCr), Compression::Jpeg) => spp == 3,
            _ => false,
        };
        if !color_ok {
            return Some(format!(
                "photometric {} with {} samples",
                self.photometric_raw, spp
            ));
        }
        if self.offsets.len() < self.chunk_count() || self.byte_counts.len() < self.chunk_count() {
            return Some(format!(
                "{} chunk offsets for {} chunks",
                self.offsets.len().min(self.byte_counts.len()),
                self.chunk_count()
            ));
        }
        None
    }

    /// Whether regions of this level can be read chunk by chunk.
    pub fn is_windowable(&self) -> bool {
        self.unsupported_reason().is_none()
    }

    /// Index of the chunk at grid position `(cx, cy)`.
    pub fn chunk_index(&self, cx: u32, cy: u32) -> Option<usize> {
        if cx >= self.chunks_across || cy >= self.chunks_down {
            return None;
        }
        Some(cy as usize * self.chunks_across as usize + cx as usize)
    }

    /// Top-left pixel of a chunk in level coordinates.
    pub fn chunk_origin(&self, index: usize) -> (u32, u32) {
        let across = self.chunks_across as usize;
        (
            (index % across) as u32 * self.chunk_width,
            (index / across) as u32 * self.chunk_height,
        )
    }

    /// Stored pixel dimensions of a chunk.
    ///
    /// Tiles are always stored at full tile size, padding included. The last
    /// strip only holds the rows that remain.
    pub fn chunk_dimensions(&self, index: usize) -> (u32, u32) {
        if self.tiled {
            return (self.chunk_width, self.chunk_height);
        }
        let (_, y) = self.chunk_origin(index);
        (self.width, self.chunk_height.min(self.height - y))
    }

    /// Byte range of a chunk.
    pub fn chunk_location(&self, index: usize) -> Option<(u64, u64)> {
        Some((*self.offsets.get(index)?, *self.byte_counts.get(index)?))
    }
}

// =============================================================================
// TiffLayout
// =============================================================================

/// Every readable level of a TIFF file, level 0 first.
#[derive(Debug, Clone)]
pub struct TiffLayout {
    pub header: TiffHeader,
    pub levels: Vec<TiffLevel>,
}

impl TiffLayout {
    /// Parse the header and IFD chain and locate every level's chunks.
    ///
    /// Only IFD entries and offset arrays are read, never pixel data.
    pub fn parse(source: &SourceFile) -> Result<Self, TiffError> {
        let head = source.read_prefix(0, BIGTIFF_HEADER_SIZE)?;
        let header = TiffHeader::parse(&head, source.size())?;
        let values = ValueReader::new(source, &header);

        let mut levels: Vec<TiffLevel> = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = header.first_ifd_offset;

        while offset != 0 && seen.len() < MAX_IFDS && seen.insert(offset) {
            let count_bytes = source.read_exact_at(offset, header.ifd_count_size())?;
            let entry_count = header.read_entry_count(&count_bytes)?;
            let ifd_size = Ifd::calculate_size(entry_count, &header);
            let ifd = Ifd::parse(&source.read_exact_at(offset, ifd_size)?, &header)?;
            let ifd_index = seen.len() - 1;
            offset = ifd.next_ifd_offset;

            let subfile = ifd
                .get_u32(TiffTag::NewSubfileType, header.byte_order)
                .unwrap_or(0);
            if subfile & SUBFILE_MASK != 0 {
                continue;
            }

            match TiffLevel::from_ifd(&ifd, ifd_index, &values) {
                Ok(Some(level)) => levels.push(level),
                Ok(None) => {}
                // A broken secondary IFD must not hide a readable base image
                Err(err) if !levels.is_empty() => {
                    debug!(ifd_index, error = %err, "Skipping unreadable IFD");
                }
                Err(err) => return Err(err),
            }
        }

        let Some(base) = levels.first() else {
            return Err(TiffError::MissingTag("ImageWidth"));
        };
        let (base_width, base_height) = (base.width as f64, base.height as f64);

        let mut levels: Vec<TiffLevel> = levels
            .into_iter()
            .enumerate()
            .filter_map(|(i, mut level)| {
                let downsample_x = base_width / level.width as f64;
                let downsample_y = base_height / level.height as f64;
                let consistent = (downsample_x - downsample_y).abs()
                    <= ASPECT_TOLERANCE * downsample_x.max(downsample_y);
                if i > 0 && (downsample_x <= 1.0 || downsample_y <= 1.0 || !consistent) {
                    return None;
                }
                level.downsample = (downsample_x + downsample_y) / 2.0;
                Some(level)
            })
            .collect();
        levels.sort_by(|a, b| a.downsample.total_cmp(&b.downsample));

        Ok(TiffLayout { header, levels })
    }

    /// The full-resolution level.
    ///
    /// `parse` never yields an empty layout.
    pub fn base(&self) -> &TiffLevel {
        &self.levels[0]
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.base().width, self.base().height)
    }

    pub fn level(&self, index: usize) -> Option<&TiffLevel> {
        self.levels.get(index)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Coarsest readable level at least `width × height` pixels.
    ///
    /// Downscaling from this level gives an overview of that size while
    /// reading as few pixels as possible. Falls back to level 0.
    pub fn best_level_for_size(&self, width: u32, height: u32) -> usize {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_windowable() && l.width >= width && l.height >= height)
            .max_by(|(_, a), (_, b)| a.downsample.total_cmp(&b.downsample))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================
