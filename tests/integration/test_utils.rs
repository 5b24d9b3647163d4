//! Shared fixtures for integration tests.
//!
//! Source images are generated on the fly with the `image` crate into a
//! temporary directory, next to a temporary cache root.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

use pyramid_cache::{
    CacheConfig, CacheManager, CodecError, ImageCodec, ImageCrateCodec, Region, RegionSource,
};

// =============================================================================
// Test Environment
// =============================================================================

/// A temporary directory holding both source images and the cache root.
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn config(&self) -> CacheConfig {
        CacheConfig::new(self.cache_root())
    }

    pub fn manager(&self) -> CacheManager {
        CacheManager::with_default_codec(self.config()).unwrap()
    }

    /// Write a gradient PNG of the given size.
    pub fn png(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        gradient(width, height).save(&path).unwrap();
        path
    }

    /// Write a solid BMP. BMP is uncompressed, so equal dimensions mean equal
    /// file sizes whatever the colour.
    pub fn solid_bmp(&self, name: &str, width: u32, height: u32, color: [u8; 3]) -> PathBuf {
        let path = self.dir.path().join(name);
        RgbImage::from_pixel(width, height, Rgb(color))
            .save_with_format(&path, ImageFormat::Bmp)
            .unwrap();
        path
    }

    /// Write a TIFF built by `builder`.
    pub fn tiff(&self, name: &str, builder: TiledTiffBuilder) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, builder.build()).unwrap();
        path
    }

    /// Write a gradient as a striped, uncompressed TIFF via the `image` crate.
    pub fn striped_tiff(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        gradient(width, height)
            .save_with_format(&path, ImageFormat::Tiff)
            .unwrap();
        path
    }

    /// Write bytes that no decoder accepts.
    pub fn garbage(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"this is not an image").unwrap();
        path
    }
}

pub fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x / 256 + y / 256) * 40 % 256) as u8])
    })
}

// =============================================================================
// Image Helpers
// =============================================================================

/// Check if data looks like a complete JPEG (SOI and EOI markers).
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 4
        && data[0] == 0xFF
        && data[1] == 0xD8
        && data[data.len() - 2] == 0xFF
        && data[data.len() - 1] == 0xD9
}

/// Decode a JPEG and return its dimensions.
pub fn jpeg_dimensions(data: &[u8]) -> (u32, u32) {
    let img = image::load_from_memory_with_format(data, ImageFormat::Jpeg).unwrap();
    (img.width(), img.height())
}

/// Decode a JPEG to RGB pixels.
pub fn decode_jpeg(data: &[u8]) -> RgbImage {
    image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .unwrap()
        .into_rgb8()
}

// =============================================================================
// TIFF File Builder
// =============================================================================

/// TIFF tag numbers written by [`TiledTiffBuilder`].
mod tag {
    pub const NEW_SUBFILE_TYPE: u16 = 254;
    pub const IMAGE_WIDTH: u16 = 256;
    pub const IMAGE_LENGTH: u16 = 257;
    pub const BITS_PER_SAMPLE: u16 = 258;
    pub const COMPRESSION: u16 = 259;
    pub const PHOTOMETRIC: u16 = 262;
    pub const SAMPLES_PER_PIXEL: u16 = 277;
    pub const PLANAR_CONFIGURATION: u16 = 284;
    pub const TILE_WIDTH: u16 = 322;
    pub const TILE_LENGTH: u16 = 323;
    pub const TILE_OFFSETS: u16 = 324;
    pub const TILE_BYTE_COUNTS: u16 = 325;
    pub const JPEG_TABLES: u16 = 347;
}

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_UNDEFINED: u16 = 7;

/// Builds little-endian tiled TIFF files with reduced-resolution levels.
///
/// Every level is stored as RGB tiles, either uncompressed or as JPEG with
/// the tables shared through the JPEGTables tag, like slide scanners write.
pub struct TiledTiffBuilder {
    tile_size: u32,
    jpeg_quality: Option<u8>,
    levels: Vec<RgbImage>,
}

struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Inline value, or the offset of out-of-line data
    value: u32,
}

impl TiledTiffBuilder {
    pub fn new(tile_size: u32) -> Self {
        Self {
            tile_size,
            jpeg_quality: None,
            levels: Vec::new(),
        }
    }

    /// Store tiles as abbreviated JPEG streams with shared tables.
    pub fn with_jpeg(mut self, quality: u8) -> Self {
        self.jpeg_quality = Some(quality);
        self
    }

    /// Append a level; the first one is full resolution.
    pub fn add_level(mut self, image: RgbImage) -> Self {
        self.levels.push(image);
        self
    }

    /// Build the TIFF file data.
    pub fn build(self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"II");
        data.extend_from_slice(&42u16.to_le_bytes());
        // First IFD offset, patched below
        let mut next_pointer = data.len();
        data.extend_from_slice(&0u32.to_le_bytes());

        for (index, level) in self.levels.iter().enumerate() {
            let (tiles, tables) = self.encode_tiles(level);

            let mut offsets = Vec::with_capacity(tiles.len());
            let mut counts = Vec::with_capacity(tiles.len());
            for tile in &tiles {
                pad_to_word(&mut data);
                offsets.push(data.len() as u32);
                counts.push(tile.len() as u32);
                data.extend_from_slice(tile);
            }

            pad_to_word(&mut data);
            let bits_offset = data.len() as u32;
            for _ in 0..3 {
                data.extend_from_slice(&8u16.to_le_bytes());
            }
            let offsets_value = write_longs(&mut data, &offsets);
            let counts_value = write_longs(&mut data, &counts);
            let tables_entry = tables.map(|tables| {
                pad_to_word(&mut data);
                let entry = IfdEntry {
                    tag: tag::JPEG_TABLES,
                    field_type: TYPE_UNDEFINED,
                    count: tables.len() as u32,
                    value: data.len() as u32,
                };
                data.extend_from_slice(&tables);
                entry
            });

            let compressed = self.jpeg_quality.is_some();
            let tile_count = tiles.len() as u32;
            let mut entries = vec![
                IfdEntry::long(tag::NEW_SUBFILE_TYPE, if index == 0 { 0 } else { 1 }),
                IfdEntry::long(tag::IMAGE_WIDTH, level.width()),
                IfdEntry::long(tag::IMAGE_LENGTH, level.height()),
                IfdEntry {
                    tag: tag::BITS_PER_SAMPLE,
                    field_type: TYPE_SHORT,
                    count: 3,
                    value: bits_offset,
                },
                IfdEntry::short(tag::COMPRESSION, if compressed { 7 } else { 1 }),
                IfdEntry::short(tag::PHOTOMETRIC, if compressed { 6 } else { 2 }),
                IfdEntry::short(tag::SAMPLES_PER_PIXEL, 3),
                IfdEntry::short(tag::PLANAR_CONFIGURATION, 1),
                IfdEntry::long(tag::TILE_WIDTH, self.tile_size),
                IfdEntry::long(tag::TILE_LENGTH, self.tile_size),
                IfdEntry {
                    tag: tag::TILE_OFFSETS,
                    field_type: TYPE_LONG,
                    count: tile_count,
                    value: offsets_value,
                },
                IfdEntry {
                    tag: tag::TILE_BYTE_COUNTS,
                    field_type: TYPE_LONG,
                    count: tile_count,
                    value: counts_value,
                },
            ];
            entries.extend(tables_entry);

            pad_to_word(&mut data);
            let ifd_offset = data.len() as u32;
            data[next_pointer..next_pointer + 4].copy_from_slice(&ifd_offset.to_le_bytes());

            data.extend_from_slice(&(entries.len() as u16).to_le_bytes());
            for entry in &entries {
                data.extend_from_slice(&entry.tag.to_le_bytes());
                data.extend_from_slice(&entry.field_type.to_le_bytes());
                data.extend_from_slice(&entry.count.to_le_bytes());
                if entry.field_type == TYPE_SHORT && entry.count == 1 {
                    data.extend_from_slice(&(entry.value as u16).to_le_bytes());
                    data.extend_from_slice(&[0, 0]);
                } else {
                    data.extend_from_slice(&entry.value.to_le_bytes());
                }
            }
            next_pointer = data.len();
            data.extend_from_slice(&0u32.to_le_bytes());
        }

        data
    }

    /// Encode every tile of `level`, row-major, padded to full tile size.
    ///
    /// For JPEG, returns the shared tables alongside abbreviated tile streams.
    fn encode_tiles(&self, level: &RgbImage) -> (Vec<Vec<u8>>, Option<Vec<u8>>) {
        let across = level.width().div_ceil(self.tile_size);
        let down = level.height().div_ceil(self.tile_size);
        let mut tiles = Vec::new();
        let mut tables = None;

        for ty in 0..down {
            for tx in 0..across {
                let x = tx * self.tile_size;
                let y = ty * self.tile_size;
                let w = self.tile_size.min(level.width() - x);
                let h = self.tile_size.min(level.height() - y);
                let mut tile = RgbImage::new(self.tile_size, self.tile_size);
                image::imageops::replace(
                    &mut tile,
                    &image::imageops::crop_imm(level, x, y, w, h).to_image(),
                    0,
                    0,
                );

                match self.jpeg_quality {
                    None => tiles.push(tile.into_raw()),
                    Some(quality) => {
                        let mut jpeg = Vec::new();
                        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality)
                            .encode_image(&tile)
                            .unwrap();
                        let (head, scan) = split_at_scan(&jpeg);
                        tables.get_or_insert(head);
                        tiles.push(scan);
                    }
                }
            }
        }
        (tiles, tables)
    }
}

impl IfdEntry {
    fn short(tag: u16, value: u16) -> Self {
        Self {
            tag,
            field_type: TYPE_SHORT,
            count: 1,
            value: value as u32,
        }
    }

    fn long(tag: u16, value: u32) -> Self {
        Self {
            tag,
            field_type: TYPE_LONG,
            count: 1,
            value,
        }
    }
}

fn pad_to_word(data: &mut Vec<u8>) {
    if data.len() % 2 == 1 {
        data.push(0);
    }
}

/// Write a LONG array, returning the IFD value field: the value itself for a
/// single element, otherwise the array's offset.
fn write_longs(data: &mut Vec<u8>, values: &[u32]) -> u32 {
    if values.len() == 1 {
        return values[0];
    }
    pad_to_word(data);
    let offset = data.len() as u32;
    for value in values {
        data.extend_from_slice(&value.to_le_bytes());
    }
    offset
}

/// Split a complete JPEG into a tables stream (`SOI ... EOI`) and an
/// abbreviated scan stream (`SOI SOS ... EOI`).
fn split_at_scan(jpeg: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut pos = 2;
    while pos + 3 < jpeg.len() {
        assert_eq!(jpeg[pos], 0xFF, "expected a marker at {}", pos);
        if jpeg[pos + 1] == 0xDA {
            break;
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        pos += 2 + len;
    }

    let mut tables = jpeg[..pos].to_vec();
    tables.extend_from_slice(&[0xFF, 0xD9]);
    let mut scan = vec![0xFF, 0xD8];
    scan.extend_from_slice(&jpeg[pos..]);
    (tables, scan)
}

// =============================================================================
// Instrumented Codecs
// =============================================================================

/// Call counters shared between a [`CountingCodec`] and the test.
#[derive(Default)]
pub struct CodecCalls {
    pub probes: AtomicUsize,
    pub extracts: AtomicUsize,
    pub downsamples: AtomicUsize,
    pub opens: AtomicUsize,
}

impl CodecCalls {
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn extracts(&self) -> usize {
        self.extracts.load(Ordering::SeqCst)
    }

    pub fn downsamples(&self) -> usize {
        self.downsamples.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

/// Wraps [`ImageCrateCodec`], counting calls and optionally failing or slowing
/// down header reads and region extraction.
pub struct CountingCodec {
    inner: ImageCrateCodec,
    pub calls: Arc<CodecCalls>,

    /// Extraction fails for regions starting at this pixel origin
    pub fail_origin: Option<(u32, u32)>,

    /// Artificial extraction latency
    pub delay_ms: u64,

    /// Artificial header read latency
    pub header_delay_ms: u64,
}

impl CountingCodec {
    pub fn new() -> Self {
        Self {
            inner: ImageCrateCodec::new(),
            calls: Arc::new(CodecCalls::default()),
            fail_origin: None,
            delay_ms: 0,
            header_delay_ms: 0,
        }
    }

    pub fn failing_at(mut self, x: u32, y: u32) -> Self {
        self.fail_origin = Some((x, y));
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_header_delay(mut self, delay_ms: u64) -> Self {
        self.header_delay_ms = delay_ms;
        self
    }

    fn check(&self, region: Region) -> Result<(), CodecError> {
        self.calls.extracts.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.delay_ms));
        }
        if self.fail_origin == Some((region.x, region.y)) {
            return Err(CodecError::Decode {
                message: format!("corrupt data at ({}, {})", region.x, region.y),
            });
        }
        Ok(())
    }
}

struct CountingSource<'a> {
    codec: &'a CountingCodec,
    inner: Box<dyn RegionSource + 'a>,
}

impl RegionSource for CountingSource<'_> {
    fn extract(&self, region: Region) -> Result<RgbImage, CodecError> {
        self.codec.check(region)?;
        self.inner.extract(region)
    }
}

impl ImageCodec for CountingCodec {
    fn probe_dimensions(&self, path: &Path) -> Result<(u32, u32), CodecError> {
        self.calls.probes.fetch_add(1, Ordering::SeqCst);
        if self.header_delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.header_delay_ms));
        }
        self.inner.probe_dimensions(path)
    }

    fn extract_region(&self, path: &Path, region: Region) -> Result<RgbImage, CodecError> {
        self.check(region)?;
        self.inner.extract_region(path, region)
    }

    fn downsample(&self, path: &Path, max_dimension: u32) -> Result<RgbImage, CodecError> {
        self.calls.downsamples.fetch_add(1, Ordering::SeqCst);
        self.inner.downsample(path, max_dimension)
    }

    fn encode(&self, pixels: &RgbImage, quality: u8) -> Result<Bytes, CodecError> {
        self.inner.encode(pixels, quality)
    }

    fn open_source<'a>(&'a self, path: &Path) -> Result<Box<dyn RegionSource + 'a>, CodecError> {
        self.calls.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingSource {
            codec: self,
            inner: self.inner.open_source(path)?,
        }))
    }
}

/// Build a manager around a [`CountingCodec`], returning its counters.
pub fn counting_manager(
    config: CacheConfig,
    codec: CountingCodec,
) -> (CacheManager<CountingCodec>, Arc<CodecCalls>) {
    let calls = Arc::clone(&codec.calls);
    (CacheManager::new(config, codec).unwrap(), calls)
}
