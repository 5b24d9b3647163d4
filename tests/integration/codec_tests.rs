//! Windowed TIFF decoding through the codec and the full stack.
//!
//! Tests verify:
//! - Regions of tiled TIFFs (uncompressed and JPEG with shared tables) match
//!   the source pixels
//! - Overviews are read from the coarsest stored level that covers them
//! - Large striped TIFFs open and tile under an allocation ceiling far below
//!   their decoded size, while the same pixels as PNG do not

use image::{imageops, Rgb, RgbImage};

use pyramid_cache::{fit_within, CacheError, CacheManager, ImageCodec, ImageCrateCodec, Region};

use super::test_utils::{decode_jpeg, gradient, jpeg_dimensions, TestEnv, TiledTiffBuilder};

// =============================================================================
// Helpers
// =============================================================================

/// Mean absolute per-channel difference between two equally sized images.
fn mean_abs_diff(a: &RgbImage, b: &RgbImage) -> f64 {
    assert_eq!(a.dimensions(), b.dimensions());
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| (x as i32 - y as i32).unsigned_abs() as u64)
        .sum();
    total as f64 / a.as_raw().len() as f64
}

fn rect(x: u32, y: u32, width: u32, height: u32) -> Region {
    Region {
        x,
        y,
        width,
        height,
    }
}

fn crop(image: &RgbImage, region: Region) -> RgbImage {
    imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image()
}

fn solid(size: u32, color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(size, size, Rgb(color))
}

/// Average colour of an image.
fn mean_color(image: &RgbImage) -> [f64; 3] {
    let mut sum = [0u64; 3];
    for pixel in image.pixels() {
        for c in 0..3 {
            sum[c] += pixel.0[c] as u64;
        }
    }
    let n = (image.width() * image.height()) as f64;
    [sum[0] as f64 / n, sum[1] as f64 / n, sum[2] as f64 / n]
}

fn assert_close_to(actual: [f64; 3], expected: [u8; 3]) {
    for c in 0..3 {
        assert!(
            (actual[c] - expected[c] as f64).abs() < 12.0,
            "{:?} is not close to {:?}",
            actual,
            expected
        );
    }
}

/// Three-level pyramid whose levels have distinct colours.
fn coloured_pyramid() -> TiledTiffBuilder {
    TiledTiffBuilder::new(128)
        .add_level(solid(1024, [200, 30, 30]))
        .add_level(solid(512, [30, 30, 200]))
        .add_level(solid(256, [30, 200, 30]))
}

// =============================================================================
// Tiled TIFF Regions
// =============================================================================

#[test]
fn test_uncompressed_tiled_regions_are_exact() {
    let env = TestEnv::new();
    let source = gradient(1000, 700);
    let half = imageops::thumbnail(&source, 500, 350);
    let path = env.tiff(
        "tiled.tif",
        TiledTiffBuilder::new(128)
            .add_level(source.clone())
            .add_level(half),
    );
    let codec = ImageCrateCodec::new();

    assert_eq!(codec.probe_dimensions(&path).unwrap(), (1000, 700));
    for region in [
        rect(0, 0, 256, 256),
        rect(100, 60, 300, 200),
        rect(768, 512, 232, 188),
        rect(999, 699, 1, 1),
    ] {
        let pixels = codec.extract_region(&path, region).unwrap();
        assert_eq!(pixels, crop(&source, region), "{:?}", region);
    }
}

#[test]
fn test_jpeg_tiles_with_shared_tables() {
    let env = TestEnv::new();
    let source = gradient(600, 400);
    let path = env.tiff(
        "jpeg.tif",
        TiledTiffBuilder::new(256).with_jpeg(95).add_level(source.clone()),
    );
    let codec = ImageCrateCodec::new();

    assert_eq!(codec.probe_dimensions(&path).unwrap(), (600, 400));
    let region = rect(200, 150, 300, 200);
    let pixels = codec.extract_region(&path, region).unwrap();
    assert!(mean_abs_diff(&pixels, &crop(&source, region)) < 4.0);
}

#[test]
fn test_region_reads_are_cached_per_chunk() {
    let env = TestEnv::new();
    let path = env.tiff(
        "tiled.tif",
        TiledTiffBuilder::new(128).add_level(gradient(512, 512)),
    );
    let codec = ImageCrateCodec::with_limits(1 << 20, 1 << 30);

    // Touches 2x2 tiles of 128 px
    codec.extract_region(&path, rect(64, 64, 128, 128)).unwrap();
    assert_eq!(codec.decoded_entries(), 4);
    assert_eq!(codec.decoded_bytes(), 4 * 128 * 128 * 3);

    codec.extract_region(&path, rect(100, 100, 20, 20)).unwrap();
    assert_eq!(codec.decoded_entries(), 4);
}

// =============================================================================
// Overviews From Stored Levels
// =============================================================================

#[test]
fn test_overview_uses_coarsest_covering_level() {
    let env = TestEnv::new();
    let path = env.tiff("levels.tif", coloured_pyramid());
    let codec = ImageCrateCodec::new();

    // 256 is stored exactly, 300 needs the 512 level, 600 needs full resolution
    let exact = codec.downsample(&path, 256).unwrap();
    assert_eq!(exact.dimensions(), (256, 256));
    assert_close_to(mean_color(&exact), [30, 200, 30]);

    let from_half = codec.downsample(&path, 300).unwrap();
    assert_eq!(from_half.dimensions(), (300, 300));
    assert_close_to(mean_color(&from_half), [30, 30, 200]);

    let from_base = codec.downsample(&path, 600).unwrap();
    assert_eq!(from_base.dimensions(), (600, 600));
    assert_close_to(mean_color(&from_base), [200, 30, 30]);

    // Tiles always come from full resolution
    let region = codec.extract_region(&path, rect(0, 0, 64, 64)).unwrap();
    assert_close_to(mean_color(&region), [200, 30, 30]);
}

#[tokio::test]
async fn test_thumbnail_built_from_reduced_jpeg_level() {
    let env = TestEnv::new();
    let path = env.tiff("levels.tif", coloured_pyramid().with_jpeg(90));
    let mut config = env.config();
    config.thumbnail_size = 200;
    let manager = CacheManager::with_default_codec(config).unwrap();

    let image = manager.load_image(&path).await.unwrap();
    assert_eq!((image.metadata.width, image.metadata.height), (1024, 1024));

    let thumbnail = decode_jpeg(&manager.load_thumbnail(&image.identity).await.unwrap());
    assert_eq!(thumbnail.dimensions(), (200, 200));
    assert_close_to(mean_color(&thumbnail), [30, 200, 30]);

    let tile = decode_jpeg(&manager.load_tile(&image.identity, 3, 3).await.unwrap().data);
    assert_close_to(mean_color(&tile), [200, 30, 30]);
}

// =============================================================================
// Allocation Ceiling
// =============================================================================

const SMALL_CEILING: u64 = 8 * 1024 * 1024;

#[test]
fn test_large_striped_tiff_reads_under_small_ceiling() {
    let env = TestEnv::new();
    // 12 MB of RGB, half again the ceiling
    let tiff = env.striped_tiff("large.tif", 2000, 2000);
    let png = env.png("large.png", 2000, 2000);
    let codec = ImageCrateCodec::with_limits(0, SMALL_CEILING);

    let region = rect(1792, 1792, 208, 208);
    let pixels = codec.extract_region(&tiff, region).unwrap();
    assert_eq!(pixels, crop(&gradient(2000, 2000), region));

    let (w, h) = fit_within(2000, 2000, 512);
    assert_eq!(codec.downsample(&tiff, 512).unwrap().dimensions(), (w, h));
    assert_eq!(codec.decoded_entries(), 0);

    assert!(codec.extract_region(&png, region).is_err());
}

#[tokio::test]
async fn test_large_striped_tiff_opens_under_small_ceiling() {
    let env = TestEnv::new();
    let path = env.striped_tiff("large.tif", 2000, 2000);
    let mut config = env.config();
    config.decode_max_alloc = SMALL_CEILING;
    config.decode_cache_bytes = 0;
    config.medium_size = 1024;
    let manager = CacheManager::with_default_codec(config).unwrap();

    let image = manager.load_image(&path).await.unwrap();
    assert_eq!((image.metadata.tiles_x, image.metadata.tiles_y), (8, 8));
    assert_eq!(
        jpeg_dimensions(&manager.load_medium(&image.identity).await.unwrap()),
        (1024, 1024)
    );

    let tile = manager.load_tile(&image.identity, 7, 7).await.unwrap();
    let pixels = decode_jpeg(&tile.data);
    assert_eq!(pixels.dimensions(), (256, 256));
    let inside = crop(&pixels, rect(0, 0, 208, 208));
    let expected = crop(&gradient(2000, 2000), rect(1792, 1792, 208, 208));
    assert!(mean_abs_diff(&inside, &expected) < 6.0);
}

#[tokio::test]
async fn test_large_png_over_ceiling_is_decode_failure() {
    let env = TestEnv::new();
    let path = env.png("large.png", 2000, 2000);
    let mut config = env.config();
    config.decode_max_alloc = SMALL_CEILING;
    let manager = CacheManager::with_default_codec(config).unwrap();

    assert!(matches!(
        manager.load_image(&path).await,
        Err(CacheError::DecodeFailure { .. })
    ));
}
