//! Opening images: identity, metadata, overviews and invalidation.
//!
//! Tests verify:
//! - Grid arithmetic and on-disk layout after an open
//! - Reopening a valid entry does no decode work
//! - Eager vs. on-demand medium overviews
//! - Rebuild on recorded-path mismatch and after invalidation
//! - The same-path, same-size limitation of the identity
//! - Concurrent opens of one image build it once

use std::ops::ControlFlow;
use std::sync::Arc;

use pyramid_cache::store::TileNamespace;
use pyramid_cache::{identify, CacheError, CacheState, ImageIdentity, CACHE_VERSION};

use super::test_utils::{counting_manager, decode_jpeg, jpeg_dimensions, CountingCodec, TestEnv};

// =============================================================================
// Open
// =============================================================================

#[tokio::test]
async fn test_open_600_square() {
    let env = TestEnv::new();
    let path = env.png("square.png", 600, 600);
    let manager = env.manager();

    let image = manager.load_image(&path).await.unwrap();
    let meta = &image.metadata;

    assert_eq!(meta.cache_version, CACHE_VERSION);
    assert_eq!((meta.width, meta.height), (600, 600));
    assert_eq!(meta.tile_size, 256);
    assert_eq!((meta.tiles_x, meta.tiles_y), (3, 3));
    assert_eq!(meta.total_tiles, 9);
    assert_eq!(meta.original_path, path.to_string_lossy());

    let entry = env.cache_root().join(image.identity.as_str());
    assert!(entry.join("metadata.json").is_file());
    assert!(entry.join("thumbnail.jpg").is_file());
    assert!(!entry.join("medium.jpg").exists());
    assert_eq!(manager.state(&image.identity).await.unwrap(), CacheState::MetadataOnly);
}

#[tokio::test]
async fn test_metadata_json_is_camel_case() {
    let env = TestEnv::new();
    let path = env.png("a.png", 300, 100);
    let image = env.manager().load_image(&path).await.unwrap();

    let raw = std::fs::read(
        env.cache_root()
            .join(image.identity.as_str())
            .join("metadata.json"),
    )
    .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();

    let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
    for key in [
        "cacheVersion",
        "originalPath",
        "width",
        "height",
        "tileSize",
        "tilesX",
        "tilesY",
        "totalTiles",
        "thumbnailSize",
        "mediumSize",
        "createdAt",
    ] {
        assert!(keys.contains(&key), "missing key {}", key);
    }
    assert_eq!(keys.len(), 11);
    assert_eq!(json["tilesX"], 2);
}

#[tokio::test]
async fn test_identity_matches_stat() {
    let env = TestEnv::new();
    let path = env.png("a.png", 64, 64);
    let size = std::fs::metadata(&path).unwrap().len();

    let image = env.manager().load_image(&path).await.unwrap();
    assert_eq!(image.identity, ImageIdentity::from_parts(&path, size));
    assert_eq!(image.identity, identify(&path).await.unwrap());
}

#[tokio::test]
async fn test_reopen_does_no_decode_work() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 400);
    let (manager, calls) = counting_manager(env.config(), CountingCodec::new());

    let first = manager.load_image(&path).await.unwrap();
    assert!(!first.cache_hit);
    assert_eq!(calls.probes(), 1);
    assert_eq!(calls.downsamples(), 1);

    let second = manager.load_image(&path).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.metadata, first.metadata);
    assert_eq!(calls.probes(), 1);
    assert_eq!(calls.downsamples(), 1);
    assert_eq!(calls.extracts(), 0);
}

#[tokio::test]
async fn test_open_never_builds_tiles() {
    let env = TestEnv::new();
    let path = env.png("a.png", 1000, 1000);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    assert_eq!(
        manager
            .store()
            .count_tiles(&image.identity, TileNamespace::Base)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_thumbnail_fits_and_keeps_aspect() {
    let env = TestEnv::new();
    let path = env.png("wide.png", 2000, 500);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    let thumbnail = manager.load_thumbnail(&image.identity).await.unwrap();
    assert_eq!(jpeg_dimensions(&thumbnail), (512, 128));
}

#[tokio::test]
async fn test_small_image_thumbnail_not_upscaled() {
    let env = TestEnv::new();
    let path = env.png("small.png", 100, 60);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    let thumbnail = manager.load_thumbnail(&image.identity).await.unwrap();
    assert_eq!(jpeg_dimensions(&thumbnail), (100, 60));
    assert_eq!((image.metadata.tiles_x, image.metadata.tiles_y), (1, 1));
}

// =============================================================================
// Medium overview
// =============================================================================

#[tokio::test]
async fn test_medium_on_demand_below_threshold() {
    let env = TestEnv::new();
    let path = env.png("b.png", 1000, 800);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    let medium_path = env
        .cache_root()
        .join(image.identity.as_str())
        .join("medium.jpg");
    assert!(!medium_path.exists());

    let medium = manager.load_medium(&image.identity).await.unwrap();
    assert_eq!(jpeg_dimensions(&medium), (1000, 800));
    assert_eq!(std::fs::read(&medium_path).unwrap(), medium.to_vec());

    // Served from disk afterwards
    let again = manager.load_medium(&image.identity).await.unwrap();
    assert_eq!(again, medium);
}

#[tokio::test]
async fn test_medium_eager_above_threshold() {
    let env = TestEnv::new();
    let path = env.png("big.png", 2100, 300);
    let (manager, calls) = counting_manager(env.config(), CountingCodec::new());
    let image = manager.load_image(&path).await.unwrap();

    assert!(manager.store().has_medium(&image.identity).await);
    assert_eq!(calls.downsamples(), 2);

    let medium = manager.load_medium(&image.identity).await.unwrap();
    assert_eq!(jpeg_dimensions(&medium), (2048, 293));
    assert_eq!(calls.downsamples(), 2);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_missing_source() {
    let env = TestEnv::new();
    let result = env
        .manager()
        .load_image(&env.dir.path().join("missing.png"))
        .await;
    assert!(matches!(result, Err(CacheError::SourceUnavailable { .. })));
}

#[tokio::test]
async fn test_directory_is_not_a_source() {
    let env = TestEnv::new();
    let result = env.manager().load_image(env.dir.path()).await;
    assert!(matches!(result, Err(CacheError::SourceUnavailable { .. })));
}

#[tokio::test]
async fn test_undecodable_source_leaves_no_metadata() {
    let env = TestEnv::new();
    let path = env.garbage("broken.tif");
    let manager = env.manager();

    let result = manager.load_image(&path).await;
    assert!(matches!(result, Err(CacheError::DecodeFailure { .. })));

    let identity = identify(&path).await.unwrap();
    assert_eq!(manager.state(&identity).await.unwrap(), CacheState::Unknown);
    assert!(!env
        .cache_root()
        .join(identity.as_str())
        .join("metadata.json")
        .exists());
}

// =============================================================================
// Invalidation
// =============================================================================

#[tokio::test]
async fn test_recorded_path_mismatch_rebuilds() {
    let env = TestEnv::new();
    let path = env.png("a.png", 300, 300);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();
    manager.load_tile(&image.identity, 0, 0).await.unwrap();

    // Simulate an entry written for a different path under this identity
    let mut meta = image.metadata.clone();
    meta.original_path = "/somewhere/else.png".to_string();
    manager
        .store()
        .write_metadata(&image.identity, &meta)
        .await
        .unwrap();

    let reopened = manager.load_image(&path).await.unwrap();
    assert!(!reopened.cache_hit);
    assert_eq!(reopened.identity, image.identity);
    assert_eq!(reopened.metadata.original_path, path.to_string_lossy());
    assert_eq!(
        manager.state(&image.identity).await.unwrap(),
        CacheState::MetadataOnly
    );
}

#[tokio::test]
async fn test_corrupt_metadata_rebuilds() {
    let env = TestEnv::new();
    let path = env.png("a.png", 300, 300);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    let meta_path = env
        .cache_root()
        .join(image.identity.as_str())
        .join("metadata.json");
    std::fs::write(&meta_path, b"{ not json").unwrap();

    assert_eq!(
        manager.state(&image.identity).await.unwrap(),
        CacheState::Unknown
    );
    let reopened = manager.load_image(&path).await.unwrap();
    assert!(!reopened.cache_hit);
    assert_eq!(reopened.metadata.width, 300);
}

#[tokio::test]
async fn test_tampered_grid_is_rebuilt_not_trusted() {
    let env = TestEnv::new();
    let path = env.png("square.png", 600, 600);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    let meta_path = env
        .cache_root()
        .join(image.identity.as_str())
        .join("metadata.json");
    let mut json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
    json["tilesX"] = serde_json::json!(5);
    json["totalTiles"] = serde_json::json!(15);
    std::fs::write(&meta_path, serde_json::to_vec(&json).unwrap()).unwrap();

    // Column 4 would start past the right edge of a 600px image
    assert!(matches!(
        manager.load_tile(&image.identity, 4, 0).await,
        Err(CacheError::NotCached { .. })
    ));
    assert_eq!(
        manager.state(&image.identity).await.unwrap(),
        CacheState::Unknown
    );

    let reopened = manager.load_image(&path).await.unwrap();
    assert!(!reopened.cache_hit);
    assert_eq!((reopened.metadata.tiles_x, reopened.metadata.tiles_y), (3, 3));
    assert!(matches!(
        manager.load_tile(&image.identity, 4, 0).await,
        Err(CacheError::TileOutOfBounds { .. })
    ));
    manager.load_tile(&image.identity, 2, 0).await.unwrap();
}

#[tokio::test]
async fn test_invalidate_then_reopen() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 600);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();
    manager.load_tile(&image.identity, 1, 1).await.unwrap();

    let entry = env.cache_root().join(image.identity.as_str());
    assert!(manager.invalidate(&image.identity).await.unwrap());
    assert!(!entry.exists());

    let reopened = manager.load_image(&path).await.unwrap();
    assert_eq!(reopened.identity, image.identity);
    assert!(!reopened.cache_hit);
    assert!(entry.join("metadata.json").is_file());
    assert!(!entry.join("tiles").join("tile_1_1.jpg").exists());
}

#[tokio::test]
async fn test_invalidate_leaves_other_entries() {
    let env = TestEnv::new();
    let a = env.png("a.png", 200, 200);
    let b = env.png("b.png", 300, 200);
    let manager = env.manager();
    let image_a = manager.load_image(&a).await.unwrap();
    let image_b = manager.load_image(&b).await.unwrap();

    manager.invalidate(&image_a.identity).await.unwrap();
    assert_eq!(
        manager.state(&image_b.identity).await.unwrap(),
        CacheState::MetadataOnly
    );
    assert!(!manager.invalidate(&image_a.identity).await.unwrap());
}

// =============================================================================
// Identity limitation
// =============================================================================

#[tokio::test]
async fn test_same_path_same_size_is_a_false_hit() {
    let env = TestEnv::new();
    let path = env.solid_bmp("scan.bmp", 64, 64, [255, 0, 0]);
    let manager = env.manager();
    let first = manager.load_image(&path).await.unwrap();
    let red_tile = manager.load_tile(&first.identity, 0, 0).await.unwrap();

    // Overwrite with different pixels; BMP size is unchanged
    let size_before = std::fs::metadata(&path).unwrap().len();
    env.solid_bmp("scan.bmp", 64, 64, [0, 0, 255]);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), size_before);

    let second = manager.load_image(&path).await.unwrap();
    assert_eq!(second.identity, first.identity);
    assert!(second.cache_hit);

    let stale = manager.load_tile(&second.identity, 0, 0).await.unwrap();
    assert_eq!(stale.data, red_tile.data);
    let pixel = decode_jpeg(&stale.data).get_pixel(10, 10).0;
    assert!(pixel[0] > 200 && pixel[2] < 60, "expected red, got {:?}", pixel);
}

#[tokio::test]
async fn test_size_change_gives_new_identity() {
    let env = TestEnv::new();
    let path = env.solid_bmp("scan.bmp", 64, 64, [255, 0, 0]);
    let manager = env.manager();
    let first = manager.load_image(&path).await.unwrap();

    env.solid_bmp("scan.bmp", 65, 64, [255, 0, 0]);
    let second = manager.load_image(&path).await.unwrap();
    assert_ne!(second.identity, first.identity);
    assert_eq!(second.metadata.width, 65);
}

// =============================================================================
// Complete builds
// =============================================================================

#[tokio::test]
async fn test_warm_is_idempotent_and_deterministic() {
    let env_a = TestEnv::new();
    let env_b = TestEnv::new();
    let path_a = env_a.png("img.png", 700, 500);
    let path_b = env_b.png("img.png", 700, 500);

    let manager_a = env_a.manager();
    let manager_b = env_b.manager();
    let build_a = manager_a
        .warm(&path_a, |_| ControlFlow::Continue(()))
        .await
        .unwrap();
    let build_b = manager_b
        .warm(&path_b, |_| ControlFlow::Continue(()))
        .await
        .unwrap();
    assert_eq!(build_a.tiles_generated, 6);
    assert_eq!(build_b.tiles_generated, 6);

    // Same pixels at different paths: different identities, identical tiles
    for (x, y) in build_a.metadata.tile_coords() {
        let a = manager_a.load_tile(&build_a.identity, x, y).await.unwrap();
        let b = manager_b.load_tile(&build_b.identity, x, y).await.unwrap();
        assert!(a.cache_hit && b.cache_hit);
        assert_eq!(a.data, b.data, "tile ({}, {}) differs", x, y);
    }

    let rerun = manager_a
        .warm(&path_a, |_| ControlFlow::Continue(()))
        .await
        .unwrap();
    assert_eq!(rerun.tiles_generated, 0);
    assert_eq!(rerun.metadata, build_a.metadata);
    assert_eq!(
        manager_a.state(&build_a.identity).await.unwrap(),
        CacheState::FullyTiled
    );
}

// =============================================================================
// Concurrent opens
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_build_once() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 600);
    let (manager, calls) =
        counting_manager(env.config(), CountingCodec::new().with_header_delay(150));
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let path = path.clone();
        handles.push(tokio::spawn(async move { manager.load_image(&path).await }));
    }

    let mut images = Vec::new();
    for handle in handles {
        images.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(calls.probes(), 1);
    assert_eq!(calls.downsamples(), 1);
    assert_eq!(images.iter().filter(|i| !i.cache_hit).count(), 1);
    assert!(images.iter().all(|i| i.identity == images[0].identity));
    assert!(images.iter().all(|i| i.metadata == images[0].metadata));

    let entry = env.cache_root().join(images[0].identity.as_str());
    assert!(entry.join("metadata.json").is_file());
    assert!(entry.join("thumbnail.jpg").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_of_stale_entry_keep_it_intact() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 600);
    let (manager, calls) =
        counting_manager(env.config(), CountingCodec::new().with_header_delay(100));
    let manager = Arc::new(manager);

    let image = manager.load_image(&path).await.unwrap();
    let mut meta = image.metadata.clone();
    meta.original_path = "/somewhere/else.png".to_string();
    manager
        .store()
        .write_metadata(&image.identity, &meta)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let manager = Arc::clone(&manager);
        let path = path.clone();
        handles.push(tokio::spawn(async move { manager.load_image(&path).await }));
    }
    for handle in handles {
        let reopened = handle.await.unwrap().unwrap();
        assert_eq!(reopened.metadata.original_path, path.to_string_lossy());
    }

    // One build for the first open, one for the rebuild
    assert_eq!(calls.probes(), 2);
    let entry = env.cache_root().join(image.identity.as_str());
    assert!(entry.join("metadata.json").is_file());
    assert!(entry.join("thumbnail.jpg").is_file());
    assert_eq!(
        manager.state(&image.identity).await.unwrap(),
        CacheState::MetadataOnly
    );
}
