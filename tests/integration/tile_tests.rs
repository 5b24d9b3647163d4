//! Tile generation through the full stack.
//!
//! Tests verify:
//! - Every tile is exactly `tile_size` square, edge tiles padded black
//! - Write-through to disk and byte-identical reads afterwards
//! - Batch requests: one source open, per-tile results, partial failure
//! - Concurrent requests for one tile decode it once

use std::sync::Arc;

use pyramid_cache::store::TileNamespace;
use pyramid_cache::{CacheError, CacheState};

use super::test_utils::{
    counting_manager, decode_jpeg, is_valid_jpeg, jpeg_dimensions, CountingCodec, TestEnv,
};

// =============================================================================
// Single Tiles
// =============================================================================

#[tokio::test]
async fn test_every_tile_is_full_size() {
    let env = TestEnv::new();
    let path = env.png("a.png", 1000, 700);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();
    assert_eq!((image.metadata.tiles_x, image.metadata.tiles_y), (4, 3));

    for (x, y) in image.metadata.tile_coords() {
        let tile = manager.load_tile(&image.identity, x, y).await.unwrap();
        assert!(is_valid_jpeg(&tile.data));
        assert_eq!(jpeg_dimensions(&tile.data), (256, 256), "tile ({}, {})", x, y);
    }
    assert_eq!(
        manager.state(&image.identity).await.unwrap(),
        CacheState::FullyTiled
    );
}

#[tokio::test]
async fn test_edge_tile_is_padded_black() {
    let env = TestEnv::new();
    let path = env.solid_bmp("white.bmp", 600, 600, [255, 255, 255]);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    // 600 - 512 = 88 pixels of content in the last row and column
    let tile = manager.load_tile(&image.identity, 2, 2).await.unwrap();
    let pixels = decode_jpeg(&tile.data);
    assert_eq!(pixels.dimensions(), (256, 256));

    let inside = pixels.get_pixel(40, 40).0;
    assert!(inside.iter().all(|&c| c > 230), "inside: {:?}", inside);
    for (x, y) in [(200, 40), (40, 200), (200, 200), (255, 255)] {
        let outside = pixels.get_pixel(x, y).0;
        assert!(outside.iter().all(|&c| c < 25), "({}, {}): {:?}", x, y, outside);
    }
}

#[tokio::test]
async fn test_tile_written_through_to_disk() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 400);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    let first = manager.load_tile(&image.identity, 1, 0).await.unwrap();
    assert!(!first.cache_hit);

    let on_disk = manager
        .store()
        .tile_path(&image.identity, TileNamespace::Base, 1, 0);
    assert_eq!(std::fs::read(&on_disk).unwrap(), first.data.to_vec());
    assert!(on_disk.ends_with("tiles/tile_1_0.jpg"));

    let second = manager.load_tile(&image.identity, 1, 0).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.data, first.data);
    assert_eq!(
        manager.state(&image.identity).await.unwrap(),
        CacheState::PartiallyTiled
    );
}

#[tokio::test]
async fn test_disk_hit_survives_new_manager() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 400);
    let first = env.manager();
    let image = first.load_image(&path).await.unwrap();
    let generated = first.load_tile(&image.identity, 0, 1).await.unwrap();

    // Fresh process: empty memory layer, same cache root
    let (manager, calls) = counting_manager(env.config(), CountingCodec::new());
    let reopened = manager.load_image(&path).await.unwrap();
    assert!(reopened.cache_hit);

    let tile = manager.load_tile(&image.identity, 0, 1).await.unwrap();
    assert!(tile.cache_hit);
    assert_eq!(tile.data, generated.data);
    assert_eq!(calls.extracts(), 0);
    assert_eq!(calls.probes(), 0);
}

#[tokio::test]
async fn test_out_of_bounds() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 600);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();

    for (x, y) in [(3, 0), (0, 3), (100, 100)] {
        let result = manager.load_tile(&image.identity, x, y).await;
        assert!(
            matches!(
                result,
                Err(CacheError::TileOutOfBounds {
                    tiles_x: 3,
                    tiles_y: 3,
                    ..
                })
            ),
            "({}, {})",
            x,
            y
        );
    }
}

#[tokio::test]
async fn test_tile_for_unopened_identity() {
    let env = TestEnv::new();
    let path = env.png("a.png", 100, 100);
    let identity = pyramid_cache::identify(&path).await.unwrap();

    let result = env.manager().load_tile(&identity, 0, 0).await;
    assert!(matches!(result, Err(CacheError::NotCached { .. })));
}

#[tokio::test]
async fn test_tile_after_source_removed() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 600);
    let manager = env.manager();
    let image = manager.load_image(&path).await.unwrap();
    let cached = manager.load_tile(&image.identity, 0, 0).await.unwrap();

    std::fs::remove_file(&path).unwrap();

    // Tiles already on disk are still served
    let hit = manager.load_tile(&image.identity, 0, 0).await.unwrap();
    assert_eq!(hit.data, cached.data);

    let miss = manager.load_tile(&image.identity, 1, 1).await;
    assert!(matches!(miss, Err(CacheError::SourceUnavailable { .. })));
}

// =============================================================================
// Batches
// =============================================================================

#[tokio::test]
async fn test_batch_opens_source_once() {
    let env = TestEnv::new();
    let path = env.png("a.png", 1000, 700);
    let (manager, calls) = counting_manager(env.config(), CountingCodec::new());
    let image = manager.load_image(&path).await.unwrap();

    let coords = [(0, 0), (1, 0), (2, 0), (3, 0), (0, 1), (1, 1)];
    let results = manager
        .load_tiles_batch(&image.identity, &coords)
        .await
        .unwrap();

    assert_eq!(results.len(), coords.len());
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|t| !t.cache_hit)));
    assert_eq!(calls.opens(), 1);
    assert_eq!(calls.extracts(), coords.len());

    // Everything is now on disk: no further open
    let again = manager
        .load_tiles_batch(&image.identity, &coords)
        .await
        .unwrap();
    assert!(again.iter().all(|r| r.as_ref().is_ok_and(|t| t.cache_hit)));
    assert_eq!(calls.opens(), 1);
}

#[tokio::test]
async fn test_batch_partial_failure() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 600);
    let (manager, _calls) = counting_manager(env.config(), CountingCodec::new().failing_at(256, 0));
    let image = manager.load_image(&path).await.unwrap();

    let results = manager
        .load_tiles_batch(&image.identity, &[(0, 0), (1, 0), (2, 0), (5, 5)])
        .await
        .unwrap();

    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(CacheError::DecodeFailure { .. })));
    assert!(results[2].is_ok());
    assert!(matches!(
        results[3],
        Err(CacheError::TileOutOfBounds { x: 5, y: 5, .. })
    ));

    // The failed tile was never written
    let store = manager.store();
    assert!(!store.has_tile(&image.identity, TileNamespace::Base, 1, 0).await);
    assert!(store.has_tile(&image.identity, TileNamespace::Base, 2, 0).await);
}

#[tokio::test]
async fn test_batch_keeps_request_order_with_duplicates() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 600);
    let (manager, calls) = counting_manager(env.config(), CountingCodec::new());
    let image = manager.load_image(&path).await.unwrap();

    let coords = [(2, 1), (0, 0), (2, 1)];
    let results = manager
        .load_tiles_batch(&image.identity, &coords)
        .await
        .unwrap();

    let first = results[0].as_ref().unwrap();
    let last = results[2].as_ref().unwrap();
    assert_eq!(first.data, last.data);
    assert_eq!(calls.extracts(), 2);

    let single = manager.load_tile(&image.identity, 2, 1).await.unwrap();
    assert_eq!(single.data, first.data);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_decode_once() {
    let env = TestEnv::new();
    let path = env.png("a.png", 600, 600);
    let (manager, calls) = counting_manager(env.config(), CountingCodec::new().with_delay(150));
    let manager = Arc::new(manager);
    let image = manager.load_image(&path).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let identity = image.identity.clone();
        handles.push(tokio::spawn(async move {
            manager.load_tile(&identity, 1, 1).await
        }));
    }

    let mut tiles = Vec::new();
    for handle in handles {
        tiles.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(calls.extracts(), 1);
    assert!(tiles.iter().all(|t| t.data == tiles[0].data));
    assert_eq!(tiles.iter().filter(|t| !t.cache_hit).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_distinct_tiles() {
    let env = TestEnv::new();
    let path = env.png("a.png", 1024, 1024);
    let (manager, calls) = counting_manager(env.config(), CountingCodec::new());
    let manager = Arc::new(manager);
    let image = manager.load_image(&path).await.unwrap();

    let mut handles = Vec::new();
    for (x, y) in image.metadata.tile_coords() {
        let manager = Arc::clone(&manager);
        let identity = image.identity.clone();
        handles.push(tokio::spawn(async move {
            manager.load_tile(&identity, x, y).await
        }));
    }
    for handle in handles {
        let tile = handle.await.unwrap().unwrap();
        assert_eq!(jpeg_dimensions(&tile.data), (256, 256));
    }

    assert_eq!(calls.extracts(), 16);
    assert_eq!(
        manager.state(&image.identity).await.unwrap(),
        CacheState::FullyTiled
    );
}
