//! On-demand tile generation.
//!
//! ```text
//! get_tile(identity, x, y)
//!   1. Load metadata          4. Single-flight: become leader or wait
//!   2. Check grid bounds      5. Extract window, pad, encode
//!   3. Memory → disk lookup   6. Write-through, then return
//! ```
//!
//! Tiles are immutable once written. A repeated request is a memory hit or a
//! plain disk read and is never re-encoded.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use image::{imageops, Rgb, RgbImage};
use tracing::{debug, warn};

use crate::codec::{CodecPool, ImageCodec, Region, DEFAULT_TILE_QUALITY};
use crate::error::{CacheError, CodecError};
use crate::flight::{Flight, SingleFlight};
use crate::identity::ImageIdentity;
use crate::store::{CacheStore, PyramidMetadata, CACHE_VERSION};

use super::memory::{TileKey, TileMemoryCache};

/// Fill colour for the part of an edge tile that lies outside the image.
pub const TILE_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

// =============================================================================
// Tile Response
// =============================================================================

/// An encoded tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileResponse {
    /// Encoded tile bytes
    pub data: Bytes,

    /// Whether the tile already existed (memory or disk)
    pub cache_hit: bool,
}

// =============================================================================
// Pixel helpers
// =============================================================================

/// Pad `pixels` to a `tile_size × tile_size` canvas, anchored top-left.
///
/// Full-size input is returned unchanged.
pub fn pad_tile(pixels: RgbImage, tile_size: u32) -> RgbImage {
    if pixels.dimensions() == (tile_size, tile_size) {
        return pixels;
    }
    let mut canvas = RgbImage::from_pixel(tile_size, tile_size, TILE_BACKGROUND);
    imageops::replace(&mut canvas, &pixels, 0, 0);
    canvas
}

fn render_tile<C: ImageCodec + ?Sized>(
    codec: &C,
    pixels: RgbImage,
    tile_size: u32,
    quality: u8,
) -> Result<Bytes, CodecError> {
    codec.encode(&pad_tile(pixels, tile_size), quality)
}

// =============================================================================
// Tile Extractor
// =============================================================================

/// Generates, persists and serves tiles of the base pyramid.
pub struct TileExtractor<C> {
    store: Arc<CacheStore>,
    pool: CodecPool<C>,
    memory: Arc<TileMemoryCache>,
    quality: u8,
    in_flight: SingleFlight<TileKey>,
}

impl<C: ImageCodec> TileExtractor<C> {
    pub fn new(store: Arc<CacheStore>, pool: CodecPool<C>, memory: Arc<TileMemoryCache>) -> Self {
        Self {
            store,
            pool,
            memory,
            quality: DEFAULT_TILE_QUALITY,
            in_flight: SingleFlight::new(),
        }
    }

    /// Set the encode quality for newly generated tiles.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// MIME type of the tiles this extractor produces.
    pub fn content_type(&self) -> &'static str {
        self.pool.codec().content_type()
    }

    /// Load usable metadata for `identity`.
    ///
    /// Absent, corrupt and outdated metadata all mean the image must be opened
    /// again before tiles can be served.
    pub async fn metadata(&self, identity: &ImageIdentity) -> Result<PyramidMetadata, CacheError> {
        let not_cached = || CacheError::NotCached {
            identity: identity.to_string(),
        };
        match self.store.read_metadata(identity).await {
            Ok(Some(meta)) if meta.cache_version == CACHE_VERSION => Ok(meta),
            Ok(Some(meta)) => {
                debug!(
                    identity = %identity,
                    version = meta.cache_version,
                    "Metadata has an outdated cache version"
                );
                Err(not_cached())
            }
            Ok(None) => Err(not_cached()),
            Err(CacheError::CacheCorruption { path, message }) => {
                warn!(identity = %identity, path = %path, "Corrupt metadata: {}", message);
                Err(not_cached())
            }
            Err(e) => Err(e),
        }
    }

    /// Get one tile, generating and persisting it if needed.
    pub async fn get_tile(
        &self,
        identity: &ImageIdentity,
        x: u32,
        y: u32,
    ) -> Result<TileResponse, CacheError> {
        let meta = self.metadata(identity).await?;
        self.get_tile_with_metadata(identity, &meta, x, y).await
    }

    /// Get one tile using already-loaded metadata.
    pub async fn get_tile_with_metadata(
        &self,
        identity: &ImageIdentity,
        meta: &PyramidMetadata,
        x: u32,
        y: u32,
    ) -> Result<TileResponse, CacheError> {
        let region = meta.tile_region(x, y).ok_or(CacheError::TileOutOfBounds {
            x,
            y,
            tiles_x: meta.tiles_x,
            tiles_y: meta.tiles_y,
        })?;
        let key = TileKey::base(identity.clone(), x, y);

        loop {
            if let Some(hit) = self.lookup(&key).await? {
                return Ok(hit);
            }

            match self.in_flight.claim(&key) {
                Flight::Lead(guard) => {
                    let result = self.generate(&key, meta, region).await;
                    drop(guard);
                    return result.map(|data| TileResponse {
                        data,
                        cache_hit: false,
                    });
                }
                Flight::Follow(notify) => {
                    debug!(identity = %identity, x, y, "Waiting for in-flight tile");
                    self.in_flight.wait(&key, notify).await;
                }
            }
        }
    }

    /// Get several tiles, decoding the source at most once for all misses.
    ///
    /// The outer error covers the whole batch (unknown identity). Each tile has
    /// its own result, in request order: one failing tile does not fail the
    /// others.
    pub async fn get_tiles_batch(
        &self,
        identity: &ImageIdentity,
        coords: &[(u32, u32)],
    ) -> Result<Vec<Result<TileResponse, CacheError>>, CacheError> {
        let meta = self.metadata(identity).await?;
        let mut results: Vec<Option<Result<TileResponse, CacheError>>> =
            (0..coords.len()).map(|_| None).collect();

        // Missing tiles, deduplicated, with every request index that wants them
        let mut missing: BTreeMap<(u32, u32), (Region, Vec<usize>)> = BTreeMap::new();

        for (index, &(x, y)) in coords.iter().enumerate() {
            let Some(region) = meta.tile_region(x, y) else {
                results[index] = Some(Err(CacheError::TileOutOfBounds {
                    x,
                    y,
                    tiles_x: meta.tiles_x,
                    tiles_y: meta.tiles_y,
                }));
                continue;
            };
            if let Some(pending) = missing.get_mut(&(x, y)) {
                pending.1.push(index);
                continue;
            }
            match self.lookup(&TileKey::base(identity.clone(), x, y)).await {
                Ok(Some(hit)) => results[index] = Some(Ok(hit)),
                Ok(None) => {
                    missing.insert((x, y), (region, vec![index]));
                }
                Err(e) => results[index] = Some(Err(e)),
            }
        }

        if !missing.is_empty() {
            debug!(
                identity = %identity,
                requested = coords.len(),
                missing = missing.len(),
                "Generating tile batch"
            );

            let jobs: Vec<Region> = missing.values().map(|(region, _)| *region).collect();
            let path = PathBuf::from(&meta.original_path);
            let tile_size = meta.tile_size;
            let quality = self.quality;

            let encoded = self
                .pool
                .run(move |codec| {
                    let source = codec.open_source(&path)?;
                    Ok(jobs
                        .into_iter()
                        .map(|region| {
                            source
                                .extract(region)
                                .and_then(|pixels| render_tile(codec, pixels, tile_size, quality))
                        })
                        .collect::<Vec<_>>())
                })
                .await;

            match encoded {
                Err(e) => {
                    for (_, indices) in missing.values() {
                        for &index in indices {
                            results[index] = Some(Err(e.clone()));
                        }
                    }
                }
                Ok(tiles) => {
                    for (((x, y), (_, indices)), tile) in missing.into_iter().zip(tiles) {
                        let outcome = match tile {
                            Ok(data) => self
                                .persist(&TileKey::base(identity.clone(), x, y), data)
                                .await
                                .map(|data| TileResponse {
                                    data,
                                    cache_hit: false,
                                }),
                            Err(e) => {
                                warn!(identity = %identity, x, y, "Tile failed in batch: {}", e);
                                Err(CacheError::from(e))
                            }
                        };
                        for index in indices {
                            results[index] = Some(outcome.clone());
                        }
                    }
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(CacheError::Task("tile was not processed".to_string()))
                })
            })
            .collect())
    }

    /// Memory, then disk. A disk hit is promoted into memory.
    async fn lookup(&self, key: &TileKey) -> Result<Option<TileResponse>, CacheError> {
        if let Some(data) = self.memory.get(key).await {
            return Ok(Some(TileResponse {
                data,
                cache_hit: true,
            }));
        }

        match self
            .store
            .read_tile(&key.identity, key.namespace, key.x, key.y)
            .await?
        {
            Some(data) => {
                self.memory.put(key.clone(), data.clone()).await;
                Ok(Some(TileResponse {
                    data,
                    cache_hit: true,
                }))
            }
            None => Ok(None),
        }
    }

    async fn generate(
        &self,
        key: &TileKey,
        meta: &PyramidMetadata,
        region: Region,
    ) -> Result<Bytes, CacheError> {
        debug!(identity = %key.identity, x = key.x, y = key.y, "Generating tile");

        let path = PathBuf::from(&meta.original_path);
        let tile_size = meta.tile_size;
        let quality = self.quality;

        let data = self
            .pool
            .run(move |codec| {
                let pixels = codec.extract_region(&path, region)?;
                render_tile(codec, pixels, tile_size, quality)
            })
            .await?;

        self.persist(key, data).await
    }

    /// Write-through: disk first, then memory.
    async fn persist(&self, key: &TileKey, data: Bytes) -> Result<Bytes, CacheError> {
        self.store
            .write_tile(&key.identity, key.namespace, key.x, key.y, &data)
            .await?;
        self.memory.put(key.clone(), data.clone()).await;
        Ok(data)
    }
}

// =============================================================================
// Tests
// =============================================================================
