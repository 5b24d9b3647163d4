//! Opening an image: identity, metadata and eager overviews.
//!
//! # Build order
//!
//! ```text
//! identify ──► validate ──valid──► return (no decode)
//!                 │
//!              invalid
//!                 ▼
//!      clear stale entry ──► read header  ──► thumbnail ──► medium?
//!                                                              │
//!                                           metadata.json ◄────┘
//! ```
//!
//! `metadata.json` is written last. An entry without it is never considered
//! valid, so a build that fails halfway leaves nothing a later open would trust.
//!
//! Builds are single-flight per identity: concurrent opens of the same image
//! wait for the one building it and then re-validate, so the stale-entry clear
//! never runs underneath another build.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::codec::{CodecPool, ImageCodec};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::flight::{Flight, SingleFlight};
use crate::identity::{identify, ImageIdentity};
use crate::store::{CacheStore, InvalidReason, PyramidMetadata, Validity};
use crate::tile::TileExtractor;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of opening an image.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub identity: ImageIdentity,
    pub metadata: PyramidMetadata,

    /// `true` when the existing entry was valid and nothing was decoded
    pub cache_hit: bool,
}

/// Tiles processed so far during a complete build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
}

/// Result of a complete (every tile) build.
#[derive(Debug, Clone)]
pub struct CompleteBuild {
    pub identity: ImageIdentity,
    pub metadata: PyramidMetadata,

    /// Tiles that had to be generated; cached tiles are not counted
    pub tiles_generated: u64,

    /// `false` if the progress callback stopped the walk early
    pub completed: bool,
}

// =============================================================================
// Pyramid Builder
// =============================================================================

/// Builds cache entries for source images.
pub struct PyramidBuilder<C> {
    store: Arc<CacheStore>,
    pool: CodecPool<C>,
    extractor: Arc<TileExtractor<C>>,
    tile_size: u32,
    thumbnail_size: u32,
    medium_size: u32,
    overview_quality: u8,
    in_flight: SingleFlight<ImageIdentity>,
}

impl<C: ImageCodec> PyramidBuilder<C> {
    pub fn new(
        store: Arc<CacheStore>,
        pool: CodecPool<C>,
        extractor: Arc<TileExtractor<C>>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            pool,
            extractor,
            tile_size: config.tile_size,
            thumbnail_size: config.thumbnail_size,
            medium_size: config.medium_size,
            overview_quality: config.overview_quality,
            in_flight: SingleFlight::new(),
        }
    }

    /// Open `path`, building its entry if there is no valid one.
    ///
    /// The tile grid is never touched here.
    pub async fn build(&self, path: &Path) -> Result<BuildOutcome, CacheError> {
        let identity = identify(path).await?;

        loop {
            match self.store.validate(&identity, path).await {
                Validity::Valid(metadata) => {
                    debug!(identity = %identity, "Cache hit on open");
                    return Ok(BuildOutcome {
                        identity,
                        metadata,
                        cache_hit: true,
                    });
                }
                Validity::Invalid(InvalidReason::Missing) => {}
                Validity::Invalid(InvalidReason::Corrupt(e) | InvalidReason::Stale(e)) => {
                    warn!(identity = %identity, "Rebuilding invalid cache entry: {}", e);
                }
            }

            match self.in_flight.claim(&identity) {
                Flight::Lead(guard) => {
                    // A build may have finished between `validate` and `claim`
                    if let Validity::Valid(metadata) = self.store.validate(&identity, path).await {
                        return Ok(BuildOutcome {
                            identity,
                            metadata,
                            cache_hit: true,
                        });
                    }

                    let result = self.rebuild(&identity, path).await;
                    drop(guard);
                    return result.map(|metadata| BuildOutcome {
                        identity,
                        metadata,
                        cache_hit: false,
                    });
                }
                Flight::Follow(notify) => {
                    debug!(identity = %identity, "Waiting for in-flight build");
                    self.in_flight.wait(&identity, notify).await;
                }
            }
        }
    }

    async fn rebuild(
        &self,
        identity: &ImageIdentity,
        path: &Path,
    ) -> Result<PyramidMetadata, CacheError> {
        // Stale tiles from a previous version or path must never be served
        self.store.clear(identity).await?;
        self.build_entry(identity, path).await
    }

    async fn build_entry(
        &self,
        identity: &ImageIdentity,
        path: &Path,
    ) -> Result<PyramidMetadata, CacheError> {
        let source = path.to_path_buf();
        let (width, height) = self
            .pool
            .run(move |codec| codec.probe_dimensions(&source))
            .await?;

        if width == 0 || height == 0 {
            return Err(CacheError::DecodeFailure {
                message: format!("image has zero dimension ({}x{})", width, height),
            });
        }

        let metadata = PyramidMetadata::new(
            path.to_string_lossy(),
            width,
            height,
            self.tile_size,
            self.thumbnail_size,
            self.medium_size,
        );
        info!(
            identity = %identity,
            width,
            height,
            tiles = metadata.total_tiles,
            "Building pyramid entry"
        );

        let thumbnail = self.overview(path, metadata.thumbnail_size).await?;
        let medium = if metadata.needs_eager_medium() {
            Some(self.overview(path, metadata.medium_size).await?)
        } else {
            None
        };

        self.store.write_thumbnail(identity, &thumbnail).await?;
        if let Some(medium) = medium {
            self.store.write_medium(identity, &medium).await?;
        }
        self.store.write_metadata(identity, &metadata).await?;

        Ok(metadata)
    }

    /// Downsample the whole source to fit in `max_dimension` and encode it.
    pub async fn overview(&self, path: &Path, max_dimension: u32) -> Result<Bytes, CacheError> {
        let source: PathBuf = path.to_path_buf();
        let quality = self.overview_quality;
        self.pool
            .run(move |codec| {
                let pixels = codec.downsample(&source, max_dimension)?;
                codec.encode(&pixels, quality)
            })
            .await
    }

    /// Build the entry and then every tile of the grid, row-major.
    ///
    /// `on_progress` runs after each tile; returning [`ControlFlow::Break`]
    /// stops the walk before the next one. A tile error aborts the walk.
    pub async fn build_complete<F>(
        &self,
        path: &Path,
        mut on_progress: F,
    ) -> Result<CompleteBuild, CacheError>
    where
        F: FnMut(Progress) -> ControlFlow<()>,
    {
        let BuildOutcome {
            identity, metadata, ..
        } = self.build(path).await?;

        let total = metadata.total_tiles;
        let mut done = 0;
        let mut tiles_generated = 0;
        let mut completed = true;

        for (x, y) in metadata.tile_coords() {
            let tile = self
                .extractor
                .get_tile_with_metadata(&identity, &metadata, x, y)
                .await?;
            if !tile.cache_hit {
                tiles_generated += 1;
            }
            done += 1;

            if on_progress(Progress { done, total }).is_break() && done < total {
                completed = false;
                break;
            }
        }

        info!(
            identity = %identity,
            generated = tiles_generated,
            total,
            completed,
            "Complete build finished"
        );
        Ok(CompleteBuild {
            identity,
            metadata,
            tiles_generated,
            completed,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
