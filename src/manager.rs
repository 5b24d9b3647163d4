//! Cache manager: the single entry point callers use.
//!
//! ```text
//!                   ┌───────────────────────────┐
//!  load_image ─────►│                           │──► PyramidBuilder
//!  load_tile  ─────►│       CacheManager        │──► TileExtractor
//!  invalidate ─────►│                           │──► CacheStore + memory
//!                   └───────────────────────────┘
//! ```
//!
//! Per identity the cache moves through
//! `Unknown → MetadataOnly → PartiallyTiled → FullyTiled`, and back to
//! `Unknown` on invalidation, a cache version bump or a recorded-path mismatch.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{CodecPool, ImageCodec, ImageCrateCodec};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::identity::ImageIdentity;
use crate::pyramid::{CompleteBuild, Progress, PyramidBuilder};
use crate::store::{CacheStats, CacheStore, PyramidMetadata, TileNamespace};
use crate::tile::{TileExtractor, TileKey, TileMemoryCache, TileResponse};

// =============================================================================
// Types
// =============================================================================

/// An opened image.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedImage {
    pub identity: ImageIdentity,
    pub metadata: PyramidMetadata,

    /// Whether a valid entry already existed
    pub cache_hit: bool,
}

/// How much of an identity's pyramid is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheState {
    /// No usable metadata
    Unknown,
    /// Metadata and overviews, no tiles yet
    MetadataOnly,
    /// Some tiles generated
    PartiallyTiled,
    /// Every tile of the grid generated
    FullyTiled,
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Façade over the builder, the extractor and the store.
pub struct CacheManager<C = ImageCrateCodec> {
    config: CacheConfig,
    store: Arc<CacheStore>,
    memory: Arc<TileMemoryCache>,
    extractor: Arc<TileExtractor<C>>,
    builder: PyramidBuilder<C>,
}

impl CacheManager<ImageCrateCodec> {
    /// Create a manager using the `image`-crate codec, sized from `config`.
    pub fn with_default_codec(config: CacheConfig) -> Result<Self, CacheError> {
        let codec = ImageCrateCodec::with_limits(config.decode_cache_bytes, config.decode_max_alloc);
        Self::new(config, codec)
    }
}

impl<C: ImageCodec> CacheManager<C> {
    /// Create a manager around `codec`.
    ///
    /// Fails with [`CacheError::InvalidConfig`] when `config` does not validate.
    pub fn new(config: CacheConfig, codec: C) -> Result<Self, CacheError> {
        Self::with_shared_codec(config, Arc::new(codec))
    }

    pub fn with_shared_codec(config: CacheConfig, codec: Arc<C>) -> Result<Self, CacheError> {
        config.validate().map_err(CacheError::InvalidConfig)?;

        let store = Arc::new(CacheStore::with_extension(
            config.root_dir.clone(),
            codec.extension(),
        ));
        let pool = CodecPool::with_shared_codec(codec, config.decode_concurrency);
        let memory = Arc::new(TileMemoryCache::with_capacity(config.memory_cache_bytes));
        let extractor = Arc::new(
            TileExtractor::new(Arc::clone(&store), pool.clone(), Arc::clone(&memory))
                .with_quality(config.tile_quality),
        );
        let builder = PyramidBuilder::new(Arc::clone(&store), pool, Arc::clone(&extractor), &config);

        Ok(Self {
            config,
            store,
            memory,
            extractor,
            builder,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Content type of tiles and overviews.
    pub fn content_type(&self) -> &'static str {
        self.extractor.content_type()
    }

    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    /// Open an image, building metadata and overviews if needed.
    pub async fn load_image(&self, path: &Path) -> Result<LoadedImage, CacheError> {
        let outcome = self.builder.build(path).await?;
        if !outcome.cache_hit {
            // A rebuilt entry may share an identity with tiles still held in memory
            self.memory.remove_identity(&outcome.identity).await;
        }
        Ok(LoadedImage {
            identity: outcome.identity,
            metadata: outcome.metadata,
            cache_hit: outcome.cache_hit,
        })
    }

    /// Open an image and generate every tile of its grid.
    pub async fn warm<F>(&self, path: &Path, on_progress: F) -> Result<CompleteBuild, CacheError>
    where
        F: FnMut(Progress) -> ControlFlow<()>,
    {
        self.builder.build_complete(path, on_progress).await
    }

    // -------------------------------------------------------------------------
    // Overviews
    // -------------------------------------------------------------------------

    /// Cached thumbnail bytes.
    ///
    /// A thumbnail missing from an otherwise valid entry is regenerated.
    pub async fn load_thumbnail(&self, identity: &ImageIdentity) -> Result<Bytes, CacheError> {
        let metadata = self.extractor.metadata(identity).await?;
        if let Some(data) = self.store.read_thumbnail(identity).await? {
            return Ok(data);
        }

        warn!(identity = %identity, "Thumbnail missing, regenerating");
        let data = self
            .builder
            .overview(&PathBuf::from(&metadata.original_path), metadata.thumbnail_size)
            .await?;
        self.store.write_thumbnail(identity, &data).await?;
        Ok(data)
    }

    /// Medium overview bytes, synthesized and persisted on first request.
    ///
    /// When the source can no longer be read the thumbnail is returned instead.
    /// That substitute is not persisted, so a later request with the source back
    /// in place still gets a real medium overview.
    pub async fn load_medium(&self, identity: &ImageIdentity) -> Result<Bytes, CacheError> {
        let metadata = self.extractor.metadata(identity).await?;
        if let Some(data) = self.store.read_medium(identity).await? {
            return Ok(data);
        }

        debug!(identity = %identity, "Synthesizing medium overview");
        let source = PathBuf::from(&metadata.original_path);
        match self.builder.overview(&source, metadata.medium_size).await {
            Ok(data) => {
                self.store.write_medium(identity, &data).await?;
                Ok(data)
            }
            Err(CacheError::SourceUnavailable { path, message }) => {
                warn!(
                    identity = %identity,
                    path = %path,
                    "Source unavailable, serving thumbnail as medium: {}",
                    message
                );
                match self.store.read_thumbnail(identity).await? {
                    Some(thumbnail) => Ok(thumbnail),
                    None => Err(CacheError::SourceUnavailable { path, message }),
                }
            }
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Tiles
    // -------------------------------------------------------------------------

    pub async fn load_tile(
        &self,
        identity: &ImageIdentity,
        x: u32,
        y: u32,
    ) -> Result<TileResponse, CacheError> {
        self.extractor.get_tile(identity, x, y).await
    }

    /// Several tiles in one call; see [`TileExtractor::get_tiles_batch`].
    pub async fn load_tiles_batch(
        &self,
        identity: &ImageIdentity,
        coords: &[(u32, u32)],
    ) -> Result<Vec<Result<TileResponse, CacheError>>, CacheError> {
        self.extractor.get_tiles_batch(identity, coords).await
    }

    /// A tile of the affine namespace, if one has been stored.
    pub async fn load_affine_tile(
        &self,
        identity: &ImageIdentity,
        x: u32,
        y: u32,
    ) -> Result<Option<Bytes>, CacheError> {
        self.check_tile(identity, x, y).await?;
        let key = TileKey::new(identity.clone(), TileNamespace::Affine, x, y);

        if let Some(data) = self.memory.get(&key).await {
            return Ok(Some(data));
        }
        let data = self
            .store
            .read_tile(identity, TileNamespace::Affine, x, y)
            .await?;
        if let Some(data) = &data {
            self.memory.put(key, data.clone()).await;
        }
        Ok(data)
    }

    /// Persist an externally rendered affine tile.
    pub async fn store_affine_tile(
        &self,
        identity: &ImageIdentity,
        x: u32,
        y: u32,
        data: Bytes,
    ) -> Result<(), CacheError> {
        self.check_tile(identity, x, y).await?;
        self.store
            .write_tile(identity, TileNamespace::Affine, x, y, &data)
            .await?;
        self.memory
            .put(TileKey::new(identity.clone(), TileNamespace::Affine, x, y), data)
            .await;
        Ok(())
    }

    /// Drop every affine tile of `identity`, keeping the base pyramid.
    pub async fn invalidate_affine(&self, identity: &ImageIdentity) -> Result<(), CacheError> {
        self.memory
            .remove_namespace(identity, TileNamespace::Affine)
            .await;
        self.store
            .clear_namespace(identity, TileNamespace::Affine)
            .await
    }

    async fn check_tile(
        &self,
        identity: &ImageIdentity,
        x: u32,
        y: u32,
    ) -> Result<PyramidMetadata, CacheError> {
        let metadata = self.extractor.metadata(identity).await?;
        if !metadata.contains_tile(x, y) {
            return Err(CacheError::TileOutOfBounds {
                x,
                y,
                tiles_x: metadata.tiles_x,
                tiles_y: metadata.tiles_y,
            });
        }
        Ok(metadata)
    }

    // -------------------------------------------------------------------------
    // State and maintenance
    // -------------------------------------------------------------------------

    /// Where `identity` is in its lifecycle.
    pub async fn state(&self, identity: &ImageIdentity) -> Result<CacheState, CacheError> {
        let metadata = match self.extractor.metadata(identity).await {
            Ok(metadata) => metadata,
            Err(CacheError::NotCached { .. }) => return Ok(CacheState::Unknown),
            Err(e) => return Err(e),
        };

        let tiles = self.store.count_tiles(identity, TileNamespace::Base).await?;
        Ok(match tiles {
            0 => CacheState::MetadataOnly,
            n if n >= metadata.total_tiles => CacheState::FullyTiled,
            _ => CacheState::PartiallyTiled,
        })
    }

    /// Remove everything cached for `identity`.
    ///
    /// Returns `false` if there was no entry on disk.
    pub async fn invalidate(&self, identity: &ImageIdentity) -> Result<bool, CacheError> {
        let evicted = self.memory.remove_identity(identity).await;
        let removed = self.store.clear(identity).await?;
        info!(identity = %identity, removed, evicted, "Invalidated image");
        Ok(removed)
    }

    /// Remove every entry.
    pub async fn invalidate_all(&self) -> Result<(), CacheError> {
        self.memory.clear().await;
        self.store.clear_all().await
    }

    /// Entry count and bytes on disk. Walks the whole cache root.
    pub async fn get_stats(&self) -> Result<CacheStats, CacheError> {
        self.store.stats().await
    }
}

// =============================================================================
// Tests
// =============================================================================
