//! In-memory hot layer for encoded tiles.
//!
//! Tiles are immutable once written to disk, so holding their bytes in memory
//! can never serve stale data as long as the layer is purged when an identity
//! is invalidated. The layer tracks the total size of cached tiles and evicts
//! least-recently-used entries once the byte capacity is exceeded.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::identity::ImageIdentity;
use crate::store::TileNamespace;

/// Default capacity: 64MB
pub const DEFAULT_MEMORY_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Upper bound on the number of entries, to bound LRU bookkeeping.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

// =============================================================================
// Tile Key
// =============================================================================

/// Full address of one tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub identity: ImageIdentity,
    pub namespace: TileNamespace,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(identity: ImageIdentity, namespace: TileNamespace, x: u32, y: u32) -> Self {
        Self {
            identity,
            namespace,
            x,
            y,
        }
    }

    /// Key for a tile of the base pyramid.
    pub fn base(identity: ImageIdentity, x: u32, y: u32) -> Self {
        Self::new(identity, TileNamespace::Base, x, y)
    }
}

// =============================================================================
// Tile Memory Cache
// =============================================================================

struct Inner {
    entries: LruCache<TileKey, Bytes>,
    current_size: usize,
}

/// LRU cache of encoded tiles with a byte capacity.
///
/// A capacity of zero disables the layer: `put` becomes a no-op.
pub struct TileMemoryCache {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl TileMemoryCache {
    /// Create a cache with the default capacity (64MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CACHE_BYTES)
    }

    /// Create a cache holding at most `max_size` bytes of tiles.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Create a cache with a byte capacity and an entry-count ceiling.
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(max_entries),
                current_size: 0,
            }),
            max_size,
        }
    }

    /// Get a tile, marking it as recently used.
    pub async fn get(&self, key: &TileKey) -> Option<Bytes> {
        let mut inner = self.inner.lock().await;
        inner.entries.get(key).cloned()
    }

    /// Check for a tile without updating LRU order.
    pub async fn contains(&self, key: &TileKey) -> bool {
        let inner = self.inner.lock().await;
        inner.entries.contains(key)
    }

    /// Store a tile, evicting least-recently-used entries while over capacity.
    pub async fn put(&self, key: TileKey, data: Bytes) {
        let data_size = data.len();
        if data_size > self.max_size {
            return;
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(old) = inner.entries.peek(&key) {
            inner.current_size = inner.current_size.saturating_sub(old.len());
        }

        // Entry-count eviction happens inside `push`
        if let Some((evicted_key, evicted)) = inner.entries.push(key.clone(), data) {
            if evicted_key != key {
                inner.current_size = inner.current_size.saturating_sub(evicted.len());
            }
        }
        inner.current_size += data_size;

        while inner.current_size > self.max_size {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.current_size = inner.current_size.saturating_sub(evicted.len());
                }
                None => break,
            }
        }
    }

    /// Drop every tile of `identity`, in all namespaces.
    ///
    /// Returns the number of entries removed. This is O(n) in cached tiles.
    pub async fn remove_identity(&self, identity: &ImageIdentity) -> usize {
        self.remove_where(|key| &key.identity == identity).await
    }

    /// Drop every tile of one namespace of `identity`.
    pub async fn remove_namespace(&self, identity: &ImageIdentity, namespace: TileNamespace) -> usize {
        self.remove_where(|key| &key.identity == identity && key.namespace == namespace)
            .await
    }

    async fn remove_where(&self, matches: impl Fn(&TileKey) -> bool) -> usize {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let doomed: Vec<TileKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| matches(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            if let Some(data) = inner.entries.pop(key) {
                inner.current_size = inner.current_size.saturating_sub(data.len());
            }
        }
        doomed.len()
    }

    /// Clear all entries.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.current_size = 0;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Current total size of cached tiles in bytes.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.current_size
    }

    /// Maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for TileMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
