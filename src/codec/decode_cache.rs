//! Byte-bounded cache of decoded pixels.
//!
//! Holds TIFF chunks decoded by the windowed reader and, for sources that
//! have to be decoded whole, the full frame. Capacity is measured in bytes of
//! RGB pixel data so one huge frame cannot pin more memory than the budget.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::RgbImage;
use lru::LruCache;

use crate::error::CodecError;

/// Default capacity: 64MB of decoded pixels
pub const DEFAULT_DECODE_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Upper bound on the number of entries, to bound LRU bookkeeping.
const MAX_ENTRIES: usize = 4096;

/// A source file as it was when decoded.
///
/// A changed size yields a different key, so a rewritten file is never
/// served from pixels decoded before the rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub path: PathBuf,
    pub len: u64,
}

impl SourceKey {
    pub fn for_path(path: &Path) -> Result<Self, CodecError> {
        let meta = std::fs::metadata(path).map_err(|e| CodecError::SourceUnavailable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            len: meta.len(),
        })
    }
}

/// Which pixels of a source an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodedPart {
    /// The whole frame, from a full decode
    Whole,
    /// One TIFF chunk of one level
    Chunk { level: usize, index: usize },
}

type DecodedKey = (SourceKey, DecodedPart);

struct Inner {
    entries: LruCache<DecodedKey, Arc<RgbImage>>,
    current_size: usize,
}

/// LRU of decoded pixels with a byte capacity.
///
/// A capacity of zero disables caching: `put` becomes a no-op.
pub struct DecodeCache {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl DecodeCache {
    pub fn with_capacity(max_size: usize) -> Self {
        let max_entries = NonZeroUsize::new(MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(max_entries),
                current_size: 0,
            }),
            max_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, source: &SourceKey, part: DecodedPart) -> Option<Arc<RgbImage>> {
        self.lock().entries.get(&(source.clone(), part)).cloned()
    }

    /// Store pixels, evicting least-recently-used entries while over capacity.
    pub fn put(&self, source: SourceKey, part: DecodedPart, pixels: Arc<RgbImage>) {
        let size = pixels.as_raw().len();
        if size > self.max_size {
            return;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        let key = (source, part);

        if let Some(old) = inner.entries.peek(&key) {
            inner.current_size = inner.current_size.saturating_sub(old.as_raw().len());
        }
        if let Some((evicted_key, evicted)) = inner.entries.push(key.clone(), pixels) {
            if evicted_key != key {
                inner.current_size = inner.current_size.saturating_sub(evicted.as_raw().len());
            }
        }
        inner.current_size += size;

        while inner.current_size > self.max_size {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.current_size = inner.current_size.saturating_sub(evicted.as_raw().len());
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of pixel data currently held.
    pub fn size(&self) -> usize {
        self.lock().current_size
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}
