//! Disk-backed cache store.
//!
//! Every entry lives in its own directory named by the image identity:
//!
//! ```text
//! <root>/<identity>/metadata.json
//!                  /thumbnail.<ext>
//!                  /medium.<ext>
//!                  /tiles/tile_<x>_<y>.<ext>
//!                  /tiles-affine/tile_<x>_<y>.<ext>
//! ```
//!
//! Files are written to a temporary sibling first and renamed into place, so a
//! reader never observes a partially written tile. Temporary siblings are
//! named `.<file>.<pid>-<n>.tmp`; those of other processes are swept by
//! [`CacheStore::ensure_root`] and none are counted by [`CacheStore::stats`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::CacheError;
use crate::identity::ImageIdentity;

use super::metadata::{PyramidMetadata, CACHE_VERSION};

/// File name of the per-entry metadata document.
pub const METADATA_FILE: &str = "metadata.json";

/// Default extension for encoded images.
pub const DEFAULT_EXTENSION: &str = "jpg";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Namespaces
// =============================================================================

/// Tile subtree inside a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileNamespace {
    /// The base pyramid of the untransformed source
    Base,
    /// Pre-transformed (rotated/scaled) overlay variant
    Affine,
}

impl TileNamespace {
    /// Directory name inside the entry.
    pub fn dir_name(self) -> &'static str {
        match self {
            TileNamespace::Base => "tiles",
            TileNamespace::Affine => "tiles-affine",
        }
    }
}

// =============================================================================
// Validity
// =============================================================================

/// Why an entry cannot be reused.
#[derive(Debug, Clone)]
pub enum InvalidReason {
    /// No `metadata.json`
    Missing,
    /// `metadata.json` exists but cannot be parsed
    Corrupt(CacheError),
    /// Version or recorded path differs
    Stale(CacheError),
}

/// Result of checking an entry against a source path.
#[derive(Debug, Clone)]
pub enum Validity {
    Valid(PyramidMetadata),
    Invalid(InvalidReason),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid(_))
    }

    pub fn metadata(&self) -> Option<&PyramidMetadata> {
        match self {
            Validity::Valid(meta) => Some(meta),
            Validity::Invalid(_) => None,
        }
    }
}

/// Check recorded metadata against the current version and the supplied path.
pub fn check_metadata(meta: &PyramidMetadata, path: &Path) -> Result<(), CacheError> {
    if meta.cache_version != CACHE_VERSION {
        return Err(CacheError::IdentityMismatch {
            expected: format!("cache version {}", CACHE_VERSION),
            found: format!("cache version {}", meta.cache_version),
        });
    }
    let supplied = path.to_string_lossy();
    if meta.original_path != supplied {
        return Err(CacheError::IdentityMismatch {
            expected: supplied.into_owned(),
            found: meta.original_path.clone(),
        });
    }
    Ok(())
}

// =============================================================================
// Stats
// =============================================================================

/// Aggregate size of the cache root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub image_count: u64,
    pub total_bytes: u64,
}

// =============================================================================
// Cache Store
// =============================================================================

/// Filesystem persistence for pyramid entries under a single root.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    extension: String,
}

impl CacheStore {
    /// Create a store rooted at `root`, storing encoded images as `.jpg`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_extension(root, DEFAULT_EXTENSION)
    }

    /// Create a store with a custom encoded-image extension.
    pub fn with_extension(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    // -------------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------------

    pub fn entry_dir(&self, identity: &ImageIdentity) -> PathBuf {
        self.root.join(identity.as_str())
    }

    pub fn metadata_path(&self, identity: &ImageIdentity) -> PathBuf {
        self.entry_dir(identity).join(METADATA_FILE)
    }

    pub fn thumbnail_path(&self, identity: &ImageIdentity) -> PathBuf {
        self.entry_dir(identity)
            .join(format!("thumbnail.{}", self.extension))
    }

    pub fn medium_path(&self, identity: &ImageIdentity) -> PathBuf {
        self.entry_dir(identity)
            .join(format!("medium.{}", self.extension))
    }

    pub fn namespace_dir(&self, identity: &ImageIdentity, namespace: TileNamespace) -> PathBuf {
        self.entry_dir(identity).join(namespace.dir_name())
    }

    pub fn tile_path(
        &self,
        identity: &ImageIdentity,
        namespace: TileNamespace,
        x: u32,
        y: u32,
    ) -> PathBuf {
        self.namespace_dir(identity, namespace)
            .join(format!("tile_{}_{}.{}", x, y, self.extension))
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// Create the cache root if it does not exist, and remove temporary files
    /// left behind by writers that died before their rename.
    pub async fn ensure_root(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::storage(&self.root, e))?;
        let removed = self.sweep_temp_files().await?;
        if removed > 0 {
            info!(root = %self.root.display(), removed, "Removed leftover temporary files");
        }
        Ok(())
    }

    /// Delete temporary files written by other processes.
    ///
    /// Files from this process are kept: their writer may still be running.
    pub async fn sweep_temp_files(&self) -> Result<u64, CacheError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || sweep_temp_files(&root)).await?
    }

    /// Check whether the entry for `identity` can serve `path`.
    ///
    /// Missing, unparsable, version-mismatched and path-mismatched entries are
    /// all reported as invalid; none of them is an error.
    pub async fn validate(&self, identity: &ImageIdentity, path: &Path) -> Validity {
        let meta = match self.read_metadata(identity).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return Validity::Invalid(InvalidReason::Missing),
            Err(e) => return Validity::Invalid(InvalidReason::Corrupt(e)),
        };

        match check_metadata(&meta, path) {
            Ok(()) => Validity::Valid(meta),
            Err(e) => Validity::Invalid(InvalidReason::Stale(e)),
        }
    }

    pub async fn is_valid(&self, identity: &ImageIdentity, path: &Path) -> bool {
        self.validate(identity, path).await.is_valid()
    }

    /// Read `metadata.json`. An absent file is `Ok(None)`.
    pub async fn read_metadata(
        &self,
        identity: &ImageIdentity,
    ) -> Result<Option<PyramidMetadata>, CacheError> {
        let path = self.metadata_path(identity);
        let Some(raw) = read_optional(&path).await? else {
            return Ok(None);
        };
        let meta: PyramidMetadata =
            serde_json::from_slice(&raw).map_err(|e| CacheError::CacheCorruption {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        meta.check_grid().map_err(|message| CacheError::CacheCorruption {
            path: path.display().to_string(),
            message,
        })?;
        Ok(Some(meta))
    }

    pub async fn write_metadata(
        &self,
        identity: &ImageIdentity,
        meta: &PyramidMetadata,
    ) -> Result<(), CacheError> {
        let path = self.metadata_path(identity);
        let json = serde_json::to_vec_pretty(meta).map_err(|e| CacheError::Storage {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&path, &json).await
    }

    // -------------------------------------------------------------------------
    // Overviews
    // -------------------------------------------------------------------------

    pub async fn read_thumbnail(&self, identity: &ImageIdentity) -> Result<Option<Bytes>, CacheError> {
        read_optional(&self.thumbnail_path(identity)).await
    }

    pub async fn write_thumbnail(&self, identity: &ImageIdentity, data: &[u8]) -> Result<(), CacheError> {
        write_atomic(&self.thumbnail_path(identity), data).await
    }

    pub async fn has_thumbnail(&self, identity: &ImageIdentity) -> bool {
        is_file(&self.thumbnail_path(identity)).await
    }

    pub async fn read_medium(&self, identity: &ImageIdentity) -> Result<Option<Bytes>, CacheError> {
        read_optional(&self.medium_path(identity)).await
    }

    pub async fn write_medium(&self, identity: &ImageIdentity, data: &[u8]) -> Result<(), CacheError> {
        write_atomic(&self.medium_path(identity), data).await
    }

    pub async fn has_medium(&self, identity: &ImageIdentity) -> bool {
        is_file(&self.medium_path(identity)).await
    }

    // -------------------------------------------------------------------------
    // Tiles
    // -------------------------------------------------------------------------

    pub async fn read_tile(
        &self,
        identity: &ImageIdentity,
        namespace: TileNamespace,
        x: u32,
        y: u32,
    ) -> Result<Option<Bytes>, CacheError> {
        read_optional(&self.tile_path(identity, namespace, x, y)).await
    }

    pub async fn write_tile(
        &self,
        identity: &ImageIdentity,
        namespace: TileNamespace,
        x: u32,
        y: u32,
        data: &[u8],
    ) -> Result<(), CacheError> {
        write_atomic(&self.tile_path(identity, namespace, x, y), data).await
    }

    pub async fn has_tile(
        &self,
        identity: &ImageIdentity,
        namespace: TileNamespace,
        x: u32,
        y: u32,
    ) -> bool {
        is_file(&self.tile_path(identity, namespace, x, y)).await
    }

    /// Number of finished tile files in a namespace.
    pub async fn count_tiles(
        &self,
        identity: &ImageIdentity,
        namespace: TileNamespace,
    ) -> Result<u64, CacheError> {
        let dir = self.namespace_dir(identity, namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::storage(&dir, e)),
        };

        let suffix = format!(".{}", self.extension);
        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::storage(&dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("tile_") && name.ends_with(&suffix) {
                count += 1;
            }
        }
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    pub async fn entry_exists(&self, identity: &ImageIdentity) -> bool {
        tokio::fs::metadata(self.entry_dir(identity))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Remove the entry directory for `identity`.
    ///
    /// Returns `false` if there was nothing to remove.
    pub async fn clear(&self, identity: &ImageIdentity) -> Result<bool, CacheError> {
        let dir = self.entry_dir(identity);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(identity = %identity, "Cleared cache entry");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::storage(&dir, e)),
        }
    }

    /// Remove one tile namespace of an entry, leaving everything else intact.
    pub async fn clear_namespace(
        &self,
        identity: &ImageIdentity,
        namespace: TileNamespace,
    ) -> Result<(), CacheError> {
        let dir = self.namespace_dir(identity, namespace);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(identity = %identity, namespace = namespace.dir_name(), "Cleared tile namespace");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::storage(&dir, e)),
        }
    }

    /// Delete and recreate the cache root.
    pub async fn clear_all(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::storage(&self.root, e)),
        }
        info!(root = %self.root.display(), "Cleared whole cache");
        self.ensure_root().await
    }

    /// Walk the whole cache root.
    ///
    /// This is a maintenance operation and touches every file.
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_stats(&root)).await?
    }
}

/// Process id recorded in the name of a temporary file from [`write_atomic`],
/// or `None` if `name` is not one.
fn temp_file_owner(name: &str) -> Option<u32> {
    let stem = name.strip_prefix('.')?.strip_suffix(".tmp")?;
    let (rest, _counter) = stem.rsplit_once('-')?;
    let (_file, pid) = rest.rsplit_once('.')?;
    pid.parse().ok()
}

fn sweep_temp_files(root: &Path) -> Result<u64, CacheError> {
    let mut removed = 0;
    if !root.exists() {
        return Ok(removed);
    }

    let own_pid = std::process::id();
    for entry in WalkDir::new(root).min_depth(1).max_depth(3) {
        let entry = entry.map_err(|e| CacheError::Storage {
            path: root.display().to_string(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let owner = temp_file_owner(&entry.file_name().to_string_lossy());
        if owner.is_some_and(|pid| pid != own_pid) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::storage(entry.path(), e)),
            }
        }
    }
    Ok(removed)
}

fn walk_stats(root: &Path) -> Result<CacheStats, CacheError> {
    let mut stats = CacheStats::default();
    if !root.exists() {
        return Ok(stats);
    }

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| CacheError::Storage {
            path: root.display().to_string(),
            message: e.to_string(),
        })?;
        let file_type = entry.file_type();
        if entry.depth() == 1 && file_type.is_dir() {
            stats.image_count += 1;
        } else if file_type.is_file()
            && temp_file_owner(&entry.file_name().to_string_lossy()).is_none()
        {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            stats.total_bytes += len;
        }
    }
    Ok(stats)
}

// =============================================================================
// File helpers
// =============================================================================

async fn read_optional(path: &Path) -> Result<Option<Bytes>, CacheError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::storage(path, e)),
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Write `data` to `path` via a uniquely named temporary sibling and a rename.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let parent = path.parent().ok_or_else(|| CacheError::Storage {
        path: path.display().to_string(),
        message: "path has no parent directory".to_string(),
    })?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| CacheError::storage(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{}.{}-{}.tmp",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(CacheError::storage(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(CacheError::storage(path, e));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
