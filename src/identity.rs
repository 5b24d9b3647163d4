//! Cache identity derivation.
//!
//! An [`ImageIdentity`] is the SHA-256 digest of a source image's path and its
//! size in bytes. Modification time is not part of the key: re-extracting an
//! archive rewrites mtimes but leaves content (and size) untouched, and such a
//! file must still hit the cache.
//!
//! # Known limitation
//!
//! Two different contents at the same path with exactly the same byte size
//! produce the same identity. The cache will then serve the old pyramid. This
//! is accepted in exchange for never reading file content on open.

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Length of an identity in hex characters.
pub const IDENTITY_HEX_LEN: usize = 64;

/// Stable cache key for a source image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageIdentity(String);

impl ImageIdentity {
    /// Derive the identity for a path and a byte size.
    pub fn from_parts(path: &Path, size: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(size.to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse an identity received from outside the process.
    ///
    /// Only 64 lowercase hex characters are accepted, which also guarantees the
    /// value is safe to use as a directory name under the cache root.
    pub fn parse(value: &str) -> Result<Self, CacheError> {
        let well_formed = value.len() == IDENTITY_HEX_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(value.to_string()))
        } else {
            Err(CacheError::InvalidIdentity(value.to_string()))
        }
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ImageIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for ImageIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Compute the identity of the file at `path`.
///
/// Performs a single `stat`; no file content is read.
pub async fn identify(path: &Path) -> Result<ImageIdentity, CacheError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| CacheError::SourceUnavailable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    if !meta.is_file() {
        return Err(CacheError::SourceUnavailable {
            path: path.display().to_string(),
            message: "not a regular file".to_string(),
        });
    }

    Ok(ImageIdentity::from_parts(path, meta.len()))
}
