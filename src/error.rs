use thiserror::Error;

/// Errors raised by an image codec implementation.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// The source file could not be opened or read
    #[error("Cannot read source {path}: {message}")]
    SourceUnavailable { path: String, message: String },

    /// The header or pixel data could not be parsed
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Pixels could not be encoded to the output format
    #[error("Encode error: {message}")]
    Encode { message: String },
}

/// Errors that can occur when parsing or reading TIFF sources
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Field type code not defined by TIFF 6.0 or BigTIFF
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),

    /// A chunk's pixel data could not be decoded
    #[error("Chunk {index} decode failed: {message}")]
    ChunkDecode { index: usize, message: String },

    /// A decoded buffer would exceed the configured allocation ceiling
    #[error("Memory limit exceeded: {needed} bytes needed, limit is {limit}")]
    MemoryLimit { needed: u64, limit: u64 },
}

impl From<std::io::Error> for TiffError {
    fn from(err: std::io::Error) -> Self {
        TiffError::Io(err.to_string())
    }
}

impl From<TiffError> for CodecError {
    fn from(err: TiffError) -> Self {
        CodecError::Decode {
            message: err.to_string(),
        }
    }
}

/// Errors that can occur while building or reading the pyramid cache.
///
/// `CacheCorruption` and `IdentityMismatch` are produced by the store while
/// checking an entry. The builder treats both as a cache miss and rebuilds, so
/// they never reach a caller of [`crate::CacheManager::load_image`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Source image is missing or unreadable
    #[error("Source unavailable: {path} ({message})")]
    SourceUnavailable { path: String, message: String },

    /// The codec could not parse the header or the requested region
    #[error("Decode failure: {message}")]
    DecodeFailure { message: String },

    /// The codec could not encode a tile or overview
    #[error("Encode failure: {message}")]
    EncodeFailure { message: String },

    /// `metadata.json` exists but cannot be parsed
    #[error("Corrupt cache entry at {path}: {message}")]
    CacheCorruption { path: String, message: String },

    /// Recorded path or cache version does not match the current request
    #[error("Identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch { expected: String, found: String },

    /// No metadata exists for this identity (image was never opened, or was invalidated)
    #[error("Image not cached: {identity}")]
    NotCached { identity: String },

    /// Requested tile lies outside the tile grid
    #[error("Tile ({x}, {y}) out of bounds (grid is {tiles_x}x{tiles_y})")]
    TileOutOfBounds {
        x: u32,
        y: u32,
        tiles_x: u32,
        tiles_y: u32,
    },

    /// Identity string is not a 64-character lowercase hex digest
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Filesystem error inside the cache root
    #[error("Storage error at {path}: {message}")]
    Storage { path: String, message: String },

    /// A blocking codec task panicked or was aborted
    #[error("Codec task failed: {0}")]
    Task(String),

    /// The manager was constructed with settings that fail validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    pub(crate) fn storage(path: &std::path::Path, err: std::io::Error) -> Self {
        CacheError::Storage {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<CodecError> for CacheError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::SourceUnavailable { path, message } => {
                CacheError::SourceUnavailable { path, message }
            }
            CodecError::Decode { message } => CacheError::DecodeFailure { message },
            CodecError::Encode { message } => CacheError::EncodeFailure { message },
        }
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Task(err.to_string())
    }
}
