//! HTTP request handlers for the Pyramid Cache API.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /images` - Open an image (`{"path": "..."}`)
//! - `GET /images/{identity}/state` - Cache state of an image
//! - `GET /images/{identity}/thumbnail` - Thumbnail overview
//! - `GET /images/{identity}/medium` - Medium overview
//! - `GET /images/{identity}/tiles/{x}/{y}.jpg` - One tile
//! - `POST /images/{identity}/tiles` - Generate a batch of tiles (sizes, or base64 bytes on request)
//! - `DELETE /images/{identity}` - Invalidate one image
//! - `DELETE /cache` - Invalidate everything
//! - `GET /cache/stats` - Entry count and bytes on disk

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::codec::ImageCodec;
use crate::error::CacheError;
use crate::identity::ImageIdentity;
use crate::manager::{CacheManager, CacheState, LoadedImage};
use crate::store::CacheStats;

/// Response header telling whether a tile was already cached.
pub const TILE_CACHE_HIT_HEADER: &str = "x-tile-cache-hit";

/// Upper bound on tiles in one batch request.
pub const MAX_BATCH_TILES: usize = 1024;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state containing the cache manager.
///
/// This is passed to all handlers via Axum's State extractor.
pub struct AppState<C> {
    pub manager: Arc<CacheManager<C>>,

    /// Cache-Control max-age in seconds for image responses
    pub cache_max_age: u32,
}

impl<C: ImageCodec> AppState<C> {
    pub fn new(manager: CacheManager<C>) -> Self {
        Self::with_cache_max_age(Arc::new(manager), 3600)
    }

    pub fn with_cache_max_age(manager: Arc<CacheManager<C>>, cache_max_age: u32) -> Self {
        Self {
            manager,
            cache_max_age,
        }
    }
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            cache_max_age: self.cache_max_age,
        }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Body of `POST /images`.
#[derive(Debug, Deserialize)]
pub struct OpenImageRequest {
    pub path: PathBuf,
}

/// Path parameters for tile requests.
///
/// Extracted from: `/images/{identity}/tiles/{x}/{filename}`
/// where filename is `{y}` or `{y}.{ext}`
#[derive(Debug, Deserialize)]
pub struct TilePathParams {
    pub identity: String,
    pub x: u32,
    pub filename: String,
}

impl TilePathParams {
    /// Parse the Y coordinate, stripping an optional `.{extension}` suffix.
    pub fn y(&self, extension: &str) -> Option<u32> {
        let y = self
            .filename
            .strip_suffix(extension)
            .and_then(|rest| rest.strip_suffix('.'))
            .unwrap_or(&self.filename);
        y.parse().ok()
    }
}

/// One coordinate in a batch request.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

/// Body of `POST /images/{identity}/tiles`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub tiles: Vec<TileCoord>,

    /// Return each tile's encoded bytes, base64, alongside its status
    #[serde(default)]
    pub include_data: bool,
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_cached", "tile_out_of_bounds")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Response of `GET /images/{identity}/state`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    pub identity: ImageIdentity,
    pub state: CacheState,
}

/// Outcome of one tile of a batch.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTileResult {
    pub x: u32,
    pub y: u32,

    /// HTTP status this tile would have had as a single request
    pub status: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,

    /// Encoded size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,

    /// Standard base64 of the encoded tile, when the request set `includeData`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

/// Response of `POST /images/{identity}/tiles`.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub tiles: Vec<BatchTileResult>,
}

/// Response of `DELETE /images/{identity}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
    pub identity: ImageIdentity,

    /// `false` if nothing was cached for this identity
    pub removed: bool,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Status code, error type and message for a cache error.
fn classify(err: &CacheError) -> (StatusCode, &'static str) {
    match err {
        CacheError::NotCached { .. } => (StatusCode::NOT_FOUND, "not_cached"),
        CacheError::SourceUnavailable { .. } => (StatusCode::NOT_FOUND, "source_unavailable"),
        CacheError::TileOutOfBounds { .. } => (StatusCode::BAD_REQUEST, "tile_out_of_bounds"),
        CacheError::InvalidIdentity(_) => (StatusCode::BAD_REQUEST, "invalid_identity"),
        CacheError::DecodeFailure { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "decode_failure"),
        CacheError::EncodeFailure { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "encode_failure"),
        CacheError::CacheCorruption { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "cache_corruption")
        }
        CacheError::IdentityMismatch { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "identity_mismatch")
        }
        CacheError::Storage { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        CacheError::Task(_) => (StatusCode::INTERNAL_SERVER_ERROR, "task_failed"),
        CacheError::InvalidConfig(_) => (StatusCode::INTERNAL_SERVER_ERROR, "invalid_config"),
    }
}

/// Log a failed request based on its severity.
///
/// - 5xx errors are logged at ERROR level
/// - 404s at DEBUG level (common and expected)
/// - other 4xx errors at WARN level
fn log_error(status: StatusCode, error_type: &str, message: &str) {
    if status.is_server_error() {
        error!(
            error_type = error_type,
            status = status.as_u16(),
            "Server error: {}",
            message
        );
    } else if status == StatusCode::NOT_FOUND {
        debug!(
            error_type = error_type,
            status = status.as_u16(),
            "Resource not found: {}",
            message
        );
    } else {
        warn!(
            error_type = error_type,
            status = status.as_u16(),
            "Client error: {}",
            message
        );
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let (status, error_type) = classify(&self);
        let message = self.to_string();
        log_error(status, error_type, &message);

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (status, Json(error_response)).into_response()
    }
}

/// Wrapper for handler errors to implement IntoResponse.
pub enum HandlerError {
    Cache(CacheError),
    BadRequest { error: &'static str, message: String },
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Cache(err) => err.into_response(),
            HandlerError::BadRequest { error, message } => {
                let status = StatusCode::BAD_REQUEST;
                log_error(status, error, &message);
                (status, Json(ErrorResponse::with_status(error, message, status))).into_response()
            }
        }
    }
}

impl From<CacheError> for HandlerError {
    fn from(err: CacheError) -> Self {
        HandlerError::Cache(err)
    }
}

fn parse_identity(raw: &str) -> Result<ImageIdentity, HandlerError> {
    Ok(ImageIdentity::parse(raw)?)
}

// =============================================================================
// Responses
// =============================================================================

fn image_response(
    data: Bytes,
    content_type: &'static str,
    cache_max_age: u32,
    cache_hit: Option<bool>,
) -> Response {
    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (
            header::CACHE_CONTROL,
            format!("public, max-age={}", cache_max_age),
        ),
    ];
    match cache_hit {
        Some(hit) => (
            StatusCode::OK,
            headers,
            [(HeaderName::from_static(TILE_CACHE_HIT_HEADER), hit.to_string())],
            data,
        )
            .into_response(),
        None => (StatusCode::OK, headers, data).into_response(),
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Open an image and return its identity and metadata.
///
/// # Endpoint
///
/// `POST /images` with body `{"path": "/abs/path/to/image.tif"}`
///
/// # Response
///
/// - `200 OK`: `{"identity", "metadata", "cacheHit"}`
/// - `404 Not Found`: Source missing or unreadable
/// - `422 Unprocessable Entity`: Source cannot be decoded
pub async fn open_image_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
    Json(request): Json<OpenImageRequest>,
) -> Result<Json<LoadedImage>, HandlerError> {
    let image = state.manager.load_image(&request.path).await?;
    Ok(Json(image))
}

/// Report the cache state of an image.
///
/// # Endpoint
///
/// `GET /images/{identity}/state`
pub async fn state_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
    Path(identity): Path<String>,
) -> Result<Json<StateResponse>, HandlerError> {
    let identity = parse_identity(&identity)?;
    let cache_state = state.manager.state(&identity).await?;
    Ok(Json(StateResponse {
        identity,
        state: cache_state,
    }))
}

/// Serve the thumbnail overview.
///
/// # Endpoint
///
/// `GET /images/{identity}/thumbnail`
pub async fn thumbnail_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
    Path(identity): Path<String>,
) -> Result<Response, HandlerError> {
    let identity = parse_identity(&identity)?;
    let data = state.manager.load_thumbnail(&identity).await?;
    Ok(image_response(
        data,
        state.manager.content_type(),
        state.cache_max_age,
        None,
    ))
}

/// Serve the medium overview, synthesizing it on first request.
///
/// # Endpoint
///
/// `GET /images/{identity}/medium`
pub async fn medium_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
    Path(identity): Path<String>,
) -> Result<Response, HandlerError> {
    let identity = parse_identity(&identity)?;
    let data = state.manager.load_medium(&identity).await?;
    Ok(image_response(
        data,
        state.manager.content_type(),
        state.cache_max_age,
        None,
    ))
}

/// Handle tile requests.
///
/// # Endpoint
///
/// `GET /images/{identity}/tiles/{x}/{y}.jpg`
///
/// # Response
///
/// - `200 OK`: Encoded tile, exactly `tileSize × tileSize` pixels
/// - `400 Bad Request`: Malformed identity or coordinates outside the grid
/// - `404 Not Found`: Image not opened, or source gone
/// - `422 Unprocessable Entity`: Source region cannot be decoded
///
/// # Headers
///
/// - `Cache-Control: public, max-age={cache_max_age}`
/// - `X-Tile-Cache-Hit: true|false`
pub async fn tile_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
    Path(params): Path<TilePathParams>,
) -> Result<Response, HandlerError> {
    let identity = parse_identity(&params.identity)?;
    let extension = state.manager.store().extension().to_string();
    let y = params
        .y(&extension)
        .ok_or_else(|| HandlerError::BadRequest {
            error: "invalid_coordinates",
            message: format!("Invalid tile filename: {}", params.filename),
        })?;

    let tile = state.manager.load_tile(&identity, params.x, y).await?;
    Ok(image_response(
        tile.data,
        state.manager.content_type(),
        state.cache_max_age,
        Some(tile.cache_hit),
    ))
}

/// Generate a batch of tiles, sharing one source decode.
///
/// # Endpoint
///
/// `POST /images/{identity}/tiles` with body `{"tiles": [{"x": 0, "y": 0}, ...]}`
///
/// # Response
///
/// `200 OK` with one entry per requested tile, in request order. Each entry
/// carries its own status: a failed tile does not fail the batch. By default
/// an entry reports only the encoded size and the bytes are fetched through
/// the single-tile endpoint, which is then a cache hit. With
/// `"includeData": true` each successful entry also carries the tile as
/// standard base64 in `data`.
pub async fn batch_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
    Path(identity): Path<String>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, HandlerError> {
    let identity = parse_identity(&identity)?;
    if request.tiles.len() > MAX_BATCH_TILES {
        return Err(HandlerError::BadRequest {
            error: "batch_too_large",
            message: format!(
                "Batch of {} tiles exceeds the limit of {}",
                request.tiles.len(),
                MAX_BATCH_TILES
            ),
        });
    }

    let coords: Vec<(u32, u32)> = request.tiles.iter().map(|c| (c.x, c.y)).collect();
    let results = state.manager.load_tiles_batch(&identity, &coords).await?;
    let engine = base64::engine::general_purpose::STANDARD;

    let tiles = request
        .tiles
        .iter()
        .zip(results)
        .map(|(coord, result)| match result {
            Ok(tile) => BatchTileResult {
                x: coord.x,
                y: coord.y,
                status: StatusCode::OK.as_u16(),
                cache_hit: Some(tile.cache_hit),
                bytes: Some(tile.data.len()),
                data: request.include_data.then(|| engine.encode(&tile.data)),
                error: None,
            },
            Err(err) => {
                let (status, error_type) = classify(&err);
                BatchTileResult {
                    x: coord.x,
                    y: coord.y,
                    status: status.as_u16(),
                    cache_hit: None,
                    bytes: None,
                    data: None,
                    error: Some(ErrorResponse::with_status(error_type, err.to_string(), status)),
                }
            }
        })
        .collect();

    Ok(Json(BatchResponse { tiles }))
}

/// Remove everything cached for one image.
///
/// # Endpoint
///
/// `DELETE /images/{identity}`
pub async fn invalidate_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
    Path(identity): Path<String>,
) -> Result<Json<InvalidateResponse>, HandlerError> {
    let identity = parse_identity(&identity)?;
    let removed = state.manager.invalidate(&identity).await?;
    Ok(Json(InvalidateResponse { identity, removed }))
}

/// Remove every cache entry.
///
/// # Endpoint
///
/// `DELETE /cache`
pub async fn clear_cache_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
) -> Result<StatusCode, HandlerError> {
    state.manager.invalidate_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Entry count and total bytes of the cache root.
///
/// # Endpoint
///
/// `GET /cache/stats`
pub async fn stats_handler<C: ImageCodec>(
    State(state): State<AppState<C>>,
) -> Result<Json<CacheStats>, HandlerError> {
    Ok(Json(state.manager.get_stats().await?))
}

// =============================================================================
// Tests
// =============================================================================
