//! Router configuration for Pyramid Cache.
//!
//! # Route Structure
//!
//! ```text
//! /health                                   - Health check
//! /images                                   - Open an image (POST)
//! /images/{identity}                        - Invalidate (DELETE)
//! /images/{identity}/state                  - Cache state
//! /images/{identity}/thumbnail              - Thumbnail overview
//! /images/{identity}/medium                 - Medium overview
//! /images/{identity}/tiles                  - Batch generation (POST): per-tile status and size, base64 bytes with includeData
//! /images/{identity}/tiles/{x}/{y}.jpg      - One tile
//! /cache                                    - Invalidate everything (DELETE)
//! /cache/stats                              - Disk statistics
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pyramid_cache::{CacheConfig, CacheManager};
//! use pyramid_cache::server::{create_router, RouterConfig};
//!
//! let manager = CacheManager::with_default_codec(CacheConfig::new("/var/cache/pyramids"))?;
//! let config = RouterConfig::new()
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//!
//! let router = create_router(manager, config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use http::header::CONTENT_TYPE;
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    batch_handler, clear_cache_handler, health_handler, invalidate_handler, medium_handler,
    open_image_handler, state_handler, stats_handler, thumbnail_handler, tile_handler, AppState,
};
use crate::codec::ImageCodec;
use crate::config::DEFAULT_CACHE_MAX_AGE;
use crate::manager::CacheManager;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl RouterConfig {
    /// Create a router configuration.
    ///
    /// By default:
    /// - CORS allows any origin
    /// - Cache max-age is 1 hour (3600 seconds)
    /// - Tracing is enabled
    pub fn new() -> Self {
        Self {
            cors_origins: None,
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            enable_tracing: true,
        }
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Allow any CORS origin.
    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    /// Set the Cache-Control max-age in seconds.
    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router around a cache manager.
pub fn create_router<C: ImageCodec>(manager: CacheManager<C>, config: RouterConfig) -> Router {
    create_shared_router(Arc::new(manager), config)
}

/// Create the router around a manager that is also used elsewhere.
pub fn create_shared_router<C: ImageCodec>(
    manager: Arc<CacheManager<C>>,
    config: RouterConfig,
) -> Router {
    let app_state = AppState::with_cache_max_age(manager, config.cache_max_age);
    let cors = build_cors_layer(&config);

    // {filename} captures both "{y}" and "{y}.jpg"
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/images", post(open_image_handler::<C>))
        .route("/images/{identity}", delete(invalidate_handler::<C>))
        .route("/images/{identity}/state", get(state_handler::<C>))
        .route("/images/{identity}/thumbnail", get(thumbnail_handler::<C>))
        .route("/images/{identity}/medium", get(medium_handler::<C>))
        .route("/images/{identity}/tiles", post(batch_handler::<C>))
        .route(
            "/images/{identity}/tiles/{x}/{filename}",
            get(tile_handler::<C>),
        )
        .route("/cache", delete(clear_cache_handler::<C>))
        .route("/cache/stats", get(stats_handler::<C>))
        .with_state(app_state)
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(86400)); // 24 hours

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
