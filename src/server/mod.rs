//! HTTP server layer for Pyramid Cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │        GET /images/{identity}/tiles/{x}/{y}.jpg                 │
//! │                                                                 │
//! │  ┌──────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │        handlers          │  │           routes            │  │
//! │  │ (requests, error → HTTP) │  │ (router, CORS, tracing)     │  │
//! │  └──────────────────────────┘  └─────────────────────────────┘  │
//! └────────────────────────────────┬────────────────────────────────┘
//!                                  ▼
//!                            CacheManager
//! ```

pub mod handlers;
pub mod routes;

pub use handlers::{
    batch_handler, clear_cache_handler, health_handler, invalidate_handler, medium_handler,
    open_image_handler, state_handler, stats_handler, thumbnail_handler, tile_handler, AppState,
    BatchRequest, BatchResponse, BatchTileResult, ErrorResponse, HandlerError, HealthResponse,
    InvalidateResponse, OpenImageRequest, StateResponse, TileCoord, TilePathParams,
    MAX_BATCH_TILES, TILE_CACHE_HIT_HEADER,
};
pub use routes::{create_router, create_shared_router, RouterConfig};
