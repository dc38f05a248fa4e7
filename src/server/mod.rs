//! HTTP server layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │   /dzi/...   /iiif/...   POST /pyramids/{image_id}   /health    │
//! │                                                                 │
//! │  ┌──────────────────────────┐  ┌──────────────────────────────┐ │
//! │  │        handlers          │  │           routes             │ │
//! │  │ (requests, error mapping)│  │ (router config, CORS, trace) │ │
//! │  └──────────────────────────┘  └──────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                                 │
//!            ▼                                 ▼
//!       TileService                        Dispatcher
//! ```

pub mod handlers;
pub mod routes;

pub use handlers::{
    dzi_handler, dzi_tile_handler, generate_handler, health_handler, iiif_info_handler,
    iiif_label_handler, iiif_properties_handler, iiif_region_handler, iiif_thumbnail_handler,
    AppState, DziTilePathParams, ErrorResponse, HandlerError,
    HealthResponse, IiifPathParams, PyramidQueryParams, CACHE_HIT_HEADER,
};
pub use routes::{create_router, RouterConfig};
