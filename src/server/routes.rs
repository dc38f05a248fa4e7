//! Router configuration.
//!
//! # Route Structure
//!
//! ```text
//! /health                                                  - Health check
//! /dzi/{image_id}.dzi                                      - Deep Zoom descriptor
//! /dzi/{image_id}_files/{level}/{col}_{row}.{ext}          - Deep Zoom tile
//! /iiif/{image_id}/info.json                               - IIIF info
//! /iiif/{image_id}/properties.json                         - Slide properties
//! /iiif/{image_id}/thumbnail.jpeg                          - Associated thumbnail
//! /iiif/{image_id}/label.jpeg                              - Associated label
//! /iiif/{image_id}/{region}/{size}/{rotation}/{quality}.{format}
//! /pyramids/{image_id}                                     - POST: generate pyramid
//! ```
//!
//! # Example
//!
//! ```ignore
//! let config = RouterConfig::new()
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//! let router = create_router(tile_service, Some(dispatcher), config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use http::header::CONTENT_TYPE;
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    dzi_handler, dzi_tile_handler, generate_handler, health_handler, iiif_info_handler,
    iiif_label_handler, iiif_properties_handler, iiif_region_handler, iiif_thumbnail_handler,
    AppState,
};
use crate::fanout::Dispatcher;
use crate::slide::SlideSource;
use crate::tile::TileService;

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

    /// Prefix for IIIF `@id` values
    pub iiif_base_url: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    /// Any CORS origin, 1 hour max-age, tracing on.
    pub fn new() -> Self {
        Self {
            cors_origins: None,
            cache_max_age: 3600,
            enable_tracing: true,
            iiif_base_url: None,
        }
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    pub fn with_iiif_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.iiif_base_url = Some(base_url.into());
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router.
///
/// Without a dispatcher, `POST /pyramids/{image_id}` answers 503.
pub fn create_router<S>(
    tile_service: Arc<TileService<S>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    config: RouterConfig,
) -> Router
where
    S: SlideSource + 'static,
{
    let mut state = AppState::new(tile_service).with_cache_max_age(config.cache_max_age);
    if let Some(dispatcher) = dispatcher {
        state = state.with_dispatcher(dispatcher);
    }
    if let Some(base) = &config.iiif_base_url {
        state = state.with_iiif_base_url(base.clone());
    }

    // Path segments carry suffixes (".dzi", "_files", ".jpeg"), so the
    // handlers split them
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/dzi/{name}", get(dzi_handler::<S>))
        .route(
            "/dzi/{name}/{level}/{filename}",
            get(dzi_tile_handler::<S>),
        )
        .route("/iiif/{image_id}/info.json", get(iiif_info_handler::<S>))
        .route(
            "/iiif/{image_id}/properties.json",
            get(iiif_properties_handler::<S>),
        )
        .route(
            "/iiif/{image_id}/thumbnail.jpeg",
            get(iiif_thumbnail_handler::<S>),
        )
        .route("/iiif/{image_id}/label.jpeg", get(iiif_label_handler::<S>))
        .route(
            "/iiif/{image_id}/{region}/{size}/{rotation}/{quality}",
            get(iiif_region_handler::<S>),
        )
        .route("/pyramids/{image_id}", post(generate_handler::<S>))
        .with_state(state)
        .layer(build_cors_layer(&config));

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed)
        }
    }
}
