//! HTTP request handlers for the tile API.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /dzi/{image_id}.dzi` - Deep Zoom descriptor
//! - `GET /dzi/{image_id}_files/{level}/{col}_{row}.{ext}` - Deep Zoom tile
//! - `GET /iiif/{image_id}/info.json` - IIIF image information
//! - `GET /iiif/{image_id}/properties.json` - Slide properties
//! - `GET /iiif/{image_id}/thumbnail.jpeg` - Associated thumbnail image
//! - `GET /iiif/{image_id}/label.jpeg` - Associated label image
//! - `GET /iiif/{image_id}/{region}/{size}/{rotation}/{quality}.{format}` - IIIF region
//! - `POST /pyramids/{image_id}` - Start generating a whole pyramid

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, TileError};
use crate::fanout::{Dispatcher, WorkUnit};
use crate::pyramid::{DescriptorRequest, IiifRequest, TileEncoding};
use crate::slide::SlideSource;
use crate::tile::{TileRequest, TileService};

/// Response header telling whether a tile came from the cache.
pub const CACHE_HIT_HEADER: &str = "x-tile-cache-hit";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state, passed to handlers via Axum's State extractor.
pub struct AppState<S: SlideSource> {
    pub tile_service: Arc<TileService<S>>,

    /// Where `POST /pyramids` sends work; generation is disabled when unset
    pub dispatcher: Option<Arc<dyn Dispatcher>>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,

    /// Prefix for IIIF `@id` values; derived from the Host header when unset
    pub iiif_base_url: Option<String>,
}

impl<S: SlideSource> AppState<S> {
    pub fn new(tile_service: Arc<TileService<S>>) -> Self {
        Self {
            tile_service,
            dispatcher: None,
            cache_max_age: 3600,
            iiif_base_url: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    pub fn with_iiif_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.iiif_base_url = Some(base_url.into());
        self
    }

    fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_max_age)
    }
}

impl<S: SlideSource> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            tile_service: Arc::clone(&self.tile_service),
            dispatcher: self.dispatcher.clone(),
            cache_max_age: self.cache_max_age,
            iiif_base_url: self.iiif_base_url.clone(),
        }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Path parameters for Deep Zoom tiles.
///
/// Extracted from: `/dzi/{name}/{level}/{filename}` where name is
/// `{image_id}_files` and filename is `{col}_{row}.{ext}`
#[derive(Debug, Deserialize)]
pub struct DziTilePathParams {
    pub name: String,

    /// Deep Zoom level (0 = 1x1 pixel)
    pub level: usize,

    pub filename: String,
}

impl DziTilePathParams {
    pub fn image_id(&self) -> Option<&str> {
        self.name.strip_suffix("_files").filter(|id| !id.is_empty())
    }

    /// Split `{col}_{row}.{ext}` into its parts.
    pub fn address(&self) -> Option<(u32, u32, &str)> {
        let (stem, ext) = self.filename.rsplit_once('.')?;
        let (col, row) = stem.split_once('_')?;
        Some((col.parse().ok()?, row.parse().ok()?, ext))
    }
}

/// Path parameters for IIIF region requests.
#[derive(Debug, Deserialize)]
pub struct IiifPathParams {
    pub image_id: String,
    pub region: String,
    pub size: String,
    pub rotation: String,
    /// `{quality}.{format}`
    pub quality: String,
}

/// Optional pyramid parameters, used by the descriptor and generation endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct PyramidQueryParams {
    #[serde(default)]
    pub tile_size: Option<u32>,

    #[serde(default)]
    pub overlap: Option<u32>,

    /// `jpeg` or `png`
    #[serde(default)]
    pub format: Option<String>,
}

impl PyramidQueryParams {
    fn descriptor_request(&self) -> Result<DescriptorRequest, TileError> {
        DescriptorRequest::parse(self.tile_size, self.overlap, self.format.as_deref())
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "bad_address")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
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

// =============================================================================
// Error Mapping
// =============================================================================

/// Build the JSON error response, logging by severity:
/// 5xx at ERROR, 404 at DEBUG, other 4xx at WARN.
fn error_response(status: StatusCode, error_type: &str, message: String) -> Response {
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

    let body = ErrorResponse::with_status(error_type, message, status);
    (status, Json(body)).into_response()
}

impl IntoResponse for TileError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            TileError::InvalidImageId(_) => (StatusCode::BAD_REQUEST, "invalid_image_id"),
            TileError::BadAddress { .. } => (StatusCode::BAD_REQUEST, "bad_address"),
            TileError::InvalidDescriptor { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_descriptor")
            }
            TileError::InvalidRegion { .. } => (StatusCode::BAD_REQUEST, "invalid_region"),
            TileError::UnsupportedEncoding { .. } => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_encoding")
            }
            TileError::SourceOpen { source, .. } if source.is_not_found() => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            TileError::SourceOpen { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "source_open"),
            TileError::SourceRead { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "source_read"),
            TileError::AssociatedImageNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            TileError::Encode { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "encode_error"),
            TileError::Cache { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "cache_error"),
        };

        error_response(status, error_type, self.to_string())
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "dispatch_failed",
            self.to_string(),
        )
    }
}

/// Errors a handler can return.
#[derive(Debug)]
pub enum HandlerError {
    Tile(TileError),
    Dispatch(DispatchError),
    /// Path that does not name a resource
    NotFound(String),
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Tile(e) => e.into_response(),
            HandlerError::Dispatch(e) => e.into_response(),
            HandlerError::NotFound(path) => error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("No such resource: {}", path),
            ),
        }
    }
}

impl From<TileError> for HandlerError {
    fn from(err: TileError) -> Self {
        HandlerError::Tile(err)
    }
}

impl From<DispatchError> for HandlerError {
    fn from(err: DispatchError) -> Self {
        HandlerError::Dispatch(err)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// `GET /health`
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /dzi/{image_id}.dzi?tile_size=&overlap=&format=`
///
/// Query parameters that differ from the stored descriptor rewrite it,
/// which invalidates every tile cached before.
pub async fn dzi_handler<S: SlideSource>(
    State(state): State<AppState<S>>,
    Path(name): Path<String>,
    Query(params): Query<PyramidQueryParams>,
) -> Result<Response, HandlerError> {
    let image_id = name
        .strip_suffix(".dzi")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| HandlerError::NotFound(format!("/dzi/{}", name)))?;
    let request = params.descriptor_request()?;

    let document = state.tile_service.get_dzi(image_id, request).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/xml")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(document.to_xml()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// `GET /dzi/{image_id}_files/{level}/{col}_{row}.{ext}`
///
/// The extension picks the encoding; `jpg` is accepted for `jpeg`.
pub async fn dzi_tile_handler<S: SlideSource>(
    State(state): State<AppState<S>>,
    Path(params): Path<DziTilePathParams>,
) -> Result<Response, HandlerError> {
    let not_found = || {
        HandlerError::NotFound(format!(
            "/dzi/{}/{}/{}",
            params.name, params.level, params.filename
        ))
    };
    let image_id = params.image_id().ok_or_else(not_found)?;
    let (col, row, ext) = params.address().ok_or_else(not_found)?;
    let encoding = encoding_from_extension(ext)?;

    let request = TileRequest::new(image_id, params.level, col, row).with_encoding(encoding);
    let tile = state.tile_service.get_tile(request).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, tile.encoding.content_type())
        .header(header::CACHE_CONTROL, state.cache_control())
        .header(CACHE_HIT_HEADER, if tile.cache_hit { "true" } else { "false" })
        .body(Body::from(tile.data))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// `GET /iiif/{image_id}/info.json`
pub async fn iiif_info_handler<S: SlideSource>(
    State(state): State<AppState<S>>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, HandlerError> {
    let base_url = match &state.iiif_base_url {
        Some(base) => base.clone(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{}/iiif", host)
        }
    };

    let info = state.tile_service.iiif_info(&image_id, &base_url).await?;

    Ok(([(header::CACHE_CONTROL, state.cache_control())], Json(info)).into_response())
}

/// `GET /iiif/{image_id}/{region}/{size}/{rotation}/{quality}.{format}`
pub async fn iiif_region_handler<S: SlideSource>(
    State(state): State<AppState<S>>,
    Path(params): Path<IiifPathParams>,
) -> Result<Response, HandlerError> {
    let request = IiifRequest::parse(
        &params.region,
        &params.size,
        &params.rotation,
        &params.quality,
    )?;

    let region = state
        .tile_service
        .iiif_region(&params.image_id, &request)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, region.encoding.content_type())
        .header(header::CACHE_CONTROL, state.cache_control())
        .body(Body::from(region.data))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// `GET /iiif/{image_id}/properties.json`
pub async fn iiif_properties_handler<S: SlideSource>(
    State(state): State<AppState<S>>,
    Path(image_id): Path<String>,
) -> Result<Response, HandlerError> {
    let properties: BTreeMap<String, String> = state.tile_service.properties(&image_id).await?;

    Ok(([(header::CACHE_CONTROL, state.cache_control())], Json(properties)).into_response())
}

/// `GET /iiif/{image_id}/thumbnail.jpeg`
pub async fn iiif_thumbnail_handler<S: SlideSource>(
    State(state): State<AppState<S>>,
    Path(image_id): Path<String>,
) -> Result<Response, HandlerError> {
    associated_image_response(&state, &image_id, "thumbnail").await
}

/// `GET /iiif/{image_id}/label.jpeg`
pub async fn iiif_label_handler<S: SlideSource>(
    State(state): State<AppState<S>>,
    Path(image_id): Path<String>,
) -> Result<Response, HandlerError> {
    associated_image_response(&state, &image_id, "label").await
}

async fn associated_image_response<S: SlideSource>(
    state: &AppState<S>,
    image_id: &str,
    name: &str,
) -> Result<Response, HandlerError> {
    let image = state.tile_service.associated_image(image_id, name).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, image.encoding.content_type())
        .header(header::CACHE_CONTROL, state.cache_control())
        .header(CACHE_HIT_HEADER, if image.cache_hit { "true" } else { "false" })
        .body(Body::from(image.data))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// `POST /pyramids/{image_id}?tile_size=&overlap=&format=`
///
/// Dispatches a `pyramid` work unit and returns it without waiting.
pub async fn generate_handler<S: SlideSource>(
    State(state): State<AppState<S>>,
    Path(image_id): Path<String>,
    Query(params): Query<PyramidQueryParams>,
) -> Result<Response, HandlerError> {
    let request = params.descriptor_request()?;
    // Reject bad ids and parameters before anything is queued
    if !crate::slide::is_valid_image_id(&image_id) {
        return Err(TileError::InvalidImageId(image_id).into());
    }
    request.resolve()?;

    let dispatcher = state.dispatcher.as_ref().ok_or(DispatchError::Closed)?;
    let unit = WorkUnit::pyramid(image_id.as_str(), request);
    dispatcher.dispatch(unit.clone()).await?;

    info!(image_id = %image_id, unit = %unit.to_json(), "Pyramid generation queued");
    Ok((StatusCode::ACCEPTED, Json(unit)).into_response())
}

fn encoding_from_extension(ext: &str) -> Result<TileEncoding, TileError> {
    if ext.eq_ignore_ascii_case("jpg") {
        return Ok(TileEncoding::Jpeg);
    }
    ext.parse()
}
