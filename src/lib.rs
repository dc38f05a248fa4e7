//! # WSI Tiler
//!
//! Deep Zoom and IIIF tile pyramids for whole-slide images, with a
//! persistent tile cache and proactive pyramid generation.
//!
//! A whole-slide image carries a handful of native resolution levels. Deep
//! Zoom viewers expect a full power-of-two pyramid down to a single pixel.
//! Every synthetic level is rendered from the closest native level, so any
//! tile can be produced on demand; cached tiles are reused until the
//! image's descriptor is rewritten.
//!
//! ## Architecture
//!
//! - [`io`] - Byte-range readers over local files
//! - [`slide`] - Tiled TIFF/SVS accessor and slide registry
//! - [`pyramid`] - Deep Zoom geometry, descriptors and IIIF parsing
//! - [`cache`] - Tile stores (filesystem, S3, memory) and the watermark cache
//! - [`tile`] - Tile service: descriptors, tiles and IIIF regions
//! - [`fanout`] - Tract/parcel work units, dispatcher and worker pool
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wsi_tiler::{
//!     create_router, FsTileStore, LocalSlideSource, RouterConfig, SlideRegistry, TileCache,
//!     TileEncoder, TileService,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(SlideRegistry::new(LocalSlideSource::new("/data/slides")));
//!     let cache = TileCache::new(Arc::new(FsTileStore::new("./tiles")), 1024, 8);
//!     let tiles = Arc::new(TileService::new(registry, cache, TileEncoder::new(70)));
//!
//!     let router = create_router(tiles, None, RouterConfig::new());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fanout;
pub mod io;
pub mod pyramid;
pub mod server;
pub mod slide;
pub mod tasks;
pub mod tile;

// Re-export commonly used types
pub use cache::{
    create_s3_client, FsTileStore, MemoryTileStore, S3TileStore, TileCache, TileKey, TileStore,
};
pub use config::{Cli, Command, GenerateConfig, ServeConfig, StorageConfig};
pub use error::{
    AddressError, CacheError, DispatchError, FanoutError, IoError, SlideError, TiffError,
    TileError,
};
pub use fanout::{
    work_queue, Dispatcher, FanoutConfig, LocalDispatcher, PyramidScheduler, WorkUnit, WorkerPool,
};
pub use pyramid::{DescriptorRequest, DziDocument, PyramidDescriptor, PyramidGeometry, TileEncoding};
pub use server::{create_router, AppState, ErrorResponse, HealthResponse, RouterConfig};
pub use slide::{LocalSlideSource, SlideImage, SlideRegistry, SlideSource};
pub use tile::{TileEncoder, TileOutcome, TileRequest, TileResponse, TileService};
