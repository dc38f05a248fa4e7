//! Tile generation.
//!
//! The tile service sits between the HTTP layer (and the fan-out scheduler)
//! and the slide abstraction:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     HTTP Handlers / PyramidScheduler    │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              Tile Service               │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │  TileEncoder    │  │
//! │  │  (persisted, │  │  (composite →   │  │
//! │  │   watermark) │  │   resize → enc) │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │            SlideRegistry                │
//! └─────────────────────────────────────────┘
//! ```

mod encoder;
mod service;

pub use encoder::{
    is_valid_quality, TileEncoder, DEFAULT_JPEG_QUALITY, MAX_JPEG_QUALITY, MIN_JPEG_QUALITY,
};
pub use service::{
    PyramidSnapshot, RegionResponse, TileOutcome, TileRequest, TileResponse, TileService,
};
