//! Source image accessor.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  Tile service / fan-out      │
//! └──────────────┬───────────────┘
//!                ▼
//! ┌──────────────────────────────┐
//! │  SlideRegistry               │  one handle per image id, singleflight opens
//! └──────────────┬───────────────┘
//!                ▼
//! ┌──────────────────────────────┐
//! │  SlideImage trait            │  levels, read_region, properties,
//! │                              │  associated images
//! └──────────────┬───────────────┘
//!                ▼
//! ┌──────────────────────────────┐
//! │  TiffSlide                   │  tiled JPEG TIFF / SVS over a RangeReader
//! └──────────────────────────────┘
//! ```

mod jpeg;
mod properties;
mod reader;
mod registry;
mod tiff;
mod tiff_slide;

pub use properties::{description_properties, level_properties};
pub use reader::{LevelInfo, SlideImage, DEFAULT_BACKGROUND};
pub use registry::{
    is_valid_image_id, LocalSlideSource, SlideRegistry, SlideSource, DEFAULT_IMAGE_EXTENSION,
};
pub use tiff_slide::{AssociatedImage, TiffSlide, DEFAULT_TILE_CACHE_CAPACITY};
