//! Deep Zoom pyramid model.
//!
//! - [`geometry`]: synthetic levels and the mapping of a tile address to a
//!   native region read
//! - [`descriptor`]: tile parameters and their DZI document
//! - [`iiif`]: IIIF `info.json` and region request parsing

pub mod descriptor;
pub mod geometry;
pub mod iiif;

pub use descriptor::{
    DescriptorRequest, DziDocument, PyramidDescriptor, TileEncoding, DEFAULT_ENCODING,
    DEFAULT_OVERLAP, DEFAULT_TILE_SIZE,
};
pub use geometry::{EdgeOverlap, NativeLevels, PyramidGeometry, RegionParameters, TileRegion};
pub use iiif::{
    IiifInfo, IiifRequest, IiifRegion, IiifSize, PixelRect, MAX_OUTPUT_DIMENSION, MAX_READ_PIXELS,
};
