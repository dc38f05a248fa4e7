//! `SlideImage` trait: the source image accessor.
//!
//! A slide exposes its native resolution levels and a region-read primitive.
//! Everything above this layer (pyramid geometry, tile generation, fan-out)
//! reasons in terms of this trait only, so tests can substitute a synthetic
//! slide for a real file.

use std::collections::BTreeMap;

use async_trait::async_trait;
use image::{Rgb, RgbaImage};

use super::properties::level_properties;
use crate::error::SlideError;

/// Default background colour for slides that do not declare one.
pub const DEFAULT_BACKGROUND: Rgb<u8> = Rgb([0xff, 0xff, 0xff]);

/// Information about a single native level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelInfo {
    /// Width of this level in pixels
    pub width: u32,

    /// Height of this level in pixels
    pub height: u32,

    /// Downsample factor relative to level 0, as measured from the
    /// level dimensions (not necessarily an integer)
    pub downsample: f64,
}

/// Read-only access to a pyramidal source image.
///
/// Level 0 is full resolution; downsample factors increase with the level
/// index.
#[async_trait]
pub trait SlideImage: Send + Sync {
    /// Number of native levels.
    fn level_count(&self) -> usize;

    /// Metadata for a native level, or `None` if out of range.
    fn level_info(&self, level: usize) -> Option<LevelInfo>;

    /// Colour that transparent regions are composited onto.
    fn background(&self) -> Rgb<u8> {
        DEFAULT_BACKGROUND
    }

    /// Read a region of a native level as RGBA pixels.
    ///
    /// `x0`/`y0` are in level-0 coordinates; `width`/`height` are in pixels
    /// of `level`. Pixels outside the level bounds are fully transparent.
    async fn read_region(
        &self,
        x0: u64,
        y0: u64,
        level: usize,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, SlideError>;

    /// Slide properties as flat key/value pairs.
    fn properties(&self) -> BTreeMap<String, String> {
        level_properties(self)
    }

    /// Names of the images stored beside the pyramid, such as `thumbnail`
    /// or `label`.
    fn associated_image_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Decode an associated image; `None` if the slide has none by that name.
    async fn read_associated_image(&self, _name: &str) -> Result<Option<RgbaImage>, SlideError> {
        Ok(None)
    }

    /// Dimensions of level 0.
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.level_dimensions(0)
    }

    fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.level_info(level).map(|info| (info.width, info.height))
    }

    fn level_downsample(&self, level: usize) -> Option<f64> {
        self.level_info(level).map(|info| info.downsample)
    }

    /// Downsample of a native level rounded to the nearest integer.
    ///
    /// Every caller that compares downsamples goes through this so the
    /// level selection and the region math agree on rounding.
    fn native_downsample(&self, level: usize) -> Option<u32> {
        self.level_downsample(level)
            .map(|ds| (ds.round() as u32).max(1))
    }
}
