//! Deep Zoom pyramid geometry.
//!
//! A Deep Zoom pyramid is a synthetic power-of-two pyramid laid over the
//! slide's native levels. Level `level_count - 1` is full resolution and
//! each level below halves both dimensions (rounding up) until 1x1.
//!
//! This module is the only place that relates synthetic addresses to
//! native pixels:
//!
//! - [`PyramidGeometry::best_native_level_for_downsample`] picks the native
//!   level a synthetic level is read from
//! - [`PyramidGeometry::tile_region`] gives the tile size including overlap
//! - [`PyramidGeometry::region_parameters`] maps that tile to a native read
//!
//! All functions are pure.

use crate::error::AddressError;
use crate::slide::SlideImage;

/// Native level dimensions and rounded downsamples of a slide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLevels {
    dimensions: Vec<(u32, u32)>,
    downsamples: Vec<u32>,
}

impl NativeLevels {
    /// Build from explicit values.
    ///
    /// Returns `None` if the lists are empty or of different lengths.
    pub fn new(dimensions: Vec<(u32, u32)>, downsamples: Vec<u32>) -> Option<Self> {
        if dimensions.is_empty() || dimensions.len() != downsamples.len() {
            return None;
        }
        let downsamples = downsamples.into_iter().map(|d| d.max(1)).collect();
        Some(Self {
            dimensions,
            downsamples,
        })
    }

    /// Collect the native levels of a slide.
    pub fn from_slide<S: SlideImage + ?Sized>(slide: &S) -> Option<Self> {
        let count = slide.level_count();
        let mut dimensions = Vec::with_capacity(count);
        let mut downsamples = Vec::with_capacity(count);
        for level in 0..count {
            dimensions.push(slide.level_dimensions(level)?);
            downsamples.push(slide.native_downsample(level)?);
        }
        Self::new(dimensions, downsamples)
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.dimensions.get(level).copied()
    }

    /// Rounded downsample of a native level.
    pub fn downsample(&self, level: usize) -> Option<u32> {
        self.downsamples.get(level).copied()
    }

    pub fn downsamples(&self) -> &[u32] {
        &self.downsamples
    }
}

/// Overlap applied on each edge of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeOverlap {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Pixel size of a tile at its synthetic level, overlap included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    pub width: u32,
    pub height: u32,
    pub overlap: EdgeOverlap,
}

impl TileRegion {
    /// Width without overlap.
    pub fn core_width(&self) -> u32 {
        self.width - self.overlap.left - self.overlap.right
    }

    /// Height without overlap.
    pub fn core_height(&self) -> u32 {
        self.height - self.overlap.top - self.overlap.bottom
    }
}

/// Arguments for a native region read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionParameters {
    /// Top-left corner in level-0 pixels
    pub x0: u64,
    pub y0: u64,
    /// Native level to read from
    pub native_level: usize,
    /// Size in pixels of the native level
    pub width: u32,
    pub height: u32,
}

/// Synthetic pyramid over a slide's native levels.
#[derive(Debug, Clone)]
pub struct PyramidGeometry {
    native: NativeLevels,
    tile_size: u32,
    overlap: u32,
    level_dimensions: Vec<(u32, u32)>,
    level_tiles: Vec<(u32, u32)>,
}

impl PyramidGeometry {
    /// Derive the synthetic levels. `tile_size` must be at least 1.
    pub fn new(native: NativeLevels, tile_size: u32, overlap: u32) -> Self {
        let tile_size = tile_size.max(1);
        let (width, height) = native.dimensions[0];
        let (mut w, mut h) = (width.max(1), height.max(1));

        let mut level_dimensions = vec![(w, h)];
        while w > 1 || h > 1 {
            w = w.div_ceil(2).max(1);
            h = h.div_ceil(2).max(1);
            level_dimensions.push((w, h));
        }
        level_dimensions.reverse();

        let level_tiles = level_dimensions
            .iter()
            .map(|&(w, h)| (w.div_ceil(tile_size), h.div_ceil(tile_size)))
            .collect();

        Self {
            native,
            tile_size,
            overlap,
            level_dimensions,
            level_tiles,
        }
    }

    /// Geometry for a slide, or `None` if the slide reports no levels.
    pub fn for_slide<S: SlideImage + ?Sized>(
        slide: &S,
        tile_size: u32,
        overlap: u32,
    ) -> Option<Self> {
        NativeLevels::from_slide(slide).map(|native| Self::new(native, tile_size, overlap))
    }

    pub fn native(&self) -> &NativeLevels {
        &self.native
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    /// Number of synthetic levels, `ceil(log2(max(w, h))) + 1`.
    pub fn level_count(&self) -> usize {
        self.level_dimensions.len()
    }

    pub fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.level_dimensions.get(level).copied()
    }

    /// Tiles across and down at a level.
    pub fn level_tiles(&self, level: usize) -> Option<(u32, u32)> {
        self.level_tiles.get(level).copied()
    }

    /// Total downsample of a synthetic level relative to full resolution.
    pub fn level_downsample(&self, level: usize) -> Option<u64> {
        let count = self.level_count();
        if level >= count {
            return None;
        }
        1u64.checked_shl((count - 1 - level) as u32)
    }

    pub fn total_tiles(&self) -> u64 {
        self.level_tiles
            .iter()
            .map(|&(c, r)| c as u64 * r as u64)
            .sum()
    }

    /// Native level to read for a total downsample.
    ///
    /// Walks native levels from finest to coarsest and stops at the first
    /// whose rounded downsample exceeds the rounded request; the level
    /// before it is used. Requests beyond every native level use the
    /// coarsest one.
    pub fn best_native_level_for_downsample(&self, downsample: f64) -> usize {
        let target = downsample.max(0.0).round() as u64;
        for (level, &native) in self.native.downsamples.iter().enumerate() {
            if target < native as u64 {
                return level.saturating_sub(1);
            }
        }
        self.native.len() - 1
    }

    /// Native level a synthetic level is read from.
    pub fn native_level_for(&self, level: usize) -> Option<usize> {
        self.level_downsample(level)
            .map(|ds| self.best_native_level_for_downsample(ds as f64))
    }

    /// Whether a synthetic level's downsample is exactly a native downsample.
    pub fn is_native_level(&self, level: usize) -> bool {
        self.level_downsample(level).is_some_and(|ds| {
            self.native
                .downsamples
                .iter()
                .any(|&native| native as u64 == ds)
        })
    }

    /// Synthetic levels that coincide with native levels, ascending.
    pub fn native_levels(&self) -> Vec<usize> {
        (0..self.level_count())
            .filter(|&level| self.is_native_level(level))
            .collect()
    }

    fn check_address(&self, level: usize, col: u32, row: u32) -> Result<(u32, u32), AddressError> {
        let (cols, rows) = self.level_tiles(level).ok_or(AddressError::InvalidLevel {
            level,
            level_count: self.level_count(),
        })?;
        if col >= cols || row >= rows {
            return Err(AddressError::OutOfBounds {
                level,
                col,
                row,
                cols,
                rows,
            });
        }
        Ok((cols, rows))
    }

    /// Size of a tile, with overlap on interior edges only.
    pub fn tile_region(&self, level: usize, col: u32, row: u32) -> Result<TileRegion, AddressError> {
        let (cols, rows) = self.check_address(level, col, row)?;
        let (width, height) = self.level_dimensions[level];

        let overlap = EdgeOverlap {
            left: if col != 0 { self.overlap } else { 0 },
            top: if row != 0 { self.overlap } else { 0 },
            right: if col != cols - 1 { self.overlap } else { 0 },
            bottom: if row != rows - 1 { self.overlap } else { 0 },
        };

        let core_w = self.tile_size.min(width - self.tile_size * col);
        let core_h = self.tile_size.min(height - self.tile_size * row);

        Ok(TileRegion {
            width: core_w + overlap.left + overlap.right,
            height: core_h + overlap.top + overlap.bottom,
            overlap,
        })
    }

    /// Native read that covers a tile.
    ///
    /// The origin is computed in level-0 pixels from the synthetic offset,
    /// then scaled into the chosen native level. The read size is clamped to
    /// the native level bounds, so edge reads may come back smaller than the
    /// scaled tile and need resizing.
    pub fn region_parameters(
        &self,
        level: usize,
        col: u32,
        row: u32,
        region: &TileRegion,
    ) -> Result<RegionParameters, AddressError> {
        self.check_address(level, col, row)?;
        let total = self.level_downsample(level).ok_or(AddressError::InvalidLevel {
            level,
            level_count: self.level_count(),
        })?;

        let native_level = self.best_native_level_for_downsample(total as f64);
        let native_ds = self.native.downsamples[native_level] as u64;
        let (native_w, native_h) = self.native.dimensions[native_level];

        let zx = (self.tile_size as u64 * col as u64).saturating_sub(region.overlap.left as u64);
        let zy = (self.tile_size as u64 * row as u64).saturating_sub(region.overlap.top as u64);
        let x0 = zx * total;
        let y0 = zy * total;
        let xl = x0 / native_ds;
        let yl = y0 / native_ds;

        let scaled_w = (region.width as u64 * total).div_ceil(native_ds);
        let scaled_h = (region.height as u64 * total).div_ceil(native_ds);
        let width = scaled_w.min((native_w as u64).saturating_sub(xl)).max(1) as u32;
        let height = scaled_h.min((native_h as u64).saturating_sub(yl)).max(1) as u32;

        Ok(RegionParameters {
            x0,
            y0,
            native_level,
            width,
            height,
        })
    }
}
