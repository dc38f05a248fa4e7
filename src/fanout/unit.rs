use serde::{Deserialize, Serialize};

use crate::pyramid::{DescriptorRequest, PyramidGeometry, TileEncoding};

pub const DEFAULT_TRACT_LEN: u32 = 4;
pub const DEFAULT_PARCEL_LEN: u32 = 8;

/// One dispatched piece of pyramid generation.
///
/// Serialized with a `kind` tag so it can travel over any queue:
///
/// ```json
/// {"kind":"tract","image_id":"slide","level":12,"tract_x":3,"tract_y":0}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnit {
    /// Whole image: one tract row per native level
    Pyramid {
        image_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tile_size: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlap: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<TileEncoding>,
    },
    /// One row of tracts at a native level
    TractRow {
        image_id: String,
        level: usize,
        tract_y: u32,
        num_tracts_x: u32,
    },
    /// A block of native tiles and the levels derived from them
    Tract {
        image_id: String,
        level: usize,
        tract_x: u32,
        tract_y: u32,
    },
    /// A single tile. Never produced by fan-out; it is the entry point for
    /// regenerating one address, dispatched directly by a caller.
    Tile {
        image_id: String,
        level: usize,
        col: u32,
        row: u32,
    },
}

impl WorkUnit {
    pub fn pyramid(image_id: impl Into<String>, request: DescriptorRequest) -> Self {
        WorkUnit::Pyramid {
            image_id: image_id.into(),
            tile_size: request.tile_size,
            overlap: request.overlap,
            format: request.encoding,
        }
    }

    pub fn image_id(&self) -> &str {
        match self {
            WorkUnit::Pyramid { image_id, .. }
            | WorkUnit::TractRow { image_id, .. }
            | WorkUnit::Tract { image_id, .. }
            | WorkUnit::Tile { image_id, .. } => image_id,
        }
    }

    /// Position in the dispatch tree, 0 for the root.
    pub fn depth(&self) -> u8 {
        match self {
            WorkUnit::Pyramid { .. } => 0,
            WorkUnit::TractRow { .. } => 1,
            WorkUnit::Tract { .. } => 2,
            WorkUnit::Tile { .. } => 3,
        }
    }

    /// JSON payload, for logs and HTTP responses.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Partition sizes for pyramid generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Parcels per tract side
    pub tract_len: u32,
    /// Tiles per parcel side
    pub parcel_len: u32,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            tract_len: DEFAULT_TRACT_LEN,
            parcel_len: DEFAULT_PARCEL_LEN,
        }
    }
}

impl FanoutConfig {
    /// Zero lengths are raised to 1.
    pub fn new(tract_len: u32, parcel_len: u32) -> Self {
        Self {
            tract_len: tract_len.max(1),
            parcel_len: parcel_len.max(1),
        }
    }

    /// Tiles per tract side.
    pub fn tract_tiles(&self) -> u32 {
        self.tract_len * self.parcel_len
    }

    /// Tracts across and down at a level.
    pub fn level_tracts(&self, geometry: &PyramidGeometry, level: usize) -> Option<(u32, u32)> {
        let (cols, rows) = geometry.level_tiles(level)?;
        let side = self.tract_tiles();
        Some((cols.div_ceil(side), rows.div_ceil(side)))
    }

    /// Tile addresses of every parcel in a tract, parcels in row-major
    /// order. Parcels and tracts at the grid edge come out short.
    pub fn tract_parcels(
        &self,
        level_tiles: (u32, u32),
        tract_x: u32,
        tract_y: u32,
    ) -> Vec<Vec<(u32, u32)>> {
        let (cols, rows) = level_tiles;
        let parcels_x = cols.div_ceil(self.parcel_len);
        let parcels_y = rows.div_ceil(self.parcel_len);
        let first_px = tract_x.saturating_mul(self.tract_len);
        let first_py = tract_y.saturating_mul(self.tract_len);
        let count_x = self.tract_len.min(parcels_x.saturating_sub(first_px));
        let count_y = self.tract_len.min(parcels_y.saturating_sub(first_py));

        let mut parcels = Vec::with_capacity((count_x * count_y) as usize);
        for py in first_py..first_py + count_y {
            for px in first_px..first_px + count_x {
                let col0 = px * self.parcel_len;
                let row0 = py * self.parcel_len;
                let width = self.parcel_len.min(cols - col0);
                let height = self.parcel_len.min(rows - row0);

                let mut tiles = Vec::with_capacity((width * height) as usize);
                for row in row0..row0 + height {
                    for col in col0..col0 + width {
                        tiles.push((col, row));
                    }
                }
                parcels.push(tiles);
            }
        }
        parcels
    }
}

/// Addresses one level down: even addresses halved.
pub fn parent_addresses(addresses: &[(u32, u32)]) -> Vec<(u32, u32)> {
    addresses
        .iter()
        .filter(|(col, row)| col % 2 == 0 && row % 2 == 0)
        .map(|(col, row)| (col / 2, row / 2))
        .collect()
}
