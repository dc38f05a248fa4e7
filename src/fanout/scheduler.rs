use std::sync::Arc;

use tracing::{debug, info, warn};

use super::dispatch::Dispatcher;
use super::unit::{parent_addresses, FanoutConfig, WorkUnit};
use crate::error::FanoutError;
use crate::pyramid::DescriptorRequest;
use crate::slide::SlideSource;
use crate::tile::{PyramidSnapshot, TileOutcome, TileRequest, TileService};

/// Executes work units against the tile service.
///
/// A `pyramid` unit fans out to one `tract_row` per tract row of every
/// native level, each of which fans out to its `tract`s. A tract generates
/// its native-level tiles parcel by parcel and derives the levels beneath
/// from them, down to the next native level.
pub struct PyramidScheduler<S: SlideSource> {
    tiles: Arc<TileService<S>>,
    dispatcher: Arc<dyn Dispatcher>,
    config: FanoutConfig,
}

/// Tiles touched by one tract.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TractSummary {
    pub generated: usize,
    pub cached: usize,
}

impl<S: SlideSource> PyramidScheduler<S> {
    pub fn new(tiles: Arc<TileService<S>>, dispatcher: Arc<dyn Dispatcher>, config: FanoutConfig) -> Self {
        Self {
            tiles,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> FanoutConfig {
        self.config
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub async fn execute(&self, unit: WorkUnit) -> Result<(), FanoutError> {
        match unit {
            WorkUnit::Pyramid {
                image_id,
                tile_size,
                overlap,
                format,
            } => {
                let request = DescriptorRequest {
                    tile_size,
                    overlap,
                    encoding: format,
                };
                self.start_pyramid(&image_id, request).await
            }
            WorkUnit::TractRow {
                image_id,
                level,
                tract_y,
                num_tracts_x,
            } => {
                for tract_x in 0..num_tracts_x {
                    self.dispatch_logged(WorkUnit::Tract {
                        image_id: image_id.clone(),
                        level,
                        tract_x,
                        tract_y,
                    })
                    .await;
                }
                Ok(())
            }
            WorkUnit::Tract {
                image_id,
                level,
                tract_x,
                tract_y,
            } => {
                self.generate_tract(&image_id, level, tract_x, tract_y)
                    .await
                    .map(|_| ())
            }
            WorkUnit::Tile {
                image_id,
                level,
                col,
                row,
            } => {
                self.tiles
                    .ensure_tile(&TileRequest::new(image_id, level, col, row))
                    .await?;
                Ok(())
            }
        }
    }

    async fn start_pyramid(&self, image_id: &str, request: DescriptorRequest) -> Result<(), FanoutError> {
        self.tiles.get_dzi(image_id, request).await?;
        let geometry = self.tiles.snapshot(image_id).await?.geometry;
        let native_levels = geometry.native_levels();

        info!(
            image_id,
            levels = geometry.level_count(),
            native_levels = ?native_levels,
            total_tiles = geometry.total_tiles(),
            "Starting pyramid generation"
        );

        for level in native_levels {
            let Some((num_tracts_x, num_tracts_y)) = self.config.level_tracts(&geometry, level) else {
                continue;
            };
            for tract_y in 0..num_tracts_y {
                self.dispatch_logged(WorkUnit::TractRow {
                    image_id: image_id.to_string(),
                    level,
                    tract_y,
                    num_tracts_x,
                })
                .await;
            }
        }
        Ok(())
    }

    /// Generate a tract's native tiles and the non-native levels derived from
    /// them. Stops at the first tile failure.
    ///
    /// The descriptor is resolved once: every tile of the tract is generated
    /// under the same geometry, even if the descriptor is rewritten midway.
    pub async fn generate_tract(
        &self,
        image_id: &str,
        level: usize,
        tract_x: u32,
        tract_y: u32,
    ) -> Result<TractSummary, FanoutError> {
        let snapshot = self.tiles.snapshot(image_id).await?;
        let level_tiles = snapshot.geometry.level_tiles(level).unwrap_or((0, 0));
        let mut summary = TractSummary::default();

        for parcel in self.config.tract_parcels(level_tiles, tract_x, tract_y) {
            self.generate_parcel(&snapshot, level, parcel, &mut summary)
                .await?;
        }

        debug!(
            image_id,
            level,
            tract_x,
            tract_y,
            generated = summary.generated,
            cached = summary.cached,
            "Tract complete"
        );
        Ok(summary)
    }

    async fn generate_parcel(
        &self,
        snapshot: &PyramidSnapshot,
        level: usize,
        mut addresses: Vec<(u32, u32)>,
        summary: &mut TractSummary,
    ) -> Result<(), FanoutError> {
        let image_id = snapshot.image_id.as_str();
        let encoding = snapshot.encoding();
        let mut level = level;
        loop {
            for &(col, row) in &addresses {
                match self
                    .tiles
                    .ensure_tile_in(snapshot, level, col, row, encoding)
                    .await
                {
                    Ok(TileOutcome::Generated) => summary.generated += 1,
                    Ok(TileOutcome::Cached) => summary.cached += 1,
                    Err(e) => {
                        warn!(image_id, level, col, row, error = %e, "Tile generation failed");
                        return Err(e.into());
                    }
                }
            }

            if level == 0 || snapshot.geometry.is_native_level(level - 1) {
                return Ok(());
            }
            addresses = parent_addresses(&addresses);
            level -= 1;
        }
    }

    async fn dispatch_logged(&self, unit: WorkUnit) {
        if let Err(e) = self.dispatcher.dispatch(unit.clone()).await {
            warn!(unit = %unit.to_json(), error = %e, "Failed to dispatch work unit");
        }
    }
}
