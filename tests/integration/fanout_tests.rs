//! Pyramid fan-out integration tests.
//!
//! Tests verify:
//! - A pyramid run leaves a valid cached tile at every address of every level
//! - Partial tracts and parcels at the grid edge are covered
//! - Re-running a finished pyramid generates nothing
//! - Tract execution reports generated and cached tiles
//! - A cached tract costs one descriptor lookup plus one stat per tile
//! - Failed work units are counted

use std::sync::Arc;

use wsi_tiler::cache::MemoryTileStore;
use wsi_tiler::fanout::{work_queue, Dispatcher, FanoutConfig, PyramidScheduler, WorkUnit};
use wsi_tiler::pyramid::{DescriptorRequest, PyramidGeometry, TileEncoding};
use wsi_tiler::slide::SlideSource;
use wsi_tiler::tile::TileService;

use super::test_utils::{default_source, run_pyramid, tile_service, SyntheticSource};

fn small_request() -> DescriptorRequest {
    DescriptorRequest::parse(Some(7), Some(1), None).unwrap()
}

/// Addresses at any level without a valid cached tile.
async fn missing_tiles<S: SlideSource>(
    service: &TileService<S>,
    image_id: &str,
    geometry: &PyramidGeometry,
    encoding: TileEncoding,
) -> Vec<(usize, u32, u32)> {
    let mut missing = Vec::new();
    for level in 0..geometry.level_count() {
        let (cols, rows) = geometry.level_tiles(level).unwrap();
        for row in 0..rows {
            for col in 0..cols {
                let (_, valid) = service
                    .cache()
                    .check_tile(image_id, level, col, row, encoding)
                    .await;
                if !valid {
                    missing.push((level, col, row));
                }
            }
        }
    }
    missing
}

#[tokio::test]
async fn test_fanout_geometry() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    service.get_dzi("small", small_request()).await.unwrap();

    let geometry = service.geometry("small").await.unwrap();
    assert_eq!(geometry.level_count(), 7);
    assert_eq!(geometry.native_levels(), vec![0, 3, 6]);
    assert_eq!(geometry.level_tiles(6), Some((10, 7)));
    assert_eq!(geometry.level_tiles(3), Some((2, 1)));
    assert_eq!(geometry.level_tiles(0), Some((1, 1)));
}

#[tokio::test]
async fn test_pyramid_covers_every_tile() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());

    let failed = run_pyramid(
        service.clone(),
        "small",
        small_request(),
        FanoutConfig::default(),
        4,
    )
    .await;
    assert_eq!(failed, 0);

    let geometry = service.geometry("small").await.unwrap();
    let missing = missing_tiles(&service, "small", &geometry, TileEncoding::Jpeg).await;
    assert!(missing.is_empty(), "missing tiles: {:?}", missing);

    // Descriptor plus one object per tile, nothing else
    assert_eq!(store.len() as u64, geometry.total_tiles() + 1);
    assert_eq!(service.cache().writer().dropped_writes(), 0);
}

#[tokio::test]
async fn test_pyramid_partial_tracts_and_parcels() {
    // 4-tile parcels and 2-parcel tracts split the 10x7 level into a full
    // tract, a short column and short rows
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());

    run_pyramid(
        service.clone(),
        "small",
        small_request(),
        FanoutConfig::new(2, 4),
        3,
    )
    .await;

    let geometry = service.geometry("small").await.unwrap();
    let missing = missing_tiles(&service, "small", &geometry, TileEncoding::Jpeg).await;
    assert!(missing.is_empty(), "missing tiles: {:?}", missing);
}

#[tokio::test]
async fn test_pyramid_single_tile_parcels() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let request = DescriptorRequest::parse(Some(7), Some(0), Some("png")).unwrap();

    run_pyramid(service.clone(), "small", request, FanoutConfig::new(1, 1), 2).await;

    let geometry = service.geometry("small").await.unwrap();
    assert_eq!(geometry.overlap(), 0);
    let missing = missing_tiles(&service, "small", &geometry, TileEncoding::Png).await;
    assert!(missing.is_empty(), "missing tiles: {:?}", missing);
}

#[tokio::test]
async fn test_rerun_generates_nothing() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());

    run_pyramid(service.clone(), "small", small_request(), FanoutConfig::default(), 2).await;
    let puts = store.put_count();

    run_pyramid(service.clone(), "small", small_request(), FanoutConfig::default(), 2).await;
    assert_eq!(store.put_count(), puts);
}

#[tokio::test]
async fn test_changed_parameters_regenerate() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());

    run_pyramid(service.clone(), "small", small_request(), FanoutConfig::default(), 2).await;

    let bigger = DescriptorRequest::parse(Some(16), Some(1), None).unwrap();
    run_pyramid(service.clone(), "small", bigger, FanoutConfig::default(), 2).await;

    let geometry = service.geometry("small").await.unwrap();
    assert_eq!(geometry.tile_size(), 16);
    assert_eq!(geometry.level_tiles(6), Some((4, 3)));
    let missing = missing_tiles(&service, "small", &geometry, TileEncoding::Jpeg).await;
    assert!(missing.is_empty(), "missing tiles: {:?}", missing);
}

#[tokio::test]
async fn test_generate_tract_summary() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    service.get_dzi("small", small_request()).await.unwrap();

    let (dispatcher, _receiver) = work_queue();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);
    let scheduler = PyramidScheduler::new(service.clone(), dispatcher, FanoutConfig::new(2, 4));

    // Tract (0, 0) at level 6 covers 8x7 tiles, then 4x4 at level 5 and
    // 2x2 at level 4
    let summary = scheduler.generate_tract("small", 6, 0, 0).await.unwrap();
    assert_eq!(summary.generated, 8 * 7 + 4 * 4 + 2 * 2);
    assert_eq!(summary.cached, 0);

    service.cache().flush().await;
    let again = scheduler.generate_tract("small", 6, 0, 0).await.unwrap();
    assert_eq!(again.generated, 0);
    assert_eq!(again.cached, summary.generated);
}

#[tokio::test]
async fn test_cached_tract_store_lookups() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());
    service.get_dzi("small", small_request()).await.unwrap();

    let (dispatcher, _receiver) = work_queue();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);
    let scheduler = PyramidScheduler::new(service.clone(), dispatcher, FanoutConfig::new(2, 4));

    let summary = scheduler.generate_tract("small", 6, 0, 0).await.unwrap();
    service.cache().flush().await;

    let (stats, gets) = (store.stat_count(), store.get_count());
    let again = scheduler.generate_tract("small", 6, 0, 0).await.unwrap();
    assert_eq!(again.cached, summary.generated);

    // Descriptor stat and read once, then one stat per tile
    assert_eq!(store.stat_count() - stats, again.cached as u64 + 1);
    assert_eq!(store.get_count() - gets, 1);
}

#[tokio::test]
async fn test_single_tile_unit() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());
    service.get_dzi("small", small_request()).await.unwrap();

    let (dispatcher, _receiver) = work_queue();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);
    let scheduler = PyramidScheduler::new(service.clone(), dispatcher, FanoutConfig::default());

    scheduler
        .execute(WorkUnit::Tile {
            image_id: "small".to_string(),
            level: 6,
            col: 1,
            row: 2,
        })
        .await
        .unwrap();
    service.cache().flush().await;

    assert!(store.contains("small.dzi"));
    assert!(store.contains("small/6/1_2.jpeg"));
    assert_eq!(store.len(), 2);

    let out_of_range = WorkUnit::Tile {
        image_id: "small".to_string(),
        level: 6,
        col: 40,
        row: 0,
    };
    assert!(scheduler.execute(out_of_range).await.is_err());
}

#[tokio::test]
async fn test_missing_image_generates_nothing() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(SyntheticSource::new(), store.clone());

    let failed = run_pyramid(service, "absent", small_request(), FanoutConfig::default(), 1).await;
    assert_eq!(failed, 1, "the pyramid unit itself fails");
    assert!(store.is_empty());
}
