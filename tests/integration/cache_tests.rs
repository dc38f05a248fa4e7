//! Tile cache integration tests.
//!
//! Tests verify:
//! - Repeated tile requests return identical cached bytes without reads
//! - Rewriting a descriptor invalidates every earlier tile
//! - A tile write that lands after a descriptor rewrite is never served
//! - Corrupt descriptors and empty tiles are replaced
//! - The filesystem store survives a service restart
//! - End-to-end generation from a tiled TIFF on disk

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use wsi_tiler::cache::{DescriptorLookup, FsTileStore, MemoryTileStore, ObjectMeta, TileStore};
use wsi_tiler::error::CacheError;
use wsi_tiler::pyramid::{DescriptorRequest, PyramidDescriptor, TileEncoding};
use wsi_tiler::slide::LocalSlideSource;
use wsi_tiler::tile::TileRequest;

use super::test_utils::{
    create_tiled_tiff, decode, default_source, is_valid_png, tile_service, write_tiled_tiff,
};

// =============================================================================
// Reuse and Invalidation
// =============================================================================

#[tokio::test]
async fn test_get_tile_is_idempotent() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let request = TileRequest::new("slide", 10, 2, 1);

    let first = service.get_tile(request.clone()).await.unwrap();
    assert!(!first.cache_hit);
    service.cache().flush().await;
    let reads = service.registry().source().read_count();

    let second = service.get_tile(request).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.data, first.data);
    assert_eq!(second.encoding, TileEncoding::Jpeg);
    assert_eq!(
        service.registry().source().read_count(),
        reads,
        "a cache hit reads no pixels"
    );
}

#[tokio::test]
async fn test_descriptor_rewrite_invalidates_tiles() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());

    let before = service.get_tile(TileRequest::new("slide", 12, 0, 0)).await.unwrap();
    assert_eq!(decode(&before.data).dimensions(), (255, 255));
    service.cache().flush().await;

    let (_, valid) = service
        .cache()
        .check_tile("slide", 12, 0, 0, TileEncoding::Jpeg)
        .await;
    assert!(valid);

    let request = DescriptorRequest::parse(Some(128), None, None).unwrap();
    let document = service.get_dzi("slide", request).await.unwrap();
    assert_eq!(document.descriptor.tile_size, 128);

    let (_, valid) = service
        .cache()
        .check_tile("slide", 12, 0, 0, TileEncoding::Jpeg)
        .await;
    assert!(!valid, "tile older than the descriptor is stale");

    let after = service.get_tile(TileRequest::new("slide", 12, 0, 0)).await.unwrap();
    assert!(!after.cache_hit);
    assert_eq!(decode(&after.data).dimensions(), (129, 129));
}

/// Holds every non-empty tile write until the gate is closed. Descriptor
/// writes pass straight through.
struct GatedStore {
    inner: MemoryTileStore,
    gate: Semaphore,
}

#[async_trait]
impl TileStore for GatedStore {
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, CacheError> {
        self.inner.stat(key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), CacheError> {
        if !key.ends_with(".dzi") && !data.is_empty() {
            // Only fails once closed, which is what releases the write
            let _ = self.gate.acquire().await;
        }
        self.inner.put(key, data).await
    }

    fn location(&self) -> String {
        "gated".to_string()
    }
}

#[tokio::test]
async fn test_tile_landing_after_descriptor_rewrite_is_not_served() {
    let store = Arc::new(GatedStore {
        inner: MemoryTileStore::new(),
        gate: Semaphore::new(0),
    });
    let service = tile_service(default_source(), store.clone());

    // Rendered at 254 pixels; its cache write is held back
    let before = service.get_tile(TileRequest::new("slide", 12, 0, 0)).await.unwrap();
    assert_eq!(decode(&before.data).dimensions(), (255, 255));

    let request = DescriptorRequest::parse(Some(128), None, None).unwrap();
    service.get_dzi("slide", request).await.unwrap();

    store.gate.close();
    service.cache().flush().await;

    let after = service.get_tile(TileRequest::new("slide", 12, 0, 0)).await.unwrap();
    assert!(!after.cache_hit, "tile rendered under the old descriptor was served");
    assert_eq!(decode(&after.data).dimensions(), (129, 129));

    service.cache().flush().await;
    let cached = service.get_tile(TileRequest::new("slide", 12, 0, 0)).await.unwrap();
    assert!(cached.cache_hit);
    assert_eq!(decode(&cached.data).dimensions(), (129, 129));
}

#[tokio::test]
async fn test_matching_dzi_request_keeps_tiles() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());

    service.get_tile(TileRequest::new("slide", 9, 0, 0)).await.unwrap();
    service.cache().flush().await;
    let puts = store.put_count();

    let request = DescriptorRequest::parse(Some(254), Some(1), Some("jpeg")).unwrap();
    service.get_dzi("slide", request).await.unwrap();
    assert_eq!(store.put_count(), puts, "matching descriptor is not rewritten");

    let again = service.get_tile(TileRequest::new("slide", 9, 0, 0)).await.unwrap();
    assert!(again.cache_hit);
}

#[tokio::test]
async fn test_corrupt_descriptor_is_replaced() {
    let store = Arc::new(MemoryTileStore::new());
    store
        .put("slide.dzi", Bytes::from_static(b"<Image TileSize="))
        .await
        .unwrap();
    let service = tile_service(default_source(), store.clone());

    assert!(matches!(
        service.cache().read_descriptor("slide").await,
        DescriptorLookup::Invalid(_)
    ));

    let tile = service.get_tile(TileRequest::new("slide", 12, 1, 1)).await.unwrap();
    assert_eq!(decode(&tile.data).dimensions(), (256, 256));

    match service.cache().read_descriptor("slide").await {
        DescriptorLookup::Found(stored) => {
            assert_eq!(stored.document.descriptor, PyramidDescriptor::default())
        }
        other => panic!("expected a rewritten descriptor, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_tile_is_regenerated() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());

    service.get_dzi("slide", DescriptorRequest::default()).await.unwrap();
    store
        .put("slide/12/0_0.jpeg", Bytes::new())
        .await
        .unwrap();

    let tile = service.get_tile(TileRequest::new("slide", 12, 0, 0)).await.unwrap();
    assert!(!tile.cache_hit);
    assert!(!tile.data.is_empty());

    service.cache().flush().await;
    let stored = store.get("slide/12/0_0.jpeg").await.unwrap();
    assert_eq!(stored, tile.data);
}

#[tokio::test]
async fn test_encodings_cached_separately() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());

    let jpeg = service.get_tile(TileRequest::new("slide", 8, 0, 0)).await.unwrap();
    let png = service
        .get_tile(TileRequest::new("slide", 8, 0, 0).with_encoding(TileEncoding::Png))
        .await
        .unwrap();
    service.cache().flush().await;

    assert_eq!(jpeg.encoding, TileEncoding::Jpeg);
    assert!(is_valid_png(&png.data));
    assert!(store.contains("slide/8/0_0.jpeg"));
    assert!(store.contains("slide/8/0_0.png"));
}

// =============================================================================
// Filesystem Store
// =============================================================================

#[tokio::test]
async fn test_fs_store_survives_restart() {
    let dir = TempDir::new().unwrap();

    let first = {
        let service = tile_service(default_source(), Arc::new(FsTileStore::new(dir.path())));
        let tile = service.get_tile(TileRequest::new("slide", 11, 3, 2)).await.unwrap();
        service.cache().flush().await;
        tile
    };

    assert!(dir.path().join("slide.dzi").is_file());
    assert!(dir.path().join("slide/11/3_2.jpeg").is_file());

    let service = tile_service(default_source(), Arc::new(FsTileStore::new(dir.path())));
    let second = service.get_tile(TileRequest::new("slide", 11, 3, 2)).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.data, first.data);
    assert_eq!(service.registry().source().open_count(), 0);
}

#[tokio::test]
async fn test_tiff_slide_end_to_end() {
    let slides = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    write_tiled_tiff(
        slides.path(),
        "tissue",
        "svs",
        &create_tiled_tiff(64, 48, 32, [200, 40, 40]),
    );

    let source = LocalSlideSource::new(slides.path());
    let service = tile_service(source, Arc::new(FsTileStore::new(cache.path())));

    let document = service.get_dzi("tissue", DescriptorRequest::default()).await.unwrap();
    assert_eq!((document.width, document.height), (64, 48));

    let tile = service
        .get_tile(TileRequest::new("tissue", 6, 0, 0).with_encoding(TileEncoding::Png))
        .await
        .unwrap();
    let img = decode(&tile.data);
    assert_eq!(img.dimensions(), (64, 48));

    let center = img.get_pixel(32, 24).0;
    assert!((center[0] as i32 - 200).abs() <= 12, "{:?}", center);
    assert!((center[1] as i32 - 40).abs() <= 12, "{:?}", center);

    let single = service.get_tile(TileRequest::new("tissue", 0, 0, 0)).await.unwrap();
    assert_eq!(decode(&single.data).dimensions(), (1, 1));

    service.cache().flush().await;
    assert!(cache.path().join("tissue/6/0_0.png").is_file());
}
