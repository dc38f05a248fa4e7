//! API integration tests.
//!
//! Tests verify:
//! - Descriptor, tile and IIIF endpoints over synthetic slides
//! - Error mapping (bad address, unknown slide, corrupt slide, bad encoding)
//! - Response headers (content type, cache control, cache hit)
//! - Slide properties and associated images
//! - IIIF reads capped at a bounded native read
//! - Pyramid generation requests

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use tempfile::TempDir;

use wsi_tiler::cache::MemoryTileStore;
use wsi_tiler::pyramid::IiifInfo;
use wsi_tiler::server::ErrorResponse;
use wsi_tiler::slide::LocalSlideSource;

use super::test_utils::{
    app, create_tiled_tiff_with_strips, decode, default_source, is_uniform, is_valid_jpeg,
    is_valid_png, level_shade, tile_service, write_tiled_tiff, StripImage, SyntheticSource,
};

async fn get(router: &Router, uri: &str) -> Response<Body> {
    router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response<Body>) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn error_body(response: Response<Body>) -> ErrorResponse {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn header<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let response = get(&router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

// =============================================================================
// Descriptors
// =============================================================================

#[tokio::test]
async fn test_dzi_defaults() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());
    let (router, _pool) = app(service);

    let response = get(&router, "/dzi/slide.dzi").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "application/xml");

    let xml = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(xml.contains(r#"TileSize="254""#), "{}", xml);
    assert!(xml.contains(r#"Overlap="1""#), "{}", xml);
    assert!(xml.contains(r#"Format="jpeg""#), "{}", xml);
    assert!(xml.contains(r#"Width="4096""#), "{}", xml);
    assert!(xml.contains(r#"Height="3072""#), "{}", xml);
    assert!(store.contains("slide.dzi"));
}

#[tokio::test]
async fn test_dzi_with_parameters() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let response = get(&router, "/dzi/slide.dzi?tile_size=512&overlap=0&format=png").await;
    assert_eq!(response.status(), StatusCode::OK);
    let xml = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(xml.contains(r#"TileSize="512""#));
    assert!(xml.contains(r#"Overlap="0""#));
    assert!(xml.contains(r#"Format="png""#));

    // Parameters persist for requests that do not name them
    let response = get(&router, "/dzi/slide.dzi").await;
    let xml = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(xml.contains(r#"TileSize="512""#));
}

#[tokio::test]
async fn test_dzi_errors() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let missing = get(&router, "/dzi/nope.dzi").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_body(missing).await.error, "not_found");

    let format = get(&router, "/dzi/slide.dzi?format=gif").await;
    assert_eq!(format.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let tile_size = get(&router, "/dzi/slide.dzi?tile_size=0").await;
    assert_eq!(tile_size.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_body(tile_size).await.error, "invalid_descriptor");

    let bad_id = get(&router, "/dzi/bad$id.dzi").await;
    assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);

    let no_suffix = get(&router, "/dzi/slide").await;
    assert_eq!(no_suffix.status(), StatusCode::NOT_FOUND);

    let corrupt = get(&router, "/dzi/corrupt.dzi").await;
    assert_eq!(corrupt.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = error_body(corrupt).await;
    assert_eq!(body.status, Some(500));
    assert!(body.message.contains("corrupt"));
}

// =============================================================================
// Tiles
// =============================================================================

#[tokio::test]
async fn test_tile_headers_and_size() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let response = get(&router, "/dzi/slide_files/12/0_0.jpeg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "image/jpeg");
    assert_eq!(header(&response, "cache-control"), "public, max-age=600");
    assert_eq!(header(&response, "x-tile-cache-hit"), "false");

    let body = body_bytes(response).await;
    assert!(is_valid_jpeg(&body));
    assert_eq!(decode(&body).dimensions(), (255, 255));
}

#[tokio::test]
async fn test_tile_edge_sizes() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    // 17x13 tiles at full resolution; the last column and row are short
    let corner = body_bytes(get(&router, "/dzi/slide_files/12/16_12.jpg").await).await;
    assert_eq!(decode(&corner).dimensions(), (33, 25));

    let interior = body_bytes(get(&router, "/dzi/slide_files/12/5_5.jpg").await).await;
    assert_eq!(decode(&interior).dimensions(), (256, 256));

    let single = body_bytes(get(&router, "/dzi/slide_files/0/0_0.png").await).await;
    assert!(is_valid_png(&single));
    assert_eq!(decode(&single).dimensions(), (1, 1));
}

#[tokio::test]
async fn test_tiles_read_from_expected_native_level() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    // Deep Zoom level 12 is full resolution, 10 is downsample 4, 7 is 32
    for (level, native) in [(12, 0), (11, 0), (10, 1), (9, 1), (8, 2), (7, 2)] {
        let uri = format!("/dzi/slide_files/{}/0_0.png", level);
        let tile = decode(&body_bytes(get(&router, &uri).await).await);
        assert!(
            is_uniform(&tile, level_shade(native), 1),
            "level {} should read native level {}",
            level,
            native
        );
    }
}

#[tokio::test]
async fn test_tile_cache_hit_returns_same_bytes() {
    let store = Arc::new(MemoryTileStore::new());
    let service = tile_service(default_source(), store.clone());
    let (router, _pool) = app(service.clone());

    let first = get(&router, "/dzi/slide_files/11/1_2.jpeg").await;
    assert_eq!(header(&first, "x-tile-cache-hit"), "false");
    let first = body_bytes(first).await;

    service.cache().flush().await;
    assert!(store.contains("slide/11/1_2.jpeg"));

    let second = get(&router, "/dzi/slide_files/11/1_2.jpeg").await;
    assert_eq!(header(&second, "x-tile-cache-hit"), "true");
    assert_eq!(body_bytes(second).await, first);
}

#[tokio::test]
async fn test_tile_errors() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let cases = [
        ("/dzi/slide_files/12/17_0.jpeg", StatusCode::BAD_REQUEST),
        ("/dzi/slide_files/13/0_0.jpeg", StatusCode::BAD_REQUEST),
        ("/dzi/slide_files/12/0_0.gif", StatusCode::UNSUPPORTED_MEDIA_TYPE),
        ("/dzi/slide_files/12/0-0.jpeg", StatusCode::NOT_FOUND),
        ("/dzi/slide/12/0_0.jpeg", StatusCode::NOT_FOUND),
        ("/dzi/nope_files/0/0_0.jpeg", StatusCode::NOT_FOUND),
        ("/dzi/corrupt_files/0/0_0.jpeg", StatusCode::INTERNAL_SERVER_ERROR),
    ];

    for (uri, status) in cases {
        assert_eq!(get(&router, uri).await.status(), status, "{}", uri);
    }

    let out_of_bounds = error_body(get(&router, "/dzi/slide_files/12/17_0.jpeg").await).await;
    assert_eq!(out_of_bounds.error, "bad_address");
}

// =============================================================================
// IIIF
// =============================================================================

#[tokio::test]
async fn test_iiif_info() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let response = get(&router, "/iiif/slide/info.json").await;
    assert_eq!(response.status(), StatusCode::OK);

    let info: IiifInfo = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(info.id, "http://tiles.test/iiif/slide");
    assert_eq!(info.context, "http://iiif.io/api/image/2/context.json");
    assert_eq!((info.width, info.height), (4096, 3072));
    assert_eq!(info.tiles[0].width, 254);
    assert_eq!(info.tiles[0].scale_factors, vec![1, 4, 16]);
}

#[tokio::test]
async fn test_iiif_region() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let thumbnail = get(&router, "/iiif/slide/full/256,/0/default.png").await;
    assert_eq!(thumbnail.status(), StatusCode::OK);
    assert_eq!(header(&thumbnail, "content-type"), "image/png");
    let img = decode(&body_bytes(thumbnail).await);
    assert_eq!(img.dimensions(), (256, 192));
    assert!(is_uniform(&img, level_shade(2), 1));

    let crop = get(&router, "/iiif/slide/100,200,300,400/full/0/color.jpg").await;
    assert_eq!(crop.status(), StatusCode::OK);
    let body = body_bytes(crop).await;
    assert!(is_valid_jpeg(&body));
    assert_eq!(decode(&body).dimensions(), (300, 400));

    // Clipped at the right edge
    let clipped = get(&router, "/iiif/slide/4000,0,500,100/full/0/default.png").await;
    assert_eq!(decode(&body_bytes(clipped).await).dimensions(), (96, 100));
}

#[tokio::test]
async fn test_iiif_region_errors() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let cases = [
        ("/iiif/slide/full/full/90/default.jpg", StatusCode::BAD_REQUEST),
        ("/iiif/slide/full/full/0/gray.jpg", StatusCode::BAD_REQUEST),
        ("/iiif/slide/full/full/0/default.webp", StatusCode::UNSUPPORTED_MEDIA_TYPE),
        ("/iiif/slide/5000,0,10,10/full/0/default.jpg", StatusCode::BAD_REQUEST),
        ("/iiif/slide/0,0,10,10/20,/0/default.jpg", StatusCode::BAD_REQUEST),
        ("/iiif/nope/full/64,/0/default.jpg", StatusCode::NOT_FOUND),
    ];

    for (uri, status) in cases {
        assert_eq!(get(&router, uri).await.status(), status, "{}", uri);
    }
}

#[tokio::test]
async fn test_iiif_region_read_is_bounded() {
    let source = SyntheticSource::new()
        .with_slide("huge", &[(100_000, 80_000, 1.0), (98, 79, 1024.0)])
        .with_slide("flat", &[(100_000, 80_000, 1.0)]);
    let service = tile_service(source, Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service.clone());

    // Native level 0 would be 8 Gpx; the 1024x level is read instead
    let response = get(&router, "/iiif/huge/full/2000,/0/default.png").await;
    assert_eq!(response.status(), StatusCode::OK);
    let img = decode(&body_bytes(response).await);
    assert_eq!(img.dimensions(), (2000, 1600));
    assert!(is_uniform(&img, level_shade(1), 1));

    let response = get(&router, "/iiif/flat/full/1000,/0/default.jpg").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_body(response).await.error, "invalid_region");
    assert_eq!(service.registry().source().read_count(), 1);
}

// =============================================================================
// Properties and Associated Images
// =============================================================================

#[tokio::test]
async fn test_properties() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let response = get(&router, "/iiif/slide/properties.json").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "application/json");

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["openslide.level-count"], "3");
    assert_eq!(json["openslide.level[0].width"], "4096");
    assert_eq!(json["openslide.level[2].downsample"], "16");

    let missing = get(&router, "/iiif/nope/properties.json").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_associated_images_absent() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    for uri in ["/iiif/slide/thumbnail.jpeg", "/iiif/slide/label.jpeg"] {
        let response = get(&router, uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        assert_eq!(error_body(response).await.error, "not_found");
    }
}

#[tokio::test]
async fn test_associated_images_from_tiff() {
    let slides = TempDir::new().unwrap();
    let tiff = create_tiled_tiff_with_strips(
        64,
        48,
        32,
        [200, 40, 40],
        &[
            StripImage {
                width: 32,
                height: 24,
                color: [40, 200, 40],
                description: "",
            },
            StripImage {
                width: 40,
                height: 16,
                color: [40, 40, 200],
                description: "label 40x16",
            },
        ],
    );
    write_tiled_tiff(slides.path(), "tissue", "svs", &tiff);

    let service = tile_service(
        LocalSlideSource::new(slides.path()),
        Arc::new(MemoryTileStore::new()),
    );
    let (router, _pool) = app(service.clone());

    let response = get(&router, "/iiif/tissue/thumbnail.jpeg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "image/jpeg");
    assert_eq!(header(&response, "x-tile-cache-hit"), "false");
    let body = body_bytes(response).await;
    assert!(is_valid_jpeg(&body));
    let thumbnail = decode(&body);
    assert_eq!(thumbnail.dimensions(), (32, 24));
    let center = thumbnail.get_pixel(16, 12).0;
    assert!((center[1] as i32 - 200).abs() <= 12, "{:?}", center);

    let response = get(&router, "/iiif/tissue/label.jpeg").await;
    assert_eq!(response.status(), StatusCode::OK);
    let label = decode(&body_bytes(response).await);
    assert_eq!(label.dimensions(), (40, 16));
    let center = label.get_pixel(20, 8).0;
    assert!((center[2] as i32 - 200).abs() <= 12, "{:?}", center);

    service.cache().flush().await;
    let again = get(&router, "/iiif/tissue/thumbnail.jpeg").await;
    assert_eq!(header(&again, "x-tile-cache-hit"), "true");
    assert_eq!(body_bytes(again).await, body);

    // The pyramid itself is unaffected by the extra directories
    let info = get(&router, "/iiif/tissue/info.json").await;
    let info: IiifInfo = serde_json::from_slice(&body_bytes(info).await).unwrap();
    assert_eq!((info.width, info.height), (64, 48));
    assert_eq!(info.tiles[0].scale_factors, vec![1]);
}

// =============================================================================
// Pyramid Generation
// =============================================================================

#[tokio::test]
async fn test_generate_accepted() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/pyramids/small?tile_size=7&format=png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let unit: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(unit["kind"], "pyramid");
    assert_eq!(unit["image_id"], "small");
    assert_eq!(unit["tile_size"], 7);
    assert_eq!(unit["format"], "png");
    assert!(unit.get("overlap").is_none());
}

#[tokio::test]
async fn test_generate_rejects_bad_requests() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let (router, _pool) = app(service);

    for (uri, status) in [
        ("/pyramids/small?format=tiff", StatusCode::UNSUPPORTED_MEDIA_TYPE),
        ("/pyramids/small?tile_size=4&overlap=5", StatusCode::BAD_REQUEST),
        ("/pyramids/bad$id", StatusCode::BAD_REQUEST),
    ] {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), status, "{}", uri);
    }
}

#[tokio::test]
async fn test_generate_without_dispatcher() {
    let service = tile_service(default_source(), Arc::new(MemoryTileStore::new()));
    let router = wsi_tiler::server::create_router(
        service,
        None,
        wsi_tiler::server::RouterConfig::new().with_tracing(false),
    );

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/pyramids/small")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
