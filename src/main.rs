//! wsi-tiler: Deep Zoom and IIIF tiles for whole-slide images.
//!
//! `serve` runs the HTTP server with a pyramid-generation worker pool;
//! `generate` builds one image's whole pyramid and exits.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsi_tiler::{
    cache::{create_s3_client, FsTileStore, S3TileStore, TileCache, TileStore},
    config::{CacheBackend, Cli, Command, GenerateConfig, ServeConfig, StorageConfig},
    fanout::{work_queue, Dispatcher, FanoutConfig, LocalDispatcher, PyramidScheduler, WorkUnit, WorkerPool},
    server::{create_router, RouterConfig},
    slide::{LocalSlideSource, SlideRegistry},
    tile::{TileEncoder, TileService},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(config) => run_serve(config).await,
        Command::Generate(config) => run_generate(config).await,
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    log_storage(&config.storage);
    let tile_service = build_tile_service(&config.storage).await;

    let (dispatcher, receiver) = work_queue();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);
    let scheduler = Arc::new(PyramidScheduler::new(
        tile_service.clone(),
        dispatcher.clone(),
        FanoutConfig::default(),
    ));
    let pool = WorkerPool::spawn(receiver, config.workers, scheduler);

    let mut router_config = RouterConfig::new()
        .with_cache_max_age(config.cache_max_age)
        .with_tracing(!config.no_tracing);
    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }
    let router = create_router(tile_service.clone(), Some(dispatcher), router_config);

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Server listening on: http://{}", addr);
    info!("  curl http://{}/health", addr);
    info!("  curl http://{}/dzi/<image_id>.dzi", addr);
    info!("  curl http://{}/iiif/<image_id>/info.json", addr);
    info!("  curl http://{}/iiif/<image_id>/properties.json", addr);

    let served = axum::serve(listener, router).await;

    pool.shutdown();
    tile_service.cache().flush().await;

    if let Err(e) = served {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

// =============================================================================
// Generate Command
// =============================================================================

async fn run_generate(config: GenerateConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let request = match config.descriptor_request() {
        Ok(request) => request,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    log_storage(&config.storage);
    let tile_service = build_tile_service(&config.storage).await;

    let (local, receiver) = work_queue();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(local.clone());
    let fanout = FanoutConfig::new(config.tract_len, config.parcel_len);
    let scheduler = Arc::new(PyramidScheduler::new(
        tile_service.clone(),
        dispatcher.clone(),
        fanout,
    ));
    let pool = WorkerPool::spawn(receiver, config.workers, scheduler);

    info!(
        image_id = %config.image_id,
        workers = config.workers,
        tract_len = fanout.tract_len,
        parcel_len = fanout.parcel_len,
        "Generating pyramid"
    );

    let unit = WorkUnit::pyramid(config.image_id.as_str(), request);
    if let Err(e) = dispatcher.dispatch(unit).await {
        error!("Failed to dispatch pyramid: {}", e);
        pool.shutdown();
        return ExitCode::FAILURE;
    }

    wait_for_generation(&local).await;
    let failed_units = pool.failed_units();
    pool.shutdown();

    let cache = tile_service.cache();
    cache.flush().await;

    if failed_units > 0 {
        error!(
            image_id = %config.image_id,
            failed_units,
            "Pyramid generation failed"
        );
        return ExitCode::FAILURE;
    }

    let failed = cache.writer().failed_writes();
    let dropped = cache.writer().dropped_writes();
    let superseded = cache.writer().superseded_writes();
    if failed > 0 || dropped > 0 {
        warn!(failed, dropped, "Some tiles were not written to the cache");
        return ExitCode::FAILURE;
    }
    if superseded > 0 {
        warn!(superseded, "Descriptor changed during generation; some tiles were discarded");
    }

    info!(image_id = %config.image_id, "Pyramid complete");
    ExitCode::SUCCESS
}

async fn wait_for_generation(dispatcher: &LocalDispatcher) {
    let mut progress = tokio::time::interval(std::time::Duration::from_secs(10));
    progress.tick().await;

    loop {
        tokio::select! {
            _ = dispatcher.wait_idle() => return,
            _ = progress.tick() => info!(pending = dispatcher.pending(), "Work units outstanding"),
        }
    }
}

// =============================================================================
// Shared setup
// =============================================================================

/// Build the slide registry, tile store and tile service.
async fn build_tile_service(storage: &StorageConfig) -> Arc<TileService<LocalSlideSource>> {
    let source = LocalSlideSource::new(&storage.images_path)
        .with_extension(storage.image_extension.clone())
        .with_tile_cache_capacity(storage.slide_tile_cache);
    let registry = Arc::new(SlideRegistry::new(source));

    let store = build_store(storage).await;
    let cache = TileCache::new(store, storage.write_queue, storage.write_concurrency);

    Arc::new(TileService::new(
        registry,
        cache,
        TileEncoder::new(storage.jpeg_quality),
    ))
}

async fn build_store(storage: &StorageConfig) -> Arc<dyn TileStore> {
    match storage.cache_backend() {
        CacheBackend::Filesystem(root) => Arc::new(FsTileStore::new(root)),
        CacheBackend::S3 { bucket, prefix } => {
            let client =
                create_s3_client(storage.s3_endpoint.as_deref(), &storage.s3_region).await;
            Arc::new(S3TileStore::new(client, bucket, prefix.as_deref()))
        }
    }
}

fn log_storage(storage: &StorageConfig) {
    info!("Configuration:");
    info!(
        "  Images: {} (*.{})",
        storage.images_path.display(),
        storage.image_extension
    );
    match storage.cache_backend() {
        CacheBackend::Filesystem(root) => info!("  Tile cache: {}", root.display()),
        CacheBackend::S3 { bucket, prefix } => {
            info!(
                "  Tile cache: s3://{}/{}",
                bucket,
                prefix.as_deref().unwrap_or("")
            );
            if let Some(ref endpoint) = storage.s3_endpoint {
                info!("  S3 endpoint: {}", endpoint);
            }
            info!("  S3 region: {}", storage.s3_region);
        }
    }
    info!(
        "  JPEG quality: {}, write queue: {}, write concurrency: {}",
        storage.jpeg_quality, storage.write_queue, storage.write_concurrency
    );
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "wsi_tiler=debug,tower_http=debug"
    } else {
        "wsi_tiler=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
