//! Configuration management for WSI Tiler.
//!
//! Every option can be given on the command line or through an environment
//! variable with the `TILER_` prefix. Storage options are shared by both
//! subcommands.
//!
//! # Environment Variables
//!
//! - `TILER_IMAGES_PATH` - Directory holding source slides (required)
//! - `TILER_IMAGE_EXTENSION` - Source file extension (default: svs)
//! - `TILER_CACHE_DIR` - Tile cache directory (default: ./tiles)
//! - `TILER_CACHE_BUCKET` - Tile cache S3 bucket, instead of a directory
//! - `TILER_CACHE_PREFIX` - Key prefix inside the cache bucket
//! - `TILER_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `TILER_S3_REGION` - AWS region (default: us-east-1)
//! - `TILER_JPEG_QUALITY` - JPEG quality (default: 70)
//! - `TILER_HOST` / `TILER_PORT` - Server bind address (default: 0.0.0.0:3000)
//! - `TILER_CACHE_MAX_AGE` - HTTP cache max-age seconds (default: 3600)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::cache::{DEFAULT_WRITE_CONCURRENCY, DEFAULT_WRITE_QUEUE};
use crate::fanout::{DEFAULT_PARCEL_LEN, DEFAULT_TRACT_LEN};
use crate::pyramid::{DescriptorRequest, TileEncoding};
use crate::slide::{DEFAULT_IMAGE_EXTENSION, DEFAULT_TILE_CACHE_CAPACITY};
use crate::tile::{is_valid_quality, DEFAULT_JPEG_QUALITY};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default tile cache directory.
pub const DEFAULT_CACHE_DIR: &str = "./tiles";

/// Default HTTP cache max-age in seconds (1 hour).
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

/// Default number of fan-out workers.
pub const DEFAULT_WORKERS: usize = 4;

// =============================================================================
// CLI Arguments
// =============================================================================

/// WSI Tiler - Deep Zoom and IIIF tiles from whole slide images.
#[derive(Parser, Debug, Clone)]
#[command(name = "wsi-tiler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve descriptors, tiles and IIIF regions over HTTP.
    Serve(ServeConfig),

    /// Generate and cache every tile of one image, then exit.
    Generate(GenerateConfig),
}

/// Where slides are read from and tiles are cached.
#[derive(Args, Debug, Clone)]
pub struct StorageConfig {
    /// Directory containing `{image_id}.{extension}` source slides.
    #[arg(long, env = "TILER_IMAGES_PATH")]
    pub images_path: PathBuf,

    /// File extension of source slides.
    #[arg(long, default_value = DEFAULT_IMAGE_EXTENSION, env = "TILER_IMAGE_EXTENSION")]
    pub image_extension: String,

    /// Local tile cache directory.
    #[arg(long, env = "TILER_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// S3 bucket for the tile cache. Mutually exclusive with --cache-dir.
    #[arg(long, env = "TILER_CACHE_BUCKET")]
    pub cache_bucket: Option<String>,

    /// Key prefix inside the cache bucket.
    #[arg(long, env = "TILER_CACHE_PREFIX")]
    pub cache_prefix: Option<String>,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "TILER_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "TILER_S3_REGION")]
    pub s3_region: String,

    /// JPEG quality for tile encoding (1-100).
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "TILER_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Cache writes that may wait in the queue before new ones are dropped.
    #[arg(long, default_value_t = DEFAULT_WRITE_QUEUE, env = "TILER_WRITE_QUEUE")]
    pub write_queue: usize,

    /// Concurrent cache writes.
    #[arg(long, default_value_t = DEFAULT_WRITE_CONCURRENCY, env = "TILER_WRITE_CONCURRENCY")]
    pub write_concurrency: usize,

    /// Decoded native tiles kept in memory per open slide.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "TILER_SLIDE_TILE_CACHE")]
    pub slide_tile_cache: usize,
}

/// Tile cache backend selected by the storage options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Filesystem(PathBuf),
    S3 {
        bucket: String,
        prefix: Option<String>,
    },
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_quality(self.jpeg_quality) {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }
        if self.write_queue == 0 {
            return Err("write_queue must be greater than 0".to_string());
        }
        if self.write_concurrency == 0 {
            return Err("write_concurrency must be greater than 0".to_string());
        }
        if self.slide_tile_cache == 0 {
            return Err("slide_tile_cache must be greater than 0".to_string());
        }
        if self.cache_dir.is_some() && self.cache_bucket.is_some() {
            return Err("Set either --cache-dir or --cache-bucket, not both".to_string());
        }
        if self.cache_bucket.as_deref() == Some("") {
            return Err("cache_bucket must not be empty".to_string());
        }
        Ok(())
    }

    pub fn cache_backend(&self) -> CacheBackend {
        match &self.cache_bucket {
            Some(bucket) => CacheBackend::S3 {
                bucket: bucket.clone(),
                prefix: self.cache_prefix.clone(),
            },
            None => CacheBackend::Filesystem(
                self.cache_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            ),
        }
    }
}

/// Options for `wsi-tiler serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    #[command(flatten)]
    pub storage: StorageConfig,

    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "TILER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "TILER_PORT")]
    pub port: u16,

    /// Workers executing pyramid generation requests.
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "TILER_WORKERS")]
    pub workers: usize,

    /// HTTP Cache-Control max-age in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "TILER_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Allowed CORS origins (comma-separated). Any origin if unset.
    #[arg(long, env = "TILER_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Options for `wsi-tiler generate`.
#[derive(Args, Debug, Clone)]
pub struct GenerateConfig {
    /// Image to generate.
    pub image_id: String,

    #[command(flatten)]
    pub storage: StorageConfig,

    /// Tile size; the stored descriptor's (or 254) if unset.
    #[arg(long)]
    pub tile_size: Option<u32>,

    /// Tile overlap; the stored descriptor's (or 1) if unset.
    #[arg(long)]
    pub overlap: Option<u32>,

    /// Tile format, jpeg or png; the stored descriptor's (or jpeg) if unset.
    #[arg(long)]
    pub format: Option<String>,

    /// Concurrent work units.
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "TILER_WORKERS")]
    pub workers: usize,

    /// Parcels per tract side.
    #[arg(long, default_value_t = DEFAULT_TRACT_LEN)]
    pub tract_len: u32,

    /// Tiles per parcel side.
    #[arg(long, default_value_t = DEFAULT_PARCEL_LEN)]
    pub parcel_len: u32,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl GenerateConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.tract_len == 0 || self.parcel_len == 0 {
            return Err("tract_len and parcel_len must be greater than 0".to_string());
        }
        self.descriptor_request()?.resolve().map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Requested descriptor parameters.
    pub fn descriptor_request(&self) -> Result<DescriptorRequest, String> {
        let encoding = self
            .format
            .as_deref()
            .map(str::parse::<TileEncoding>)
            .transpose()
            .map_err(|e| e.to_string())?;
        Ok(DescriptorRequest {
            tile_size: self.tile_size,
            overlap: self.overlap,
            encoding,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
