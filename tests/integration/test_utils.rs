//! Test utilities for integration tests.
//!
//! Synthetic slides with arbitrary native levels, a service and router
//! builder over an in-memory or filesystem tile store, a pyramid runner, and
//! a small tiled-TIFF writer for end-to-end tests through the file source.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage, Rgba, RgbaImage};

use wsi_tiler::cache::{TileCache, TileStore};
use wsi_tiler::error::{IoError, SlideError, TiffError};
use wsi_tiler::fanout::{work_queue, Dispatcher, FanoutConfig, PyramidScheduler, WorkUnit, WorkerPool};
use wsi_tiler::pyramid::DescriptorRequest;
use wsi_tiler::server::{create_router, RouterConfig};
use wsi_tiler::slide::{LevelInfo, SlideImage, SlideRegistry, SlideSource};
use wsi_tiler::tile::{TileEncoder, TileService};

// =============================================================================
// Synthetic Slides
// =============================================================================

/// Shade painted on a native level; distinct per level so tests can tell
/// which level a tile was read from.
pub fn level_shade(level: usize) -> u8 {
    40 + (level as u8).wrapping_mul(60)
}

/// A slide whose native levels are solid, opaque, one shade per level.
pub struct SyntheticSlide {
    levels: Vec<LevelInfo>,
    reads: Arc<AtomicUsize>,
}

impl SyntheticSlide {
    /// Levels from `(width, height, downsample)` triples.
    pub fn new(levels: &[(u32, u32, f64)], reads: Arc<AtomicUsize>) -> Self {
        Self {
            levels: levels
                .iter()
                .map(|&(width, height, downsample)| LevelInfo {
                    width,
                    height,
                    downsample,
                })
                .collect(),
            reads,
        }
    }
}

#[async_trait]
impl SlideImage for SyntheticSlide {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn level_info(&self, level: usize) -> Option<LevelInfo> {
        self.levels.get(level).copied()
    }

    async fn read_region(
        &self,
        x0: u64,
        y0: u64,
        level: usize,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, SlideError> {
        let info = self.level_info(level).ok_or(SlideError::InvalidLevel {
            level,
            level_count: self.levels.len(),
        })?;
        if width == 0 || height == 0 {
            return Err(SlideError::InvalidRegion {
                x0,
                y0,
                width,
                height,
            });
        }
        self.reads.fetch_add(1, Ordering::SeqCst);

        let left = (x0 as f64 / info.downsample) as u64;
        let top = (y0 as f64 / info.downsample) as u64;
        let shade = level_shade(level);

        Ok(RgbaImage::from_fn(width, height, |x, y| {
            if left + (x as u64) < info.width as u64 && top + (y as u64) < info.height as u64 {
                Rgba([shade, shade, shade, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        }))
    }
}

/// Source of synthetic slides, keyed by image id.
#[derive(Default)]
pub struct SyntheticSource {
    slides: HashMap<String, Vec<(u32, u32, f64)>>,
    broken: Vec<String>,
    opens: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slide(mut self, image_id: &str, levels: &[(u32, u32, f64)]) -> Self {
        self.slides.insert(image_id.to_string(), levels.to_vec());
        self
    }

    /// An id whose file exists but cannot be parsed.
    pub fn with_broken(mut self, image_id: &str) -> Self {
        self.broken.push(image_id.to_string());
        self
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Region reads across every slide of this source.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlideSource for SyntheticSource {
    type Slide = SyntheticSlide;

    async fn open(&self, image_id: &str) -> Result<SyntheticSlide, SlideError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.broken.iter().any(|id| id == image_id) {
            return Err(TiffError::NoPyramidLevels.into());
        }
        match self.slides.get(image_id) {
            Some(levels) => Ok(SyntheticSlide::new(levels, self.reads.clone())),
            None => Err(IoError::NotFound(format!("{}.svs", image_id)).into()),
        }
    }
}

/// 4096x3072 with native downsamples 1, 4 and 16.
pub const WORKED_EXAMPLE: &[(u32, u32, f64)] = &[
    (4096, 3072, 1.0),
    (1024, 768, 4.0),
    (256, 192, 16.0),
];

/// 64x48 with native downsamples 1, 8 and 64: Deep Zoom levels 6, 3 and 0
/// are native.
pub const FANOUT_SLIDE: &[(u32, u32, f64)] = &[(64, 48, 1.0), (8, 6, 8.0), (1, 1, 64.0)];

/// Source holding `slide` (worked example), `small` (fan-out slide) and a
/// broken `corrupt` image.
pub fn default_source() -> SyntheticSource {
    SyntheticSource::new()
        .with_slide("slide", WORKED_EXAMPLE)
        .with_slide("small", FANOUT_SLIDE)
        .with_broken("corrupt")
}

// =============================================================================
// Service and Router
// =============================================================================

pub fn tile_service<S: SlideSource>(
    source: S,
    store: Arc<dyn TileStore>,
) -> Arc<TileService<S>> {
    let registry = Arc::new(SlideRegistry::new(source));
    let cache = TileCache::new(store, 256, 4);
    Arc::new(TileService::new(registry, cache, TileEncoder::default()))
}

/// Router with a worker pool behind `POST /pyramids`.
pub fn app<S: SlideSource + 'static>(service: Arc<TileService<S>>) -> (Router, WorkerPool) {
    let (dispatcher, receiver) = work_queue();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);
    let scheduler = Arc::new(PyramidScheduler::new(
        service.clone(),
        dispatcher.clone(),
        FanoutConfig::default(),
    ));
    let pool = WorkerPool::spawn(receiver, 2, scheduler);

    let config = RouterConfig::new()
        .with_cache_max_age(600)
        .with_tracing(false)
        .with_iiif_base_url("http://tiles.test/iiif");
    (create_router(service, Some(dispatcher), config), pool)
}

/// Generate a whole pyramid and wait for every tile to reach the store.
/// Returns the number of work units that failed.
pub async fn run_pyramid<S: SlideSource + 'static>(
    service: Arc<TileService<S>>,
    image_id: &str,
    request: DescriptorRequest,
    config: FanoutConfig,
    workers: usize,
) -> u64 {
    let (local, receiver) = work_queue();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(local.clone());
    let scheduler = Arc::new(PyramidScheduler::new(
        service.clone(),
        dispatcher.clone(),
        config,
    ));
    let pool = WorkerPool::spawn(receiver, workers, scheduler);

    dispatcher
        .dispatch(WorkUnit::pyramid(image_id, request))
        .await
        .unwrap();
    local.wait_idle().await;
    service.cache().flush().await;
    let failed = pool.failed_units();
    pool.shutdown();
    failed
}

// =============================================================================
// Tiled TIFF Writer
// =============================================================================

fn solid_jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 95)
        .encode_image(&img)
        .unwrap();
    out
}

fn push_entry(out: &mut Vec<u8>, tag: u16, field_type: u16, count: u32, value: u32) {
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&field_type.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    if field_type == 3 && count == 1 {
        out.extend_from_slice(&(value as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]);
    } else {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Little-endian single-level TIFF of `width`x`height`, tiled JPEG, every
/// tile the same colour.
pub fn create_tiled_tiff(width: u32, height: u32, tile: u32, color: [u8; 3]) -> Vec<u8> {
    let count = width.div_ceil(tile) * height.div_ceil(tile);
    let jpeg = solid_jpeg(tile, tile, color);

    let mut out = vec![0x49, 0x49, 0x2A, 0x00, 0, 0, 0, 0];
    let mut offsets = Vec::new();
    for _ in 0..count {
        offsets.push(out.len() as u32);
        out.extend_from_slice(&jpeg);
    }

    let offsets_pos = out.len() as u32;
    for o in &offsets {
        out.extend_from_slice(&o.to_le_bytes());
    }
    let counts_pos = out.len() as u32;
    for _ in 0..count {
        out.extend_from_slice(&(jpeg.len() as u32).to_le_bytes());
    }

    let ifd = out.len() as u32;
    out[4..8].copy_from_slice(&ifd.to_le_bytes());

    let (offsets_value, counts_value) = if count == 1 {
        (offsets[0], jpeg.len() as u32)
    } else {
        (offsets_pos, counts_pos)
    };
    out.extend_from_slice(&7u16.to_le_bytes());
    push_entry(&mut out, 256, 4, 1, width);
    push_entry(&mut out, 257, 4, 1, height);
    push_entry(&mut out, 259, 3, 1, 7);
    push_entry(&mut out, 322, 3, 1, tile);
    push_entry(&mut out, 323, 3, 1, tile);
    push_entry(&mut out, 324, 4, count, offsets_value);
    push_entry(&mut out, 325, 4, count, counts_value);
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// An image stored beside the pyramid as a single JPEG strip.
pub struct StripImage<'a> {
    pub width: u32,
    pub height: u32,
    pub color: [u8; 3],
    /// `ImageDescription`; omitted when empty
    pub description: &'a str,
}

/// [`create_tiled_tiff`] followed by one stripped directory per image.
pub fn create_tiled_tiff_with_strips(
    width: u32,
    height: u32,
    tile: u32,
    color: [u8; 3],
    strips: &[StripImage<'_>],
) -> Vec<u8> {
    let mut out = create_tiled_tiff(width, height, tile, color);
    let mut next_pos = out.len() - 4;

    for strip in strips {
        let jpeg = solid_jpeg(strip.width, strip.height, strip.color);
        let data_pos = out.len() as u32;
        out.extend_from_slice(&jpeg);

        let description_pos = out.len() as u32;
        out.extend_from_slice(strip.description.as_bytes());
        out.push(0);

        let ifd = out.len() as u32;
        out[next_pos..next_pos + 4].copy_from_slice(&ifd.to_le_bytes());

        let with_description = !strip.description.is_empty();
        let entries: u16 = if with_description { 7 } else { 6 };
        out.extend_from_slice(&entries.to_le_bytes());
        push_entry(&mut out, 256, 4, 1, strip.width);
        push_entry(&mut out, 257, 4, 1, strip.height);
        push_entry(&mut out, 259, 3, 1, 7);
        if with_description {
            let count = strip.description.len() as u32 + 1;
            // Short descriptions would be stored inline; keep them out of line
            assert!(count > 4, "description too short: {:?}", strip.description);
            push_entry(&mut out, 270, 2, count, description_pos);
        }
        push_entry(&mut out, 273, 4, 1, data_pos);
        push_entry(&mut out, 278, 4, 1, strip.height);
        push_entry(&mut out, 279, 4, 1, jpeg.len() as u32);

        next_pos = out.len();
        out.extend_from_slice(&0u32.to_le_bytes());
    }
    out
}

pub fn write_tiled_tiff(dir: &Path, image_id: &str, extension: &str, data: &[u8]) {
    std::fs::write(dir.join(format!("{}.{}", image_id, extension)), data).unwrap();
}

// =============================================================================
// Image Checks
// =============================================================================

pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 4
        && data[..2] == [0xFF, 0xD8]
        && data[data.len() - 2..] == [0xFF, 0xD9]
        && image::load_from_memory_with_format(data, image::ImageFormat::Jpeg).is_ok()
}

pub fn is_valid_png(data: &[u8]) -> bool {
    data.starts_with(&[0x89, b'P', b'N', b'G'])
        && image::load_from_memory_with_format(data, image::ImageFormat::Png).is_ok()
}

/// Decode an encoded tile to RGB.
pub fn decode(data: &[u8]) -> RgbImage {
    image::load_from_memory(data).unwrap().to_rgb8()
}

/// Whether every pixel is within `tolerance` of a grey `shade`.
pub fn is_uniform(img: &RgbImage, shade: u8, tolerance: i32) -> bool {
    img.pixels()
        .all(|p| p.0.iter().all(|&c| (c as i32 - shade as i32).abs() <= tolerance))
}
