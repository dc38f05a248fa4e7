//! Tiled pyramidal TIFF slides (Aperio SVS and plain pyramidal TIFF).
//!
//! Opening a slide walks the IFD chain and keeps every tiled JPEG
//! directory whose aspect ratio matches the largest one. Stripped JPEG
//! directories are kept aside as associated images: `label` and `macro`
//! when their description says so, and the first unnamed one as
//! `thumbnail`. Regions are assembled from decoded native tiles, which are
//! kept in a small per-slide LRU so neighbouring Deep Zoom tiles do not
//! decode the same JPEG twice.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{imageops, ImageFormat, RgbaImage};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use super::jpeg::prepare_tile_jpeg;
use super::properties::{description_properties, level_properties};
use super::reader::{LevelInfo, SlideImage};
use super::tiff::{self, tags, TiffHeader, BIGTIFF_HEADER_SIZE, COMPRESSION_JPEG};
use crate::error::{SlideError, TiffError};
use crate::io::RangeReader;

/// Maximum number of IFDs to walk (guards against cycles).
const MAX_IFDS: usize = 100;

/// Allowed relative difference between horizontal and vertical downsample.
const ASPECT_TOLERANCE: f64 = 0.05;

/// Default number of decoded native tiles kept per slide.
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 256;

/// One tiled pyramid level.
#[derive(Debug, Clone)]
struct TiffLevel {
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    tiles_x: u32,
    tiles_y: u32,
    downsample: f64,
    tile_offsets: Vec<u64>,
    tile_byte_counts: Vec<u64>,
    jpeg_tables: Option<Bytes>,
    description: Option<String>,
}

/// A stripped JPEG image stored beside the pyramid.
#[derive(Debug, Clone)]
pub struct AssociatedImage {
    pub name: String,
    pub width: u32,
    pub height: u32,
    rows_per_strip: u32,
    strip_offsets: Vec<u64>,
    strip_byte_counts: Vec<u64>,
    jpeg_tables: Option<Bytes>,
}

type TileKey = (usize, u32, u32);

/// A slide backed by a tiled TIFF container.
pub struct TiffSlide<R> {
    reader: R,
    levels: Vec<TiffLevel>,
    associated: Vec<AssociatedImage>,
    tiles: Mutex<LruCache<TileKey, Option<Arc<RgbaImage>>>>,
}

impl<R: RangeReader> TiffSlide<R> {
    /// Parse the container and build the level list.
    pub async fn open(reader: R, tile_cache_capacity: usize) -> Result<Self, SlideError> {
        let size = reader.size();
        let header_len = (BIGTIFF_HEADER_SIZE as u64).min(size) as usize;
        let header_bytes = reader.read_exact_at(0, header_len).await?;
        let header = TiffHeader::parse(&header_bytes, size)?;

        let mut candidates = Vec::new();
        let mut stripped = Vec::new();
        let mut offset = header.first_ifd_offset;
        let mut walked = 0;
        while offset != 0 && walked < MAX_IFDS {
            let ifd = tiff::read_ifd(&reader, &header, offset).await?;
            let description = match ifd.get(tags::IMAGE_DESCRIPTION) {
                Some(entry) => tiff::read_ascii(&reader, &header, entry).await.ok(),
                None => None,
            };
            if let Some(mut level) = read_level(&reader, &header, &ifd).await? {
                level.description = description;
                candidates.push(level);
            } else if let Some(image) =
                read_stripped(&reader, &header, &ifd, description.as_deref()).await?
            {
                stripped.push(image);
            }
            offset = ifd.next_offset;
            walked += 1;
        }

        let levels = select_pyramid(candidates);
        if levels.is_empty() {
            return Err(TiffError::NoPyramidLevels.into());
        }
        let associated = name_associated(stripped);

        debug!(
            source = reader.identifier(),
            levels = levels.len(),
            width = levels[0].width,
            height = levels[0].height,
            associated = associated.len(),
            "Opened tiled slide"
        );

        let capacity = NonZeroUsize::new(tile_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            reader,
            levels,
            associated,
            tiles: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Decode an associated image strip by strip.
    async fn decode_associated(&self, image: &AssociatedImage) -> Result<RgbaImage, SlideError> {
        let mut out = RgbaImage::new(image.width, image.height);
        let strips = image.strip_offsets.iter().zip(&image.strip_byte_counts);
        for (index, (&offset, &len)) in strips.enumerate() {
            if len == 0 {
                continue;
            }
            let raw = self.reader.read_exact_at(offset, len as usize).await?;
            let data = prepare_tile_jpeg(image.jpeg_tables.as_deref(), raw);
            let strip = image::load_from_memory_with_format(&data, ImageFormat::Jpeg)
                .map_err(|e| SlideError::Decode {
                    message: format!("{} strip {}: {}", image.name, index, e),
                })?
                .to_rgba8();
            let top = index as i64 * image.rows_per_strip as i64;
            imageops::replace(&mut out, &strip, 0, top);
        }
        Ok(out)
    }

    /// Decoded native tile, or `None` for a tile with no stored data.
    async fn native_tile(
        &self,
        level: usize,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<Option<Arc<RgbaImage>>, SlideError> {
        let key = (level, tile_x, tile_y);
        if let Some(tile) = self.tiles.lock().await.get(&key) {
            return Ok(tile.clone());
        }

        let info = &self.levels[level];
        let index = (tile_y * info.tiles_x + tile_x) as usize;
        let offset = info.tile_offsets[index];
        let len = info.tile_byte_counts[index];

        let decoded = if len == 0 {
            None
        } else {
            let raw = self.reader.read_exact_at(offset, len as usize).await?;
            let data = prepare_tile_jpeg(info.jpeg_tables.as_deref(), raw);
            let image = image::load_from_memory_with_format(&data, ImageFormat::Jpeg)
                .map_err(|e| SlideError::Decode {
                    message: format!("level {} tile ({}, {}): {}", level, tile_x, tile_y, e),
                })?
                .to_rgba8();

            // Edge tiles are padded to the full tile size
            let valid_w = info.tile_width.min(info.width - tile_x * info.tile_width);
            let valid_h = info.tile_height.min(info.height - tile_y * info.tile_height);
            let image = if image.width() > valid_w || image.height() > valid_h {
                imageops::crop_imm(
                    &image,
                    0,
                    0,
                    valid_w.min(image.width()),
                    valid_h.min(image.height()),
                )
                .to_image()
            } else {
                image
            };
            Some(Arc::new(image))
        };

        self.tiles.lock().await.put(key, decoded.clone());
        Ok(decoded)
    }
}

#[async_trait]
impl<R: RangeReader + 'static> SlideImage for TiffSlide<R> {
    fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn level_info(&self, level: usize) -> Option<LevelInfo> {
        self.levels.get(level).map(|l| LevelInfo {
            width: l.width,
            height: l.height,
            downsample: l.downsample,
        })
    }

    fn properties(&self) -> BTreeMap<String, String> {
        let mut properties = level_properties(self);
        if let Some(description) = self.levels.first().and_then(|l| l.description.as_ref()) {
            properties.extend(description_properties(description));
        }
        properties
    }

    fn associated_image_names(&self) -> Vec<String> {
        self.associated.iter().map(|image| image.name.clone()).collect()
    }

    async fn read_associated_image(&self, name: &str) -> Result<Option<RgbaImage>, SlideError> {
        match self.associated.iter().find(|image| image.name == name) {
            Some(image) => Ok(Some(self.decode_associated(image).await?)),
            None => Ok(None),
        }
    }

    async fn read_region(
        &self,
        x0: u64,
        y0: u64,
        level: usize,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, SlideError> {
        let info = self.levels.get(level).ok_or(SlideError::InvalidLevel {
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

        let lx = (x0 as f64 / info.downsample).floor() as i64;
        let ly = (y0 as f64 / info.downsample).floor() as i64;
        let mut region = RgbaImage::new(width, height);

        if lx >= info.width as i64 || ly >= info.height as i64 {
            return Ok(region);
        }

        let tw = info.tile_width as i64;
        let th = info.tile_height as i64;
        let last_x = ((lx + width as i64 - 1) / tw).min(info.tiles_x as i64 - 1);
        let last_y = ((ly + height as i64 - 1) / th).min(info.tiles_y as i64 - 1);

        for tile_y in (ly / th)..=last_y {
            for tile_x in (lx / tw)..=last_x {
                if let Some(tile) = self
                    .native_tile(level, tile_x as u32, tile_y as u32)
                    .await?
                {
                    imageops::replace(&mut region, &*tile, tile_x * tw - lx, tile_y * th - ly);
                }
            }
        }

        Ok(region)
    }
}

/// Build a level from an IFD if it is a tiled JPEG image.
async fn read_level<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    ifd: &tiff::Ifd,
) -> Result<Option<TiffLevel>, TiffError> {
    let (Some(tile_width), Some(tile_height), Some(offsets), Some(counts)) = (
        ifd.get(tags::TILE_WIDTH),
        ifd.get(tags::TILE_LENGTH),
        ifd.get(tags::TILE_OFFSETS),
        ifd.get(tags::TILE_BYTE_COUNTS),
    ) else {
        return Ok(None);
    };

    let compression = match ifd.get(tags::COMPRESSION) {
        Some(entry) => tiff::read_scalar(reader, header, entry).await?,
        None => 1,
    };
    if compression != COMPRESSION_JPEG {
        debug!(compression, "Skipping non-JPEG tiled directory");
        return Ok(None);
    }

    let width_entry = ifd.get(tags::IMAGE_WIDTH).ok_or(TiffError::InvalidTagValue {
        tag: "ImageWidth",
        message: "missing".to_string(),
    })?;
    let height_entry = ifd.get(tags::IMAGE_LENGTH).ok_or(TiffError::InvalidTagValue {
        tag: "ImageLength",
        message: "missing".to_string(),
    })?;

    let width = tiff::read_scalar(reader, header, width_entry).await? as u32;
    let height = tiff::read_scalar(reader, header, height_entry).await? as u32;
    let tile_width = tiff::read_scalar(reader, header, tile_width).await? as u32;
    let tile_height = tiff::read_scalar(reader, header, tile_height).await? as u32;
    if width == 0 || height == 0 || tile_width == 0 || tile_height == 0 {
        return Ok(None);
    }

    let tiles_x = width.div_ceil(tile_width);
    let tiles_y = height.div_ceil(tile_height);
    let tile_offsets = tiff::read_unsigned(reader, header, offsets).await?;
    let tile_byte_counts = tiff::read_unsigned(reader, header, counts).await?;
    let expected = tiles_x as usize * tiles_y as usize;
    if tile_offsets.len() < expected || tile_byte_counts.len() < expected {
        return Err(TiffError::InvalidTagValue {
            tag: "TileOffsets",
            message: format!(
                "expected {} tiles, got {} offsets and {} byte counts",
                expected,
                tile_offsets.len(),
                tile_byte_counts.len()
            ),
        });
    }

    let jpeg_tables = match ifd.get(tags::JPEG_TABLES) {
        Some(entry) => Some(tiff::read_bytes(reader, header, entry).await?),
        None => None,
    };

    Ok(Some(TiffLevel {
        width,
        height,
        tile_width,
        tile_height,
        tiles_x,
        tiles_y,
        downsample: 1.0,
        tile_offsets,
        tile_byte_counts,
        jpeg_tables,
        description: None,
    }))
}

/// Associated image from a stripped JPEG IFD. The name comes from the
/// description and is empty when it names neither a label nor a macro.
async fn read_stripped<R: RangeReader>(
    reader: &R,
    header: &TiffHeader,
    ifd: &tiff::Ifd,
    description: Option<&str>,
) -> Result<Option<AssociatedImage>, TiffError> {
    let (Some(width), Some(height), Some(offsets), Some(counts)) = (
        ifd.get(tags::IMAGE_WIDTH),
        ifd.get(tags::IMAGE_LENGTH),
        ifd.get(tags::STRIP_OFFSETS),
        ifd.get(tags::STRIP_BYTE_COUNTS),
    ) else {
        return Ok(None);
    };

    let compression = match ifd.get(tags::COMPRESSION) {
        Some(entry) => tiff::read_scalar(reader, header, entry).await?,
        None => 1,
    };
    if compression != COMPRESSION_JPEG {
        debug!(compression, description = ?description, "Skipping non-JPEG stripped directory");
        return Ok(None);
    }

    let width = tiff::read_scalar(reader, header, width).await? as u32;
    let height = tiff::read_scalar(reader, header, height).await? as u32;
    if width == 0 || height == 0 {
        return Ok(None);
    }
    let rows_per_strip = match ifd.get(tags::ROWS_PER_STRIP) {
        Some(entry) => (tiff::read_scalar(reader, header, entry).await? as u32).clamp(1, height),
        None => height,
    };

    let strip_offsets = tiff::read_unsigned(reader, header, offsets).await?;
    let strip_byte_counts = tiff::read_unsigned(reader, header, counts).await?;
    let jpeg_tables = match ifd.get(tags::JPEG_TABLES) {
        Some(entry) => Some(tiff::read_bytes(reader, header, entry).await?),
        None => None,
    };

    let name = description
        .map(str::to_ascii_lowercase)
        .and_then(|d| {
            ["label", "macro"]
                .into_iter()
                .find(|name| d.contains(name))
                .map(str::to_string)
        })
        .unwrap_or_default();

    Ok(Some(AssociatedImage {
        name,
        width,
        height,
        rows_per_strip,
        strip_offsets,
        strip_byte_counts,
        jpeg_tables,
    }))
}

/// Name the first unnamed image `thumbnail` and drop later unnamed or
/// duplicate ones.
fn name_associated(stripped: Vec<AssociatedImage>) -> Vec<AssociatedImage> {
    let mut named: Vec<AssociatedImage> = Vec::with_capacity(stripped.len());
    for mut image in stripped {
        if image.name.is_empty() {
            image.name = "thumbnail".to_string();
        }
        if named.iter().any(|other| other.name == image.name) {
            debug!(name = %image.name, "Skipping duplicate associated image");
            continue;
        }
        named.push(image);
    }
    named
}

/// Order candidate levels by size and drop those that are not reductions of
/// the largest image.
fn select_pyramid(mut candidates: Vec<TiffLevel>) -> Vec<TiffLevel> {
    candidates.sort_by(|a, b| {
        let area_a = a.width as u64 * a.height as u64;
        let area_b = b.width as u64 * b.height as u64;
        area_b.cmp(&area_a)
    });

    let Some(base) = candidates.first().cloned() else {
        return Vec::new();
    };

    let mut levels: Vec<TiffLevel> = Vec::with_capacity(candidates.len());
    for mut level in candidates {
        let ds_x = base.width as f64 / level.width as f64;
        let ds_y = base.height as f64 / level.height as f64;
        if (ds_x - ds_y).abs() / ds_x.max(ds_y) > ASPECT_TOLERANCE {
            debug!(
                width = level.width,
                height = level.height,
                "Skipping directory with mismatched aspect ratio"
            );
            continue;
        }
        if levels
            .last()
            .is_some_and(|prev| prev.width == level.width && prev.height == level.height)
        {
            continue;
        }
        level.downsample = (ds_x + ds_y) / 2.0;
        levels.push(level);
    }

    levels
}
