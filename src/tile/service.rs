//! Tile Service for orchestrating tile generation.
//!
//! The TileService is the entry point for descriptor, tile and IIIF requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TileService                             │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                    get_tile()                           │    │
//! │  │  1. Resolve descriptor   4. Read native region          │    │
//! │  │  2. Check cache          5. Composite, resize, encode   │    │
//! │  │  3. Map to native level  6. Queue cache write & return  │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │           │                    │                    │           │
//! │           ▼                    ▼                    ▼           │
//! │    ┌───────────┐      ┌──────────────┐    ┌──────────────────┐  │
//! │    │ TileCache │      │ SlideRegistry│    │   TileEncoder    │  │
//! │    └───────────┘      └──────────────┘    └──────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Batch generation resolves a [`PyramidSnapshot`] once per image and calls
//! [`TileService::ensure_tile_in`] for each tile. Every cache write carries
//! the descriptor timestamp the tile was rendered under, and is dropped if
//! the descriptor has been rewritten since.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::{DescriptorLookup, TileCache, TileKey};
use crate::error::{SlideError, TileError};
use crate::pyramid::{
    DescriptorRequest, DziDocument, IiifInfo, IiifRequest, NativeLevels, PixelRect,
    PyramidDescriptor, PyramidGeometry, TileEncoding, MAX_READ_PIXELS,
};
use crate::slide::{is_valid_image_id, SlideImage, SlideRegistry, SlideSource};

use super::encoder::TileEncoder;

// =============================================================================
// Requests and responses
// =============================================================================

/// A request for one Deep Zoom tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    pub image_id: String,

    /// Synthetic level (0 = 1x1 pixel)
    pub level: usize,

    pub col: u32,

    pub row: u32,

    /// Output encoding; the descriptor's when unset
    pub encoding: Option<TileEncoding>,
}

impl TileRequest {
    pub fn new(image_id: impl Into<String>, level: usize, col: u32, row: u32) -> Self {
        Self {
            image_id: image_id.into(),
            level,
            col,
            row,
            encoding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: TileEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    fn address(&self) -> String {
        format!("level {} tile ({}, {})", self.level, self.col, self.row)
    }
}

/// Response from the tile service.
#[derive(Debug, Clone)]
pub struct TileResponse {
    /// The encoded tile
    pub data: Bytes,

    pub encoding: TileEncoding,

    /// Whether this tile was served from cache
    pub cache_hit: bool,
}

/// What `ensure_tile` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOutcome {
    Cached,
    Generated,
}

/// An image's descriptor and pyramid geometry, resolved once and shared by
/// every tile of a batch.
#[derive(Debug, Clone)]
pub struct PyramidSnapshot {
    pub image_id: String,

    pub document: DziDocument,

    /// Descriptor timestamp; cached tiles older than this are stale
    pub modified: SystemTime,

    pub geometry: PyramidGeometry,
}

impl PyramidSnapshot {
    /// Encoding tiles are generated in.
    pub fn encoding(&self) -> TileEncoding {
        self.document.descriptor.encoding
    }
}

/// An encoded IIIF region.
#[derive(Debug, Clone)]
pub struct RegionResponse {
    pub data: Bytes,
    pub encoding: TileEncoding,
}

// =============================================================================
// Tile Service
// =============================================================================

/// Service for generating and caching tiles.
///
/// The slide registry is shared with whatever else needs slides (the fan-out
/// scheduler holds the service itself, so it shares the registry too).
pub struct TileService<S: SlideSource> {
    registry: Arc<SlideRegistry<S>>,

    cache: TileCache,

    encoder: TileEncoder,
}

impl<S: SlideSource> TileService<S> {
    pub fn new(registry: Arc<SlideRegistry<S>>, cache: TileCache, encoder: TileEncoder) -> Self {
        Self {
            registry,
            cache,
            encoder,
        }
    }

    pub fn registry(&self) -> &Arc<SlideRegistry<S>> {
        &self.registry
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// Descriptor document for an image, rewriting it when the caller asks
    /// for different parameters.
    ///
    /// Rewriting is the only way tiles get invalidated: every tile cached
    /// before the new descriptor is considered stale.
    pub async fn get_dzi(
        &self,
        image_id: &str,
        request: DescriptorRequest,
    ) -> Result<DziDocument, TileError> {
        validate_image_id(image_id)?;
        let slide = self.open_slide(image_id).await?;
        let (width, height) = level0_dimensions(image_id, &*slide)?;

        match self.cache.read_descriptor(image_id).await {
            DescriptorLookup::Found(stored)
                if request.matches(&stored.document.descriptor)
                    && (stored.document.width, stored.document.height) == (width, height) =>
            {
                return Ok(stored.document);
            }
            DescriptorLookup::Found(stored) => {
                debug!(
                    image_id,
                    stored = ?stored.document.descriptor,
                    requested = ?request,
                    "Descriptor parameters changed"
                );
            }
            DescriptorLookup::Absent | DescriptorLookup::Invalid(_) => {}
        }

        let document = DziDocument::new(request.resolve()?, width, height);
        self.persist_descriptor(image_id, &document).await;
        Ok(document)
    }

    /// Get a tile, using the cache when it holds a valid copy.
    ///
    /// On a miss the tile is generated, returned, and queued for a cache
    /// write without waiting for it. The write is discarded if the
    /// descriptor is rewritten before it lands.
    pub async fn get_tile(&self, request: TileRequest) -> Result<TileResponse, TileError> {
        validate_image_id(&request.image_id)?;

        if let DescriptorLookup::Found(stored) = self.cache.read_descriptor(&request.image_id).await
        {
            let encoding = request
                .encoding
                .unwrap_or(stored.document.descriptor.encoding);
            let key = tile_key(&request, encoding);
            if self.cache.tile_status(&key, stored.modified).await.is_valid() {
                match self.cache.read_tile(&key).await {
                    Ok(data) => {
                        return Ok(TileResponse {
                            data,
                            encoding,
                            cache_hit: true,
                        })
                    }
                    Err(e) => debug!(key = %key, error = %e, "Cached tile unreadable, regenerating"),
                }
            }
        }

        let slide = self.open_slide(&request.image_id).await?;
        let (document, modified) = self.current_descriptor(&request.image_id, &*slide).await?;
        let encoding = request.encoding.unwrap_or(document.descriptor.encoding);
        let geometry = build_geometry(&request.image_id, &*slide, &document.descriptor)?;

        let data = self.render_tile(&*slide, &geometry, &request, encoding).await?;
        match modified {
            Some(modified) => {
                self.cache
                    .write_tile(&tile_key(&request, encoding), data.clone(), modified)
            }
            None => debug!(image_id = %request.image_id, "No stored descriptor, tile not cached"),
        }

        Ok(TileResponse {
            data,
            encoding,
            cache_hit: false,
        })
    }

    /// Resolve the descriptor and geometry that tiles of an image are
    /// generated under, writing the default descriptor if none is usable.
    ///
    /// Batch generation resolves this once and reuses it for every tile.
    pub async fn snapshot(&self, image_id: &str) -> Result<PyramidSnapshot, TileError> {
        validate_image_id(image_id)?;
        let slide = self.open_slide(image_id).await?;

        let stored = match self.cache.read_descriptor(image_id).await {
            DescriptorLookup::Found(stored) => stored,
            DescriptorLookup::Absent | DescriptorLookup::Invalid(_) => {
                let (width, height) = level0_dimensions(image_id, &*slide)?;
                let document = DziDocument::new(PyramidDescriptor::default(), width, height);
                self.cache
                    .write_descriptor(image_id, &document)
                    .await
                    .map_err(|source| TileError::Cache {
                        image_id: image_id.to_string(),
                        source,
                    })?
            }
        };
        let geometry = build_geometry(image_id, &*slide, &stored.document.descriptor)?;

        Ok(PyramidSnapshot {
            image_id: image_id.to_string(),
            document: stored.document,
            modified: stored.modified,
            geometry,
        })
    }

    /// Make sure a valid tile is cached, generating it if needed.
    ///
    /// Cached bytes are never read and the write waits for queue space
    /// rather than being dropped.
    pub async fn ensure_tile(&self, request: &TileRequest) -> Result<TileOutcome, TileError> {
        let snapshot = self.snapshot(&request.image_id).await?;
        let encoding = request.encoding.unwrap_or(snapshot.encoding());
        self.ensure_tile_in(&snapshot, request.level, request.col, request.row, encoding)
            .await
    }

    /// [`ensure_tile`](Self::ensure_tile) against an already resolved
    /// snapshot: one store lookup for a cached tile.
    pub async fn ensure_tile_in(
        &self,
        snapshot: &PyramidSnapshot,
        level: usize,
        col: u32,
        row: u32,
        encoding: TileEncoding,
    ) -> Result<TileOutcome, TileError> {
        let key = TileKey::new(&snapshot.image_id, level, col, row, encoding);
        if self.cache.tile_status(&key, snapshot.modified).await.is_valid() {
            return Ok(TileOutcome::Cached);
        }

        let slide = self.open_slide(&snapshot.image_id).await?;
        let request = TileRequest::new(snapshot.image_id.clone(), level, col, row);
        let data = self
            .render_tile(&*slide, &snapshot.geometry, &request, encoding)
            .await?;
        self.cache
            .write_tile_blocking(&key, data, snapshot.modified)
            .await;
        Ok(TileOutcome::Generated)
    }

    /// Pyramid geometry under the image's current descriptor.
    pub async fn geometry(&self, image_id: &str) -> Result<PyramidGeometry, TileError> {
        Ok(self.snapshot(image_id).await?.geometry)
    }

    /// IIIF `info.json` for an image. `base_url` is the IIIF prefix the
    /// image id is appended to.
    pub async fn iiif_info(&self, image_id: &str, base_url: &str) -> Result<IiifInfo, TileError> {
        validate_image_id(image_id)?;
        let slide = self.open_slide(image_id).await?;
        let (document, _) = self.current_descriptor(image_id, &*slide).await?;

        let scale_factors = (0..slide.level_count())
            .filter_map(|level| slide.native_downsample(level))
            .collect();

        Ok(IiifInfo::new(
            format!("{}/{}", base_url.trim_end_matches('/'), image_id),
            document.width,
            document.height,
            document.descriptor.tile_size,
            scale_factors,
        ))
    }

    /// Render a IIIF region request. Results are not cached.
    ///
    /// The native read is capped at [`MAX_READ_PIXELS`]: a request that would
    /// exceed it reads a coarser native level instead, and is rejected when
    /// even the coarsest level is too large.
    pub async fn iiif_region(
        &self,
        image_id: &str,
        request: &IiifRequest,
    ) -> Result<RegionResponse, TileError> {
        validate_image_id(image_id)?;
        let slide = self.open_slide(image_id).await?;
        let (width, height) = level0_dimensions(image_id, &*slide)?;

        let rect = request.region.resolve(width, height)?;
        let (out_w, out_h) = request.size.resolve(rect.width, rect.height)?;
        let downsample = (rect.width as f64 / out_w as f64).max(rect.height as f64 / out_h as f64);

        let geometry = build_geometry(image_id, &*slide, &PyramidDescriptor::default())?;
        let native = geometry.native();
        let mut native_level = geometry.best_native_level_for_downsample(downsample);
        let (read_w, read_h) = loop {
            let (read_w, read_h) = native_read_size(native, native_level, &rect, (width, height));
            if read_w as u64 * read_h as u64 <= MAX_READ_PIXELS {
                break (read_w, read_h);
            }
            if native_level + 1 >= native.len() {
                return Err(TileError::InvalidRegion {
                    message: format!(
                        "region {}x{} needs a {}x{} read at the coarsest level, over the {} pixel limit",
                        rect.width, rect.height, read_w, read_h, MAX_READ_PIXELS
                    ),
                });
            }
            native_level += 1;
        };

        let pixels = slide
            .read_region(rect.x, rect.y, native_level, read_w, read_h)
            .await
            .map_err(|source| TileError::SourceRead {
                image_id: image_id.to_string(),
                address: format!(
                    "region {},{},{},{}",
                    rect.x, rect.y, rect.width, rect.height
                ),
                source,
            })?;

        let data = self.encoder.finish(
            &pixels,
            slide.background(),
            out_w,
            out_h,
            request.encoding,
        )?;
        debug!(
            image_id,
            native_level,
            read_w,
            read_h,
            out_w,
            out_h,
            "IIIF region rendered"
        );

        Ok(RegionResponse {
            data,
            encoding: request.encoding,
        })
    }

    /// Slide properties, as served by `properties.json`.
    pub async fn properties(&self, image_id: &str) -> Result<BTreeMap<String, String>, TileError> {
        validate_image_id(image_id)?;
        let slide = self.open_slide(image_id).await?;
        Ok(slide.properties())
    }

    /// An associated image such as `thumbnail` or `label`, as JPEG.
    ///
    /// The encoded image is cached at `{image_id}/{name}.jpeg`. It does not
    /// depend on the descriptor and is never invalidated.
    pub async fn associated_image(
        &self,
        image_id: &str,
        name: &str,
    ) -> Result<TileResponse, TileError> {
        validate_image_id(image_id)?;
        let not_found = || TileError::AssociatedImageNotFound {
            image_id: image_id.to_string(),
            name: name.to_string(),
        };
        if !is_valid_image_id(name) {
            return Err(not_found());
        }

        let key = format!("{}/{}.{}", image_id, name, TileEncoding::Jpeg.as_str());
        if let Some(data) = self.cache.read_object(&key).await {
            return Ok(TileResponse {
                data,
                encoding: TileEncoding::Jpeg,
                cache_hit: true,
            });
        }

        let slide = self.open_slide(image_id).await?;
        let pixels = slide
            .read_associated_image(name)
            .await
            .map_err(|source| TileError::SourceRead {
                image_id: image_id.to_string(),
                address: format!("associated image {}", name),
                source,
            })?
            .ok_or_else(not_found)?;

        let (width, height) = pixels.dimensions();
        let data = self.encoder.finish(
            &pixels,
            slide.background(),
            width,
            height,
            TileEncoding::Jpeg,
        )?;
        self.cache.write_object(&key, data.clone());
        debug!(image_id, name, width, height, "Associated image encoded");

        Ok(TileResponse {
            data,
            encoding: TileEncoding::Jpeg,
            cache_hit: false,
        })
    }

    async fn open_slide(&self, image_id: &str) -> Result<Arc<S::Slide>, TileError> {
        self.registry
            .get_slide(image_id)
            .await
            .map_err(|source| TileError::SourceOpen {
                image_id: image_id.to_string(),
                source,
            })
    }

    /// The stored descriptor and its timestamp, or the defaults written now
    /// if none is usable. The timestamp is `None` when that write failed.
    async fn current_descriptor(
        &self,
        image_id: &str,
        slide: &S::Slide,
    ) -> Result<(DziDocument, Option<SystemTime>), TileError> {
        match self.cache.read_descriptor(image_id).await {
            DescriptorLookup::Found(stored) => Ok((stored.document, Some(stored.modified))),
            DescriptorLookup::Absent | DescriptorLookup::Invalid(_) => {
                let (width, height) = level0_dimensions(image_id, slide)?;
                let document = DziDocument::new(PyramidDescriptor::default(), width, height);
                let modified = self.persist_descriptor(image_id, &document).await;
                Ok((document, modified))
            }
        }
    }

    async fn persist_descriptor(&self, image_id: &str, document: &DziDocument) -> Option<SystemTime> {
        match self.cache.write_descriptor(image_id, document).await {
            Ok(stored) => Some(stored.modified),
            Err(e) => {
                // Tiles still render; they just cannot be served from cache
                warn!(image_id, error = %e, "Failed to persist descriptor");
                None
            }
        }
    }

    async fn render_tile(
        &self,
        slide: &S::Slide,
        geometry: &PyramidGeometry,
        request: &TileRequest,
        encoding: TileEncoding,
    ) -> Result<Bytes, TileError> {
        let bad_address = |source| TileError::BadAddress {
            image_id: request.image_id.clone(),
            source,
        };
        let region = geometry
            .tile_region(request.level, request.col, request.row)
            .map_err(bad_address)?;
        let params = geometry
            .region_parameters(request.level, request.col, request.row, &region)
            .map_err(bad_address)?;

        let pixels = slide
            .read_region(
                params.x0,
                params.y0,
                params.native_level,
                params.width,
                params.height,
            )
            .await
            .map_err(|source| TileError::SourceRead {
                image_id: request.image_id.clone(),
                address: request.address(),
                source,
            })?;

        let data = self.encoder.finish(
            &pixels,
            slide.background(),
            region.width,
            region.height,
            encoding,
        )?;

        debug!(
            image_id = %request.image_id,
            level = request.level,
            col = request.col,
            row = request.row,
            native_level = params.native_level,
            bytes = data.len(),
            "Tile generated"
        );
        Ok(data)
    }
}

/// Native pixels needed to cover `rect` at a native level, clipped to the
/// level bounds.
fn native_read_size(
    native: &NativeLevels,
    level: usize,
    rect: &PixelRect,
    full: (u32, u32),
) -> (u32, u32) {
    let ds = native.downsample(level).unwrap_or(1).max(1) as u64;
    let (native_w, native_h) = native.dimensions(level).unwrap_or(full);
    let read_w = (rect.width as u64)
        .div_ceil(ds)
        .min((native_w as u64).saturating_sub(rect.x / ds))
        .max(1);
    let read_h = (rect.height as u64)
        .div_ceil(ds)
        .min((native_h as u64).saturating_sub(rect.y / ds))
        .max(1);
    (read_w as u32, read_h as u32)
}

fn validate_image_id(image_id: &str) -> Result<(), TileError> {
    if is_valid_image_id(image_id) {
        Ok(())
    } else {
        Err(TileError::InvalidImageId(image_id.to_string()))
    }
}

fn tile_key(request: &TileRequest, encoding: TileEncoding) -> TileKey {
    TileKey::new(
        &request.image_id,
        request.level,
        request.col,
        request.row,
        encoding,
    )
}

fn no_levels(image_id: &str) -> TileError {
    TileError::SourceOpen {
        image_id: image_id.to_string(),
        source: SlideError::InvalidLevel {
            level: 0,
            level_count: 0,
        },
    }
}

fn level0_dimensions<T: SlideImage + ?Sized>(
    image_id: &str,
    slide: &T,
) -> Result<(u32, u32), TileError> {
    slide.dimensions().ok_or_else(|| no_levels(image_id))
}

fn build_geometry<T: SlideImage + ?Sized>(
    image_id: &str,
    slide: &T,
    descriptor: &PyramidDescriptor,
) -> Result<PyramidGeometry, TileError> {
    PyramidGeometry::for_slide(slide, descriptor.tile_size, descriptor.overlap)
        .ok_or_else(|| no_levels(image_id))
}
