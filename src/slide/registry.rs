//! Slide registry: the per-process table of open slides.
//!
//! The registry provides:
//! - One open handle per image id, kept for the lifetime of the registry
//! - Singleflight so concurrent first requests open a slide only once
//!
//! There is no eviction. A serving process or a generation run owns exactly
//! one registry and passes it to the components that need slides.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info};

use super::reader::SlideImage;
use super::tiff_slide::{TiffSlide, DEFAULT_TILE_CACHE_CAPACITY};
use crate::error::SlideError;
use crate::io::FileRangeReader;

/// Default file extension of source slides.
pub const DEFAULT_IMAGE_EXTENSION: &str = "svs";

/// Whether an image id is safe to use as a file stem and a cache key prefix.
///
/// Allowed: ASCII letters, digits, `_`, `-` and `.`, not starting with `.`
/// and never containing `..`.
pub fn is_valid_image_id(image_id: &str) -> bool {
    !image_id.is_empty()
        && !image_id.starts_with('.')
        && !image_id.contains("..")
        && image_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

/// Opens slides by image id.
#[async_trait]
pub trait SlideSource: Send + Sync {
    /// The slide type this source opens.
    type Slide: SlideImage + 'static;

    /// Open the slide for `image_id`.
    async fn open(&self, image_id: &str) -> Result<Self::Slide, SlideError>;
}

/// Opens `{root}/{image_id}.{extension}` as a tiled TIFF slide.
#[derive(Debug, Clone)]
pub struct LocalSlideSource {
    root: PathBuf,
    extension: String,
    tile_cache_capacity: usize,
}

impl LocalSlideSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: DEFAULT_IMAGE_EXTENSION.to_string(),
            tile_cache_capacity: DEFAULT_TILE_CACHE_CAPACITY,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Number of decoded native tiles each opened slide keeps in memory.
    pub fn with_tile_cache_capacity(mut self, capacity: usize) -> Self {
        self.tile_cache_capacity = capacity;
        self
    }

    pub fn path_for(&self, image_id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", image_id, self.extension))
    }
}

#[async_trait]
impl SlideSource for LocalSlideSource {
    type Slide = TiffSlide<FileRangeReader>;

    async fn open(&self, image_id: &str) -> Result<Self::Slide, SlideError> {
        let reader = FileRangeReader::open(self.path_for(image_id)).await?;
        TiffSlide::open(reader, self.tile_cache_capacity).await
    }
}

/// Explicit table of open slides, keyed by image id.
pub struct SlideRegistry<S: SlideSource> {
    source: S,

    /// Open slides, never evicted
    slides: RwLock<HashMap<String, Arc<S::Slide>>>,

    /// In-flight opens for singleflight pattern
    in_flight: Mutex<HashMap<String, Arc<InFlightState<S::Slide>>>>,
}

/// State for an in-flight slide open operation.
struct InFlightState<T> {
    notify: Notify,
    result: Mutex<Option<Result<Arc<T>, SlideError>>>,
}

impl<S: SlideSource> SlideRegistry<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            slides: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Get a slide, opening it on first access.
    ///
    /// Failed opens are not remembered; the next call retries.
    pub async fn get_slide(&self, image_id: &str) -> Result<Arc<S::Slide>, SlideError> {
        if let Some(slide) = self.slides.read().await.get(image_id) {
            return Ok(slide.clone());
        }

        loop {
            let state = {
                let mut in_flight = self.in_flight.lock().await;

                if let Some(state) = in_flight.get(image_id) {
                    state.clone()
                } else {
                    // Another task may have finished between the fast path and here
                    if let Some(slide) = self.slides.read().await.get(image_id) {
                        return Ok(slide.clone());
                    }

                    let state = Arc::new(InFlightState {
                        notify: Notify::new(),
                        result: Mutex::new(None),
                    });
                    in_flight.insert(image_id.to_string(), state.clone());
                    drop(in_flight);

                    let result = self.source.open(image_id).await.map(Arc::new);
                    match &result {
                        Ok(slide) => {
                            info!(
                                image_id,
                                levels = slide.level_count(),
                                dimensions = ?slide.dimensions(),
                                "Opened slide"
                            );
                            self.slides
                                .write()
                                .await
                                .insert(image_id.to_string(), slide.clone());
                        }
                        Err(e) => debug!(image_id, error = %e, "Slide open failed"),
                    }

                    *state.result.lock().await = Some(result.clone());
                    self.in_flight.lock().await.remove(image_id);
                    state.notify.notify_waiters();

                    return result;
                }
            };

            let notified = state.notify.notified();
            let finished = state.result.lock().await.clone();
            if let Some(result) = finished {
                return result;
            }
            notified.await;

            let finished = state.result.lock().await.clone();
            if let Some(result) = finished {
                return result;
            }
        }
    }

    /// Number of open slides.
    pub async fn open_count(&self) -> usize {
        self.slides.read().await.len()
    }
}
