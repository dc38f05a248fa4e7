use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, warn};

use super::store::{ObjectMeta, TileStore};
use super::writer::{CacheWriter, Watermark};
use crate::error::CacheError;
use crate::pyramid::{DziDocument, TileEncoding};

/// Cache location of one tile: `{image_id}/{level}/{col}_{row}.{ext}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub image_id: String,
    pub level: usize,
    pub col: u32,
    pub row: u32,
    pub encoding: TileEncoding,
}

impl TileKey {
    pub fn new(image_id: &str, level: usize, col: u32, row: u32, encoding: TileEncoding) -> Self {
        Self {
            image_id: image_id.to_string(),
            level,
            col,
            row,
            encoding,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}_{}.{}",
            self.image_id,
            self.level,
            self.col,
            self.row,
            self.encoding.as_str()
        )
    }
}

/// Cache key of an image's descriptor.
pub fn descriptor_key(image_id: &str) -> String {
    format!("{}.dzi", image_id)
}

/// A parsed descriptor and the time it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredDescriptor {
    pub document: DziDocument,
    pub modified: SystemTime,
}

/// Outcome of looking up a stored descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorLookup {
    Found(StoredDescriptor),
    Absent,
    /// Present but unusable; treated like absent by callers
    Invalid(String),
}

/// Whether a cached tile may be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    Valid,
    Missing,
    Empty,
    /// Older than the descriptor
    Stale,
}

impl TileStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, TileStatus::Valid)
    }
}

/// Persistent tile cache with descriptor-timestamp invalidation.
///
/// A tile is served from cache only if it was written no earlier than the
/// image's descriptor. Rewriting the descriptor therefore invalidates every
/// tile of the image without deleting anything.
#[derive(Clone)]
pub struct TileCache {
    store: Arc<dyn TileStore>,
    writer: CacheWriter,
}

impl TileCache {
    /// Must be called inside a tokio runtime; starts the background writer.
    pub fn new(store: Arc<dyn TileStore>, write_queue: usize, write_concurrency: usize) -> Self {
        let writer = CacheWriter::spawn(store.clone(), write_queue, write_concurrency);
        Self { store, writer }
    }

    pub fn store(&self) -> &Arc<dyn TileStore> {
        &self.store
    }

    pub fn writer(&self) -> &CacheWriter {
        &self.writer
    }

    pub async fn read_descriptor(&self, image_id: &str) -> DescriptorLookup {
        let key = descriptor_key(image_id);

        let meta = match self.store.stat(&key).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                debug!(image_id, "No stored descriptor");
                return DescriptorLookup::Absent;
            }
            Err(e) => {
                warn!(image_id, error = %e, "Descriptor stat failed");
                return DescriptorLookup::Invalid(e.to_string());
            }
        };

        let data = match self.store.get(&key).await {
            Ok(data) => data,
            Err(CacheError::NotFound(_)) => return DescriptorLookup::Absent,
            Err(e) => {
                warn!(image_id, error = %e, "Descriptor read failed");
                return DescriptorLookup::Invalid(e.to_string());
            }
        };

        let parsed = std::str::from_utf8(&data)
            .map_err(|e| e.to_string())
            .and_then(|xml| DziDocument::parse(xml).map_err(|e| e.to_string()));
        match parsed {
            Ok(document) => DescriptorLookup::Found(StoredDescriptor {
                document,
                modified: meta.modified,
            }),
            Err(reason) => {
                warn!(image_id, reason = %reason, "Stored descriptor is invalid");
                DescriptorLookup::Invalid(reason)
            }
        }
    }

    /// Persist a descriptor and return it with its new timestamp.
    pub async fn write_descriptor(
        &self,
        image_id: &str,
        document: &DziDocument,
    ) -> Result<StoredDescriptor, CacheError> {
        let key = descriptor_key(image_id);
        self.store
            .put(&key, Bytes::from(document.to_xml()))
            .await?;

        let modified = match self.store.stat(&key).await? {
            Some(ObjectMeta { modified, .. }) => modified,
            None => SystemTime::now(),
        };
        debug!(image_id, tile_size = document.descriptor.tile_size, "Descriptor written");
        Ok(StoredDescriptor {
            document: *document,
            modified,
        })
    }

    /// Validity of a tile against a descriptor timestamp. Stat failures
    /// count as missing.
    pub async fn tile_status(&self, key: &TileKey, watermark: SystemTime) -> TileStatus {
        match self.store.stat(&key.to_string()).await {
            Ok(Some(meta)) if meta.size == 0 => TileStatus::Empty,
            Ok(Some(meta)) if meta.modified < watermark => TileStatus::Stale,
            Ok(Some(_)) => TileStatus::Valid,
            Ok(None) => TileStatus::Missing,
            Err(e) => {
                debug!(key = %key, error = %e, "Tile stat failed");
                TileStatus::Missing
            }
        }
    }

    /// Key of a tile and whether the cached copy is valid, reading the
    /// descriptor timestamp from the store.
    pub async fn check_tile(
        &self,
        image_id: &str,
        level: usize,
        col: u32,
        row: u32,
        encoding: TileEncoding,
    ) -> (TileKey, bool) {
        let key = TileKey::new(image_id, level, col, row, encoding);
        let watermark = match self.store.stat(&descriptor_key(image_id)).await {
            Ok(Some(meta)) => meta.modified,
            _ => return (key, false),
        };
        let valid = self.tile_status(&key, watermark).await.is_valid();
        (key, valid)
    }

    pub async fn read_tile(&self, key: &TileKey) -> Result<Bytes, CacheError> {
        self.store.get(&key.to_string()).await
    }

    /// Fire-and-forget write. Dropped with a warning if the queue is full.
    ///
    /// `rendered_under` is the timestamp of the descriptor the tile was
    /// rendered with; the write is discarded once that descriptor has been
    /// replaced.
    pub fn write_tile(&self, key: &TileKey, data: Bytes, rendered_under: SystemTime) {
        self.writer
            .submit(key.to_string(), data, Some(tile_watermark(key, rendered_under)));
    }

    /// Write that waits for queue space instead of dropping.
    pub async fn write_tile_blocking(&self, key: &TileKey, data: Bytes, rendered_under: SystemTime) {
        self.writer
            .submit_wait(key.to_string(), data, Some(tile_watermark(key, rendered_under)))
            .await;
    }

    /// Cached copy of an object that does not depend on the descriptor,
    /// such as an associated image. Empty objects count as absent.
    pub async fn read_object(&self, key: &str) -> Option<Bytes> {
        match self.store.get(key).await {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => None,
            Err(e) => {
                if !matches!(e, CacheError::NotFound(_)) {
                    debug!(key, error = %e, "Cached object unreadable");
                }
                None
            }
        }
    }

    /// Fire-and-forget write of a descriptor-independent object.
    pub fn write_object(&self, key: &str, data: Bytes) {
        self.writer.submit(key.to_string(), data, None);
    }

    /// Wait for all submitted writes.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

fn tile_watermark(key: &TileKey, rendered_under: SystemTime) -> Watermark {
    Watermark::new(descriptor_key(&key.image_id), rendered_under)
}
