use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheError;

/// Size and modification time of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub modified: SystemTime,
}

/// Blob storage backing the tile cache.
///
/// Keys are `/`-separated relative paths. `put` overwrites and must refresh
/// the modification time.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Metadata of `key`, or `None` if it does not exist.
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, CacheError>;

    async fn get(&self, key: &str) -> Result<Bytes, CacheError>;

    async fn put(&self, key: &str, data: Bytes) -> Result<(), CacheError>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

// =============================================================================
// Filesystem store
// =============================================================================

/// Stores objects as files under a root directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a partial tile.
#[derive(Debug)]
pub struct FsTileStore {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl FsTileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn io_error(key: &str, err: std::io::Error) -> CacheError {
        CacheError::Io {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl TileStore for FsTileStore {
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, CacheError> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| Self::io_error(key, e))?;
                Ok(Some(ObjectMeta {
                    size: meta.len(),
                    modified,
                }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CacheError::NotFound(key.to_string())),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), CacheError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error(key, e))?;
        }

        let suffix = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(format!(".tmp-{}-{}", std::process::id(), suffix));
        let temp_path = path.with_file_name(temp_name);

        if let Err(e) = tokio::fs::write(&temp_path, &data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Self::io_error(key, e));
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Self::io_error(key, e));
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Keeps objects in a map. Every `put` gets a strictly later timestamp than
/// the previous one, so ordering checks behave even on coarse clocks.
#[derive(Debug, Default)]
pub struct MemoryTileStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: HashMap<String, (Bytes, SystemTime)>,
    last_modified: Option<SystemTime>,
    puts: u64,
    stats: u64,
    gets: u64,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of `put` calls, including overwrites.
    pub fn put_count(&self) -> u64 {
        self.lock().puts
    }

    /// Total number of `stat` calls.
    pub fn stat_count(&self) -> u64 {
        self.lock().stats
    }

    /// Total number of `get` calls, including misses.
    pub fn get_count(&self) -> u64 {
        self.lock().gets
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // Nothing panics while holding the lock
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TileStore for MemoryTileStore {
    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, CacheError> {
        let mut inner = self.lock();
        inner.stats += 1;
        Ok(inner.objects.get(key).map(|(data, modified)| ObjectMeta {
            size: data.len() as u64,
            modified: *modified,
        }))
    }

    async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        let mut inner = self.lock();
        inner.gets += 1;
        inner
            .objects
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), CacheError> {
        let mut inner = self.lock();
        let mut modified = SystemTime::now();
        if let Some(last) = inner.last_modified {
            if modified <= last {
                modified = last + Duration::from_micros(1);
            }
        }
        inner.last_modified = Some(modified);
        inner.puts += 1;
        inner.objects.insert(key.to_string(), (data, modified));
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
