//! Persistent tile cache.
//!
//! ```text
//! TileCache ── descriptor lookup / tile validity
//!     │
//!     ├── CacheWriter (bounded queue, background puts)
//!     │
//!     └── dyn TileStore
//!           ├── FsTileStore      local directory
//!           ├── S3TileStore      bucket + prefix
//!           └── MemoryTileStore  tests and one-off runs
//! ```
//!
//! Tiles have no TTL and are never evicted. They stay valid until the
//! image's descriptor is rewritten.

mod s3_store;
mod store;
mod tile_cache;
mod writer;

pub use s3_store::{create_s3_client, S3TileStore};
pub use store::{FsTileStore, MemoryTileStore, ObjectMeta, TileStore};
pub use tile_cache::{
    descriptor_key, DescriptorLookup, StoredDescriptor, TileCache, TileKey, TileStatus,
};
pub use writer::{CacheWriter, Watermark, DEFAULT_WRITE_CONCURRENCY, DEFAULT_WRITE_QUEUE};
