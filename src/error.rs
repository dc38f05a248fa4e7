use thiserror::Error;

/// I/O errors that can occur when reading source files by byte range
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Local filesystem error
    #[error("I/O error: {0}")]
    Local(String),

    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Errors that can occur when parsing TIFF containers
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),

    /// No tiled JPEG level usable as a pyramid level was found
    #[error("No tiled pyramid levels found")]
    NoPyramidLevels,
}

/// Errors raised by the source image accessor.
#[derive(Debug, Clone, Error)]
pub enum SlideError {
    /// I/O error while opening or reading the slide
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// The container could not be parsed
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// Native level does not exist
    #[error("Invalid native level {level}: slide has {level_count} levels")]
    InvalidLevel { level: usize, level_count: usize },

    /// Region has zero area
    #[error("Invalid region {width}x{height} at ({x0}, {y0})")]
    InvalidRegion {
        x0: u64,
        y0: u64,
        width: u32,
        height: u32,
    },

    /// A native tile could not be decoded
    #[error("Failed to decode native tile: {message}")]
    Decode { message: String },
}

impl SlideError {
    /// Whether the slide file simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SlideError::Io(IoError::NotFound(_))
                | SlideError::Tiff(TiffError::Io(IoError::NotFound(_)))
        )
    }
}

/// A tile or level address outside the pyramid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Invalid level {level}: pyramid has {level_count} levels")]
    InvalidLevel { level: usize, level_count: usize },

    #[error("Tile ({col}, {row}) out of bounds at level {level}: level has {cols}x{rows} tiles")]
    OutOfBounds {
        level: usize,
        col: u32,
        row: u32,
        cols: u32,
        rows: u32,
    },
}

/// A stored pyramid descriptor that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("Malformed descriptor XML: {0}")]
    Xml(String),

    #[error("Descriptor is missing {0}")]
    MissingField(&'static str),

    #[error("Descriptor field {field} has invalid value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Tile cache storage failures.
///
/// These never fail an interactive tile request: reads fall back to
/// recomputation and writes are logged by the background writer. Batch
/// generation fails when the descriptor cannot be stored.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Cache object not found: {0}")]
    NotFound(String),

    #[error("Cache I/O error on {key}: {message}")]
    Io { key: String, message: String },

    #[error("Cache S3 error on {key}: {message}")]
    S3 { key: String, message: String },
}

/// Failure to enqueue a fan-out work unit.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Work queue is closed")]
    Closed,

    #[error("Work unit rejected: {0}")]
    Rejected(String),
}

/// Errors surfaced by the tile generator to its callers.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// Image identifier contains characters outside the allowed set
    #[error("Invalid image id: {0:?}")]
    InvalidImageId(String),

    /// Tile address outside the pyramid
    #[error("Bad address for image {image_id}: {source}")]
    BadAddress {
        image_id: String,
        #[source]
        source: AddressError,
    },

    /// Encoding other than jpeg or png
    #[error("Unsupported encoding: {encoding} (expected jpeg or png)")]
    UnsupportedEncoding { encoding: String },

    /// Descriptor parameters out of range
    #[error("Invalid descriptor: {message}")]
    InvalidDescriptor { message: String },

    /// Malformed IIIF region, size, rotation or quality
    #[error("Invalid region request: {message}")]
    InvalidRegion { message: String },

    /// Slide missing or corrupt
    #[error("Failed to open image {image_id}: {source}")]
    SourceOpen {
        image_id: String,
        #[source]
        source: SlideError,
    },

    /// Pixel read failed for a valid address
    #[error("Failed to read image {image_id} at {address}: {source}")]
    SourceRead {
        image_id: String,
        /// Tile address or region, for reproduction
        address: String,
        #[source]
        source: SlideError,
    },

    /// Encoder failure
    #[error("Failed to encode tile: {message}")]
    Encode { message: String },

    /// The slide has no associated image by this name
    #[error("Image {image_id} has no associated image {name:?}")]
    AssociatedImageNotFound { image_id: String, name: String },

    /// The descriptor could not be persisted, so nothing generated now
    /// could later be served from cache
    #[error("Tile cache unavailable for image {image_id}: {source}")]
    Cache {
        image_id: String,
        #[source]
        source: CacheError,
    },
}

/// Errors from executing a fan-out work unit.
#[derive(Debug, Clone, Error)]
pub enum FanoutError {
    #[error(transparent)]
    Tile(#[from] TileError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
