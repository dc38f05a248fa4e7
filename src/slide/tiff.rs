//! Minimal TIFF / BigTIFF container reader.
//!
//! Only what a tiled pyramidal slide needs: the header, the IFD chain, and
//! integer or byte tag values. Values are fetched through a [`RangeReader`],
//! so large arrays (tile offsets) cost one range read each.
//!
//! # Header layout
//!
//! ```text
//! Classic TIFF (8 bytes):  II|MM, 42, u32 first IFD offset
//! BigTIFF (16 bytes):      II|MM, 43, u16 offset size (8), u16 reserved, u64 first IFD offset
//! ```

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

/// Magic bytes indicating little-endian byte order ("II")
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM")
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

const VERSION_TIFF: u16 = 42;
const VERSION_BIGTIFF: u16 = 43;

pub const TIFF_HEADER_SIZE: usize = 8;
pub const BIGTIFF_HEADER_SIZE: usize = 16;

/// Upper bound on entries in one IFD; real slides have a few dozen.
const MAX_IFD_ENTRIES: u64 = 4096;

/// Tag identifiers used by the slide reader.
pub mod tags {
    pub const IMAGE_WIDTH: u16 = 256;
    pub const IMAGE_LENGTH: u16 = 257;
    pub const COMPRESSION: u16 = 259;
    pub const IMAGE_DESCRIPTION: u16 = 270;
    pub const STRIP_OFFSETS: u16 = 273;
    pub const ROWS_PER_STRIP: u16 = 278;
    pub const STRIP_BYTE_COUNTS: u16 = 279;
    pub const TILE_WIDTH: u16 = 322;
    pub const TILE_LENGTH: u16 = 323;
    pub const TILE_OFFSETS: u16 = 324;
    pub const TILE_BYTE_COUNTS: u16 = 325;
    pub const JPEG_TABLES: u16 = 347;
}

/// Compression value for "new style" JPEG.
pub const COMPRESSION_JPEG: u64 = 7;

/// Byte order (endianness) of a TIFF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(raw),
            ByteOrder::BigEndian => u16::from_be_bytes(raw),
        }
    }

    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::LittleEndian => u32::from_le_bytes(raw),
            ByteOrder::BigEndian => u32::from_be_bytes(raw),
        }
    }

    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        match self {
            ByteOrder::LittleEndian => u64::from_le_bytes(raw),
            ByteOrder::BigEndian => u64::from_be_bytes(raw),
        }
    }
}

/// Parsed TIFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    pub byte_order: ByteOrder,
    pub is_bigtiff: bool,
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a header from the first bytes of a file.
    ///
    /// `bytes` should hold 16 bytes when available so BigTIFF can be read.
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        let (is_bigtiff, first_ifd_offset) = match version {
            VERSION_TIFF => (false, byte_order.read_u32(&bytes[4..8]) as u64),
            VERSION_BIGTIFF => {
                if bytes.len() < BIGTIFF_HEADER_SIZE {
                    return Err(TiffError::FileTooSmall {
                        required: BIGTIFF_HEADER_SIZE as u64,
                        actual: bytes.len() as u64,
                    });
                }
                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(TiffError::InvalidBigTiffOffsetSize(offset_size));
                }
                (true, byte_order.read_u64(&bytes[8..16]))
            }
            _ => return Err(TiffError::InvalidVersion(version)),
        };

        if first_ifd_offset >= file_size {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(TiffHeader {
            byte_order,
            is_bigtiff,
            first_ifd_offset,
        })
    }

    /// 12 bytes for classic TIFF, 20 for BigTIFF.
    #[inline]
    pub const fn ifd_entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    #[inline]
    pub const fn ifd_count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    /// Width of the value/offset field, which is also the inline threshold.
    #[inline]
    pub const fn value_offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }
}

/// Size in bytes of one value of a TIFF field type.
fn field_type_size(field_type: u16) -> Option<usize> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8 => Some(2),
        4 | 9 | 11 | 13 => Some(4),
        5 | 10 | 12 | 16 | 17 | 18 => Some(8),
        _ => None,
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u64,
    /// Raw value/offset field, left-aligned (4 or 8 meaningful bytes)
    pub value: [u8; 8],
}

impl IfdEntry {
    fn byte_len(&self) -> Result<u64, TiffError> {
        let size = field_type_size(self.field_type)
            .ok_or(TiffError::UnknownFieldType(self.field_type))?;
        (size as u64)
            .checked_mul(self.count)
            .ok_or(TiffError::InvalidTagValue {
                tag: "entry",
                message: format!("count {} overflows", self.count),
            })
    }
}

/// An image file directory.
#[derive(Debug, Clone)]
pub struct Ifd {
    pub entries: Vec<IfdEntry>,
    pub next_offset: u64,
}

impl Ifd {
    pub fn get(&self, tag: u16) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag == tag)
    }
}

/// Read the IFD at `offset`.
pub async fn read_ifd<R: RangeReader + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    offset: u64,
) -> Result<Ifd, TiffError> {
    let size = reader.size();
    let count_size = header.ifd_count_size();
    if offset.saturating_add(count_size as u64) > size {
        return Err(TiffError::InvalidIfdOffset(offset));
    }

    let order = header.byte_order;
    let count_bytes = reader.read_exact_at(offset, count_size).await?;
    let entry_count = if header.is_bigtiff {
        order.read_u64(&count_bytes)
    } else {
        order.read_u16(&count_bytes) as u64
    };
    if entry_count > MAX_IFD_ENTRIES {
        return Err(TiffError::InvalidTagValue {
            tag: "IFD",
            message: format!("{} entries at offset {}", entry_count, offset),
        });
    }

    let entry_size = header.ifd_entry_size();
    let next_size = header.value_offset_size();
    let body_len = entry_count as usize * entry_size + next_size;
    let body = reader
        .read_exact_at(offset + count_size as u64, body_len)
        .await?;

    let mut entries = Vec::with_capacity(entry_count as usize);
    for chunk in body[..entry_count as usize * entry_size].chunks_exact(entry_size) {
        let tag = order.read_u16(&chunk[0..2]);
        let field_type = order.read_u16(&chunk[2..4]);
        let (count, raw) = if header.is_bigtiff {
            (order.read_u64(&chunk[4..12]), &chunk[12..20])
        } else {
            (order.read_u32(&chunk[4..8]) as u64, &chunk[8..12])
        };
        let mut value = [0u8; 8];
        value[..raw.len()].copy_from_slice(raw);
        entries.push(IfdEntry {
            tag,
            field_type,
            count,
            value,
        });
    }

    let next_raw = &body[entry_count as usize * entry_size..];
    let next_offset = if header.is_bigtiff {
        order.read_u64(next_raw)
    } else {
        order.read_u32(next_raw) as u64
    };

    Ok(Ifd {
        entries,
        next_offset,
    })
}

/// Raw bytes of an entry's value, inline or fetched from its offset.
pub async fn read_bytes<R: RangeReader + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    entry: &IfdEntry,
) -> Result<Bytes, TiffError> {
    let len = entry.byte_len()?;
    if len <= header.value_offset_size() as u64 {
        return Ok(Bytes::copy_from_slice(&entry.value[..len as usize]));
    }

    let offset = if header.is_bigtiff {
        header.byte_order.read_u64(&entry.value)
    } else {
        header.byte_order.read_u32(&entry.value) as u64
    };
    Ok(reader.read_exact_at(offset, len as usize).await?)
}

/// Unsigned integer values of a SHORT, LONG or LONG8 entry.
pub async fn read_unsigned<R: RangeReader + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    entry: &IfdEntry,
) -> Result<Vec<u64>, TiffError> {
    let order = header.byte_order;
    let width = match entry.field_type {
        3 => 2,
        4 => 4,
        16 => 8,
        other => {
            return Err(TiffError::InvalidTagValue {
                tag: "integer",
                message: format!("tag {} has field type {}", entry.tag, other),
            })
        }
    };

    let bytes = read_bytes(reader, header, entry).await?;
    Ok(bytes
        .chunks_exact(width)
        .map(|chunk| match width {
            2 => order.read_u16(chunk) as u64,
            4 => order.read_u32(chunk) as u64,
            _ => order.read_u64(chunk),
        })
        .collect())
}

/// Text of an ASCII entry, without the trailing NULs.
pub async fn read_ascii<R: RangeReader + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    entry: &IfdEntry,
) -> Result<String, TiffError> {
    let bytes = read_bytes(reader, header, entry).await?;
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// First value of an integer entry.
pub async fn read_scalar<R: RangeReader + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    entry: &IfdEntry,
) -> Result<u64, TiffError> {
    read_unsigned(reader, header, entry)
        .await?
        .first()
        .copied()
        .ok_or(TiffError::InvalidTagValue {
            tag: "integer",
            message: format!("tag {} has no values", entry.tag),
        })
}
