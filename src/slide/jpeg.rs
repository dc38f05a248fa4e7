//! Abbreviated JPEG stream handling.
//!
//! Aperio SVS tiles omit their quantization and Huffman tables; the tables
//! live once in the IFD's `JPEGTables` tag. A decodable stream is the tables
//! minus their EOI, followed by the tile minus its SOI.

use bytes::{Bytes, BytesMut};

pub const SOI: [u8; 2] = [0xFF, 0xD8];
pub const EOI: [u8; 2] = [0xFF, 0xD9];
const DHT: u8 = 0xC4;
const DQT: u8 = 0xDB;
const SOS: u8 = 0xDA;

/// Whether a stream reaches its first scan without defining any tables.
pub fn is_abbreviated_stream(data: &[u8]) -> bool {
    if data.len() < 4 || data[0..2] != SOI {
        return false;
    }

    let mut pos = 2;
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }
        match data[pos + 1] {
            DQT | DHT => return false,
            SOS => return true,
            0x00 | 0xD8 | 0xD9 | 0xFF => pos += 2,
            _ if pos + 3 < data.len() => {
                let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
                pos += 2 + length;
            }
            _ => return false,
        }
    }

    false
}

/// Concatenate shared tables with an abbreviated tile.
pub fn merge_jpeg_tables(tables: &[u8], tile: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(tile);
    }
    if tile.is_empty() {
        return Bytes::new();
    }

    let tables = tables.strip_suffix(&EOI[..]).unwrap_or(tables);
    let tile = tile.strip_prefix(&SOI[..]).unwrap_or(tile);

    let mut merged = BytesMut::with_capacity(tables.len() + tile.len());
    merged.extend_from_slice(tables);
    merged.extend_from_slice(tile);
    merged.freeze()
}

/// Produce a complete JPEG stream for a raw tile.
pub fn prepare_tile_jpeg(tables: Option<&[u8]>, tile: Bytes) -> Bytes {
    match tables {
        Some(tables) if is_abbreviated_stream(&tile) => merge_jpeg_tables(tables, &tile),
        _ => tile,
    }
}
