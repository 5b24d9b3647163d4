//! JPEG-compressed chunk handling.
//!
//! TIFF writers often store JPEG chunks as *abbreviated streams*: each chunk
//! lacks the quantization (DQT) and Huffman (DHT) tables, which are stored once
//! in the `JPEGTables` tag. Before decoding, the tables are spliced in:
//!
//! ```text
//! tables: SOI DQT DHT ... EOI
//! chunk:  SOI SOF SOS <scan> EOI
//! merged: SOI DQT DHT ... SOF SOS <scan> EOI
//! ```

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use image::{ImageFormat, ImageReader, Limits, RgbImage};

/// Start Of Image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End Of Image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Define Huffman Table marker
pub const DHT: [u8; 2] = [0xFF, 0xC4];

/// Define Quantization Table marker
pub const DQT: [u8; 2] = [0xFF, 0xDB];

/// Start Of Scan marker
pub const SOS: [u8; 2] = [0xFF, 0xDA];

/// Whether `data` reaches SOS without defining any table first.
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
        let marker = [data[pos], data[pos + 1]];
        if marker == DQT || marker == DHT {
            return false;
        }
        if marker == SOS {
            return true;
        }

        // Skip marker segment (marker + 2-byte length + payload)
        if pos + 3 < data.len() && marker[1] != 0x00 && marker[1] != 0xD8 && marker[1] != 0xD9 {
            let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 2 + length;
        } else {
            pos += 2;
        }
    }

    false
}

/// Splice shared tables into an abbreviated chunk.
///
/// The trailing EOI of `tables` and the leading SOI of `chunk` are dropped.
pub fn merge_jpeg_tables(tables: &[u8], chunk: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(chunk);
    }
    if chunk.is_empty() {
        return Bytes::new();
    }

    let tables_end = if tables.len() >= 2 && tables[tables.len() - 2..] == EOI {
        tables.len() - 2
    } else {
        tables.len()
    };
    let chunk_start = if chunk.len() >= 2 && chunk[0..2] == SOI {
        2
    } else {
        0
    };

    let mut merged = BytesMut::with_capacity(tables_end + chunk.len() - chunk_start);
    merged.extend_from_slice(&tables[..tables_end]);
    merged.extend_from_slice(&chunk[chunk_start..]);
    merged.freeze()
}

/// Complete stream for a chunk, merging tables only when the chunk needs them.
pub fn prepare_chunk_jpeg(tables: Option<&[u8]>, chunk: &[u8]) -> Bytes {
    match tables {
        Some(tables) if is_abbreviated_stream(chunk) => merge_jpeg_tables(tables, chunk),
        _ => Bytes::copy_from_slice(chunk),
    }
}

/// Decode a complete JPEG stream under an allocation ceiling.
pub fn decode_jpeg(data: &[u8], max_alloc: u64) -> Result<RgbImage, image::ImageError> {
    let mut reader = ImageReader::with_format(Cursor::new(data), ImageFormat::Jpeg);
    let mut limits = Limits::default();
    limits.max_alloc = Some(max_alloc);
    reader.limits(limits);
    Ok(reader.decode()?.into_rgb8())
}

// =============================================================================
// Tests
// =============================================================================
