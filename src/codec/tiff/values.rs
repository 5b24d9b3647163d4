//! Reading IFD values and raw byte ranges from a source file.
//!
//! Values that fit in the entry's value field are decoded from the entry
//! itself. Larger values (tile offset arrays, JPEG tables) are fetched from
//! the file with a single positioned read each.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use crate::error::TiffError;

use super::parser::{ByteOrder, IfdEntry, TiffHeader};
use super::tags::FieldType;

// =============================================================================
// Source File
// =============================================================================

/// A source file read by byte range.
///
/// Positioned reads share one handle, so the cursor is guarded.
pub struct SourceFile {
    file: Mutex<File>,
    size: u64,
}

impl SourceFile {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Ranges that extend past the end of the file are rejected before any
    /// buffer is allocated.
    pub fn read_exact_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, TiffError> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.size) {
            return Err(TiffError::FileTooSmall {
                required: offset.saturating_add(len as u64),
                actual: self.size,
            });
        }

        let mut buf = vec![0u8; len];
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read up to `len` bytes at `offset`, truncated at end of file.
    pub fn read_prefix(&self, offset: u64, len: usize) -> Result<Vec<u8>, TiffError> {
        let available = self.size.saturating_sub(offset).min(len as u64) as usize;
        self.read_exact_at(offset, available)
    }
}

// =============================================================================
// Value Reader
// =============================================================================

/// Reads IFD entry values, fetching out-of-line values from the file.
pub struct ValueReader<'a> {
    source: &'a SourceFile,
    header: &'a TiffHeader,
}

impl<'a> ValueReader<'a> {
    pub fn new(source: &'a SourceFile, header: &'a TiffHeader) -> Self {
        Self { source, header }
    }

    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Raw bytes of an entry's value, from the entry or from the file.
    pub fn read_bytes(&self, entry: &IfdEntry) -> Result<Vec<u8>, TiffError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;
        let len = usize::try_from(size).map_err(|_| TiffError::InvalidTagValue {
            tag: "unknown",
            message: format!("value of {} bytes", size),
        })?;

        if entry.is_inline {
            Ok(entry.value_offset_bytes[..len].to_vec())
        } else {
            self.source.read_exact_at(entry.value_offset(self.header), len)
        }
    }

    /// Single Short/Long/Long8 value.
    pub fn read_u64(&self, entry: &IfdEntry) -> Result<u64, TiffError> {
        if let Some(value) = entry.inline_u64(self.header.byte_order) {
            return Ok(value);
        }
        self.read_u64_array(entry)?
            .first()
            .copied()
            .ok_or_else(|| TiffError::InvalidTagValue {
                tag: "unknown",
                message: "empty value".to_string(),
            })
    }

    /// Array of Short/Long/Long8 values, the layout of TileOffsets and
    /// StripByteCounts alike.
    pub fn read_u64_array(&self, entry: &IfdEntry) -> Result<Vec<u64>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;
        if !matches!(
            field_type,
            FieldType::Short | FieldType::Long | FieldType::Long8
        ) {
            return Err(TiffError::InvalidTagValue {
                tag: "unknown",
                message: format!("expected Short, Long, or Long8, got {:?}", field_type),
            });
        }

        let bytes = self.read_bytes(entry)?;
        Ok(parse_u64_array(
            &bytes,
            entry.count as usize,
            field_type,
            self.header.byte_order,
        ))
    }
}

/// Parse an array of integers from raw bytes.
///
/// Trailing elements that do not fit in `bytes` are dropped.
pub fn parse_u64_array(
    bytes: &[u8],
    count: usize,
    field_type: FieldType,
    byte_order: ByteOrder,
) -> Vec<u64> {
    let width = field_type.size_in_bytes();
    bytes
        .chunks_exact(width)
        .take(count)
        .filter_map(|raw| match field_type {
            FieldType::Byte => Some(raw[0] as u64),
            FieldType::Short => Some(byte_order.read_u16(raw) as u64),
            FieldType::Long => Some(byte_order.read_u32(raw) as u64),
            FieldType::Long8 => Some(byte_order.read_u64(raw)),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
