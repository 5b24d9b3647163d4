//! Windowed TIFF reading.
//!
//! Tiled and striped TIFF files are read chunk by chunk: the header, IFDs and
//! chunk offset arrays are parsed once, then any region is served by reading
//! and decoding only the chunks it intersects. Overviews are built from the
//! coarsest stored level that covers the requested size.
//!
//! Supported chunk encodings: 8-bit samples, chunky planar configuration,
//! uncompressed or JPEG (with or without shared JPEGTables), in grayscale,
//! RGB(A) or JPEG YCbCr. Other encodings fall back to a full decode.

mod jpeg;
mod layout;
mod parser;
mod tags;
mod values;
mod window;

pub use jpeg::{merge_jpeg_tables, prepare_chunk_jpeg};
pub use layout::{TiffLayout, TiffLevel};
pub use parser::{has_tiff_signature, ByteOrder, Ifd, IfdEntry, TiffHeader, BIGTIFF_HEADER_SIZE};
pub use tags::{Compression, FieldType, Photometric, TiffTag};
pub use values::{SourceFile, ValueReader};
pub use window::TiffWindow;
