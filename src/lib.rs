//! Decoding of still WebP images.
//!
//! Supports simple (`VP8 `/`VP8L`) and extended (`VP8X`) files, including
//! alpha planes and metadata chunks. Animated files are recognized but not
//! decoded. All output is 8-bit non-premultiplied RGBA.
//!
//! ```no_run
//! use webp_decode::WebPDecoder;
//!
//! let file = std::fs::File::open("image.webp").unwrap();
//! let mut decoder = WebPDecoder::new(std::io::BufReader::new(file)).unwrap();
//! let (width, height) = decoder.dimensions();
//! let mut pixels = vec![0; decoder.output_buffer_size().unwrap()];
//! decoder.read_image(&mut pixels).unwrap();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![warn(clippy::all)]

mod decoder;
mod extended;
mod huffman;
mod loop_filter;
mod lossless;
mod lossless_transform;
mod metadata;
mod transform;
mod vp8;
mod vp8_arithmetic_decoder;

pub use self::decoder::{DecodingError, WebPDecoder};
pub use self::metadata::{MetadataIssue, UnknownChunk};
