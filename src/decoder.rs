//! RIFF container parsing and decode orchestration.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{self, BufReader, Read, Seek};
use std::ops::Range;
use thiserror::Error;

use crate::extended::{self, read_alpha_chunk, WebPExtendedInfo};
use crate::lossless::LosslessDecoder;
use crate::metadata::{self, MetadataIssue, UnknownChunk};
use crate::vp8::Vp8Decoder;

/// Errors that can occur when attempting to decode a WebP image
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DecodingError {
    /// An IO error occurred while reading the file
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),

    /// RIFF's "RIFF" signature not found or invalid
    #[error("Invalid RIFF signature: {0:x?}")]
    RiffSignatureInvalid([u8; 4]),

    /// WebP's "WEBP" signature not found or invalid
    #[error("Invalid WebP signature: {0:x?}")]
    WebpSignatureInvalid([u8; 4]),

    /// An expected chunk was missing
    #[error("An expected chunk was missing")]
    ChunkMissing,

    /// Chunk Header was incorrect or invalid in its usage
    #[error("Invalid Chunk header: {0:?}")]
    ChunkHeaderInvalid([u8; 4]),

    /// A chunk that may appear at most once was duplicated
    #[error("Duplicate chunk: {0:?}")]
    DuplicateChunk([u8; 4]),

    /// A chunk appeared at a position its type does not allow
    #[error("Chunk out of order: {0:?}")]
    ChunkOutOfOrder([u8; 4]),

    /// A VP8X feature flag and the corresponding chunk's presence disagree
    #[error("VP8X flag and chunk presence disagree for: {0:?}")]
    FlagChunkMismatch([u8; 4]),

    /// Some bits were invalid
    #[error("Invalid info bits: {name} {value}")]
    InfoBitsInvalid {
        /// Name of the field holding the bits
        name: &'static str,
        /// The invalid bits
        value: u32,
    },

    /// Alpha chunk doesn't match the frame's size
    #[error("Alpha chunk size mismatch")]
    AlphaChunkSizeMismatch,

    /// Image is too large, either for the platform's pointer size or generally
    #[error("Image too large")]
    ImageTooLarge,

    /// Signature of 0x2f not found
    #[error("Invalid lossless signature: {0:x?}")]
    LosslessSignatureInvalid(u8),

    /// Version Number was not zero
    #[error("Invalid lossless version number: {0}")]
    VersionNumberInvalid(u8),

    /// The color cache size was out of range
    #[error("Invalid color cache bits: {0}")]
    InvalidColorCacheBits(u8),

    /// An invalid Huffman code was encountered
    #[error("Invalid Huffman code")]
    HuffmanError,

    /// The bitstream was somehow corrupt
    #[error("Corrupt bitstream")]
    BitStreamError,

    /// The transforms specified were invalid
    #[error("Invalid transform")]
    TransformError,

    /// VP8's `[0x9D, 0x01, 0x2A]` magic not found or invalid
    #[error("Invalid VP8 magic: {0:x?}")]
    Vp8MagicInvalid([u8; 3]),

    /// VP8 Decoder initialisation wasn't provided with enough data
    #[error("Not enough VP8 init data")]
    NotEnoughInitData,

    /// At time of writing, only the YUV colour-space encoded as `0` is specified
    #[error("Invalid VP8 color space: {0}")]
    ColorSpaceInvalid(u8),

    /// LUMA prediction mode was not recognised
    #[error("Invalid VP8 luma prediction mode: {0}")]
    LumaPredictionModeInvalid(i8),

    /// Intra-prediction mode was not recognised
    #[error("Invalid VP8 intra prediction mode: {0}")]
    IntraPredictionModeInvalid(i8),

    /// Chroma prediction mode was not recognised
    #[error("Invalid VP8 chroma prediction mode: {0}")]
    ChromaPredictionModeInvalid(i8),

    /// Inconsistent image sizes
    #[error("Inconsistent image sizes")]
    InconsistentImageSizes,

    /// The file may be valid, but this crate doesn't support decoding it.
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Memory limit exceeded
    #[error("Memory limit exceeded")]
    MemoryLimitExceeded,

    /// A declared chunk size overflowed the file
    #[error("Invalid chunk size")]
    InvalidChunkSize,
}

/// All possible RIFF chunks in a WebP image file
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Hash, Eq)]
pub(crate) enum WebPRiffChunk {
    RIFF,
    WEBP,
    VP8,
    VP8L,
    VP8X,
    ANIM,
    ANMF,
    ALPH,
    ICCP,
    EXIF,
    XMP,
    META,
    Unknown([u8; 4]),
}

impl WebPRiffChunk {
    pub(crate) fn from_fourcc(chunk_fourcc: [u8; 4]) -> Self {
        match &chunk_fourcc {
            b"RIFF" => Self::RIFF,
            b"WEBP" => Self::WEBP,
            b"VP8 " => Self::VP8,
            b"VP8L" => Self::VP8L,
            b"VP8X" => Self::VP8X,
            b"ANIM" => Self::ANIM,
            b"ANMF" => Self::ANMF,
            b"ALPH" => Self::ALPH,
            b"ICCP" => Self::ICCP,
            b"EXIF" => Self::EXIF,
            b"XMP " => Self::XMP,
            b"META" => Self::META,
            _ => Self::Unknown(chunk_fourcc),
        }
    }

    pub(crate) fn to_fourcc(self) -> [u8; 4] {
        match self {
            Self::RIFF => *b"RIFF",
            Self::WEBP => *b"WEBP",
            Self::VP8 => *b"VP8 ",
            Self::VP8L => *b"VP8L",
            Self::VP8X => *b"VP8X",
            Self::ANIM => *b"ANIM",
            Self::ANMF => *b"ANMF",
            Self::ALPH => *b"ALPH",
            Self::ICCP => *b"ICCP",
            Self::EXIF => *b"EXIF",
            Self::XMP => *b"XMP ",
            Self::META => *b"META",
            Self::Unknown(fourcc) => fourcc,
        }
    }

    pub(crate) fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }

    /// Chunk types that may appear at most once per file.
    fn is_singleton(&self) -> bool {
        matches!(
            self,
            Self::VP8X | Self::ICCP | Self::EXIF | Self::XMP | Self::ANIM
        )
    }
}

enum ImageKind {
    Lossy,
    Lossless,
    Extended(WebPExtendedInfo),
}

/// WebP image format decoder.
///
/// Construction parses the RIFF container and validates the chunk layout;
/// [`read_image`](Self::read_image) runs the pixel decode. Output is
/// always non-premultiplied RGBA.
pub struct WebPDecoder<R> {
    r: R,
    memory_limit: usize,

    width: u32,
    height: u32,

    kind: ImageKind,
    is_lossy: bool,

    chunks: HashMap<WebPRiffChunk, Range<u64>>,
    unknown_chunks: Vec<([u8; 4], Range<u64>)>,
}

impl<R: Read + Seek> WebPDecoder<R> {
    /// Create a new WebPDecoder from the reader `r`. The decoder performs many small reads, so the
    /// reader should be buffered.
    pub fn new(r: R) -> Result<WebPDecoder<R>, DecodingError> {
        let mut decoder = WebPDecoder {
            r,
            width: 0,
            height: 0,
            kind: ImageKind::Lossy,
            chunks: HashMap::new(),
            unknown_chunks: Vec::new(),
            memory_limit: usize::MAX,
            is_lossy: false,
        };
        decoder.read_data()?;
        Ok(decoder)
    }

    fn read_data(&mut self) -> Result<(), DecodingError> {
        let file_len = self.r.seek(io::SeekFrom::End(0))?;
        self.r.seek(io::SeekFrom::Start(0))?;

        let mut riff = [0u8; 4];
        self.r.read_exact(&mut riff)?;
        if &riff != b"RIFF" {
            return Err(DecodingError::RiffSignatureInvalid(riff));
        }
        let riff_size = self.r.read_u32::<LittleEndian>()?;
        if u64::from(riff_size) + 8 > file_len {
            return Err(DecodingError::InvalidChunkSize);
        }

        let mut webp = [0u8; 4];
        self.r.read_exact(&mut webp)?;
        if &webp != b"WEBP" {
            return Err(DecodingError::WebpSignatureInvalid(webp));
        }

        self.walk_chunks(u64::from(riff_size) + 8)?;

        if let Some(range) = self.chunks.get(&WebPRiffChunk::VP8X).cloned() {
            if range.end - range.start != 10 {
                return Err(DecodingError::InvalidChunkSize);
            }
            let info = {
                let mut reader = range_reader(&mut self.r, range)?;
                extended::read_extended_header(&mut reader)?
            };
            self.width = info.canvas_width;
            self.height = info.canvas_height;
            self.reconcile_extended(&info)?;
            self.is_lossy = self.chunks.contains_key(&WebPRiffChunk::VP8);
            self.kind = ImageKind::Extended(info);
        } else {
            self.read_simple_header()?;
        }

        Ok(())
    }

    /// Enumerates every top-level chunk, recording ranges and enforcing
    /// the ordering, duplication, and size invariants of the container.
    fn walk_chunks(&mut self, riff_end: u64) -> Result<(), DecodingError> {
        let mut position = self.r.stream_position()?;

        // Resist denial of service attacks by using a BufReader. In most images there
        // should be a very small number of chunks. However, nothing prevents a malicious
        // image from having an extremely large number of "unknown" chunks. Issuing
        // millions of reads and seeks against the underlying reader might be very
        // expensive.
        let mut reader = BufReader::with_capacity(64 << 10, &mut self.r);

        while position + 8 <= riff_end {
            let (chunk, chunk_size, chunk_size_rounded) = match read_chunk_header(&mut reader) {
                Ok(header) => header,
                Err(DecodingError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => return Err(e),
            };

            let range = position + 8..position + 8 + u64::from(chunk_size);
            if range.end > riff_end {
                return Err(DecodingError::InvalidChunkSize);
            }
            log::trace!(
                "chunk {:?} at {position}, {chunk_size} bytes",
                chunk.to_fourcc()
            );

            if chunk.is_unknown() {
                self.unknown_chunks.push((chunk.to_fourcc(), range));
            } else {
                if chunk == WebPRiffChunk::VP8X && position != 12 {
                    return Err(DecodingError::ChunkOutOfOrder(chunk.to_fourcc()));
                }
                let duplicate = self.chunks.contains_key(&chunk);
                if duplicate
                    && (chunk.is_singleton()
                        || matches!(
                            chunk,
                            WebPRiffChunk::VP8 | WebPRiffChunk::VP8L | WebPRiffChunk::ALPH
                        ))
                {
                    return Err(DecodingError::DuplicateChunk(chunk.to_fourcc()));
                }
                self.chunks.entry(chunk).or_insert(range);
            }

            position += 8 + u64::from(chunk_size_rounded);
            reader.seek_relative(i64::from(chunk_size_rounded))?;
        }

        Ok(())
    }

    /// Checks that every VP8X feature flag has its chunk and every chunk
    /// its flag, and that exactly one primary stream is declared.
    fn reconcile_extended(&self, info: &WebPExtendedInfo) -> Result<(), DecodingError> {
        let present = |chunk: WebPRiffChunk| self.chunks.contains_key(&chunk);
        let reconcile = |flag: bool, chunk: WebPRiffChunk| {
            if flag == present(chunk) {
                Ok(())
            } else {
                Err(DecodingError::FlagChunkMismatch(chunk.to_fourcc()))
            }
        };

        reconcile(info.icc_profile, WebPRiffChunk::ICCP)?;
        reconcile(info.exif_metadata, WebPRiffChunk::EXIF)?;
        reconcile(info.xmp_metadata, WebPRiffChunk::XMP)?;
        reconcile(info.animation, WebPRiffChunk::ANIM)?;

        if info.animation {
            // Frame payloads hold the image data of animated files; they
            // are identified but never decoded.
            if !present(WebPRiffChunk::ANMF) {
                return Err(DecodingError::ChunkMissing);
            }
        } else {
            if present(WebPRiffChunk::ANMF) {
                return Err(DecodingError::FlagChunkMismatch(*b"ANMF"));
            }
            reconcile(info.alpha, WebPRiffChunk::ALPH)?;
            if present(WebPRiffChunk::VP8) == present(WebPRiffChunk::VP8L) {
                return Err(DecodingError::ChunkMissing);
            }
        }

        Ok(())
    }

    /// Simple WebP: exactly one primary stream, no ALPH, dimensions taken
    /// from the stream header itself.
    fn read_simple_header(&mut self) -> Result<(), DecodingError> {
        for disallowed in [
            WebPRiffChunk::ALPH,
            WebPRiffChunk::ANIM,
            WebPRiffChunk::ANMF,
        ] {
            if self.chunks.contains_key(&disallowed) {
                return Err(DecodingError::ChunkHeaderInvalid(disallowed.to_fourcc()));
            }
        }

        match (
            self.chunks.get(&WebPRiffChunk::VP8).cloned(),
            self.chunks.get(&WebPRiffChunk::VP8L).cloned(),
        ) {
            (Some(range), None) => {
                self.r.seek(io::SeekFrom::Start(range.start))?;

                let tag = self.r.read_u24::<LittleEndian>()?;
                let keyframe = tag & 1 == 0;
                if !keyframe {
                    return Err(DecodingError::UnsupportedFeature(
                        "Non-keyframe frames".to_owned(),
                    ));
                }

                let mut magic = [0u8; 3];
                self.r.read_exact(&mut magic)?;
                if magic != [0x9d, 0x01, 0x2a] {
                    return Err(DecodingError::Vp8MagicInvalid(magic));
                }

                let w = self.r.read_u16::<LittleEndian>()?;
                let h = self.r.read_u16::<LittleEndian>()?;
                self.width = u32::from(w & 0x3fff);
                self.height = u32::from(h & 0x3fff);
                self.kind = ImageKind::Lossy;
                self.is_lossy = true;
            }
            (None, Some(range)) => {
                self.r.seek(io::SeekFrom::Start(range.start))?;

                let signature = self.r.read_u8()?;
                if signature != 0x2f {
                    return Err(DecodingError::LosslessSignatureInvalid(signature));
                }

                let header = self.r.read_u32::<LittleEndian>()?;
                let version = header >> 29;
                if version != 0 {
                    return Err(DecodingError::VersionNumberInvalid(version as u8));
                }

                self.width = (header & 0x3fff) + 1;
                self.height = ((header >> 14) & 0x3fff) + 1;
                self.kind = ImageKind::Lossless;
            }
            _ => return Err(DecodingError::ChunkMissing),
        }

        Ok(())
    }

    /// Sets the maximum amount of memory that the decoder is allowed to allocate at once.
    pub fn set_memory_limit(&mut self, limit: usize) {
        self.memory_limit = limit;
    }

    /// Returns true if the image is animated. Animated files are
    /// recognized but their frames cannot be decoded by this crate.
    pub fn has_animation(&self) -> bool {
        match &self.kind {
            ImageKind::Lossy | ImageKind::Lossless => false,
            ImageKind::Extended(extended) => extended.animation,
        }
    }

    /// Returns whether the image has an alpha channel. The output buffer
    /// is RGBA either way; without one, alpha is constant 255.
    pub fn has_alpha(&self) -> bool {
        match &self.kind {
            ImageKind::Lossy => false,
            ImageKind::Lossless => true,
            ImageKind::Extended(extended) => extended.alpha,
        }
    }

    /// Returns whether the image is lossy.
    pub fn is_lossy(&self) -> bool {
        self.is_lossy
    }

    /// Returns the (width, height) of the image in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_chunk(
        &mut self,
        chunk: WebPRiffChunk,
        max_size: usize,
    ) -> Result<Option<Vec<u8>>, DecodingError> {
        match self.chunks.get(&chunk) {
            Some(range) => {
                let data = self.read_range(range.clone(), max_size)?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    fn read_range(
        &mut self,
        range: Range<u64>,
        max_size: usize,
    ) -> Result<Vec<u8>, DecodingError> {
        if range.end - range.start > max_size as u64 {
            return Err(DecodingError::MemoryLimitExceeded);
        }

        self.r.seek(io::SeekFrom::Start(range.start))?;
        let mut data = vec![0; (range.end - range.start) as usize];
        self.r.read_exact(&mut data)?;
        Ok(data)
    }

    /// Returns the raw bytes of the ICC profile, or None if there is no ICC profile.
    pub fn icc_profile(&mut self) -> Result<Option<Vec<u8>>, DecodingError> {
        self.read_chunk(WebPRiffChunk::ICCP, self.memory_limit)
    }

    /// Returns the raw bytes of the EXIF metadata, or None if there is no EXIF metadata.
    pub fn exif_metadata(&mut self) -> Result<Option<Vec<u8>>, DecodingError> {
        self.read_chunk(WebPRiffChunk::EXIF, self.memory_limit)
    }

    /// Returns the raw bytes of the XMP metadata, or None if there is no XMP metadata.
    pub fn xmp_metadata(&mut self) -> Result<Option<Vec<u8>>, DecodingError> {
        self.read_chunk(WebPRiffChunk::XMP, self.memory_limit)
    }

    /// Returns the chunks the decoder does not recognize, in file order.
    pub fn unknown_chunks(&mut self) -> Result<Vec<UnknownChunk>, DecodingError> {
        let ranges = self.unknown_chunks.clone();
        let mut chunks = Vec::with_capacity(ranges.len());
        for (fourcc, range) in ranges {
            let data = self.read_range(range, self.memory_limit)?;
            chunks.push(UnknownChunk { fourcc, data });
        }
        Ok(chunks)
    }

    /// Runs structural validation over the metadata chunks and returns
    /// the anomalies found. Anomalies never fail the pixel decode.
    pub fn validate_metadata(&mut self) -> Result<Vec<MetadataIssue>, DecodingError> {
        let mut issues = Vec::new();
        if let Some(icc) = self.icc_profile()? {
            metadata::validate_icc(&icc, &mut issues);
        }
        if let Some(exif) = self.exif_metadata()? {
            metadata::validate_exif(&exif, &mut issues);
        }
        if let Some(xmp) = self.xmp_metadata()? {
            metadata::validate_xmp(&xmp, &mut issues);
        }
        Ok(issues)
    }

    /// Returns the number of bytes required to store the decoded image:
    /// `width * height * 4`, or None on arithmetic overflow.
    pub fn output_buffer_size(&self) -> Option<usize> {
        let width = usize::try_from(self.width).ok()?;
        let height = usize::try_from(self.height).ok()?;
        width.checked_mul(height)?.checked_mul(4)
    }

    /// Decodes the image into `buf` as tightly packed RGBA.
    ///
    /// `buf` must be exactly [`output_buffer_size`](Self::output_buffer_size)
    /// bytes. No partial pixels are ever produced: any malformed stream
    /// fails the whole decode.
    pub fn read_image(&mut self, buf: &mut [u8]) -> Result<(), DecodingError> {
        assert_eq!(Some(buf.len()), self.output_buffer_size());

        if self.has_animation() {
            return Err(DecodingError::UnsupportedFeature(
                "Animation decoding".to_owned(),
            ));
        }
        if buf.len() > self.memory_limit {
            return Err(DecodingError::MemoryLimitExceeded);
        }

        if let Some(range) = self.chunks.get(&WebPRiffChunk::VP8L) {
            let mut decoder = LosslessDecoder::new(range_reader(&mut self.r, range.clone())?);
            let frame = decoder.decode_frame()?;
            if u32::from(frame.width) != self.width || u32::from(frame.height) != self.height {
                return Err(DecodingError::InconsistentImageSizes);
            }

            frame.fill_rgba(buf);
        } else {
            let range = self
                .chunks
                .get(&WebPRiffChunk::VP8)
                .ok_or(DecodingError::ChunkMissing)?
                .clone();
            let mut decoder = Vp8Decoder::new(range_reader(&mut self.r, range)?);
            let frame = decoder.decode_frame()?;
            if u32::from(frame.width) != self.width || u32::from(frame.height) != self.height {
                return Err(DecodingError::InconsistentImageSizes);
            }

            frame.fill_rgba(buf);
            drop(decoder);

            if self.has_alpha() {
                let range = self
                    .chunks
                    .get(&WebPRiffChunk::ALPH)
                    .ok_or(DecodingError::ChunkMissing)?
                    .clone();
                let width = self.width as u16;
                let height = self.height as u16;
                let alpha_chunk =
                    read_alpha_chunk(&mut range_reader(&mut self.r, range)?, width, height)?;

                // Non-premultiplied: only the alpha bytes change.
                for (alpha, pixel) in alpha_chunk.data.iter().zip(buf.chunks_exact_mut(4)) {
                    pixel[3] = *alpha;
                }
            }
        }

        Ok(())
    }
}

pub(crate) fn range_reader<R: Read + Seek>(
    mut r: R,
    range: Range<u64>,
) -> Result<impl Read, DecodingError> {
    r.seek(io::SeekFrom::Start(range.start))?;
    Ok(r.take(range.end - range.start))
}

pub(crate) fn read_fourcc<R: Read>(mut r: R) -> Result<WebPRiffChunk, DecodingError> {
    let mut chunk_fourcc = [0; 4];
    r.read_exact(&mut chunk_fourcc)?;
    Ok(WebPRiffChunk::from_fourcc(chunk_fourcc))
}

pub(crate) fn read_chunk_header<R: Read>(
    mut r: R,
) -> Result<(WebPRiffChunk, u32, u32), DecodingError> {
    let chunk = read_fourcc(&mut r)?;
    let chunk_size = r.read_u32::<LittleEndian>()?;
    let chunk_size_rounded = chunk_size.saturating_add(chunk_size & 1);
    Ok((chunk, chunk_size, chunk_size_rounded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn chunk(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(tag);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        if payload.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    fn webp_file(chunks: &[Vec<u8>]) -> Vec<u8> {
        let content_len: usize = 4 + chunks.iter().map(Vec::len).sum::<usize>();
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(content_len as u32).to_le_bytes());
        out.extend_from_slice(b"WEBP");
        for c in chunks {
            out.extend_from_slice(c);
        }
        out
    }

    // A VP8 keyframe whose partitions are all zero bits: flat gray pixels
    // with every header feature disabled.
    fn zero_vp8_payload(width: u16, height: u16) -> Vec<u8> {
        let first_partition = 10u32;
        let tag = (first_partition << 5) | 0x10;
        let mut data = vec![tag as u8, (tag >> 8) as u8, (tag >> 16) as u8];
        data.extend_from_slice(&[0x9d, 0x01, 0x2a]);
        data.extend_from_slice(&width.to_le_bytes());
        data.extend_from_slice(&height.to_le_bytes());
        data.extend_from_slice(&[0; 14]);
        data
    }

    fn vp8x_payload(flags: u8, width: u32, height: u32) -> Vec<u8> {
        let mut payload = vec![flags, 0, 0, 0];
        payload.extend_from_slice(&(width - 1).to_le_bytes()[..3]);
        payload.extend_from_slice(&(height - 1).to_le_bytes()[..3]);
        payload
    }

    fn decode(data: Vec<u8>) -> Result<(Vec<u8>, u32, u32), DecodingError> {
        let mut decoder = WebPDecoder::new(Cursor::new(data))?;
        let (width, height) = decoder.dimensions();
        let mut pixels = vec![0; decoder.output_buffer_size().unwrap()];
        decoder.read_image(&mut pixels)?;
        Ok((pixels, width, height))
    }

    #[test]
    fn simple_lossy_one_pixel() {
        init_logging();
        let file = webp_file(&[chunk(b"VP8 ", &zero_vp8_payload(1, 1))]);
        let (pixels, width, height) = decode(file).unwrap();
        assert_eq!((width, height), (1, 1));
        assert_eq!(pixels, vec![130, 130, 130, 255]);
    }

    #[test]
    fn extended_no_features() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8X", &vp8x_payload(0x00, 2, 2)),
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
        ]);
        let mut decoder = WebPDecoder::new(Cursor::new(file)).unwrap();
        assert!(!decoder.has_alpha() && !decoder.has_animation());
        assert_eq!(decoder.dimensions(), (2, 2));
        assert!(decoder.icc_profile().unwrap().is_none());
        assert!(decoder.exif_metadata().unwrap().is_none());
        assert!(decoder.xmp_metadata().unwrap().is_none());

        let mut pixels = vec![0; 16];
        decoder.read_image(&mut pixels).unwrap();
        assert_eq!(&pixels[0..4], &[130, 130, 130, 255]);
    }

    #[test]
    fn extended_with_alpha_composites_nonpremultiplied() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8X", &vp8x_payload(0x10, 2, 2)),
            chunk(b"ALPH", &[0x00, 0x00, 0xff, 0x80, 0x40]),
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
        ]);
        let (pixels, ..) = decode(file).unwrap();

        let alphas: Vec<u8> = pixels.chunks_exact(4).map(|p| p[3]).collect();
        assert_eq!(alphas, vec![0, 255, 128, 64]);
        // RGB is untouched by composition.
        for pixel in pixels.chunks_exact(4) {
            assert_eq!(&pixel[0..3], &[130, 130, 130]);
        }
    }

    #[test]
    fn simple_lossless_one_pixel() {
        init_logging();
        // Header plus single-symbol trees for (g, r, b, a, dist) =
        // (128, 128, 128, 255, 0); assembled LSB first.
        let mut payload = vec![0x2fu8, 0, 0, 0, 0];
        let mut bits: Vec<u8> = vec![0, 0, 0]; // transform, cache, huffman-image
        for symbol in [128u32, 128, 128, 255, 0] {
            bits.extend([1, 0, 1]); // simple, one symbol, 8-bit
            bits.extend((0..8).map(|i| ((symbol >> i) & 1) as u8));
        }
        for (i, bit) in bits.iter().enumerate() {
            if i % 8 == 0 {
                payload.push(0);
            }
            let last = payload.len() - 1;
            payload[last] |= bit << (i % 8);
        }

        let file = webp_file(&[chunk(b"VP8L", &payload)]);
        let (pixels, width, height) = decode(file).unwrap();
        assert_eq!((width, height), (1, 1));
        assert_eq!(pixels, vec![128, 128, 128, 255]);
    }

    #[test]
    fn riff_size_overflow_is_rejected() {
        init_logging();
        let mut file = Vec::new();
        file.extend_from_slice(b"RIFF");
        file.extend_from_slice(&0x64u32.to_le_bytes());
        file.extend_from_slice(b"WEBP");
        assert!(matches!(
            WebPDecoder::new(Cursor::new(file)),
            Err(DecodingError::InvalidChunkSize)
        ));
    }

    #[test]
    fn vp8x_reserved_bytes_are_rejected() {
        init_logging();
        let mut payload = vp8x_payload(0x00, 2, 2);
        payload[1] = 0x01;
        let file = webp_file(&[
            chunk(b"VP8X", &payload),
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
        ]);
        assert!(matches!(
            WebPDecoder::new(Cursor::new(file)),
            Err(DecodingError::InfoBitsInvalid {
                name: "reserved",
                ..
            })
        ));
    }

    #[test]
    fn canvas_and_stream_dimensions_must_agree() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8X", &vp8x_payload(0x00, 4, 4)),
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
        ]);
        let mut decoder = WebPDecoder::new(Cursor::new(file)).unwrap();
        let mut pixels = vec![0; decoder.output_buffer_size().unwrap()];
        assert!(matches!(
            decoder.read_image(&mut pixels),
            Err(DecodingError::InconsistentImageSizes)
        ));
    }

    #[test]
    fn flag_without_chunk_is_rejected() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8X", &vp8x_payload(0x10, 2, 2)), // alpha flag, no ALPH
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
        ]);
        assert!(matches!(
            WebPDecoder::new(Cursor::new(file)),
            Err(DecodingError::FlagChunkMismatch(tag)) if &tag == b"ALPH"
        ));
    }

    #[test]
    fn chunk_without_flag_is_rejected() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8X", &vp8x_payload(0x00, 2, 2)),
            chunk(b"EXIF", b"II\x2a\x00\x08\x00\x00\x00"),
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
        ]);
        assert!(matches!(
            WebPDecoder::new(Cursor::new(file)),
            Err(DecodingError::FlagChunkMismatch(tag)) if &tag == b"EXIF"
        ));
    }

    #[test]
    fn duplicate_metadata_chunks_are_rejected() {
        init_logging();
        let exif = b"II\x2a\x00\x08\x00\x00\x00";
        let file = webp_file(&[
            chunk(b"VP8X", &vp8x_payload(0x08, 2, 2)),
            chunk(b"EXIF", exif),
            chunk(b"EXIF", exif),
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
        ]);
        assert!(matches!(
            WebPDecoder::new(Cursor::new(file)),
            Err(DecodingError::DuplicateChunk(tag)) if &tag == b"EXIF"
        ));
    }

    #[test]
    fn vp8x_must_come_first() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
            chunk(b"VP8X", &vp8x_payload(0x00, 2, 2)),
        ]);
        assert!(matches!(
            WebPDecoder::new(Cursor::new(file)),
            Err(DecodingError::ChunkOutOfOrder(tag)) if &tag == b"VP8X"
        ));
    }

    #[test]
    fn alpha_chunk_in_simple_webp_is_rejected() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
            chunk(b"ALPH", &[0x00, 0, 0, 0, 0]),
        ]);
        assert!(matches!(
            WebPDecoder::new(Cursor::new(file)),
            Err(DecodingError::ChunkHeaderInvalid(tag)) if &tag == b"ALPH"
        ));
    }

    #[test]
    fn both_primary_streams_are_rejected() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
            chunk(b"VP8L", &[0x2f, 0, 0, 0, 0]),
        ]);
        assert!(WebPDecoder::new(Cursor::new(file)).is_err());
    }

    #[test]
    fn unknown_chunks_are_preserved_in_order() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8X", &vp8x_payload(0x00, 2, 2)),
            chunk(b"ABCD", b"first"),
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
            chunk(b"EFGH", b"second"),
        ]);
        let mut decoder = WebPDecoder::new(Cursor::new(file)).unwrap();
        let unknown = decoder.unknown_chunks().unwrap();
        assert_eq!(unknown.len(), 2);
        assert_eq!(
            (&unknown[0].fourcc, &unknown[0].data[..]),
            (b"ABCD", &b"first"[..])
        );
        assert_eq!(
            (&unknown[1].fourcc, &unknown[1].data[..]),
            (b"EFGH", &b"second"[..])
        );
    }

    #[test]
    fn metadata_validation_is_not_fatal() {
        init_logging();
        let file = webp_file(&[
            chunk(b"VP8X", &vp8x_payload(0x08, 2, 2)),
            chunk(b"EXIF", b"XX\x2a\x00\x08\x00\x00\x00"),
            chunk(b"VP8 ", &zero_vp8_payload(2, 2)),
        ]);
        let mut decoder = WebPDecoder::new(Cursor::new(file)).unwrap();
        let issues = decoder.validate_metadata().unwrap();
        assert_eq!(issues.len(), 1);

        // The decode itself is unaffected.
        let mut pixels = vec![0; decoder.output_buffer_size().unwrap()];
        decoder.read_image(&mut pixels).unwrap();
    }

    #[test]
    fn declared_chunk_size_cannot_overflow_file() {
        init_logging();
        let bytes = vec![
            0x52, 0x49, 0x46, 0x46, 0xaf, 0x37, 0x80, 0x47, 0x57, 0x45, 0x42, 0x50, 0x6c, 0x64,
            0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xfb, 0x7e, 0x73, 0x00, 0x06, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x65, 0x65, 0x65, 0x65, 0x65, 0x65,
            0x40, 0xfb, 0xff, 0xff, 0x65, 0x65, 0x65, 0x65, 0x65, 0x65, 0x65, 0x65, 0x65, 0x65,
            0x00, 0x00, 0x00, 0x00, 0x62, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x49,
            0x49, 0x54, 0x55, 0x50, 0x4c, 0x54, 0x59, 0x50, 0x45, 0x33, 0x37, 0x44, 0x4d, 0x46,
        ];

        assert!(WebPDecoder::new(Cursor::new(bytes)).is_err());
    }
}
