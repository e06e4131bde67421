//! Decoding of the VP8L (lossless) bitstream.
//!
//! A VP8L image is one meta-block: an optional chain of up to four
//! transforms, an optional color cache, one or more Huffman groups
//! (selected per tile through a sub-resolution "Huffman image"), and an
//! LZ77-compressed stream of ARGB pixels. Sub-resolution images (Huffman
//! image, predictor/color tile data, palette) are decoded through the same
//! image-stream routine with transforms disallowed.

use std::io::Read;

use byteorder::ReadBytesExt;

use crate::decoder::DecodingError;
use crate::huffman::HuffmanTree;
use crate::lossless_transform::TransformType;

const NUM_LITERAL_CODES: u16 = 256;
const NUM_LENGTH_CODES: u16 = 24;
const NUM_DISTANCE_CODES: u16 = 40;
const NUM_CODE_LENGTH_CODES: usize = 19;

const CODE_LENGTH_CODE_ORDER: [usize; NUM_CODE_LENGTH_CODES] = [
    17, 18, 0, 1, 2, 3, 4, 5, 16, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
];

/// Short-distance (dx, dy) neighborhood, indexed by plane code − 1.
#[rustfmt::skip]
const DISTANCE_MAP: [(i8, u8); 120] = [
    (0, 1),  (1, 0),  (1, 1),  (-1, 1), (0, 2),  (2, 0),  (1, 2),
    (-1, 2), (2, 1),  (-2, 1), (2, 2),  (-2, 2), (0, 3),  (3, 0),
    (1, 3),  (-1, 3), (3, 1),  (-3, 1), (2, 3),  (-2, 3), (3, 2),
    (-3, 2), (0, 4),  (4, 0),  (1, 4),  (-1, 4), (4, 1),  (-4, 1),
    (3, 3),  (-3, 3), (2, 4),  (-2, 4), (4, 2),  (-4, 2), (0, 5),
    (3, 4),  (-3, 4), (4, 3),  (-4, 3), (5, 0),  (1, 5),  (-1, 5),
    (5, 1),  (-5, 1), (2, 5),  (-2, 5), (5, 2),  (-5, 2), (4, 4),
    (-4, 4), (3, 5),  (-3, 5), (5, 3),  (-5, 3), (0, 6),  (6, 0),
    (1, 6),  (-1, 6), (6, 1),  (-6, 1), (2, 6),  (-2, 6), (6, 2),
    (-6, 2), (4, 5),  (-4, 5), (5, 4),  (-5, 4), (3, 6),  (-3, 6),
    (6, 3),  (-6, 3), (0, 7),  (7, 0),  (1, 7),  (-1, 7), (5, 5),
    (-5, 5), (7, 1),  (-7, 1), (4, 6),  (-4, 6), (6, 4),  (-6, 4),
    (2, 7),  (-2, 7), (7, 2),  (-7, 2), (3, 7),  (-3, 7), (7, 3),
    (-7, 3), (5, 6),  (-5, 6), (6, 5),  (-6, 5), (8, 0),  (4, 7),
    (-4, 7), (7, 4),  (-7, 4), (8, 1),  (8, 2),  (6, 6),  (-6, 6),
    (8, 3),  (5, 7),  (-5, 7), (7, 5),  (-7, 5), (8, 4),  (6, 7),
    (-6, 7), (7, 6),  (-7, 6), (8, 5),  (7, 7),  (-7, 7), (8, 6),
    (8, 7),
];

pub(crate) fn subsample_size(size: u16, sampling_bits: u8) -> u16 {
    ((u32::from(size) + (1 << sampling_bits) - 1) >> sampling_bits) as u16
}

/// LSB-first bit reader over little-endian bytes.
///
/// Reads past the end yield zero bits and set a sticky exhaustion flag;
/// Huffman decoding turns that into a malformed-stream error.
pub(crate) struct BitReader {
    data: Vec<u8>,
    byte_pos: usize,
    accumulator: u64,
    bits: u8,
    exhausted: bool,
}

impl BitReader {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        BitReader {
            data,
            byte_pos: 0,
            accumulator: 0,
            bits: 0,
            exhausted: false,
        }
    }

    fn fill(&mut self) {
        while self.bits <= 56 && self.byte_pos < self.data.len() {
            self.accumulator |= u64::from(self.data[self.byte_pos]) << self.bits;
            self.byte_pos += 1;
            self.bits += 8;
        }
    }

    /// Returns the next `num` bits without consuming them, zero-padded past
    /// the end of the stream.
    pub(crate) fn peek_bits(&mut self, num: u8) -> u32 {
        debug_assert!(num <= 24);
        self.fill();
        (self.accumulator & ((1u64 << num) - 1)) as u32
    }

    pub(crate) fn consume_bits(&mut self, num: u8) {
        self.fill();
        if num > self.bits {
            self.exhausted = true;
            self.accumulator = 0;
            self.bits = 0;
        } else {
            self.accumulator >>= num;
            self.bits -= num;
        }
    }

    pub(crate) fn read_bits(&mut self, num: u8) -> u32 {
        let value = self.peek_bits(num);
        self.consume_bits(num);
        value
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// One Huffman group: green/red/blue/alpha/distance trees.
struct HuffmanGroup {
    green: HuffmanTree,
    red: HuffmanTree,
    blue: HuffmanTree,
    alpha: HuffmanTree,
    distance: HuffmanTree,
}

struct HuffmanInfo {
    groups: Vec<HuffmanGroup>,
    /// `(tile assignments, tile bits, tile row width)` when more than one
    /// group is in play.
    image: Option<(Vec<u32>, u8, u16)>,
}

impl HuffmanInfo {
    fn group_for(&self, x: u16, y: u16) -> Result<&HuffmanGroup, DecodingError> {
        let index = match &self.image {
            Some((pixels, bits, xsize)) => {
                let tile =
                    usize::from(y >> bits) * usize::from(*xsize) + usize::from(x >> bits);
                ((pixels[tile] >> 8) & 0xffff) as usize
            }
            None => 0,
        };
        self.groups.get(index).ok_or(DecodingError::BitStreamError)
    }
}

struct ColorCache {
    entries: Vec<u32>,
    bits: u8,
}

impl ColorCache {
    fn new(bits: u8) -> Self {
        ColorCache {
            entries: vec![0; 1 << bits],
            bits,
        }
    }

    fn insert(&mut self, argb: u32) {
        let index = (0x1E35_A7BDu32.wrapping_mul(argb)) >> (32 - self.bits);
        self.entries[index as usize] = argb;
    }

    fn lookup(&self, index: usize) -> Result<u32, DecodingError> {
        self.entries
            .get(index)
            .copied()
            .ok_or(DecodingError::BitStreamError)
    }
}

/// A decoded lossless image: packed ARGB, alpha in the highest byte.
pub(crate) struct LosslessFrame {
    pub(crate) width: u16,
    pub(crate) height: u16,
    pub(crate) buf: Vec<u32>,
}

impl LosslessFrame {
    /// Writes the frame into `buf` as interleaved RGBA bytes.
    pub(crate) fn fill_rgba(&self, buf: &mut [u8]) {
        for (&argb, chunk) in self.buf.iter().zip(buf.chunks_exact_mut(4)) {
            chunk[0] = (argb >> 16) as u8;
            chunk[1] = (argb >> 8) as u8;
            chunk[2] = argb as u8;
            chunk[3] = (argb >> 24) as u8;
        }
    }

    /// Projects the green channel, which carries the plane values when a
    /// single channel is compressed as a VP8L image (alpha chunks).
    pub(crate) fn fill_green(&self, buf: &mut [u8]) {
        for (&argb, out) in self.buf.iter().zip(buf.iter_mut()) {
            *out = (argb >> 8) as u8;
        }
    }
}

/// Decoder for VP8L chunk payloads.
pub(crate) struct LosslessDecoder<R> {
    r: R,
    bit_reader: BitReader,
    frame: LosslessFrame,
}

impl<R: Read> LosslessDecoder<R> {
    pub(crate) fn new(r: R) -> LosslessDecoder<R> {
        LosslessDecoder {
            r,
            bit_reader: BitReader::new(Vec::new()),
            frame: LosslessFrame {
                width: 0,
                height: 0,
                buf: Vec::new(),
            },
        }
    }

    /// Decodes a full VP8L stream, signature and header included.
    pub(crate) fn decode_frame(&mut self) -> Result<&LosslessFrame, DecodingError> {
        let signature = self.r.read_u8()?;
        if signature != 0x2f {
            return Err(DecodingError::LosslessSignatureInvalid(signature));
        }

        let mut data = Vec::new();
        self.r.read_to_end(&mut data)?;
        self.bit_reader = BitReader::new(data);

        let width = self.bit_reader.read_bits(14) as u16 + 1;
        let height = self.bit_reader.read_bits(14) as u16 + 1;
        let _alpha_used = self.bit_reader.read_bits(1);
        let version = self.bit_reader.read_bits(3) as u8;
        if version != 0 {
            return Err(DecodingError::VersionNumberInvalid(version));
        }
        if self.bit_reader.is_exhausted() {
            return Err(DecodingError::BitStreamError);
        }
        log::debug!("vp8l frame {width}x{height}");

        self.decode_image_into_frame(width, height)?;
        Ok(&self.frame)
    }

    /// Decodes a headless VP8L stream whose dimensions are known from the
    /// enclosing container (compressed alpha planes).
    pub(crate) fn decode_frame_implicit_dimensions(
        &mut self,
        width: u16,
        height: u16,
    ) -> Result<&LosslessFrame, DecodingError> {
        let mut data = Vec::new();
        self.r.read_to_end(&mut data)?;
        self.bit_reader = BitReader::new(data);

        self.decode_image_into_frame(width, height)?;
        Ok(&self.frame)
    }

    fn decode_image_into_frame(&mut self, width: u16, height: u16) -> Result<(), DecodingError> {
        let buf = self.decode_image_stream(width, height, true)?;
        debug_assert_eq!(buf.len(), usize::from(width) * usize::from(height));
        self.frame = LosslessFrame { width, height, buf };
        Ok(())
    }

    /// Decodes one image stream. The top level may carry transforms; the
    /// recursive calls for sub-resolution images may not.
    fn decode_image_stream(
        &mut self,
        width: u16,
        height: u16,
        is_top_level: bool,
    ) -> Result<Vec<u32>, DecodingError> {
        // Transforms narrow the stored width when a small palette packs
        // several pixels per byte, so the width is tracked mutably and each
        // transform remembers the width it saw.
        let mut xsize = width;
        let mut transforms: Vec<(TransformType, u16)> = Vec::new();

        if is_top_level {
            while self.bit_reader.read_bits(1) == 1 {
                if transforms.len() >= 4 {
                    return Err(DecodingError::TransformError);
                }
                // Each transform keeps the width the image had when it was
                // read; color indexing narrows `xsize` for everything after
                // it, including the main image.
                let width_when_read = xsize;
                let transform = self.read_transform(&mut xsize, height)?;
                if transforms.iter().any(|(seen, _)| {
                    std::mem::discriminant(seen) == std::mem::discriminant(&transform)
                }) {
                    return Err(DecodingError::TransformError);
                }
                transforms.push((transform, width_when_read));
            }
        }

        let cache_bits = if self.bit_reader.read_bits(1) == 1 {
            let bits = self.bit_reader.read_bits(4) as u8;
            if bits == 0 || bits > 11 {
                return Err(DecodingError::InvalidColorCacheBits(bits));
            }
            bits
        } else {
            0
        };

        let info = self.read_huffman_info(xsize, height, cache_bits, is_top_level)?;

        let mut data = self.decode_image_data(xsize, height, cache_bits, &info)?;

        for (transform, transform_width) in transforms.iter().rev() {
            transform.apply_transform(&mut data, *transform_width, height)?;
        }

        Ok(data)
    }

    fn read_transform(
        &mut self,
        xsize: &mut u16,
        height: u16,
    ) -> Result<TransformType, DecodingError> {
        let transform_type = self.bit_reader.read_bits(2);
        match transform_type {
            0 => {
                // predictor
                let size_bits = self.bit_reader.read_bits(3) as u8 + 2;
                let data = self.decode_image_stream(
                    subsample_size(*xsize, size_bits),
                    subsample_size(height, size_bits),
                    false,
                )?;
                Ok(TransformType::PredictorTransform {
                    size_bits,
                    predictor_data: data,
                })
            }
            1 => {
                // cross-color
                let size_bits = self.bit_reader.read_bits(3) as u8 + 2;
                let data = self.decode_image_stream(
                    subsample_size(*xsize, size_bits),
                    subsample_size(height, size_bits),
                    false,
                )?;
                Ok(TransformType::ColorTransform {
                    size_bits,
                    transform_data: data,
                })
            }
            2 => Ok(TransformType::SubtractGreen),
            3 => {
                // color indexing
                let table_size = self.bit_reader.read_bits(8) as u16 + 1;
                let mut table_data = self.decode_image_stream(table_size, 1, false)?;
                // Palette entries are stored delta-coded against their
                // predecessor, channel-wise modulo 256.
                for i in 1..table_data.len() {
                    table_data[i] = add_pixels(table_data[i], table_data[i - 1]);
                }
                let width_bits = crate::lossless_transform::color_index_width_bits(table_size);
                *xsize = subsample_size(*xsize, width_bits);
                Ok(TransformType::ColorIndexingTransform {
                    table_size,
                    table_data,
                })
            }
            _ => unreachable!("2-bit value"),
        }
    }

    fn read_huffman_info(
        &mut self,
        xsize: u16,
        ysize: u16,
        cache_bits: u8,
        allow_meta: bool,
    ) -> Result<HuffmanInfo, DecodingError> {
        let mut image = None;
        let mut num_groups = 1usize;

        if allow_meta && self.bit_reader.read_bits(1) == 1 {
            let huffman_bits = self.bit_reader.read_bits(3) as u8 + 2;
            let huffman_xsize = subsample_size(xsize, huffman_bits);
            let huffman_ysize = subsample_size(ysize, huffman_bits);
            let entropy_image =
                self.decode_image_stream(huffman_xsize, huffman_ysize, false)?;

            for pixel in &entropy_image {
                let meta_index = ((pixel >> 8) & 0xffff) as usize;
                num_groups = num_groups.max(meta_index + 1);
            }
            image = Some((entropy_image, huffman_bits, huffman_xsize));
        }

        let cache_size = if cache_bits > 0 { 1u16 << cache_bits } else { 0 };
        let mut groups = Vec::with_capacity(num_groups);
        for _ in 0..num_groups {
            groups.push(HuffmanGroup {
                green: self
                    .read_huffman_code(NUM_LITERAL_CODES + NUM_LENGTH_CODES + cache_size)?,
                red: self.read_huffman_code(NUM_LITERAL_CODES)?,
                blue: self.read_huffman_code(NUM_LITERAL_CODES)?,
                alpha: self.read_huffman_code(NUM_LITERAL_CODES)?,
                distance: self.read_huffman_code(NUM_DISTANCE_CODES)?,
            });
        }

        Ok(HuffmanInfo { groups, image })
    }

    fn read_huffman_code(&mut self, alphabet_size: u16) -> Result<HuffmanTree, DecodingError> {
        let simple = self.bit_reader.read_bits(1) == 1;

        if simple {
            let num_symbols = self.bit_reader.read_bits(1) as usize + 1;
            let first_symbol_bits = if self.bit_reader.read_bits(1) == 1 { 8 } else { 1 };
            let mut symbols = [0u16; 2];
            symbols[0] = self.bit_reader.read_bits(first_symbol_bits) as u16;
            if num_symbols == 2 {
                symbols[1] = self.bit_reader.read_bits(8) as u16;
            }
            if self.bit_reader.is_exhausted() {
                return Err(DecodingError::BitStreamError);
            }
            if symbols[..num_symbols].iter().any(|&s| s >= alphabet_size) {
                return Err(DecodingError::HuffmanError);
            }
            HuffmanTree::build_explicit(&symbols[..num_symbols])
        } else {
            let mut code_length_code_lengths = [0u16; NUM_CODE_LENGTH_CODES];
            let num_codes = self.bit_reader.read_bits(4) as usize + 4;
            for &order in CODE_LENGTH_CODE_ORDER.iter().take(num_codes) {
                code_length_code_lengths[order] = self.bit_reader.read_bits(3) as u16;
            }
            if self.bit_reader.is_exhausted() {
                return Err(DecodingError::BitStreamError);
            }

            let code_lengths =
                self.read_code_lengths(&code_length_code_lengths, alphabet_size)?;
            HuffmanTree::build_implicit(&code_lengths)
        }
    }

    /// Reads the per-symbol code lengths through the code-length code.
    fn read_code_lengths(
        &mut self,
        code_length_code_lengths: &[u16; NUM_CODE_LENGTH_CODES],
        num_symbols: u16,
    ) -> Result<Vec<u16>, DecodingError> {
        let length_tree = HuffmanTree::build_implicit(code_length_code_lengths)?;

        let mut max_symbol = if self.bit_reader.read_bits(1) == 1 {
            let length_nbits = 2 + 2 * self.bit_reader.read_bits(3) as u8;
            let limit = 2 + self.bit_reader.read_bits(length_nbits);
            if limit > u32::from(num_symbols) {
                return Err(DecodingError::BitStreamError);
            }
            limit
        } else {
            u32::from(num_symbols)
        };

        let mut code_lengths = vec![0u16; usize::from(num_symbols)];
        let mut prev_code_len = 8u16;
        let mut symbol = 0usize;

        while symbol < code_lengths.len() {
            if max_symbol == 0 {
                break;
            }
            max_symbol -= 1;

            let code_len = length_tree.read_symbol(&mut self.bit_reader)?;
            match code_len {
                0..=15 => {
                    code_lengths[symbol] = code_len;
                    symbol += 1;
                    if code_len != 0 {
                        prev_code_len = code_len;
                    }
                }
                16 | 17 | 18 => {
                    let (extra_bits, repeat_offset, length) = match code_len {
                        16 => (2, 3, prev_code_len),
                        17 => (3, 3, 0),
                        _ => (7, 11, 0),
                    };
                    let repeat = self.bit_reader.read_bits(extra_bits) as usize + repeat_offset;
                    if symbol + repeat > code_lengths.len() {
                        return Err(DecodingError::BitStreamError);
                    }
                    for length_slot in &mut code_lengths[symbol..symbol + repeat] {
                        *length_slot = length;
                    }
                    symbol += repeat;
                }
                _ => return Err(DecodingError::BitStreamError),
            }
        }

        Ok(code_lengths)
    }

    fn decode_image_data(
        &mut self,
        width: u16,
        height: u16,
        cache_bits: u8,
        info: &HuffmanInfo,
    ) -> Result<Vec<u32>, DecodingError> {
        let total = usize::from(width) * usize::from(height);
        let mut data = vec![0u32; total];
        let mut cache = if cache_bits > 0 {
            Some(ColorCache::new(cache_bits))
        } else {
            None
        };

        let mut pos = 0usize;
        let mut x = 0u16;
        let mut y = 0u16;

        while pos < total {
            let group = info.group_for(x, y)?;
            let green = group.green.read_symbol(&mut self.bit_reader)?;

            if green < NUM_LITERAL_CODES {
                let red = group.red.read_symbol(&mut self.bit_reader)?;
                let blue = group.blue.read_symbol(&mut self.bit_reader)?;
                let alpha = group.alpha.read_symbol(&mut self.bit_reader)?;

                let argb = (u32::from(alpha) << 24)
                    | (u32::from(red) << 16)
                    | (u32::from(green) << 8)
                    | u32::from(blue);
                data[pos] = argb;
                if let Some(cache) = &mut cache {
                    cache.insert(argb);
                }
                pos += 1;
                x += 1;
                if x == width {
                    x = 0;
                    y += 1;
                }
            } else if green < NUM_LITERAL_CODES + NUM_LENGTH_CODES {
                let length = self.read_prefix_coded(green - NUM_LITERAL_CODES) as usize;
                let distance_symbol = group.distance.read_symbol(&mut self.bit_reader)?;
                if distance_symbol >= NUM_DISTANCE_CODES {
                    return Err(DecodingError::BitStreamError);
                }
                let distance_code = self.read_prefix_coded(distance_symbol);
                let distance = plane_code_to_distance(width, distance_code);

                if distance > pos || total - pos < length {
                    return Err(DecodingError::BitStreamError);
                }

                for i in 0..length {
                    data[pos + i] = data[pos + i - distance];
                    if let Some(cache) = &mut cache {
                        cache.insert(data[pos + i]);
                    }
                }
                pos += length;
                x = (pos % usize::from(width)) as u16;
                y = (pos / usize::from(width)) as u16;
            } else {
                let cache = cache.as_ref().ok_or(DecodingError::BitStreamError)?;
                let index = usize::from(green - NUM_LITERAL_CODES - NUM_LENGTH_CODES);
                data[pos] = cache.lookup(index)?;
                pos += 1;
                x += 1;
                if x == width {
                    x = 0;
                    y += 1;
                }
            }
        }

        if self.bit_reader.is_exhausted() {
            return Err(DecodingError::BitStreamError);
        }

        Ok(data)
    }

    /// Expands a length or distance symbol with its extra bits.
    fn read_prefix_coded(&mut self, symbol: u16) -> u32 {
        if symbol < 4 {
            return u32::from(symbol) + 1;
        }
        let extra_bits = (symbol - 2) >> 1;
        let offset = u32::from(2 + (symbol & 1)) << extra_bits;
        offset + self.bit_reader.read_bits(extra_bits as u8) + 1
    }
}

fn plane_code_to_distance(width: u16, distance_code: u32) -> usize {
    if distance_code > DISTANCE_MAP.len() as u32 {
        (distance_code as usize) - DISTANCE_MAP.len()
    } else {
        let (dx, dy) = DISTANCE_MAP[distance_code as usize - 1];
        let distance = i64::from(dy) * i64::from(width) + i64::from(dx);
        distance.max(1) as usize
    }
}

pub(crate) fn add_pixels(a: u32, b: u32) -> u32 {
    let alpha = (a >> 24).wrapping_add(b >> 24) & 0xff;
    let red = ((a >> 16) & 0xff).wrapping_add((b >> 16) & 0xff) & 0xff;
    let green = ((a >> 8) & 0xff).wrapping_add((b >> 8) & 0xff) & 0xff;
    let blue = (a & 0xff).wrapping_add(b & 0xff) & 0xff;
    (alpha << 24) | (red << 16) | (green << 8) | blue
}

#[cfg(test)]
mod tests {
    use super::*;

    // Packs bits LSB-first into bytes, the VP8L stream order.
    struct BitWriter {
        bytes: Vec<u8>,
        bit: u8,
    }

    impl BitWriter {
        fn new() -> Self {
            BitWriter {
                bytes: Vec::new(),
                bit: 0,
            }
        }

        fn write(&mut self, value: u32, num: u8) {
            for i in 0..num {
                if self.bit == 0 {
                    self.bytes.push(0);
                }
                let bit = (value >> i) & 1;
                *self.bytes.last_mut().unwrap() |= (bit as u8) << self.bit;
                self.bit = (self.bit + 1) % 8;
            }
        }

        // Code bits enter the stream MSB first.
        fn write_code(&mut self, code: u32, num: u8) {
            for i in (0..num).rev() {
                self.write((code >> i) & 1, 1);
            }
        }
    }

    fn simple_single_tree(w: &mut BitWriter, symbol: u32) {
        w.write(1, 1); // simple serialization
        w.write(0, 1); // one symbol
        w.write(1, 1); // eight-bit symbol
        w.write(symbol, 8);
    }

    #[test]
    fn bit_reader_is_lsb_first() {
        let mut reader = BitReader::new(vec![0b1100_0101, 0b0000_0011]);
        assert_eq!(reader.read_bits(3), 0b101);
        assert_eq!(reader.read_bits(5), 0b11000);
        assert_eq!(reader.read_bits(2), 0b11);
        assert!(!reader.is_exhausted());
        assert_eq!(reader.read_bits(8), 0);
        assert!(reader.is_exhausted());
    }

    #[test]
    fn one_pixel_literal_image() {
        // 1×1 image, no transforms, no cache, single-symbol trees: green,
        // red, blue are 128 and alpha 255.
        let mut w = BitWriter::new();
        w.write(0, 14); // width - 1
        w.write(0, 14); // height - 1
        w.write(0, 1); // alpha hint
        w.write(0, 3); // version
        w.write(0, 1); // no transforms
        w.write(0, 1); // no color cache
        w.write(0, 1); // no huffman image
        simple_single_tree(&mut w, 128); // green
        simple_single_tree(&mut w, 128); // red
        simple_single_tree(&mut w, 128); // blue
        simple_single_tree(&mut w, 255); // alpha
        simple_single_tree(&mut w, 0); // distance

        let mut data = vec![0x2f];
        data.extend(w.bytes);

        let mut decoder = LosslessDecoder::new(std::io::Cursor::new(data));
        let frame = decoder.decode_frame().unwrap();
        assert_eq!((frame.width, frame.height), (1, 1));

        let mut rgba = [0u8; 4];
        frame.fill_rgba(&mut rgba);
        assert_eq!(rgba, [128, 128, 128, 255]);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut decoder = LosslessDecoder::new(std::io::Cursor::new(vec![0x2e, 0, 0, 0, 0]));
        assert!(matches!(
            decoder.decode_frame(),
            Err(DecodingError::LosslessSignatureInvalid(0x2e))
        ));
    }

    #[test]
    fn nonzero_version_is_rejected() {
        let mut w = BitWriter::new();
        w.write(0, 14);
        w.write(0, 14);
        w.write(0, 1);
        w.write(1, 3); // version 1
        let mut data = vec![0x2f];
        data.extend(w.bytes);

        let mut decoder = LosslessDecoder::new(std::io::Cursor::new(data));
        assert!(matches!(
            decoder.decode_frame(),
            Err(DecodingError::VersionNumberInvalid(1))
        ));
    }

    // Writes a green tree over `alphabet` symbols in which `first` and
    // `second` have one-bit codes, using the full code-length-code path.
    fn green_tree_two_symbols(w: &mut BitWriter, zeros_before_second: usize) {
        w.write(0, 1); // not simple
        w.write(0, 4); // 4 code-length codes: lengths for 17, 18, 0, 1
        w.write(2, 3); // len(17) = 2
        w.write(3, 3); // len(18) = 3
        w.write(3, 3); // len(0)  = 3
        w.write(1, 3); // len(1)  = 1
        w.write(0, 1); // no max-symbol shortcut
        // canonical codes: 1 -> 0, 17 -> 10, 0 -> 110, 18 -> 111
        w.write_code(0b10, 2); // 17: run of zeros
        w.write(7, 3); // 3 + 7 = 10 zeros (symbols 0..10)
        w.write_code(0, 1); // symbol 10: length 1
        let mut remaining = zeros_before_second;
        while remaining > 0 {
            let run = remaining.min(138).max(11);
            w.write_code(0b111, 3);
            w.write((run - 11) as u32, 7);
            remaining -= run;
        }
        w.write_code(0, 1); // second one-bit symbol
        // trailing symbols stay absent; emit single zeros to finish
        for _ in 0..23 {
            w.write_code(0b110, 3);
        }
    }

    #[test]
    fn backward_reference_copies_previous_pixel() {
        // 4×1 image: literal, copy(len 1, dist 1), literal, copy.
        let mut w = BitWriter::new();
        w.write(3, 14); // width 4
        w.write(0, 14); // height 1
        w.write(0, 1);
        w.write(0, 3);
        w.write(0, 1); // no transforms
        w.write(0, 1); // no cache
        w.write(0, 1); // no huffman image
        // green: symbol 10 (literal) and symbol 256 (length code 0), both
        // one bit; 245 zeros between them, 23 after.
        green_tree_two_symbols(&mut w, 245);
        simple_single_tree(&mut w, 20); // red
        simple_single_tree(&mut w, 30); // blue
        simple_single_tree(&mut w, 255); // alpha
        // distance: single symbol 1 -> distance code 2 -> (dx 1, dy 0)
        simple_single_tree(&mut w, 1);

        w.write_code(0, 1); // literal green=10
        w.write_code(1, 1); // copy
        w.write_code(0, 1); // literal
        w.write_code(1, 1); // copy

        let mut data = vec![0x2f];
        data.extend(w.bytes);

        let mut decoder = LosslessDecoder::new(std::io::Cursor::new(data));
        let frame = decoder.decode_frame().unwrap();
        assert_eq!((frame.width, frame.height), (4, 1));
        let expected = 0xff14_0a1e; // a=255 r=20 g=10 b=30
        assert_eq!(frame.buf, vec![expected; 4]);
    }

    #[test]
    fn backward_reference_before_image_start_is_rejected() {
        // Same layout as above, but the very first symbol is a copy, so
        // the reference reaches before the first pixel.
        let mut w = BitWriter::new();
        w.write(3, 14);
        w.write(0, 14);
        w.write(0, 1);
        w.write(0, 3);
        w.write(0, 1);
        w.write(0, 1);
        w.write(0, 1);
        green_tree_two_symbols(&mut w, 245);
        simple_single_tree(&mut w, 20);
        simple_single_tree(&mut w, 30);
        simple_single_tree(&mut w, 255);
        simple_single_tree(&mut w, 1);

        w.write_code(1, 1); // copy with nothing decoded yet

        let mut data = vec![0x2f];
        data.extend(w.bytes);

        let mut decoder = LosslessDecoder::new(std::io::Cursor::new(data));
        assert!(matches!(
            decoder.decode_frame(),
            Err(DecodingError::BitStreamError)
        ));
    }

    #[test]
    fn color_cache_round_trip() {
        // 2×1 image with a one-bit cache: literal transparent black, then
        // cache index 0 (hash of zero is zero).
        let mut w = BitWriter::new();
        w.write(1, 14); // width 2
        w.write(0, 14); // height 1
        w.write(0, 1);
        w.write(0, 3);
        w.write(0, 1); // no transforms
        w.write(1, 1); // color cache present
        w.write(1, 4); // cache_bits = 1
        w.write(0, 1); // no huffman image
        // green alphabet is 282: symbol 0 (literal) and symbol 280 (cache
        // slot 0) carry one-bit codes.
        green_tree_zero_and_280(&mut w);
        simple_single_tree(&mut w, 0); // red
        simple_single_tree(&mut w, 0); // blue
        simple_single_tree(&mut w, 0); // alpha
        simple_single_tree(&mut w, 0); // distance

        w.write_code(0, 1); // literal 0x00000000
        w.write_code(1, 1); // cache hit, slot 0

        let mut data = vec![0x2f];
        data.extend(w.bytes);

        let mut decoder = LosslessDecoder::new(std::io::Cursor::new(data));
        let frame = decoder.decode_frame().unwrap();
        assert_eq!(frame.buf, vec![0, 0]);
    }

    fn green_tree_zero_and_280(w: &mut BitWriter) {
        w.write(0, 1); // not simple
        w.write(0, 4); // lengths for 17, 18, 0, 1
        w.write(3, 3); // len(17) = 3
        w.write(2, 3); // len(18) = 2
        w.write(3, 3); // len(0)  = 3
        w.write(1, 3); // len(1)  = 1
        w.write(0, 1); // no max-symbol shortcut
        // canonical codes: 1 -> 0, 18 -> 10, 0 -> 110, 17 -> 111
        w.write_code(0, 1); // symbol 0: length 1
        w.write_code(0b10, 2); // 18: 127 + 11 = 138 zeros (symbols 1..139)
        w.write(127, 7);
        w.write_code(0b10, 2); // 18: another 138 zeros (139..277)
        w.write(127, 7);
        w.write_code(0b111, 3); // 17: 3 zeros (277..280)
        w.write(0, 3);
        w.write_code(0, 1); // symbol 280: length 1
        w.write_code(0b110, 3); // symbol 281: absent
    }
}
