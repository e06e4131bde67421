//! Canonical prefix-code trees for the VP8L entropy layer.
//!
//! Codes are built from a code-length vector (length 0 = absent symbol,
//! maximum length 15) by the usual canonical construction: count codes per
//! length, derive the first code of each length from the cumulative
//! counts, then hand out codes to symbols in index order, MSB first.
//!
//! Decoding consults a 256-entry primary table for codes of up to 8 bits
//! and falls back to a first-code scan for the long tail.

use crate::decoder::DecodingError;
use crate::lossless::BitReader;

pub(crate) const MAX_CODE_LENGTH: u16 = 15;
const TABLE_BITS: u8 = 8;

#[derive(Clone, Copy, Default)]
struct TableEntry {
    symbol: u16,
    // 0 marks the prefix of a code longer than TABLE_BITS
    length: u8,
}

/// A decoded-and-validated prefix-code tree.
pub(crate) struct HuffmanTree {
    /// Degenerate single-symbol tree: emits without consuming bits.
    single: Option<u16>,
    table: Vec<TableEntry>,
    counts: [u16; MAX_CODE_LENGTH as usize + 1],
    first_codes: [u32; MAX_CODE_LENGTH as usize + 1],
    offsets: [u16; MAX_CODE_LENGTH as usize + 1],
    /// Symbols with a code, in canonical (length, index) order.
    sorted: Vec<u16>,
}

fn reverse_code(code: u32, length: u16) -> u32 {
    code.reverse_bits() >> (32 - u32::from(length))
}

impl HuffmanTree {
    fn single_symbol(symbol: u16) -> Self {
        HuffmanTree {
            single: Some(symbol),
            table: Vec::new(),
            counts: Default::default(),
            first_codes: Default::default(),
            offsets: Default::default(),
            sorted: Vec::new(),
        }
    }

    /// Builds a tree from the per-symbol code lengths.
    ///
    /// Over-subscribed length vectors, incomplete vectors (other than the
    /// degenerate single-symbol form) and lengths above 15 are rejected.
    pub(crate) fn build_implicit(code_lengths: &[u16]) -> Result<Self, DecodingError> {
        let mut num_symbols = 0;
        let mut last_symbol = 0;
        for (symbol, &length) in code_lengths.iter().enumerate() {
            if length > MAX_CODE_LENGTH {
                return Err(DecodingError::HuffmanError);
            }
            if length > 0 {
                num_symbols += 1;
                last_symbol = symbol as u16;
            }
        }

        match num_symbols {
            0 => return Err(DecodingError::HuffmanError),
            1 => return Ok(Self::single_symbol(last_symbol)),
            _ => {}
        }

        let mut counts = [0u16; MAX_CODE_LENGTH as usize + 1];
        for &length in code_lengths {
            counts[usize::from(length)] += 1;
        }
        counts[0] = 0;

        // Exact-fill check: the Kraft sum over all present codes must hit
        // 2^15; anything below is under-subscribed, anything above
        // over-subscribed.
        let mut kraft: u32 = 0;
        for length in 1..=usize::from(MAX_CODE_LENGTH) {
            kraft += u32::from(counts[length]) << (usize::from(MAX_CODE_LENGTH) - length);
        }
        if kraft != 1 << MAX_CODE_LENGTH {
            return Err(DecodingError::HuffmanError);
        }

        let mut first_codes = [0u32; MAX_CODE_LENGTH as usize + 1];
        let mut offsets = [0u16; MAX_CODE_LENGTH as usize + 1];
        let mut code = 0u32;
        let mut offset = 0u16;
        for length in 1..=usize::from(MAX_CODE_LENGTH) {
            code = (code + u32::from(counts[length - 1])) << 1;
            first_codes[length] = code;
            offsets[length] = offset;
            offset += counts[length];
        }

        let mut sorted = vec![0u16; usize::from(offset)];
        let mut next_index = offsets;
        let mut next_code = first_codes;
        let mut table = vec![TableEntry::default(); 1 << TABLE_BITS];
        for (symbol, &length) in code_lengths.iter().enumerate() {
            if length == 0 {
                continue;
            }
            let length_index = usize::from(length);
            let symbol_code = next_code[length_index];
            next_code[length_index] += 1;
            sorted[usize::from(next_index[length_index])] = symbol as u16;
            next_index[length_index] += 1;

            if length <= u16::from(TABLE_BITS) {
                let reversed = reverse_code(symbol_code, length) as usize;
                let entry = TableEntry {
                    symbol: symbol as u16,
                    length: length as u8,
                };
                let mut index = reversed;
                while index < table.len() {
                    table[index] = entry;
                    index += 1 << length;
                }
            }
        }

        Ok(HuffmanTree {
            single: None,
            table,
            counts,
            first_codes,
            offsets,
            sorted,
        })
    }

    /// Builds a tree from the "simple code" serialization: one symbol with
    /// a zero-bit code, or two symbols with one-bit codes.
    pub(crate) fn build_explicit(symbols: &[u16]) -> Result<Self, DecodingError> {
        match *symbols {
            [symbol] => Ok(Self::single_symbol(symbol)),
            [zero, one] => {
                let mut table = vec![TableEntry::default(); 1 << TABLE_BITS];
                for (index, entry) in table.iter_mut().enumerate() {
                    *entry = TableEntry {
                        symbol: if index & 1 == 0 { zero } else { one },
                        length: 1,
                    };
                }
                let mut counts = [0u16; MAX_CODE_LENGTH as usize + 1];
                counts[1] = 2;
                Ok(HuffmanTree {
                    single: None,
                    table,
                    counts,
                    first_codes: Default::default(),
                    offsets: Default::default(),
                    sorted: vec![zero, one],
                })
            }
            _ => Err(DecodingError::HuffmanError),
        }
    }

    /// Decodes the next symbol from `reader`.
    ///
    /// Exhaustion of the bitstream mid-code is a malformed stream.
    pub(crate) fn read_symbol(&self, reader: &mut BitReader) -> Result<u16, DecodingError> {
        if let Some(symbol) = self.single {
            return Ok(symbol);
        }

        let peeked = reader.peek_bits(TABLE_BITS);
        let entry = self.table[peeked as usize];
        if entry.length > 0 {
            reader.consume_bits(entry.length);
            if reader.is_exhausted() {
                return Err(DecodingError::BitStreamError);
            }
            return Ok(entry.symbol);
        }

        // The first 8 bits are the prefix of a longer code; keep scanning
        // one bit at a time against the canonical first-code ranges.
        reader.consume_bits(TABLE_BITS);
        let mut code = reverse_code(peeked, u16::from(TABLE_BITS));
        for length in usize::from(TABLE_BITS) + 1..=usize::from(MAX_CODE_LENGTH) {
            code = (code << 1) | reader.read_bits(1);
            if reader.is_exhausted() {
                return Err(DecodingError::BitStreamError);
            }
            let first = self.first_codes[length];
            if code >= first && code - first < u32::from(self.counts[length]) {
                let sorted_index = usize::from(self.offsets[length]) + (code - first) as usize;
                return Ok(self.sorted[sorted_index]);
            }
        }

        Err(DecodingError::HuffmanError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lossless::BitReader;

    // Packs bits LSB-first into bytes, the VP8L stream order.
    fn pack(bits: &[u32]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            bytes[i / 8] |= (bit as u8) << (i % 8);
        }
        bytes
    }

    #[test]
    fn uniform_two_bit_codes() {
        let tree = HuffmanTree::build_implicit(&[2, 2, 2, 2]).unwrap();
        // Codes are 00, 01, 10, 11, entering the stream MSB first.
        let mut reader = BitReader::new(pack(&[0, 0, 0, 1, 1, 0, 1, 1]));
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 0);
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 1);
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 2);
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 3);
    }

    #[test]
    fn skewed_codes_follow_canonical_order() {
        // Lengths 1, 2, 2 give codes 0, 10, 11.
        let tree = HuffmanTree::build_implicit(&[1, 2, 2]).unwrap();
        let mut reader = BitReader::new(pack(&[0, 1, 0, 1, 1]));
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 0);
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 1);
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 2);
    }

    #[test]
    fn over_subscribed_tree_is_rejected() {
        assert!(HuffmanTree::build_implicit(&[1, 1, 1]).is_err());
    }

    #[test]
    fn under_subscribed_tree_is_rejected() {
        assert!(HuffmanTree::build_implicit(&[2, 2, 2]).is_err());
        assert!(HuffmanTree::build_implicit(&[0, 0, 0]).is_err());
    }

    #[test]
    fn single_symbol_tree_reads_no_bits() {
        let tree = HuffmanTree::build_implicit(&[0, 0, 7, 0]).unwrap();
        let mut reader = BitReader::new(Vec::new());
        for _ in 0..3 {
            assert_eq!(tree.read_symbol(&mut reader).unwrap(), 2);
        }
        assert!(!reader.is_exhausted());
    }

    #[test]
    fn long_codes_take_the_scan_path() {
        // Symbol 0 has a 1-bit code; 256 further symbols share 9-bit codes
        // 1_0000_0000 .. 1_1111_1111.
        let mut lengths = vec![9u16; 257];
        lengths[0] = 1;
        let tree = HuffmanTree::build_implicit(&lengths).unwrap();

        let mut reader = BitReader::new(pack(&[1, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 1);
        assert_eq!(tree.read_symbol(&mut reader).unwrap(), 0);
    }

    #[test]
    fn truncated_stream_is_a_bitstream_error() {
        let tree = HuffmanTree::build_implicit(&[2, 2, 2, 2]).unwrap();
        let mut reader = BitReader::new(pack(&[0]));
        // One symbol fits in the single byte; five more overrun it.
        for _ in 0..4 {
            let _ = tree.read_symbol(&mut reader);
        }
        assert!(tree.read_symbol(&mut reader).is_err());
    }
}
