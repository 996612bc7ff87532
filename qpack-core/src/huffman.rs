//! Huffman encoding and decoding for QPACK string literals.
//!
//! Implements the static Huffman code defined in RFC 7541 Appendix B.
//! QPACK reuses HPACK's Huffman table without modification.

use bytes::{BufMut, BytesMut};
use lazy_static::lazy_static;
use thiserror::Error;

/// Huffman code entry: (code, code_length_in_bits)
struct HuffmanEntry {
    code: u32,
    len: u8,
}

// Huffman encoding table (RFC 7541 Appendix B)
// Each entry is (code, bit_length) for symbols 0-255, plus EOS (256)
static ENCODE_TABLE: [HuffmanEntry; 257] = include!("huffman_table.inc");

const EOS: u16 = 256;
// Child links below this value are leaves holding a symbol (0-256);
// links at or above it point at internal node `link - NODE_OFFSET`.
const NODE_OFFSET: u16 = 512;
const EMPTY: u16 = u16::MAX;

#[derive(Clone, Copy)]
struct DecodeNode {
    children: [u16; 2],
}

lazy_static! {
    static ref DECODE_TREE: Vec<DecodeNode> = build_decode_tree();
}

fn build_decode_tree() -> Vec<DecodeNode> {
    let mut tree = vec![DecodeNode { children: [EMPTY; 2] }];

    for (symbol, entry) in ENCODE_TABLE.iter().enumerate() {
        let mut node = 0usize;
        for bit_idx in (0..entry.len).rev() {
            let bit = ((entry.code >> bit_idx) & 1) as usize;
            if bit_idx == 0 {
                tree[node].children[bit] = symbol as u16;
                break;
            }
            let link = tree[node].children[bit];
            node = if link == EMPTY {
                tree.push(DecodeNode { children: [EMPTY; 2] });
                let next = tree.len() - 1;
                tree[node].children[bit] = NODE_OFFSET + next as u16;
                next
            } else {
                (link - NODE_OFFSET) as usize
            };
        }
    }

    tree
}

/// Errors detected while decoding a Huffman-encoded string.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuffmanDecodeError {
    /// The EOS symbol appeared inside the string (RFC 7541 Section 5.2).
    #[error("EOS symbol in huffman-encoded string")]
    EndOfStringSymbol,
    /// Trailing bits are longer than 7 bits or not a prefix of EOS.
    #[error("invalid huffman padding")]
    InvalidPadding,
}

/// Returns the Huffman-encoded size of `data` in bytes.
///
/// Used to decide whether Huffman encoding reduces size.
pub fn encoded_size(data: &[u8]) -> usize {
    let bits: usize = data
        .iter()
        .map(|&byte| ENCODE_TABLE[byte as usize].len as usize)
        .sum();
    (bits + 7) / 8
}

/// Huffman-encodes `data`, appending to `output`.
pub fn encode(data: &[u8], output: &mut BytesMut) {
    output.reserve(encoded_size(data));
    let mut acc: u64 = 0;
    let mut bits: u8 = 0;

    for &byte in data {
        let entry = &ENCODE_TABLE[byte as usize];
        acc = (acc << entry.len) | u64::from(entry.code);
        bits += entry.len;

        while bits >= 8 {
            bits -= 8;
            output.put_u8((acc >> bits) as u8);
        }
    }

    // Pad with the most significant bits of EOS (all ones).
    if bits > 0 {
        let pad = 8 - bits;
        output.put_u8(((acc << pad) as u8) | ((1u8 << pad) - 1));
    }
}

/// Decodes Huffman-encoded `data`, appending the result to `output`.
pub fn decode(data: &[u8], output: &mut Vec<u8>) -> Result<(), HuffmanDecodeError> {
    let tree: &[DecodeNode] = &DECODE_TREE;
    let mut node = 0usize;
    // Bits consumed since the last emitted symbol, and whether all were ones.
    let mut pending_bits = 0u32;
    let mut pending_all_ones = true;

    for &byte in data {
        for bit_pos in (0..8).rev() {
            let bit = ((byte >> bit_pos) & 1) as usize;
            pending_bits += 1;
            pending_all_ones &= bit == 1;

            let link = tree[node].children[bit];
            if link == EOS {
                return Err(HuffmanDecodeError::EndOfStringSymbol);
            }
            if link < NODE_OFFSET {
                output.push(link as u8);
                node = 0;
                pending_bits = 0;
                pending_all_ones = true;
            } else {
                node = (link - NODE_OFFSET) as usize;
            }
        }
    }

    if pending_bits > 7 || !pending_all_ones {
        return Err(HuffmanDecodeError::InvalidPadding);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(data: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode(data, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_rfc7541_examples() {
        // RFC 7541 Appendix C.4.1
        assert_eq!(
            encoded(b"www.example.com"),
            [0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff]
        );
        // RFC 7541 Appendix C.4.2
        assert_eq!(encoded(b"no-cache"), [0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf]);
        assert_eq!(encoded_size(b"no-cache"), 6);
    }

    #[test]
    fn test_round_trip_all_bytes() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut decoded = Vec::new();
        decode(&encoded(&data), &mut decoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_empty() {
        assert!(encoded(b"").is_empty());
        let mut decoded = Vec::new();
        decode(&[], &mut decoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_padding_not_ones() {
        // 'a' is 00011 (5 bits); padding with zeros is invalid.
        let mut decoded = Vec::new();
        assert_eq!(decode(&[0x18], &mut decoded), Err(HuffmanDecodeError::InvalidPadding));
    }

    #[test]
    fn test_padding_too_long() {
        // 'a' followed by a full byte of ones: 11 bits of padding.
        let mut decoded = Vec::new();
        assert_eq!(
            decode(&[0x1f, 0xff], &mut decoded),
            Err(HuffmanDecodeError::InvalidPadding)
        );
    }

    #[test]
    fn test_eos_in_string() {
        let mut decoded = Vec::new();
        assert_eq!(
            decode(&[0xff, 0xff, 0xff, 0xff], &mut decoded),
            Err(HuffmanDecodeError::EndOfStringSymbol)
        );
    }
}
