//! Variable-length integer encoding per RFC 9000 Section 16.
//!
//! QPACK only needs it for the type of its unidirectional streams; field
//! lines and instructions use prefix integers (see [`crate::integer`]).

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

/// Maximum value that can be encoded (2^62 - 1)
pub const MAX: u64 = (1u64 << 62) - 1;

/// Calculate the encoded length of a varint without encoding it.
pub fn encoded_len(value: u64) -> usize {
    if value < 64 {
        1
    } else if value < 16384 {
        2
    } else if value < 1073741824 {
        4
    } else {
        8
    }
}

/// Encode a variable-length integer into a buffer that implements BufMut.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns error if value exceeds MAX or buffer has insufficient space.
pub fn encode_buf<B: BufMut>(value: u64, buf: &mut B) -> Result<usize> {
    if value > MAX {
        return Err(Error::Internal(format!("varint value {} exceeds maximum", value)));
    }
    let len = encoded_len(value);
    if buf.remaining_mut() < len {
        return Err(Error::Internal(format!(
            "insufficient buffer space: need {} bytes, have {}",
            len,
            buf.remaining_mut()
        )));
    }

    match len {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
    Ok(len)
}

/// Decode a variable-length integer from a buffer that implements Buf.
///
/// Advances the buffer past the integer.
///
/// # Errors
///
/// Returns error if the buffer doesn't contain a complete varint.
pub fn decode_buf<B: Buf>(buf: &mut B) -> Result<u64> {
    if !buf.has_remaining() {
        return Err(Error::Internal("incomplete varint: empty buffer".into()));
    }

    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(Error::Internal(format!(
            "incomplete varint: need {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }

    let value = match len {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        _ => buf.get_u64() & MAX,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_rfc9000_examples() {
        let cases: &[(u64, &[u8])] = &[
            (37, &[0x25]),
            (15293, &[0x7b, 0xbd]),
            (494878333, &[0x9d, 0x7f, 0x3e, 0x7d]),
            (151288809941952652, &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]),
        ];
        for &(value, encoded) in cases {
            let mut buf = BytesMut::new();
            assert_eq!(encode_buf(value, &mut buf).unwrap(), encoded.len());
            assert_eq!(&buf[..], encoded);

            let mut read_buf = encoded;
            assert_eq!(decode_buf(&mut read_buf).unwrap(), value);
            assert!(read_buf.is_empty());
        }
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(63), 1);
        assert_eq!(encoded_len(64), 2);
        assert_eq!(encoded_len(16383), 2);
        assert_eq!(encoded_len(16384), 4);
        assert_eq!(encoded_len(1073741823), 4);
        assert_eq!(encoded_len(1073741824), 8);
        assert_eq!(encoded_len(MAX), 8);
    }

    #[test]
    fn test_value_too_large() {
        let mut buf = BytesMut::new();
        assert!(matches!(encode_buf(MAX + 1, &mut buf), Err(Error::Internal(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_insufficient_space() {
        let mut storage = [0u8; 1];
        let mut buf = &mut storage[..];
        assert!(encode_buf(64, &mut buf).is_err());
    }

    #[test]
    fn test_incomplete_varint() {
        let mut buf: &[u8] = &[0x40];
        assert!(decode_buf(&mut buf).is_err());
        let mut empty: &[u8] = &[];
        assert!(decode_buf(&mut empty).is_err());
    }
}
