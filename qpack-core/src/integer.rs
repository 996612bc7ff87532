//! Prefix integer encoding and decoding.
//!
//! Implements the variable-length integer encoding defined in RFC 7541 Section 5.1,
//! used throughout QPACK. The format allows efficient encoding of integers
//! while sharing the first byte with other fields.
//!
//! ## Format
//!
//! An integer is represented in two parts:
//! - A prefix that fills the remainder of a byte (N bits, where 1 ≤ N ≤ 8)
//! - Optional continuation bytes if the value doesn't fit in the prefix
//!
//! If I < 2^N - 1, the integer is encoded in the N-bit prefix.
//! Otherwise, the prefix bits are all set to 1, and `I - (2^N - 1)` is
//! encoded 7 bits at a time, least significant group first, with the high
//! bit of each byte flagging continuation.
//!
//! The decoder is resumable: input may arrive one byte at a time.

use bytes::{BufMut, BytesMut};

/// Maximum number of continuation bytes accepted by the decoder.
///
/// Ten bytes carry 70 bits, enough for any `u64` once the prefix is added.
pub const MAX_CONTINUATION_BYTES: u32 = 10;

/// Returns the all-ones value of an N-bit prefix.
#[inline]
fn prefix_max(prefix_bits: u8) -> u64 {
    debug_assert!((1..=8).contains(&prefix_bits), "prefix_bits must be 1-8");
    (1u64 << prefix_bits) - 1
}

/// Encodes an integer with an N-bit prefix, appending to `buf`.
///
/// `high_bits` holds the bits of the first byte outside the prefix; they
/// must not overlap the prefix.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use qpack_core::integer::encode;
///
/// let mut buf = BytesMut::new();
/// // Encode 10 with a 5-bit prefix, preserving the top 3 bits as 001
/// encode(10, 5, 0b001_00000, &mut buf);
/// assert_eq!(&buf[..], &[0b001_01010]);
/// ```
pub fn encode(value: u64, prefix_bits: u8, high_bits: u8, buf: &mut BytesMut) {
    let max_prefix = prefix_max(prefix_bits);
    debug_assert_eq!(
        u64::from(high_bits) & max_prefix,
        0,
        "high bits overlap the integer prefix"
    );

    if value < max_prefix {
        buf.put_u8(high_bits | value as u8);
        return;
    }

    buf.put_u8(high_bits | max_prefix as u8);
    let mut remaining = value - max_prefix;
    while remaining >= 128 {
        buf.put_u8(((remaining & 0x7F) | 0x80) as u8);
        remaining >>= 7;
    }
    buf.put_u8(remaining as u8);
}

/// Number of bytes `encode` produces for `value` with an N-bit prefix.
pub fn encoded_len(value: u64, prefix_bits: u8) -> usize {
    let max_prefix = prefix_max(prefix_bits);
    if value < max_prefix {
        return 1;
    }
    let mut remaining = value - max_prefix;
    let mut len = 2;
    while remaining >= 128 {
        remaining >>= 7;
        len += 1;
    }
    len
}

/// Outcome of feeding bytes to a [`VarintDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The integer is complete; read it with [`VarintDecoder::value`].
    Done,
    /// All input was consumed and more is needed.
    InProgress,
    /// The encoding is too long or the value does not fit in a `u64`.
    Error,
}

/// Resumable prefix integer decoder.
#[derive(Debug, Default, Clone)]
pub struct VarintDecoder {
    value: u64,
    shift: u32,
    continuation_bytes: u32,
}

impl VarintDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts decoding an integer whose prefix occupies the low
    /// `prefix_bits` of `first_byte`.
    ///
    /// `data` holds the bytes following `first_byte`. Returns the status
    /// and the number of bytes consumed from `data`.
    pub fn start(&mut self, first_byte: u8, prefix_bits: u8, data: &[u8]) -> (DecodeStatus, usize) {
        let max_prefix = prefix_max(prefix_bits);
        self.value = u64::from(first_byte) & max_prefix;
        self.shift = 0;
        self.continuation_bytes = 0;

        if self.value < max_prefix {
            return (DecodeStatus::Done, 0);
        }
        self.resume(data)
    }

    /// Continues decoding with more continuation bytes.
    pub fn resume(&mut self, data: &[u8]) -> (DecodeStatus, usize) {
        for (consumed, &byte) in data.iter().enumerate() {
            self.continuation_bytes += 1;
            if self.continuation_bytes > MAX_CONTINUATION_BYTES {
                return (DecodeStatus::Error, consumed + 1);
            }

            let bits = u64::from(byte & 0x7F);
            // Bits shifted out past bit 63 would be silently lost.
            if self.shift > 0 && bits >> (64 - self.shift) != 0 {
                return (DecodeStatus::Error, consumed + 1);
            }
            self.value = match self.value.checked_add(bits << self.shift) {
                Some(value) => value,
                None => return (DecodeStatus::Error, consumed + 1),
            };

            if byte & 0x80 == 0 {
                return (DecodeStatus::Done, consumed + 1);
            }
            self.shift += 7;
        }
        (DecodeStatus::InProgress, data.len())
    }

    /// The decoded value. Only meaningful after [`DecodeStatus::Done`].
    pub fn value(&self) -> u64 {
        self.value
    }
}

/// Decodes a complete integer with an N-bit prefix from `data`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input is truncated or the integer is too large.
///
/// # Example
///
/// ```
/// use qpack_core::integer::decode;
///
/// let data = &[0b001_01010]; // 10 with 5-bit prefix
/// assert_eq!(decode(5, data), Some((10, 1)));
/// ```
pub fn decode(prefix_bits: u8, data: &[u8]) -> Option<(u64, usize)> {
    let (&first, rest) = data.split_first()?;
    let mut decoder = VarintDecoder::new();
    match decoder.start(first, prefix_bits, rest) {
        (DecodeStatus::Done, consumed) => Some((decoder.value(), consumed + 1)),
        _ => None,
    }
}
