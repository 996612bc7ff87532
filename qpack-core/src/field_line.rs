//! Header field representation.
//!
//! A name-value pair, used both for header lists handed to the encoder or
//! produced by the decoder, and for dynamic table entries.

use bytes::Bytes;
use std::fmt;

/// Per-entry overhead added to name and value length when accounting for
/// dynamic table size (RFC 9204 Section 3.2.1).
pub const ENTRY_SIZE_OVERHEAD: u64 = 32;

/// Size of an entry with the given name and value in the dynamic table.
#[inline]
pub fn entry_size(name: &[u8], value: &[u8]) -> u64 {
    name.len() as u64 + value.len() as u64 + ENTRY_SIZE_OVERHEAD
}

/// An HTTP header field (name-value pair).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldLine {
    pub name: Bytes,
    pub value: Bytes,
}

impl FieldLine {
    /// Creates a new field line.
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Returns the size of this field for dynamic table accounting.
    pub fn size(&self) -> u64 {
        entry_size(&self.name, &self.value)
    }
}

impl fmt::Debug for FieldLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FieldLine({:?}: {:?})",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}

impl From<(&'static str, &'static str)> for FieldLine {
    fn from((name, value): (&'static str, &'static str)) -> Self {
        Self::new(name, value)
    }
}
