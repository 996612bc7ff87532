//! QPACK configuration and tunable parameters.
//!
//! The two limits that matter for interoperability are advertised to the
//! peer in HTTP/3 SETTINGS; the rest only affect local behavior.

use crate::error::{Error, Result};

/// Whether string literals may be Huffman-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HuffmanEncoding {
    /// Huffman-encode a string whenever that makes it shorter.
    #[default]
    Enabled,
    /// Always send string literals raw.
    Disabled,
}

/// How contract violations inside the engine are reported.
///
/// A contract violation means calling code (not the peer) misused an
/// internal component, for example acknowledging a header block that
/// was never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BugSeverity {
    /// Log with `tracing::error!` and degrade gracefully.
    #[default]
    Log,
    /// Panic. Intended for tests and fuzzing.
    Panic,
}

impl BugSeverity {
    /// Reports a contract violation according to this severity.
    pub(crate) fn report(self, message: &str) {
        match self {
            BugSeverity::Log => tracing::error!(target: "qpack::bug", "{}", message),
            BugSeverity::Panic => panic!("qpack bug: {}", message),
        }
    }
}

/// Configuration for a QPACK encoder/decoder pair.
#[derive(Debug, Clone)]
pub struct QpackConfig {
    /// Maximum dynamic table capacity the local decoder accepts (default: 4 KB).
    ///
    /// RFC 9204 Section 3.2.3: Sent in SETTINGS_QPACK_MAX_TABLE_CAPACITY.
    /// Zero disables the dynamic table.
    pub maximum_dynamic_table_capacity: u64,

    /// Maximum number of streams the local decoder lets block (default: 100).
    ///
    /// RFC 9204 Section 2.1.2: Sent in SETTINGS_QPACK_BLOCKED_STREAMS.
    pub maximum_blocked_streams: u64,

    /// Huffman policy for string literals emitted by the encoder.
    pub huffman_encoding: HuffmanEncoding,

    /// Split `cookie` values at `;` before encoding (default: true).
    ///
    /// RFC 9114 Section 4.2.1: crumbs compress better individually.
    pub cookie_crumbling: bool,

    /// Maximum uncompressed size of a decoded header list (default: 64 KB).
    ///
    /// Each field counts as name length + value length + 32.
    pub max_header_list_size: u64,

    /// Severity of internal contract violations.
    pub bug_severity: BugSeverity,
}

impl Default for QpackConfig {
    fn default() -> Self {
        Self {
            maximum_dynamic_table_capacity: 4096, // 4 KB
            maximum_blocked_streams: 100,
            huffman_encoding: HuffmanEncoding::Enabled,
            cookie_crumbling: true,
            max_header_list_size: 64 * 1024, // 64 KB
            bug_severity: BugSeverity::Log,
        }
    }
}

impl QpackConfig {
    /// Configuration without a dynamic table.
    ///
    /// Every header is sent as a static reference or a literal, so no
    /// stream can ever block.
    pub fn low_memory() -> Self {
        Self {
            maximum_dynamic_table_capacity: 0,
            maximum_blocked_streams: 0,
            max_header_list_size: 16 * 1024, // 16 KB
            ..Default::default()
        }
    }

    /// Configuration with a larger table and more blocked streams.
    pub fn high_throughput() -> Self {
        Self {
            maximum_dynamic_table_capacity: 64 * 1024, // 64 KB
            maximum_blocked_streams: 500,
            max_header_list_size: 256 * 1024, // 256 KB
            ..Default::default()
        }
    }

    /// Validate configuration values are within reasonable bounds.
    pub fn validate(&self) -> Result<()> {
        // max_entries is capacity / 32 and encoded insert counts range up to
        // 2 * max_entries, which must not overflow.
        if self.maximum_dynamic_table_capacity > u64::MAX / 2 {
            return Err(Error::InvalidConfig(
                "maximum_dynamic_table_capacity too large".into(),
            ));
        }
        if self.maximum_dynamic_table_capacity == 0 && self.maximum_blocked_streams != 0 {
            return Err(Error::InvalidConfig(
                "maximum_blocked_streams must be zero without a dynamic table".into(),
            ));
        }
        if self.max_header_list_size == 0 {
            return Err(Error::InvalidConfig("max_header_list_size must be non-zero".into()));
        }
        Ok(())
    }
}
