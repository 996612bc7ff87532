//! Error types for QPACK operations.
//!
//! Every failure the engine can detect is described by an [`ErrorCode`].
//! Codes are grouped by the stream they are fatal to, and each group maps
//! onto one of the HTTP/3 error codes from RFC 9204 Section 6.

use thiserror::Error;

/// Result type for QPACK operations.
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP/3 error code `QPACK_DECOMPRESSION_FAILED`.
pub const QPACK_DECOMPRESSION_FAILED: u64 = 0x0200;
/// HTTP/3 error code `QPACK_ENCODER_STREAM_ERROR`.
pub const QPACK_ENCODER_STREAM_ERROR: u64 = 0x0201;
/// HTTP/3 error code `QPACK_DECODER_STREAM_ERROR`.
pub const QPACK_DECODER_STREAM_ERROR: u64 = 0x0202;
/// HTTP/3 error code `H3_INTERNAL_ERROR`.
pub const H3_INTERNAL_ERROR: u64 = 0x0102;

/// Detailed failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A header block could not be decoded.
    DecompressionFailed,

    /// Encoder stream: integer exceeds the decodable range.
    EncoderStreamIntegerTooLarge,
    /// Encoder stream: string literal exceeds the length limit.
    EncoderStreamStringLiteralTooLong,
    /// Encoder stream: malformed Huffman-encoded string.
    EncoderStreamHuffmanEncodingError,
    /// Encoder stream: name reference to a nonexistent static entry.
    EncoderStreamInvalidStaticEntry,
    /// Encoder stream: entry with static name does not fit the table.
    EncoderStreamErrorInsertingStatic,
    /// Encoder stream: relative index of a name reference out of range.
    EncoderStreamInsertionInvalidRelativeIndex,
    /// Encoder stream: name reference to an evicted dynamic entry.
    EncoderStreamInsertionDynamicEntryNotFound,
    /// Encoder stream: entry with dynamic name does not fit the table.
    EncoderStreamErrorInsertingDynamic,
    /// Encoder stream: entry with literal name does not fit the table.
    EncoderStreamErrorInsertingLiteral,
    /// Encoder stream: relative index of a Duplicate out of range.
    EncoderStreamDuplicateInvalidRelativeIndex,
    /// Encoder stream: Duplicate of an evicted dynamic entry.
    EncoderStreamDuplicateDynamicEntryNotFound,
    /// Encoder stream: capacity exceeds the advertised maximum.
    EncoderStreamSetDynamicTableCapacity,

    /// Decoder stream: integer exceeds the decodable range.
    DecoderStreamIntegerTooLarge,
    /// Decoder stream: Insert Count Increment of zero.
    DecoderStreamInvalidZeroIncrement,
    /// Decoder stream: Insert Count Increment overflows Known Received Count.
    DecoderStreamIncrementOverflow,
    /// Decoder stream: Known Received Count exceeds the number of insertions.
    DecoderStreamImpossibleInsertCount,
    /// Decoder stream: acknowledgement for a stream with nothing outstanding.
    DecoderStreamIncorrectAcknowledgement,

    /// Unexpected condition inside the engine.
    InternalError,
}

impl ErrorCode {
    /// Returns the HTTP/3 error code the connection must be closed with.
    pub fn http3_error_code(self) -> u64 {
        match self {
            ErrorCode::DecompressionFailed => QPACK_DECOMPRESSION_FAILED,
            ErrorCode::EncoderStreamIntegerTooLarge
            | ErrorCode::EncoderStreamStringLiteralTooLong
            | ErrorCode::EncoderStreamHuffmanEncodingError
            | ErrorCode::EncoderStreamInvalidStaticEntry
            | ErrorCode::EncoderStreamErrorInsertingStatic
            | ErrorCode::EncoderStreamInsertionInvalidRelativeIndex
            | ErrorCode::EncoderStreamInsertionDynamicEntryNotFound
            | ErrorCode::EncoderStreamErrorInsertingDynamic
            | ErrorCode::EncoderStreamErrorInsertingLiteral
            | ErrorCode::EncoderStreamDuplicateInvalidRelativeIndex
            | ErrorCode::EncoderStreamDuplicateDynamicEntryNotFound
            | ErrorCode::EncoderStreamSetDynamicTableCapacity => QPACK_ENCODER_STREAM_ERROR,
            ErrorCode::DecoderStreamIntegerTooLarge
            | ErrorCode::DecoderStreamInvalidZeroIncrement
            | ErrorCode::DecoderStreamIncrementOverflow
            | ErrorCode::DecoderStreamImpossibleInsertCount
            | ErrorCode::DecoderStreamIncorrectAcknowledgement => QPACK_DECODER_STREAM_ERROR,
            ErrorCode::InternalError => H3_INTERNAL_ERROR,
        }
    }
}

/// Errors that can occur during QPACK operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Decoding of a header block failed.
    ///
    /// Maps to HTTP/3 error code `QPACK_DECOMPRESSION_FAILED` (0x0200).
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Invalid data received on the encoder stream.
    ///
    /// Maps to HTTP/3 error code `QPACK_ENCODER_STREAM_ERROR` (0x0201).
    #[error("encoder stream error ({code:?}): {message}")]
    EncoderStream { code: ErrorCode, message: String },

    /// Invalid data received on the decoder stream.
    ///
    /// Maps to HTTP/3 error code `QPACK_DECODER_STREAM_ERROR` (0x0202).
    #[error("decoder stream error ({code:?}): {message}")]
    DecoderStream { code: ErrorCode, message: String },

    /// No header block is being decoded on the given stream.
    #[error("no header block in progress on stream {0}")]
    UnknownStream(u64),

    /// Configuration or setting out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected condition inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds the error variant that corresponds to `code`.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code.http3_error_code() {
            QPACK_DECOMPRESSION_FAILED => Error::DecompressionFailed(message),
            QPACK_ENCODER_STREAM_ERROR => Error::EncoderStream { code, message },
            QPACK_DECODER_STREAM_ERROR => Error::DecoderStream { code, message },
            _ => Error::Internal(message),
        }
    }

    /// Returns the HTTP/3 error code for this error.
    pub fn http3_error_code(&self) -> u64 {
        match self {
            Error::DecompressionFailed(_) | Error::UnknownStream(_) => QPACK_DECOMPRESSION_FAILED,
            Error::EncoderStream { code, .. } | Error::DecoderStream { code, .. } => {
                code.http3_error_code()
            }
            Error::InvalidConfig(_) | Error::Internal(_) => H3_INTERNAL_ERROR,
        }
    }

    /// Returns true if the whole connection must be closed.
    ///
    /// Header block failures only affect one request stream.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::EncoderStream { .. } | Error::DecoderStream { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::DecompressionFailed("test".into()).http3_error_code(), 0x0200);
        assert_eq!(
            Error::from_code(ErrorCode::EncoderStreamIntegerTooLarge, "test").http3_error_code(),
            0x0201
        );
        assert_eq!(
            Error::from_code(ErrorCode::DecoderStreamIncrementOverflow, "test").http3_error_code(),
            0x0202
        );
    }

    #[test]
    fn test_from_code_picks_variant() {
        assert!(matches!(
            Error::from_code(ErrorCode::DecompressionFailed, "x"),
            Error::DecompressionFailed(_)
        ));
        assert!(matches!(
            Error::from_code(ErrorCode::EncoderStreamErrorInsertingLiteral, "x"),
            Error::EncoderStream { code: ErrorCode::EncoderStreamErrorInsertingLiteral, .. }
        ));
        assert!(matches!(
            Error::from_code(ErrorCode::InternalError, "x"),
            Error::Internal(_)
        ));
    }

    #[test]
    fn test_connection_errors() {
        assert!(!Error::DecompressionFailed("x".into()).is_connection_error());
        assert!(Error::from_code(ErrorCode::DecoderStreamIncorrectAcknowledgement, "x")
            .is_connection_error());
    }
}
