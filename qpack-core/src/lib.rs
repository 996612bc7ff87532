//! QPACK: Header Compression for HTTP/3 (RFC 9204)
//!
//! This crate implements the QPACK engine: the instruction codec, the
//! static and dynamic header tables, the encoder and decoder streams,
//! progressive decoding of header blocks that may block on the dynamic
//! table, and tracking of blocked streams on the encoder side.
//!
//! # Features
//!
//! - **Progressive decoding**: header blocks can arrive in fragments and
//!   block until the encoder stream delivers the entries they refer to.
//! - **Blocked stream limits**: the encoder never blocks more streams than
//!   the peer allows, and the decoder enforces its own limit.
//! - **Transport agnostic**: encoder and decoder stream data is written
//!   through [`StreamSenderDelegate`] and read from plain byte slices.
//! - **Zero-copy**: dynamic table entries and decoded fields are `Bytes`.
//!
//! # Example
//!
//! ```rust
//! use qpack_core::{
//!     FieldLine, HeadersSlot, MemoryStream, QpackConfig, QpackDecodedHeadersAccumulator,
//!     QpackDecoder, QpackEncoder,
//! };
//!
//! let config = QpackConfig::default();
//!
//! // Encoder side, configured from the peer's SETTINGS.
//! let encoder_stream = MemoryStream::new();
//! let mut encoder = QpackEncoder::new(&config);
//! encoder.set_encoder_stream_delegate(Box::new(encoder_stream.clone()));
//! encoder.set_maximum_dynamic_table_capacity(config.maximum_dynamic_table_capacity);
//! encoder.set_dynamic_table_capacity(config.maximum_dynamic_table_capacity).unwrap();
//! encoder.set_maximum_blocked_streams(config.maximum_blocked_streams);
//!
//! let headers = vec![
//!     FieldLine::new(":method", "GET"),
//!     FieldLine::new(":path", "/"),
//!     FieldLine::new("user-agent", "quicd"),
//! ];
//! let header_block = encoder.encode_header_list(0, &headers);
//!
//! // Decoder side.
//! let decoder_stream = MemoryStream::new();
//! let mut decoder = QpackDecoder::new(&config).unwrap();
//! decoder.set_decoder_stream_delegate(Box::new(decoder_stream.clone()));
//! decoder.decode_encoder_stream_data(&encoder_stream.take()).unwrap();
//!
//! let slot = HeadersSlot::new();
//! let accumulator = QpackDecodedHeadersAccumulator::new(slot.clone(), config.max_header_list_size);
//! decoder.create_progressive_decoder(0, Box::new(accumulator)).unwrap();
//! decoder.decode(0, &header_block).unwrap();
//! decoder.end_header_block(0).unwrap();
//!
//! let decoded = slot.take().unwrap().unwrap();
//! assert_eq!(decoded.fields, headers);
//!
//! // The acknowledgement flows back to the encoder.
//! decoder.flush_decoder_stream();
//! encoder.decode_decoder_stream_data(&decoder_stream.take()).unwrap();
//! assert_eq!(encoder.blocking_manager().blocked_stream_count(), 0);
//! ```

pub mod accumulator;
pub mod blocking_manager;
pub mod config;
pub mod decoder;
pub mod decoder_stream;
pub mod encoder;
pub mod encoder_stream;
pub mod error;
pub mod field_line;
pub mod header_table;
pub mod huffman;
pub mod index;
pub mod instruction_decoder;
pub mod instruction_encoder;
pub mod instructions;
pub mod integer;
pub mod progressive_decoder;
pub mod send_stream;
pub mod static_table;
pub mod value_splitting;
pub mod varint;

// Re-export main types
pub use accumulator::{DecodedHeaders, HeadersSlot, HeadersVisitor, QpackDecodedHeadersAccumulator};
pub use blocking_manager::{IndexSet, QpackBlockingManager};
pub use config::{BugSeverity, HuffmanEncoding, QpackConfig};
pub use decoder::QpackDecoder;
pub use encoder::QpackEncoder;
pub use error::{Error, ErrorCode, Result};
pub use field_line::FieldLine;
pub use header_table::{QpackDecoderHeaderTable, QpackEncoderHeaderTable};
pub use progressive_decoder::{ProgressiveDecoderHandler, QpackProgressiveDecoder};
pub use send_stream::{
    read_stream_type, write_stream_type, MemoryStream, QpackSendStream, QpackStreamType,
    StreamSenderDelegate,
};
