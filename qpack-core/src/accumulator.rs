//! Collects the output of a progressive decoder into a header list.

use crate::error::{Error, ErrorCode, Result};
use crate::field_line::{FieldLine, ENTRY_SIZE_OVERHEAD};
use crate::progressive_decoder::ProgressiveDecoderHandler;
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// A fully decoded header list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedHeaders {
    /// Decoded fields in block order. Once the size limit is exceeded no
    /// further fields are added.
    pub fields: Vec<FieldLine>,
    /// Sum of name and value lengths of every decoded field.
    pub uncompressed_header_bytes_without_overhead: u64,
    /// Sum of name and value lengths plus 32 per field, counted up to the
    /// field that exceeded the limit.
    pub uncompressed_header_bytes_including_overhead: u64,
    /// True if the list exceeded the configured maximum size. The caller
    /// decides how to reject the message.
    pub header_list_size_limit_exceeded: bool,
}

/// Receives the header list once decoding finishes.
pub trait HeadersVisitor {
    fn on_headers_decoded(&mut self, headers: DecodedHeaders);

    fn on_header_decoding_error(&mut self, code: ErrorCode, message: &str);
}

/// Progressive decoder handler that accumulates decoded fields and hands
/// them to a [`HeadersVisitor`] at the end.
pub struct QpackDecodedHeadersAccumulator<V> {
    visitor: V,
    max_header_list_size: u64,
    headers: DecodedHeaders,
    error_detected: bool,
}

impl<V: HeadersVisitor> QpackDecodedHeadersAccumulator<V> {
    pub fn new(visitor: V, max_header_list_size: u64) -> Self {
        Self {
            visitor,
            max_header_list_size,
            headers: DecodedHeaders::default(),
            error_detected: false,
        }
    }
}

impl<V: HeadersVisitor> ProgressiveDecoderHandler for QpackDecodedHeadersAccumulator<V> {
    fn on_header_decoded(&mut self, name: Bytes, value: Bytes) {
        debug_assert!(!self.error_detected);
        let length = (name.len() + value.len()) as u64;
        self.headers.uncompressed_header_bytes_without_overhead += length;

        if self.headers.header_list_size_limit_exceeded {
            return;
        }

        self.headers.uncompressed_header_bytes_including_overhead += length + ENTRY_SIZE_OVERHEAD;
        if self.headers.uncompressed_header_bytes_including_overhead > self.max_header_list_size {
            debug!(
                limit = self.max_header_list_size,
                "header list size limit exceeded"
            );
            self.headers.header_list_size_limit_exceeded = true;
        }
        self.headers.fields.push(FieldLine { name, value });
    }

    fn on_decoding_completed(&mut self) {
        debug_assert!(!self.error_detected);
        self.visitor
            .on_headers_decoded(std::mem::take(&mut self.headers));
    }

    fn on_decoding_error_detected(&mut self, code: ErrorCode, message: &str) {
        debug_assert!(!self.error_detected);
        self.error_detected = true;
        self.visitor.on_header_decoding_error(code, message);
    }
}

/// Shared slot a [`HeadersVisitor`] writes its outcome into.
///
/// Clones share the slot, so one clone can be handed to an accumulator
/// while another is kept to collect the result.
#[derive(Debug, Clone, Default)]
pub struct HeadersSlot(Rc<RefCell<Option<Result<DecodedHeaders>>>>);

impl HeadersSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the outcome, if decoding has finished.
    pub fn take(&self) -> Option<Result<DecodedHeaders>> {
        self.0.borrow_mut().take()
    }

    pub fn is_ready(&self) -> bool {
        self.0.borrow().is_some()
    }
}

impl HeadersVisitor for HeadersSlot {
    fn on_headers_decoded(&mut self, headers: DecodedHeaders) {
        *self.0.borrow_mut() = Some(Ok(headers));
    }

    fn on_header_decoding_error(&mut self, code: ErrorCode, message: &str) {
        *self.0.borrow_mut() = Some(Err(Error::from_code(code, message)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator(limit: u64) -> (QpackDecodedHeadersAccumulator<HeadersSlot>, HeadersSlot) {
        let slot = HeadersSlot::new();
        (QpackDecodedHeadersAccumulator::new(slot.clone(), limit), slot)
    }

    #[test]
    fn test_collects_headers() {
        let (mut accumulator, slot) = accumulator(1024);
        accumulator.on_header_decoded(Bytes::from_static(b":status"), Bytes::from_static(b"200"));
        accumulator.on_header_decoded(Bytes::from_static(b"server"), Bytes::from_static(b"quicd"));
        assert!(!slot.is_ready());
        accumulator.on_decoding_completed();

        let headers = slot.take().unwrap().unwrap();
        assert_eq!(
            headers.fields,
            vec![FieldLine::new(":status", "200"), FieldLine::new("server", "quicd")]
        );
        assert_eq!(headers.uncompressed_header_bytes_without_overhead, 21);
        assert_eq!(headers.uncompressed_header_bytes_including_overhead, 85);
        assert!(!headers.header_list_size_limit_exceeded);
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_size_limit() {
        // The first field takes 32 + 4 bytes, the second pushes past 50.
        let (mut accumulator, slot) = accumulator(50);
        accumulator.on_header_decoded(Bytes::from_static(b"ab"), Bytes::from_static(b"cd"));
        accumulator.on_header_decoded(Bytes::from_static(b"ef"), Bytes::from_static(b"gh"));
        accumulator.on_header_decoded(Bytes::from_static(b"ij"), Bytes::from_static(b"kl"));
        accumulator.on_decoding_completed();

        let headers = slot.take().unwrap().unwrap();
        assert!(headers.header_list_size_limit_exceeded);
        assert_eq!(headers.fields.len(), 2);
        assert_eq!(headers.uncompressed_header_bytes_including_overhead, 72);
        assert_eq!(headers.uncompressed_header_bytes_without_overhead, 12);
    }

    #[test]
    fn test_error() {
        let (mut accumulator, slot) = accumulator(1024);
        accumulator.on_decoding_error_detected(ErrorCode::DecompressionFailed, "Invalid relative index.");
        let error = slot.take().unwrap().unwrap_err();
        assert_eq!(error, Error::DecompressionFailed("Invalid relative index.".into()));
        assert!(!error.is_connection_error());
    }
}
