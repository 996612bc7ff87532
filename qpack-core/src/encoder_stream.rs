//! Encoder stream sender and receiver (RFC 9204 Section 4.3).
//!
//! The sender buffers serialized table updates until [`flush`] is called.
//! The receiver decodes table updates and dispatches them to a typed
//! delegate.
//!
//! [`flush`]: QpackEncoderStreamSender::flush

use crate::config::HuffmanEncoding;
use crate::error::ErrorCode;
use crate::instruction_decoder::{
    DecodedValues, InstructionDecoder, InstructionDecoderDelegate, InstructionDecodingError,
};
use crate::instruction_encoder::InstructionEncoder;
use crate::instructions::{Instruction, InstructionKind, InstructionWithValues, ENCODER_STREAM_LANGUAGE};
use crate::send_stream::StreamSenderDelegate;
use bytes::BytesMut;
use tracing::debug;

/// `can_write()` turns false once the transport holds this much.
pub const MAX_BYTES_BUFFERED_BY_STREAM: u64 = 64 * 1024;

/// Serializes encoder stream instructions.
pub struct QpackEncoderStreamSender {
    delegate: Option<Box<dyn StreamSenderDelegate>>,
    instruction_encoder: InstructionEncoder,
    buffer: BytesMut,
}

impl QpackEncoderStreamSender {
    pub fn new(huffman_encoding: HuffmanEncoding) -> Self {
        Self {
            delegate: None,
            instruction_encoder: InstructionEncoder::new(huffman_encoding),
            buffer: BytesMut::new(),
        }
    }

    /// Sets the transport. Must be set before flushing.
    pub fn set_delegate(&mut self, delegate: Box<dyn StreamSenderDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn send_insert_with_name_reference(&mut self, is_static: bool, name_index: u64, value: &[u8]) {
        self.encode(InstructionWithValues::insert_with_name_reference(is_static, name_index, value));
    }

    pub fn send_insert_without_name_reference(&mut self, name: &[u8], value: &[u8]) {
        self.encode(InstructionWithValues::insert_without_name_reference(name, value));
    }

    pub fn send_duplicate(&mut self, index: u64) {
        self.encode(InstructionWithValues::duplicate(index));
    }

    pub fn send_set_dynamic_table_capacity(&mut self, capacity: u64) {
        self.encode(InstructionWithValues::set_dynamic_table_capacity(capacity));
    }

    fn encode(&mut self, instruction: InstructionWithValues<'_>) {
        self.instruction_encoder.encode(&instruction, &mut self.buffer);
    }

    /// Bytes serialized but not yet flushed.
    pub fn buffered_byte_count(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Returns true if the transport can take more data.
    ///
    /// False when no transport is set yet.
    pub fn can_write(&self) -> bool {
        self.delegate.as_ref().is_some_and(|delegate| {
            delegate.num_bytes_buffered() + self.buffered_byte_count() <= MAX_BYTES_BUFFERED_BY_STREAM
        })
    }

    /// Writes buffered instructions to the transport. No-op when empty.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let Some(delegate) = self.delegate.as_mut() else {
            debug!("encoder stream flushed before transport was set");
            return;
        };
        delegate.write_stream_data(self.buffer.split().freeze());
    }
}

/// Receives decoded encoder stream instructions.
pub trait EncoderStreamReceiverDelegate {
    fn on_insert_with_name_reference(&mut self, is_static: bool, name_index: u64, value: &[u8]);
    fn on_insert_without_name_reference(&mut self, name: &[u8], value: &[u8]);
    fn on_duplicate(&mut self, index: u64);
    fn on_set_dynamic_table_capacity(&mut self, capacity: u64);
    /// Malformed encoder stream data. Fatal to the connection.
    fn on_error_detected(&mut self, code: ErrorCode, message: &str);
}

/// Decodes encoder stream data.
#[derive(Debug)]
pub struct QpackEncoderStreamReceiver {
    instruction_decoder: InstructionDecoder,
    error_detected: bool,
}

impl Default for QpackEncoderStreamReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl QpackEncoderStreamReceiver {
    pub fn new() -> Self {
        Self {
            instruction_decoder: InstructionDecoder::new(ENCODER_STREAM_LANGUAGE),
            error_detected: false,
        }
    }

    /// Decodes `data`, calling `delegate` for each complete instruction.
    ///
    /// Once an error has been reported, further data is ignored.
    pub fn decode(&mut self, data: &[u8], delegate: &mut dyn EncoderStreamReceiverDelegate) {
        if data.is_empty() || self.error_detected {
            return;
        }
        let mut dispatch = Dispatch {
            delegate,
            error_detected: &mut self.error_detected,
        };
        self.instruction_decoder.decode(data, &mut dispatch);
    }

    pub fn error_detected(&self) -> bool {
        self.error_detected
    }
}

struct Dispatch<'a> {
    delegate: &'a mut dyn EncoderStreamReceiverDelegate,
    error_detected: &'a mut bool,
}

impl InstructionDecoderDelegate for Dispatch<'_> {
    fn on_instruction_decoded(&mut self, instruction: &'static Instruction, values: &DecodedValues) -> bool {
        match instruction.kind {
            InstructionKind::InsertWithNameReference => {
                self.delegate
                    .on_insert_with_name_reference(values.s_bit(), values.varint(), values.value());
            }
            InstructionKind::InsertWithoutNameReference => {
                self.delegate
                    .on_insert_without_name_reference(values.name(), values.value());
            }
            InstructionKind::Duplicate => self.delegate.on_duplicate(values.varint()),
            InstructionKind::SetDynamicTableCapacity => {
                self.delegate.on_set_dynamic_table_capacity(values.varint());
            }
            other => unreachable!("{:?} is not an encoder stream instruction", other),
        }
        true
    }

    fn on_instruction_decoding_error(&mut self, error: InstructionDecodingError, message: &str) {
        *self.error_detected = true;
        let code = match error {
            InstructionDecodingError::IntegerTooLarge => ErrorCode::EncoderStreamIntegerTooLarge,
            InstructionDecodingError::StringLiteralTooLong => ErrorCode::EncoderStreamStringLiteralTooLong,
            InstructionDecodingError::HuffmanEncodingError => ErrorCode::EncoderStreamHuffmanEncodingError,
        };
        debug!(?code, message, "encoder stream decoding error");
        self.delegate.on_error_detected(code, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_stream::MemoryStream;

    #[derive(Debug, Default, PartialEq, Eq)]
    struct Recorder {
        events: Vec<String>,
        errors: Vec<(ErrorCode, String)>,
    }

    impl EncoderStreamReceiverDelegate for Recorder {
        fn on_insert_with_name_reference(&mut self, is_static: bool, name_index: u64, value: &[u8]) {
            self.events.push(format!(
                "insert_with_name_reference {} {} {}",
                is_static,
                name_index,
                String::from_utf8_lossy(value)
            ));
        }

        fn on_insert_without_name_reference(&mut self, name: &[u8], value: &[u8]) {
            self.events.push(format!(
                "insert_without_name_reference {} {}",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(value)
            ));
        }

        fn on_duplicate(&mut self, index: u64) {
            self.events.push(format!("duplicate {}", index));
        }

        fn on_set_dynamic_table_capacity(&mut self, capacity: u64) {
            self.events.push(format!("set_dynamic_table_capacity {}", capacity));
        }

        fn on_error_detected(&mut self, code: ErrorCode, message: &str) {
            self.errors.push((code, message.to_string()));
        }
    }

    #[test]
    fn test_sender_buffers_until_flush() {
        let memory = MemoryStream::new();
        let mut sender = QpackEncoderStreamSender::new(HuffmanEncoding::Disabled);
        assert!(!sender.can_write());
        sender.set_delegate(Box::new(memory.clone()));
        assert!(sender.can_write());

        sender.send_set_dynamic_table_capacity(220);
        sender.send_duplicate(0);
        assert_eq!(sender.buffered_byte_count(), 4);
        assert!(memory.is_empty());

        sender.flush();
        assert_eq!(sender.buffered_byte_count(), 0);
        assert_eq!(&memory.take()[..], &[0x3f, 0xbd, 0x01, 0x00]);

        // Flushing an empty buffer writes nothing.
        sender.flush();
        assert!(memory.is_empty());
    }

    #[test]
    fn test_can_write_high_water_mark() {
        let memory = MemoryStream::new();
        let mut sender = QpackEncoderStreamSender::new(HuffmanEncoding::Disabled);
        sender.set_delegate(Box::new(memory.clone()));

        let value = vec![b'a'; MAX_BYTES_BUFFERED_BY_STREAM as usize];
        sender.send_insert_without_name_reference(b"big", &value);
        assert!(!sender.can_write());
        sender.flush();
        // Still buffered by the transport.
        assert!(!sender.can_write());
        memory.take();
        assert!(sender.can_write());
    }

    #[test]
    fn test_receiver_round_trip() {
        let memory = MemoryStream::new();
        let mut sender = QpackEncoderStreamSender::new(HuffmanEncoding::Enabled);
        sender.set_delegate(Box::new(memory.clone()));
        sender.send_set_dynamic_table_capacity(220);
        sender.send_insert_with_name_reference(true, 0, b"www.example.com");
        sender.send_insert_with_name_reference(false, 0, b"/sample/path");
        sender.send_insert_without_name_reference(b"custom-key", b"custom-value");
        sender.send_duplicate(2);
        sender.flush();
        let data = memory.take();

        let mut receiver = QpackEncoderStreamReceiver::new();
        let mut recorder = Recorder::default();
        for byte in data.iter() {
            receiver.decode(std::slice::from_ref(byte), &mut recorder);
        }
        assert!(recorder.errors.is_empty());
        assert_eq!(
            recorder.events,
            vec![
                "set_dynamic_table_capacity 220",
                "insert_with_name_reference true 0 www.example.com",
                "insert_with_name_reference false 0 /sample/path",
                "insert_without_name_reference custom-key custom-value",
                "duplicate 2",
            ]
        );
    }

    #[test]
    fn test_receiver_errors() {
        let cases: [(&[u8], ErrorCode, &str); 3] = [
            (
                &[0x3f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01],
                ErrorCode::EncoderStreamIntegerTooLarge,
                "Encoded integer too large.",
            ),
            (
                &[0x5f, 0xe2, 0xff, 0x3f],
                ErrorCode::EncoderStreamStringLiteralTooLong,
                "String literal too long.",
            ),
            (&[0x61, 0x00], ErrorCode::EncoderStreamHuffmanEncodingError, "Error in Huffman-encoded string."),
        ];
        for (data, code, message) in cases {
            let mut receiver = QpackEncoderStreamReceiver::new();
            let mut recorder = Recorder::default();
            receiver.decode(data, &mut recorder);
            assert_eq!(recorder.errors, vec![(code, message.to_string())]);
            assert!(receiver.error_detected());

            // Data after an error is ignored.
            receiver.decode(&[0x00], &mut recorder);
            assert!(recorder.events.is_empty());
            assert_eq!(recorder.errors.len(), 1);
        }
    }
}
