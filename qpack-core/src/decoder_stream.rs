//! Decoder stream sender and receiver (RFC 9204 Section 4.4).

use crate::config::HuffmanEncoding;
use crate::error::ErrorCode;
use crate::instruction_decoder::{
    DecodedValues, InstructionDecoder, InstructionDecoderDelegate, InstructionDecodingError,
};
use crate::instruction_encoder::InstructionEncoder;
use crate::instructions::{Instruction, InstructionKind, InstructionWithValues, DECODER_STREAM_LANGUAGE};
use crate::send_stream::StreamSenderDelegate;
use bytes::BytesMut;
use tracing::debug;

/// Serializes decoder stream instructions.
pub struct QpackDecoderStreamSender {
    delegate: Option<Box<dyn StreamSenderDelegate>>,
    instruction_encoder: InstructionEncoder,
    buffer: BytesMut,
}

impl Default for QpackDecoderStreamSender {
    fn default() -> Self {
        Self::new()
    }
}

impl QpackDecoderStreamSender {
    pub fn new() -> Self {
        Self {
            delegate: None,
            // Decoder stream instructions carry no strings.
            instruction_encoder: InstructionEncoder::new(HuffmanEncoding::Disabled),
            buffer: BytesMut::new(),
        }
    }

    /// Sets the transport. Must be set before flushing.
    pub fn set_delegate(&mut self, delegate: Box<dyn StreamSenderDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn send_insert_count_increment(&mut self, increment: u64) {
        self.encode(InstructionWithValues::insert_count_increment(increment));
    }

    pub fn send_header_acknowledgement(&mut self, stream_id: u64) {
        self.encode(InstructionWithValues::header_acknowledgement(stream_id));
    }

    pub fn send_stream_cancellation(&mut self, stream_id: u64) {
        self.encode(InstructionWithValues::stream_cancellation(stream_id));
    }

    fn encode(&mut self, instruction: InstructionWithValues<'_>) {
        self.instruction_encoder.encode(&instruction, &mut self.buffer);
    }

    pub fn buffered_byte_count(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Writes buffered instructions to the transport. No-op when empty.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let Some(delegate) = self.delegate.as_mut() else {
            debug!("decoder stream flushed before transport was set");
            return;
        };
        delegate.write_stream_data(self.buffer.split().freeze());
    }
}

/// Receives decoded decoder stream instructions.
pub trait DecoderStreamReceiverDelegate {
    fn on_insert_count_increment(&mut self, increment: u64);
    fn on_header_acknowledgement(&mut self, stream_id: u64);
    fn on_stream_cancellation(&mut self, stream_id: u64);
    /// Malformed decoder stream data. Fatal to the connection.
    fn on_error_detected(&mut self, code: ErrorCode, message: &str);
}

/// Decodes decoder stream data.
#[derive(Debug)]
pub struct QpackDecoderStreamReceiver {
    instruction_decoder: InstructionDecoder,
    error_detected: bool,
}

impl Default for QpackDecoderStreamReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl QpackDecoderStreamReceiver {
    pub fn new() -> Self {
        Self {
            instruction_decoder: InstructionDecoder::new(DECODER_STREAM_LANGUAGE),
            error_detected: false,
        }
    }

    /// Decodes `data`, calling `delegate` for each complete instruction.
    ///
    /// Once an error has been reported, further data is ignored.
    pub fn decode(&mut self, data: &[u8], delegate: &mut dyn DecoderStreamReceiverDelegate) {
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
    delegate: &'a mut dyn DecoderStreamReceiverDelegate,
    error_detected: &'a mut bool,
}

impl InstructionDecoderDelegate for Dispatch<'_> {
    fn on_instruction_decoded(&mut self, instruction: &'static Instruction, values: &DecodedValues) -> bool {
        match instruction.kind {
            InstructionKind::InsertCountIncrement => self.delegate.on_insert_count_increment(values.varint()),
            InstructionKind::HeaderAcknowledgement => self.delegate.on_header_acknowledgement(values.varint()),
            InstructionKind::StreamCancellation => self.delegate.on_stream_cancellation(values.varint()),
            other => unreachable!("{:?} is not a decoder stream instruction", other),
        }
        true
    }

    fn on_instruction_decoding_error(&mut self, error: InstructionDecodingError, message: &str) {
        *self.error_detected = true;
        // Decoder stream instructions have no string fields.
        debug_assert_eq!(error, InstructionDecodingError::IntegerTooLarge);
        let code = ErrorCode::DecoderStreamIntegerTooLarge;
        debug!(?code, message, "decoder stream decoding error");
        self.delegate.on_error_detected(code, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_stream::MemoryStream;

    #[derive(Default)]
    struct Recorder {
        increments: Vec<u64>,
        acknowledgements: Vec<u64>,
        cancellations: Vec<u64>,
        errors: Vec<(ErrorCode, String)>,
    }

    impl DecoderStreamReceiverDelegate for Recorder {
        fn on_insert_count_increment(&mut self, increment: u64) {
            self.increments.push(increment);
        }

        fn on_header_acknowledgement(&mut self, stream_id: u64) {
            self.acknowledgements.push(stream_id);
        }

        fn on_stream_cancellation(&mut self, stream_id: u64) {
            self.cancellations.push(stream_id);
        }

        fn on_error_detected(&mut self, code: ErrorCode, message: &str) {
            self.errors.push((code, message.to_string()));
        }
    }

    #[test]
    fn test_sender_wire_format() {
        let memory = MemoryStream::new();
        let mut sender = QpackDecoderStreamSender::new();
        sender.set_delegate(Box::new(memory.clone()));

        sender.send_header_acknowledgement(4);
        sender.send_insert_count_increment(1);
        sender.send_stream_cancellation(8);
        sender.send_insert_count_increment(200);
        assert!(memory.is_empty());
        sender.flush();
        assert_eq!(&memory.take()[..], &[0x84, 0x01, 0x48, 0x3f, 0x89, 0x01]);
    }

    #[test]
    fn test_receiver_round_trip() {
        let memory = MemoryStream::new();
        let mut sender = QpackDecoderStreamSender::new();
        sender.set_delegate(Box::new(memory.clone()));
        sender.send_insert_count_increment(1337);
        sender.send_header_acknowledgement(0);
        sender.send_stream_cancellation(u64::MAX);
        sender.flush();

        let mut receiver = QpackDecoderStreamReceiver::new();
        let mut recorder = Recorder::default();
        for chunk in memory.take().chunks(2) {
            receiver.decode(chunk, &mut recorder);
        }
        assert!(recorder.errors.is_empty());
        assert_eq!(recorder.increments, vec![1337]);
        assert_eq!(recorder.acknowledgements, vec![0]);
        assert_eq!(recorder.cancellations, vec![u64::MAX]);
    }

    #[test]
    fn test_integer_too_large() {
        let mut receiver = QpackDecoderStreamReceiver::new();
        let mut recorder = Recorder::default();
        let data = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        receiver.decode(&data, &mut recorder);
        assert_eq!(
            recorder.errors,
            vec![(ErrorCode::DecoderStreamIntegerTooLarge, "Encoded integer too large.".to_string())]
        );
        receiver.decode(&[0x01], &mut recorder);
        assert!(recorder.increments.is_empty());
    }
}
