//! Unidirectional QPACK streams as seen by the stream senders.
//!
//! The encoder and decoder stream senders write through a
//! [`StreamSenderDelegate`]. [`QpackSendStream`] adapts any delegate into
//! a QPACK unidirectional stream by writing the stream type first
//! (RFC 9204 Section 4.2).

use crate::error::Result;
use crate::varint;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cell::RefCell;
use std::rc::Rc;

/// Transport for an outgoing encoder or decoder stream.
pub trait StreamSenderDelegate {
    /// Writes data to the stream. Never fails; the transport buffers.
    fn write_stream_data(&mut self, data: Bytes);

    /// Bytes written but not yet sent by the transport.
    fn num_bytes_buffered(&self) -> u64;
}

/// Unidirectional stream types used by QPACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpackStreamType {
    /// QPACK encoder stream (0x02).
    Encoder,
    /// QPACK decoder stream (0x03).
    Decoder,
}

impl QpackStreamType {
    /// Returns `None` for stream types other than the two QPACK ones.
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0x02 => Some(Self::Encoder),
            0x03 => Some(Self::Decoder),
            _ => None,
        }
    }

    pub fn to_u64(self) -> u64 {
        match self {
            Self::Encoder => 0x02,
            Self::Decoder => 0x03,
        }
    }
}

/// Reads the type at the start of a peer's unidirectional stream.
///
/// Returns `None` if the stream is not a QPACK stream.
pub fn read_stream_type(buf: &mut impl Buf) -> Result<Option<QpackStreamType>> {
    let type_id = varint::decode_buf(buf)?;
    Ok(QpackStreamType::from_u64(type_id))
}

/// Writes the stream type to the beginning of a unidirectional stream.
pub fn write_stream_type(stream_type: QpackStreamType, buf: &mut impl BufMut) -> Result<usize> {
    varint::encode_buf(stream_type.to_u64(), buf)
}

/// Writes the stream type before the first data written to `inner`.
pub struct QpackSendStream<S> {
    stream_type: QpackStreamType,
    stream_type_sent: bool,
    inner: S,
}

impl<S: StreamSenderDelegate> QpackSendStream<S> {
    pub fn new(stream_type: QpackStreamType, inner: S) -> Self {
        Self {
            stream_type,
            stream_type_sent: false,
            inner,
        }
    }

    /// Writes the stream type now, even without instructions to send.
    ///
    /// Peers expect both QPACK streams to be opened early.
    pub fn maybe_send_stream_type(&mut self) {
        if self.stream_type_sent {
            return;
        }
        let mut buf = BytesMut::with_capacity(1);
        let written = write_stream_type(self.stream_type, &mut buf);
        debug_assert!(written.is_ok());
        self.inner.write_stream_data(buf.freeze());
        self.stream_type_sent = true;
    }

    pub fn stream_type(&self) -> QpackStreamType {
        self.stream_type
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: StreamSenderDelegate> StreamSenderDelegate for QpackSendStream<S> {
    fn write_stream_data(&mut self, data: Bytes) {
        if self.stream_type_sent {
            self.inner.write_stream_data(data);
            return;
        }
        let mut buf = BytesMut::with_capacity(1 + data.len());
        let written = write_stream_type(self.stream_type, &mut buf);
        debug_assert!(written.is_ok());
        buf.extend_from_slice(&data);
        self.inner.write_stream_data(buf.freeze());
        self.stream_type_sent = true;
    }

    fn num_bytes_buffered(&self) -> u64 {
        self.inner.num_bytes_buffered()
    }
}

/// In-memory stream: collects written data until taken.
///
/// Clones share the same buffer, so one handle can be given to a sender
/// while another reads what was written.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    buffer: Rc<RefCell<BytesMut>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything written so far.
    pub fn take(&self) -> Bytes {
        self.buffer.borrow_mut().split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buffer.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamSenderDelegate for MemoryStream {
    fn write_stream_data(&mut self, data: Bytes) {
        self.buffer.borrow_mut().extend_from_slice(&data);
    }

    fn num_bytes_buffered(&self) -> u64 {
        self.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_written_once() {
        let memory = MemoryStream::new();
        let mut stream = QpackSendStream::new(QpackStreamType::Encoder, memory.clone());
        stream.write_stream_data(Bytes::from_static(&[0x3f, 0xbd, 0x01]));
        stream.write_stream_data(Bytes::from_static(&[0x00]));
        assert_eq!(&memory.take()[..], &[0x02, 0x3f, 0xbd, 0x01, 0x00]);
        assert!(memory.is_empty());
    }

    #[test]
    fn test_maybe_send_stream_type() {
        let memory = MemoryStream::new();
        let mut stream = QpackSendStream::new(QpackStreamType::Decoder, memory.clone());
        stream.maybe_send_stream_type();
        stream.maybe_send_stream_type();
        assert_eq!(stream.num_bytes_buffered(), 1);
        stream.write_stream_data(Bytes::from_static(&[0x84]));
        assert_eq!(&memory.take()[..], &[0x03, 0x84]);
    }

    #[test]
    fn test_read_stream_type() {
        let memory = MemoryStream::new();
        let mut stream = QpackSendStream::new(QpackStreamType::Encoder, memory.clone());
        stream.write_stream_data(Bytes::from_static(&[0x3f, 0xe1, 0x1f]));

        let mut data = memory.take();
        assert_eq!(read_stream_type(&mut data).unwrap(), Some(QpackStreamType::Encoder));
        assert_eq!(&data[..], &[0x3f, 0xe1, 0x1f]);

        // Control stream.
        let mut control: &[u8] = &[0x00];
        assert_eq!(read_stream_type(&mut control).unwrap(), None);
        // Two-byte varint encoding of 0x03.
        let mut padded: &[u8] = &[0x40, 0x03];
        assert_eq!(read_stream_type(&mut padded).unwrap(), Some(QpackStreamType::Decoder));
        let mut empty: &[u8] = &[];
        assert!(read_stream_type(&mut empty).is_err());
    }
}
