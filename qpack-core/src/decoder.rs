//! QPACK decoder (RFC 9204 Section 2.2).
//!
//! [`QpackDecoder`] owns the decoder side of the dynamic table. It applies
//! instructions from the peer's encoder stream, drives one
//! [`QpackProgressiveDecoder`] per request stream, and reports progress to
//! the peer on the decoder stream.

use crate::config::QpackConfig;
use crate::decoder_stream::QpackDecoderStreamSender;
use crate::encoder_stream::{EncoderStreamReceiverDelegate, QpackEncoderStreamReceiver};
use crate::error::{Error, ErrorCode, Result};
use crate::header_table::QpackDecoderHeaderTable;
use crate::index::encoder_stream_relative_to_absolute;
use crate::progressive_decoder::{
    BlockedStreamLimitEnforcer, DecodeContext, DecodingCompletedVisitor, ProgressiveDecoderHandler,
    QpackProgressiveDecoder,
};
use crate::send_stream::StreamSenderDelegate;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, warn};

/// Decoder stream sender plus the insert count the peer has been told
/// about.
struct Acknowledger {
    decoder_stream_sender: QpackDecoderStreamSender,
    known_received_count: u64,
}

impl Acknowledger {
    /// Acknowledges a completed header block and reports any inserts the
    /// acknowledgement does not cover.
    fn on_decoding_completed(&mut self, stream_id: u64, required_insert_count: u64, inserted_entry_count: u64) {
        if required_insert_count > 0 {
            self.decoder_stream_sender
                .send_header_acknowledgement(stream_id);
            if self.known_received_count < required_insert_count {
                self.known_received_count = required_insert_count;
            }
        }

        if self.known_received_count < inserted_entry_count {
            self.decoder_stream_sender
                .send_insert_count_increment(inserted_entry_count - self.known_received_count);
            self.known_received_count = inserted_entry_count;
        }
    }
}

struct CompletionVisitor<'a> {
    acknowledger: &'a mut Acknowledger,
    inserted_entry_count: u64,
}

impl DecodingCompletedVisitor for CompletionVisitor<'_> {
    fn on_decoding_completed(&mut self, stream_id: u64, required_insert_count: u64) {
        trace!(stream_id, required_insert_count, "header block decoded");
        self.acknowledger
            .on_decoding_completed(stream_id, required_insert_count, self.inserted_entry_count);
    }
}

/// Enforces SETTINGS_QPACK_BLOCKED_STREAMS.
struct BlockedStreams {
    streams: HashSet<u64>,
    maximum: u64,
}

impl BlockedStreamLimitEnforcer for BlockedStreams {
    fn on_stream_blocked(&mut self, stream_id: u64) -> bool {
        if self.streams.len() as u64 >= self.maximum {
            return false;
        }
        self.streams.insert(stream_id);
        true
    }

    fn on_stream_unblocked(&mut self, stream_id: u64) {
        let removed = self.streams.remove(&stream_id);
        debug_assert!(removed, "stream {} was not blocked", stream_id);
    }
}

/// True once `decoder` may be dropped. A decoder that failed before the
/// end of its header block stays until `end_header_block()` so that later
/// calls for the stream are ignored rather than rejected.
fn is_finished(decoder: &QpackProgressiveDecoder) -> bool {
    decoder.is_done() && !decoder.is_decoding()
}

/// Runs `f` on `decoder` with a context built from the decoder's
/// collaborators.
fn with_context(
    header_table: &mut QpackDecoderHeaderTable,
    blocked_streams: &mut BlockedStreams,
    acknowledger: &mut Acknowledger,
    decoder: &mut QpackProgressiveDecoder,
    f: impl FnOnce(&mut QpackProgressiveDecoder, &mut DecodeContext<'_>),
) {
    let mut visitor = CompletionVisitor {
        inserted_entry_count: header_table.inserted_entry_count(),
        acknowledger,
    };
    let mut ctx = DecodeContext {
        header_table,
        enforcer: blocked_streams,
        visitor: &mut visitor,
    };
    f(decoder, &mut ctx);
}

/// Decodes header blocks and processes the peer's encoder stream.
pub struct QpackDecoder {
    header_table: QpackDecoderHeaderTable,
    encoder_stream_receiver: QpackEncoderStreamReceiver,
    acknowledger: Acknowledger,
    blocked_streams: BlockedStreams,
    decoders: HashMap<u64, QpackProgressiveDecoder>,
    encoder_stream_error: Option<Error>,
}

impl QpackDecoder {
    /// Creates a decoder that accepts the limits in `config`, which are
    /// the values advertised to the peer.
    pub fn new(config: &QpackConfig) -> Result<Self> {
        config.validate()?;
        let mut header_table = QpackDecoderHeaderTable::new();
        header_table
            .base_mut()
            .set_maximum_dynamic_table_capacity(config.maximum_dynamic_table_capacity);
        Ok(Self {
            header_table,
            encoder_stream_receiver: QpackEncoderStreamReceiver::new(),
            acknowledger: Acknowledger {
                decoder_stream_sender: QpackDecoderStreamSender::new(),
                known_received_count: 0,
            },
            blocked_streams: BlockedStreams {
                streams: HashSet::new(),
                maximum: config.maximum_blocked_streams,
            },
            decoders: HashMap::new(),
            encoder_stream_error: None,
        })
    }

    /// Sets the transport for the decoder stream.
    pub fn set_decoder_stream_delegate(&mut self, delegate: Box<dyn StreamSenderDelegate>) {
        self.acknowledger.decoder_stream_sender.set_delegate(delegate);
    }

    /// Starts decoding a header block on `stream_id`; `handler` receives
    /// the result.
    ///
    /// Fails if a header block is already being decoded on the stream.
    pub fn create_progressive_decoder(
        &mut self,
        stream_id: u64,
        handler: Box<dyn ProgressiveDecoderHandler>,
    ) -> Result<()> {
        if self.decoders.contains_key(&stream_id) {
            return Err(Error::Internal(format!(
                "header block already in progress on stream {}",
                stream_id
            )));
        }
        self.decoders
            .insert(stream_id, QpackProgressiveDecoder::new(stream_id, handler));
        Ok(())
    }

    /// Feeds header block data received on `stream_id`.
    ///
    /// Decoding errors go to the stream's handler. Later data for the
    /// stream is ignored until `end_header_block()` or `on_stream_reset()`.
    pub fn decode(&mut self, stream_id: u64, data: &[u8]) -> Result<()> {
        self.run(stream_id, |decoder, ctx| decoder.decode(data, ctx))
    }

    /// Signals the end of the header block on `stream_id`.
    pub fn end_header_block(&mut self, stream_id: u64) -> Result<()> {
        self.run(stream_id, |decoder, ctx| decoder.end_header_block(ctx))
    }

    fn run(
        &mut self,
        stream_id: u64,
        f: impl FnOnce(&mut QpackProgressiveDecoder, &mut DecodeContext<'_>),
    ) -> Result<()> {
        let Some(decoder) = self.decoders.get_mut(&stream_id) else {
            return Err(Error::UnknownStream(stream_id));
        };
        if decoder.is_done() {
            trace!(stream_id, "ignoring header block data after error");
        }
        with_context(
            &mut self.header_table,
            &mut self.blocked_streams,
            &mut self.acknowledger,
            decoder,
            f,
        );
        if is_finished(decoder) {
            self.decoders.remove(&stream_id);
        }
        Ok(())
    }

    /// Abandons any header block on `stream_id` and tells the peer.
    pub fn on_stream_reset(&mut self, stream_id: u64) {
        if let Some(mut decoder) = self.decoders.remove(&stream_id) {
            decoder.release(&mut self.header_table, &mut self.blocked_streams);
        }
        // Without a dynamic table there is nothing to cancel.
        if self.header_table.base().maximum_dynamic_table_capacity() > 0 {
            self.acknowledger
                .decoder_stream_sender
                .send_stream_cancellation(stream_id);
            self.acknowledger.decoder_stream_sender.flush();
        }
        debug!(stream_id, "stream reset");
    }

    /// Processes data received on the peer's encoder stream.
    ///
    /// Any error is fatal to the connection; once one has been returned,
    /// every later call returns it again.
    pub fn decode_encoder_stream_data(&mut self, data: &[u8]) -> Result<()> {
        if let Some(error) = &self.encoder_stream_error {
            return Err(error.clone());
        }

        let mut handler = EncoderStreamHandler {
            header_table: &mut self.header_table,
            blocked_streams: &mut self.blocked_streams,
            acknowledger: &mut self.acknowledger,
            decoders: &mut self.decoders,
            error: None,
        };
        self.encoder_stream_receiver.decode(data, &mut handler);

        if let Some(error) = handler.error {
            warn!(%error, "encoder stream error");
            self.encoder_stream_error = Some(error.clone());
            return Err(error);
        }
        Ok(())
    }

    /// Writes pending decoder stream instructions to the transport.
    ///
    /// Header Acknowledgements and Insert Count Increments are buffered
    /// so that several can go out together.
    pub fn flush_decoder_stream(&mut self) {
        self.acknowledger.decoder_stream_sender.flush();
    }

    pub fn header_table(&self) -> &QpackDecoderHeaderTable {
        &self.header_table
    }

    /// Insert count last reported to the peer.
    pub fn known_received_count(&self) -> u64 {
        self.acknowledger.known_received_count
    }

    pub fn blocked_stream_count(&self) -> usize {
        self.blocked_streams.streams.len()
    }

    /// True if a header block is being decoded on `stream_id`.
    pub fn has_decoder(&self, stream_id: u64) -> bool {
        self.decoders.contains_key(&stream_id)
    }
}

impl Drop for QpackDecoder {
    fn drop(&mut self) {
        for (_, mut decoder) in self.decoders.drain() {
            decoder.cancel();
            decoder.release(&mut self.header_table, &mut self.blocked_streams);
        }
    }
}

struct EncoderStreamHandler<'a> {
    header_table: &'a mut QpackDecoderHeaderTable,
    blocked_streams: &'a mut BlockedStreams,
    acknowledger: &'a mut Acknowledger,
    decoders: &'a mut HashMap<u64, QpackProgressiveDecoder>,
    error: Option<Error>,
}

impl EncoderStreamHandler<'_> {
    fn fail(&mut self, code: ErrorCode, message: &str) {
        if self.error.is_none() {
            self.error = Some(Error::from_code(code, message));
        }
    }

    /// Inserts an entry and resumes the decoders it unblocks.
    fn insert(&mut self, name: Bytes, value: Bytes) {
        let reached = self.header_table.insert_entry(name, value);
        for stream_id in reached {
            let Some(decoder) = self.decoders.get_mut(&stream_id) else {
                continue;
            };
            with_context(
                self.header_table,
                self.blocked_streams,
                self.acknowledger,
                decoder,
                |decoder, ctx| decoder.on_insert_count_reached_threshold(ctx),
            );
            if is_finished(decoder) {
                self.decoders.remove(&stream_id);
            }
        }
    }
}

impl EncoderStreamReceiverDelegate for EncoderStreamHandler<'_> {
    fn on_insert_with_name_reference(&mut self, is_static: bool, name_index: u64, value: &[u8]) {
        if self.error.is_some() {
            return;
        }

        if is_static {
            let Some((name, _)) = self.header_table.lookup_entry(true, name_index) else {
                self.fail(ErrorCode::EncoderStreamInvalidStaticEntry, "Invalid static table entry.");
                return;
            };
            if !self
                .header_table
                .base()
                .entry_fits_dynamic_table_capacity(&name, value)
            {
                self.fail(
                    ErrorCode::EncoderStreamErrorInsertingStatic,
                    "Error inserting entry with name reference.",
                );
                return;
            }
            self.insert(name, Bytes::copy_from_slice(value));
            return;
        }

        let Some(absolute_index) =
            encoder_stream_relative_to_absolute(name_index, self.header_table.inserted_entry_count())
        else {
            self.fail(
                ErrorCode::EncoderStreamInsertionInvalidRelativeIndex,
                "Invalid relative index.",
            );
            return;
        };
        let Some((name, _)) = self.header_table.lookup_entry(false, absolute_index) else {
            self.fail(
                ErrorCode::EncoderStreamInsertionDynamicEntryNotFound,
                "Dynamic table entry not found.",
            );
            return;
        };
        if !self
            .header_table
            .base()
            .entry_fits_dynamic_table_capacity(&name, value)
        {
            self.fail(
                ErrorCode::EncoderStreamErrorInsertingDynamic,
                "Error inserting entry with name reference.",
            );
            return;
        }
        self.insert(name, Bytes::copy_from_slice(value));
    }

    fn on_insert_without_name_reference(&mut self, name: &[u8], value: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if !self
            .header_table
            .base()
            .entry_fits_dynamic_table_capacity(name, value)
        {
            self.fail(ErrorCode::EncoderStreamErrorInsertingLiteral, "Error inserting literal entry.");
            return;
        }
        self.insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
    }

    fn on_duplicate(&mut self, index: u64) {
        if self.error.is_some() {
            return;
        }
        let Some(absolute_index) =
            encoder_stream_relative_to_absolute(index, self.header_table.inserted_entry_count())
        else {
            self.fail(
                ErrorCode::EncoderStreamDuplicateInvalidRelativeIndex,
                "Invalid relative index.",
            );
            return;
        };
        let Some((name, value)) = self.header_table.lookup_entry(false, absolute_index) else {
            self.fail(
                ErrorCode::EncoderStreamDuplicateDynamicEntryNotFound,
                "Dynamic table entry not found.",
            );
            return;
        };
        if !self
            .header_table
            .base()
            .entry_fits_dynamic_table_capacity(&name, &value)
        {
            // An entry already in the table always fits.
            self.fail(ErrorCode::InternalError, "Error inserting duplicate entry.");
            return;
        }
        self.insert(name, value);
    }

    fn on_set_dynamic_table_capacity(&mut self, capacity: u64) {
        if self.error.is_some() {
            return;
        }
        if !self.header_table.set_dynamic_table_capacity(capacity) {
            self.fail(
                ErrorCode::EncoderStreamSetDynamicTableCapacity,
                "Error updating dynamic table capacity.",
            );
            return;
        }
        debug!(capacity, "peer set dynamic table capacity");
    }

    fn on_error_detected(&mut self, code: ErrorCode, message: &str) {
        self.fail(code, message);
    }
}
