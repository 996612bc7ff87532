//! QPACK encoder (RFC 9204 Section 2.1).
//!
//! [`QpackEncoder`] turns header lists into header blocks. It decides for
//! each field whether to refer to the static table, refer to or insert into
//! the dynamic table, or send a literal, honoring the peer's blocked stream
//! limit and avoiding references to entries that are about to be evicted.
//! Table updates go out on the encoder stream; acknowledgements come back
//! on the decoder stream.

use crate::blocking_manager::{IndexSet, QpackBlockingManager};
use crate::config::QpackConfig;
use crate::decoder_stream::{DecoderStreamReceiverDelegate, QpackDecoderStreamReceiver};
use crate::encoder_stream::QpackEncoderStreamSender;
use crate::error::{Error, ErrorCode, Result};
use crate::field_line::{entry_size, FieldLine};
use crate::header_table::{MatchResult, MatchType, QpackEncoderHeaderTable};
use crate::index::{
    absolute_to_encoder_stream_relative, absolute_to_request_stream_relative,
    encode_required_insert_count,
};
use crate::instruction_encoder::InstructionEncoder;
use crate::instructions::InstructionWithValues;
use crate::send_stream::StreamSenderDelegate;
use crate::value_splitting::split_values;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

/// Fraction of the dynamic table capacity, oldest entries first, that is
/// not referenced any more so it can be evicted soon.
const DRAINING_FRACTION: f32 = 0.25;

/// How one field is represented in the header block, with dynamic
/// indices still absolute.
enum Representation {
    Indexed {
        is_static: bool,
        index: u64,
    },
    LiteralWithNameReference {
        is_static: bool,
        index: u64,
        value: Bytes,
    },
    Literal {
        name: Bytes,
        value: Bytes,
    },
}

/// Per header list state of the first encoding pass.
struct FirstPass {
    stream_id: u64,
    known_received_count: u64,
    draining_index: u64,
    blocking_allowed: bool,
    can_write_to_encoder_stream: bool,
    /// Entries at or above this index must not be evicted by insertions
    /// made while encoding this header list.
    smallest_non_evictable_index: u64,
    referred_indices: IndexSet,
    representations: Vec<Representation>,
    blocked_stream_limit_exhausted: bool,
    dynamic_table_insertion_blocked: bool,
}

impl FirstPass {
    fn refer_to_dynamic_entry(&mut self, index: u64) {
        self.referred_indices.insert(index);
        self.smallest_non_evictable_index = self.smallest_non_evictable_index.min(index);
    }

    fn literal(&mut self, field: &FieldLine) {
        self.representations.push(Representation::Literal {
            name: field.name.clone(),
            value: field.value.clone(),
        });
    }
}

/// Encodes header lists and processes the peer's decoder stream.
pub struct QpackEncoder {
    header_table: QpackEncoderHeaderTable,
    encoder_stream_sender: QpackEncoderStreamSender,
    decoder_stream_receiver: QpackDecoderStreamReceiver,
    blocking_manager: QpackBlockingManager,
    instruction_encoder: InstructionEncoder,
    maximum_blocked_streams: u64,
    cookie_crumbling: bool,
    decoder_stream_error: Option<Error>,
}

impl QpackEncoder {
    /// Creates an encoder without a dynamic table.
    ///
    /// The dynamic table and blocked stream limits are set once the peer's
    /// SETTINGS arrive.
    pub fn new(config: &QpackConfig) -> Self {
        Self {
            header_table: QpackEncoderHeaderTable::new(),
            encoder_stream_sender: QpackEncoderStreamSender::new(config.huffman_encoding),
            decoder_stream_receiver: QpackDecoderStreamReceiver::new(),
            blocking_manager: QpackBlockingManager::new(config.bug_severity),
            instruction_encoder: InstructionEncoder::new(config.huffman_encoding),
            maximum_blocked_streams: 0,
            cookie_crumbling: config.cookie_crumbling,
            decoder_stream_error: None,
        }
    }

    /// Sets the transport for the encoder stream.
    pub fn set_encoder_stream_delegate(&mut self, delegate: Box<dyn StreamSenderDelegate>) {
        self.encoder_stream_sender.set_delegate(delegate);
    }

    /// Applies the peer's SETTINGS_QPACK_MAX_TABLE_CAPACITY.
    ///
    /// Returns false if a different maximum was already set.
    pub fn set_maximum_dynamic_table_capacity(&mut self, maximum: u64) -> bool {
        self.header_table
            .base_mut()
            .set_maximum_dynamic_table_capacity(maximum)
    }

    /// Changes the dynamic table capacity and tells the peer.
    ///
    /// The instruction is sent with the next flush of the encoder stream.
    pub fn set_dynamic_table_capacity(&mut self, capacity: u64) -> Result<()> {
        if !self.header_table.set_dynamic_table_capacity(capacity) {
            return Err(Error::InvalidConfig(format!(
                "dynamic table capacity {} exceeds maximum {}",
                capacity,
                self.header_table.base().maximum_dynamic_table_capacity()
            )));
        }
        self.encoder_stream_sender
            .send_set_dynamic_table_capacity(capacity);
        debug!(capacity, "dynamic table capacity set");
        Ok(())
    }

    /// Applies the peer's SETTINGS_QPACK_BLOCKED_STREAMS.
    ///
    /// Returns false if `maximum` is below the current limit.
    pub fn set_maximum_blocked_streams(&mut self, maximum: u64) -> bool {
        if maximum < self.maximum_blocked_streams {
            return false;
        }
        self.maximum_blocked_streams = maximum;
        true
    }

    /// Encodes `header_list` for `stream_id` and returns the header block.
    ///
    /// Any table updates it needs are flushed to the encoder stream first.
    pub fn encode_header_list(&mut self, stream_id: u64, header_list: &[FieldLine]) -> Bytes {
        let fields = split_values(header_list, self.cookie_crumbling);
        let pass = self.first_pass_encode(stream_id, &fields);

        let encoder_stream_bytes = self.encoder_stream_sender.buffered_byte_count();
        self.encoder_stream_sender.flush();

        let required_insert_count = pass.referred_indices.required_insert_count().unwrap_or(0);
        if required_insert_count > 0 {
            self.blocking_manager
                .on_header_block_sent(stream_id, pass.referred_indices, required_insert_count);
        }

        let header_block = self.second_pass_encode(&pass.representations, required_insert_count);
        trace!(
            stream_id,
            required_insert_count,
            encoder_stream_bytes,
            header_block_bytes = header_block.len(),
            blocked_stream_limit_exhausted = pass.blocked_stream_limit_exhausted,
            dynamic_table_insertion_blocked = pass.dynamic_table_insertion_blocked,
            "header list encoded"
        );
        header_block
    }

    fn first_pass_encode(&mut self, stream_id: u64, fields: &[FieldLine]) -> FirstPass {
        let known_received_count = self.blocking_manager.known_received_count();
        let mut pass = FirstPass {
            stream_id,
            known_received_count,
            draining_index: self.header_table.draining_index(DRAINING_FRACTION),
            blocking_allowed: self
                .blocking_manager
                .blocking_allowed_on_stream(stream_id, self.maximum_blocked_streams),
            can_write_to_encoder_stream: self.encoder_stream_sender.can_write(),
            smallest_non_evictable_index: self
                .blocking_manager
                .smallest_blocking_index()
                .min(known_received_count),
            referred_indices: IndexSet::new(),
            representations: Vec::with_capacity(fields.len()),
            blocked_stream_limit_exhausted: false,
            dynamic_table_insertion_blocked: false,
        };

        for field in fields {
            let result = self.header_table.find_header_field(&field.name, &field.value);
            match result.match_type {
                MatchType::NameAndValue => self.encode_exact_match(&mut pass, result, field),
                MatchType::Name => self.encode_name_match(&mut pass, result, field),
                MatchType::NoMatch => self.encode_no_match(&mut pass, field),
            }
        }
        pass
    }

    fn encode_exact_match(&mut self, pass: &mut FirstPass, result: MatchResult, field: &FieldLine) {
        if result.is_static {
            pass.representations.push(Representation::Indexed {
                is_static: true,
                index: result.index,
            });
            return;
        }

        if result.index >= pass.draining_index {
            if !pass.blocking_allowed && result.index >= pass.known_received_count {
                pass.blocked_stream_limit_exhausted = true;
            } else {
                pass.representations.push(Representation::Indexed {
                    is_static: false,
                    index: result.index,
                });
                pass.refer_to_dynamic_entry(result.index);
                self.header_table.base_mut().set_dynamic_table_entry_referenced();
                return;
            }
        } else if !pass.blocking_allowed {
            pass.blocked_stream_limit_exhausted = true;
        } else if entry_size(&field.name, &field.value)
            > self.header_table.max_insert_size_without_evicting_given_entry(
                pass.smallest_non_evictable_index.min(result.index),
            )
        {
            pass.dynamic_table_insertion_blocked = true;
        } else if pass.can_write_to_encoder_stream {
            // Draining entry: duplicate it and refer to the copy.
            let inserted_entry_count = self.header_table.base().inserted_entry_count();
            self.encoder_stream_sender
                .send_duplicate(absolute_to_encoder_stream_relative(result.index, inserted_entry_count));
            let new_index = self
                .header_table
                .insert_entry(field.name.clone(), field.value.clone());
            pass.representations.push(Representation::Indexed {
                is_static: false,
                index: new_index,
            });
            pass.smallest_non_evictable_index = pass.smallest_non_evictable_index.min(result.index);
            pass.refer_to_dynamic_entry(new_index);
            self.header_table.base_mut().set_dynamic_table_entry_referenced();
            return;
        }

        // The exact match cannot be used. Fall back to a name match, unless
        // that is the same entry.
        let name_result = self.header_table.find_header_name(&field.name);
        if name_result.match_type != MatchType::Name
            || (name_result.is_static == result.is_static && name_result.index == result.index)
        {
            pass.literal(field);
            return;
        }
        self.encode_name_match(pass, name_result, field);
    }

    fn encode_name_match(&mut self, pass: &mut FirstPass, result: MatchResult, field: &FieldLine) {
        let size = entry_size(&field.name, &field.value);

        if result.is_static {
            if pass.blocking_allowed
                && size
                    <= self
                        .header_table
                        .max_insert_size_without_evicting_given_entry(pass.smallest_non_evictable_index)
            {
                if pass.can_write_to_encoder_stream {
                    self.encoder_stream_sender
                        .send_insert_with_name_reference(true, result.index, &field.value);
                    let new_index = self
                        .header_table
                        .insert_entry(field.name.clone(), field.value.clone());
                    pass.representations.push(Representation::Indexed {
                        is_static: false,
                        index: new_index,
                    });
                    pass.refer_to_dynamic_entry(new_index);
                    self.header_table.base_mut().set_dynamic_table_entry_referenced();
                    return;
                }
            } else if !pass.blocking_allowed {
                pass.blocked_stream_limit_exhausted = true;
            } else {
                pass.dynamic_table_insertion_blocked = true;
            }

            pass.representations
                .push(Representation::LiteralWithNameReference {
                    is_static: true,
                    index: result.index,
                    value: field.value.clone(),
                });
            return;
        }

        if pass.blocking_allowed
            && size
                <= self.header_table.max_insert_size_without_evicting_given_entry(
                    pass.smallest_non_evictable_index.min(result.index),
                )
        {
            if pass.can_write_to_encoder_stream {
                let inserted_entry_count = self.header_table.base().inserted_entry_count();
                self.encoder_stream_sender.send_insert_with_name_reference(
                    false,
                    absolute_to_encoder_stream_relative(result.index, inserted_entry_count),
                    &field.value,
                );
                let new_index = self
                    .header_table
                    .insert_entry(field.name.clone(), field.value.clone());
                pass.representations.push(Representation::Indexed {
                    is_static: false,
                    index: new_index,
                });
                pass.smallest_non_evictable_index = pass.smallest_non_evictable_index.min(result.index);
                pass.refer_to_dynamic_entry(new_index);
                self.header_table.base_mut().set_dynamic_table_entry_referenced();
                return;
            }
        } else if !pass.blocking_allowed {
            pass.blocked_stream_limit_exhausted = true;
        } else {
            pass.dynamic_table_insertion_blocked = true;
        }

        if (pass.blocking_allowed || result.index < pass.known_received_count)
            && result.index >= pass.draining_index
        {
            pass.representations
                .push(Representation::LiteralWithNameReference {
                    is_static: false,
                    index: result.index,
                    value: field.value.clone(),
                });
            pass.refer_to_dynamic_entry(result.index);
            self.header_table.base_mut().set_dynamic_table_entry_referenced();
            return;
        }

        pass.literal(field);
    }

    fn encode_no_match(&mut self, pass: &mut FirstPass, field: &FieldLine) {
        if !pass.blocking_allowed {
            pass.blocked_stream_limit_exhausted = true;
        } else if entry_size(&field.name, &field.value)
            > self
                .header_table
                .max_insert_size_without_evicting_given_entry(pass.smallest_non_evictable_index)
        {
            pass.dynamic_table_insertion_blocked = true;
        } else if pass.can_write_to_encoder_stream {
            self.encoder_stream_sender
                .send_insert_without_name_reference(&field.name, &field.value);
            let new_index = self
                .header_table
                .insert_entry(field.name.clone(), field.value.clone());
            pass.representations.push(Representation::Indexed {
                is_static: false,
                index: new_index,
            });
            pass.refer_to_dynamic_entry(new_index);
            self.header_table.base_mut().set_dynamic_table_entry_referenced();
            return;
        }

        trace!(stream_id = pass.stream_id, "field sent as literal");
        pass.literal(field);
    }

    /// Serializes the representations with Base equal to Required Insert
    /// Count, so that no post-base index is needed.
    fn second_pass_encode(&mut self, representations: &[Representation], required_insert_count: u64) -> Bytes {
        let base = required_insert_count;
        let mut output = BytesMut::new();

        let encoded_required_insert_count =
            encode_required_insert_count(required_insert_count, self.header_table.base().max_entries());
        self.instruction_encoder.encode(
            &InstructionWithValues::prefix(encoded_required_insert_count, false, 0),
            &mut output,
        );

        for representation in representations {
            let instruction = match representation {
                Representation::Indexed { is_static: true, index } => {
                    InstructionWithValues::indexed_header_field(true, *index)
                }
                Representation::Indexed { is_static: false, index } => {
                    InstructionWithValues::indexed_header_field(
                        false,
                        absolute_to_request_stream_relative(*index, base),
                    )
                }
                Representation::LiteralWithNameReference { is_static: true, index, value } => {
                    InstructionWithValues::literal_header_field_name_reference(true, *index, value)
                }
                Representation::LiteralWithNameReference { is_static: false, index, value } => {
                    InstructionWithValues::literal_header_field_name_reference(
                        false,
                        absolute_to_request_stream_relative(*index, base),
                        value,
                    )
                }
                Representation::Literal { name, value } => {
                    InstructionWithValues::literal_header_field(name, value)
                }
            };
            self.instruction_encoder.encode(&instruction, &mut output);
        }
        output.freeze()
    }

    /// Processes data received on the peer's decoder stream.
    ///
    /// Any error is fatal to the connection; once one has been returned,
    /// every later call returns it again.
    pub fn decode_decoder_stream_data(&mut self, data: &[u8]) -> Result<()> {
        if let Some(error) = &self.decoder_stream_error {
            return Err(error.clone());
        }

        let mut handler = DecoderStreamHandler {
            blocking_manager: &mut self.blocking_manager,
            inserted_entry_count: self.header_table.base().inserted_entry_count(),
            error: None,
        };
        self.decoder_stream_receiver.decode(data, &mut handler);

        if let Some(error) = handler.error {
            warn!(%error, "decoder stream error");
            self.decoder_stream_error = Some(error.clone());
            return Err(error);
        }
        Ok(())
    }

    pub fn header_table(&self) -> &QpackEncoderHeaderTable {
        &self.header_table
    }

    pub fn blocking_manager(&self) -> &QpackBlockingManager {
        &self.blocking_manager
    }

    pub fn maximum_blocked_streams(&self) -> u64 {
        self.maximum_blocked_streams
    }

    /// True if any header block encoded so far referred to the dynamic
    /// table.
    pub fn dynamic_table_entry_referenced(&self) -> bool {
        self.header_table.base().dynamic_table_entry_referenced()
    }
}

struct DecoderStreamHandler<'a> {
    blocking_manager: &'a mut QpackBlockingManager,
    inserted_entry_count: u64,
    error: Option<Error>,
}

impl DecoderStreamHandler<'_> {
    fn fail(&mut self, code: ErrorCode, message: String) {
        if self.error.is_none() {
            self.error = Some(Error::from_code(code, message));
        }
    }
}

impl DecoderStreamReceiverDelegate for DecoderStreamHandler<'_> {
    fn on_insert_count_increment(&mut self, increment: u64) {
        if self.error.is_some() {
            return;
        }
        if increment == 0 {
            self.fail(ErrorCode::DecoderStreamInvalidZeroIncrement, "Invalid increment value 0.".into());
            return;
        }
        if !self.blocking_manager.on_insert_count_increment(increment) {
            self.fail(
                ErrorCode::DecoderStreamIncrementOverflow,
                "Insert Count Increment instruction causes overflow.".into(),
            );
            return;
        }
        if self.blocking_manager.known_received_count() > self.inserted_entry_count {
            self.fail(
                ErrorCode::DecoderStreamImpossibleInsertCount,
                format!(
                    "Increment value {} raises known received count to {} exceeding inserted entry count {}",
                    increment,
                    self.blocking_manager.known_received_count(),
                    self.inserted_entry_count
                ),
            );
        }
    }

    fn on_header_acknowledgement(&mut self, stream_id: u64) {
        if self.error.is_some() {
            return;
        }
        if !self.blocking_manager.on_header_acknowledgement(stream_id) {
            self.fail(
                ErrorCode::DecoderStreamIncorrectAcknowledgement,
                format!(
                    "Header Acknowledgement received for stream {} with no outstanding header blocks.",
                    stream_id
                ),
            );
        }
    }

    fn on_stream_cancellation(&mut self, stream_id: u64) {
        if self.error.is_some() {
            return;
        }
        self.blocking_manager.on_stream_cancellation(stream_id);
    }

    fn on_error_detected(&mut self, code: ErrorCode, message: &str) {
        self.fail(code, message.to_string());
    }
}
