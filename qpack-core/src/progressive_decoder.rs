//! Decoding of one header block (RFC 9204 Section 4.5).
//!
//! A [`QpackProgressiveDecoder`] accepts the encoded header block in
//! fragments. It decodes the prefix first; if the block refers to entries
//! not yet received it blocks, buffering further input until the decoder
//! header table reaches the Required Insert Count.
//!
//! The decoder does not own the header table or the other collaborators.
//! Every call that may touch them takes a [`DecodeContext`]. The owner
//! tells a blocked decoder to resume by calling
//! [`on_insert_count_reached_threshold`] for each stream id returned by
//! [`QpackDecoderHeaderTable::insert_entry`].
//!
//! [`on_insert_count_reached_threshold`]: QpackProgressiveDecoder::on_insert_count_reached_threshold

use crate::error::ErrorCode;
use crate::header_table::QpackDecoderHeaderTable;
use crate::index::{
    decode_required_insert_count, post_base_to_absolute, request_stream_relative_to_absolute,
};
use crate::instruction_decoder::{
    DecodedValues, InstructionDecoder, InstructionDecoderDelegate, InstructionDecodingError,
};
use crate::instructions::{Instruction, InstructionKind, PREFIX_LANGUAGE, REQUEST_STREAM_LANGUAGE};
use bytes::Bytes;
use tracing::{debug, trace};

/// Receives the outcome of decoding one header block.
pub trait ProgressiveDecoderHandler {
    /// Called for each decoded header field, in order.
    fn on_header_decoded(&mut self, name: Bytes, value: Bytes);

    /// Called once the whole header block is decoded.
    fn on_decoding_completed(&mut self);

    /// Called at most once. No other method is called afterwards.
    fn on_decoding_error_detected(&mut self, code: ErrorCode, message: &str);
}

/// Limits the number of streams blocked at the same time.
pub trait BlockedStreamLimitEnforcer {
    /// Returns false if blocking one more stream would exceed the limit.
    fn on_stream_blocked(&mut self, stream_id: u64) -> bool;

    fn on_stream_unblocked(&mut self, stream_id: u64);
}

/// Notified when a header block is fully decoded.
pub trait DecodingCompletedVisitor {
    fn on_decoding_completed(&mut self, stream_id: u64, required_insert_count: u64);
}

/// Collaborators a decoder needs while decoding.
pub struct DecodeContext<'a> {
    pub header_table: &'a mut QpackDecoderHeaderTable,
    pub enforcer: &'a mut dyn BlockedStreamLimitEnforcer,
    pub visitor: &'a mut dyn DecodingCompletedVisitor,
}

/// Everything except the two instruction decoders, so that the decoders
/// can report into it.
struct BlockState {
    stream_id: u64,
    handler: Box<dyn ProgressiveDecoderHandler>,
    required_insert_count: u64,
    base: u64,
    /// One more than the largest absolute index referred to so far.
    required_insert_count_so_far: u64,
    prefix_decoded: bool,
    blocked: bool,
    /// Input received while blocked.
    buffer: Vec<u8>,
    /// False once `end_header_block()` was called.
    decoding: bool,
    error_detected: bool,
    completed: bool,
    cancelled: bool,
}

impl BlockState {
    fn on_error(&mut self, code: ErrorCode, message: &str) {
        debug_assert!(!self.error_detected);
        self.error_detected = true;
        debug!(stream_id = self.stream_id, message, "header block decoding failed");
        self.handler.on_decoding_error_detected(code, message);
    }

    fn on_decompression_error(&mut self, message: &str) -> bool {
        self.on_error(ErrorCode::DecompressionFailed, message);
        false
    }
}

/// Decodes one header block, possibly across several calls.
pub struct QpackProgressiveDecoder {
    prefix_decoder: InstructionDecoder,
    instruction_decoder: InstructionDecoder,
    state: BlockState,
}

impl QpackProgressiveDecoder {
    pub fn new(stream_id: u64, handler: Box<dyn ProgressiveDecoderHandler>) -> Self {
        Self {
            prefix_decoder: InstructionDecoder::new(PREFIX_LANGUAGE),
            instruction_decoder: InstructionDecoder::new(REQUEST_STREAM_LANGUAGE),
            state: BlockState {
                stream_id,
                handler,
                required_insert_count: 0,
                base: 0,
                required_insert_count_so_far: 0,
                prefix_decoded: false,
                blocked: false,
                buffer: Vec::new(),
                decoding: true,
                error_detected: false,
                completed: false,
                cancelled: false,
            },
        }
    }

    /// Feeds more of the header block.
    pub fn decode(&mut self, mut data: &[u8], ctx: &mut DecodeContext<'_>) {
        debug_assert!(self.state.decoding);
        if data.is_empty() || self.state.error_detected {
            return;
        }

        // The prefix is decoded one byte at a time so that nothing past it
        // is consumed before knowing whether the block is blocked.
        while !self.state.prefix_decoded {
            debug_assert!(!self.state.blocked);
            let mut dispatch = Dispatch {
                state: &mut self.state,
                ctx: &mut *ctx,
            };
            if !self.prefix_decoder.decode(&data[..1], &mut dispatch) {
                return;
            }
            data = &data[1..];
            if data.is_empty() {
                return;
            }
        }

        if self.state.blocked {
            self.state.buffer.extend_from_slice(data);
        } else {
            debug_assert!(self.state.buffer.is_empty());
            let mut dispatch = Dispatch {
                state: &mut self.state,
                ctx: &mut *ctx,
            };
            self.instruction_decoder.decode(data, &mut dispatch);
        }
    }

    /// Signals that the whole header block has been passed to `decode()`.
    pub fn end_header_block(&mut self, ctx: &mut DecodeContext<'_>) {
        debug_assert!(self.state.decoding);
        self.state.decoding = false;
        if !self.state.blocked {
            self.finish_decoding(ctx);
        }
    }

    /// Resumes a blocked decoder once the header table holds enough entries.
    pub fn on_insert_count_reached_threshold(&mut self, ctx: &mut DecodeContext<'_>) {
        debug_assert!(self.state.prefix_decoded);
        debug_assert!(self.state.blocked);
        self.state.blocked = false;
        ctx.enforcer.on_stream_unblocked(self.state.stream_id);
        trace!(stream_id = self.state.stream_id, "header block unblocked");

        if !self.state.buffer.is_empty() {
            let buffer = std::mem::take(&mut self.state.buffer);
            let mut dispatch = Dispatch {
                state: &mut self.state,
                ctx: &mut *ctx,
            };
            if !self.instruction_decoder.decode(&buffer, &mut dispatch) {
                return;
            }
        }

        if !self.state.decoding {
            self.finish_decoding(ctx);
        }
    }

    fn finish_decoding(&mut self, ctx: &mut DecodeContext<'_>) {
        debug_assert!(self.state.buffer.is_empty());
        debug_assert!(!self.state.blocked);
        debug_assert!(!self.state.decoding);

        if self.state.error_detected {
            return;
        }
        if !self.instruction_decoder.at_instruction_boundary() {
            self.state.on_decompression_error("Incomplete header block.");
            return;
        }
        if !self.state.prefix_decoded {
            self.state.on_decompression_error("Incomplete header data prefix.");
            return;
        }
        if self.state.required_insert_count != self.state.required_insert_count_so_far {
            self.state.on_decompression_error("Required Insert Count too large.");
            return;
        }

        ctx.visitor
            .on_decoding_completed(self.state.stream_id, self.state.required_insert_count);
        self.state.completed = true;
        self.state.handler.on_decoding_completed();
    }

    /// Marks the decoder so that [`release`](Self::release) leaves the
    /// header table observer registration alone.
    ///
    /// Used when the registration no longer exists, for example because
    /// the header table is being torn down.
    pub fn cancel(&mut self) {
        self.state.cancelled = true;
    }

    /// Undoes the registrations of a decoder that is discarded while
    /// blocked. No-op otherwise.
    pub fn release(
        &mut self,
        header_table: &mut QpackDecoderHeaderTable,
        enforcer: &mut dyn BlockedStreamLimitEnforcer,
    ) {
        if !self.state.blocked {
            return;
        }
        if !self.state.cancelled {
            header_table.unregister_observer(self.state.required_insert_count, self.state.stream_id);
        }
        enforcer.on_stream_unblocked(self.state.stream_id);
        self.state.blocked = false;
        self.state.buffer.clear();
    }

    /// True once decoding completed or failed; the decoder can be dropped.
    pub fn is_done(&self) -> bool {
        self.state.completed || self.state.error_detected
    }

    pub fn is_blocked(&self) -> bool {
        self.state.blocked
    }

    /// False once `end_header_block()` was called.
    pub fn is_decoding(&self) -> bool {
        self.state.decoding
    }

    pub fn stream_id(&self) -> u64 {
        self.state.stream_id
    }

    /// Required Insert Count from the prefix, or zero before it is decoded.
    pub fn required_insert_count(&self) -> u64 {
        self.state.required_insert_count
    }
}

/// Computes Base from Required Insert Count and the signed Delta Base.
fn delta_base_to_base(required_insert_count: u64, sign: bool, delta_base: u64) -> Option<u64> {
    if sign {
        return required_insert_count.checked_sub(delta_base.checked_add(1)?);
    }
    required_insert_count.checked_add(delta_base)
}

struct Dispatch<'s, 'c, 'a> {
    state: &'s mut BlockState,
    ctx: &'c mut DecodeContext<'a>,
}

impl Dispatch<'_, '_, '_> {
    fn do_prefix_instruction(&mut self, values: &DecodedValues) -> bool {
        debug_assert!(!self.state.prefix_decoded);
        let header_table = &*self.ctx.header_table;

        let Some(required_insert_count) = decode_required_insert_count(
            values.varint(),
            header_table.max_entries(),
            header_table.inserted_entry_count(),
        ) else {
            return self.state.on_decompression_error("Error decoding Required Insert Count.");
        };
        self.state.required_insert_count = required_insert_count;

        let Some(base) = delta_base_to_base(required_insert_count, values.s_bit(), values.varint2())
        else {
            return self.state.on_decompression_error("Error calculating Base.");
        };
        self.state.base = base;
        self.state.prefix_decoded = true;

        if required_insert_count > header_table.inserted_entry_count() {
            let stream_id = self.state.stream_id;
            if !self.ctx.enforcer.on_stream_blocked(stream_id) {
                return self
                    .state
                    .on_decompression_error("Limit on number of blocked streams exceeded.");
            }
            self.state.blocked = true;
            self.ctx
                .header_table
                .register_observer(required_insert_count, stream_id);
            debug!(stream_id, required_insert_count, "header block blocked");
        }
        true
    }

    /// Resolves a dynamic table reference, tracking the largest index used.
    fn dynamic_entry(&mut self, absolute_index: u64) -> Option<(Bytes, Bytes)> {
        if absolute_index >= self.state.required_insert_count {
            self.state
                .on_decompression_error("Absolute Index must be smaller than Required Insert Count.");
            return None;
        }
        // absolute_index < required_insert_count, so this cannot overflow.
        self.state.required_insert_count_so_far =
            self.state.required_insert_count_so_far.max(absolute_index + 1);

        let Some(entry) = self.ctx.header_table.lookup_entry(false, absolute_index) else {
            self.state.on_decompression_error("Dynamic table entry already evicted.");
            return None;
        };
        self.ctx.header_table.set_dynamic_table_entry_referenced();
        Some(entry)
    }

    fn static_entry(&mut self, index: u64) -> Option<(Bytes, Bytes)> {
        let entry = self.ctx.header_table.lookup_entry(true, index);
        if entry.is_none() {
            self.state.on_decompression_error("Static table entry not found.");
        }
        entry
    }

    fn relative_entry(&mut self, is_static: bool, index: u64) -> Option<(Bytes, Bytes)> {
        if is_static {
            return self.static_entry(index);
        }
        let Some(absolute_index) = request_stream_relative_to_absolute(index, self.state.base) else {
            self.state.on_decompression_error("Invalid relative index.");
            return None;
        };
        self.dynamic_entry(absolute_index)
    }

    fn post_base_entry(&mut self, index: u64) -> Option<(Bytes, Bytes)> {
        let Some(absolute_index) = post_base_to_absolute(index, self.state.base) else {
            self.state.on_decompression_error("Invalid post-base index.");
            return None;
        };
        self.dynamic_entry(absolute_index)
    }

    fn on_header_decoded(&mut self, name: Bytes, value: Bytes) -> bool {
        self.state.handler.on_header_decoded(name, value);
        true
    }
}

impl InstructionDecoderDelegate for Dispatch<'_, '_, '_> {
    fn on_instruction_decoded(&mut self, instruction: &'static Instruction, values: &DecodedValues) -> bool {
        if instruction.kind == InstructionKind::Prefix {
            return self.do_prefix_instruction(values);
        }
        debug_assert!(self.state.prefix_decoded);
        debug_assert!(!self.state.blocked);

        match instruction.kind {
            InstructionKind::IndexedHeaderField => {
                match self.relative_entry(values.s_bit(), values.varint()) {
                    Some((name, value)) => self.on_header_decoded(name, value),
                    None => false,
                }
            }
            InstructionKind::IndexedHeaderFieldPostBase => match self.post_base_entry(values.varint()) {
                Some((name, value)) => self.on_header_decoded(name, value),
                None => false,
            },
            InstructionKind::LiteralHeaderFieldNameReference => {
                match self.relative_entry(values.s_bit(), values.varint()) {
                    Some((name, _)) => {
                        self.on_header_decoded(name, Bytes::copy_from_slice(values.value()))
                    }
                    None => false,
                }
            }
            InstructionKind::LiteralHeaderFieldPostBase => match self.post_base_entry(values.varint()) {
                Some((name, _)) => self.on_header_decoded(name, Bytes::copy_from_slice(values.value())),
                None => false,
            },
            InstructionKind::LiteralHeaderField => self.on_header_decoded(
                Bytes::copy_from_slice(values.name()),
                Bytes::copy_from_slice(values.value()),
            ),
            other => unreachable!("{:?} is not a request stream instruction", other),
        }
    }

    fn on_instruction_decoding_error(&mut self, _error: InstructionDecodingError, message: &str) {
        self.state.on_error(ErrorCode::DecompressionFailed, message);
    }
}
