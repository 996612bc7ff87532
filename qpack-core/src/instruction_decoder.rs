//! Resumable decoder for instructions described in [`crate::instructions`].
//!
//! Input may be split at arbitrary points. Decoded field values are kept
//! in [`DecodedValues`] and handed to the delegate once a whole
//! instruction is complete.

use crate::huffman;
use crate::instructions::{lookup_opcode, Field, FieldType, Instruction, Language};
use crate::integer::{DecodeStatus, VarintDecoder};

/// Longest string literal accepted, in bytes before Huffman decoding.
pub const STRING_LITERAL_LENGTH_LIMIT: u64 = 1024 * 1024;

/// Errors detected by the instruction decoder itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionDecodingError {
    IntegerTooLarge,
    StringLiteralTooLong,
    HuffmanEncodingError,
}

/// Receives decoded instructions.
pub trait InstructionDecoderDelegate {
    /// Called once per complete instruction.
    ///
    /// Returning false stops decoding: the decoder must not be used again.
    fn on_instruction_decoded(
        &mut self,
        instruction: &'static Instruction,
        values: &DecodedValues,
    ) -> bool;

    /// Called at most once, when the input is malformed.
    fn on_instruction_decoding_error(&mut self, error: InstructionDecodingError, message: &str);
}

/// Field values of the most recently decoded instruction.
#[derive(Debug, Default, Clone)]
pub struct DecodedValues {
    s_bit: bool,
    varint: u64,
    varint2: u64,
    name: Vec<u8>,
    value: Vec<u8>,
}

impl DecodedValues {
    pub fn s_bit(&self) -> bool {
        self.s_bit
    }

    pub fn varint(&self) -> u64 {
        self.varint
    }

    pub fn varint2(&self) -> u64 {
        self.varint2
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    fn string_mut(&mut self, ty: FieldType) -> &mut Vec<u8> {
        if ty == FieldType::Name {
            &mut self.name
        } else {
            &mut self.value
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Identify the instruction from its first byte.
    StartInstruction,
    /// Select the state for the next field, or report the instruction.
    StartField,
    /// Read the S bit or Huffman flag without consuming the byte.
    ReadBit,
    /// Start decoding an integer at the current byte.
    VarintStart,
    /// Continue an integer across input fragments.
    VarintResume,
    /// Store the completed integer.
    VarintDone,
    /// Accumulate string bytes.
    ReadString,
    /// Huffman-decode the string if needed.
    ReadStringDone,
}

/// Decodes a stream of instructions from one language.
#[derive(Debug)]
pub struct InstructionDecoder {
    language: &'static Language,
    state: State,
    instruction: Option<&'static Instruction>,
    fields: &'static [Field],
    field_index: usize,
    varint_decoder: VarintDecoder,
    is_huffman_encoded: bool,
    string_length: usize,
    values: DecodedValues,
    huffman_buffer: Vec<u8>,
    error_detected: bool,
}

impl InstructionDecoder {
    pub fn new(language: &'static Language) -> Self {
        debug_assert!(crate::instructions::validate_language(language));
        Self {
            language,
            state: State::StartInstruction,
            instruction: None,
            fields: &[],
            field_index: 0,
            varint_decoder: VarintDecoder::new(),
            is_huffman_encoded: false,
            string_length: 0,
            values: DecodedValues::default(),
            huffman_buffer: Vec::new(),
            error_detected: false,
        }
    }

    /// Feeds `data` to the decoder.
    ///
    /// Returns false if an error was detected or the delegate asked to
    /// stop. In both cases the decoder must not be used again.
    pub fn decode(&mut self, mut data: &[u8], delegate: &mut dyn InstructionDecoderDelegate) -> bool {
        debug_assert!(!self.error_detected);
        if self.error_detected {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        loop {
            let mut consumed = 0;
            let success = match self.state {
                State::StartInstruction => self.do_start_instruction(data),
                State::StartField => self.do_start_field(delegate),
                State::ReadBit => self.do_read_bit(data),
                State::VarintStart => self.do_varint_start(data, &mut consumed, delegate),
                State::VarintResume => self.do_varint_resume(data, &mut consumed, delegate),
                State::VarintDone => self.do_varint_done(delegate),
                State::ReadString => self.do_read_string(data, &mut consumed),
                State::ReadStringDone => self.do_read_string_done(delegate),
            };
            if !success {
                return false;
            }

            data = &data[consumed..];

            // Stop if the next state needs input.
            if data.is_empty()
                && matches!(
                    self.state,
                    State::StartInstruction
                        | State::ReadBit
                        | State::VarintStart
                        | State::VarintResume
                        | State::ReadString
                )
            {
                return true;
            }
        }
    }

    /// Returns true if no instruction is partially decoded.
    pub fn at_instruction_boundary(&self) -> bool {
        self.state == State::StartInstruction
    }

    /// Field values of the last decoded instruction.
    pub fn values(&self) -> &DecodedValues {
        &self.values
    }

    fn current_field(&self) -> Field {
        self.fields[self.field_index]
    }

    fn do_start_instruction(&mut self, data: &[u8]) -> bool {
        // Every leading byte matches an opcode in a valid language.
        let Some(instruction) = lookup_opcode(self.language, data[0]) else {
            self.error_detected = true;
            debug_assert!(false, "no opcode matches {:#04x}", data[0]);
            return false;
        };
        self.instruction = Some(instruction);
        self.fields = instruction.fields;
        self.field_index = 0;
        self.state = State::StartField;
        true
    }

    fn do_start_field(&mut self, delegate: &mut dyn InstructionDecoderDelegate) -> bool {
        let Some(instruction) = self.instruction else {
            self.state = State::StartInstruction;
            return true;
        };
        let Some(field) = instruction.fields.get(self.field_index) else {
            self.state = State::StartInstruction;
            return delegate.on_instruction_decoded(instruction, &self.values);
        };
        self.state = match field.ty {
            FieldType::SBit | FieldType::Name | FieldType::Value => State::ReadBit,
            FieldType::Varint | FieldType::Varint2 => State::VarintStart,
        };
        true
    }

    fn do_read_bit(&mut self, data: &[u8]) -> bool {
        let field = self.current_field();
        match field.ty {
            FieldType::SBit => {
                self.values.s_bit = data[0] & field.param == field.param;
                self.field_index += 1;
                self.state = State::StartField;
            }
            FieldType::Name | FieldType::Value => {
                let huffman_bit = 1u8 << field.param;
                self.is_huffman_encoded = data[0] & huffman_bit == huffman_bit;
                self.state = State::VarintStart;
            }
            FieldType::Varint | FieldType::Varint2 => unreachable!("integer field in ReadBit"),
        }
        true
    }

    fn do_varint_start(
        &mut self,
        data: &[u8],
        consumed: &mut usize,
        delegate: &mut dyn InstructionDecoderDelegate,
    ) -> bool {
        let field = self.current_field();
        let (status, used) = self.varint_decoder.start(data[0], field.param, &data[1..]);
        *consumed = 1 + used;
        self.on_varint_status(status, delegate)
    }

    fn do_varint_resume(
        &mut self,
        data: &[u8],
        consumed: &mut usize,
        delegate: &mut dyn InstructionDecoderDelegate,
    ) -> bool {
        let (status, used) = self.varint_decoder.resume(data);
        *consumed = used;
        self.on_varint_status(status, delegate)
    }

    fn on_varint_status(
        &mut self,
        status: DecodeStatus,
        delegate: &mut dyn InstructionDecoderDelegate,
    ) -> bool {
        match status {
            DecodeStatus::Done => {
                self.state = State::VarintDone;
                true
            }
            DecodeStatus::InProgress => {
                self.state = State::VarintResume;
                true
            }
            DecodeStatus::Error => {
                self.on_error(
                    InstructionDecodingError::IntegerTooLarge,
                    "Encoded integer too large.",
                    delegate,
                );
                false
            }
        }
    }

    fn do_varint_done(&mut self, delegate: &mut dyn InstructionDecoderDelegate) -> bool {
        let field = self.current_field();
        let value = self.varint_decoder.value();
        match field.ty {
            FieldType::Varint => {
                self.values.varint = value;
                self.field_index += 1;
                self.state = State::StartField;
            }
            FieldType::Varint2 => {
                self.values.varint2 = value;
                self.field_index += 1;
                self.state = State::StartField;
            }
            FieldType::Name | FieldType::Value => {
                if value > STRING_LITERAL_LENGTH_LIMIT {
                    self.on_error(
                        InstructionDecodingError::StringLiteralTooLong,
                        "String literal too long.",
                        delegate,
                    );
                    return false;
                }
                self.string_length = value as usize;
                let string = self.values.string_mut(field.ty);
                string.clear();
                if self.string_length == 0 {
                    self.field_index += 1;
                    self.state = State::StartField;
                    return true;
                }
                string.reserve(self.string_length);
                self.state = State::ReadString;
            }
            FieldType::SBit => unreachable!("S bit in VarintDone"),
        }
        true
    }

    fn do_read_string(&mut self, data: &[u8], consumed: &mut usize) -> bool {
        let field = self.current_field();
        let string_length = self.string_length;
        let string = self.values.string_mut(field.ty);
        debug_assert!(string.len() < string_length);

        let wanted = (string_length - string.len()).min(data.len());
        string.extend_from_slice(&data[..wanted]);
        *consumed = wanted;

        if string.len() == string_length {
            self.state = State::ReadStringDone;
        }
        true
    }

    fn do_read_string_done(&mut self, delegate: &mut dyn InstructionDecoderDelegate) -> bool {
        let field = self.current_field();
        if self.is_huffman_encoded {
            self.huffman_buffer.clear();
            let string = self.values.string_mut(field.ty);
            if huffman::decode(string, &mut self.huffman_buffer).is_err() {
                self.on_error(
                    InstructionDecodingError::HuffmanEncodingError,
                    "Error in Huffman-encoded string.",
                    delegate,
                );
                return false;
            }
            std::mem::swap(string, &mut self.huffman_buffer);
        }
        self.field_index += 1;
        self.state = State::StartField;
        true
    }

    fn on_error(
        &mut self,
        error: InstructionDecodingError,
        message: &str,
        delegate: &mut dyn InstructionDecoderDelegate,
    ) {
        debug_assert!(!self.error_detected);
        self.error_detected = true;
        delegate.on_instruction_decoding_error(error, message);
    }
}
