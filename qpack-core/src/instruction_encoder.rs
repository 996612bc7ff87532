//! Serializes instructions described in [`crate::instructions`].

use crate::config::HuffmanEncoding;
use crate::huffman;
use crate::instructions::{FieldType, InstructionWithValues};
use crate::integer;
use bytes::BytesMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Write the opcode bits into the first byte.
    Opcode,
    /// Select the state for the next field, or finish.
    StartField,
    /// Set the S bit in the current byte if needed.
    SBit,
    /// Write an integer, starting with the current byte.
    VarintEncode,
    /// Decide on Huffman encoding and write the string length.
    StartString,
    /// Write the string bytes.
    WriteString,
}

/// Writes whole instructions to a buffer.
///
/// Encoding cannot fail: every value comes from local code.
#[derive(Debug)]
pub struct InstructionEncoder {
    huffman_encoding: HuffmanEncoding,
    state: State,
    field_index: usize,
    /// Bits of the first byte of the current field written so far.
    byte: u8,
    use_huffman: bool,
    string_length: usize,
}

impl InstructionEncoder {
    pub fn new(huffman_encoding: HuffmanEncoding) -> Self {
        Self {
            huffman_encoding,
            state: State::Opcode,
            field_index: 0,
            byte: 0,
            use_huffman: false,
            string_length: 0,
        }
    }

    /// Appends the wire encoding of `instruction` to `output`.
    pub fn encode(&mut self, instruction: &InstructionWithValues<'_>, output: &mut BytesMut) {
        let descriptor = instruction.instruction();
        let fields = descriptor.fields;
        self.state = State::Opcode;
        self.field_index = 0;

        loop {
            match self.state {
                State::Opcode => {
                    self.byte = descriptor.opcode.value;
                    self.state = State::StartField;
                }
                State::StartField => {
                    let Some(field) = fields.get(self.field_index) else {
                        debug_assert_eq!(self.byte, 0, "unwritten bits after last field");
                        return;
                    };
                    self.state = match field.ty {
                        FieldType::SBit => State::SBit,
                        FieldType::Varint | FieldType::Varint2 => State::VarintEncode,
                        FieldType::Name | FieldType::Value => State::StartString,
                    };
                }
                State::SBit => {
                    if instruction.s_bit() {
                        self.byte |= fields[self.field_index].param;
                    }
                    self.field_index += 1;
                    self.state = State::StartField;
                }
                State::VarintEncode => {
                    let field = fields[self.field_index];
                    let value = if field.ty == FieldType::Varint2 {
                        instruction.varint2()
                    } else {
                        instruction.varint()
                    };
                    integer::encode(value, field.param, self.byte, output);
                    self.byte = 0;
                    self.field_index += 1;
                    self.state = State::StartField;
                }
                State::StartString => {
                    let field = fields[self.field_index];
                    let string = Self::string_field(instruction, field.ty);
                    self.use_huffman = false;
                    self.string_length = string.len();
                    if self.huffman_encoding == HuffmanEncoding::Enabled {
                        let encoded_size = huffman::encoded_size(string);
                        if encoded_size < string.len() {
                            self.use_huffman = true;
                            self.string_length = encoded_size;
                        }
                    }
                    if self.use_huffman {
                        self.byte |= 1 << field.param;
                    }
                    integer::encode(self.string_length as u64, field.param, self.byte, output);
                    self.byte = 0;
                    self.state = State::WriteString;
                }
                State::WriteString => {
                    let string = Self::string_field(instruction, fields[self.field_index].ty);
                    if self.use_huffman {
                        huffman::encode(string, output);
                    } else {
                        output.extend_from_slice(string);
                    }
                    self.field_index += 1;
                    self.state = State::StartField;
                }
            }
        }
    }

    fn string_field<'a>(instruction: &InstructionWithValues<'a>, ty: FieldType) -> &'a [u8] {
        if ty == FieldType::Name {
            instruction.name()
        } else {
            instruction.value()
        }
    }
}
