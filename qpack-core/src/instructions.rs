//! QPACK wire instructions (RFC 9204 Sections 4.3, 4.4 and 4.5).
//!
//! Each instruction is described once, statically, by an opcode and an
//! ordered list of fields. The instruction encoder and decoder are driven
//! entirely by these descriptors.
//!
//! Instructions are grouped into languages: the set of instructions that
//! may appear on one kind of stream. Within a language every possible
//! leading byte matches exactly one opcode.
//!
//! Encoder stream:
//! - Insert With Name Reference     `1Txxxxxx`
//! - Insert Without Name Reference  `01Hxxxxx`
//! - Duplicate                      `000xxxxx`
//! - Set Dynamic Table Capacity     `001xxxxx`
//!
//! Decoder stream:
//! - Insert Count Increment         `00xxxxxx`
//! - Section Acknowledgement        `1xxxxxxx`
//! - Stream Cancellation            `01xxxxxx`
//!
//! Request and push streams:
//! - Indexed Field Line                           `1Txxxxxx`
//! - Indexed Field Line With Post-Base Index      `0001xxxx`
//! - Literal Field Line With Name Reference       `01NTxxxx`
//! - Literal Field Line With Post-Base Name Ref.  `0000Nxxx`
//! - Literal Field Line With Literal Name         `001NHxxx`
//!
//! Plus the header block prefix, decoded as a pseudo-instruction.

/// Leading byte pattern identifying an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub value: u8,
    pub mask: u8,
}

impl Opcode {
    const fn new(value: u8, mask: u8) -> Self {
        Self { value, mask }
    }

    /// Returns true if `byte` starts this instruction.
    #[inline]
    pub fn matches(&self, byte: u8) -> bool {
        byte & self.mask == self.value
    }
}

/// Type of one instruction field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// A single bit. `param` is the bitmask within the current byte.
    SBit,
    /// Prefix integer. `param` is the prefix length in bits.
    Varint,
    /// Second prefix integer of the same instruction. `param` is the
    /// prefix length in bits.
    Varint2,
    /// Header name string. `param` is the length prefix in bits; the
    /// Huffman flag is the bit just above it.
    Name,
    /// Header value string, encoded like `Name`.
    Value,
}

/// One field of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub ty: FieldType,
    pub param: u8,
}

const fn field(ty: FieldType, param: u8) -> Field {
    Field { ty, param }
}

/// Identity of an instruction, for dispatching decoded instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    InsertWithNameReference,
    InsertWithoutNameReference,
    Duplicate,
    SetDynamicTableCapacity,
    InsertCountIncrement,
    HeaderAcknowledgement,
    StreamCancellation,
    Prefix,
    IndexedHeaderField,
    IndexedHeaderFieldPostBase,
    LiteralHeaderFieldNameReference,
    LiteralHeaderFieldPostBase,
    LiteralHeaderField,
}

/// Static description of a wire instruction.
#[derive(Debug, PartialEq, Eq)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub opcode: Opcode,
    pub fields: &'static [Field],
}

/// The set of instructions that may appear on one kind of stream.
pub type Language = [&'static Instruction];

use FieldType::{Name, SBit, Value, Varint, Varint2};

pub static INSERT_WITH_NAME_REFERENCE: Instruction = Instruction {
    kind: InstructionKind::InsertWithNameReference,
    opcode: Opcode::new(0b1000_0000, 0b1000_0000),
    fields: &[field(SBit, 0b0100_0000), field(Varint, 6), field(Value, 7)],
};

pub static INSERT_WITHOUT_NAME_REFERENCE: Instruction = Instruction {
    kind: InstructionKind::InsertWithoutNameReference,
    opcode: Opcode::new(0b0100_0000, 0b1100_0000),
    fields: &[field(Name, 5), field(Value, 7)],
};

pub static DUPLICATE: Instruction = Instruction {
    kind: InstructionKind::Duplicate,
    opcode: Opcode::new(0b0000_0000, 0b1110_0000),
    fields: &[field(Varint, 5)],
};

pub static SET_DYNAMIC_TABLE_CAPACITY: Instruction = Instruction {
    kind: InstructionKind::SetDynamicTableCapacity,
    opcode: Opcode::new(0b0010_0000, 0b1110_0000),
    fields: &[field(Varint, 5)],
};

pub static INSERT_COUNT_INCREMENT: Instruction = Instruction {
    kind: InstructionKind::InsertCountIncrement,
    opcode: Opcode::new(0b0000_0000, 0b1100_0000),
    fields: &[field(Varint, 6)],
};

pub static HEADER_ACKNOWLEDGEMENT: Instruction = Instruction {
    kind: InstructionKind::HeaderAcknowledgement,
    opcode: Opcode::new(0b1000_0000, 0b1000_0000),
    fields: &[field(Varint, 7)],
};

pub static STREAM_CANCELLATION: Instruction = Instruction {
    kind: InstructionKind::StreamCancellation,
    opcode: Opcode::new(0b0100_0000, 0b1100_0000),
    fields: &[field(Varint, 6)],
};

/// Header block prefix: encoded Required Insert Count, then the sign of
/// Delta Base and Delta Base itself.
pub static PREFIX: Instruction = Instruction {
    kind: InstructionKind::Prefix,
    opcode: Opcode::new(0b0000_0000, 0b0000_0000),
    fields: &[field(Varint, 8), field(SBit, 0b1000_0000), field(Varint2, 7)],
};

pub static INDEXED_HEADER_FIELD: Instruction = Instruction {
    kind: InstructionKind::IndexedHeaderField,
    opcode: Opcode::new(0b1000_0000, 0b1000_0000),
    fields: &[field(SBit, 0b0100_0000), field(Varint, 6)],
};

pub static INDEXED_HEADER_FIELD_POST_BASE: Instruction = Instruction {
    kind: InstructionKind::IndexedHeaderFieldPostBase,
    opcode: Opcode::new(0b0001_0000, 0b1111_0000),
    fields: &[field(Varint, 4)],
};

pub static LITERAL_HEADER_FIELD_NAME_REFERENCE: Instruction = Instruction {
    kind: InstructionKind::LiteralHeaderFieldNameReference,
    opcode: Opcode::new(0b0100_0000, 0b1100_0000),
    fields: &[field(SBit, 0b0001_0000), field(Varint, 4), field(Value, 7)],
};

pub static LITERAL_HEADER_FIELD_POST_BASE: Instruction = Instruction {
    kind: InstructionKind::LiteralHeaderFieldPostBase,
    opcode: Opcode::new(0b0000_0000, 0b1111_0000),
    fields: &[field(Varint, 3), field(Value, 7)],
};

pub static LITERAL_HEADER_FIELD: Instruction = Instruction {
    kind: InstructionKind::LiteralHeaderField,
    opcode: Opcode::new(0b0010_0000, 0b1110_0000),
    fields: &[field(Name, 3), field(Value, 7)],
};

pub static ENCODER_STREAM_LANGUAGE: &Language = &[
    &INSERT_WITH_NAME_REFERENCE,
    &INSERT_WITHOUT_NAME_REFERENCE,
    &DUPLICATE,
    &SET_DYNAMIC_TABLE_CAPACITY,
];

pub static DECODER_STREAM_LANGUAGE: &Language = &[
    &INSERT_COUNT_INCREMENT,
    &HEADER_ACKNOWLEDGEMENT,
    &STREAM_CANCELLATION,
];

pub static PREFIX_LANGUAGE: &Language = &[&PREFIX];

pub static REQUEST_STREAM_LANGUAGE: &Language = &[
    &INDEXED_HEADER_FIELD,
    &INDEXED_HEADER_FIELD_POST_BASE,
    &LITERAL_HEADER_FIELD_NAME_REFERENCE,
    &LITERAL_HEADER_FIELD_POST_BASE,
    &LITERAL_HEADER_FIELD,
];

/// Returns the instruction of `language` that `byte` starts.
pub fn lookup_opcode(language: &Language, byte: u8) -> Option<&'static Instruction> {
    language
        .iter()
        .copied()
        .find(|instruction| instruction.opcode.matches(byte))
}

/// Checks that every possible leading byte matches exactly one opcode, and
/// that no opcode has bits set outside its mask.
pub fn validate_language(language: &Language) -> bool {
    if language
        .iter()
        .any(|instruction| instruction.opcode.value & !instruction.opcode.mask != 0)
    {
        return false;
    }
    (0..=u8::MAX).all(|byte| {
        language
            .iter()
            .filter(|instruction| instruction.opcode.matches(byte))
            .count()
            == 1
    })
}

/// One instruction together with the values to encode.
///
/// Name and value borrow from the caller and must outlive the encode call.
#[derive(Debug, Clone, Copy)]
pub struct InstructionWithValues<'a> {
    instruction: &'static Instruction,
    s_bit: bool,
    varint: u64,
    varint2: u64,
    name: &'a [u8],
    value: &'a [u8],
}

impl<'a> InstructionWithValues<'a> {
    fn new(instruction: &'static Instruction) -> Self {
        Self {
            instruction,
            s_bit: false,
            varint: 0,
            varint2: 0,
            name: &[],
            value: &[],
        }
    }

    pub fn insert_with_name_reference(is_static: bool, name_index: u64, value: &'a [u8]) -> Self {
        Self {
            s_bit: is_static,
            varint: name_index,
            value,
            ..Self::new(&INSERT_WITH_NAME_REFERENCE)
        }
    }

    pub fn insert_without_name_reference(name: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            name,
            value,
            ..Self::new(&INSERT_WITHOUT_NAME_REFERENCE)
        }
    }

    pub fn duplicate(index: u64) -> Self {
        Self {
            varint: index,
            ..Self::new(&DUPLICATE)
        }
    }

    pub fn set_dynamic_table_capacity(capacity: u64) -> Self {
        Self {
            varint: capacity,
            ..Self::new(&SET_DYNAMIC_TABLE_CAPACITY)
        }
    }

    pub fn insert_count_increment(increment: u64) -> Self {
        Self {
            varint: increment,
            ..Self::new(&INSERT_COUNT_INCREMENT)
        }
    }

    pub fn header_acknowledgement(stream_id: u64) -> Self {
        Self {
            varint: stream_id,
            ..Self::new(&HEADER_ACKNOWLEDGEMENT)
        }
    }

    pub fn stream_cancellation(stream_id: u64) -> Self {
        Self {
            varint: stream_id,
            ..Self::new(&STREAM_CANCELLATION)
        }
    }

    /// Header block prefix. `sign` set means Base is below Required
    /// Insert Count.
    pub fn prefix(encoded_required_insert_count: u64, sign: bool, delta_base: u64) -> Self {
        Self {
            varint: encoded_required_insert_count,
            s_bit: sign,
            varint2: delta_base,
            ..Self::new(&PREFIX)
        }
    }

    pub fn indexed_header_field(is_static: bool, index: u64) -> Self {
        Self {
            s_bit: is_static,
            varint: index,
            ..Self::new(&INDEXED_HEADER_FIELD)
        }
    }

    pub fn indexed_header_field_post_base(index: u64) -> Self {
        Self {
            varint: index,
            ..Self::new(&INDEXED_HEADER_FIELD_POST_BASE)
        }
    }

    pub fn literal_header_field_name_reference(is_static: bool, index: u64, value: &'a [u8]) -> Self {
        Self {
            s_bit: is_static,
            varint: index,
            value,
            ..Self::new(&LITERAL_HEADER_FIELD_NAME_REFERENCE)
        }
    }

    pub fn literal_header_field_post_base(index: u64, value: &'a [u8]) -> Self {
        Self {
            varint: index,
            value,
            ..Self::new(&LITERAL_HEADER_FIELD_POST_BASE)
        }
    }

    pub fn literal_header_field(name: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            name,
            value,
            ..Self::new(&LITERAL_HEADER_FIELD)
        }
    }

    pub fn instruction(&self) -> &'static Instruction {
        self.instruction
    }

    pub fn s_bit(&self) -> bool {
        self.s_bit
    }

    pub fn varint(&self) -> u64 {
        self.varint
    }

    pub fn varint2(&self) -> u64 {
        self.varint2
    }

    pub fn name(&self) -> &'a [u8] {
        self.name
    }

    pub fn value(&self) -> &'a [u8] {
        self.value
    }
}
