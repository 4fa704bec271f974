use core::fmt;

use crate::op::{Format, Op};

/// Operand values decoded according to the opcode's [`Format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    Byte(u8),
    Int32(i32),
    ByteByte(u8, u8),
    ByteInt32(u8, i32),
    Int32Int32(i32, i32),
}

/// A decoded instruction: the opcode plus its operands. Produced by the
/// [`BytecodeDecoder`](crate::BytecodeDecoder); the engine itself reads the
/// raw byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    pub operands: Operands,
}

impl Instruction {
    /// Decode the instruction starting at `bytes[offset]`.
    ///
    /// Returns `None` on an invalid opcode byte or a truncated stream.
    pub fn decode(bytes: &[u8], offset: usize) -> Option<Instruction> {
        let op = Op::try_from(*bytes.get(offset)?).ok()?;
        if offset + op.length() > bytes.len() {
            return None;
        }
        let byte = |at: usize| bytes[offset + at];
        let int32 = |at: usize| {
            i32::from_ne_bytes([byte(at), byte(at + 1), byte(at + 2), byte(at + 3)])
        };
        let operands = match op.info().format {
            Format::Plain => Operands::None,
            Format::Byte => Operands::Byte(byte(1)),
            Format::Int32 => Operands::Int32(int32(1)),
            Format::ByteByte => Operands::ByteByte(byte(1), byte(2)),
            Format::ByteInt32 => Operands::ByteInt32(byte(1), int32(2)),
            Format::Int32Int32 => Operands::Int32Int32(int32(1), int32(5)),
        };
        Some(Instruction { op, operands })
    }

    pub fn length(&self) -> usize {
        self.op.length()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.op.info().printable;
        match self.operands {
            Operands::None => write!(f, "{name}"),
            Operands::Byte(a) => write!(f, "{name} {a}"),
            Operands::Int32(a) => write!(f, "{name} {a}"),
            Operands::ByteByte(a, b) => write!(f, "{name} {a} {b}"),
            Operands::ByteInt32(a, b) => write!(f, "{name} {a} {b}"),
            Operands::Int32Int32(a, b) => write!(f, "{name} {a} {b}"),
        }
    }
}
