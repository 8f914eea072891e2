//! Instruction set shared by the VM, the generator, and the mutation logic.
//!
//! This table is the single source of truth for the opcode byte values, their
//! mnemonics, and their operand widths. Nothing else in the crate is allowed
//! to hard-code instruction framing.

use serde::{Deserialize, Serialize};

/// One instruction of the drawing stack machine.
///
/// Every opcode is a single byte followed by zero or one operand bytes; the
/// discriminants below are the on-wire byte values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    Push = 0x01,
    Pop = 0x02,
    Add = 0x03,
    Sub = 0x04,
    Mul = 0x05,
    Div = 0x06,
    Mod = 0x07,
    And = 0x08,
    Or = 0x09,
    Xor = 0x0A,
    Not = 0x0B,
    Jmp = 0x0C,
    Jz = 0x0D,
    Jnz = 0x0E,
    Call = 0x0F,
    Ret = 0x10,
    Load = 0x11,
    Store = 0x12,
    DrawPixel = 0x13,
    SetX = 0x14,
    SetY = 0x15,
    SetColorR = 0x16,
    SetColorG = 0x17,
    SetColorB = 0x18,
    Random = 0x19,
    Dup = 0x1A,
    Swap = 0x1B,
    Rot = 0x1C,
    DrawCircle = 0x1D,
    DrawRectangle = 0x1E,
    DrawLine = 0x1F,
    DrawBezierCurve = 0x20,
    DrawTriangle = 0x21,
    Halt = 0xFF,
}

impl Opcode {
    /// Decodes a raw byte, returning `None` for bytes outside the table.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Nop,
            0x01 => Self::Push,
            0x02 => Self::Pop,
            0x03 => Self::Add,
            0x04 => Self::Sub,
            0x05 => Self::Mul,
            0x06 => Self::Div,
            0x07 => Self::Mod,
            0x08 => Self::And,
            0x09 => Self::Or,
            0x0A => Self::Xor,
            0x0B => Self::Not,
            0x0C => Self::Jmp,
            0x0D => Self::Jz,
            0x0E => Self::Jnz,
            0x0F => Self::Call,
            0x10 => Self::Ret,
            0x11 => Self::Load,
            0x12 => Self::Store,
            0x13 => Self::DrawPixel,
            0x14 => Self::SetX,
            0x15 => Self::SetY,
            0x16 => Self::SetColorR,
            0x17 => Self::SetColorG,
            0x18 => Self::SetColorB,
            0x19 => Self::Random,
            0x1A => Self::Dup,
            0x1B => Self::Swap,
            0x1C => Self::Rot,
            0x1D => Self::DrawCircle,
            0x1E => Self::DrawRectangle,
            0x1F => Self::DrawLine,
            0x20 => Self::DrawBezierCurve,
            0x21 => Self::DrawTriangle,
            0xFF => Self::Halt,
            _ => return None,
        })
    }

    /// The raw byte value of this opcode.
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Width of the inline operand in bytes, always 0 or 1.
    #[must_use]
    pub const fn operand_width(self) -> usize {
        match self {
            Self::Push
            | Self::Jmp
            | Self::Jz
            | Self::Jnz
            | Self::Call
            | Self::Load
            | Self::Store
            | Self::SetX
            | Self::SetY => 1,
            _ => 0,
        }
    }

    /// Human-readable mnemonic used by the disassembler and logs.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Push => "PUSH",
            Self::Pop => "POP",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
            Self::Not => "NOT",
            Self::Jmp => "JMP",
            Self::Jz => "JZ",
            Self::Jnz => "JNZ",
            Self::Call => "CALL",
            Self::Ret => "RET",
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::DrawPixel => "DRAW_PIXEL",
            Self::SetX => "SET_X",
            Self::SetY => "SET_Y",
            Self::SetColorR => "SET_COLOR_R",
            Self::SetColorG => "SET_COLOR_G",
            Self::SetColorB => "SET_COLOR_B",
            Self::Random => "RANDOM",
            Self::Dup => "DUP",
            Self::Swap => "SWAP",
            Self::Rot => "ROT",
            Self::DrawCircle => "DRAW_CIRCLE",
            Self::DrawRectangle => "DRAW_RECTANGLE",
            Self::DrawLine => "DRAW_LINE",
            Self::DrawBezierCurve => "DRAW_BEZIER_CURVE",
            Self::DrawTriangle => "DRAW_TRIANGLE",
            Self::Halt => "HALT",
        }
    }

    /// Returns true for the drawing primitives that define crossover unit
    /// boundaries.
    #[must_use]
    pub const fn is_drawing(self) -> bool {
        matches!(
            self,
            Self::DrawPixel
                | Self::DrawCircle
                | Self::DrawRectangle
                | Self::DrawLine
                | Self::DrawBezierCurve
                | Self::DrawTriangle
        )
    }
}

/// Operand-less opcodes eligible as mutation targets. HALT is excluded so a
/// mutation can never truncate a program, and replacements stay within the
/// same operand width so instruction framing survives mutation.
pub const MUTABLE_NO_OPERAND: &[Opcode] = &[
    Opcode::Nop,
    Opcode::Pop,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Div,
    Opcode::Mod,
    Opcode::And,
    Opcode::Or,
    Opcode::Xor,
    Opcode::Not,
    Opcode::Ret,
    Opcode::DrawPixel,
    Opcode::SetColorR,
    Opcode::SetColorG,
    Opcode::SetColorB,
    Opcode::Random,
    Opcode::Dup,
    Opcode::Swap,
    Opcode::Rot,
    Opcode::DrawCircle,
    Opcode::DrawRectangle,
    Opcode::DrawLine,
    Opcode::DrawBezierCurve,
    Opcode::DrawTriangle,
];

/// One-byte-operand opcodes eligible as mutation targets.
pub const MUTABLE_WITH_OPERAND: &[Opcode] = &[
    Opcode::Push,
    Opcode::Jmp,
    Opcode::Jz,
    Opcode::Jnz,
    Opcode::Call,
    Opcode::Load,
    Opcode::Store,
    Opcode::SetX,
    Opcode::SetY,
];
