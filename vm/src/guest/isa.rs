use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, FromRepr};
use thiserror::Error;

/// Every guest instruction is eight bytes: `[op, rd, rs1, rs2, imm32 le]`.
pub const INSN_BYTES: u64 = 8;
pub const NUM_REGS: usize = 16;

/// Stack pointer register.
pub const SP: u8 = 14;
/// Link register written by `call`.
pub const LR: u8 = 15;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x01,
    Li = 0x02,
    Mov = 0x03,
    Add = 0x04,
    Sub = 0x05,
    And = 0x06,
    Or = 0x07,
    Xor = 0x08,
    Shl = 0x09,
    Shr = 0x0a,
    Mul = 0x0b,
    Divu = 0x0c,
    Remu = 0x0d,
    Addi = 0x0e,
    Ld = 0x0f,
    St = 0x10,
    Jmp = 0x11,
    Beqz = 0x12,
    Bnez = 0x13,
    Jr = 0x14,
    Call = 0x15,
    Syscall = 0x16,
    Creq = 0x17,
    Icinv = 0x18,
    Trap = 0x19,
    Sltu = 0x1b,
}

/// The operand shape an opcode takes in assembly and in its encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// No operands.
    None,
    /// `rd, imm`
    RdImm,
    /// `rd, rs1`
    RdRs,
    /// `rd, rs1, rs2`
    RdRsRs,
    /// `rd, rs1, imm`
    RdRsImm,
    /// `rd, imm(rs1)`
    Load,
    /// `rs2, imm(rs1)`
    Store,
    /// `target`
    Target,
    /// `rs1, target`
    RsTarget,
    /// `rs1`
    Rs,
    /// `rs1, rs2`
    RsRs,
}

impl Opcode {
    pub fn format(self) -> Format {
        match self {
            Opcode::Nop | Opcode::Syscall | Opcode::Creq | Opcode::Trap => Format::None,
            Opcode::Li => Format::RdImm,
            Opcode::Mov => Format::RdRs,
            Opcode::Add
            | Opcode::Sub
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Mul
            | Opcode::Divu
            | Opcode::Remu
            | Opcode::Sltu => Format::RdRsRs,
            Opcode::Addi => Format::RdRsImm,
            Opcode::Ld => Format::Load,
            Opcode::St => Format::Store,
            Opcode::Jmp | Opcode::Call => Format::Target,
            Opcode::Beqz | Opcode::Bnez => Format::RsTarget,
            Opcode::Jr => Format::Rs,
            Opcode::Icinv => Format::RsRs,
        }
    }

    /// Whether the instruction ends a basic block.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            Opcode::Jmp
                | Opcode::Beqz
                | Opcode::Bnez
                | Opcode::Jr
                | Opcode::Call
                | Opcode::Syscall
                | Opcode::Creq
                | Opcode::Icinv
                | Opcode::Trap
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("register r{0} does not exist")]
    BadRegister(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: i32,
}

impl Instruction {
    pub const fn new(opcode: Opcode, rd: u8, rs1: u8, rs2: u8, imm: i32) -> Self {
        Self {
            opcode,
            rd,
            rs1,
            rs2,
            imm,
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let imm = self.imm.to_le_bytes();
        [
            self.opcode as u8,
            self.rd,
            self.rs1,
            self.rs2,
            imm[0],
            imm[1],
            imm[2],
            imm[3],
        ]
    }

    pub fn decode(bytes: [u8; 8]) -> Result<Self, DecodeError> {
        let opcode = Opcode::from_repr(bytes[0]).ok_or(DecodeError::UnknownOpcode(bytes[0]))?;
        for &reg in &bytes[1..4] {
            if reg as usize >= NUM_REGS {
                return Err(DecodeError::BadRegister(reg));
            }
        }
        let imm = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self::new(opcode, bytes[1], bytes[2], bytes[3], imm))
    }

    /// The absolute target of a direct control transfer.
    pub fn direct_target(&self) -> Option<u64> {
        match self.opcode.format() {
            Format::Target | Format::RsTarget => Some(self.imm as u32 as u64),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode;
        let (rd, rs1, rs2, imm) = (self.rd, self.rs1, self.rs2, self.imm);
        match op.format() {
            Format::None => write!(f, "{op}"),
            Format::RdImm => write!(f, "{op} r{rd}, {imm}"),
            Format::RdRs => write!(f, "{op} r{rd}, r{rs1}"),
            Format::RdRsRs => write!(f, "{op} r{rd}, r{rs1}, r{rs2}"),
            Format::RdRsImm => write!(f, "{op} r{rd}, r{rs1}, {imm}"),
            Format::Load => write!(f, "{op} r{rd}, {imm}(r{rs1})"),
            Format::Store => write!(f, "{op} r{rs2}, {imm}(r{rs1})"),
            Format::Target => write!(f, "{op} {:#x}", imm as u32),
            Format::RsTarget => write!(f, "{op} r{rs1}, {:#x}", imm as u32),
            Format::Rs => write!(f, "{op} r{rs1}"),
            Format::RsRs => write!(f, "{op} r{rs1}, r{rs2}"),
        }
    }
}
