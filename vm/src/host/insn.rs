//! Host instructions.
//!
//! Each instruction is one `u64`: `op | a << 8 | b << 16 | c << 24 | imm << 32`.
//! Operands `a`, `b` and `c` are register-file slot indices. `Jump` keeps its
//! target sector in bits 8..24 and its offset in the immediate, so a chain
//! patch is a single word store.

use strum_macros::{Display, FromRepr};
use thiserror::Error;

use super::HostAddr;
use crate::dispatch::TraceCode;

/// Offset of a translation's fast entry, just past its event check.
pub const FAST_ENTRY_OFFSET: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum HostOp {
    EvCheck = 0x01,
    PutIp = 0x02,
    Li = 0x03,
    LiU = 0x04,
    Mov = 0x05,
    Alu = 0x06,
    AddI = 0x07,
    Load = 0x08,
    Store = 0x09,
    SkipIfZero = 0x0a,
    SkipIfNonZero = 0x0b,
    ChainMeSlow = 0x0c,
    ChainMeFast = 0x0d,
    Jump = 0x0e,
    XIndir = 0x0f,
    XAssisted = 0x10,
    SmcCheck = 0x11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Mul,
    DivU,
    RemU,
    Sltu,
}

impl AluOp {
    /// `None` for a division by zero.
    pub fn apply(self, a: u64, b: u64) -> Option<u64> {
        Some(match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Shl => a.wrapping_shl(b as u32 & 63),
            AluOp::Shr => a.wrapping_shr(b as u32 & 63),
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::DivU => a.checked_div(b)?,
            AluOp::RemU => a.checked_rem(b)?,
            AluOp::Sltu => (a < b) as u64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostInsn {
    /// Checked entry: exit with `EventCheck` when the budget slot is zero, else decrement it.
    EvCheck,
    PutIp(u32),
    /// Sign-extending immediate load.
    Li { dst: u8, imm: i32 },
    /// Zero-extending immediate load.
    LiU { dst: u8, imm: u32 },
    Mov { dst: u8, src: u8 },
    Alu { op: AluOp, dst: u8, a: u8, b: u8 },
    AddI { dst: u8, src: u8, imm: i32 },
    Load { dst: u8, base: u8, offset: i32 },
    Store { src: u8, base: u8, offset: i32 },
    SkipIfZero { reg: u8, count: u32 },
    SkipIfNonZero { reg: u8, count: u32 },
    /// Unpatched chain site; exits with `ChainMeSlow`/`ChainMeFast` and the site's address.
    ChainMe { fast: bool },
    /// Patched chain site.
    Jump(HostAddr),
    /// Look the guest ip up in the fast cache and continue there, or exit with `CacheMiss`.
    XIndir,
    XAssisted(TraceCode),
    /// Guard followed by two data words: guest start and FNV-1a hash of `len` guest bytes.
    SmcCheck { len: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HostDecodeError {
    #[error("unknown host op {0:#04x} in word {1:#018x}")]
    UnknownOp(u8, u64),
    #[error("unknown alu op {0} in word {1:#018x}")]
    UnknownAluOp(u32, u64),
    #[error("unknown trace code {0} in word {1:#018x}")]
    UnknownTraceCode(u32, u64),
}

const fn fields(op: HostOp, a: u8, b: u8, c: u8, imm: u32) -> u64 {
    op as u64 | (a as u64) << 8 | (b as u64) << 16 | (c as u64) << 24 | (imm as u64) << 32
}

impl HostInsn {
    pub fn encode(self) -> u64 {
        match self {
            HostInsn::EvCheck => fields(HostOp::EvCheck, 0, 0, 0, 0),
            HostInsn::PutIp(ip) => fields(HostOp::PutIp, 0, 0, 0, ip),
            HostInsn::Li { dst, imm } => fields(HostOp::Li, dst, 0, 0, imm as u32),
            HostInsn::LiU { dst, imm } => fields(HostOp::LiU, dst, 0, 0, imm),
            HostInsn::Mov { dst, src } => fields(HostOp::Mov, dst, src, 0, 0),
            HostInsn::Alu { op, dst, a, b } => fields(HostOp::Alu, dst, a, b, op as u32),
            HostInsn::AddI { dst, src, imm } => fields(HostOp::AddI, dst, src, 0, imm as u32),
            HostInsn::Load { dst, base, offset } => {
                fields(HostOp::Load, dst, base, 0, offset as u32)
            }
            HostInsn::Store { src, base, offset } => {
                fields(HostOp::Store, src, base, 0, offset as u32)
            }
            HostInsn::SkipIfZero { reg, count } => fields(HostOp::SkipIfZero, reg, 0, 0, count),
            HostInsn::SkipIfNonZero { reg, count } => {
                fields(HostOp::SkipIfNonZero, reg, 0, 0, count)
            }
            HostInsn::ChainMe { fast: false } => fields(HostOp::ChainMeSlow, 0, 0, 0, 0),
            HostInsn::ChainMe { fast: true } => fields(HostOp::ChainMeFast, 0, 0, 0, 0),
            HostInsn::Jump(to) => {
                let [lo, hi] = to.sector.to_le_bytes();
                fields(HostOp::Jump, lo, hi, 0, to.offset)
            }
            HostInsn::XIndir => fields(HostOp::XIndir, 0, 0, 0, 0),
            HostInsn::XAssisted(trc) => fields(HostOp::XAssisted, 0, 0, 0, trc as u32),
            HostInsn::SmcCheck { len } => fields(HostOp::SmcCheck, 0, 0, 0, len),
        }
    }

    pub fn decode(word: u64) -> Result<Self, HostDecodeError> {
        let [op, a, b, c, ..] = word.to_le_bytes();
        let imm = (word >> 32) as u32;
        let op = HostOp::from_repr(op).ok_or(HostDecodeError::UnknownOp(op, word))?;
        Ok(match op {
            HostOp::EvCheck => HostInsn::EvCheck,
            HostOp::PutIp => HostInsn::PutIp(imm),
            HostOp::Li => HostInsn::Li {
                dst: a,
                imm: imm as i32,
            },
            HostOp::LiU => HostInsn::LiU { dst: a, imm },
            HostOp::Mov => HostInsn::Mov { dst: a, src: b },
            HostOp::Alu => HostInsn::Alu {
                op: u8::try_from(imm)
                    .ok()
                    .and_then(AluOp::from_repr)
                    .ok_or(HostDecodeError::UnknownAluOp(imm, word))?,
                dst: a,
                a: b,
                b: c,
            },
            HostOp::AddI => HostInsn::AddI {
                dst: a,
                src: b,
                imm: imm as i32,
            },
            HostOp::Load => HostInsn::Load {
                dst: a,
                base: b,
                offset: imm as i32,
            },
            HostOp::Store => HostInsn::Store {
                src: a,
                base: b,
                offset: imm as i32,
            },
            HostOp::SkipIfZero => HostInsn::SkipIfZero { reg: a, count: imm },
            HostOp::SkipIfNonZero => HostInsn::SkipIfNonZero { reg: a, count: imm },
            HostOp::ChainMeSlow => HostInsn::ChainMe { fast: false },
            HostOp::ChainMeFast => HostInsn::ChainMe { fast: true },
            HostOp::Jump => HostInsn::Jump(HostAddr::new(u16::from_le_bytes([a, b]), imm)),
            HostOp::XIndir => HostInsn::XIndir,
            HostOp::XAssisted => HostInsn::XAssisted(
                TraceCode::from_repr(imm).ok_or(HostDecodeError::UnknownTraceCode(imm, word))?,
            ),
            HostOp::SmcCheck => HostInsn::SmcCheck { len: imm },
        })
    }

    pub fn is_chain_me(word: u64) -> bool {
        matches!(HostInsn::decode(word), Ok(HostInsn::ChainMe { .. }))
    }
}

/// FNV-1a over guest code bytes, as stored in an `SmcCheck` guard.
pub fn code_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |h, &b| {
        (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
