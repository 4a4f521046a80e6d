//! The host side: register-file layout and the word-encoded code that
//! translations are made of.

use std::fmt;

pub mod arch;
pub mod insn;

pub use arch::ArchState;
pub use insn::{AluOp, HostInsn};

/// A word inside a sector's code arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAddr {
    pub sector: u16,
    pub offset: u32,
}

impl HostAddr {
    pub const fn new(sector: u16, offset: u32) -> Self {
        Self { sector, offset }
    }

    /// Packs the address into one non-zero word, the second word of a dispatch return.
    pub fn to_word(self) -> u64 {
        ((self.sector as u64 + 1) << 32) | self.offset as u64
    }

    pub fn from_word(word: u64) -> Option<Self> {
        let sector = (word >> 32).checked_sub(1)?;
        Some(Self::new(u16::try_from(sector).ok()?, word as u32))
    }

    pub fn add(self, words: u32) -> Self {
        Self::new(self.sector, self.offset.wrapping_add(words))
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.sector, self.offset)
    }
}
