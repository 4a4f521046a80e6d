//! Guest programs loaded by the engine.

use serde::{Deserialize, Serialize};

use super::{
    isa::{Instruction, INSN_BYTES},
    memory::{page_align_down, page_align_up, GuestMemory, GuestMemoryError, Perms},
};

/// Default load address for assembled programs.
pub const DEFAULT_BASE: u64 = 0x1_0000;

/// A flat guest image.
///
/// The image is mapped read/write/execute at `base` and execution starts at `entry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// The load address of the first image byte.
    pub base: u64,
    /// The raw image: instructions and data.
    pub image: Vec<u8>,
    /// The start address of the program.
    pub entry: u64,
}

impl Program {
    #[must_use]
    pub fn new(base: u64, image: Vec<u8>, entry: u64) -> Self {
        Self { base, image, entry }
    }

    /// Builds a program from a straight list of instructions loaded at `base`.
    pub fn from_instructions(base: u64, insns: &[Instruction]) -> Self {
        let image = insns.iter().flat_map(|insn| insn.encode()).collect();
        Self::new(base, image, base)
    }

    pub fn end(&self) -> u64 {
        self.base + self.image.len() as u64
    }

    pub fn len_insns(&self) -> u64 {
        self.image.len() as u64 / INSN_BYTES
    }

    /// Maps the image into `mem`.
    pub fn load(&self, mem: &mut GuestMemory) -> Result<(), GuestMemoryError> {
        let start = page_align_down(self.base);
        let end = page_align_up(self.end()).ok_or(GuestMemoryError::Overflow {
            addr: self.base,
            len: self.image.len() as u64,
        })?;
        mem.map(start, (end - start).max(1), Perms::RWX)?;
        mem.write(self.base, &self.image, Perms::empty())
    }
}
