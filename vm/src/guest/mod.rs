//! The guest side: instruction set, assembler, address space and program images.

pub mod asm;
pub mod isa;
pub mod memory;
pub mod program;

pub use asm::{assemble, AsmError};
pub use isa::{DecodeError, Instruction, Opcode, INSN_BYTES, LR, NUM_REGS, SP};
pub use memory::{GuestMemory, GuestMemoryError, Perms, PAGE_SIZE};
pub use program::Program;
