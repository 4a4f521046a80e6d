//! The per-thread guest register file as seen by generated code.
//!
//! Generated code never names fields: it addresses the block as an array of
//! 64-bit slots, so the layout is fixed and checked at compile time.

use std::mem::{align_of, offset_of, size_of};

use bytemuck::{Pod, Zeroable};
use static_assertions::{const_assert, const_assert_eq};

use crate::guest::NUM_REGS;

pub const N_SLOTS: usize = 48;
pub const IP_SLOT: u8 = 16;
/// Remaining block budget; decremented by every checked block entry.
pub const EVC_SLOT: u8 = 17;
/// Start of a guest range whose translations must be discarded.
pub const CMSTART_SLOT: u8 = 18;
pub const CMLEN_SLOT: u8 = 19;
pub const SHADOW_BASE: u8 = 24;
pub const SPILL_BASE: u8 = 40;
pub const N_SPILL: usize = 8;

#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchState {
    pub regs: [u64; NUM_REGS],
    pub ip: u64,
    pub evc_counter: u64,
    pub cmstart: u64,
    pub cmlen: u64,
    pub reserved: [u64; 4],
    /// Instrumentation shadow of `regs`.
    pub shadow: [u64; NUM_REGS],
    pub spill: [u64; N_SPILL],
}

const_assert_eq!(size_of::<ArchState>(), N_SLOTS * 8);
const_assert_eq!(align_of::<ArchState>(), 64);
const_assert_eq!(offset_of!(ArchState, ip), IP_SLOT as usize * 8);
const_assert_eq!(offset_of!(ArchState, evc_counter), EVC_SLOT as usize * 8);
const_assert_eq!(offset_of!(ArchState, cmstart), CMSTART_SLOT as usize * 8);
const_assert_eq!(offset_of!(ArchState, cmlen), CMLEN_SLOT as usize * 8);
const_assert_eq!(offset_of!(ArchState, shadow), SHADOW_BASE as usize * 8);
const_assert_eq!(offset_of!(ArchState, spill), SPILL_BASE as usize * 8);
const_assert!(SPILL_BASE as usize + N_SPILL == N_SLOTS);

// SAFETY: `repr(C)`, every field is a `u64` array or `u64`, and the size
// assertion above rules out padding.
unsafe impl Zeroable for ArchState {}
unsafe impl Pod for ArchState {}

impl Default for ArchState {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

impl ArchState {
    pub fn words(&self) -> &[u64; N_SLOTS] {
        bytemuck::cast_ref(self)
    }

    pub fn words_mut(&mut self) -> &mut [u64; N_SLOTS] {
        bytemuck::cast_mut(self)
    }

    pub fn slot(&self, slot: u8) -> Option<u64> {
        self.words().get(slot as usize).copied()
    }

    pub fn slot_mut(&mut self, slot: u8) -> Option<&mut u64> {
        self.words_mut().get_mut(slot as usize)
    }

    pub fn reg(&self, r: u8) -> u64 {
        self.regs[r as usize]
    }

    pub fn set_reg(&mut self, r: u8, value: u64) {
        self.regs[r as usize] = value;
    }

    pub fn is_aligned(&self) -> bool {
        (self as *const Self as usize) % 64 == 0
    }
}
