//! The dispatcher trampoline: runs translated code until it needs the scheduler.
//!
//! The trampoline never interprets trace codes. It executes host words from
//! the translation cache, following patched chain sites and fast-cache hits
//! on indirect exits, and returns exactly two words: a trace code and either
//! zero or a host address. Guest faults and asynchronous signals abandon the
//! run at this boundary and come back as [`Outcome::Interrupted`].

use std::convert::Infallible;

use serde::Serialize;
use strum_macros::{Display, EnumIter, FromRepr};

use crate::{
    guest::{GuestMemory, Perms},
    host::{
        arch::{ArchState, CMLEN_SLOT, CMSTART_SLOT, IP_SLOT},
        insn::code_hash,
        HostAddr, HostInsn,
    },
    scheduler::{
        mailbox::Mailbox,
        signals::{SigInfo, Signal},
    },
    transtab::TransCache,
};

/// Why control came back from translated code.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    FromRepr,
    Serialize,
)]
#[repr(u32)]
pub enum TraceCode {
    /// Plain exit with the guest ip already written back.
    Boring = 1,
    /// No translation is known for the guest ip.
    CacheMiss = 2,
    /// The block budget reached zero at a checked entry.
    EventCheck = 3,
    /// An unpatched site wants chaining to the target's checked entry.
    ChainMeSlow = 4,
    /// An unpatched site wants chaining to the target's fast entry.
    ChainMeFast = 5,
    Syscall = 6,
    ClientRequest = 7,
    /// Discard translations for `cmstart/cmlen` and resume at the guest ip.
    /// The address word is the failing guard for a detected modification.
    InvalidateICache = 8,
    SigTrap = 9,
    /// Generated code found an inconsistency it cannot recover from.
    InvariantFailed = 10,
}

/// The result of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { trc: TraceCode, addr: u64 },
    Interrupted(SigInfo),
}

fn invariant(at: HostAddr) -> [u64; 2] {
    [TraceCode::InvariantFailed as u64, at.to_word()]
}

fn slot(arch: &ArchState, at: HostAddr, idx: u8) -> Result<u64, [u64; 2]> {
    arch.slot(idx).ok_or_else(|| invariant(at))
}

fn set_slot(arch: &mut ArchState, at: HostAddr, idx: u8, value: u64) -> Result<(), [u64; 2]> {
    *arch.slot_mut(idx).ok_or_else(|| invariant(at))? = value;
    Ok(())
}

/// Early exits from the inner loop: a finished dispatch or an abandoned one.
enum Exit {
    Done([u64; 2]),
    Signal(SigInfo),
}

impl From<[u64; 2]> for Exit {
    fn from(words: [u64; 2]) -> Self {
        Exit::Done(words)
    }
}

impl From<SigInfo> for Exit {
    fn from(info: SigInfo) -> Self {
        Exit::Signal(info)
    }
}

/// Runs translated code from `entry` until it returns to the scheduler.
///
/// The caller writes the block budget into `arch.evc_counter` beforehand and
/// reads the remainder back afterwards, whatever the outcome.
pub fn run_translations(
    cache: &TransCache,
    mem: &mut GuestMemory,
    arch: &mut ArchState,
    mailbox: &Mailbox,
    entry: HostAddr,
) -> Outcome {
    let words = match run_innerloop(cache, mem, arch, mailbox, entry) {
        Ok(never) => match never {},
        Err(Exit::Done(words)) => words,
        Err(Exit::Signal(info)) => return Outcome::Interrupted(info),
    };
    match u32::try_from(words[0]).ok().and_then(TraceCode::from_repr) {
        Some(trc) => Outcome::Completed {
            trc,
            addr: words[1],
        },
        None => Outcome::Completed {
            trc: TraceCode::InvariantFailed,
            addr: words[0],
        },
    }
}

fn run_innerloop(
    cache: &TransCache,
    mem: &mut GuestMemory,
    arch: &mut ArchState,
    mailbox: &Mailbox,
    entry: HostAddr,
) -> Result<Infallible, Exit> {
    let mut pc = entry;
    loop {
        let word = cache.code_word(pc).ok_or_else(|| invariant(pc))?;
        let insn = HostInsn::decode(word).map_err(|_| invariant(pc))?;
        let mut next = pc.add(1);
        match insn {
            HostInsn::EvCheck => {
                if arch.evc_counter == 0 {
                    return Err([TraceCode::EventCheck as u64, 0].into());
                }
                arch.evc_counter -= 1;
            }
            HostInsn::PutIp(ip) => {
                arch.ip = ip as u64;
                if mailbox.interrupt_pending() {
                    return Err(match mailbox.take_signal() {
                        Some(sig) => SigInfo::user(sig).into(),
                        None => [TraceCode::Boring as u64, 0].into(),
                    });
                }
            }
            HostInsn::Li { dst, imm } => set_slot(arch, pc, dst, imm as i64 as u64)?,
            HostInsn::LiU { dst, imm } => set_slot(arch, pc, dst, imm as u64)?,
            HostInsn::Mov { dst, src } => {
                let v = slot(arch, pc, src)?;
                set_slot(arch, pc, dst, v)?;
            }
            HostInsn::Alu { op, dst, a, b } => {
                let (a, b) = (slot(arch, pc, a)?, slot(arch, pc, b)?);
                let v = op
                    .apply(a, b)
                    .ok_or_else(|| SigInfo::fault(Signal::SIGFPE, arch.ip))?;
                set_slot(arch, pc, dst, v)?;
            }
            HostInsn::AddI { dst, src, imm } => {
                let v = slot(arch, pc, src)?.wrapping_add(imm as i64 as u64);
                set_slot(arch, pc, dst, v)?;
            }
            HostInsn::Load { dst, base, offset } => {
                let addr = slot(arch, pc, base)?.wrapping_add(offset as i64 as u64);
                let v = mem.load_u64(addr).map_err(SigInfo::from_memory)?;
                set_slot(arch, pc, dst, v)?;
            }
            HostInsn::Store { src, base, offset } => {
                let addr = slot(arch, pc, base)?.wrapping_add(offset as i64 as u64);
                let v = slot(arch, pc, src)?;
                mem.store_u64(addr, v).map_err(SigInfo::from_memory)?;
            }
            HostInsn::SkipIfZero { reg, count } => {
                if slot(arch, pc, reg)? == 0 {
                    next = pc.add(1 + count);
                }
            }
            HostInsn::SkipIfNonZero { reg, count } => {
                if slot(arch, pc, reg)? != 0 {
                    next = pc.add(1 + count);
                }
            }
            HostInsn::ChainMe { fast } => {
                let trc = if fast {
                    TraceCode::ChainMeFast
                } else {
                    TraceCode::ChainMeSlow
                };
                return Err([trc as u64, pc.to_word()].into());
            }
            HostInsn::Jump(to) => next = to,
            HostInsn::XIndir => match cache.lookup_fast(arch.ip) {
                Some(host) => next = host,
                None => return Err([TraceCode::CacheMiss as u64, 0].into()),
            },
            HostInsn::XAssisted(trc) => return Err([trc as u64, 0].into()),
            HostInsn::SmcCheck { len } => {
                let start = cache.code_word(pc.add(1)).ok_or_else(|| invariant(pc))?;
                let hash = cache.code_word(pc.add(2)).ok_or_else(|| invariant(pc))?;
                let now = mem.read_vec(start, len as usize, Perms::EXEC).map(|b| code_hash(&b));
                if now != Ok(hash) {
                    set_slot(arch, pc, CMSTART_SLOT, start)?;
                    set_slot(arch, pc, CMLEN_SLOT, len as u64)?;
                    set_slot(arch, pc, IP_SLOT, start)?;
                    // A guard reports its own address; an `icinv` exit reports zero.
                    return Err([TraceCode::InvalidateICache as u64, pc.to_word()].into());
                }
                next = pc.add(3);
            }
        }
        pc = next;
    }
}

#[cfg(test)]
mod tests;
