//! Guest-visible signals.
//!
//! Faults raised by translated code and signals posted to a thread's mailbox
//! are turned into deliveries on the guest thread: its registers and ip are
//! saved in a [`SigFrame`], and execution continues at the installed handler
//! with `r1 = signo`, `r2 = fault address`, `r3 = si_code`. The handler returns
//! through the `sigreturn` syscall.

use serde::Serialize;
use strum_macros::{Display, EnumIter, FromRepr};

use crate::{
    guest::{GuestMemoryError, NUM_REGS},
    host::ArchState,
};

/// Size of the per-process action table.
pub const NSIG: usize = 32;
/// Nesting limit for handler frames on one thread.
pub const MAX_SIGFRAMES: usize = 16;

#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, FromRepr, Serialize)]
#[repr(u8)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGILL = 4,
    SIGTRAP = 5,
    SIGABRT = 6,
    SIGBUS = 7,
    SIGFPE = 8,
    SIGKILL = 9,
    SIGUSR1 = 10,
    SIGSEGV = 11,
    SIGUSR2 = 12,
    SIGPIPE = 13,
    SIGALRM = 14,
    SIGTERM = 15,
    SIGCHLD = 17,
}

impl Signal {
    pub fn from_raw(n: u64) -> Option<Self> {
        u8::try_from(n).ok().and_then(Self::from_repr)
    }

    pub fn bit(self) -> u64 {
        1 << self as u8
    }

    /// Whether the default action is to ignore the signal rather than terminate.
    pub fn ignored_by_default(self) -> bool {
        self == Signal::SIGCHLD
    }

    pub fn catchable(self) -> bool {
        self != Signal::SIGKILL
    }
}

/// The `si_code` of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum SigCode {
    /// Sent with `kill` or `Engine::post_signal`.
    User = 0,
    SegvMapErr = 1,
    SegvAccErr = 2,
    BusAdrAln = 3,
    FpeIntDiv = 4,
    IllOpc = 5,
    TrapBrkpt = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: Signal,
    pub code: SigCode,
    pub addr: u64,
}

impl SigInfo {
    pub fn user(signo: Signal) -> Self {
        Self {
            signo,
            code: SigCode::User,
            addr: 0,
        }
    }

    /// A synchronous fault raised by the instruction at (or, for traps, just before) `addr`.
    pub fn fault(signo: Signal, addr: u64) -> Self {
        let code = match signo {
            Signal::SIGFPE => SigCode::FpeIntDiv,
            Signal::SIGILL => SigCode::IllOpc,
            Signal::SIGTRAP => SigCode::TrapBrkpt,
            Signal::SIGBUS => SigCode::BusAdrAln,
            _ => SigCode::SegvMapErr,
        };
        Self { signo, code, addr }
    }

    pub fn from_memory(err: GuestMemoryError) -> Self {
        let (signo, code) = match err {
            GuestMemoryError::Unmapped(_) | GuestMemoryError::Overflow { .. } => {
                (Signal::SIGSEGV, SigCode::SegvMapErr)
            }
            GuestMemoryError::Permission { .. } => (Signal::SIGSEGV, SigCode::SegvAccErr),
            GuestMemoryError::Misaligned { .. } | GuestMemoryError::Unaligned { .. } => {
                (Signal::SIGBUS, SigCode::BusAdrAln)
            }
        };
        Self {
            signo,
            code,
            addr: err.fault_addr(),
        }
    }

    pub fn is_sync(&self) -> bool {
        self.code != SigCode::User
    }
}

/// What a guest installed for a signal with `sigaction`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SigAction {
    #[default]
    Default,
    Ignore,
    Handler(u64),
}

impl SigAction {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => SigAction::Default,
            1 => SigAction::Ignore,
            addr => SigAction::Handler(addr),
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            SigAction::Default => 0,
            SigAction::Ignore => 1,
            SigAction::Handler(addr) => addr,
        }
    }
}

/// Context saved when a handler is entered.
#[derive(Debug, Clone)]
pub struct SigFrame {
    pub signo: Signal,
    pub sync: bool,
    pub regs: [u64; NUM_REGS],
    pub ip: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Handler,
    Ignored,
    /// The signal terminates the process.
    Fatal,
}

/// Delivers `info` to a thread's register file according to `action`.
///
/// A synchronous fault raised while a handler for the same signal is already
/// running cannot make progress, so it is fatal whatever the action says.
pub fn deliver(
    action: SigAction,
    arch: &mut ArchState,
    frames: &mut Vec<SigFrame>,
    info: SigInfo,
) -> Delivery {
    let sync = info.is_sync();
    let nested = sync && frames.iter().any(|f| f.sync && f.signo == info.signo);
    if !info.signo.catchable() {
        return Delivery::Fatal;
    }
    match action {
        SigAction::Handler(handler) if !nested && frames.len() < MAX_SIGFRAMES => {
            frames.push(SigFrame {
                signo: info.signo,
                sync,
                regs: arch.regs,
                ip: arch.ip,
            });
            arch.ip = handler;
            arch.regs[1] = info.signo as u64;
            arch.regs[2] = info.addr;
            arch.regs[3] = info.code as u64;
            Delivery::Handler
        }
        SigAction::Ignore if !sync => Delivery::Ignored,
        SigAction::Default if !sync && info.signo.ignored_by_default() => Delivery::Ignored,
        _ => Delivery::Fatal,
    }
}

/// Restores the context saved by the innermost delivery.
pub fn sigreturn(arch: &mut ArchState, frames: &mut Vec<SigFrame>) -> bool {
    match frames.pop() {
        Some(frame) => {
            arch.regs = frame.regs;
            arch.ip = frame.ip;
            true
        }
        None => false,
    }
}
