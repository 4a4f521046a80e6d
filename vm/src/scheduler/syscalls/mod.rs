//! Syscall definitions & implementations for the scheduler.
//!
//! Handlers run with the big lock held. A call that may block returns a
//! [`BlockingCall`] instead of doing the work, and the scheduler performs it
//! through the [`Kernel`] with the lock released.

pub mod code;
pub mod kernel;
mod memory;
mod process;
mod signal;
mod thread;
mod write;

use std::sync::Arc;

pub use code::*;
use hashbrown::HashMap;
pub use kernel::{BlockingCall, HostKernel, Kernel};

use super::{
    mailbox::Mailbox,
    state::Core,
    threads::{ExitReason, ThreadId},
};
use crate::{error::EngineError, guest::GuestMemory, host::ArchState};
use memory::{MmapSyscall, MprotectSyscall, MunmapSyscall};
use process::{ExitGroupSyscall, ExitSyscall, GettidSyscall, NanosleepSyscall, SchedYieldSyscall};
use signal::{SigactionSyscall, SigreturnSyscall};
use thread::{CloneSyscall, KillSyscall};
use write::WriteSyscall;

/// Errno values returned to the guest, negated.
pub mod errno {
    pub const ESRCH: u64 = 3;
    pub const EINTR: u64 = 4;
    pub const EIO: u64 = 5;
    pub const EBADF: u64 = 9;
    pub const ENOMEM: u64 = 12;
    pub const EFAULT: u64 = 14;
    pub const EINVAL: u64 = 22;
    pub const ENOSYS: u64 = 38;

    pub fn neg(errno: u64) -> u64 {
        errno.wrapping_neg()
    }
}

/// What the scheduler does after a handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallAction {
    /// Release and reacquire the big lock, then write the value to `r0`.
    Return(u64),
    /// Perform the call with the big lock released, then write its result to `r0`.
    Block(BlockingCall),
    /// Give up the big lock to the next waiter, then continue with `r0 = 0`.
    Yield,
    /// Start the new thread `tid`, release the lock once and return its id to the caller.
    Spawned(ThreadId),
    /// The handler already set the registers. The lock is kept.
    Resume,
    /// End the calling thread.
    Exit(ExitReason),
}

/// Everything a handler may touch, borrowed from the locked engine.
pub struct SyscallContext<'a> {
    pub tid: ThreadId,
    pub(crate) core: &'a mut Core,
    pub(crate) mailboxes: &'a [Mailbox],
}

impl SyscallContext<'_> {
    pub fn arch(&mut self) -> Result<&mut ArchState, EngineError> {
        self.core.arch_mut(self.tid)
    }

    pub fn mem(&self) -> &GuestMemory {
        &self.core.mem
    }

    pub fn mem_mut(&mut self) -> &mut GuestMemory {
        &mut self.core.mem
    }
}

/// A system call of the guest.
pub trait Syscall: Send + Sync {
    /// Emulates the syscall. `args` are the values of `r1..=r5`.
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        code: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError>;
}

/// Creates the default syscall map.
#[must_use]
pub fn default_syscall_map() -> HashMap<SyscallCode, Arc<dyn Syscall>> {
    let mut syscall_map = HashMap::<SyscallCode, Arc<dyn Syscall>>::default();

    syscall_map.insert(SyscallCode::EXIT, Arc::new(ExitSyscall));

    syscall_map.insert(SyscallCode::EXIT_GROUP, Arc::new(ExitGroupSyscall));

    syscall_map.insert(SyscallCode::WRITE, Arc::new(WriteSyscall));

    syscall_map.insert(SyscallCode::NANOSLEEP, Arc::new(NanosleepSyscall));

    syscall_map.insert(SyscallCode::SCHED_YIELD, Arc::new(SchedYieldSyscall));

    syscall_map.insert(SyscallCode::GETTID, Arc::new(GettidSyscall));

    syscall_map.insert(SyscallCode::CLONE, Arc::new(CloneSyscall));

    syscall_map.insert(SyscallCode::KILL, Arc::new(KillSyscall));

    syscall_map.insert(SyscallCode::SIGACTION, Arc::new(SigactionSyscall));

    syscall_map.insert(SyscallCode::SIGRETURN, Arc::new(SigreturnSyscall));

    syscall_map.insert(SyscallCode::MMAP, Arc::new(MmapSyscall));

    syscall_map.insert(SyscallCode::MUNMAP, Arc::new(MunmapSyscall));

    syscall_map.insert(SyscallCode::MPROTECT, Arc::new(MprotectSyscall));

    syscall_map
}
