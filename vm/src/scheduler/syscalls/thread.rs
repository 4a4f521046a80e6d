use tracing::debug;

use super::{errno, Syscall, SyscallAction, SyscallCode, SyscallContext};
use crate::{
    error::EngineError,
    guest::SP,
    scheduler::{signals::Signal, threads::ThreadId},
};

pub(crate) struct CloneSyscall;

impl Syscall for CloneSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        let [entry, sp, arg, ..] = args;
        // Running out of slots is fatal for the whole process.
        let child = ctx.core.threads.alloc()?;
        let arch = ctx.core.arch_mut(child)?;
        arch.ip = entry;
        arch.set_reg(SP, sp);
        arch.set_reg(1, arg);
        ctx.mailboxes[child as usize].reset();
        debug!(parent = ctx.tid, child, entry = format_args!("{entry:#x}"), "clone");
        Ok(SyscallAction::Spawned(child))
    }
}

pub(crate) struct KillSyscall;

impl Syscall for KillSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        let [tid, signo, ..] = args;
        let target = ThreadId::try_from(tid)
            .ok()
            .filter(|&t| ctx.core.threads.status(t).is_some_and(|s| s.is_live()));
        let Some(target) = target else {
            return Ok(SyscallAction::Return(errno::neg(errno::ESRCH)));
        };
        if signo == 0 {
            return Ok(SyscallAction::Return(0));
        }
        let Some(sig) = Signal::from_raw(signo) else {
            return Ok(SyscallAction::Return(errno::neg(errno::EINVAL)));
        };
        ctx.mailboxes[target as usize].post_signal(sig);
        Ok(SyscallAction::Return(0))
    }
}
