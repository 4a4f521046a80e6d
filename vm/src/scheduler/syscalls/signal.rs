use super::{errno, Syscall, SyscallAction, SyscallCode, SyscallContext};
use crate::{
    error::EngineError,
    scheduler::signals::{self, SigAction, Signal},
};

pub(crate) struct SigactionSyscall;

impl Syscall for SigactionSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        let [signo, handler, ..] = args;
        let Some(sig) = Signal::from_raw(signo).filter(|s| s.catchable()) else {
            return Ok(SyscallAction::Return(errno::neg(errno::EINVAL)));
        };
        let slot = &mut ctx.core.sigactions[sig as usize];
        let old = std::mem::replace(slot, SigAction::from_raw(handler));
        Ok(SyscallAction::Return(old.to_raw()))
    }
}

pub(crate) struct SigreturnSyscall;

impl Syscall for SigreturnSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        _: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        let thread = ctx.core.thread_mut(ctx.tid)?;
        if signals::sigreturn(&mut thread.arch, &mut thread.sigframes) {
            Ok(SyscallAction::Resume)
        } else {
            Ok(SyscallAction::Return(errno::neg(errno::EINVAL)))
        }
    }
}
