use std::time::Duration;

use super::{BlockingCall, Syscall, SyscallAction, SyscallCode, SyscallContext};
use crate::{error::EngineError, scheduler::threads::ExitReason};

pub(crate) struct ExitSyscall;

impl Syscall for ExitSyscall {
    fn emulate(
        &self,
        _: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        Ok(SyscallAction::Exit(ExitReason::Exit(args[0] as i32)))
    }
}

pub(crate) struct ExitGroupSyscall;

impl Syscall for ExitGroupSyscall {
    fn emulate(
        &self,
        _: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        Ok(SyscallAction::Exit(ExitReason::ExitGroup(args[0] as i32)))
    }
}

pub(crate) struct NanosleepSyscall;

impl Syscall for NanosleepSyscall {
    fn emulate(
        &self,
        _: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        Ok(SyscallAction::Block(BlockingCall::Sleep(
            Duration::from_nanos(args[0]),
        )))
    }
}

pub(crate) struct SchedYieldSyscall;

impl Syscall for SchedYieldSyscall {
    fn emulate(
        &self,
        _: &mut SyscallContext,
        _: SyscallCode,
        _: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        Ok(SyscallAction::Yield)
    }
}

pub(crate) struct GettidSyscall;

impl Syscall for GettidSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        _: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        Ok(SyscallAction::Return(ctx.tid as u64))
    }
}
