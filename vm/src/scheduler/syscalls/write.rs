use super::{errno, BlockingCall, Syscall, SyscallAction, SyscallCode, SyscallContext};
use crate::{error::EngineError, guest::Perms};

/// Longer writes are truncated, as a short write.
const MAX_WRITE: u64 = 1 << 20;

pub(crate) struct WriteSyscall;

impl Syscall for WriteSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        let [fd, buf, len, ..] = args;
        if fd != 1 && fd != 2 {
            return Ok(SyscallAction::Return(errno::neg(errno::EBADF)));
        }
        let len = len.min(MAX_WRITE) as usize;
        Ok(match ctx.mem().read_vec(buf, len, Perms::READ) {
            Ok(bytes) => SyscallAction::Block(BlockingCall::Write { fd, bytes }),
            Err(_) => SyscallAction::Return(errno::neg(errno::EFAULT)),
        })
    }
}
