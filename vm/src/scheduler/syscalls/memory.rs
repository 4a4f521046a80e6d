use super::{errno, Syscall, SyscallAction, SyscallCode, SyscallContext};
use crate::{
    error::EngineError,
    guest::{memory::page_align_up, Perms, PAGE_SIZE},
};

fn prot_to_perms(prot: u64) -> Option<Perms> {
    u8::try_from(prot).ok().and_then(Perms::from_bits)
}

pub(crate) struct MmapSyscall;

impl Syscall for MmapSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        let [hint, len, prot, ..] = args;
        let (Some(perms), Some(len)) = (prot_to_perms(prot), page_align_up(len)) else {
            return Ok(SyscallAction::Return(errno::neg(errno::EINVAL)));
        };
        if len == 0 {
            return Ok(SyscallAction::Return(errno::neg(errno::EINVAL)));
        }
        if len > ctx.core.opts.max_map_len {
            return Ok(SyscallAction::Return(errno::neg(errno::ENOMEM)));
        }
        let mem = ctx.mem();
        let addr = if hint != 0 && hint % PAGE_SIZE == 0 && !mem.is_mapped(hint, 1) {
            mem.find_free(hint, len).filter(|&a| a == hint)
        } else {
            None
        };
        let base = ctx.core.opts.mmap_base;
        let Some(addr) = addr.or_else(|| ctx.mem().find_free(base, len)) else {
            return Ok(SyscallAction::Return(errno::neg(errno::ENOMEM)));
        };
        Ok(match ctx.mem_mut().map(addr, len, perms) {
            Ok(()) => SyscallAction::Return(addr),
            Err(_) => SyscallAction::Return(errno::neg(errno::ENOMEM)),
        })
    }
}

pub(crate) struct MunmapSyscall;

impl Syscall for MunmapSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        let [addr, len, ..] = args;
        if ctx.mem_mut().unmap(addr, len).is_err() {
            return Ok(SyscallAction::Return(errno::neg(errno::EINVAL)));
        }
        ctx.core.cache.discard(addr, len, "munmap");
        Ok(SyscallAction::Return(0))
    }
}

pub(crate) struct MprotectSyscall;

impl Syscall for MprotectSyscall {
    fn emulate(
        &self,
        ctx: &mut SyscallContext,
        _: SyscallCode,
        args: [u64; 5],
    ) -> Result<SyscallAction, EngineError> {
        let [addr, len, prot, ..] = args;
        let Some(perms) = prot_to_perms(prot) else {
            return Ok(SyscallAction::Return(errno::neg(errno::EINVAL)));
        };
        match ctx.mem_mut().protect(addr, len, perms) {
            Ok(old) => {
                if old.contains(Perms::EXEC) && !perms.contains(Perms::EXEC) {
                    ctx.core.cache.discard(addr, len, "mprotect");
                }
                Ok(SyscallAction::Return(0))
            }
            Err(_) => Ok(SyscallAction::Return(errno::neg(errno::ENOMEM))),
        }
    }
}
