//! The per-thread dispatch loop.

use std::{array, sync::Arc, thread};

use tracing::{debug, error, instrument, warn};

use super::{
    biglock::{current_lwp, BigLockGuard},
    client_request,
    signals::{SigInfo, Signal},
    state::Core,
    syscalls::{errno, SyscallAction, SyscallCode, SyscallContext},
    threads::{ExitReason, ThreadId, ThreadStatus},
    ExitStatus, Shared,
};
use crate::{
    dispatch::{run_translations, Outcome, TraceCode},
    error::EngineError,
    host::HostAddr,
    scheduler::mailbox::Mailbox,
};

type Guard<'a> = BigLockGuard<'a, Core>;

/// Starts guest thread `tid`, which must be in `Init`, on a new native thread.
pub(crate) fn spawn_thread(shared: &Arc<Shared>, tid: ThreadId) -> Result<(), EngineError> {
    let worker = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("shunt-{tid}"))
        .spawn(move || thread_main(&worker, tid))
        .map_err(EngineError::ThreadSpawn)?;
    shared.natives.lock().push(handle);
    Ok(())
}

#[instrument(skip(shared), level = "debug")]
fn thread_main(shared: &Arc<Shared>, tid: ThreadId) {
    let mut guard = shared.lock.lock();
    let reason = match start(&mut guard, tid).and_then(|()| run_thread(shared, &mut guard, tid)) {
        Ok(reason) => reason,
        Err(err) => {
            error!(tid, "{err}");
            guard.fatal.get_or_insert(err);
            ExitReason::Fatal
        }
    };
    if let Err(err) = finish(shared, &mut guard, tid, reason) {
        error!(tid, "{err}");
        guard.fatal.get_or_insert(err);
        broadcast_exit(shared, &guard, tid, ExitReason::Fatal);
    }
}

fn start(core: &mut Core, tid: ThreadId) -> Result<(), EngineError> {
    core.threads.set_status(tid, ThreadStatus::Runnable)?;
    core.thread_mut(tid)?.lwp = Some(current_lwp());
    core.stats.threads_started += 1;
    debug!(tid, lwp = current_lwp(), "thread started");
    Ok(())
}

/// Records the exit of `tid` and, for a group exit, asks every other thread to follow.
fn finish(
    shared: &Shared,
    guard: &mut Guard<'_>,
    tid: ThreadId,
    reason: ExitReason,
) -> Result<(), EngineError> {
    let thread = guard.thread_mut(tid)?;
    thread.exit_reason = Some(reason);
    thread.lwp = None;
    thread.sigframes.clear();
    guard.threads.set_status(tid, ThreadStatus::Zombie)?;
    let status = match reason {
        ExitReason::Exit(code) if guard.threads.live_count() == 0 => Some(ExitStatus::Exited(code)),
        ExitReason::Exit(_) | ExitReason::Fatal => None,
        ExitReason::ExitGroup(code) => Some(ExitStatus::Exited(code)),
        ExitReason::FatalSignal(sig) => Some(ExitStatus::Signaled(sig)),
    };
    if let Some(status) = status {
        guard.exit_status.get_or_insert(status);
    }
    if reason.is_group() {
        broadcast_exit(shared, guard, tid, reason);
    }
    debug!(tid, ?reason, "thread exited");
    Ok(())
}

fn broadcast_exit(shared: &Shared, core: &Core, from: ThreadId, reason: ExitReason) {
    for thread in core.threads.iter() {
        if thread.tid != from && thread.status.is_live() {
            shared.mailboxes[thread.tid as usize].request_exit(reason);
        }
    }
}

fn run_thread(
    shared: &Arc<Shared>,
    guard: &mut Guard<'_>,
    tid: ThreadId,
) -> Result<ExitReason, EngineError> {
    let mailbox = &shared.mailboxes[tid as usize];
    let quantum = shared.opts.quantum.max(1);
    guard.arch_mut(tid)?.evc_counter = quantum;
    loop {
        if let Some(reason) = mailbox.exit_request() {
            return Ok(reason);
        }
        while let Some(sig) = mailbox.take_signal() {
            if let Some(reason) = guard.deliver(tid, SigInfo::user(sig))? {
                return Ok(reason);
            }
        }

        if guard.arch_mut(tid)?.evc_counter == 0 {
            yield_lock(guard, tid)?;
            if guard.poll_due() {
                guard.poll(&shared.probe)?;
            }
            guard.arch_mut(tid)?.evc_counter = quantum;
            continue;
        }

        let ip = guard.arch_mut(tid)?.ip;
        let entry = match guard.entry_for(ip)? {
            Ok(entry) => entry,
            Err(info) => match guard.deliver(tid, info)? {
                Some(reason) => return Ok(reason),
                None => continue,
            },
        };
        let outcome = dispatch(guard, mailbox, tid, entry)?;
        if guard.poll_due() {
            guard.poll(&shared.probe)?;
        }
        if let Some(reason) = handle_outcome(shared, guard, tid, outcome)? {
            return Ok(reason);
        }
    }
}

/// Runs translated code and reconciles the budget it used.
fn dispatch(
    core: &mut Core,
    mailbox: &Mailbox,
    tid: ThreadId,
    entry: HostAddr,
) -> Result<Outcome, EngineError> {
    let Core {
        cache,
        mem,
        threads,
        stats,
        ..
    } = core;
    let thread = threads
        .get_mut(tid)
        .ok_or_else(|| EngineError::invariant(format!("no thread slot {tid}")))?;
    let before = thread.arch.evc_counter;
    let outcome = run_translations(cache, mem, &mut thread.arch, mailbox, entry);
    let after = thread.arch.evc_counter;
    let done = before.checked_sub(after).ok_or_else(|| {
        EngineError::invariant(format!("block budget grew from {before} to {after}"))
    })?;
    thread.blocks_done += done;
    stats.blocks_done += done;
    stats.dispatches += 1;
    Ok(outcome)
}

fn handle_outcome(
    shared: &Arc<Shared>,
    guard: &mut Guard<'_>,
    tid: ThreadId,
    outcome: Outcome,
) -> Result<Option<ExitReason>, EngineError> {
    let (trc, addr) = match outcome {
        Outcome::Interrupted(info) => return guard.deliver(tid, info),
        Outcome::Completed { trc, addr } => (trc, addr),
    };
    match trc {
        TraceCode::Boring | TraceCode::CacheMiss | TraceCode::EventCheck => Ok(None),
        TraceCode::ChainMeSlow | TraceCode::ChainMeFast => chain_me(guard, tid, addr),
        TraceCode::Syscall => syscall(shared, guard, tid),
        TraceCode::ClientRequest => {
            guard.stats.client_requests += 1;
            client_request::service(guard, tid)?;
            Ok(None)
        }
        TraceCode::InvalidateICache => {
            let arch = guard.arch_mut(tid)?;
            let (start, len) = (arch.cmstart, arch.cmlen);
            let reason = if addr != 0 {
                "smc-check"
            } else {
                "icache-invalidate"
            };
            guard.cache.discard(start, len, reason);
            Ok(None)
        }
        TraceCode::SigTrap => {
            let ip = guard.arch_mut(tid)?.ip;
            guard.deliver(tid, SigInfo::fault(Signal::SIGTRAP, ip))
        }
        TraceCode::InvariantFailed => {
            let at = HostAddr::from_word(addr)
                .map_or_else(|| format!("{addr:#x}"), |a| a.to_string());
            Err(EngineError::invariant(format!("translated code failed at {at}")))
        }
    }
}

/// Resolves a chain-me exit: finds or translates the target and patches the site.
fn chain_me(core: &mut Core, tid: ThreadId, addr: u64) -> Result<Option<ExitReason>, EngineError> {
    core.stats.chain_requests += 1;
    let site = HostAddr::from_word(addr)
        .and_then(|host| core.cache.site_at(host))
        .ok_or_else(|| EngineError::invariant(format!("chain-me exit {addr:#x} names no site")))?;
    let (target, _) = core
        .cache
        .site_target(site)
        .ok_or_else(|| EngineError::invariant(format!("chain-me exit {addr:#x} is stale")))?;
    let to = match core.cache.find(target) {
        Some(ptr) => ptr,
        None => match core.translate(target)? {
            Ok(ptr) => ptr,
            Err(info) => return core.deliver(tid, info),
        },
    };
    // Translating the target may have recycled the site's sector; chain skips stale sites.
    core.cache.chain(site, to)?;
    Ok(None)
}

fn syscall(
    shared: &Arc<Shared>,
    guard: &mut Guard<'_>,
    tid: ThreadId,
) -> Result<Option<ExitReason>, EngineError> {
    guard.stats.syscalls += 1;
    let arch = guard.arch_mut(tid)?;
    let nr = arch.reg(0);
    let args: [u64; 5] = array::from_fn(|i| arch.reg(1 + i as u8));
    let handler = SyscallCode::from_raw(nr)
        .and_then(|code| Some((code, Arc::clone(guard.syscalls.get(&code)?))));
    let action = match handler {
        Some((code, handler)) => {
            let mut ctx = SyscallContext {
                tid,
                core: &mut **guard,
                mailboxes: &shared.mailboxes,
            };
            handler.emulate(&mut ctx, code, args)?
        }
        None => {
            if guard.warned_syscalls.insert(nr) {
                warn!(tid, nr, "unhandled syscall");
            }
            SyscallAction::Return(errno::neg(errno::ENOSYS))
        }
    };

    // Every call that returns to the guest gives up the lock exactly once.
    let result = match action {
        SyscallAction::Return(value) => {
            wait_sys(guard, tid, || ())?;
            value
        }
        SyscallAction::Resume => return Ok(None),
        SyscallAction::Exit(reason) => return Ok(Some(reason)),
        SyscallAction::Block(call) => {
            let mailbox = &shared.mailboxes[tid as usize];
            let kernel = &*shared.kernel;
            guard.stats.blocking_syscalls += 1;
            wait_sys(guard, tid, || call.perform(kernel, mailbox))?
        }
        SyscallAction::Yield => {
            yield_lock(guard, tid)?;
            0
        }
        SyscallAction::Spawned(child) => {
            if let Err(err) = spawn_thread(shared, child) {
                guard.threads.set_status(child, ThreadStatus::Zombie)?;
                return Err(err);
            }
            wait_sys(guard, tid, || ())?;
            child as u64
        }
    };
    guard.arch_mut(tid)?.set_reg(0, result);
    Ok(None)
}

/// Runs `f` in `WaitSys` with the big lock released.
fn wait_sys<R>(
    guard: &mut Guard<'_>,
    tid: ThreadId,
    f: impl FnOnce() -> R,
) -> Result<R, EngineError> {
    guard.threads.set_status(tid, ThreadStatus::WaitSys)?;
    let out = guard.release_while(f);
    guard.threads.set_status(tid, ThreadStatus::Runnable)?;
    Ok(out)
}

fn yield_lock(guard: &mut Guard<'_>, tid: ThreadId) -> Result<(), EngineError> {
    guard.threads.set_status(tid, ThreadStatus::Yielding)?;
    guard.stats.yields += 1;
    guard.yield_while(thread::yield_now);
    guard.threads.set_status(tid, ThreadStatus::Runnable)
}
