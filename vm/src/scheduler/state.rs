//! The engine state guarded by the big lock.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use tracing::{error, warn};

use super::{
    biglock::LockProbe,
    client_request::ClientRequests,
    signals::{self, Delivery, SigAction, SigInfo, Signal, NSIG},
    stats::SchedStats,
    syscalls::{Syscall, SyscallCode},
    threads::{ExitReason, ThreadId, ThreadState, ThreadTable},
    ExitStatus,
};
use crate::{
    error::EngineError,
    guest::GuestMemory,
    host::{ArchState, HostAddr},
    opts::EngineOpts,
    translate::{TranslateError, TranslateRequest, Translator},
    transtab::{TransCache, TtePtr},
};

pub(crate) struct Core {
    pub opts: EngineOpts,
    pub cache: TransCache,
    pub mem: GuestMemory,
    pub threads: ThreadTable,
    pub translator: Box<dyn Translator>,
    pub sigactions: [SigAction; NSIG],
    pub syscalls: HashMap<SyscallCode, Arc<dyn Syscall>>,
    pub requests: ClientRequests,
    pub stats: SchedStats,
    /// Set by the first exit that decides the process status.
    pub exit_status: Option<ExitStatus>,
    /// The first fatal engine error; `Engine::run` returns it.
    pub fatal: Option<EngineError>,
    /// Guest addresses that already produced a translation diagnostic.
    pub warned_addrs: HashSet<u64>,
    pub warned_syscalls: HashSet<u64>,
    /// `stats.blocks_done` value at which the next housekeeping poll is due.
    pub next_poll: u64,
}

impl Core {
    pub fn new(
        opts: EngineOpts,
        translator: Box<dyn Translator>,
        syscalls: HashMap<SyscallCode, Arc<dyn Syscall>>,
        requests: ClientRequests,
    ) -> Self {
        Self {
            cache: TransCache::new(&opts),
            mem: GuestMemory::new(),
            threads: ThreadTable::new(opts.max_threads),
            translator,
            sigactions: [SigAction::Default; NSIG],
            syscalls,
            requests,
            stats: SchedStats::default(),
            exit_status: None,
            fatal: None,
            warned_addrs: HashSet::new(),
            warned_syscalls: HashSet::new(),
            next_poll: opts.poll_interval.max(1),
            opts,
        }
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut ThreadState, EngineError> {
        self.threads
            .get_mut(tid)
            .ok_or_else(|| EngineError::invariant(format!("no thread slot {tid}")))
    }

    pub fn arch_mut(&mut self, tid: ThreadId) -> Result<&mut ArchState, EngineError> {
        Ok(&mut self.thread_mut(tid)?.arch)
    }

    /// Translates `ip` and installs the result. A guest-caused failure comes
    /// back as the signal to deliver, after one diagnostic per address.
    pub fn translate(&mut self, ip: u64) -> Result<Result<TtePtr, SigInfo>, EngineError> {
        let req = TranslateRequest::new(ip, &self.opts);
        match self.translator.translate(&self.mem, &req) {
            Ok(t) => self.cache.insert(ip, t).map(Ok),
            Err(err) => {
                self.stats.translation_failures += 1;
                if self.warned_addrs.insert(ip) {
                    warn!(ip = format_args!("{ip:#x}"), "cannot translate: {err}");
                }
                Ok(Err(match err {
                    TranslateError::Fetch { source, .. } => SigInfo::from_memory(source),
                    TranslateError::Undecodable { addr, .. } => {
                        SigInfo::fault(Signal::SIGILL, addr)
                    }
                    TranslateError::Misaligned(addr) => SigInfo::fault(Signal::SIGBUS, addr),
                    TranslateError::AddressRange(addr) => SigInfo::fault(Signal::SIGSEGV, addr),
                }))
            }
        }
    }

    /// The checked entry for `ip`: fast cache, then the sectors, then the translator.
    pub fn entry_for(&mut self, ip: u64) -> Result<Result<HostAddr, SigInfo>, EngineError> {
        if let Some(host) = self
            .cache
            .lookup_fast(ip)
            .or_else(|| self.cache.lookup_full(ip))
        {
            return Ok(Ok(host));
        }
        let ptr = match self.translate(ip)? {
            Ok(ptr) => ptr,
            Err(info) => return Ok(Err(info)),
        };
        self.cache
            .entry_of(ptr)
            .map(Ok)
            .ok_or_else(|| EngineError::invariant(format!("fresh translation of {ip:#x} is dead")))
    }

    /// Delivers `info` to `tid`. Returns the exit reason when the signal is fatal.
    pub fn deliver(
        &mut self,
        tid: ThreadId,
        info: SigInfo,
    ) -> Result<Option<ExitReason>, EngineError> {
        let action = self.sigactions[info.signo as usize];
        self.stats.signals_delivered += 1;
        let thread = self.thread_mut(tid)?;
        match signals::deliver(action, &mut thread.arch, &mut thread.sigframes, info) {
            Delivery::Handler | Delivery::Ignored => Ok(None),
            Delivery::Fatal => {
                error!(
                    tid,
                    signal = %info.signo,
                    code = %info.code,
                    addr = format_args!("{:#x}", info.addr),
                    ip = format_args!("{:#x}", thread.arch.ip),
                    "fatal signal"
                );
                Ok(Some(ExitReason::FatalSignal(info.signo)))
            }
        }
    }

    /// Periodic housekeeping, run when the block counter passes `next_poll`.
    pub fn poll(&mut self, probe: &LockProbe) -> Result<(), EngineError> {
        self.stats.polls += 1;
        self.next_poll = self.stats.blocks_done + self.opts.poll_interval.max(1);
        if self.opts.sanity_level >= 1 && probe.max_holders() > 1 {
            return Err(EngineError::invariant(format!(
                "{} simultaneous big lock holders",
                probe.max_holders()
            )));
        }
        if self.opts.sanity_level >= 2 {
            self.cache.sanity_check().map_err(EngineError::InvariantFailed)?;
        }
        Ok(())
    }

    pub fn poll_due(&self) -> bool {
        self.stats.blocks_done >= self.next_poll
    }
}
