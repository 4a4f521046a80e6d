//! The scheduler: owns the big lock, multiplexes guest threads onto it and
//! drives each thread's dispatch loop.
//!
//! Every guest thread runs on its own native thread, but only the holder of
//! the big lock executes guest code or touches the translation cache and the
//! thread table. The lock is given up at three places only: at the end of a
//! quantum, around a blocking syscall, and on an explicit `sched_yield`.

pub mod biglock;
pub mod client_request;
pub mod mailbox;
mod runner;
pub mod signals;
pub(crate) mod state;
pub mod stats;
pub mod syscalls;
pub mod threads;

use std::{
    sync::{atomic::AtomicU64, Arc},
    thread::JoinHandle,
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::{
    error::EngineError,
    guest::{GuestMemory, GuestMemoryError, Perms, Program, SP},
    opts::EngineOpts,
    translate::{BlockTranslator, Translator},
};
use biglock::{BigLock, LockProbe};
use client_request::{default_client_requests, ClientRequest, ClientRequests};
use mailbox::Mailbox;
use signals::Signal;
use state::Core;
use stats::EngineStats;
use syscalls::{default_syscall_map, HostKernel, Kernel, Syscall, SyscallCode};
use threads::{ThreadId, ThreadStatus};

/// How the guest process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    /// The status as a shell would report it.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(sig) => 128 + sig as i32,
        }
    }
}

pub(crate) struct Shared {
    pub opts: EngineOpts,
    pub lock: BigLock<Core>,
    /// Indexed by thread id.
    pub mailboxes: Box<[Mailbox]>,
    pub kernel: Arc<dyn Kernel>,
    pub natives: Mutex<Vec<JoinHandle<()>>>,
    pub epoch: Arc<AtomicU64>,
    pub probe: Arc<LockProbe>,
}

pub struct EngineBuilder {
    opts: EngineOpts,
    translator: Option<Box<dyn Translator>>,
    kernel: Option<Arc<dyn Kernel>>,
    syscalls: HashMap<SyscallCode, Arc<dyn Syscall>>,
    requests: ClientRequests,
}

impl EngineBuilder {
    pub fn translator(mut self, translator: impl Translator + 'static) -> Self {
        self.translator = Some(Box::new(translator));
        self
    }

    pub fn kernel(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Replaces the handler for one syscall.
    pub fn syscall(mut self, code: SyscallCode, handler: Arc<dyn Syscall>) -> Self {
        self.syscalls.insert(code, handler);
        self
    }

    /// Registers a client request handler under `code`.
    pub fn client_request(mut self, code: u64, handler: impl ClientRequest + 'static) -> Self {
        self.requests.insert(code, Arc::new(handler));
        self
    }

    pub fn build(self) -> Engine {
        let opts = self.opts;
        let translator = self
            .translator
            .unwrap_or_else(|| Box::new(BlockTranslator::new()));
        let core = Core::new(opts, translator, self.syscalls, self.requests);
        let epoch = core.cache.epoch_probe();
        let lock = BigLock::new(core);
        let probe = lock.probe();
        let shared = Shared {
            opts,
            lock,
            mailboxes: (0..=opts.max_threads.max(1)).map(|_| Mailbox::new()).collect(),
            kernel: self
                .kernel
                .unwrap_or_else(|| Arc::new(HostKernel::stdio())),
            natives: Mutex::new(Vec::new()),
            epoch,
            probe,
        };
        Engine {
            shared: Arc::new(shared),
        }
    }
}

/// One guest process.
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn builder(opts: EngineOpts) -> EngineBuilder {
        EngineBuilder {
            opts,
            translator: None,
            kernel: None,
            syscalls: default_syscall_map(),
            requests: default_client_requests(),
        }
    }

    pub fn new(opts: EngineOpts) -> Self {
        Self::builder(opts).build()
    }

    pub fn opts(&self) -> &EngineOpts {
        &self.shared.opts
    }

    /// Loads `program`, maps the initial stack and runs the process to completion.
    #[instrument(skip_all, fields(entry = program.entry))]
    pub fn run(&self, program: &Program) -> Result<ExitStatus, EngineError> {
        let tid = {
            let mut core = self.shared.lock.lock();
            if core.threads.live_count() != 0 || core.exit_status.is_some() {
                return Err(EngineError::invariant("engine already ran a process"));
            }
            let opts = core.opts;
            program.load(&mut core.mem)?;
            let stack_base = opts
                .stack_top
                .checked_sub(opts.stack_size)
                .ok_or(GuestMemoryError::Overflow {
                    addr: opts.stack_top,
                    len: opts.stack_size,
                })?;
            core.mem.map(stack_base, opts.stack_size, Perms::RW)?;
            let tid = core.threads.alloc()?;
            let arch = core.arch_mut(tid)?;
            arch.ip = program.entry;
            arch.set_reg(SP, opts.stack_top);
            self.shared.mailboxes[tid as usize].reset();
            tid
        };
        runner::spawn_thread(&self.shared, tid)?;
        self.join_all();

        let mut core = self.shared.lock.lock();
        if let Some(err) = core.fatal.take() {
            error!("engine failed: {err}");
            return Err(err);
        }
        let status = core.exit_status.unwrap_or(ExitStatus::Exited(0));
        if core.opts.print_stats {
            info!("{:#?}", self.stats_locked(&core));
        }
        info!(?status, "guest process finished");
        Ok(status)
    }

    fn join_all(&self) {
        loop {
            let Some(handle) = self.shared.natives.lock().pop() else {
                break;
            };
            if handle.join().is_err() {
                let mut core = self.shared.lock.lock();
                core.fatal
                    .get_or_insert_with(|| EngineError::invariant("a guest thread panicked"));
            }
        }
    }

    /// Posts `sig` to guest thread `tid`. Returns `false` if no such slot exists.
    pub fn post_signal(&self, tid: ThreadId, sig: Signal) -> bool {
        match self.shared.mailboxes.get(tid as usize) {
            Some(mailbox) if tid != 0 => {
                mailbox.post_signal(sig);
                true
            }
            _ => false,
        }
    }

    fn stats_locked(&self, core: &Core) -> EngineStats {
        EngineStats {
            cache: core.cache.stats(),
            sched: core.stats,
        }
    }

    pub fn stats(&self) -> EngineStats {
        let core = self.shared.lock.lock();
        self.stats_locked(&core)
    }

    /// Ownership bookkeeping of the big lock, readable without taking it.
    pub fn lock_probe(&self) -> Arc<LockProbe> {
        Arc::clone(&self.shared.probe)
    }

    /// The translation cache's mutation counter, readable without the big lock.
    pub fn cache_epoch_probe(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.shared.epoch)
    }

    pub fn thread_status(&self, tid: ThreadId) -> Option<ThreadStatus> {
        self.shared.lock.lock().threads.status(tid)
    }

    /// Runs `f` on the guest address space, under the big lock.
    pub fn with_memory<R>(&self, f: impl FnOnce(&GuestMemory) -> R) -> R {
        f(&self.shared.lock.lock().mem)
    }

    /// Discards every translation intersecting `[addr, addr + len)`, for
    /// embedders that change guest code behind the engine's back.
    pub fn discard_translations(&self, addr: u64, len: u64, reason: &str) -> usize {
        self.shared.lock.lock().cache.discard(addr, len, reason)
    }
}

#[cfg(test)]
mod tests;
