use std::{
    io,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use super::*;
use crate::{
    guest::{assemble, GuestMemory},
    logger::setup_logger,
    opts::SmcCheck,
    scheduler::{client_request::RequestContext, syscalls::errno},
    translate::{TranslateError, TranslateRequest, Translation},
};

fn engine_with(opts: EngineOpts) -> (Engine, Arc<HostKernel>) {
    setup_logger();
    let kernel = Arc::new(HostKernel::captured());
    let engine = Engine::builder(opts).kernel(kernel.clone()).build();
    (engine, kernel)
}

fn run_with(opts: EngineOpts, src: &str) -> ExitStatus {
    let (engine, _) = engine_with(opts);
    engine.run(&assemble(src).unwrap()).unwrap()
}

fn run(src: &str) -> ExitStatus {
    run_with(EngineOpts::test_opts(), src)
}

#[test]
fn write_then_exit_group() {
    let (engine, kernel) = engine_with(EngineOpts::test_opts());
    let prog = assemble(
        "
        _start: li r0, 3            # write(1, msg, 5)
                li r1, 1
                li r2, msg
                li r3, 5
                syscall
                mov r1, r0          # exit_group(bytes written)
                li r0, 2
                syscall
        msg:    .word 0x6f6c6c6568  # hello
        ",
    )
    .unwrap();
    let status = engine.run(&prog).unwrap();
    assert_eq!(status, ExitStatus::Exited(5));
    assert_eq!(status.code(), 5);
    assert_eq!(kernel.output(), b"hello");

    let stats = engine.stats();
    assert_eq!(stats.sched.syscalls, 2);
    assert_eq!(stats.sched.blocking_syscalls, 1);
    assert_eq!(stats.sched.threads_started, 1);
    assert_eq!(engine.thread_status(1), Some(ThreadStatus::Zombie));
    assert_eq!(engine.lock_probe().max_holders(), 1);
    assert!(engine.lock_probe().owner().is_none());
}

#[test]
fn last_thread_exit_sets_the_status() {
    assert_eq!(run("li r0, 1\nli r1, 9\nsyscall"), ExitStatus::Exited(9));
}

#[test]
fn unknown_syscall_returns_enosys() {
    let status = run(
        "
        li r0, 999
        syscall
        mov r1, r0
        li r0, 2
        syscall
        ",
    );
    assert_eq!(status, ExitStatus::Exited(-(errno::ENOSYS as i32)));
}

#[test]
fn write_rejects_bad_descriptors_and_addresses() {
    let status = run(
        "
        li r0, 3        # write(7, ...) -> -EBADF
        li r1, 7
        syscall
        mov r5, r0
        li r0, 3        # write(1, unmapped, 8) -> -EFAULT
        li r1, 1
        li r2, 0x70000000
        li r3, 8
        syscall
        add r1, r5, r0
        li r0, 2
        syscall
        ",
    );
    assert_eq!(
        status,
        ExitStatus::Exited(-((errno::EBADF + errno::EFAULT) as i32))
    );
}

const COUNTER: &str = "
_start: li r5, 4
spawn:  li r0, 7            # clone(worker, 0, 0)
        li r1, worker
        li r2, 0
        li r3, 0
        syscall
        addi r5, r5, -1
        bnez r5, spawn
wait:   li r0, 5            # sched_yield until every worker is done
        syscall
        li r1, done
        ld r2, 0(r1)
        li r3, 4
        sub r3, r3, r2
        bnez r3, wait
        li r1, counter
        ld r1, 0(r1)
        li r2, 1000
        divu r1, r1, r2
        li r0, 2
        syscall
worker: li r3, 1000
        li r4, counter
inc:    ld r2, 0(r4)        # one block: never preempted half way
        addi r2, r2, 1
        st r2, 0(r4)
        addi r3, r3, -1
        bnez r3, inc
        li r4, done
        ld r2, 0(r4)
        addi r2, r2, 1
        st r2, 0(r4)
        li r0, 1
        li r1, 0
        syscall
counter: .word 0
done:    .word 0
";

#[test]
fn threads_increment_under_the_big_lock() {
    let mut opts = EngineOpts::test_opts();
    opts.quantum = 50;
    let (engine, _) = engine_with(opts);
    let status = engine.run(&assemble(COUNTER).unwrap()).unwrap();
    assert_eq!(status, ExitStatus::Exited(4));

    let probe = engine.lock_probe();
    assert_eq!(probe.max_holders(), 1);
    assert_eq!(probe.holders(), 0);
    let stats = engine.stats();
    assert_eq!(stats.sched.threads_started, 5);
    assert!(stats.sched.yields > 0);
    assert!(stats.sched.polls > 0);
    for tid in 1..=5 {
        assert_eq!(engine.thread_status(tid), Some(ThreadStatus::Zombie));
    }
    assert_eq!(engine.thread_status(6), Some(ThreadStatus::Empty));
    assert_eq!(engine.thread_status(0), None);
}

#[test]
fn running_out_of_thread_slots_is_fatal() {
    let mut opts = EngineOpts::test_opts();
    opts.max_threads = 2;
    let (engine, _) = engine_with(opts);
    let prog = assemble(
        "
        _start: li r0, 7
                li r1, child
                syscall
                jmp _start
        child:  li r0, 5
                syscall
                jmp child
        ",
    )
    .unwrap();
    assert!(matches!(
        engine.run(&prog),
        Err(EngineError::ThreadSlotsExhausted(2))
    ));
    // The surviving child was told to exit as well.
    assert_eq!(engine.thread_status(2), Some(ThreadStatus::Zombie));
}

#[test]
fn engine_runs_one_process_only() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let prog = assemble("li r0, 2\nli r1, 0\nsyscall").unwrap();
    engine.run(&prog).unwrap();
    assert!(matches!(
        engine.run(&prog),
        Err(EngineError::InvariantFailed(_))
    ));
}

#[derive(Default)]
struct RecordingKernel {
    probe: Mutex<Option<Arc<LockProbe>>>,
    epoch: Mutex<Option<Arc<AtomicU64>>>,
    /// `(lock holders, held by caller, epoch moved)` per write.
    calls: Mutex<Vec<(usize, bool, bool)>>,
    /// Lock acquisitions so far, per write.
    acquisitions: Mutex<Vec<u64>>,
}

impl RecordingKernel {
    fn engine(self: &Arc<Self>) -> Engine {
        setup_logger();
        let engine = Engine::builder(EngineOpts::test_opts())
            .kernel(self.clone())
            .build();
        *self.probe.lock() = Some(engine.lock_probe());
        *self.epoch.lock() = Some(engine.cache_epoch_probe());
        engine
    }

    /// Acquisitions between consecutive writes.
    fn acquisition_gaps(&self) -> Vec<u64> {
        self.acquisitions
            .lock()
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect()
    }
}

impl Kernel for RecordingKernel {
    fn write(&self, _: u64, bytes: &[u8]) -> io::Result<usize> {
        let probe = self.probe.lock().clone().expect("probe installed");
        let epoch = self.epoch.lock().clone().expect("epoch installed");
        let before = epoch.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(5));
        let moved = epoch.load(Ordering::Acquire) != before;
        self.acquisitions.lock().push(probe.acquisitions());
        self.calls
            .lock()
            .push((probe.holders(), probe.held_by_current(), moved));
        Ok(bytes.len())
    }
}

#[test]
fn blocking_syscalls_run_without_the_lock() {
    let kernel = Arc::new(RecordingKernel::default());
    let engine = kernel.engine();
    let status = engine
        .run(
            &assemble(
                "
                _start: li r0, 3
                        li r1, 2
                        li r2, _start
                        li r3, 16
                        syscall
                        li r0, 3
                        syscall
                        li r0, 2
                        mov r1, r0
                        syscall
                ",
            )
            .unwrap(),
        )
        .unwrap();
    assert_eq!(status, ExitStatus::Exited(2));
    assert_eq!(*kernel.calls.lock(), vec![(0, false, false); 2]);
    // Back to back writes: the only acquisition in between ends the first one.
    assert_eq!(kernel.acquisition_gaps(), vec![1]);
    assert_eq!(engine.stats().sched.blocking_syscalls, 2);
}

#[test]
fn every_returning_syscall_releases_the_lock_once() {
    let kernel = Arc::new(RecordingKernel::default());
    let engine = kernel.engine();
    let prog = assemble(
        "
        _start: li r0, 3            # write(2, _start, 8)
                li r1, 2
                li r2, _start
                li r3, 8
                syscall
                li r0, 6            # gettid
                syscall
                li r0, 99           # unknown: -ENOSYS
                syscall
                li r0, 11           # mmap(0, 4096, RW)
                li r1, 0
                li r2, 4096
                li r3, 3
                syscall
                li r0, 3
                li r1, 2
                li r2, _start
                li r3, 8
                syscall
                li r0, 2
                li r1, 0
                syscall
        ",
    )
    .unwrap();
    assert_eq!(engine.run(&prog).unwrap(), ExitStatus::Exited(0));
    // One to finish the first write, one each for gettid, the unknown call and mmap.
    assert_eq!(kernel.acquisition_gaps(), vec![4]);
    assert_eq!(*kernel.calls.lock(), vec![(0, false, false); 2]);
    let stats = engine.stats();
    assert_eq!(stats.sched.syscalls, 6);
    assert_eq!(stats.sched.blocking_syscalls, 2);
}

fn smc_program(icinv: bool) -> String {
    let flush = if icinv {
        "li r3, func\n li r4, 16\n icinv r3, r4"
    } else {
        ""
    };
    format!(
        "
        _start: li r6, 0
        run:    call func
                addi r6, r6, 1
                li r2, 2
                sub r2, r2, r6
                beqz r2, out
                li r3, patch        # copy `li r1, 3` over the first word of func
                ld r4, 0(r3)
                li r3, func
                st r4, 0(r3)
                {flush}
                jmp run
        out:    li r0, 2
                syscall
        func:   li r1, 2
                ret
        patch:  li r1, 3
        "
    )
}

#[test]
fn unchecked_code_runs_stale_after_modification() {
    assert_eq!(run(&smc_program(false)), ExitStatus::Exited(2));
}

#[test]
fn smc_guard_retranslates_modified_code() {
    let mut opts = EngineOpts::test_opts();
    opts.smc_check = SmcCheck::All;
    let (engine, _) = engine_with(opts);
    let status = engine.run(&assemble(&smc_program(false)).unwrap()).unwrap();
    assert_eq!(status, ExitStatus::Exited(3));
    assert!(engine.stats().cache.discards >= 1);
}

#[test]
fn icinv_discards_modified_code() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let status = engine.run(&assemble(&smc_program(true)).unwrap()).unwrap();
    assert_eq!(status, ExitStatus::Exited(3));
    assert!(engine.stats().cache.discards >= 1);
}

#[test]
fn segv_handler_runs() {
    let status = run(
        "
        _start: li r0, 9            # sigaction(SIGSEGV, handler)
                li r1, 11
                li r2, handler
                syscall
                li r3, 0x70000000
                ld r4, 0(r3)
                li r0, 2
                li r1, 0
                syscall
        handler: li r5, 0x70000000  # r1 = signo, r2 = fault address
                sub r5, r5, r2
                bnez r5, wrong
                li r0, 2
                addi r1, r1, 100
                syscall
        wrong:  li r0, 2
                li r1, 1
                syscall
        ",
    );
    assert_eq!(status, ExitStatus::Exited(111));
}

#[test]
fn unhandled_faults_terminate() {
    let segv = run("li r1, 0x70000000\nld r2, 0(r1)");
    assert_eq!(segv, ExitStatus::Signaled(Signal::SIGSEGV));
    assert_eq!(segv.code(), 139);

    let fpe = run("li r1, 1\ndivu r1, r1, r2");
    assert_eq!(fpe, ExitStatus::Signaled(Signal::SIGFPE));

    let ill = run("jmp bad\nbad: .word 0");
    assert_eq!(ill, ExitStatus::Signaled(Signal::SIGILL));

    let trap = run("trap");
    assert_eq!(trap, ExitStatus::Signaled(Signal::SIGTRAP));
}

#[test]
fn fault_inside_its_own_handler_is_fatal() {
    let status = run(
        "
        _start: li r0, 9
                li r1, 11
                li r2, handler
                syscall
                ld r1, 0(r0)
        handler: ld r1, 0(r0)
        ",
    );
    assert_eq!(status, ExitStatus::Signaled(Signal::SIGSEGV));
}

#[test]
fn trap_handler_returns_with_sigreturn() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let prog = assemble(
        "
        _start: li r0, 9            # sigaction(SIGTRAP, handler)
                li r1, 5
                li r2, handler
                syscall
                li r6, 40
                trap
                addi r1, r6, 2
                li r0, 2
                syscall
        handler: li r6, 0           # clobbered here, restored by sigreturn
                li r0, 10
                syscall
        ",
    )
    .unwrap();
    assert_eq!(engine.run(&prog).unwrap(), ExitStatus::Exited(42));
    assert_eq!(engine.stats().sched.signals_delivered, 1);
}

fn kill_self(action: u64) -> String {
    format!(
        "
        li r0, 9        # sigaction(SIGUSR1, {action})
        li r1, 10
        li r2, {action}
        syscall
        li r0, 6
        syscall
        mov r1, r0      # kill(gettid(), SIGUSR1)
        li r2, 10
        li r0, 8
        syscall
        li r0, 2
        li r1, 0
        syscall
        "
    )
}

#[test]
fn kill_follows_the_installed_action() {
    assert_eq!(run(&kill_self(0)), ExitStatus::Signaled(Signal::SIGUSR1));
    assert_eq!(run(&kill_self(1)), ExitStatus::Exited(0));
}

#[test]
fn kill_validates_its_arguments() {
    let status = run(
        "
        li r0, 8        # kill(5, SIGUSR1): no such thread
        li r1, 5
        li r2, 10
        syscall
        mov r5, r0
        li r0, 8        # kill(1, 0): probe only
        li r1, 1
        li r2, 0
        syscall
        add r5, r5, r0
        li r0, 9        # sigaction(SIGKILL, ...) is refused
        li r1, 9
        li r2, 1
        syscall
        add r1, r5, r0
        li r0, 2
        syscall
        ",
    );
    assert_eq!(
        status,
        ExitStatus::Exited(-((errno::ESRCH + errno::EINVAL) as i32))
    );
}

const SLEEPER: &str = "
_start: li r0, 9                # sigaction(SIGUSR1, handler)
        li r1, 10
        li r2, handler
        syscall
        li r0, 4                # nanosleep(2s)
        li r1, 2000000000
        syscall
        li r3, flag             # -EINTR + handler ran + 45
        ld r3, 0(r3)
        add r1, r0, r3
        addi r1, r1, 45
        li r0, 2
        syscall
handler: li r4, flag
        li r5, 1
        st r5, 0(r4)
        li r0, 10
        syscall
flag:   .word 0
";

#[test]
fn posted_signal_interrupts_nanosleep() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let prog = assemble(SLEEPER).unwrap();
    let status = thread::scope(|s| {
        let guest = s.spawn(|| engine.run(&prog));
        let deadline = Instant::now() + Duration::from_secs(10);
        // sigaction also passes through WaitSys; wait for the sleep itself.
        while engine.stats().sched.blocking_syscalls == 0
            || engine.thread_status(1) != Some(ThreadStatus::WaitSys)
        {
            assert!(Instant::now() < deadline, "guest never went to sleep");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(engine.post_signal(1, Signal::SIGUSR1));
        guest.join().unwrap()
    });
    assert_eq!(status.unwrap(), ExitStatus::Exited(42));
    assert!(!engine.post_signal(0, Signal::SIGUSR1));
}

fn double(_: &mut RequestContext, args: [u64; 5]) -> u64 {
    args[0] * 2
}

#[test]
fn client_requests() {
    setup_logger();
    let engine = Engine::builder(EngineOpts::test_opts())
        .kernel(Arc::new(HostKernel::captured()))
        .client_request(0x2000, double)
        .build();
    let prog = assemble(
        "
        li r7, 0x5348554e
        li r1, 0x1001       # running on the engine: 1
        li r0, 0
        creq
        mov r5, r0
        li r1, 0x7777       # unknown: r0 untouched
        li r0, 10
        creq
        add r5, r5, r0
        li r7, 0            # no magic: r0 untouched
        li r1, 0x1001
        li r0, 20
        creq
        add r5, r5, r0
        li r7, 0x5348554e
        li r1, 0x2000       # double(5)
        li r2, 5
        creq
        add r5, r5, r0
        li r1, 0x1003       # blocks done so far, at least one
        creq
        li r4, 0
        sltu r6, r4, r0
        add r1, r5, r6
        li r0, 2
        syscall
        ",
    )
    .unwrap();
    assert_eq!(engine.run(&prog).unwrap(), ExitStatus::Exited(42));
    assert_eq!(engine.stats().sched.client_requests, 5);
}

#[test]
fn print_request_bounds_its_length() {
    let status = run(
        "
        _start: li r7, 0x5348554e
                li r1, 0x1004       # print(_start, 8) -> 8
                li r2, _start
                li r3, 8
                creq
                mov r5, r0
                li r3, -1           # print(_start, u64::MAX) -> -EFAULT
                creq
                add r1, r5, r0
                li r0, 2
                syscall
        ",
    );
    assert_eq!(status, ExitStatus::Exited(8 - errno::EFAULT as i32));
}

#[test]
fn discard_request_drops_translations() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let prog = assemble(
        "
        _start: li r7, 0x5348554e
                li r1, 0x1002       # discard [_start, +4096)
                li r2, _start
                li r3, 4096
                creq
                mov r1, r0
                li r0, 2
                syscall
        ",
    )
    .unwrap();
    assert_eq!(engine.run(&prog).unwrap(), ExitStatus::Exited(1));
    assert_eq!(engine.stats().cache.discards, 1);
}

#[test]
fn embedder_discards_translations() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let prog = assemble("li r1, 0\nli r0, 2\nsyscall").unwrap();
    assert_eq!(engine.run(&prog).unwrap(), ExitStatus::Exited(0));
    assert_eq!(engine.stats().cache.live_records, 1);

    let len = prog.image.len() as u64;
    assert_eq!(engine.discard_translations(prog.base, len, "embedder"), 1);
    assert_eq!(engine.stats().cache.live_records, 0);
    assert_eq!(engine.discard_translations(prog.base, len, "embedder"), 0);
}

#[test]
fn mmap_gives_fresh_memory() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let prog = assemble(
        "
        li r0, 11           # mmap(0, 4096, RW)
        li r1, 0
        li r2, 4096
        li r3, 3
        syscall
        mov r4, r0
        li r5, 42
        st r5, 8(r4)
        ld r1, 8(r4)
        li r0, 2
        syscall
        ",
    )
    .unwrap();
    assert_eq!(engine.run(&prog).unwrap(), ExitStatus::Exited(42));
    let base = engine.opts().mmap_base;
    assert_eq!(
        engine.with_memory(|mem: &GuestMemory| mem.perms(base)),
        Some(Perms::RW)
    );
}

#[test]
fn munmap_discards_code_in_the_range() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let prog = assemble(
        "
        _start: li r0, 11           # mmap(0x20000, 4096, RWX)
                li r1, 0x20000
                li r2, 4096
                li r3, 7
                syscall
                li r4, stub         # copy `jmp back` into the new page and run it there
                ld r5, 0(r4)
                st r5, 0(r0)
                jr r0
        back:   li r0, 12           # munmap(0x20000, 4096)
                li r1, 0x20000
                li r2, 4096
                syscall
                li r0, 2
                mov r1, r0
                syscall
        stub:   jmp back
        ",
    )
    .unwrap();
    assert_eq!(engine.run(&prog).unwrap(), ExitStatus::Exited(2));
    assert!(engine.stats().cache.discards >= 1);
    assert!(engine.with_memory(|mem| !mem.is_mapped(0x20000, 1)));
}

#[test]
fn huge_mappings_are_refused_and_huge_unmaps_are_cheap() {
    let (engine, _) = engine_with(EngineOpts::test_opts());
    let prog = assemble(
        "
        li r6, 1
        li r4, 40
        shl r6, r6, r4      # 1 << 40
        li r0, 11           # mmap(0, 1 << 40, RW) -> -ENOMEM
        li r1, 0
        mov r2, r6
        li r3, 3
        syscall
        mov r5, r0
        li r0, 12           # munmap(0x20000, 1 << 40) -> 0
        li r1, 0x20000
        mov r2, r6
        syscall
        add r1, r5, r0
        li r0, 2
        syscall
        ",
    )
    .unwrap();
    let start = Instant::now();
    let status = engine.run(&prog).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(status, ExitStatus::Exited(-(errno::ENOMEM as i32)));
    let base = engine.opts().mmap_base;
    assert!(engine.with_memory(|mem| !mem.is_mapped(base, 1)));
}

/// Counts calls into the default translator.
struct CountingTranslator {
    calls: Arc<AtomicUsize>,
}

impl Translator for CountingTranslator {
    fn translate(
        &mut self,
        mem: &GuestMemory,
        req: &TranslateRequest,
    ) -> Result<Translation, TranslateError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        BlockTranslator::new().translate(mem, req)
    }
}

#[test]
fn each_block_is_translated_once() {
    for chaining in [true, false] {
        let mut opts = EngineOpts::test_opts();
        opts.quantum = 7;
        opts.chaining = chaining;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = Engine::builder(opts)
            .translator(CountingTranslator {
                calls: calls.clone(),
            })
            .kernel(Arc::new(HostKernel::captured()))
            .build();
        let prog = assemble(
            "
            _start: li r1, 50
            loop:   addi r1, r1, -1
                    bnez r1, loop
                    li r0, 2
                    syscall
            ",
        )
        .unwrap();
        assert_eq!(engine.run(&prog).unwrap(), ExitStatus::Exited(0));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        let stats = engine.stats();
        assert_eq!(stats.cache.translations, 3);
        assert!(stats.sched.yields > 0);
        assert_eq!(stats.cache.chains > 0, chaining);
    }
}
