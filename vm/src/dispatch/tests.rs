use super::*;
use crate::{
    guest::{assemble, Instruction, Opcode},
    host::insn::FAST_ENTRY_OFFSET,
    opts::{EngineOpts, SmcCheck},
    scheduler::{signals::SigCode, threads::ExitReason},
    translate::{BlockTranslator, TranslateRequest, Translator},
    transtab::TtePtr,
};

/// Just enough of a scheduler to drive the dispatcher.
struct Rig {
    cache: TransCache,
    mem: GuestMemory,
    arch: ArchState,
    mailbox: Mailbox,
    opts: EngineOpts,
    entry: u64,
    dispatches: u32,
}

impl Rig {
    fn new(src: &str, opts: EngineOpts) -> Self {
        let prog = assemble(src).unwrap();
        let mut mem = GuestMemory::new();
        prog.load(&mut mem).unwrap();
        let mut arch = ArchState::default();
        arch.ip = prog.entry;
        arch.evc_counter = 1000;
        Self {
            cache: TransCache::new(&opts),
            mem,
            arch,
            mailbox: Mailbox::new(),
            opts,
            entry: prog.entry,
            dispatches: 0,
        }
    }

    fn translate(&mut self, ip: u64) -> TtePtr {
        let req = TranslateRequest::new(ip, &self.opts);
        let t = BlockTranslator.translate(&self.mem, &req).unwrap();
        self.cache.insert(ip, t).unwrap()
    }

    fn run_once(&mut self) -> Outcome {
        let ip = self.arch.ip;
        let entry = match self
            .cache
            .lookup_fast(ip)
            .or_else(|| self.cache.lookup_full(ip))
        {
            Some(entry) => entry,
            None => {
                let ptr = self.translate(ip);
                self.cache.entry_of(ptr).unwrap()
            }
        };
        self.dispatches += 1;
        run_translations(&self.cache, &mut self.mem, &mut self.arch, &self.mailbox, entry)
    }

    /// Dispatches until something other than a miss or a chain request comes back.
    fn drive(&mut self) -> (TraceCode, u64) {
        loop {
            match self.run_once() {
                Outcome::Completed {
                    trc: TraceCode::ChainMeSlow | TraceCode::ChainMeFast,
                    addr,
                } => {
                    let site = self
                        .cache
                        .site_at(HostAddr::from_word(addr).unwrap())
                        .unwrap();
                    let (target, _) = self.cache.site_target(site).unwrap();
                    let to = match self.cache.find(target) {
                        Some(ptr) => ptr,
                        None => self.translate(target),
                    };
                    assert!(self.cache.chain(site, to).unwrap());
                }
                Outcome::Completed {
                    trc: TraceCode::CacheMiss | TraceCode::Boring,
                    ..
                } => {}
                Outcome::Completed { trc, addr } => return (trc, addr),
                Outcome::Interrupted(info) => panic!("unexpected {info:?}"),
            }
        }
    }
}

const COUNTDOWN: &str = "
    _start: li r1, 5
    loop:   addi r1, r1, -1
            bnez r1, loop
            trap
";

#[test]
fn chained_loop_stays_in_translated_code() {
    let mut rig = Rig::new(COUNTDOWN, EngineOpts::test_opts());
    assert_eq!(rig.drive(), (TraceCode::SigTrap, 0));
    assert_eq!(rig.arch.regs[1], 0);
    assert_eq!(rig.arch.ip, rig.entry + 32);

    // Entry block, loop body twice (once to chain itself), then the trap block.
    assert_eq!(rig.dispatches, 4);
    let stats = rig.cache.stats();
    assert_eq!(stats.chains, 3);
    assert_eq!(stats.translations, 3);
    // Every checked entry took one unit of budget; the chained iterations included.
    assert_eq!(rig.arch.evc_counter, 1000 - 6);
    rig.cache.sanity_check().unwrap();

    // A second run of the loop body never leaves the cache.
    rig.arch.regs[1] = 3;
    rig.arch.ip = rig.entry + 8;
    rig.dispatches = 0;
    assert_eq!(rig.drive(), (TraceCode::SigTrap, 0));
    assert_eq!(rig.dispatches, 1);
}

#[test]
fn budget_exhaustion_exits_at_the_event_check() {
    let mut rig = Rig::new("loop: jmp loop", EngineOpts::test_opts());
    rig.arch.evc_counter = 10;
    assert_eq!(rig.drive(), (TraceCode::EventCheck, 0));
    assert_eq!(rig.arch.evc_counter, 0);
    assert_eq!(rig.arch.ip, rig.entry);
    assert_eq!(rig.cache.stats().chains, 1);

    // With no budget left the block does not run at all.
    assert_eq!(
        rig.run_once(),
        Outcome::Completed {
            trc: TraceCode::EventCheck,
            addr: 0
        }
    );
}

#[test]
fn fast_entry_skips_the_budget() {
    let mut opts = EngineOpts::test_opts();
    opts.fast_entry = true;
    let mut rig = Rig::new("jmp next\nnext: trap", opts);
    assert_eq!(rig.drive(), (TraceCode::SigTrap, 0));
    let before = rig.arch.evc_counter;
    rig.arch.ip = rig.entry;
    assert_eq!(rig.drive(), (TraceCode::SigTrap, 0));
    // The forward chain lands past the target's event check.
    assert_eq!(rig.arch.evc_counter, before - 1);

    let to = rig.cache.find(rig.entry + 8).unwrap();
    let from = rig.cache.entry_of(rig.cache.find(rig.entry).unwrap()).unwrap();
    assert_eq!(
        rig.cache.code_word(from.add(3)).map(HostInsn::decode),
        Some(Ok(HostInsn::Jump(rig.cache.entry_of(to).unwrap().add(FAST_ENTRY_OFFSET))))
    );
}

#[test]
fn division_by_zero_raises_sigfpe() {
    let mut rig = Rig::new(
        "
        li r1, 1
        li r2, 0
        divu r3, r1, r2
        trap
        ",
        EngineOpts::test_opts(),
    );
    let Outcome::Interrupted(info) = rig.run_once() else {
        panic!("expected a fault");
    };
    assert_eq!(info, SigInfo::fault(Signal::SIGFPE, rig.entry + 16));
    assert_eq!(info.code, SigCode::FpeIntDiv);
    assert_eq!(rig.arch.ip, rig.entry + 16);
}

#[test]
fn unmapped_load_raises_sigsegv() {
    let mut rig = Rig::new(
        "
        li r1, 0x70000000
        ld r2, 8(r1)
        trap
        ",
        EngineOpts::test_opts(),
    );
    let Outcome::Interrupted(info) = rig.run_once() else {
        panic!("expected a fault");
    };
    assert_eq!(
        (info.signo, info.code, info.addr),
        (Signal::SIGSEGV, SigCode::SegvMapErr, 0x7000_0008)
    );
    assert_eq!(rig.arch.ip, rig.entry + 8);
}

#[test]
fn pending_signal_interrupts_at_an_instruction_boundary() {
    let mut rig = Rig::new("nop\nnop\ntrap", EngineOpts::test_opts());
    rig.mailbox.post_signal(Signal::SIGUSR1);
    assert_eq!(
        rig.run_once(),
        Outcome::Interrupted(SigInfo::user(Signal::SIGUSR1))
    );
    assert_eq!(rig.arch.ip, rig.entry);
    assert!(!rig.mailbox.has_signal());

    // An exit request stops the run without a signal.
    rig.mailbox.request_exit(ExitReason::ExitGroup(0));
    assert_eq!(
        rig.run_once(),
        Outcome::Completed {
            trc: TraceCode::Boring,
            addr: 0
        }
    );
}

#[test]
fn indirect_exits_without_chaining() {
    let mut opts = EngineOpts::test_opts();
    opts.chaining = false;
    let mut rig = Rig::new("jmp far\nnop\nfar: trap", opts);
    assert_eq!(
        rig.run_once(),
        Outcome::Completed {
            trc: TraceCode::CacheMiss,
            addr: 0
        }
    );
    assert_eq!(rig.arch.ip, rig.entry + 16);
    assert_eq!(rig.drive(), (TraceCode::SigTrap, 0));

    // Once both blocks are known the indirect exit finds its target in the fast cache.
    rig.arch.ip = rig.entry;
    rig.dispatches = 0;
    assert_eq!(rig.drive(), (TraceCode::SigTrap, 0));
    assert_eq!(rig.dispatches, 1);
    assert_eq!(rig.cache.stats().chains, 0);
}

#[test]
fn guest_calls_exit_with_their_trace_codes() {
    let mut rig = Rig::new(
        "
        li r0, 6
        syscall
        creq
        li r1, 0x10000
        li r2, 8
        icinv r1, r2
        ",
        EngineOpts::test_opts(),
    );
    for (trc, ip) in [
        (TraceCode::Syscall, 16),
        (TraceCode::ClientRequest, 24),
        (TraceCode::InvalidateICache, 48),
    ] {
        assert_eq!(rig.drive(), (trc, 0));
        assert_eq!(rig.arch.ip, rig.entry + ip);
    }
    assert_eq!((rig.arch.cmstart, rig.arch.cmlen), (0x1_0000, 8));
}

#[test]
fn smc_guard_reports_modified_code() {
    let mut opts = EngineOpts::test_opts();
    opts.smc_check = SmcCheck::All;
    let mut rig = Rig::new("li r1, 1\ntrap", opts);
    assert_eq!(rig.drive(), (TraceCode::SigTrap, 0));
    assert_eq!(rig.arch.regs[1], 1);

    let patched = Instruction::new(Opcode::Li, 1, 0, 0, 2).encode();
    rig.mem.write(rig.entry, &patched, Perms::empty()).unwrap();
    rig.arch.ip = rig.entry;
    let host = rig.cache.lookup_fast(rig.entry).unwrap();
    assert_eq!(
        rig.run_once(),
        Outcome::Completed {
            trc: TraceCode::InvalidateICache,
            addr: host.add(FAST_ENTRY_OFFSET).to_word()
        }
    );
    assert_eq!((rig.arch.cmstart, rig.arch.cmlen), (rig.entry, 16));
    assert_eq!(rig.arch.ip, rig.entry);

    assert_eq!(rig.cache.discard(rig.entry, 16, "smc-check"), 1);
    assert_eq!(rig.drive(), (TraceCode::SigTrap, 0));
    assert_eq!(rig.arch.regs[1], 2);
}

#[test]
fn bad_host_address_is_an_invariant_failure() {
    let mut rig = Rig::new("trap", EngineOpts::test_opts());
    let bogus = HostAddr::new(99, 0);
    assert_eq!(
        run_translations(&rig.cache, &mut rig.mem, &mut rig.arch, &rig.mailbox, bogus),
        Outcome::Completed {
            trc: TraceCode::InvariantFailed,
            addr: bogus.to_word()
        }
    );
}
