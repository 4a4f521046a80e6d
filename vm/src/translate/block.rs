//! The reference block translator.
//!
//! A translation looks like this:
//!
//! ```text
//! 0:  evcheck                      checked entry
//! 1:  [smccheck len; start; hash]  fast entry (guard only with SmcCheck::All)
//!     putip pc0; <ops for insn 0>
//!     putip pc1; <ops for insn 1>
//!     ...
//!     <block exit>
//! ```
//!
//! A direct exit is always two words, `putip target; chainme` (or `xindir`
//! when chaining is off), so conditional branches can skip over one.

use tracing::instrument;

use super::{SiteSpec, TranslateError, TranslateRequest, Translation, Translator};
use crate::{
    dispatch::TraceCode,
    guest::{GuestMemory, Instruction, Opcode, INSN_BYTES, LR},
    host::{
        arch::{CMLEN_SLOT, CMSTART_SLOT, IP_SLOT},
        insn::code_hash,
        AluOp, HostInsn,
    },
    opts::SmcCheck,
};

/// Words emitted by [`Emitter::exit_direct`].
const EXIT_WORDS: u32 = 2;

/// Highest guest address a block may start at; ips must fit the 32-bit `putip` immediate.
const MAX_GUEST_PC: u64 = u32::MAX as u64 - 2 * INSN_BYTES;

#[derive(Debug, Default, Clone, Copy)]
pub struct BlockTranslator;

#[derive(Default)]
struct Emitter {
    code: Vec<u64>,
    sites: Vec<SiteSpec>,
}

impl Emitter {
    fn emit(&mut self, insn: HostInsn) {
        self.code.push(insn.encode());
    }

    /// Writes the guest ip without an interruption point.
    fn set_ip(&mut self, ip: u64) {
        self.emit(HostInsn::LiU {
            dst: IP_SLOT,
            imm: ip as u32,
        });
    }

    fn assisted(&mut self, next: u64, trc: TraceCode) {
        self.set_ip(next);
        self.emit(HostInsn::XAssisted(trc));
    }

    /// Leaves the block for `target`. `block_end` is one past the block's last guest byte.
    fn exit_direct(&mut self, req: &TranslateRequest, target: u64, block_end: u64) {
        self.emit(HostInsn::PutIp(target as u32));
        if req.chaining {
            let fast = req.fast_entry && target >= block_end;
            self.sites.push(SiteSpec {
                offset: self.code.len() as u32,
                target,
                fast,
            });
            self.emit(HostInsn::ChainMe { fast });
        } else {
            self.emit(HostInsn::XIndir);
        }
    }
}

fn alu_op(op: Opcode) -> Option<AluOp> {
    Some(match op {
        Opcode::Add => AluOp::Add,
        Opcode::Sub => AluOp::Sub,
        Opcode::And => AluOp::And,
        Opcode::Or => AluOp::Or,
        Opcode::Xor => AluOp::Xor,
        Opcode::Shl => AluOp::Shl,
        Opcode::Shr => AluOp::Shr,
        Opcode::Mul => AluOp::Mul,
        Opcode::Divu => AluOp::DivU,
        Opcode::Remu => AluOp::RemU,
        Opcode::Sltu => AluOp::Sltu,
        _ => return None,
    })
}

impl BlockTranslator {
    pub fn new() -> Self {
        Self
    }

    fn emit_insn(e: &mut Emitter, req: &TranslateRequest, insn: &Instruction, next: u64) {
        let Instruction {
            opcode,
            rd,
            rs1,
            rs2,
            imm,
        } = *insn;
        let target = insn.direct_target().unwrap_or(next);
        match opcode {
            Opcode::Nop => {}
            Opcode::Li => e.emit(HostInsn::Li { dst: rd, imm }),
            Opcode::Mov => e.emit(HostInsn::Mov { dst: rd, src: rs1 }),
            Opcode::Addi => e.emit(HostInsn::AddI {
                dst: rd,
                src: rs1,
                imm,
            }),
            Opcode::Ld => e.emit(HostInsn::Load {
                dst: rd,
                base: rs1,
                offset: imm,
            }),
            Opcode::St => e.emit(HostInsn::Store {
                src: rs2,
                base: rs1,
                offset: imm,
            }),
            Opcode::Jmp => e.exit_direct(req, target, next),
            Opcode::Call => {
                e.emit(HostInsn::LiU {
                    dst: LR,
                    imm: next as u32,
                });
                e.exit_direct(req, target, next);
            }
            Opcode::Beqz | Opcode::Bnez => {
                let count = EXIT_WORDS;
                e.emit(if opcode == Opcode::Beqz {
                    HostInsn::SkipIfNonZero { reg: rs1, count }
                } else {
                    HostInsn::SkipIfZero { reg: rs1, count }
                });
                e.exit_direct(req, target, next);
                e.exit_direct(req, next, next);
            }
            Opcode::Jr => {
                e.emit(HostInsn::Mov {
                    dst: IP_SLOT,
                    src: rs1,
                });
                e.emit(HostInsn::XIndir);
            }
            Opcode::Syscall => e.assisted(next, TraceCode::Syscall),
            Opcode::Creq => e.assisted(next, TraceCode::ClientRequest),
            Opcode::Icinv => {
                e.emit(HostInsn::Mov {
                    dst: CMSTART_SLOT,
                    src: rs1,
                });
                e.emit(HostInsn::Mov {
                    dst: CMLEN_SLOT,
                    src: rs2,
                });
                e.assisted(next, TraceCode::InvalidateICache);
            }
            Opcode::Trap => e.assisted(next, TraceCode::SigTrap),
            alu => {
                if let Some(op) = alu_op(alu) {
                    e.emit(HostInsn::Alu {
                        op,
                        dst: rd,
                        a: rs1,
                        b: rs2,
                    });
                }
            }
        }
    }
}

impl Translator for BlockTranslator {
    #[instrument(skip_all, level = "trace", fields(guest = req.guest))]
    fn translate(
        &mut self,
        mem: &GuestMemory,
        req: &TranslateRequest,
    ) -> Result<Translation, TranslateError> {
        let start = req.guest;
        if start % INSN_BYTES != 0 {
            return Err(TranslateError::Misaligned(start));
        }
        if start > MAX_GUEST_PC {
            return Err(TranslateError::AddressRange(start));
        }

        let mut e = Emitter::default();
        e.emit(HostInsn::EvCheck);
        let guarded = req.smc_check == SmcCheck::All;
        if guarded {
            // Filled in once the block length is known.
            e.code.extend([0; 3]);
        }

        let mut bytes = Vec::new();
        let mut pc = start;
        loop {
            let first = bytes.is_empty();
            let raw = match mem.fetch(pc) {
                Ok(raw) => raw,
                Err(source) if first => return Err(TranslateError::Fetch { addr: pc, source }),
                Err(_) => {
                    e.exit_direct(req, pc, pc);
                    break;
                }
            };
            let insn = match Instruction::decode(raw) {
                Ok(insn) => insn,
                Err(source) if first => {
                    return Err(TranslateError::Undecodable { addr: pc, source })
                }
                Err(_) => {
                    e.exit_direct(req, pc, pc);
                    break;
                }
            };
            bytes.extend_from_slice(&raw);
            let next = pc + INSN_BYTES;
            e.emit(HostInsn::PutIp(pc as u32));
            Self::emit_insn(&mut e, req, &insn, next);
            if insn.opcode.ends_block() {
                break;
            }
            if bytes.len() as u64 >= req.max_insns as u64 * INSN_BYTES || next > MAX_GUEST_PC {
                e.exit_direct(req, next, next);
                break;
            }
            pc = next;
        }

        let guest_len = bytes.len() as u64;
        if guarded {
            e.code[1] = HostInsn::SmcCheck {
                len: guest_len as u32,
            }
            .encode();
            e.code[2] = start;
            e.code[3] = code_hash(&bytes);
        }
        Ok(Translation {
            guest_len,
            n_guest_insns: (guest_len / INSN_BYTES) as u32,
            code: e.code,
            sites: e.sites,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        guest::{assemble, Perms},
        host::insn::FAST_ENTRY_OFFSET,
        opts::EngineOpts,
    };

    fn setup(src: &str) -> (GuestMemory, u64) {
        let prog = assemble(src).unwrap();
        let mut mem = GuestMemory::new();
        prog.load(&mut mem).unwrap();
        (mem, prog.entry)
    }

    fn decode_all(t: &Translation) -> Vec<HostInsn> {
        t.code.iter().map(|&w| HostInsn::decode(w).unwrap()).collect()
    }

    #[test]
    fn straight_line_block_ends_at_jump() {
        let (mem, entry) = setup(
            "
            li r1, 5
            add r2, r1, r1
            jmp next
            next: trap
            ",
        );
        let req = TranslateRequest::new(entry, &EngineOpts::test_opts());
        let t = BlockTranslator.translate(&mem, &req).unwrap();
        assert_eq!(t.n_guest_insns, 3);
        assert_eq!(t.guest_len, 24);
        let code = decode_all(&t);
        assert_eq!(
            code,
            vec![
                HostInsn::EvCheck,
                HostInsn::PutIp(entry as u32),
                HostInsn::Li { dst: 1, imm: 5 },
                HostInsn::PutIp(entry as u32 + 8),
                HostInsn::Alu {
                    op: AluOp::Add,
                    dst: 2,
                    a: 1,
                    b: 1
                },
                HostInsn::PutIp(entry as u32 + 16),
                HostInsn::PutIp(entry as u32 + 24),
                HostInsn::ChainMe { fast: true },
            ]
        );
        assert_eq!(
            t.sites,
            vec![SiteSpec {
                offset: 7,
                target: entry + 24,
                fast: true
            }]
        );
    }

    #[test]
    fn backward_branch_uses_slow_site() {
        let (mem, entry) = setup(
            "
            loop: addi r1, r1, -1
                  bnez r1, loop
                  trap
            ",
        );
        let req = TranslateRequest::new(entry, &EngineOpts::test_opts());
        let t = BlockTranslator.translate(&mem, &req).unwrap();
        let code = decode_all(&t);
        assert_eq!(code[4], HostInsn::SkipIfZero { reg: 1, count: 2 });
        assert_eq!(t.sites.len(), 2);
        assert_eq!((t.sites[0].target, t.sites[0].fast), (entry, false));
        assert_eq!((t.sites[1].target, t.sites[1].fast), (entry + 16, true));
        for site in &t.sites {
            assert_eq!(
                code[site.offset as usize],
                HostInsn::ChainMe { fast: site.fast }
            );
        }
    }

    #[test]
    fn chaining_off_emits_indirect_exits() {
        let (mem, entry) = setup("jmp far\nfar: trap");
        let mut req = TranslateRequest::new(entry, &EngineOpts::test_opts());
        req.chaining = false;
        let t = BlockTranslator.translate(&mem, &req).unwrap();
        assert!(t.sites.is_empty());
        assert_eq!(decode_all(&t).last(), Some(&HostInsn::XIndir));
    }

    #[test]
    fn max_insns_splits_long_blocks() {
        let (mem, entry) = setup("nop\nnop\nnop\nnop\ntrap");
        let mut req = TranslateRequest::new(entry, &EngineOpts::test_opts());
        req.max_insns = 2;
        let t = BlockTranslator.translate(&mem, &req).unwrap();
        assert_eq!(t.n_guest_insns, 2);
        assert_eq!(t.sites[0].target, entry + 16);
    }

    #[test]
    fn smc_guard_sits_at_fast_entry() {
        let (mem, entry) = setup("li r1, 1\ntrap");
        let mut req = TranslateRequest::new(entry, &EngineOpts::test_opts());
        req.smc_check = SmcCheck::All;
        let t = BlockTranslator.translate(&mem, &req).unwrap();
        assert_eq!(
            HostInsn::decode(t.code[FAST_ENTRY_OFFSET as usize]),
            Ok(HostInsn::SmcCheck { len: 16 })
        );
        assert_eq!(t.code[2], entry);
        let bytes = mem.read_vec(entry, 16, Perms::EXEC).unwrap();
        assert_eq!(t.code[3], code_hash(&bytes));
    }

    #[test]
    fn fetch_and_decode_failures() {
        let (mem, entry) = setup("nop\n.word 0");
        let req = |guest| TranslateRequest::new(guest, &EngineOpts::test_opts());
        assert!(matches!(
            BlockTranslator.translate(&mem, &req(0x9000_0000)),
            Err(TranslateError::Fetch { addr: 0x9000_0000, .. })
        ));
        assert!(matches!(
            BlockTranslator.translate(&mem, &req(entry + 8)),
            Err(TranslateError::Undecodable { .. })
        ));
        assert_eq!(
            BlockTranslator.translate(&mem, &req(entry + 4)),
            Err(TranslateError::Misaligned(entry + 4))
        );
        // The bad word ends the block in front of it instead of failing it.
        let t = BlockTranslator.translate(&mem, &req(entry)).unwrap();
        assert_eq!(t.n_guest_insns, 1);
        assert_eq!(t.sites[0].target, entry + 8);
    }
}
