//! A line-based assembler for the guest ISA.
//!
//! ```text
//!         .org 0x10000          # load address (first .org only moves the base)
//!         .entry _start
//! _start: li r1, 10
//! loop:   addi r1, r1, -1
//!         bnez r1, loop
//!         ld r2, 8(r14)
//!         ret                   # jr r15
//! data:   .word 0x1234
//! ```

use hashbrown::HashMap;
use strum::IntoEnumIterator;
use thiserror::Error;

use super::{
    isa::{Format, Instruction, Opcode, INSN_BYTES, LR, NUM_REGS, SP},
    program::{Program, DEFAULT_BASE},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("line {line}: undefined label `{label}`")]
    UndefinedLabel { line: usize, label: String },
    #[error("line {line}: label `{label}` is defined twice")]
    DuplicateLabel { line: usize, label: String },
    #[error("line {line}: value {value:#x} does not fit in 32 bits")]
    OutOfRange { line: usize, value: i128 },
}

fn syntax(line: usize, msg: impl Into<String>) -> AsmError {
    AsmError::Syntax {
        line,
        msg: msg.into(),
    }
}

enum ItemKind<'a> {
    Insn {
        mnemonic: &'a str,
        operands: Vec<&'a str>,
    },
    Word(&'a str),
}

struct Item<'a> {
    line: usize,
    addr: u64,
    kind: ItemKind<'a>,
}

#[derive(Default)]
struct Assembler<'a> {
    labels: HashMap<&'a str, u64>,
    items: Vec<Item<'a>>,
    base: Option<u64>,
    pc: u64,
    entry: Option<(usize, &'a str)>,
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_number(s: &str) -> Option<i128> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let digits = digits.replace('_', "");
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as i128,
        None => digits.parse::<u64>().ok()? as i128,
    };
    Some(if neg { -value } else { value })
}

fn parse_reg(line: usize, s: &str) -> Result<u8, AsmError> {
    match s {
        "sp" => return Ok(SP),
        "lr" => return Ok(LR),
        _ => {}
    }
    s.strip_prefix('r')
        .and_then(|n| n.parse::<u8>().ok())
        .filter(|&n| (n as usize) < NUM_REGS)
        .ok_or_else(|| syntax(line, format!("expected a register, found `{s}`")))
}

impl<'a> Assembler<'a> {
    fn first_pass(&mut self, src: &'a str) -> Result<(), AsmError> {
        for (idx, raw) in src.lines().enumerate() {
            let line = idx + 1;
            let mut text = raw
                .split(|c: char| c == '#' || c == ';')
                .next()
                .unwrap_or_default()
                .trim();
            while let Some((label, rest)) = text.split_once(':') {
                let label = label.trim();
                if !is_ident(label) {
                    break;
                }
                if self.labels.insert(label, self.pc_or_base()).is_some() {
                    return Err(AsmError::DuplicateLabel {
                        line,
                        label: label.to_string(),
                    });
                }
                text = rest.trim();
            }
            if text.is_empty() {
                continue;
            }
            let (head, rest) = text
                .split_once(char::is_whitespace)
                .map_or((text, ""), |(h, r)| (h, r.trim()));
            match head {
                ".org" => self.org(line, rest)?,
                ".entry" => self.entry = Some((line, rest)),
                ".word" => self.push(line, ItemKind::Word(rest)),
                ".zero" => {
                    let n = parse_number(rest)
                        .filter(|n| *n >= 0 && *n as u64 % INSN_BYTES == 0)
                        .ok_or_else(|| syntax(line, ".zero takes a multiple of 8"))?;
                    for _ in 0..n as u64 / INSN_BYTES {
                        self.push(line, ItemKind::Word("0"));
                    }
                }
                _ if head.starts_with('.') => {
                    return Err(syntax(line, format!("unknown directive `{head}`")))
                }
                mnemonic => {
                    let operands = if rest.is_empty() {
                        vec![]
                    } else {
                        rest.split(',').map(str::trim).collect()
                    };
                    self.push(line, ItemKind::Insn { mnemonic, operands });
                }
            }
        }
        Ok(())
    }

    fn pc_or_base(&self) -> u64 {
        match self.base {
            Some(_) => self.pc,
            None => DEFAULT_BASE,
        }
    }

    fn org(&mut self, line: usize, arg: &str) -> Result<(), AsmError> {
        let addr = parse_number(arg)
            .filter(|a| *a >= 0 && *a as u64 % INSN_BYTES == 0)
            .ok_or_else(|| syntax(line, ".org takes an 8-byte aligned address"))?
            as u64;
        match self.base {
            None if self.labels.is_empty() => {
                self.base = Some(addr);
                self.pc = addr;
            }
            None => return Err(syntax(line, "the first .org must precede all labels")),
            Some(_) if addr < self.pc => {
                return Err(syntax(line, format!(".org {addr:#x} moves backwards")))
            }
            Some(_) => self.pc = addr,
        }
        Ok(())
    }

    fn push(&mut self, line: usize, kind: ItemKind<'a>) {
        if self.base.is_none() {
            self.base = Some(DEFAULT_BASE);
            self.pc = DEFAULT_BASE;
        }
        self.items.push(Item {
            line,
            addr: self.pc,
            kind,
        });
        self.pc += INSN_BYTES;
    }

    fn value(&self, line: usize, s: &str) -> Result<i128, AsmError> {
        if let Some(v) = parse_number(s) {
            return Ok(v);
        }
        if is_ident(s) {
            return self
                .labels
                .get(s)
                .map(|&a| a as i128)
                .ok_or_else(|| AsmError::UndefinedLabel {
                    line,
                    label: s.to_string(),
                });
        }
        Err(syntax(line, format!("expected a number or label, found `{s}`")))
    }

    fn imm32(&self, line: usize, s: &str) -> Result<i32, AsmError> {
        let value = self.value(line, s)?;
        if value < i32::MIN as i128 || value > u32::MAX as i128 {
            return Err(AsmError::OutOfRange { line, value });
        }
        Ok(value as u32 as i32)
    }

    /// Parses `imm(rs1)`, returning `(rs1, imm)`.
    fn mem_operand(&self, line: usize, s: &str) -> Result<(u8, i32), AsmError> {
        let (off, reg) = s
            .strip_suffix(')')
            .and_then(|s| s.split_once('('))
            .ok_or_else(|| syntax(line, format!("expected `imm(reg)`, found `{s}`")))?;
        let imm = if off.trim().is_empty() {
            0
        } else {
            self.imm32(line, off.trim())?
        };
        Ok((parse_reg(line, reg.trim())?, imm))
    }

    fn instruction(
        &self,
        line: usize,
        mnemonic: &str,
        ops: &[&str],
    ) -> Result<Instruction, AsmError> {
        if mnemonic == "ret" {
            return self.instruction(line, "jr", &["r15"]);
        }
        let opcode = Opcode::iter()
            .find(|op| op.to_string() == mnemonic)
            .ok_or_else(|| syntax(line, format!("unknown mnemonic `{mnemonic}`")))?;
        let format = opcode.format();
        let arity = match format {
            Format::None => 0,
            Format::Target | Format::Rs => 1,
            Format::RdImm | Format::RdRs | Format::Load | Format::Store | Format::RsTarget
            | Format::RsRs => 2,
            Format::RdRsRs | Format::RdRsImm => 3,
        };
        if ops.len() != arity {
            return Err(syntax(
                line,
                format!("`{mnemonic}` takes {arity} operands, found {}", ops.len()),
            ));
        }
        let reg = |i: usize| parse_reg(line, ops[i]);
        let insn = match format {
            Format::None => Instruction::new(opcode, 0, 0, 0, 0),
            Format::RdImm => Instruction::new(opcode, reg(0)?, 0, 0, self.imm32(line, ops[1])?),
            Format::RdRs => Instruction::new(opcode, reg(0)?, reg(1)?, 0, 0),
            Format::RdRsRs => Instruction::new(opcode, reg(0)?, reg(1)?, reg(2)?, 0),
            Format::RdRsImm => {
                Instruction::new(opcode, reg(0)?, reg(1)?, 0, self.imm32(line, ops[2])?)
            }
            Format::Load => {
                let (base, imm) = self.mem_operand(line, ops[1])?;
                Instruction::new(opcode, reg(0)?, base, 0, imm)
            }
            Format::Store => {
                let (base, imm) = self.mem_operand(line, ops[1])?;
                Instruction::new(opcode, 0, base, reg(0)?, imm)
            }
            Format::Target => Instruction::new(opcode, 0, 0, 0, self.imm32(line, ops[0])?),
            Format::RsTarget => Instruction::new(opcode, 0, reg(0)?, 0, self.imm32(line, ops[1])?),
            Format::Rs => Instruction::new(opcode, 0, reg(0)?, 0, 0),
            Format::RsRs => Instruction::new(opcode, 0, reg(0)?, reg(1)?, 0),
        };
        Ok(insn)
    }

    fn second_pass(self) -> Result<Program, AsmError> {
        let base = self.base.unwrap_or(DEFAULT_BASE);
        let mut image = vec![0u8; (self.pc.max(base) - base) as usize];
        for item in &self.items {
            let bytes = match &item.kind {
                ItemKind::Insn { mnemonic, operands } => self
                    .instruction(item.line, mnemonic, operands)?
                    .encode(),
                ItemKind::Word(v) => (self.value(item.line, v)? as u64).to_le_bytes(),
            };
            let off = (item.addr - base) as usize;
            image[off..off + INSN_BYTES as usize].copy_from_slice(&bytes);
        }
        let entry = match self.entry {
            Some((line, target)) => self.value(line, target)? as u64,
            None => self.labels.get("_start").copied().unwrap_or(base),
        };
        Ok(Program::new(base, image, entry))
    }
}

/// Assembles `src` into a [`Program`].
pub fn assemble(src: &str) -> Result<Program, AsmError> {
    let mut asm = Assembler::default();
    asm.first_pass(src)?;
    asm.second_pass()
}
