use std::{fs, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use shunt_vm::guest::{Instruction, INSN_BYTES};

use super::load_program;

#[derive(Parser)]
#[command(name = "asm", about = "Assemble a program and print its image")]
pub struct AsmCmd {
    #[clap(help = "Assembly source, or a .hex image")]
    program: PathBuf,

    #[clap(long, help = "Write the hex image here instead of a listing")]
    output: Option<PathBuf>,
}

impl AsmCmd {
    pub fn run(&self) -> Result<()> {
        let program = load_program(&self.program)?;
        if let Some(output) = &self.output {
            fs::write(output, hex::encode(&program.image) + "\n")?;
            return Ok(());
        }

        println!("entry {:#x}", program.entry);
        for (i, chunk) in program.image.chunks(INSN_BYTES as usize).enumerate() {
            let addr = program.base + i as u64 * INSN_BYTES;
            let text = match <[u8; 8]>::try_from(chunk).map(Instruction::decode) {
                Ok(Ok(insn)) => insn.to_string(),
                _ => format!(".word 0x{}", hex::encode(chunk)),
            };
            println!("{addr:#010x}  {}  {text}", hex::encode(chunk));
        }
        Ok(())
    }
}
