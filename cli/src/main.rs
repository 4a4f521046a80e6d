use anyhow::Result;
use clap::{Parser, Subcommand};
use shunt_vm::logger::setup_logger;

mod subcommand;

use subcommand::{asm::AsmCmd, run::RunCmd};

#[derive(Parser)]
#[command(name = "shunt", version, about = "Run guest programs under the shunt translation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run(RunCmd),
    Asm(AsmCmd),
}

fn main() -> Result<()> {
    setup_logger();
    match Cli::parse().command {
        Command::Run(cmd) => {
            let code = cmd.run()?;
            std::process::exit(code);
        }
        Command::Asm(cmd) => cmd.run(),
    }
}
