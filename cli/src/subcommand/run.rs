use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use shunt_vm::{Engine, EngineOpts, SmcCheck};
use tracing::{debug, info};

use super::load_program;

#[derive(Parser)]
#[command(name = "run", about = "Translate and run a guest program")]
pub struct RunCmd {
    #[clap(help = "Assembly source, or a .hex image")]
    program: PathBuf,

    #[clap(long, help = "Blocks a thread runs before yielding the big lock")]
    quantum: Option<u64>,

    #[clap(long, help = "Number of guest thread slots")]
    max_threads: Option<usize>,

    #[clap(long, help = "Emit chainable block exits")]
    chaining: Option<bool>,

    #[clap(long, help = "Let forward chains skip the target's event check")]
    fast_entry: Option<bool>,

    #[clap(long, help = "Self-modifying code detection: none or all")]
    smc_check: Option<SmcCheck>,

    #[clap(long, help = "0 disables sanity checks, 2 checks the whole cache at every poll")]
    sanity_level: Option<u8>,

    #[clap(
        long,
        env = "SHUNT_STATS_JSON",
        action = ArgAction::SetTrue,
        help = "Print engine statistics as JSON on exit"
    )]
    stats: bool,
}

impl RunCmd {
    fn opts(&self) -> EngineOpts {
        let mut opts = EngineOpts::default();
        if let Some(quantum) = self.quantum {
            opts.quantum = quantum;
        }
        if let Some(max_threads) = self.max_threads {
            opts.max_threads = max_threads;
        }
        if let Some(chaining) = self.chaining {
            opts.chaining = chaining;
        }
        if let Some(fast_entry) = self.fast_entry {
            opts.fast_entry = fast_entry;
        }
        if let Some(smc_check) = self.smc_check {
            opts.smc_check = smc_check;
        }
        if let Some(level) = self.sanity_level {
            opts.sanity_level = level;
        }
        opts
    }

    /// Returns the guest's exit status as a shell would see it.
    pub fn run(&self) -> Result<i32> {
        let program = load_program(&self.program)?;
        let opts = self.opts();
        debug!(?opts, "engine options");

        let engine = Engine::new(opts);
        let status = engine.run(&program)?;
        if self.stats {
            eprintln!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }
        info!(code = status.code(), "exit");
        Ok(status.code())
    }
}
