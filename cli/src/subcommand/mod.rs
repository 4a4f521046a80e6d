use std::{fs, path::Path};

use anyhow::{Context, Result};
use shunt_vm::{assemble, guest::program::DEFAULT_BASE, Program};

pub mod asm;
pub mod run;

/// Loads a guest program: `.hex` files hold a hex-encoded image loaded at the
/// default base, anything else is assembly source.
pub(crate) fn load_program(path: &Path) -> Result<Program> {
    let text =
        fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "hex") {
        let image = hex::decode(text.split_whitespace().collect::<String>())
            .with_context(|| format!("{} is not a hex image", path.display()))?;
        return Ok(Program::new(DEFAULT_BASE, image, DEFAULT_BASE));
    }
    assemble(&text).with_context(|| format!("cannot assemble {}", path.display()))
}
