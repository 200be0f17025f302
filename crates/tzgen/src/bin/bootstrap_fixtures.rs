use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tzgen::fixtures;

fn main() -> Result<()> {
    let target = match env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => env::current_dir().context("resolving current directory")?,
    };

    let installed = fixtures::install_core_fixture(&target)?;
    println!(
        "Core fixture installed at {:?}. Set TZGEN_APP_ROOT to this path before starting the server.",
        installed
    );
    Ok(())
}
