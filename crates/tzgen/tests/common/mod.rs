use std::path::{Path, PathBuf};

use anyhow::Result;

pub fn install_core_fixture(root: &Path) -> Result<PathBuf> {
    tzgen::fixtures::install_core_fixture(root)
}
