use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const CORE_FIXTURE_DIR: &str = "tests/fixtures/core";

/// Return the on-disk location of the bundled core fixture.
pub fn core_fixture_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(CORE_FIXTURE_DIR)
}

/// Install the bundled core fixture into the provided target root.
///
/// The fixture runs the whole pipeline offline: the stub model answers every
/// prompt phase, the stub renderer returns a fixed PNG, and a short guidelines
/// document feeds the critic. Existing files with the same path are overwritten.
pub fn install_core_fixture(target_root: &Path) -> Result<PathBuf> {
    let fixture_root = core_fixture_root();

    for dir in ["config", "docs", "data"] {
        copy_dir_recursive(&fixture_root.join(dir), &target_root.join(dir))
            .with_context(|| format!("copying {dir} fixture"))?;
    }

    Ok(target_root.to_path_buf())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }

    fs::create_dir_all(dst).with_context(|| format!("creating fixture dir {:?}", dst))?;

    for entry in fs::read_dir(src).with_context(|| format!("reading fixture dir {:?}", src))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copying fixture file {:?}", src_path))?;
        }
    }

    Ok(())
}
