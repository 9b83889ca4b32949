#![cfg(test)]

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub fn set_fixture(dir: &Path, filename: &str, val: &str) -> Result<PathBuf> {
    let full_path = dir.join(filename);

    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&full_path)
        .with_context(|| format!("failed to open {full_path:?}"))?
        .write_all(val.as_bytes())
        .with_context(|| format!("failed to write to {full_path:?}"))?;

    Ok(full_path)
}
