use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub const GENERATION_FILENAME: &str = "romdepot.generation";

/// Read the size checkpoint stored under `root`, writing `0` if there is none yet.
pub fn read_generation_file(root: &Path) -> Result<i64> {
    let path = root.join(GENERATION_FILENAME);
    if !path.exists() {
        write_generation_file(root, 0)?;
        return Ok(0);
    }

    let text = fs::read_to_string(&path)
        .with_context(|| format!("Unable to read generation file: {}", path.display()))?;
    text.trim()
        .parse()
        .with_context(|| format!("Invalid generation file: {}", path.display()))
}

pub fn write_generation_file(root: &Path, size: i64) -> Result<()> {
    let path = root.join(GENERATION_FILENAME);
    fs::write(&path, size.to_string())
        .with_context(|| format!("Unable to write generation file: {}", path.display()))
}
