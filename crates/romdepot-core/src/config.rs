//! Configuration file (~/.romdepot/config.json)

use crate::db::MAX_BATCH_SIZE;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".romdepot";
const CONFIG_FILENAME: &str = "config.json";
const DB_FILENAME: &str = "romdepot.db";

/// A storage shard of the depot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotRootConfig {
    pub path: PathBuf,
    /// Advisory capacity in bytes
    pub max_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    pub dat_root: Option<PathBuf>,
    pub workers: usize,
    pub max_batch_size: u64,
    pub depot: Vec<DepotRootConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let dir = config_dir().unwrap_or_else(|_| PathBuf::from(CONFIG_DIR));
        Self {
            db_path: dir.join(DB_FILENAME),
            dat_root: None,
            workers: num_cpus::get(),
            max_batch_size: MAX_BATCH_SIZE,
            depot: Vec::new(),
        }
    }
}

/// Get the configuration directory (~/.romdepot)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot find home directory"))?;
    Ok(home.join(CONFIG_DIR))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILENAME))
}

impl Config {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Unable to write config file: {}", path.display()))
    }
}
