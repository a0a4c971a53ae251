//! Depot roots - per-shard size accounting and membership filters

pub mod bloom;
pub mod generation;

use crate::config::DepotRootConfig;
use anyhow::{Context, Result, anyhow};
use bloom::BloomFilter;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Minimum number of entries a freshly populated filter is sized for
const MIN_BLOOM_CAPACITY: u64 = 1_000_000;
const BLOOM_FP_RATE: f64 = 0.01;

#[derive(Debug, Default)]
struct RootState {
    size: i64,
    touched: bool,
    bloom: Option<BloomFilter>,
    bloom_ready: bool,
}

/// One storage shard of the depot.
#[derive(Debug)]
pub struct DepotRoot {
    path: PathBuf,
    max_size: i64,
    state: Mutex<RootState>,
}

/// Snapshot of a root for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootStats {
    pub path: PathBuf,
    pub size: i64,
    pub max_size: i64,
    pub bloom_ready: bool,
    pub touched: bool,
}

impl DepotRoot {
    fn open(config: &DepotRootConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.path).with_context(|| {
            format!("Unable to create depot root: {}", config.path.display())
        })?;

        let size = generation::read_generation_file(&config.path)?;
        let bloom = bloom::load_bloom_filter(&config.path);
        let bloom_ready = bloom.is_some();
        tracing::info!(
            path = %config.path.display(),
            size,
            bloom_ready,
            "loaded depot root"
        );

        Ok(Self {
            path: config.path.clone(),
            max_size: config.max_size,
            state: Mutex::new(RootState {
                size,
                touched: false,
                bloom,
                bloom_ready,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, RootState> {
        // Plain counters; a panicking holder cannot leave them half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> i64 {
        self.max_size
    }

    pub fn size(&self) -> i64 {
        self.state().size
    }

    pub fn is_touched(&self) -> bool {
        self.state().touched
    }

    pub fn is_bloom_ready(&self) -> bool {
        self.state().bloom_ready
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.max_size
    }

    pub fn stats(&self) -> RootStats {
        let state = self.state();
        RootStats {
            path: self.path.clone(),
            size: state.size,
            max_size: self.max_size,
            bloom_ready: state.bloom_ready,
            touched: state.touched,
        }
    }

    fn adjust_size(&self, delta: i64, sha1_hex: Option<&str>) {
        let mut state = self.state();
        state.size = state.size.saturating_add(delta).max(0);

        if let Some(sha1_hex) = sha1_hex
            && state.bloom_ready
            && let Some(bloom) = state.bloom.as_mut()
        {
            bloom.add(sha1_hex.as_bytes());
        }

        state.touched = true;
    }

    fn might_contain(&self, sha1_hex: &str) -> bool {
        let state = self.state();
        match (&state.bloom, state.bloom_ready) {
            (Some(bloom), true) => bloom.contains(sha1_hex.as_bytes()),
            _ => true,
        }
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state();
        if !state.touched {
            return Ok(());
        }

        let mut first_error = None;

        match generation::write_generation_file(&self.path, state.size) {
            Ok(()) => state.touched = false,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "failed to write size file");
                first_error = Some(e);
            }
        }

        let bloom_written = match (&state.bloom, state.bloom_ready) {
            (Some(bloom), true) => bloom::write_bloom_filter_with_backup(&self.path, bloom),
            _ => Ok(()),
        };
        if let Err(e) = bloom_written {
            tracing::error!(path = %self.path.display(), error = %e, "failed to write bloom filter");
            state.touched = true;
            first_error.get_or_insert(anyhow::Error::new(e).context(format!(
                "Unable to write bloom filter into {}",
                self.path.display()
            )));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The set of roots making up the depot, one lock per root.
#[derive(Debug, Default)]
pub struct Depot {
    roots: Vec<DepotRoot>,
}

impl Depot {
    /// Load every configured root's size checkpoint and bloom filter
    pub fn open(roots: &[DepotRootConfig]) -> Result<Self> {
        let roots = roots
            .iter()
            .map(DepotRoot::open)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[DepotRoot] {
        &self.roots
    }

    fn root(&self, index: usize) -> Result<&DepotRoot> {
        self.roots
            .get(index)
            .ok_or_else(|| anyhow!("no depot root at index {index}"))
    }

    /// Account for content added to (positive `delta`) or removed from a root.
    ///
    /// The size never drops below zero. `sha1_hex` is recorded in the root's
    /// filter once the filter is ready.
    pub fn adjust_size(&self, index: usize, delta: i64, sha1_hex: Option<&str>) -> Result<()> {
        self.root(index)?.adjust_size(delta, sha1_hex);
        Ok(())
    }

    /// Install a freshly built filter for a root and mark it ready.
    pub fn populate_bloom<I, T>(&self, index: usize, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let root = self.root(index)?;
        let ids: Vec<T> = ids.into_iter().collect();

        let mut bloom =
            BloomFilter::with_estimate((ids.len() as u64 * 2).max(MIN_BLOOM_CAPACITY), BLOOM_FP_RATE);
        for id in &ids {
            bloom.add(id.as_ref());
        }

        let mut state = root.state();
        state.bloom = Some(bloom);
        state.bloom_ready = true;
        state.touched = true;
        tracing::info!(path = %root.path.display(), entries = ids.len(), "bloom filter ready");
        Ok(())
    }

    /// False only when every root's filter rules the content out.
    pub fn might_contain(&self, sha1_hex: &str) -> bool {
        self.roots.iter().any(|root| root.might_contain(sha1_hex))
    }

    /// Persist every dirty root.
    ///
    /// A failing root stays dirty and does not stop the others from being
    /// written.
    pub fn flush_all(&self) -> Result<()> {
        let failed: Vec<&Path> = self
            .roots
            .iter()
            .filter(|root| root.flush().is_err())
            .map(|root| root.path())
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "failed to persist {} depot root(s): {}",
                failed.len(),
                failed
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        }
    }

    pub fn stats(&self) -> Vec<RootStats> {
        self.roots.iter().map(DepotRoot::stats).collect()
    }
}
