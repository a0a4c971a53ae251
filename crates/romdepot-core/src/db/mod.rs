//! Database module - the rom index and its batched writers

pub mod sqlite;

use crate::dat::{Dat, Rom};
use anyhow::Result;
use serde::Serialize;

pub use sqlite::{SqliteBatch, SqliteRomDb};

/// Default high-water mark for a batch's pending writes (10 MiB)
pub const MAX_BATCH_SIZE: u64 = 10 * 1024 * 1024;

/// An accumulating unit of index writes, owned by a single writer.
pub trait RomBatch: Send {
    fn index_rom(&mut self, rom: Rom) -> Result<()>;

    /// Index a catalog under the SHA1 of its source file
    fn index_dat(&mut self, dat: Dat, sha1: Vec<u8>) -> Result<()>;

    /// Estimated bytes of pending, unflushed writes
    fn size(&self) -> u64;

    /// Commit pending writes. The batch stays usable.
    fn flush(&mut self) -> Result<()>;

    /// Commit pending writes and release the batch's resources.
    fn close(&mut self) -> Result<()>;
}

/// The persistent index of catalogs and their roms.
pub trait RomDb: Sync {
    type Batch: RomBatch;

    fn start_batch(&self) -> Result<Self::Batch>;

    /// Mark every known catalog as orphaned. Re-indexing a catalog clears the mark.
    fn orphan_dats(&self) -> Result<()>;

    /// Make all committed batch writes durable.
    fn flush(&self) -> Result<()>;

    fn get_dat(&self, sha1: &[u8]) -> Result<Option<Dat>>;

    /// Current (non-orphaned) catalogs that reference `rom`
    fn dats_for_rom(&self, rom: &Rom) -> Result<Vec<Dat>>;

    fn index_rom(&self, rom: Rom) -> Result<()> {
        let mut batch = self.start_batch()?;
        batch.index_rom(rom)?;
        batch.close()
    }

    fn index_dat(&self, dat: Dat, sha1: Vec<u8>) -> Result<()> {
        let mut batch = self.start_batch()?;
        batch.index_dat(dat, sha1)?;
        batch.close()
    }
}

/// Statistics about the index
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub dat_count: i64,
    pub orphaned_dats: i64,
    pub game_count: i64,
    pub rom_count: i64,
    pub content_count: i64,
}

/// Rough in-memory footprint of a pending catalog write
pub(crate) fn estimated_dat_size(dat: &Dat, sha1: &[u8]) -> u64 {
    let games: u64 = dat
        .all_games()
        .map(|g| {
            let roms: u64 = g.all_roms().map(estimated_rom_size).sum();
            (g.name.len() + g.description.len() + 64) as u64 + roms
        })
        .sum();
    (dat.name.len() + dat.description.len() + sha1.len() + 64) as u64 + games
}

pub(crate) fn estimated_rom_size(rom: &Rom) -> u64 {
    let hashes = [&rom.crc, &rom.md5, &rom.sha1]
        .into_iter()
        .map(|h| h.as_ref().map_or(0, Vec::len))
        .sum::<usize>();
    (rom.name.len() + hashes + 48) as u64
}
