//! SQLite-backed rom index

use super::{IndexStats, RomBatch, RomDb, estimated_dat_size, estimated_rom_size};
use crate::dat::{Dat, Game, Rom};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{
    Connection, OptionalExtension, Params, Transaction, TransactionBehavior, params,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

const KIND_ROM: &str = "rom";
const KIND_DISK: &str = "disk";
const KIND_PART: &str = "part";
const KIND_REGION: &str = "region";

/// SQLite integers are signed; sizes past `i64::MAX` are rejected.
fn sql_size(size: u64) -> Result<i64> {
    i64::try_from(size).with_context(|| format!("rom size out of range: {size}"))
}

/// Open a connection with the pragmas every index connection needs
fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open rom index: {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Create the database schema
fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}

pub struct SqliteRomDb {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteRomDb {
    /// Open the index at `path`, creating tables if they don't exist
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_connection(path)?;
        create_schema(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("rom index connection lock poisoned"))
    }

    /// Get index statistics
    pub fn stats(&self) -> Result<IndexStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

        Ok(IndexStats {
            dat_count: count("SELECT COUNT(*) FROM dats")?,
            orphaned_dats: count("SELECT COUNT(*) FROM dats WHERE orphaned = 1")?,
            game_count: count("SELECT COUNT(*) FROM games")?,
            rom_count: count("SELECT COUNT(*) FROM roms")?,
            content_count: count("SELECT COUNT(*) FROM rom_hashes")?,
        })
    }

    /// Orphan state of a catalog, `None` if it was never indexed
    pub fn is_orphaned(&self, sha1: &[u8]) -> Result<Option<bool>> {
        let conn = self.conn()?;
        let orphaned = conn
            .query_row(
                "SELECT orphaned FROM dats WHERE sha1 = ?1",
                params![sha1],
                |row| row.get(0),
            )
            .optional()?;
        Ok(orphaned)
    }
}

impl RomDb for SqliteRomDb {
    type Batch = SqliteBatch;

    fn start_batch(&self) -> Result<SqliteBatch> {
        Ok(SqliteBatch {
            conn: open_connection(&self.path)?,
            pending: Vec::new(),
            size: 0,
        })
    }

    fn orphan_dats(&self) -> Result<()> {
        let conn = self.conn()?;
        let marked = conn.execute("UPDATE dats SET orphaned = 1", [])?;
        tracing::info!(marked, "marked dats as orphaned");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    fn get_dat(&self, sha1: &[u8]) -> Result<Option<Dat>> {
        let conn = self.conn()?;
        load_dat(&conn, sha1)
    }

    fn dats_for_rom(&self, rom: &Rom) -> Result<Vec<Dat>> {
        const SELECT: &str = "SELECT DISTINCT d.sha1 FROM roms r
             INNER JOIN games g ON r.game_id = g.id
             INNER JOIN dats d ON g.dat_id = d.id
             WHERE d.orphaned = 0 AND ";

        let conn = self.conn()?;
        let sha1s = if let Some(sha1) = &rom.sha1 {
            query_dat_sha1s(&conn, &format!("{SELECT}r.sha1 = ?1"), params![sha1])?
        } else if let Some(md5) = &rom.md5 {
            query_dat_sha1s(&conn, &format!("{SELECT}r.md5 = ?1"), params![md5])?
        } else if let Some(crc) = &rom.crc {
            query_dat_sha1s(
                &conn,
                &format!("{SELECT}r.crc = ?1 AND r.size = ?2"),
                params![crc, sql_size(rom.size)?],
            )?
        } else {
            Vec::new()
        };

        let mut dats = Vec::with_capacity(sha1s.len());
        for sha1 in sha1s {
            if let Some(dat) = load_dat(&conn, &sha1)? {
                dats.push(dat);
            }
        }
        Ok(dats)
    }
}

fn query_dat_sha1s<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Vec<u8>>> {
    let mut stmt = conn.prepare(sql)?;
    let sha1s = stmt
        .query_map(params, |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sha1s)
}

fn load_dat(conn: &Connection, sha1: &[u8]) -> Result<Option<Dat>> {
    let header = conn
        .query_row(
            "SELECT id, name, description FROM dats WHERE sha1 = ?1",
            params![sha1],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((dat_id, name, description)) = header else {
        return Ok(None);
    };

    let mut dat = Dat {
        name,
        description,
        ..Default::default()
    };

    let mut game_stmt = conn.prepare_cached(
        "SELECT id, name, description, software FROM games WHERE dat_id = ?1 ORDER BY id",
    )?;
    let games = game_stmt
        .query_map([dat_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rom_stmt = conn.prepare_cached(
        "SELECT kind, name, size, crc, md5, sha1 FROM roms WHERE game_id = ?1 ORDER BY id",
    )?;
    for (game_id, name, description, software) in games {
        let mut game = Game {
            name,
            description,
            ..Default::default()
        };

        let roms = rom_stmt
            .query_map([game_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Rom {
                        name: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        crc: row.get(3)?,
                        md5: row.get(4)?,
                        sha1: row.get(5)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (kind, rom) in roms {
            match kind.as_str() {
                KIND_DISK => game.disks.push(rom),
                KIND_PART => game.parts.push(rom),
                KIND_REGION => game.regions.push(rom),
                _ => game.roms.push(rom),
            }
        }

        if software {
            dat.software.push(game);
        } else {
            dat.games.push(game);
        }
    }

    Ok(Some(dat))
}

enum PendingWrite {
    Dat { dat: Dat, sha1: Vec<u8> },
    Rom(Rom),
}

/// A batch with its own connection; writes are held in memory until flushed.
pub struct SqliteBatch {
    conn: Connection,
    pending: Vec<PendingWrite>,
    size: u64,
}

impl RomBatch for SqliteBatch {
    fn index_rom(&mut self, rom: Rom) -> Result<()> {
        self.size += estimated_rom_size(&rom);
        self.pending.push(PendingWrite::Rom(rom));
        Ok(())
    }

    fn index_dat(&mut self, dat: Dat, sha1: Vec<u8>) -> Result<()> {
        self.size += estimated_dat_size(&dat, &sha1);
        self.pending.push(PendingWrite::Dat { dat, sha1 });
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for write in &self.pending {
            match write {
                PendingWrite::Dat { dat, sha1 } => insert_dat(&tx, dat, sha1)?,
                PendingWrite::Rom(rom) => insert_rom_hashes(&tx, rom)?,
            }
        }
        tx.commit()?;

        self.pending.clear();
        self.size = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

fn insert_dat(tx: &Transaction<'_>, dat: &Dat, sha1: &[u8]) -> Result<()> {
    let now = Utc::now().to_rfc3339();

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM dats WHERE sha1 = ?1",
            params![sha1],
            |row| row.get(0),
        )
        .optional()?;

    // Same file content as before: only restore it from orphaned.
    if let Some(dat_id) = existing {
        tx.execute(
            "UPDATE dats SET orphaned = 0, indexed_at = ?1 WHERE id = ?2",
            params![now, dat_id],
        )?;
        return Ok(());
    }

    tx.execute(
        "INSERT INTO dats (sha1, name, description, orphaned, indexed_at)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![sha1, dat.name, dat.description, now],
    )?;
    let dat_id = tx.last_insert_rowid();

    let mut game_stmt = tx.prepare_cached(
        "INSERT INTO games (dat_id, name, description, software) VALUES (?1, ?2, ?3, ?4)",
    )?;
    let mut rom_stmt = tx.prepare_cached(
        "INSERT INTO roms (game_id, kind, name, size, crc, md5, sha1)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;

    for (software, games) in [(false, &dat.games), (true, &dat.software)] {
        for game in games {
            game_stmt.execute(params![dat_id, game.name, game.description, software])?;
            let game_id = tx.last_insert_rowid();

            let kinds = [
                (KIND_ROM, &game.roms),
                (KIND_DISK, &game.disks),
                (KIND_PART, &game.parts),
                (KIND_REGION, &game.regions),
            ];
            for (kind, roms) in kinds {
                for rom in roms {
                    rom_stmt.execute(params![
                        game_id,
                        kind,
                        rom.name,
                        sql_size(rom.size)?,
                        rom.crc,
                        rom.md5,
                        rom.sha1,
                    ])?;
                }
            }
        }
    }

    Ok(())
}

fn insert_rom_hashes(tx: &Transaction<'_>, rom: &Rom) -> Result<()> {
    let Some(sha1) = &rom.sha1 else {
        return Ok(());
    };
    tx.execute(
        "INSERT INTO rom_hashes (sha1, md5, crc, size) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(sha1) DO UPDATE SET
            md5 = COALESCE(rom_hashes.md5, excluded.md5),
            crc = COALESCE(rom_hashes.crc, excluded.crc)",
        params![sha1, rom.md5, rom.crc, sql_size(rom.size)?],
    )?;
    Ok(())
}
