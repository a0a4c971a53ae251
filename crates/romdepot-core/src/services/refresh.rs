//! Re-index a tree of DAT files

use super::progress::{WorkEvent, WorkProgress, WorkSummary};
use super::worker::{self, Master, Worker};
use crate::dat;
use crate::db::{MAX_BATCH_SIZE, RomBatch, RomDb};
use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Options controlling a refresh
#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Number of parallel workers, each owning one batch
    pub workers: usize,
    /// Pending bytes at which a worker flushes its batch before the next file
    pub max_batch_size: u64,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            max_batch_size: MAX_BATCH_SIZE,
        }
    }
}

fn is_dat_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("dat") || ext.eq_ignore_ascii_case("xml"))
        .unwrap_or(false)
}

struct RefreshMaster<'db, D: RomDb> {
    db: &'db D,
    options: RefreshOptions,
    progress: Arc<WorkProgress>,
}

struct RefreshWorker<B: RomBatch> {
    index: usize,
    batch: B,
    max_batch_size: u64,
    progress: Arc<WorkProgress>,
}

impl<B: RomBatch> Worker for RefreshWorker<B> {
    fn process(&mut self, path: &Path, _size: u64) -> Result<()> {
        let pending = self.batch.size();
        if pending >= self.max_batch_size {
            tracing::debug!(worker = self.index, pending, "flushing batch");
            self.batch.flush().context("Failed to flush index batch")?;
            self.progress.emit(WorkEvent::BatchFlushed {
                worker: self.index,
                pending_bytes: pending,
            });
        }

        let (dat, sha1) = dat::parse_file(path)?;
        tracing::debug!(path = %path.display(), name = %dat.name, games = dat.games.len(), "parsed DAT");
        self.batch
            .index_dat(dat, sha1)
            .with_context(|| format!("Failed to index DAT: {}", path.display()))
    }

    fn close(&mut self) -> Result<()> {
        self.batch.close().context("Failed to close index batch")
    }
}

impl<D: RomDb> Master for RefreshMaster<'_, D> {
    type Worker = RefreshWorker<D::Batch>;

    fn accept(&self, path: &Path) -> bool {
        is_dat_file(path)
    }

    fn new_worker(&self, index: usize) -> Result<Self::Worker> {
        Ok(RefreshWorker {
            index,
            batch: self.db.start_batch()?,
            max_batch_size: self.options.max_batch_size,
            progress: Arc::clone(&self.progress),
        })
    }

    fn num_workers(&self) -> usize {
        self.options.workers
    }

    fn progress(&self) -> &WorkProgress {
        &self.progress
    }

    fn finish_up(&self) -> Result<()> {
        self.db.flush().context("Failed to flush rom index")
    }
}

/// Re-index every `.dat`/`.xml` file under `dat_root`.
///
/// All previously known DATs are marked orphaned first; each file found in
/// the walk is indexed again, which clears the mark for unchanged content.
pub fn refresh<D: RomDb>(
    db: &D,
    dat_root: &Path,
    options: &RefreshOptions,
    progress: Arc<WorkProgress>,
    cancel: &AtomicBool,
) -> Result<WorkSummary> {
    if !dat_root.is_dir() {
        bail!("DAT root is not a directory: {}", dat_root.display());
    }

    db.orphan_dats().context("Failed to orphan DATs")?;

    let master = RefreshMaster {
        db,
        options: options.clone(),
        progress,
    };
    worker::work(dat_root, &master, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dat::{Dat, Rom};
    use crate::db::SqliteRomDb;
    use sha1::{Digest, Sha1};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const FIRST: &str = "clrmamepro (\n\tname \"First\"\n)\n\ngame (\n\tname \"one\"\n\trom ( name one.bin size 4 crc 01020304 sha1 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa )\n)\n";
    const SECOND: &str = "<?xml version=\"1.0\"?>\n<datafile>\n  <header><name>Second</name></header>\n  <game name=\"two\"><rom name=\"two.bin\" size=\"8\" sha1=\"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\"/></game>\n</datafile>\n";
    const BROKEN: &str = "clrmamepro (\n\tname \"Broken\"\n)\n\ngame (\n\tname \"three\n)\n";

    fn digest(text: &str) -> Vec<u8> {
        Sha1::digest(text.as_bytes()).to_vec()
    }

    fn options() -> RefreshOptions {
        RefreshOptions {
            workers: 2,
            max_batch_size: MAX_BATCH_SIZE,
        }
    }

    #[test]
    fn test_refresh_reports_broken_file_and_keeps_valid() {
        let dir = TempDir::new().unwrap();
        let dats = dir.path().join("dats");
        fs::create_dir_all(dats.join("nested")).unwrap();
        fs::write(dats.join("first.dat"), FIRST).unwrap();
        fs::write(dats.join("nested").join("second.dat"), SECOND).unwrap();
        fs::write(dats.join("notes.txt"), "not a dat").unwrap();

        let db = SqliteRomDb::open(&dir.path().join("index.db")).unwrap();
        db.index_dat(
            Dat {
                name: "Stale".to_string(),
                ..Default::default()
            },
            vec![7; 20],
        )
        .unwrap();

        let cancel = AtomicBool::new(false);
        let summary = refresh(&db, &dats, &options(), Arc::new(WorkProgress::new()), &cancel).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(db.is_orphaned(&[7; 20]).unwrap(), Some(true));

        fs::write(dats.join("broken.dat"), BROKEN).unwrap();
        let progress = Arc::new(WorkProgress::new());
        let err = refresh(&db, &dats, &options(), Arc::clone(&progress), &cancel).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("broken.dat"), "{message}");
        assert!(message.contains("on line 6"), "{message}");

        let summary = progress.summary();
        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);

        assert_eq!(db.is_orphaned(&digest(FIRST)).unwrap(), Some(false));
        assert_eq!(db.is_orphaned(&digest(SECOND)).unwrap(), Some(false));
        assert_eq!(db.is_orphaned(&digest(BROKEN)).unwrap(), None);

        let second = db.get_dat(&digest(SECOND)).unwrap().unwrap();
        assert_eq!(second.name, "Second");
        let found = db
            .dats_for_rom(&Rom {
                sha1: Some(vec![0xaa; 20]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "First");
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let db = SqliteRomDb::open(&dir.path().join("index.db")).unwrap();
        let cancel = AtomicBool::new(false);
        let err = refresh(
            &db,
            &dir.path().join("absent"),
            &options(),
            Arc::new(WorkProgress::new()),
            &cancel,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[derive(Default)]
    struct Recorded {
        indexed: usize,
        flushes: Vec<u64>,
    }

    /// Counts every catalog as 100 pending bytes.
    struct RecordingBatch {
        size: u64,
        log: Arc<Mutex<Recorded>>,
    }

    impl RomBatch for RecordingBatch {
        fn index_rom(&mut self, _rom: Rom) -> Result<()> {
            Ok(())
        }

        fn index_dat(&mut self, _dat: Dat, _sha1: Vec<u8>) -> Result<()> {
            self.size += 100;
            self.log.lock().unwrap().indexed += 1;
            Ok(())
        }

        fn size(&self) -> u64 {
            self.size
        }

        fn flush(&mut self) -> Result<()> {
            self.log.lock().unwrap().flushes.push(self.size);
            self.size = 0;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.flush()
        }
    }

    #[test]
    fn test_batch_flushes_past_threshold() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<_> = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("{i}.dat"));
                fs::write(&path, FIRST).unwrap();
                path
            })
            .collect();

        let log = Arc::new(Mutex::new(Recorded::default()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let mut worker = RefreshWorker {
            index: 0,
            batch: RecordingBatch {
                size: 0,
                log: Arc::clone(&log),
            },
            max_batch_size: 150,
            progress: Arc::new(WorkProgress::with_sink(Arc::new(move |e: WorkEvent| {
                events_clone.lock().unwrap().push(e);
            }))),
        };

        worker.process(&paths[0], 0).unwrap();
        worker.process(&paths[1], 0).unwrap();
        assert_eq!(worker.batch.size(), 200);
        assert!(log.lock().unwrap().flushes.is_empty());

        // Threshold crossed: the batch is flushed before the third file is indexed.
        worker.process(&paths[2], 0).unwrap();
        assert_eq!(worker.batch.size(), 100);
        assert_eq!(log.lock().unwrap().flushes, vec![200]);
        assert_eq!(log.lock().unwrap().indexed, 3);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [WorkEvent::BatchFlushed {
                worker: 0,
                pending_bytes: 200
            }]
        ));

        worker.close().unwrap();
        assert_eq!(log.lock().unwrap().flushes, vec![200, 100]);
    }

    #[test]
    fn test_accepts_dat_and_xml_only() {
        assert!(is_dat_file(Path::new("a/b.dat")));
        assert!(is_dat_file(Path::new("b.XML")));
        assert!(!is_dat_file(Path::new("b.zip")));
        assert!(!is_dat_file(Path::new("dat")));
    }
}
