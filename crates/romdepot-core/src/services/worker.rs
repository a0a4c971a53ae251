//! Concurrent tree walk driving a pool of workers.

use super::progress::{WorkEvent, WorkProgress, WorkSummary};
use anyhow::Result;
use crossbeam_channel::bounded;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use walkdir::WalkDir;

/// Files queued per worker before the walk blocks
const QUEUE_DEPTH: usize = 4;

/// Processes files on one thread. Never shared between threads.
pub trait Worker {
    fn process(&mut self, path: &Path, size: u64) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Decides which files are walked and builds the workers that process them.
pub trait Master: Sync {
    type Worker: Worker;

    fn accept(&self, path: &Path) -> bool;

    fn new_worker(&self, index: usize) -> Result<Self::Worker>;

    fn num_workers(&self) -> usize;

    fn progress(&self) -> &WorkProgress;

    /// Runs once after every worker has closed, including after cancellation.
    fn finish_up(&self) -> Result<()>;
}

#[derive(Default)]
struct FirstError(Mutex<Option<anyhow::Error>>);

impl FirstError {
    fn record(&self, err: anyhow::Error) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(self) -> Option<anyhow::Error> {
        self.0.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

/// Walk `root`, handing every accepted file to the master's workers.
///
/// A failing file is logged and counted; the walk carries on and the first
/// failure is returned once the master has finished up. Setting `cancel`
/// stops new files from being handed out while in-flight files complete.
pub fn work<M: Master>(root: &Path, master: &M, cancel: &AtomicBool) -> Result<WorkSummary> {
    let progress = master.progress();
    let num_workers = master.num_workers().max(1);
    let first_error = FirstError::default();

    progress.emit(WorkEvent::Started {
        root: root.to_path_buf(),
        workers: num_workers,
    });
    tracing::info!(root = %root.display(), workers = num_workers, "starting walk");

    let (tx, rx) = bounded::<(PathBuf, u64)>(num_workers * QUEUE_DEPTH);

    thread::scope(|scope| {
        for index in 0..num_workers {
            let rx = rx.clone();
            let first_error = &first_error;
            scope.spawn(move || {
                let mut worker = match master.new_worker(index) {
                    Ok(worker) => worker,
                    Err(e) => {
                        tracing::error!(worker = index, error = %e, "failed to start worker");
                        first_error.record(e);
                        return;
                    }
                };

                for (path, size) in rx.iter() {
                    if cancel.load(Ordering::SeqCst) {
                        progress.mark_cancelled();
                        break;
                    }
                    match worker.process(&path, size) {
                        Ok(()) => progress.file_completed(path, size),
                        Err(e) => {
                            let message = format!("{e:#}");
                            tracing::error!(path = %path.display(), error = %message, "failed to process file");
                            progress.file_failed(path, message);
                            first_error.record(e);
                        }
                    }
                }

                if let Err(e) = worker.close() {
                    tracing::error!(worker = index, error = %e, "failed to close worker");
                    first_error.record(e);
                }
            });
        }
        drop(rx);

        for entry in WalkDir::new(root).follow_links(true) {
            if cancel.load(Ordering::SeqCst) {
                progress.mark_cancelled();
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !master.accept(entry.path()) {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            progress.file_discovered();
            if tx.send((entry.into_path(), size)).is_err() {
                // Every worker has gone away.
                break;
            }
        }
        drop(tx);
    });

    if let Err(e) = master.finish_up() {
        tracing::error!(error = %e, "failed to finish up");
        first_error.record(e);
    }

    let summary = progress.summary();
    progress.emit(summary.to_event());
    tracing::info!("{summary}");

    match first_error.take() {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct CountingMaster {
        progress: WorkProgress,
        workers: usize,
        closed: AtomicUsize,
        finished: AtomicBool,
        cancel_after_first: Option<&'static AtomicBool>,
    }

    impl CountingMaster {
        fn new(workers: usize) -> Self {
            Self {
                progress: WorkProgress::new(),
                workers,
                closed: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
                cancel_after_first: None,
            }
        }
    }

    struct CountingWorker<'a> {
        master: &'a CountingMaster,
    }

    impl Worker for CountingWorker<'_> {
        fn process(&mut self, path: &Path, _size: u64) -> Result<()> {
            if let Some(cancel) = self.master.cancel_after_first {
                cancel.store(true, Ordering::SeqCst);
            }
            if path.file_name().is_some_and(|n| n == "bad.txt") {
                bail!("cannot process {}", path.display());
            }
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.master.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl<'a> Master for &'a CountingMaster {
        type Worker = CountingWorker<'a>;

        fn accept(&self, path: &Path) -> bool {
            path.extension().is_some_and(|e| e == "txt")
        }

        fn new_worker(&self, _index: usize) -> Result<CountingWorker<'a>> {
            Ok(CountingWorker { master: *self })
        }

        fn num_workers(&self) -> usize {
            self.workers
        }

        fn progress(&self) -> &WorkProgress {
            &self.progress
        }

        fn finish_up(&self) -> Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tree(names: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        for name in names {
            fs::write(dir.path().join(name), b"data").unwrap();
        }
        dir
    }

    #[test]
    fn test_walk_filters_and_processes() {
        let dir = tree(&["a.txt", "nested/b.txt", "skip.bin"]);
        let master = CountingMaster::new(3);
        let cancel = AtomicBool::new(false);

        let summary = work(dir.path(), &&master, &cancel).unwrap();
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.bytes, 8);
        assert!(!summary.cancelled);
        assert_eq!(master.closed.load(Ordering::SeqCst), 3);
        assert!(master.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failure_does_not_stop_walk() {
        let dir = tree(&["a.txt", "bad.txt", "nested/c.txt"]);
        let master = CountingMaster::new(2);
        let cancel = AtomicBool::new(false);

        let err = work(dir.path(), &&master, &cancel).unwrap_err();
        assert!(err.to_string().contains("bad.txt"));

        let summary = master.progress.summary();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert!(master.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_still_finishes_up() {
        static CANCEL: AtomicBool = AtomicBool::new(false);
        let names: Vec<String> = (0..20).map(|i| format!("f{i}.txt")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let dir = tree(&refs);

        let mut master = CountingMaster::new(1);
        master.cancel_after_first = Some(&CANCEL);

        let summary = work(dir.path(), &&master, &CANCEL).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.processed, 1);
        assert!(master.finished.load(Ordering::SeqCst));
        assert_eq!(master.closed.load(Ordering::SeqCst), 1);
    }
}
