use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Events emitted while walking a tree of files
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WorkEvent {
    Started {
        root: PathBuf,
        workers: usize,
    },
    FileCompleted {
        path: PathBuf,
        size: u64,
    },
    FileFailed {
        path: PathBuf,
        error: String,
    },
    BatchFlushed {
        worker: usize,
        pending_bytes: u64,
    },
    Summary {
        discovered_files: u64,
        processed_files: u64,
        failed_files: u64,
        total_bytes: u64,
        cancelled: bool,
        duration_ms: u128,
        files_per_sec: f64,
    },
}

pub trait ProgressSink<E>: Send + Sync + 'static {
    fn emit(&self, event: E);
}

impl<E> ProgressSink<E> for ()
where
    E: Send,
{
    fn emit(&self, _event: E) {}
}

impl<E, F> ProgressSink<E> for F
where
    E: Send,
    F: Fn(E) + Send + Sync + 'static,
{
    fn emit(&self, event: E) {
        (self)(event);
    }
}

/// Shared counters for a running walk, written by every worker.
pub struct WorkProgress {
    pub discovered: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub bytes: AtomicU64,
    pub start_time: Instant,
    cancelled: AtomicBool,
    sink: Option<Arc<dyn ProgressSink<WorkEvent>>>,
}

impl Default for WorkProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkProgress {
    pub fn new() -> Self {
        Self {
            discovered: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            start_time: Instant::now(),
            cancelled: AtomicBool::new(false),
            sink: None,
        }
    }

    pub fn with_sink(sink: Arc<dyn ProgressSink<WorkEvent>>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    pub fn emit(&self, event: WorkEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    pub fn file_discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_completed(&self, path: PathBuf, size: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.emit(WorkEvent::FileCompleted { path, size });
    }

    pub fn file_failed(&self, path: PathBuf, error: String) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.emit(WorkEvent::FileFailed { path, error });
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> WorkSummary {
        WorkSummary {
            discovered: self.discovered.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
        }
    }
}

/// Totals for a finished walk
#[derive(Debug, Clone, PartialEq)]
pub struct WorkSummary {
    pub discovered: u64,
    pub processed: u64,
    pub failed: u64,
    pub bytes: u64,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl WorkSummary {
    pub fn files_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }

    pub fn to_event(&self) -> WorkEvent {
        WorkEvent::Summary {
            discovered_files: self.discovered,
            processed_files: self.processed,
            failed_files: self.failed,
            total_bytes: self.bytes,
            cancelled: self.cancelled,
            duration_ms: self.elapsed.as_millis(),
            files_per_sec: self.files_per_sec(),
        }
    }
}

impl std::fmt::Display for WorkSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed {} of {} files ({} failed, {} bytes) in {:.1}s",
            self.processed,
            self.discovered,
            self.failed,
            self.bytes,
            self.elapsed.as_secs_f64()
        )?;
        if self.cancelled {
            write!(f, ", cancelled")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_counters_and_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink: Arc<dyn ProgressSink<WorkEvent>> = Arc::new(move |event: WorkEvent| {
            seen_clone.lock().unwrap().push(event);
        });

        let progress = WorkProgress::with_sink(sink);
        progress.file_discovered();
        progress.file_discovered();
        progress.file_completed(PathBuf::from("a.dat"), 10);
        progress.file_failed(PathBuf::from("b.dat"), "boom".to_string());

        let summary = progress.summary();
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.bytes, 10);
        assert!(!summary.cancelled);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_event_json_shape() {
        let event = WorkEvent::FileFailed {
            path: PathBuf::from("x.dat"),
            error: "bad".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "FileFailed");
        assert_eq!(json["path"], "x.dat");
    }
}
