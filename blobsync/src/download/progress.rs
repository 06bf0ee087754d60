//! Progress reporting for download runs.
//!
//! Workers bump atomic [`TransferCounters`]; a [`ProgressReporter`] thread
//! polls them and hands snapshots to a callback, so workers never call into
//! user code.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Progress callback, invoked from the reporter thread.
pub type ProgressCallback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// Point-in-time copy of the run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Files queued for transfer.
    pub files_queued: u64,
    /// Stored bytes of the files queued for transfer.
    pub bytes_queued: u64,
    /// Bytes written to local files so far.
    pub bytes_transferred: u64,
    pub chunks_completed: u64,
    /// Files moved into place.
    pub files_completed: u64,
    /// Files left alone because they were already up to date.
    pub files_skipped: u64,
    /// Files discarded because their digest did not match.
    pub integrity_failures: u64,
    /// Local files removed because the remote no longer has them.
    pub extraneous_deleted: u64,
}

/// Shared counters for one run.
#[derive(Debug, Default)]
pub struct TransferCounters {
    files_queued: AtomicU64,
    bytes_queued: AtomicU64,
    bytes_transferred: AtomicU64,
    chunks_completed: AtomicU64,
    files_completed: AtomicU64,
    files_skipped: AtomicU64,
    integrity_failures: AtomicU64,
    extraneous_deleted: AtomicU64,
}

impl TransferCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_queued(&self, size: u64) {
        self.files_queued.fetch_add(1, Ordering::SeqCst);
        self.bytes_queued.fetch_add(size, Ordering::SeqCst);
    }

    pub fn chunk_completed(&self, bytes: u64) {
        self.chunks_completed.fetch_add(1, Ordering::SeqCst);
        self.bytes_transferred.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn file_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn extraneous_deleted(&self, count: u64) {
        self.extraneous_deleted.fetch_add(count, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_queued: self.files_queued.load(Ordering::SeqCst),
            bytes_queued: self.bytes_queued.load(Ordering::SeqCst),
            bytes_transferred: self.bytes_transferred.load(Ordering::SeqCst),
            chunks_completed: self.chunks_completed.load(Ordering::SeqCst),
            files_completed: self.files_completed.load(Ordering::SeqCst),
            files_skipped: self.files_skipped.load(Ordering::SeqCst),
            integrity_failures: self.integrity_failures.load(Ordering::SeqCst),
            extraneous_deleted: self.extraneous_deleted.load(Ordering::SeqCst),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    pub progress: ProgressSnapshot,
    pub elapsed: Duration,
}

impl DownloadSummary {
    pub fn files_downloaded(&self) -> u64 {
        self.progress.files_completed
    }

    pub fn files_skipped(&self) -> u64 {
        self.progress.files_skipped
    }

    pub fn integrity_failures(&self) -> u64 {
        self.progress.integrity_failures
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.progress.bytes_transferred
    }
}

/// Background thread that reports counter snapshots.
///
/// Sends one final snapshot when stopped. Dropping the reporter stops it.
pub struct ProgressReporter {
    handle: Option<JoinHandle<()>>,
    done: Arc<AtomicBool>,
}

impl ProgressReporter {
    /// Start a new progress reporter.
    ///
    /// # Arguments
    ///
    /// * `counters` - Shared run counters
    /// * `callback` - Function to call with each snapshot
    /// * `poll_interval` - How often to poll for updates
    pub fn start(
        counters: Arc<TransferCounters>,
        callback: Arc<ProgressCallback>,
        poll_interval: Duration,
    ) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);

        let handle = thread::spawn(move || {
            while !done_clone.load(Ordering::SeqCst) {
                callback(counters.snapshot());
                thread::sleep(poll_interval);
            }

            // Final report
            callback(counters.snapshot());
        });

        Self {
            handle: Some(handle),
            done,
        }
    }

    /// Start a reporter with default 100ms poll interval.
    pub fn start_default(counters: Arc<TransferCounters>, callback: Arc<ProgressCallback>) -> Self {
        Self::start(counters, callback, Duration::from_millis(100))
    }

    /// Stop the reporter and wait for its final report.
    pub fn stop(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.finish();
    }
}
