//! CPU-bound work moved off the transfer threads.
//!
//! Digest computation and chunk decryption run through an [`Offloader`].
//! With one or more workers the job goes to a dedicated pool and its result
//! comes back later through [`OffloadResults`]; with zero workers the job
//! runs on the submitting thread and the result is returned directly.
//!
//! ```text
//!   submit(job) ──► WorkQueue ──► pool thread ──► run() ──► mpsc ──► poller
//!        │
//!        └── (inline) run() ──► Some(output)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::checksum::file_matches_md5;
use super::descriptor::ChunkOffsets;
use super::queue::WorkQueue;
use crate::crypto::ChunkCipher;
use crate::error::{DownloadError, DownloadResult};
use crate::remote::{RemoteEntity, AES_BLOCK_SIZE};

/// How long pool threads wait for work before re-checking the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A unit of offloaded work, keyed by the local path it belongs to.
pub trait OffloadJob: Send + 'static {
    type Output: Send + 'static;

    fn key(&self) -> &Path;

    fn run(self) -> Self::Output;
}

/// Accepts jobs without waiting for them to finish.
pub trait Offloader<J: OffloadJob>: Send + Sync {
    /// Hand over a job.
    ///
    /// Returns the output when the job ran on the caller's thread, `None`
    /// when it was queued and the output will arrive on the results channel.
    fn submit(&self, job: J) -> Option<J::Output>;

    /// Jobs queued but not yet picked up.
    fn backlog(&self) -> usize {
        0
    }

    /// Run every queued job, then join any pool threads.
    fn finish(&self) {}

    /// Join any pool threads, discarding jobs that have not started.
    fn shutdown(&self);
}

/// Runs each job on the submitting thread.
#[derive(Debug, Default)]
pub struct InlineOffloader;

impl<J: OffloadJob> Offloader<J> for InlineOffloader {
    fn submit(&self, job: J) -> Option<J::Output> {
        Some(job.run())
    }

    fn shutdown(&self) {}
}

/// Runs jobs on a fixed pool of named threads.
pub struct PooledOffloader<J: OffloadJob> {
    name: String,
    jobs: Arc<WorkQueue<J>>,
    stop: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: OffloadJob> PooledOffloader<J> {
    /// Start `workers` threads that send `(key, output)` pairs to `done`.
    pub fn start(
        workers: usize,
        name: &str,
        done: Sender<(PathBuf, J::Output)>,
    ) -> DownloadResult<Self> {
        let jobs = Arc::new(WorkQueue::new());
        let stop = Arc::new(AtomicBool::new(false));
        let draining = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let jobs = Arc::clone(&jobs);
            let stop = Arc::clone(&stop);
            let draining = Arc::clone(&draining);
            let done = done.clone();

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || offload_loop(&jobs, &stop, &draining, &done))
                .map_err(|e| DownloadError::io(Path::new(name), e))?;
            handles.push(handle);
        }

        debug!(pool = name, workers, "Started offload pool");

        Ok(Self {
            name: name.to_string(),
            jobs,
            stop,
            draining,
            handles: Mutex::new(handles),
        })
    }

    fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(pool = %self.name, "Offload thread panicked");
            }
        }
    }
}

/// Pool thread body. A draining pool exits once the queue stays empty for
/// one poll interval; a stopped pool exits immediately.
fn offload_loop<J: OffloadJob>(
    jobs: &WorkQueue<J>,
    stop: &AtomicBool,
    draining: &AtomicBool,
    done: &Sender<(PathBuf, J::Output)>,
) {
    while !stop.load(Ordering::SeqCst) {
        let Some(job) = jobs.pop_timeout(POLL_INTERVAL) else {
            if draining.load(Ordering::SeqCst) {
                break;
            }
            continue;
        };
        let key = job.key().to_path_buf();
        let output = job.run();
        if done.send((key, output)).is_err() {
            // Nobody is listening any more.
            break;
        }
    }
}

impl<J: OffloadJob> Offloader<J> for PooledOffloader<J> {
    fn submit(&self, job: J) -> Option<J::Output> {
        self.jobs.push(job);
        None
    }

    fn backlog(&self) -> usize {
        self.jobs.len()
    }

    fn finish(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.join();
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.join();

        let mut discarded = 0;
        while self.jobs.pop_timeout(Duration::ZERO).is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(pool = %self.name, discarded, "Discarded queued offload jobs");
        }
    }
}

impl<J: OffloadJob> Drop for PooledOffloader<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Receiving end of a pooled offloader.
#[derive(Debug)]
pub struct OffloadResults<O> {
    done: Mutex<Receiver<(PathBuf, O)>>,
}

impl<O> OffloadResults<O> {
    pub fn new(done: Receiver<(PathBuf, O)>) -> Self {
        Self {
            done: Mutex::new(done),
        }
    }

    /// Next finished result, if one is ready.
    pub fn try_pop_done(&self) -> Option<(PathBuf, O)> {
        self.done.lock().try_recv().ok()
    }

    /// Wait up to `timeout` for the next finished result.
    pub fn wait_done(&self, timeout: Duration) -> Option<(PathBuf, O)> {
        match self.done.lock().recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // Pool is gone; keep the caller's loop from spinning.
                thread::sleep(timeout);
                None
            }
        }
    }
}

/// Build an offloader with `workers` threads.
///
/// Zero workers gives an [`InlineOffloader`] and no results channel.
pub fn offloader<J: OffloadJob>(
    workers: usize,
    name: &str,
) -> DownloadResult<(Box<dyn Offloader<J>>, Option<OffloadResults<J::Output>>)> {
    if workers == 0 {
        return Ok((Box::new(InlineOffloader), None));
    }

    let (tx, rx) = mpsc::channel();
    let pool = PooledOffloader::start(workers, name, tx)?;
    Ok((Box::new(pool), Some(OffloadResults::new(rx))))
}

// =============================================================================
// Jobs
// =============================================================================

/// Compare a local file's MD5 with an expected digest.
///
/// Output is `true` on a match. A file that cannot be read does not match.
#[derive(Debug, Clone)]
pub struct ChecksumJob {
    pub path: PathBuf,
    pub expected: String,
}

impl ChecksumJob {
    pub fn new(path: impl Into<PathBuf>, expected: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expected: expected.into(),
        }
    }
}

impl OffloadJob for ChecksumJob {
    type Output = bool;

    fn key(&self) -> &Path {
        &self.path
    }

    fn run(self) -> bool {
        match file_matches_md5(&self.path, &self.expected) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not digest local file");
                false
            }
        }
    }
}

/// A decrypted chunk ready to be written.
#[derive(Debug)]
pub struct DecryptedChunk {
    pub offsets: ChunkOffsets,
    pub plaintext: Vec<u8>,
}

/// Decrypt one fetched chunk.
///
/// `data` is the fetched range, including the IV block that precedes every
/// chunk after the first.
pub struct DecryptJob {
    pub path: PathBuf,
    pub offsets: ChunkOffsets,
    pub data: Vec<u8>,
    pub entity: Arc<RemoteEntity>,
    pub cipher: Arc<dyn ChunkCipher>,
}

impl OffloadJob for DecryptJob {
    type Output = DownloadResult<DecryptedChunk>;

    fn key(&self) -> &Path {
        &self.path
    }

    fn run(self) -> Self::Output {
        let fail = |reason: String| DownloadError::Decrypt {
            path: self.path.clone(),
            chunk: self.offsets.chunk_num,
            reason,
        };

        let encryption = self
            .entity
            .encryption()
            .ok_or_else(|| fail("entity has no encryption metadata".to_string()))?;

        let prefix = self.offsets.iv_prefix_len() as usize;
        if prefix > 0 && (prefix != AES_BLOCK_SIZE as usize || self.data.len() < prefix) {
            return Err(fail(format!("bad IV prefix of {} bytes", prefix)));
        }
        let (iv, ciphertext) = if prefix == 0 {
            (encryption.content_iv.as_slice(), self.data.as_slice())
        } else {
            self.data.split_at(prefix)
        };

        let plaintext = self
            .cipher
            .decrypt(ciphertext, &encryption.symmetric_key, iv, self.offsets.unpad)
            .map_err(|e| fail(e.to_string()))?;

        Ok(DecryptedChunk {
            offsets: self.offsets,
            plaintext,
        })
    }
}
