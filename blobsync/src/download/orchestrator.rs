//! Download run orchestration.
//!
//! [`Downloader::start`] runs one download from listing to teardown. The
//! shared run state lives in an [`Engine`] that the transfer workers and the
//! two result pollers hold on to; the maps inside it are only touched through
//! engine methods.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::decision::{check_download_conditions, DownloadAction, LocalFileState};
use super::descriptor::{ChunkOffsets, DownloadDescriptor, IntegrityOutcome};
use super::local::{delete_extraneous, ensure_local_destination, local_path_for};
use super::offload::{
    offloader, ChecksumJob, DecryptJob, DecryptedChunk, OffloadResults, Offloader,
};
use super::progress::{DownloadSummary, ProgressCallback, ProgressReporter, TransferCounters};
use super::queue::WorkQueue;
use super::worker::{WorkerPool, CRYPTO_BACKLOG_PER_WORKER};
use crate::config::{ConcurrencyOptions, DownloadSpecification};
use crate::crypto::{AesCbcCipher, ChunkCipher};
use crate::error::{DownloadError, DownloadResult};
use crate::remote::{RemoteEntity, RemoteStore};

/// How long pollers wait on their results channel per iteration.
const POLLER_INTERVAL: Duration = Duration::from_millis(100);

/// How often the orchestrator checks whether the run has drained.
const WAIT_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Engine
// =============================================================================

/// A local file waiting on a digest comparison.
#[derive(Debug, Clone)]
pub(crate) struct PendingChecksum {
    pub entity: Arc<RemoteEntity>,
    pub expected: Option<String>,
}

/// Shared state of one run.
pub(crate) struct Engine {
    pub(crate) spec: DownloadSpecification,
    pub(crate) store: Arc<dyn RemoteStore>,
    pub(crate) cipher: Arc<dyn ChunkCipher>,
    pub(crate) queue: WorkQueue<Arc<DownloadDescriptor>>,
    pub(crate) counters: Arc<TransferCounters>,
    pub(crate) crypto: Box<dyn Offloader<DecryptJob>>,
    crypto_backlog_limit: usize,
    crypto_results: Option<OffloadResults<DownloadResult<DecryptedChunk>>>,
    checksum: Box<dyn Offloader<ChecksumJob>>,
    checksum_results: Option<OffloadResults<bool>>,
    /// Local paths between admission and finalize (or skip).
    active: Mutex<HashSet<PathBuf>>,
    /// Every local path a listed entity maps to.
    listed: Mutex<HashSet<PathBuf>>,
    descriptors: DashMap<PathBuf, Arc<DownloadDescriptor>>,
    checksum_pending: DashMap<PathBuf, PendingChecksum>,
    all_remote_processed: AtomicBool,
    terminate: AtomicBool,
    interrupt: Arc<AtomicBool>,
    fault: Mutex<Option<DownloadError>>,
}

impl Engine {
    pub(crate) fn new(
        spec: DownloadSpecification,
        store: Arc<dyn RemoteStore>,
        cipher: Arc<dyn ChunkCipher>,
        concurrency: &ConcurrencyOptions,
        counters: Arc<TransferCounters>,
        interrupt: Arc<AtomicBool>,
    ) -> DownloadResult<Self> {
        let (checksum, checksum_results) = offloader(concurrency.checksum_workers, "md5")?;
        let (crypto, crypto_results) = offloader(concurrency.crypto_workers, "crypto")?;

        Ok(Self {
            spec,
            store,
            cipher,
            queue: WorkQueue::new(),
            counters,
            crypto,
            crypto_backlog_limit: concurrency
                .crypto_workers
                .saturating_mul(CRYPTO_BACKLOG_PER_WORKER),
            crypto_results,
            checksum,
            checksum_results,
            active: Mutex::new(HashSet::new()),
            listed: Mutex::new(HashSet::new()),
            descriptors: DashMap::new(),
            checksum_pending: DashMap::new(),
            all_remote_processed: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            interrupt,
            fault: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Termination
    // -------------------------------------------------------------------------

    fn is_stopping(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
            || self.interrupt.load(Ordering::SeqCst)
            || self.fault.lock().is_some()
    }

    fn is_drained(&self) -> bool {
        self.all_remote_processed.load(Ordering::SeqCst) && self.active.lock().is_empty()
    }

    /// Transfer workers and the decryption poller stop when this is true.
    pub(crate) fn termination_check(&self) -> bool {
        self.is_stopping() || self.is_drained()
    }

    /// The checksum poller stops when this is true.
    pub(crate) fn termination_check_checksum(&self) -> bool {
        self.is_stopping()
            || (self.all_remote_processed.load(Ordering::SeqCst)
                && self.checksum_pending.is_empty())
    }

    pub(crate) fn request_stop(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_listing_complete(&self) {
        self.all_remote_processed.store(true, Ordering::SeqCst);
    }

    /// Record a fatal error. The first one wins; every fault stops the run.
    pub(crate) fn record_fault(&self, err: DownloadError) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                error!(error = %err, "Download run failed");
                *fault = Some(err);
            } else {
                debug!(error = %err, "Additional fault after run failure");
            }
        }
        self.request_stop();
    }

    fn has_fault(&self) -> bool {
        self.fault.lock().is_some()
    }

    pub(crate) fn take_fault(&self) -> Option<DownloadError> {
        self.fault.lock().take()
    }

    // -------------------------------------------------------------------------
    // Active set
    // -------------------------------------------------------------------------

    /// Claim `path` for this run. `false` if it is already in flight.
    pub(crate) fn admit(&self, path: &Path) -> bool {
        self.active.lock().insert(path.to_path_buf())
    }

    fn release(&self, path: &Path) {
        self.active.lock().remove(path);
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub(crate) fn listed_paths(&self) -> HashSet<PathBuf> {
        self.listed.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Listing and routing
    // -------------------------------------------------------------------------

    /// Decide what to do with one listed entity and route it.
    pub(crate) fn process_entity(&self, entity: RemoteEntity) -> DownloadResult<()> {
        let local_path = local_path_for(&self.spec.destination, entity.name())?;
        self.listed.lock().insert(local_path.clone());

        if entity.is_encrypted() && self.spec.options.decryption_key.is_none() {
            return Err(DownloadError::MissingDecryptionKey {
                location: entity.location().to_string(),
            });
        }

        let local = LocalFileState::probe(&local_path);
        let action = check_download_conditions(local.as_ref(), &entity, &self.spec);
        debug!(
            location = entity.location(),
            path = %local_path.display(),
            ?action,
            "Download decision"
        );

        if action == DownloadAction::Skip {
            self.counters.file_skipped();
            return Ok(());
        }

        if !self.admit(&local_path) {
            warn!(
                location = entity.location(),
                path = %local_path.display(),
                "Skipping duplicate entity for a path already in flight"
            );
            return Ok(());
        }

        let entity = Arc::new(entity);
        match action {
            DownloadAction::CheckMd5 => self.register_pending_checksum(&local_path, entity),
            _ => self.add_to_download_queue(&local_path, entity),
        }
    }

    /// Queue an admitted path for transfer.
    ///
    /// Empty entities have nothing to fetch and are finalized on the spot.
    pub(crate) fn add_to_download_queue(
        &self,
        path: &Path,
        entity: Arc<RemoteEntity>,
    ) -> DownloadResult<()> {
        let descriptor = Arc::new(DownloadDescriptor::new(path, entity, &self.spec.options)?);
        self.counters.file_queued(descriptor.entity().size());

        if descriptor.total_chunks() == 0 {
            return self.finish_file(&descriptor);
        }

        self.descriptors
            .insert(path.to_path_buf(), Arc::clone(&descriptor));
        self.queue.push(descriptor);
        Ok(())
    }

    /// Start a digest comparison for an admitted path.
    pub(crate) fn register_pending_checksum(
        &self,
        path: &Path,
        entity: Arc<RemoteEntity>,
    ) -> DownloadResult<()> {
        let expected = entity.expected_md5().map(str::to_string);
        self.checksum_pending.insert(
            path.to_path_buf(),
            PendingChecksum {
                entity,
                expected: expected.clone(),
            },
        );

        let Some(expected) = expected else {
            // Nothing to compare against.
            return self.resolve_checksum(path, false);
        };

        match self.checksum.submit(ChecksumJob::new(path, expected)) {
            Some(matched) => self.resolve_checksum(path, matched),
            None => Ok(()),
        }
    }

    /// Apply a finished digest comparison.
    pub(crate) fn resolve_checksum(&self, path: &Path, matched: bool) -> DownloadResult<()> {
        let Some((_, pending)) = self.checksum_pending.remove(path) else {
            warn!(path = %path.display(), "Checksum result for unknown path");
            return Ok(());
        };

        if matched {
            debug!(path = %path.display(), "Local file matches remote digest");
            self.release(path);
            self.counters.file_skipped();
            Ok(())
        } else {
            debug!(
                path = %path.display(),
                expected = ?pending.expected,
                "Local file differs from remote digest"
            );
            self.add_to_download_queue(path, pending.entity)
        }
    }

    // -------------------------------------------------------------------------
    // Chunk completion
    // -------------------------------------------------------------------------

    /// Write a finished chunk and finalize the file if it was the last one.
    pub(crate) fn complete_chunk(
        &self,
        descriptor: &DownloadDescriptor,
        offsets: &ChunkOffsets,
        data: &[u8],
    ) -> DownloadResult<()> {
        descriptor.write_chunk(offsets, data)?;
        self.counters.chunk_completed(data.len() as u64);

        if descriptor.mark_chunk_complete() {
            self.finish_file(descriptor)?;
        }
        Ok(())
    }

    fn finish_file(&self, descriptor: &DownloadDescriptor) -> DownloadResult<()> {
        let path = descriptor.local_path();

        match descriptor.verify_integrity(self.spec.options.check_file_md5)? {
            IntegrityOutcome::Mismatch { expected, actual } => {
                error!(
                    path = %path.display(),
                    expected = %expected,
                    actual = %actual,
                    "Downloaded file failed integrity check, discarding"
                );
                descriptor.discard()?;
                self.counters.integrity_failure();
            }
            outcome => {
                descriptor.finalize(self.spec.options.restore_file_attributes)?;
                self.counters.file_completed();
                let verified = outcome == IntegrityOutcome::Verified;
                info!(path = %path.display(), verified, "Download complete");
            }
        }

        self.descriptors.remove(path);
        self.release(path);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Result pollers
    // -------------------------------------------------------------------------

    fn has_checksum_pool(&self) -> bool {
        self.checksum_results.is_some()
    }

    fn has_crypto_pool(&self) -> bool {
        self.crypto_results.is_some()
    }

    /// Drain digest results until the checksum side is done.
    fn drain_checksum_results(&self) {
        let Some(results) = self.checksum_results.as_ref() else {
            return;
        };
        while !self.termination_check_checksum() {
            if let Some((path, matched)) = results.wait_done(POLLER_INTERVAL) {
                if let Err(e) = self.resolve_checksum(&path, matched) {
                    self.record_fault(e);
                }
            }
        }
    }

    /// Drain decrypted chunks until the run is done.
    fn drain_decryption_results(&self) {
        let Some(results) = self.crypto_results.as_ref() else {
            return;
        };
        while !self.termination_check() {
            if let Some((path, result)) = results.wait_done(POLLER_INTERVAL) {
                if let Err(e) = result.and_then(|chunk| self.complete_decrypted(&path, chunk)) {
                    self.record_fault(e);
                }
            }
        }
    }

    fn complete_decrypted(&self, path: &Path, chunk: DecryptedChunk) -> DownloadResult<()> {
        let descriptor = self
            .descriptors
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DownloadError::Decrypt {
                path: path.to_path_buf(),
                chunk: chunk.offsets.chunk_num,
                reason: "no download in progress for this path".to_string(),
            })?;
        self.complete_chunk(&descriptor, &chunk.offsets, &chunk.plaintext)
    }

    /// Whether the decryption pool already holds enough fetched chunks.
    pub(crate) fn crypto_saturated(&self) -> bool {
        self.has_crypto_pool() && self.crypto.backlog() >= self.crypto_backlog_limit
    }

    /// Stop both pools, discarding queued jobs.
    pub(crate) fn shutdown_offloaders(&self) {
        self.checksum.shutdown();
        self.crypto.shutdown();
    }

    /// Stop both pools after the transfer workers have exited.
    ///
    /// Queued decryptions still run and their chunks are written, so no
    /// fetched chunk is lost. Pending digest comparisons are discarded.
    fn finish_offloaders(&self) {
        self.checksum.shutdown();
        self.crypto.finish();

        let Some(results) = self.crypto_results.as_ref() else {
            return;
        };
        let mut written = 0u64;
        while let Some((path, result)) = results.try_pop_done() {
            match result.and_then(|chunk| self.complete_decrypted(&path, chunk)) {
                Ok(()) => written += 1,
                Err(e) => self.record_fault(e),
            }
        }
        if written > 0 {
            debug!(chunks = written, "Wrote decrypted chunks left after stop");
        }
    }
}

// =============================================================================
// Downloader
// =============================================================================

/// Requests that a running download stop.
///
/// Cheap to clone; safe to trigger from a signal handler thread.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs download specifications against a remote store.
pub struct Downloader {
    spec: DownloadSpecification,
    store: Arc<dyn RemoteStore>,
    concurrency: ConcurrencyOptions,
    cipher: Arc<dyn ChunkCipher>,
    progress: Option<Arc<ProgressCallback>>,
    interrupt: Arc<AtomicBool>,
}

impl Downloader {
    /// Create a downloader with default concurrency and AES-256-CBC.
    pub fn new(spec: DownloadSpecification, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            spec,
            store,
            concurrency: ConcurrencyOptions::default(),
            cipher: Arc::new(AesCbcCipher::new()),
            progress: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyOptions) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn ChunkCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Report progress snapshots every 100ms while running.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn specification(&self) -> &DownloadSpecification {
        &self.spec
    }

    /// Handle that makes [`Downloader::start`] stop early with
    /// [`DownloadError::Interrupted`].
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.interrupt))
    }

    /// Run the download.
    ///
    /// Blocks until every listed entity has been skipped, verified or
    /// downloaded, a fatal error occurs, or the run is interrupted. All
    /// threads started for the run are joined before this returns. Partial
    /// temporary files are left behind on error.
    pub fn start(&self) -> DownloadResult<DownloadSummary> {
        let started = Instant::now();
        let destination = &self.spec.destination;

        info!(
            destination = %destination.display(),
            sources = self.spec.sources.len(),
            transfer_threads = self.concurrency.transfer_threads,
            checksum_workers = self.concurrency.checksum_workers,
            crypto_workers = self.concurrency.crypto_workers,
            "Starting download run"
        );

        ensure_local_destination(destination)?;

        let counters = Arc::new(TransferCounters::new());
        let reporter = self.progress.as_ref().map(|callback| {
            ProgressReporter::start_default(Arc::clone(&counters), Arc::clone(callback))
        });

        let engine = Arc::new(Engine::new(
            self.spec.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.cipher),
            &self.concurrency,
            Arc::clone(&counters),
            Arc::clone(&self.interrupt),
        )?);

        let workers = match WorkerPool::start(self.concurrency.transfer_threads, &engine) {
            Ok(workers) => workers,
            Err(e) => {
                engine.shutdown_offloaders();
                return Err(e);
            }
        };
        let pollers = spawn_pollers(&engine);

        if let Err(e) = self.list_and_route(&engine) {
            engine.record_fault(e);
        }
        engine.mark_listing_complete();
        debug!("Listing complete");

        wait_for_completion(&engine);

        // Teardown runs on every path. Transfer workers go first so nothing
        // new reaches the pools while they wind down.
        let worker_result = workers.wait(true);
        let poller_result = join_pollers(pollers);
        if engine.has_fault() {
            engine.shutdown_offloaders();
        } else {
            engine.finish_offloaders();
        }

        if let Some(fault) = engine.take_fault() {
            return Err(fault);
        }
        worker_result?;
        poller_result?;

        if self.interrupt.load(Ordering::SeqCst) {
            warn!("Download run interrupted, partial files left in place");
            return Err(DownloadError::Interrupted);
        }

        if self.spec.options.delete_extraneous_destination {
            let removed = delete_extraneous(destination, &engine.listed_paths())?;
            counters.extraneous_deleted(removed);
            info!(removed, "Deleted extraneous destination files");
        }

        drop(reporter);

        let summary = DownloadSummary {
            progress: counters.snapshot(),
            elapsed: started.elapsed(),
        };
        info!(
            downloaded = summary.files_downloaded(),
            skipped = summary.files_skipped(),
            integrity_failures = summary.integrity_failures(),
            bytes = summary.bytes_transferred(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Download run finished"
        );
        Ok(summary)
    }

    fn list_and_route(&self, engine: &Engine) -> DownloadResult<()> {
        for source in &self.spec.sources {
            debug!(source = %source, "Listing source");
            for entity in self.store.list(source, &self.spec.options)? {
                if engine.is_stopping() {
                    return Ok(());
                }
                engine.process_entity(entity?)?;
            }
        }
        Ok(())
    }
}

fn spawn_pollers(engine: &Arc<Engine>) -> Vec<(&'static str, JoinHandle<()>)> {
    let mut pollers = Vec::new();
    if engine.has_checksum_pool() {
        pollers.extend(spawn_poller(engine, "md5-poller", Engine::drain_checksum_results));
    }
    if engine.has_crypto_pool() {
        pollers.extend(spawn_poller(engine, "crypto-poller", Engine::drain_decryption_results));
    }
    pollers
}

fn spawn_poller(
    engine: &Arc<Engine>,
    name: &'static str,
    run: fn(&Engine),
) -> Option<(&'static str, JoinHandle<()>)> {
    let poller_engine = Arc::clone(engine);
    match thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run(&poller_engine))
    {
        Ok(handle) => Some((name, handle)),
        Err(e) => {
            engine.record_fault(DownloadError::WorkerPanicked(format!(
                "{} could not be spawned: {}",
                name, e
            )));
            None
        }
    }
}

fn join_pollers(pollers: Vec<(&'static str, JoinHandle<()>)>) -> DownloadResult<()> {
    let mut result = Ok(());
    for (name, handle) in pollers {
        if handle.join().is_err() && result.is_ok() {
            result = Err(DownloadError::WorkerPanicked(name.to_string()));
        }
    }
    result
}

/// Block until the run drains, fails or is interrupted, then stop it.
fn wait_for_completion(engine: &Engine) {
    loop {
        if engine.interrupt.load(Ordering::SeqCst) {
            info!("Interrupt received, stopping download run");
            break;
        }
        if engine.is_stopping() || engine.is_drained() {
            break;
        }
        thread::sleep(WAIT_INTERVAL);
    }
    engine.request_stop();
}
