//! Transfer threads.
//!
//! Each worker repeatedly takes a descriptor off the download queue, claims
//! its next chunk, puts the descriptor back if it still has chunks to hand
//! out, and fetches the claimed range. Several workers can therefore work on
//! the same file at once.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use super::offload::DecryptJob;
use super::orchestrator::Engine;
use crate::error::{DownloadError, DownloadResult};

/// How long a worker waits on an empty queue before re-checking for
/// termination.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fetched-but-undecrypted chunks allowed per decryption thread.
///
/// Each queued job holds one chunk of ciphertext, so the decryption backlog
/// stays near `crypto_workers * CRYPTO_BACKLOG_PER_WORKER * chunk_size`
/// bytes, plus one chunk per transfer thread that passed the check at the
/// same moment. Workers leave encrypted files alone while the backlog is
/// full and keep fetching plain ones.
pub const CRYPTO_BACKLOG_PER_WORKER: usize = 4;

/// Pause before retrying an encrypted file while decryption is behind.
const BACKLOG_WAIT: Duration = Duration::from_millis(5);

/// Fixed pool of transfer threads.
pub(crate) struct WorkerPool {
    engine: Arc<Engine>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WorkerPool {
    /// Spawn `threads` workers against `engine`.
    pub(crate) fn start(threads: usize, engine: &Arc<Engine>) -> DownloadResult<Self> {
        let mut pool = Self {
            engine: Arc::clone(engine),
            handles: Vec::with_capacity(threads),
        };

        for index in 0..threads {
            let name = format!("transfer-{}", index);
            let worker_engine = Arc::clone(engine);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&worker_engine));

            match spawned {
                Ok(handle) => pool.handles.push((name, handle)),
                Err(e) => {
                    let _ = pool.wait(true);
                    return Err(DownloadError::WorkerPanicked(format!(
                        "{} could not be spawned: {}",
                        name, e
                    )));
                }
            }
        }

        debug!(threads, "Started transfer workers");
        Ok(pool)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Join every worker.
    ///
    /// With `terminate` set the engine is told to stop first; otherwise the
    /// workers exit on their own once the run drains.
    pub(crate) fn wait(self, terminate: bool) -> DownloadResult<()> {
        if terminate {
            self.engine.request_stop();
        }

        let mut panicked = None;
        for (name, handle) in self.handles {
            if handle.join().is_err() && panicked.is_none() {
                panicked = Some(name);
            }
        }

        match panicked {
            Some(name) => Err(DownloadError::WorkerPanicked(name)),
            None => Ok(()),
        }
    }
}

fn worker_loop(engine: &Engine) {
    while !engine.termination_check() {
        if let Err(e) = worker_iteration(engine) {
            engine.record_fault(e);
        }
    }
}

/// One scheduling step of a transfer worker.
///
/// Returns `Ok(true)` when a chunk was fetched.
pub(crate) fn worker_iteration(engine: &Engine) -> DownloadResult<bool> {
    let Some(descriptor) = engine.queue.pop_timeout(QUEUE_POLL_INTERVAL) else {
        return Ok(false);
    };

    if descriptor.entity().is_encrypted() && engine.crypto_saturated() {
        engine.queue.push(descriptor);
        thread::sleep(BACKLOG_WAIT);
        return Ok(false);
    }

    // Another worker may have claimed the last chunk since this descriptor
    // was queued.
    let Some(offsets) = descriptor.next_offsets() else {
        return Ok(false);
    };

    if descriptor.has_remaining_chunks() {
        engine.queue.push(Arc::clone(&descriptor));
    }

    let entity = descriptor.entity();
    let data = engine
        .store
        .fetch_range(entity, offsets.range_start, offsets.range_len)?;
    if data.len() as u64 != offsets.range_len {
        return Err(DownloadError::ShortRead {
            location: entity.location().to_string(),
            expected: offsets.range_len,
            actual: data.len() as u64,
        });
    }

    trace!(
        location = entity.location(),
        chunk = offsets.chunk_num,
        bytes = data.len(),
        "Fetched chunk"
    );

    if entity.is_encrypted() {
        let job = DecryptJob {
            path: descriptor.local_path().to_path_buf(),
            offsets,
            data,
            entity: Arc::clone(entity),
            cipher: Arc::clone(&engine.cipher),
        };
        // Pooled decryption completes the chunk from the decryption poller.
        if let Some(result) = engine.crypto.submit(job) {
            let chunk = result?;
            engine.complete_chunk(&descriptor, &chunk.offsets, &chunk.plaintext)?;
        }
    } else {
        engine.complete_chunk(&descriptor, &offsets, &data)?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ConcurrencyOptions, DecryptionKey, DownloadOptions, DownloadSpecification,
    };
    use crate::crypto::{AesCbcCipher, ChunkCipher, CipherError};
    use crate::download::progress::TransferCounters;
    use crate::remote::{MemoryStore, RemoteEntity, RemoteStore};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts decrypt calls.
    #[derive(Default)]
    struct CountingCipher {
        inner: AesCbcCipher,
        calls: AtomicUsize,
    }

    impl ChunkCipher for CountingCipher {
        fn decrypt(
            &self,
            ciphertext: &[u8],
            key: &[u8],
            iv: &[u8],
            unpad: bool,
        ) -> Result<Vec<u8>, CipherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.decrypt(ciphertext, key, iv, unpad)
        }
    }

    fn engine(
        dest: &TempDir,
        store: Arc<dyn RemoteStore>,
        cipher: Arc<dyn ChunkCipher>,
        chunk_size: u64,
    ) -> Arc<Engine> {
        engine_with_crypto(dest, store, cipher, chunk_size, 0)
    }

    fn engine_with_crypto(
        dest: &TempDir,
        store: Arc<dyn RemoteStore>,
        cipher: Arc<dyn ChunkCipher>,
        chunk_size: u64,
        crypto_workers: usize,
    ) -> Arc<Engine> {
        let spec = DownloadSpecification::new(dest.path()).with_options(
            DownloadOptions::default()
                .with_chunk_size(chunk_size)
                .with_decryption_key(DecryptionKey::new(b"private".to_vec())),
        );
        Arc::new(
            Engine::new(
                spec,
                store,
                cipher,
                &ConcurrencyOptions::new(1, 0, crypto_workers),
                Arc::new(TransferCounters::new()),
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_inline_decrypt_one_chunk_per_iteration() {
        let dest = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let plaintext: Vec<u8> = (0..20u8).collect();
        let entity = store
            .put_encrypted("cont", "secret.bin", &plaintext, &[5u8; 32], &[6u8; 16])
            .unwrap();
        assert_eq!(entity.size(), 32);

        let cipher = Arc::new(CountingCipher::default());
        let engine = engine(&dest, store.clone(), cipher.clone(), 16);
        let local = dest.path().join("secret.bin");
        engine.admit(&local);
        engine
            .add_to_download_queue(&local, Arc::new(entity))
            .unwrap();

        assert!(worker_iteration(&engine).unwrap());
        assert_eq!(cipher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.counters.snapshot().chunks_completed, 1);
        assert!(!local.exists());

        assert!(worker_iteration(&engine).unwrap());
        assert_eq!(cipher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.counters.snapshot().chunks_completed, 2);

        assert_eq!(std::fs::read(&local).unwrap(), plaintext);
        assert_eq!(store.fetch_count(), 2);
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn test_empty_queue_iteration_does_nothing() {
        let dest = TempDir::new().unwrap();
        let engine = engine(
            &dest,
            Arc::new(MemoryStore::new()),
            Arc::new(AesCbcCipher::new()),
            16,
        );
        assert!(!worker_iteration(&engine).unwrap());
    }

    #[test]
    fn test_short_read_is_error() {
        let dest = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("cont", "f", b"abc".to_vec());
        // Claims more bytes than the store holds.
        let entity = RemoteEntity::new("cont/f", "f", 8, chrono::Utc::now());

        let engine = engine(&dest, store, Arc::new(AesCbcCipher::new()), 16);
        let local = dest.path().join("f");
        engine.admit(&local);
        engine.add_to_download_queue(&local, Arc::new(entity)).unwrap();

        assert!(matches!(
            worker_iteration(&engine),
            Err(DownloadError::ShortRead {
                expected: 8,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_descriptor_requeued_while_chunks_remain() {
        let dest = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let entity = store.put("cont", "f", b"0123456789".to_vec());

        let engine = engine(&dest, store, Arc::new(AesCbcCipher::new()), 4);
        let local = dest.path().join("f");
        engine.admit(&local);
        engine.add_to_download_queue(&local, Arc::new(entity)).unwrap();

        assert!(worker_iteration(&engine).unwrap());
        assert_eq!(engine.queue.len(), 1);
        assert!(worker_iteration(&engine).unwrap());
        assert_eq!(engine.queue.len(), 1);
        // Last chunk: nothing left to hand out, so no requeue.
        assert!(worker_iteration(&engine).unwrap());
        assert!(engine.queue.is_empty());

        assert_eq!(std::fs::read(&local).unwrap(), b"0123456789");
    }

    #[test]
    fn test_pool_exits_when_run_drains() {
        let dest = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let entity = store.put("cont", "f", vec![7u8; 100]);

        let engine = engine(&dest, store, Arc::new(AesCbcCipher::new()), 16);
        let local = dest.path().join("f");
        engine.admit(&local);
        engine.add_to_download_queue(&local, Arc::new(entity)).unwrap();
        engine.mark_listing_complete();

        let pool = WorkerPool::start(3, &engine).unwrap();
        assert_eq!(pool.len(), 3);
        pool.wait(false).unwrap();

        assert_eq!(std::fs::read(&local).unwrap(), vec![7u8; 100]);
        assert!(engine.take_fault().is_none());
    }

    /// Blocks every decrypt until the gate opens.
    struct GatedCipher {
        inner: AesCbcCipher,
        open: AtomicBool,
    }

    impl ChunkCipher for GatedCipher {
        fn decrypt(
            &self,
            ciphertext: &[u8],
            key: &[u8],
            iv: &[u8],
            unpad: bool,
        ) -> Result<Vec<u8>, CipherError> {
            while !self.open.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            self.inner.decrypt(ciphertext, key, iv, unpad)
        }
    }

    #[test]
    fn test_fetching_pauses_while_decryption_backlog_is_full() {
        let dest = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let plaintext = vec![3u8; 320];
        let encrypted = store
            .put_encrypted("cont", "secret.bin", &plaintext, &[5u8; 32], &[6u8; 16])
            .unwrap();
        let plain = store.put("cont", "plain.bin", b"0123456789".to_vec());

        let cipher = Arc::new(GatedCipher {
            inner: AesCbcCipher::new(),
            open: AtomicBool::new(false),
        });
        let engine = engine_with_crypto(&dest, store.clone(), cipher.clone(), 16, 1);

        let secret = dest.path().join("secret.bin");
        engine.admit(&secret);
        engine
            .add_to_download_queue(&secret, Arc::new(encrypted))
            .unwrap();

        assert!(worker_iteration(&engine).unwrap());
        // Wait for the decrypt thread to take the first chunk and block.
        while engine.crypto.backlog() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        for _ in 0..40 {
            worker_iteration(&engine).unwrap();
        }

        // One chunk sits in the blocked decrypt thread and the queue is full;
        // the remaining ciphertext has not been fetched.
        let limit = CRYPTO_BACKLOG_PER_WORKER;
        assert_eq!(engine.crypto.backlog(), limit);
        assert_eq!(store.fetch_count(), limit + 1);
        assert!(engine.crypto_saturated());

        // Plain files still make progress.
        let plain_path = dest.path().join("plain.bin");
        engine.admit(&plain_path);
        engine
            .add_to_download_queue(&plain_path, Arc::new(plain))
            .unwrap();
        for _ in 0..10 {
            worker_iteration(&engine).unwrap();
        }
        assert_eq!(std::fs::read(&plain_path).unwrap(), b"0123456789");

        cipher.open.store(true, Ordering::SeqCst);
        engine.shutdown_offloaders();
    }
}
