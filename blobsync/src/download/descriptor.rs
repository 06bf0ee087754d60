//! Per-file download state.
//!
//! A [`DownloadDescriptor`] owns the temporary file a remote entity is
//! assembled into and hands out chunks to workers through an atomic cursor.
//! Chunks may complete in any order; the thread whose completion brings the
//! counter to the total is the one that finalizes the file.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::checksum::compute_file_md5;
use super::local::restore_modified_time;
use crate::config::DownloadOptions;
use crate::error::{DownloadError, DownloadResult};
use crate::remote::{RemoteEntity, AES_BLOCK_SIZE};

/// Suffix of the temporary file a download is assembled in.
pub const TEMP_SUFFIX: &str = ".bsdl";

/// Where one chunk comes from and where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOffsets {
    /// Zero-based chunk index.
    pub chunk_num: u64,
    /// Write position in the local file.
    pub fd_start: u64,
    /// Stored bytes belonging to this chunk.
    pub num_bytes: u64,
    /// First remote byte to fetch.
    pub range_start: u64,
    /// Remote bytes to fetch. For encrypted chunks after the first this
    /// includes the preceding cipher block, which is the chunk's IV.
    pub range_len: u64,
    /// Final chunk of an encrypted entity; strip padding after decrypting.
    pub unpad: bool,
}

impl ChunkOffsets {
    /// Length of the IV block fetched ahead of the chunk data.
    pub fn iv_prefix_len(&self) -> u64 {
        self.fd_start - self.range_start
    }
}

/// Result of checking an assembled file against its expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityOutcome {
    /// Digest matched.
    Verified,
    /// Verification disabled or no digest available.
    Unchecked,
    /// Digest did not match.
    Mismatch { expected: String, actual: String },
}

/// Download state for one remote entity.
#[derive(Debug)]
pub struct DownloadDescriptor {
    local_path: PathBuf,
    temp_path: PathBuf,
    entity: Arc<RemoteEntity>,
    chunk_size: u64,
    total_chunks: u64,
    next_chunk: AtomicU64,
    completed: AtomicU64,
    file: RwLock<Option<File>>,
}

impl DownloadDescriptor {
    /// Create the descriptor and its sized temporary file.
    ///
    /// Missing parent directories of `local_path` are created.
    pub fn new(
        local_path: impl Into<PathBuf>,
        entity: Arc<RemoteEntity>,
        options: &DownloadOptions,
    ) -> DownloadResult<Self> {
        let local_path = local_path.into();
        let temp_path = temp_path_for(&local_path);

        let chunk_size = effective_chunk_size(&entity, options.chunk_size_bytes);
        let total_chunks = entity.size().div_ceil(chunk_size);

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| DownloadError::io(&temp_path, e))?;

        // Padding is at most one block; the final write grows the file to
        // its exact plaintext length.
        let allocation = if entity.is_encrypted() {
            entity.size().saturating_sub(AES_BLOCK_SIZE)
        } else {
            entity.size()
        };
        file.set_len(allocation)
            .map_err(|e| DownloadError::io(&temp_path, e))?;

        debug!(
            path = %local_path.display(),
            size = entity.size(),
            chunk_size,
            total_chunks,
            "Created download descriptor"
        );

        Ok(Self {
            local_path,
            temp_path,
            entity,
            chunk_size,
            total_chunks,
            next_chunk: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            file: RwLock::new(Some(file)),
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn entity(&self) -> &Arc<RemoteEntity> {
        &self.entity
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn completed_chunks(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Claim the next chunk.
    ///
    /// Each chunk is handed out exactly once across all callers. Once the
    /// chunks are exhausted this keeps returning `None`.
    pub fn next_offsets(&self) -> Option<ChunkOffsets> {
        let total = self.total_chunks;
        let chunk_num = self
            .next_chunk
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < total).then_some(n + 1)
            })
            .ok()?;
        Some(self.offsets_for(chunk_num))
    }

    /// Whether chunks remain to be handed out.
    pub fn has_remaining_chunks(&self) -> bool {
        self.next_chunk.load(Ordering::SeqCst) < self.total_chunks
    }

    fn offsets_for(&self, chunk_num: u64) -> ChunkOffsets {
        let size = self.entity.size();
        let fd_start = chunk_num * self.chunk_size;
        let num_bytes = self.chunk_size.min(size - fd_start);
        let encrypted = self.entity.is_encrypted();

        let range_start = if encrypted && chunk_num > 0 {
            fd_start - AES_BLOCK_SIZE
        } else {
            fd_start
        };

        ChunkOffsets {
            chunk_num,
            fd_start,
            num_bytes,
            range_start,
            range_len: num_bytes + (fd_start - range_start),
            unpad: encrypted && chunk_num + 1 == self.total_chunks,
        }
    }

    /// Write chunk data at its position in the temporary file.
    pub fn write_chunk(&self, offsets: &ChunkOffsets, data: &[u8]) -> DownloadResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;

            let guard = self.file.read();
            let file = guard.as_ref().ok_or_else(|| self.closed_error())?;
            file.write_all_at(data, offsets.fd_start)
                .map_err(|e| DownloadError::io(&self.temp_path, e))
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom, Write};

            let mut guard = self.file.write();
            let file = guard.as_mut().ok_or_else(|| self.closed_error())?;
            file.seek(SeekFrom::Start(offsets.fd_start))
                .and_then(|_| file.write_all(data))
                .map_err(|e| DownloadError::io(&self.temp_path, e))
        }
    }

    /// Record one finished chunk.
    ///
    /// Returns `true` for exactly one call: the one that completes the last
    /// chunk.
    pub fn mark_chunk_complete(&self) -> bool {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        done == self.total_chunks
    }

    /// Whether every chunk has been written.
    pub fn all_operations_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst) == self.total_chunks
    }

    /// Compare the assembled temporary file with the entity's expected
    /// digest.
    pub fn verify_integrity(&self, check_file_md5: bool) -> DownloadResult<IntegrityOutcome> {
        let expected = match (check_file_md5, self.entity.expected_md5()) {
            (true, Some(expected)) => expected,
            _ => return Ok(IntegrityOutcome::Unchecked),
        };

        let actual = compute_file_md5(&self.temp_path)?;
        if actual == expected {
            Ok(IntegrityOutcome::Verified)
        } else {
            Ok(IntegrityOutcome::Mismatch {
                expected: expected.to_string(),
                actual,
            })
        }
    }

    /// Move the assembled file into place.
    ///
    /// Flushes and closes the temporary file, renames it over the local
    /// path, and applies the remote last-modified time when
    /// `restore_attributes` is set.
    pub fn finalize(&self, restore_attributes: bool) -> DownloadResult<()> {
        if let Some(file) = self.file.write().take() {
            file.sync_all()
                .map_err(|e| DownloadError::io(&self.temp_path, e))?;
        }

        fs::rename(&self.temp_path, &self.local_path)
            .map_err(|e| DownloadError::io(&self.local_path, e))?;

        if restore_attributes {
            restore_modified_time(&self.local_path, self.entity.last_modified())?;
        }

        Ok(())
    }

    /// Close and remove the temporary file without finalizing.
    pub fn discard(&self) -> DownloadResult<()> {
        drop(self.file.write().take());
        match fs::remove_file(&self.temp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::io(&self.temp_path, e)),
        }
    }

    fn closed_error(&self) -> DownloadError {
        DownloadError::io(
            &self.temp_path,
            io::Error::other("temporary file already closed"),
        )
    }
}

/// `<local>.bsdl`
pub fn temp_path_for(local_path: &Path) -> PathBuf {
    let mut name = OsString::from(local_path.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Encrypted chunks must start on a cipher block boundary.
fn effective_chunk_size(entity: &RemoteEntity, requested: u64) -> u64 {
    if entity.is_encrypted() {
        (requested / AES_BLOCK_SIZE * AES_BLOCK_SIZE).max(AES_BLOCK_SIZE)
    } else {
        requested.max(1)
    }
}
