//! Configuration for download runs.
//!
//! [`DownloadSpecification`] is the immutable description of one run: what to
//! download, where to, and under which skip rules. [`ConcurrencyOptions`]
//! sizes the thread pools. Both follow the `new` + `with_*` builder style.

mod file;

use std::fmt;
use std::path::PathBuf;
use std::thread;

use crate::remote::{SourcePath, StorageMode};

pub use file::{
    config_file_path, parse_size, ConcurrencySection, ConfigError, ConfigFile, DownloadSection,
};

/// Default chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 4 * 1024 * 1024;

/// Default number of transfer threads.
pub const DEFAULT_TRANSFER_THREADS: usize = 4;

/// Asymmetric key material used by the key provider to unwrap content keys.
///
/// The engine only checks that one is configured before it accepts encrypted
/// entities; unwrapping happens before entities are listed.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptionKey(Vec<u8>);

impl DecryptionKey {
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self(material.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecryptionKey(<{} bytes>)", self.0.len())
    }
}

/// Per-run transfer options.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Size of one transfer unit in bytes.
    pub chunk_size_bytes: u64,

    /// Verify MD5 digests (before deciding, and after assembling a file).
    pub check_file_md5: bool,

    /// Whether existing local files may be replaced.
    pub overwrite: bool,

    /// Descend into nested remote paths.
    pub recursive: bool,

    /// Remove local files under the destination that the remote no longer has.
    pub delete_extraneous_destination: bool,

    /// Apply remote attributes (last-modified time) to finished files.
    pub restore_file_attributes: bool,

    /// Key needed to accept encrypted entities.
    pub decryption_key: Option<DecryptionKey>,

    /// Storage flavour to list.
    pub mode: StorageMode,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            check_file_md5: true,
            overwrite: true,
            recursive: true,
            delete_extraneous_destination: false,
            restore_file_attributes: false,
            decryption_key: None,
            mode: StorageMode::Auto,
        }
    }
}

impl DownloadOptions {
    /// Set the chunk size (minimum 1 byte).
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size_bytes = bytes.max(1);
        self
    }

    pub fn with_check_file_md5(mut self, check: bool) -> Self {
        self.check_file_md5 = check;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_delete_extraneous(mut self, delete: bool) -> Self {
        self.delete_extraneous_destination = delete;
        self
    }

    pub fn with_restore_file_attributes(mut self, restore: bool) -> Self {
        self.restore_file_attributes = restore;
        self
    }

    pub fn with_decryption_key(mut self, key: DecryptionKey) -> Self {
        self.decryption_key = Some(key);
        self
    }

    pub fn with_mode(mut self, mode: StorageMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Conditions under which an existing local file counts as up to date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipOnOptions {
    /// Local size equals remote size.
    pub filesize_match: bool,
    /// Local modification time is at or after the remote last-modified time.
    pub lmt_ge: bool,
    /// Local MD5 equals the remote digest (checked asynchronously).
    pub md5_match: bool,
}

impl SkipOnOptions {
    pub fn new(filesize_match: bool, lmt_ge: bool, md5_match: bool) -> Self {
        Self {
            filesize_match,
            lmt_ge,
            md5_match,
        }
    }

    /// Whether any synchronous criterion is enabled.
    pub fn any_sync_criterion(&self) -> bool {
        self.filesize_match || self.lmt_ge
    }
}

/// Everything one download run needs to know. Read-only once built.
#[derive(Debug, Clone)]
pub struct DownloadSpecification {
    pub options: DownloadOptions,
    pub skip_on: SkipOnOptions,
    /// Local root that remote names are resolved under.
    pub destination: PathBuf,
    pub sources: Vec<SourcePath>,
}

impl DownloadSpecification {
    /// Create a specification with default options and no sources.
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            options: DownloadOptions::default(),
            skip_on: SkipOnOptions::default(),
            destination: destination.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_skip_on(mut self, skip_on: SkipOnOptions) -> Self {
        self.skip_on = skip_on;
        self
    }

    /// Add a source to list.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(SourcePath::new(source));
        self
    }
}

/// Thread pool sizes for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyOptions {
    /// Threads fetching chunks (I/O bound, minimum 1).
    pub transfer_threads: usize,

    /// Threads computing MD5 digests. Zero computes them on the caller.
    pub checksum_workers: usize,

    /// Threads decrypting chunks. Zero decrypts on the transfer thread.
    pub crypto_workers: usize,
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(2, |n| n.get());
        Self {
            transfer_threads: DEFAULT_TRANSFER_THREADS,
            checksum_workers: (cpus / 2).max(1),
            crypto_workers: 0,
        }
    }
}

impl ConcurrencyOptions {
    pub fn new(transfer_threads: usize, checksum_workers: usize, crypto_workers: usize) -> Self {
        Self {
            transfer_threads: transfer_threads.max(1),
            checksum_workers,
            crypto_workers,
        }
    }

    pub fn with_transfer_threads(mut self, threads: usize) -> Self {
        self.transfer_threads = threads.max(1);
        self
    }

    pub fn with_checksum_workers(mut self, workers: usize) -> Self {
        self.checksum_workers = workers;
        self
    }

    pub fn with_crypto_workers(mut self, workers: usize) -> Self {
        self.crypto_workers = workers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = DownloadOptions::default();
        assert_eq!(options.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
        assert!(options.overwrite);
        assert!(options.recursive);
        assert!(!options.delete_extraneous_destination);
        assert!(options.decryption_key.is_none());
        assert_eq!(options.mode, StorageMode::Auto);
    }

    #[test]
    fn test_builder_pattern() {
        let spec = DownloadSpecification::new("/dest")
            .with_options(
                DownloadOptions::default()
                    .with_chunk_size(16)
                    .with_overwrite(false)
                    .with_mode(StorageMode::Page),
            )
            .with_skip_on(SkipOnOptions::new(true, false, true))
            .with_source("/cont/dir/")
            .with_source("cont2");

        assert_eq!(spec.destination, PathBuf::from("/dest"));
        assert_eq!(spec.options.chunk_size_bytes, 16);
        assert!(!spec.options.overwrite);
        assert_eq!(spec.sources.len(), 2);
        assert_eq!(spec.sources[0].as_str(), "cont/dir");
        assert!(spec.skip_on.any_sync_criterion());
    }

    #[test]
    fn test_chunk_size_minimum() {
        let options = DownloadOptions::default().with_chunk_size(0);
        assert_eq!(options.chunk_size_bytes, 1);
    }

    #[test]
    fn test_concurrency_min_transfer_threads() {
        let concurrency = ConcurrencyOptions::new(0, 0, 0);
        assert_eq!(concurrency.transfer_threads, 1);
        assert_eq!(concurrency.crypto_workers, 0);
    }

    #[test]
    fn test_concurrency_default() {
        let concurrency = ConcurrencyOptions::default();
        assert_eq!(concurrency.transfer_threads, DEFAULT_TRANSFER_THREADS);
        assert!(concurrency.checksum_workers >= 1);
        assert_eq!(concurrency.crypto_workers, 0);
    }

    #[test]
    fn test_decryption_key_debug_hides_material() {
        let key = DecryptionKey::new(b"secret".to_vec());
        assert_eq!(format!("{:?}", key), "DecryptionKey(<6 bytes>)");
    }
}
