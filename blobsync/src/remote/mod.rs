//! Remote entities and the store abstraction the engine downloads from.
//!
//! The engine never talks to a storage service directly. It consumes a
//! [`RemoteStore`], which lists [`RemoteEntity`] snapshots for a source and
//! fetches byte ranges of them. Authentication, paging and wire protocols are
//! the store's business.

mod directory;
mod memory;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::config::DownloadOptions;
use crate::error::DownloadResult;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// Page size for page-aligned storage, in bytes.
pub const PAGE_SIZE: u64 = 512;

/// AES block size; also the length of a content IV.
pub const AES_BLOCK_SIZE: u64 = 16;

/// Round a length up to the next page boundary.
pub fn page_align(length: u64) -> u64 {
    length.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Storage flavour of a remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Let the store decide.
    #[default]
    Auto,
    Append,
    Block,
    File,
    /// Page-aligned storage; logical sizes are multiples of [`PAGE_SIZE`].
    Page,
}

impl StorageMode {
    /// Parse from a configuration string.
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "append" => Some(Self::Append),
            "block" => Some(Self::Block),
            "file" => Some(Self::File),
            "page" => Some(Self::Page),
            _ => None,
        }
    }

    /// The configuration string for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Append => "append",
            Self::Block => "block",
            Self::File => "file",
            Self::Page => "page",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side encryption metadata attached to an entity.
///
/// The symmetric key is already unwrapped; key provisioning happens before
/// the entity reaches the engine.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionMetadata {
    /// AES-256 content key.
    pub symmetric_key: Vec<u8>,
    /// IV used for the first cipher block.
    pub content_iv: Vec<u8>,
    /// Base64 MD5 of the plaintext, if the uploader recorded one.
    pub pre_encrypted_md5: Option<String>,
}

impl EncryptionMetadata {
    pub fn new(symmetric_key: Vec<u8>, content_iv: Vec<u8>) -> Self {
        Self {
            symmetric_key,
            content_iv,
            pre_encrypted_md5: None,
        }
    }

    pub fn with_pre_encrypted_md5(mut self, md5: impl Into<String>) -> Self {
        self.pre_encrypted_md5 = Some(md5.into());
        self
    }
}

// Keys stay out of logs.
impl fmt::Debug for EncryptionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionMetadata")
            .field("symmetric_key", &"<redacted>")
            .field("content_iv_len", &self.content_iv.len())
            .field("pre_encrypted_md5", &self.pre_encrypted_md5)
            .finish()
    }
}

/// Metadata snapshot of one remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntity {
    location: String,
    name: String,
    size: u64,
    last_modified: DateTime<Utc>,
    mode: StorageMode,
    md5: Option<String>,
    encryption: Option<EncryptionMetadata>,
}

impl RemoteEntity {
    /// Create an entity.
    ///
    /// # Arguments
    ///
    /// * `location` - Full key of the object inside the store
    /// * `name` - Path relative to the listed source, `/` separated
    /// * `size` - Stored size in bytes (ciphertext size when encrypted)
    /// * `last_modified` - Last-modified timestamp reported by the store
    pub fn new(
        location: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            location: location.into(),
            name: name.into(),
            size,
            last_modified,
            mode: StorageMode::Auto,
            md5: None,
            encryption: None,
        }
    }

    pub fn with_mode(mut self, mode: StorageMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionMetadata) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn md5(&self) -> Option<&str> {
        self.md5.as_deref()
    }

    pub fn encryption(&self) -> Option<&EncryptionMetadata> {
        self.encryption.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// The digest a local copy of this entity should have.
    ///
    /// When encryption metadata is present its pre-encryption digest wins
    /// over the stored digest, which describes the ciphertext. Without a
    /// pre-encryption digest there is nothing to compare a decrypted copy
    /// against, so the stored digest is not used as a fallback
    /// and this returns `None`.
    pub fn expected_md5(&self) -> Option<&str> {
        match &self.encryption {
            Some(encryption) => encryption.pre_encrypted_md5.as_deref(),
            None => self.md5.as_deref(),
        }
    }
}

/// A source to list, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePath(String);

impl SourcePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lazy listing of remote entities.
pub type EntityIter<'a> = Box<dyn Iterator<Item = DownloadResult<RemoteEntity>> + Send + 'a>;

/// A remote blob or file store.
///
/// Implementations must be shareable across worker threads.
pub trait RemoteStore: Send + Sync {
    /// List entities under `source`.
    ///
    /// The iterator is finite and is consumed exactly once.
    fn list<'a>(
        &'a self,
        source: &SourcePath,
        options: &DownloadOptions,
    ) -> DownloadResult<EntityIter<'a>>;

    /// Fetch `length` bytes of `entity` starting at `start`.
    fn fetch_range(&self, entity: &RemoteEntity, start: u64, length: u64)
        -> DownloadResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> RemoteEntity {
        RemoteEntity::new("cont/a", "a", 3, Utc::now())
    }

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), 512);
        assert_eq!(page_align(512), 512);
        assert_eq!(page_align(513), 1024);
    }

    #[test]
    fn test_expected_md5_plain() {
        let e = entity().with_md5("abc");
        assert_eq!(e.expected_md5(), Some("abc"));
    }

    #[test]
    fn test_expected_md5_prefers_pre_encrypted_digest() {
        let e = entity().with_md5("ciphertext-md5").with_encryption(
            EncryptionMetadata::new(vec![0; 32], vec![0; 16]).with_pre_encrypted_md5("abc"),
        );
        assert_eq!(e.expected_md5(), Some("abc"));
    }

    #[test]
    fn test_expected_md5_encrypted_without_pre_encrypted_digest_is_none() {
        let e = entity()
            .with_md5("ciphertext-md5")
            .with_encryption(EncryptionMetadata::new(vec![0; 32], vec![0; 16]));
        assert_eq!(e.expected_md5(), None);
    }

    #[test]
    fn test_storage_mode_config_str() {
        assert_eq!(StorageMode::from_config_str("PAGE"), Some(StorageMode::Page));
        assert_eq!(StorageMode::from_config_str("nope"), None);
        assert_eq!(StorageMode::File.to_string(), "file");
    }

    #[test]
    fn test_source_path_trims_slashes() {
        assert_eq!(SourcePath::new("/cont/dir/").as_str(), "cont/dir");
    }

    #[test]
    fn test_encryption_debug_redacts_key() {
        let meta = EncryptionMetadata::new(vec![7; 32], vec![0; 16]);
        assert!(format!("{:?}", meta).contains("<redacted>"));
    }
}
