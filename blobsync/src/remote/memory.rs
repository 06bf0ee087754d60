//! In-memory remote store.
//!
//! Used by tests and by embedders that already hold content in memory. Can
//! inject fetch failures and latency, and counts range requests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use super::{EncryptionMetadata, EntityIter, RemoteEntity, RemoteStore, SourcePath};
use crate::config::DownloadOptions;
use crate::crypto::{AesCbcCipher, CipherError};
use crate::download::checksum::md5_base64;
use crate::error::{DownloadError, DownloadResult};

#[derive(Debug, Clone)]
struct StoredObject {
    entity: RemoteEntity,
    data: Arc<Vec<u8>>,
}

/// A remote store backed by a map of location to bytes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    failing: RwLock<HashSet<String>>,
    fetch_delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before serving each range.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Store `data` as `<source>/<name>` with a plain MD5.
    pub fn put(&self, source: &str, name: &str, data: impl Into<Vec<u8>>) -> RemoteEntity {
        let data = data.into();
        let entity = RemoteEntity::new(
            join_location(source, name),
            name,
            data.len() as u64,
            Utc::now(),
        )
        .with_md5(md5_base64(&data));
        self.put_entity(entity.clone(), data);
        entity
    }

    /// Store `plaintext` encrypted with AES-256-CBC under `key` and `iv`.
    ///
    /// The stored digest describes the ciphertext; the plaintext digest is
    /// recorded in the encryption metadata.
    pub fn put_encrypted(
        &self,
        source: &str,
        name: &str,
        plaintext: &[u8],
        key: &[u8],
        iv: &[u8],
    ) -> Result<RemoteEntity, CipherError> {
        let ciphertext = AesCbcCipher::new().encrypt(plaintext, key, iv)?;
        let encryption = EncryptionMetadata::new(key.to_vec(), iv.to_vec())
            .with_pre_encrypted_md5(md5_base64(plaintext));
        let entity = RemoteEntity::new(
            join_location(source, name),
            name,
            ciphertext.len() as u64,
            Utc::now(),
        )
        .with_md5(md5_base64(&ciphertext))
        .with_encryption(encryption);
        self.put_entity(entity.clone(), ciphertext);
        Ok(entity)
    }

    /// Store an entity with explicit metadata.
    pub fn put_entity(&self, entity: RemoteEntity, data: Vec<u8>) {
        self.objects.write().insert(
            entity.location().to_string(),
            StoredObject {
                entity,
                data: Arc::new(data),
            },
        );
    }

    /// Make every fetch of `location` fail.
    pub fn fail_fetches_for(&self, location: &str) {
        self.failing.write().insert(location.to_string());
    }

    /// Number of range requests served or refused so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RemoteStore for MemoryStore {
    fn list<'a>(
        &'a self,
        source: &SourcePath,
        options: &DownloadOptions,
    ) -> DownloadResult<EntityIter<'a>> {
        let prefix = source.as_str();
        let recursive = options.recursive;

        let entities: Vec<_> = self
            .objects
            .read()
            .values()
            .filter(|object| in_source(object.entity.location(), prefix))
            .filter(|object| recursive || !object.entity.name().contains('/'))
            .map(|object| Ok(object.entity.clone()))
            .collect();

        Ok(Box::new(entities.into_iter()))
    }

    fn fetch_range(
        &self,
        entity: &RemoteEntity,
        start: u64,
        length: u64,
    ) -> DownloadResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            thread::sleep(delay);
        }

        let fetch_err = |reason: &str| DownloadError::Fetch {
            location: entity.location().to_string(),
            start,
            length,
            reason: reason.to_string(),
        };

        if self.failing.read().contains(entity.location()) {
            return Err(fetch_err("injected failure"));
        }

        let data = self
            .objects
            .read()
            .get(entity.location())
            .map(|object| Arc::clone(&object.data))
            .ok_or_else(|| fetch_err("not found"))?;

        let begin = (start as usize).min(data.len());
        let end = start.saturating_add(length).min(data.len() as u64) as usize;
        Ok(data[begin..end].to_vec())
    }
}

fn join_location(source: &str, name: &str) -> String {
    let source = source.trim_matches('/');
    if source.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", source, name)
    }
}

fn in_source(location: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || location == prefix
        || location
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
