//! A local directory tree served as a remote store.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{EntityIter, RemoteEntity, RemoteStore, SourcePath, StorageMode};
use crate::config::DownloadOptions;
use crate::download::checksum::compute_file_md5;
use crate::error::{DownloadError, DownloadResult};

/// Serves files under `root` as remote entities.
///
/// Sources are paths relative to `root`. Entity locations are relative to
/// `root` as well, so the same store can fetch any entity it listed.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    compute_md5: bool,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compute_md5: false,
        }
    }

    /// Compute and report an MD5 for every listed file.
    ///
    /// Off by default; it reads every file once during listing.
    pub fn with_md5(mut self, compute: bool) -> Self {
        self.compute_md5 = compute;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entity_for(
        &self,
        path: &Path,
        name: String,
        mode: StorageMode,
    ) -> DownloadResult<RemoteEntity> {
        let metadata = fs::metadata(path).map_err(|e| DownloadError::io(path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| DownloadError::io(path, e))?;

        let location = slash_path(path.strip_prefix(&self.root).unwrap_or(path));
        let mut entity = RemoteEntity::new(
            location,
            name,
            metadata.len(),
            DateTime::<Utc>::from(modified),
        )
        .with_mode(mode);

        if self.compute_md5 {
            entity = entity.with_md5(compute_file_md5(path)?);
        }
        Ok(entity)
    }
}

impl RemoteStore for DirectoryStore {
    fn list<'a>(
        &'a self,
        source: &SourcePath,
        options: &DownloadOptions,
    ) -> DownloadResult<EntityIter<'a>> {
        let base = self.root.join(source.as_str());
        let metadata = fs::metadata(&base).map_err(|e| DownloadError::Listing {
            source_path: source.to_string(),
            reason: e.to_string(),
        })?;

        let mode = options.mode;

        // A single file source lists just that file, named by its file name.
        if metadata.is_file() {
            let name = base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let entity = self.entity_for(&base, name, mode);
            return Ok(Box::new(std::iter::once(entity)));
        }

        let files = collect_files(&base, options.recursive).map_err(|e| {
            DownloadError::Listing {
                source_path: source.to_string(),
                reason: e.to_string(),
            }
        })?;
        debug!(source = %source, count = files.len(), "Listed directory source");

        Ok(Box::new(files.into_iter().map(move |path| {
            let name = slash_path(path.strip_prefix(&base).unwrap_or(&path));
            self.entity_for(&path, name, mode)
        })))
    }

    fn fetch_range(
        &self,
        entity: &RemoteEntity,
        start: u64,
        length: u64,
    ) -> DownloadResult<Vec<u8>> {
        let fetch_err = |reason: String| DownloadError::Fetch {
            location: entity.location().to_string(),
            start,
            length,
            reason,
        };

        let path = self.root.join(entity.location());
        let mut file = File::open(&path).map_err(|e| fetch_err(e.to_string()))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| fetch_err(e.to_string()))?;

        let mut buffer = Vec::with_capacity(length as usize);
        file.take(length)
            .read_to_end(&mut buffer)
            .map_err(|e| fetch_err(e.to_string()))?;
        Ok(buffer)
    }
}

/// Regular files under `dir`, sorted for a stable listing order.
fn collect_files(dir: &Path, recursive: bool) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if recursive {
                    pending.push(entry.path());
                }
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::checksum::md5_base64;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("cont");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("nested").join("b.txt"), b"bravo!").unwrap();
        temp
    }

    fn names(store: &DirectoryStore, source: &str, options: &DownloadOptions) -> Vec<String> {
        store
            .list(&SourcePath::new(source), options)
            .unwrap()
            .map(|e| e.unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_list_recursive() {
        let temp = fixture();
        let store = DirectoryStore::new(temp.path());
        let options = DownloadOptions::default();

        assert_eq!(names(&store, "cont", &options), vec!["a.txt", "nested/b.txt"]);
    }

    #[test]
    fn test_list_non_recursive() {
        let temp = fixture();
        let store = DirectoryStore::new(temp.path());
        let options = DownloadOptions::default().with_recursive(false);

        assert_eq!(names(&store, "cont", &options), vec!["a.txt"]);
    }

    #[test]
    fn test_list_single_file_source() {
        let temp = fixture();
        let store = DirectoryStore::new(temp.path());
        let entities: Vec<_> = store
            .list(&SourcePath::new("cont/nested/b.txt"), &DownloadOptions::default())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name(), "b.txt");
        assert_eq!(entities[0].location(), "cont/nested/b.txt");
        assert_eq!(entities[0].size(), 6);
    }

    #[test]
    fn test_list_missing_source() {
        let temp = fixture();
        let store = DirectoryStore::new(temp.path());
        let result = store.list(&SourcePath::new("nope"), &DownloadOptions::default());
        assert!(matches!(result, Err(DownloadError::Listing { .. })));
    }

    #[test]
    fn test_list_with_md5() {
        let temp = fixture();
        let store = DirectoryStore::new(temp.path()).with_md5(true);
        let entity = store
            .list(&SourcePath::new("cont/a.txt"), &DownloadOptions::default())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(entity.md5(), Some(md5_base64(b"alpha").as_str()));
    }

    #[test]
    fn test_fetch_range() {
        let temp = fixture();
        let store = DirectoryStore::new(temp.path());
        let entity = RemoteEntity::new("cont/nested/b.txt", "b.txt", 6, Utc::now());

        assert_eq!(store.fetch_range(&entity, 1, 3).unwrap(), b"rav");
        // Past the end returns what is there; callers check the length.
        assert_eq!(store.fetch_range(&entity, 4, 10).unwrap(), b"o!");
    }

    #[test]
    fn test_fetch_missing_entity() {
        let temp = fixture();
        let store = DirectoryStore::new(temp.path());
        let entity = RemoteEntity::new("cont/gone", "gone", 6, Utc::now());
        assert!(matches!(
            store.fetch_range(&entity, 0, 1),
            Err(DownloadError::Fetch { .. })
        ));
    }
}
