//! Local filesystem side of a download run.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use tracing::{debug, info};

use crate::error::{DownloadError, DownloadResult};

/// Map a remote entity name onto a path under `destination`.
///
/// Names are `/` separated. Absolute names and names that would climb out
/// of the destination are rejected.
pub fn local_path_for(destination: &Path, name: &str) -> DownloadResult<PathBuf> {
    let invalid = || DownloadError::InvalidPath(name.to_string());

    if name.starts_with('/') || name.starts_with('\\') {
        return Err(invalid());
    }

    let mut path = destination.to_path_buf();
    let mut segments = 0;
    for segment in name.split('/').filter(|s| !s.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            _ => return Err(invalid()),
        }
        segments += 1;
    }

    if segments == 0 {
        return Err(invalid());
    }
    Ok(path)
}

/// Make sure the destination root exists.
///
/// Returns `true` when the directory had to be created.
pub fn ensure_local_destination(root: &Path) -> DownloadResult<bool> {
    match fs::metadata(root) {
        Ok(metadata) if metadata.is_dir() => Ok(false),
        Ok(_) => Err(DownloadError::io(
            root,
            io::Error::new(io::ErrorKind::AlreadyExists, "destination is not a directory"),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(root).map_err(|e| DownloadError::io(root, e))?;
            info!(path = %root.display(), "Created destination directory");
            Ok(true)
        }
        Err(e) => Err(DownloadError::io(root, e)),
    }
}

/// Set a file's modification time.
pub fn restore_modified_time(path: &Path, modified: DateTime<Utc>) -> DownloadResult<()> {
    let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, mtime).map_err(|e| DownloadError::io(path, e))
}

/// Remove regular files under `root` that are not in `keep`.
///
/// Returns the number of files removed.
pub fn delete_extraneous(root: &Path, keep: &HashSet<PathBuf>) -> DownloadResult<u64> {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| DownloadError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| DownloadError::io(&dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| DownloadError::io(&path, e))?;

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && !keep.contains(&path) {
                fs::remove_file(&path).map_err(|e| DownloadError::io(&path, e))?;
                debug!(path = %path.display(), "Deleted extraneous file");
                removed += 1;
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_local_path_for_nested_name() {
        let path = local_path_for(Path::new("/dest"), "dir/sub/file.txt").unwrap();
        assert_eq!(path, Path::new("/dest/dir/sub/file.txt"));
    }

    #[test]
    fn test_local_path_for_collapses_empty_segments() {
        let path = local_path_for(Path::new("/dest"), "dir//file.txt").unwrap();
        assert_eq!(path, Path::new("/dest/dir/file.txt"));
    }

    #[test]
    fn test_local_path_for_rejects_escapes() {
        for name in ["../etc/passwd", "a/../../b", "/abs", "", ".", "a/./b"] {
            assert!(
                matches!(
                    local_path_for(Path::new("/dest"), name),
                    Err(DownloadError::InvalidPath(_))
                ),
                "accepted {:?}",
                name
            );
        }
    }

    #[test]
    fn test_ensure_local_destination() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("a").join("b");

        assert!(ensure_local_destination(&root).unwrap());
        assert!(root.is_dir());
        assert!(!ensure_local_destination(&root).unwrap());

        let file = temp.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(ensure_local_destination(&file).is_err());
    }

    #[test]
    fn test_restore_modified_time() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, b"x").unwrap();

        let when = Utc.with_ymd_and_hms(2019, 6, 1, 12, 0, 0).unwrap();
        restore_modified_time(&path, when).unwrap();

        let mtime = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
        assert_eq!(mtime.unix_seconds(), when.timestamp());
    }

    #[test]
    fn test_delete_extraneous() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("keep.txt"), b"k").unwrap();
        fs::write(root.join("stale.txt"), b"s").unwrap();
        fs::write(root.join("sub").join("keep2.txt"), b"k").unwrap();
        fs::write(root.join("sub").join("stale2.txt"), b"s").unwrap();

        let keep: HashSet<PathBuf> = [root.join("keep.txt"), root.join("sub").join("keep2.txt")]
            .into_iter()
            .collect();

        assert_eq!(delete_extraneous(root, &keep).unwrap(), 2);
        assert!(root.join("keep.txt").exists());
        assert!(root.join("sub").join("keep2.txt").exists());
        assert!(!root.join("stale.txt").exists());
        assert!(!root.join("sub").join("stale2.txt").exists());
    }
}
