//! Skip / verify / download decision.
//!
//! [`check_download_conditions`] is a pure function of the local file state,
//! the remote entity and the run specification. It never touches the file
//! contents: when a digest comparison is needed it answers
//! [`DownloadAction::CheckMd5`] and the comparison happens off-thread.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::config::DownloadSpecification;
use crate::remote::{page_align, RemoteEntity, StorageMode};

/// What to do with one listed remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadAction {
    /// Transfer the entity.
    Download,
    /// Compare digests first; resolves later into `Skip` or `Download`.
    CheckMd5,
    /// The local file is up to date (or may not be replaced).
    Skip,
}

/// Size and modification time of an existing local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFileState {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl LocalFileState {
    pub fn new(size: u64, modified: DateTime<Utc>) -> Self {
        Self { size, modified }
    }

    /// Stat `path`. Anything that is not a readable regular file counts as
    /// absent.
    pub fn probe(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let modified = metadata.modified().ok()?;
        Some(Self {
            size: metadata.len(),
            modified: DateTime::<Utc>::from(modified),
        })
    }
}

/// Decide whether `entity` needs to be transferred to a local path whose
/// current state is `local`.
///
/// For page storage the size check page-aligns the local size and compares
/// it with the remote size as reported; the remote side is never aligned.
pub fn check_download_conditions(
    local: Option<&LocalFileState>,
    entity: &RemoteEntity,
    spec: &DownloadSpecification,
) -> DownloadAction {
    let Some(local) = local else {
        return DownloadAction::Download;
    };

    if !spec.options.overwrite {
        return DownloadAction::Skip;
    }

    if spec.options.check_file_md5 && spec.skip_on.md5_match {
        return DownloadAction::CheckMd5;
    }

    if !spec.skip_on.any_sync_criterion() {
        return DownloadAction::Download;
    }

    let size_matches = !spec.skip_on.filesize_match || {
        // Page storage reports page-aligned sizes; align the local side.
        let local_size = match entity.mode() {
            StorageMode::Page => page_align(local.size),
            _ => local.size,
        };
        local_size == entity.size()
    };

    let time_matches = !spec.skip_on.lmt_ge || local.modified >= entity.last_modified();

    if size_matches && time_matches {
        DownloadAction::Skip
    } else {
        DownloadAction::Download
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownloadOptions, SkipOnOptions};
    use chrono::Duration;
    use tempfile::TempDir;

    fn spec(overwrite: bool, check_md5: bool, skip_on: SkipOnOptions) -> DownloadSpecification {
        DownloadSpecification::new("dest")
            .with_options(
                DownloadOptions::default()
                    .with_overwrite(overwrite)
                    .with_check_file_md5(check_md5),
            )
            .with_skip_on(skip_on)
    }

    #[test]
    fn test_truth_table() {
        let now = Utc::now();
        // Local size matches remote; local time is older than remote.
        let local = LocalFileState::new(3, now);
        let remote = RemoteEntity::new("cont/a", "a", 3, now + Duration::days(1));

        // (exists, overwrite, check_md5, md5_match, filesize_match, lmt_ge) -> action
        use DownloadAction::*;
        let table = [
            ((false, false, true, true, true, true), Download),
            ((false, true, true, true, true, true), Download),
            ((false, false, false, false, false, false), Download),
            ((true, false, true, true, true, true), Skip),
            ((true, false, false, false, false, false), Skip),
            ((true, false, true, true, false, false), Skip),
            ((true, true, true, true, false, false), CheckMd5),
            ((true, true, true, true, true, true), CheckMd5),
            ((true, true, false, true, true, false), Skip),
            ((true, true, false, true, false, false), Download),
            ((true, true, false, true, false, true), Download),
            ((true, true, true, false, false, false), Download),
            ((true, true, false, false, false, false), Download),
            ((true, true, false, false, true, false), Skip),
            ((true, true, true, false, true, false), Skip),
            ((true, true, false, false, false, true), Download),
            ((true, true, true, false, false, true), Download),
            ((true, true, false, false, true, true), Download),
        ];
        assert_eq!(table.len(), 18);

        for ((exists, overwrite, check_md5, md5, fs, lmt), expected) in table {
            let spec = spec(overwrite, check_md5, SkipOnOptions::new(fs, lmt, md5));
            let local = exists.then_some(&local);
            assert_eq!(
                check_download_conditions(local, &remote, &spec),
                expected,
                "exists={} overwrite={} check_md5={} md5={} fs={} lmt={}",
                exists,
                overwrite,
                check_md5,
                md5,
                fs,
                lmt
            );
        }
    }

    #[test]
    fn test_absent_local_file_downloads() {
        let remote = RemoteEntity::new("cont/a", "a", 1, Utc::now());
        let spec = spec(true, true, SkipOnOptions::new(true, true, true));
        assert_eq!(
            check_download_conditions(None, &remote, &spec),
            DownloadAction::Download
        );
    }

    #[test]
    fn test_no_overwrite_skips_regardless_of_metadata() {
        let local = LocalFileState::new(999, Utc::now() - Duration::days(365));
        let remote = RemoteEntity::new("cont/a", "a", 1, Utc::now());
        let spec = spec(false, false, SkipOnOptions::default());
        assert_eq!(
            check_download_conditions(Some(&local), &remote, &spec),
            DownloadAction::Skip
        );
    }

    #[test]
    fn test_page_mode_aligns_local_size() {
        let local = LocalFileState::new(3, Utc::now());
        let spec = spec(true, true, SkipOnOptions::new(true, false, false));

        let aligned = RemoteEntity::new("cont/a", "a", page_align(3), Utc::now())
            .with_mode(StorageMode::Page);
        assert_eq!(
            check_download_conditions(Some(&local), &aligned, &spec),
            DownloadAction::Skip
        );

        let unaligned =
            RemoteEntity::new("cont/a", "a", 3, Utc::now()).with_mode(StorageMode::Page);
        assert_eq!(
            check_download_conditions(Some(&local), &unaligned, &spec),
            DownloadAction::Download
        );

        // A full local page does not match a remote that reports 3 bytes.
        let full_page = LocalFileState::new(page_align(3), Utc::now());
        assert_eq!(
            check_download_conditions(Some(&full_page), &unaligned, &spec),
            DownloadAction::Download
        );
    }

    #[test]
    fn test_non_page_mode_compares_raw_size() {
        let local = LocalFileState::new(3, Utc::now());
        let spec = spec(true, true, SkipOnOptions::new(true, false, false));
        let remote = RemoteEntity::new("cont/a", "a", page_align(3), Utc::now())
            .with_mode(StorageMode::Block);
        assert_eq!(
            check_download_conditions(Some(&local), &remote, &spec),
            DownloadAction::Download
        );
    }

    #[test]
    fn test_lmt_ge() {
        let now = Utc::now();
        let local = LocalFileState::new(3, now);
        let spec = spec(true, true, SkipOnOptions::new(false, true, false));

        let newer = RemoteEntity::new("cont/a", "a", 3, now + Duration::days(1));
        assert_eq!(
            check_download_conditions(Some(&local), &newer, &spec),
            DownloadAction::Download
        );

        let older = RemoteEntity::new("cont/a", "a", 3, now - Duration::days(1));
        assert_eq!(
            check_download_conditions(Some(&local), &older, &spec),
            DownloadAction::Skip
        );

        let same = RemoteEntity::new("cont/a", "a", 3, now);
        assert_eq!(
            check_download_conditions(Some(&local), &same, &spec),
            DownloadAction::Skip
        );
    }

    #[test]
    fn test_probe_existing_and_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a");
        std::fs::write(&path, b"abc").unwrap();

        let state = LocalFileState::probe(&path).unwrap();
        assert_eq!(state.size, 3);

        assert!(LocalFileState::probe(&temp.path().join("missing")).is_none());
        assert!(LocalFileState::probe(temp.path()).is_none());
    }

    #[test]
    fn test_probe_against_real_file_and_lmt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a");
        std::fs::write(&path, b"abc").unwrap();
        let local = LocalFileState::probe(&path);

        let spec = spec(true, true, SkipOnOptions::new(false, true, false));
        let future = RemoteEntity::new("cont/a", "a", 3, Utc::now() + Duration::days(1));
        let past = RemoteEntity::new("cont/a", "a", 3, Utc::now() - Duration::days(1));

        assert_eq!(
            check_download_conditions(local.as_ref(), &future, &spec),
            DownloadAction::Download
        );
        assert_eq!(
            check_download_conditions(local.as_ref(), &past, &spec),
            DownloadAction::Skip
        );
    }
}
