//! MD5 digests for local file verification.
//!
//! Blob stores report content digests as base64-encoded MD5, so that is the
//! form produced and compared here.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};

use crate::error::{DownloadError, DownloadResult};

/// Buffer size for reading files during digest calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Base64 MD5 of a byte slice.
pub fn md5_base64(data: &[u8]) -> String {
    BASE64.encode(Md5::digest(data))
}

/// Base64 MD5 of a file's contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn compute_file_md5(path: &Path) -> DownloadResult<String> {
    let mut file = File::open(path).map_err(|e| DownloadError::io(path, e))?;

    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| DownloadError::io(path, e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(BASE64.encode(hasher.finalize()))
}

/// Whether the file at `path` has the expected base64 MD5.
pub fn file_matches_md5(path: &Path, expected: &str) -> DownloadResult<bool> {
    Ok(compute_file_md5(path)? == expected)
}
