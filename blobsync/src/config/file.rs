//! INI configuration file.
//!
//! Lives at `~/.blobsync/config.ini`:
//!
//! ```ini
//! [download]
//! chunk_size = 4M
//! check_md5 = true
//! overwrite = true
//! recursive = true
//! delete_extraneous = false
//! restore_attributes = false
//! mode = auto
//!
//! [skip_on]
//! filesize_match = false
//! lmt_ge = false
//! md5_match = false
//!
//! [concurrency]
//! transfer_threads = 4
//! checksum_workers = 2
//! crypto_workers = 0
//! ```
//!
//! Missing keys keep their defaults; a missing file is not an error.

use std::io;
use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

use super::{ConcurrencyOptions, DownloadOptions, SkipOnOptions};
use crate::remote::StorageMode;

const CONFIG_DIR_NAME: &str = ".blobsync";
const CONFIG_FILE_NAME: &str = "config.ini";

/// Errors loading or saving the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("could not determine home directory")]
    NoHomeDirectory,
}

/// Path of the user configuration file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoHomeDirectory)
}

/// `[download]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSection {
    pub chunk_size: u64,
    pub check_md5: bool,
    pub overwrite: bool,
    pub recursive: bool,
    pub delete_extraneous: bool,
    pub restore_attributes: bool,
    pub mode: StorageMode,
}

impl Default for DownloadSection {
    fn default() -> Self {
        let options = DownloadOptions::default();
        Self {
            chunk_size: options.chunk_size_bytes,
            check_md5: options.check_file_md5,
            overwrite: options.overwrite,
            recursive: options.recursive,
            delete_extraneous: options.delete_extraneous_destination,
            restore_attributes: options.restore_file_attributes,
            mode: options.mode,
        }
    }
}

/// `[concurrency]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencySection {
    pub transfer_threads: usize,
    pub checksum_workers: usize,
    pub crypto_workers: usize,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        let defaults = ConcurrencyOptions::default();
        Self {
            transfer_threads: defaults.transfer_threads,
            checksum_workers: defaults.checksum_workers,
            crypto_workers: defaults.crypto_workers,
        }
    }
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub download: DownloadSection,
    pub skip_on: SkipOnOptions,
    pub concurrency: ConcurrencySection,
}

impl ConfigFile {
    /// Load the user configuration, falling back to defaults when absent.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path()?)
    }

    /// Load from a specific path, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path).map_err(|e| match e {
            ini::Error::Io(source) => ConfigError::Read {
                path: path.to_path_buf(),
                source,
            },
            other => ConfigError::Parse {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        let mut config = Self::default();

        if let Some(section) = ini.section(Some("download")) {
            let d = &mut config.download;
            if let Some(v) = section.get("chunk_size") {
                d.chunk_size = parse_size("download.chunk_size", v)?;
            }
            if let Some(v) = section.get("check_md5") {
                d.check_md5 = parse_bool("download.check_md5", v)?;
            }
            if let Some(v) = section.get("overwrite") {
                d.overwrite = parse_bool("download.overwrite", v)?;
            }
            if let Some(v) = section.get("recursive") {
                d.recursive = parse_bool("download.recursive", v)?;
            }
            if let Some(v) = section.get("delete_extraneous") {
                d.delete_extraneous = parse_bool("download.delete_extraneous", v)?;
            }
            if let Some(v) = section.get("restore_attributes") {
                d.restore_attributes = parse_bool("download.restore_attributes", v)?;
            }
            if let Some(v) = section.get("mode") {
                d.mode = StorageMode::from_config_str(v)
                    .ok_or_else(|| invalid("download.mode", v))?;
            }
        }

        if let Some(section) = ini.section(Some("skip_on")) {
            let s = &mut config.skip_on;
            if let Some(v) = section.get("filesize_match") {
                s.filesize_match = parse_bool("skip_on.filesize_match", v)?;
            }
            if let Some(v) = section.get("lmt_ge") {
                s.lmt_ge = parse_bool("skip_on.lmt_ge", v)?;
            }
            if let Some(v) = section.get("md5_match") {
                s.md5_match = parse_bool("skip_on.md5_match", v)?;
            }
        }

        if let Some(section) = ini.section(Some("concurrency")) {
            let c = &mut config.concurrency;
            if let Some(v) = section.get("transfer_threads") {
                c.transfer_threads = parse_count("concurrency.transfer_threads", v)?;
            }
            if let Some(v) = section.get("checksum_workers") {
                c.checksum_workers = parse_count("concurrency.checksum_workers", v)?;
            }
            if let Some(v) = section.get("crypto_workers") {
                c.crypto_workers = parse_count("concurrency.crypto_workers", v)?;
            }
        }

        Ok(config)
    }

    /// Write this configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut ini = Ini::new();
        for (key, value) in self.entries() {
            if let Some((section, name)) = key.split_once('.') {
                ini.with_section(Some(section)).set(name, value);
            }
        }

        ini.write_to_file(path).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// All settings as `section.key = value` pairs, in file order.
    pub fn entries(&self) -> Vec<(String, String)> {
        let d = &self.download;
        let s = &self.skip_on;
        let c = &self.concurrency;
        vec![
            ("download.chunk_size".into(), d.chunk_size.to_string()),
            ("download.check_md5".into(), d.check_md5.to_string()),
            ("download.overwrite".into(), d.overwrite.to_string()),
            ("download.recursive".into(), d.recursive.to_string()),
            ("download.delete_extraneous".into(), d.delete_extraneous.to_string()),
            ("download.restore_attributes".into(), d.restore_attributes.to_string()),
            ("download.mode".into(), d.mode.to_string()),
            ("skip_on.filesize_match".into(), s.filesize_match.to_string()),
            ("skip_on.lmt_ge".into(), s.lmt_ge.to_string()),
            ("skip_on.md5_match".into(), s.md5_match.to_string()),
            ("concurrency.transfer_threads".into(), c.transfer_threads.to_string()),
            ("concurrency.checksum_workers".into(), c.checksum_workers.to_string()),
            ("concurrency.crypto_workers".into(), c.crypto_workers.to_string()),
        ]
    }

    /// Download options described by the `[download]` section.
    pub fn download_options(&self) -> DownloadOptions {
        let d = &self.download;
        DownloadOptions::default()
            .with_chunk_size(d.chunk_size)
            .with_check_file_md5(d.check_md5)
            .with_overwrite(d.overwrite)
            .with_recursive(d.recursive)
            .with_delete_extraneous(d.delete_extraneous)
            .with_restore_file_attributes(d.restore_attributes)
            .with_mode(d.mode)
    }

    /// Pool sizes described by the `[concurrency]` section.
    pub fn concurrency_options(&self) -> ConcurrencyOptions {
        let c = &self.concurrency;
        ConcurrencyOptions::new(c.transfer_threads, c.checksum_workers, c.crypto_workers)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

/// Parse a byte size with an optional binary suffix (`K`, `M`, `G`).
pub fn parse_size(key: &str, value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let without_b = trimmed
        .strip_suffix(|c: char| c == 'b' || c == 'B')
        .unwrap_or(trimmed);
    let (digits, multiplier) = match without_b.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&without_b[..without_b.len() - 1], 1024),
        Some('M') => (&without_b[..without_b.len() - 1], 1024 * 1024),
        Some('G') => (&without_b[..without_b.len() - 1], 1024 * 1024 * 1024),
        _ => (without_b, 1),
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(key, value))
}
