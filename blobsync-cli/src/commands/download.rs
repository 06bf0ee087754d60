//! `blobsync download` command.
//!
//! Mirrors one or more sources from a directory-backed blob store into a
//! local destination. Settings come from `~/.blobsync/config.ini` (or
//! `--config`), with command-line flags taking precedence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blobsync::config::{
    parse_size, ConcurrencyOptions, ConfigFile, DecryptionKey, DownloadSpecification,
};
use blobsync::download::{DownloadSummary, Downloader, ProgressSnapshot};
use blobsync::remote::{DirectoryStore, StorageMode};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::error::CliError;

/// Arguments for `blobsync download`.
#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Root directory of the blob store
    #[arg(long)]
    pub root: PathBuf,

    /// Source path under the store root (file or directory); repeatable
    #[arg(long = "source", required = true)]
    pub sources: Vec<String>,

    /// Local destination directory
    #[arg(long)]
    pub destination: PathBuf,

    /// Configuration file to read instead of ~/.blobsync/config.ini
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Chunk size, e.g. 4M or 65536
    #[arg(long, value_parser = parse_chunk_size)]
    pub chunk_size: Option<u64>,

    /// Storage mode of the remote entities
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<StorageMode>,

    /// Never replace existing local files
    #[arg(long)]
    pub no_overwrite: bool,

    /// Only download the top level of directory sources
    #[arg(long)]
    pub no_recursive: bool,

    /// Do not verify the MD5 of downloaded files
    #[arg(long)]
    pub no_check_md5: bool,

    /// Remove local files that are not present remotely
    #[arg(long)]
    pub delete_extraneous: bool,

    /// Set downloaded files' modification time to the remote value
    #[arg(long)]
    pub restore_attributes: bool,

    /// Skip files whose size matches the remote
    #[arg(long)]
    pub skip_on_filesize: bool,

    /// Skip files modified at or after the remote last-modified time
    #[arg(long)]
    pub skip_on_lmt: bool,

    /// Skip files whose MD5 matches the remote
    #[arg(long)]
    pub skip_on_md5: bool,

    /// File holding the decryption key for encrypted entities
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Number of transfer threads
    #[arg(long)]
    pub threads: Option<usize>,

    /// Number of MD5 worker threads (0 checks inline)
    #[arg(long)]
    pub checksum_workers: Option<usize>,

    /// Number of decryption worker threads (0 decrypts inline)
    #[arg(long)]
    pub crypto_workers: Option<usize>,

    /// Hide the progress bar
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

fn parse_chunk_size(value: &str) -> Result<u64, String> {
    parse_size("--chunk-size", value).map_err(|e| e.to_string())
}

fn parse_mode(value: &str) -> Result<StorageMode, String> {
    StorageMode::from_config_str(value)
        .ok_or_else(|| "expected one of auto, append, block, file, page".to_string())
}

/// Run the download command.
pub fn run(args: DownloadArgs) -> Result<(), CliError> {
    let config = match &args.config {
        Some(path) => ConfigFile::load_from(path)?,
        None => ConfigFile::load()?,
    };
    let (spec, concurrency) = build_specification(&args, &config)?;

    let store = Arc::new(DirectoryStore::new(&args.root).with_md5(spec.options.check_file_md5));
    let mut downloader = Downloader::new(spec, store).with_concurrency(concurrency);

    let bar = (!args.quiet).then(transfer_bar);
    if let Some(bar) = bar.clone() {
        downloader = downloader.with_progress(Box::new(move |snapshot: ProgressSnapshot| {
            update_bar(&bar, &snapshot);
        }));
    }

    let interrupt = downloader.interrupt_handle();
    ctrlc::set_handler(move || {
        warn!("Received interrupt, stopping download");
        interrupt.interrupt();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let result = downloader.start();
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let summary = result?;
    print_summary(&summary);
    Ok(())
}

/// Combine the configuration file with command-line overrides.
pub fn build_specification(
    args: &DownloadArgs,
    config: &ConfigFile,
) -> Result<(DownloadSpecification, ConcurrencyOptions), CliError> {
    let mut options = config.download_options();
    if let Some(chunk_size) = args.chunk_size {
        options = options.with_chunk_size(chunk_size);
    }
    if let Some(mode) = args.mode {
        options = options.with_mode(mode);
    }
    if args.no_overwrite {
        options = options.with_overwrite(false);
    }
    if args.no_recursive {
        options = options.with_recursive(false);
    }
    if args.no_check_md5 {
        options = options.with_check_file_md5(false);
    }
    if args.delete_extraneous {
        options = options.with_delete_extraneous(true);
    }
    if args.restore_attributes {
        options = options.with_restore_file_attributes(true);
    }
    if let Some(path) = &args.key_file {
        let material = std::fs::read(path).map_err(|e| {
            CliError::Config(format!("Failed to read key file {}: {}", path.display(), e))
        })?;
        options = options.with_decryption_key(DecryptionKey::new(material));
    }

    let mut skip_on = config.skip_on;
    skip_on.filesize_match |= args.skip_on_filesize;
    skip_on.lmt_ge |= args.skip_on_lmt;
    skip_on.md5_match |= args.skip_on_md5;

    let mut spec = DownloadSpecification::new(&args.destination)
        .with_options(options)
        .with_skip_on(skip_on);
    for source in &args.sources {
        spec = spec.with_source(source.as_str());
    }

    let mut concurrency = config.concurrency_options();
    if let Some(threads) = args.threads {
        if threads == 0 {
            return Err(CliError::Config("--threads must be at least 1".to_string()));
        }
        concurrency = concurrency.with_transfer_threads(threads);
    }
    if let Some(workers) = args.checksum_workers {
        concurrency = concurrency.with_checksum_workers(workers);
    }
    if let Some(workers) = args.crypto_workers {
        concurrency = concurrency.with_crypto_workers(workers);
    }

    Ok((spec, concurrency))
}

fn transfer_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] \
             {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(200));
    bar
}

fn update_bar(bar: &ProgressBar, snapshot: &ProgressSnapshot) {
    bar.set_length(snapshot.bytes_queued);
    bar.set_position(snapshot.bytes_transferred);
    bar.set_message(format!(
        "{}/{} files, {} skipped",
        snapshot.files_completed, snapshot.files_queued, snapshot.files_skipped
    ));
}

fn print_summary(summary: &DownloadSummary) {
    let progress = &summary.progress;
    info!(
        files = progress.files_completed,
        skipped = progress.files_skipped,
        bytes = progress.bytes_transferred,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Download complete"
    );

    println!("Download complete");
    println!("=================");
    println!("  Downloaded:   {} files", progress.files_completed);
    println!("  Skipped:      {} files", progress.files_skipped);
    println!("  Transferred:  {} bytes", progress.bytes_transferred);
    if progress.integrity_failures > 0 {
        println!(
            "  MD5 mismatch: {} files (discarded)",
            progress.integrity_failures
        );
    }
    if progress.extraneous_deleted > 0 {
        println!("  Deleted:      {} extraneous files", progress.extraneous_deleted);
    }
    println!("  Elapsed:      {:.2}s", summary.elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        args: DownloadArgs,
    }

    fn parse(extra: &[&str]) -> DownloadArgs {
        let mut argv = vec![
            "blobsync",
            "--root",
            "/srv/blobs",
            "--source",
            "photos",
            "--destination",
            "/tmp/out",
        ];
        argv.extend_from_slice(extra);
        TestCli::parse_from(argv).args
    }

    #[test]
    fn test_defaults_come_from_config() {
        let mut config = ConfigFile::default();
        config.download.chunk_size = 1024;
        config.skip_on.lmt_ge = true;
        config.concurrency.transfer_threads = 3;

        let (spec, concurrency) = build_specification(&parse(&[]), &config).unwrap();
        assert_eq!(spec.options.chunk_size_bytes, 1024);
        assert!(spec.skip_on.lmt_ge);
        assert!(spec.options.overwrite);
        assert_eq!(spec.sources.len(), 1);
        assert_eq!(spec.destination, PathBuf::from("/tmp/out"));
        assert_eq!(concurrency.transfer_threads, 3);
    }

    #[test]
    fn test_flags_override_config() {
        let args = parse(&[
            "--chunk-size",
            "64K",
            "--mode",
            "page",
            "--no-overwrite",
            "--skip-on-md5",
            "--threads",
            "9",
            "--crypto-workers",
            "2",
            "--source",
            "docs",
        ]);
        let (spec, concurrency) = build_specification(&args, &ConfigFile::default()).unwrap();

        assert_eq!(spec.options.chunk_size_bytes, 64 * 1024);
        assert_eq!(spec.options.mode, StorageMode::Page);
        assert!(!spec.options.overwrite);
        assert!(spec.skip_on.md5_match);
        assert_eq!(spec.sources.len(), 2);
        assert_eq!(concurrency.transfer_threads, 9);
        assert_eq!(concurrency.crypto_workers, 2);
    }

    #[test]
    fn test_key_file_is_loaded() {
        let temp = TempDir::new().unwrap();
        let key = temp.path().join("key");
        std::fs::write(&key, b"secret").unwrap();

        let args = parse(&["--key-file", key.to_str().unwrap()]);
        let (spec, _) = build_specification(&args, &ConfigFile::default()).unwrap();
        let loaded = spec.options.decryption_key.unwrap();
        assert_eq!(loaded.as_bytes(), b"secret");
    }

    #[test]
    fn test_missing_key_file_is_config_error() {
        let args = parse(&["--key-file", "/nonexistent/blobsync/key"]);
        assert!(matches!(
            build_specification(&args, &ConfigFile::default()),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let args = parse(&["--threads", "0"]);
        assert!(build_specification(&args, &ConfigFile::default()).is_err());
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let argv = [
            "blobsync",
            "--root",
            "r",
            "--source",
            "s",
            "--destination",
            "d",
            "--mode",
            "tape",
        ];
        assert!(TestCli::try_parse_from(argv).is_err());
    }
}
