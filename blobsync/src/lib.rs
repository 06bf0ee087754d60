//! blobsync - chunked, verified downloads from blob and file stores
//!
//! This library decides per remote file whether a transfer is needed, splits
//! the transfers it does need into fixed-size chunks, fetches those chunks on
//! a pool of worker threads, optionally decrypts them off the I/O path, and
//! only moves a local file into place once every chunk has landed.
//!
//! The entry point is [`download::Downloader`]. Remote access is abstracted by
//! [`remote::RemoteStore`]; two stores ship with the crate
//! ([`remote::DirectoryStore`] and [`remote::MemoryStore`]).

pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod remote;

pub use error::{DownloadError, DownloadResult};

/// Crate version, as reported by the CLI banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
