//! Chunked download engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐
//! │ RemoteStore  │──►│ Decision       │── Skip ──► (counted, dropped)
//! │   list()     │   │ Engine         │
//! └──────────────┘   └───────┬────────┘
//!                            │ CheckMd5            Download
//!                            ▼                        │
//!                    ┌────────────────┐  mismatch     │
//!                    │ MD5 offloader  │──────────────►│
//!                    └────────────────┘               ▼
//!                                             ┌───────────────┐
//!                                             │ download queue│
//!                                             └──────┬────────┘
//!                                                    ▼
//!                    ┌────────────────┐      ┌───────────────┐
//!                    │ crypto         │◄─────│ transfer      │
//!                    │ offloader      │      │ workers       │
//!                    └───────┬────────┘      └──────┬────────┘
//!                            └──────────┬───────────┘
//!                                       ▼
//!                              chunk completion
//!                     (write, count, verify, rename into place)
//! ```
//!
//! Each file is assembled in a `<name>.bsdl` temporary next to its target and
//! only renamed into place once every chunk has been written and, when
//! enabled, its MD5 matches.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use blobsync::config::{ConcurrencyOptions, DownloadSpecification};
//! use blobsync::download::Downloader;
//! use blobsync::remote::DirectoryStore;
//!
//! let spec = DownloadSpecification::new("/tmp/out").with_source("photos");
//! let store = Arc::new(DirectoryStore::new("/srv/blobs"));
//! let summary = Downloader::new(spec, store)
//!     .with_concurrency(ConcurrencyOptions::new(8, 2, 0))
//!     .start()?;
//! println!("{} files downloaded", summary.files_downloaded());
//! # Ok::<(), blobsync::DownloadError>(())
//! ```

pub mod checksum;
mod decision;
mod descriptor;
mod local;
mod offload;
mod orchestrator;
mod progress;
mod queue;
mod worker;

pub use decision::{check_download_conditions, DownloadAction, LocalFileState};
pub use descriptor::{
    temp_path_for, ChunkOffsets, DownloadDescriptor, IntegrityOutcome, TEMP_SUFFIX,
};
pub use local::{
    delete_extraneous, ensure_local_destination, local_path_for, restore_modified_time,
};
pub use offload::{
    offloader, ChecksumJob, DecryptJob, DecryptedChunk, InlineOffloader, OffloadJob,
    OffloadResults, Offloader, PooledOffloader,
};
pub use orchestrator::{Downloader, InterruptHandle};
pub use progress::{
    DownloadSummary, ProgressCallback, ProgressReporter, ProgressSnapshot, TransferCounters,
};
pub use queue::WorkQueue;
