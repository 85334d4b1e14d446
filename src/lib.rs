//! # index-mirror
//!
//! Mirrors a folder of a web-based cloud index (GoIndex, GDIndex, OneDrive
//! index) to local disk, extracts the archives it finds, and optionally
//! pushes the result to an rclone remote.
//!
//! A run is a batch pipeline:
//!
//! 1. **List** the folder through the site adapter for its front-end
//! 2. **Filter** by listing position and skip entries the bookkeeping store
//!    already knows
//! 3. **Download** with a bounded worker pool
//! 4. **Extract** RAR/7z/ZIP archives, trying cached and configured passwords
//! 5. **Upload** each finished batch with rclone
//! 6. **Record** completions so the next run is incremental
//!
//! ## Quick Start
//!
//! ```no_run
//! use index_mirror::{NoOpStore, Pipeline, RunConfig, SiteType};
//! use std::sync::Arc;
//! use tokio::sync::broadcast;
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let url = Url::parse("https://index.example/0:/Shows/")?;
//!     let config = RunConfig::new(url, SiteType::AchrouGoIndex);
//!
//!     let (events, _) = broadcast::channel(1024);
//!     let pipeline = Pipeline::new(config, Arc::new(NoOpStore), events, CancellationToken::new())?;
//!
//!     let summary = pipeline.run().await?;
//!     println!("{} transferred, {} failed", summary.done, summary.failed());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Bookkeeping stores (completed transfers, archive passwords)
pub mod bookkeeping;
/// Command-line interface
pub mod cli;
/// Configuration types
pub mod config;
/// Bounded-concurrency download pool
pub mod downloader;
/// Error types
pub mod error;
/// Archive extraction
pub mod extraction;
/// Remote index listing
pub mod index;
/// Run driver
pub mod pipeline;
/// Terminal progress display
pub mod progress;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Upload through an external sync tool
pub mod upload;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use bookkeeping::{BookkeepingStore, CompletionRecord, NoOpStore, SqliteStore, open_store};
pub use config::{EnvConfig, RunConfig, SiteType};
pub use error::{
    DownloadError, Error, ExtractionError, ListingError, Result, StoreError, UploadError,
};
pub use pipeline::{Pipeline, RunSummary, exit};
pub use types::{Event, JobFailure, JobId, JobStatus, RemoteEntry, Stage, TransferJob};

/// Cancel `token` when the process receives a termination signal
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// In-flight downloads stop at the next chunk and keep their `.partial`
/// file; the pipeline then reports the run as interrupted.
pub async fn cancel_on_signal(token: tokio_util::sync::CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => token.cancel(),
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, stopping after in-flight work");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, stopping after in-flight work");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT, stopping after in-flight work");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM, stopping after in-flight work");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C, stopping after in-flight work");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
