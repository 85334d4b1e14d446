//! Fetching one remote file to disk
//!
//! A body is streamed to `<final>.partial` and renamed into place only after
//! its size (and MD5, when the index reports one) has been verified. An
//! existing `.partial` is resumed with a `Range` request.

use crate::config::RetryConfig;
use crate::error::DownloadError;
use crate::index::Session;
use crate::retry::with_backoff;
use crate::types::{Event, JobId, RemoteEntry};
use crate::utils::file_md5;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Suffix of in-progress downloads
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Minimum spacing between progress events for one file
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Per-job context handed to a [`Fetcher`]
#[derive(Clone, Debug)]
pub struct FetchContext {
    /// Job being fetched
    pub id: JobId,
    /// Progress event sink
    pub events: broadcast::Sender<Event>,
    /// Run-wide cancellation
    pub cancel: CancellationToken,
}

impl FetchContext {
    fn emit(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine
        self.events.send(event).ok();
    }
}

/// Moves one remote file to its final local path
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `entry` to `dest`; returns the final size in bytes
    ///
    /// On success `dest` holds the complete, verified body. On failure nothing
    /// is left at `dest`.
    async fn fetch(
        &self,
        entry: &RemoteEntry,
        dest: &Path,
        ctx: &FetchContext,
    ) -> Result<u64, DownloadError>;
}

/// Path of the in-progress file for a destination
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn io_error(path: &Path, e: impl std::fmt::Display) -> DownloadError {
    DownloadError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn network_error(url: &str, e: &reqwest::Error) -> DownloadError {
    DownloadError::Network {
        url: url.to_string(),
        reason: e.to_string(),
        transient: e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
    }
}

/// HTTP implementation of [`Fetcher`]
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    session: Session,
    retry: RetryConfig,
}

impl HttpFetcher {
    /// Create a fetcher sharing the index session (and its credentials)
    pub fn new(session: Session, retry: RetryConfig) -> Self {
        Self { session, retry }
    }

    /// One attempt: resume or start the partial file, stream, verify, rename
    async fn attempt(
        &self,
        entry: &RemoteEntry,
        dest: &Path,
        ctx: &FetchContext,
    ) -> Result<u64, DownloadError> {
        let partial = partial_path(dest);
        let url = entry.download_url.as_str();

        let mut existing = match tokio::fs::metadata(&partial).await {
            Ok(m) => m.len(),
            Err(_) => 0,
        };
        if let Some(expected) = entry.size
            && existing > expected
        {
            tracing::warn!(path = %partial.display(), existing, expected, "Partial file larger than entry, restarting");
            tokio::fs::remove_file(&partial)
                .await
                .map_err(|e| io_error(&partial, e))?;
            existing = 0;
        }

        let complete_on_disk = entry.size.is_some_and(|s| s == existing && s > 0);
        if !complete_on_disk {
            existing = self.stream_body(entry, &partial, existing, ctx).await?;
        }

        verify(entry, &partial, existing).await?;

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| io_error(dest, e))?;
        tracing::debug!(url, path = %dest.display(), bytes = existing, "Download verified");
        Ok(existing)
    }

    /// Stream the body into `partial`, returning the bytes on disk afterwards
    async fn stream_body(
        &self,
        entry: &RemoteEntry,
        partial: &Path,
        resume_from: u64,
        ctx: &FetchContext,
    ) -> Result<u64, DownloadError> {
        let url = entry.download_url.as_str();
        let mut request = self.session.client().get(url);
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_from));
        }

        let response = tokio::select! {
            r = self.session.authorize(request).send() => r.map_err(|e| network_error(url, &e))?,
            _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        let status = response.status();
        let append = match status {
            reqwest::StatusCode::PARTIAL_CONTENT if resume_from > 0 => true,
            s if s.is_success() => false,
            reqwest::StatusCode::RANGE_NOT_SATISFIABLE => {
                // The partial file no longer lines up with the remote body
                tokio::fs::remove_file(partial).await.ok();
                return Err(DownloadError::Network {
                    url: url.to_string(),
                    reason: "range not satisfiable, restarting".to_string(),
                    transient: true,
                });
            }
            s => {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: s.as_u16(),
                });
            }
        };

        let mut written = if append { resume_from } else { 0 };
        if resume_from > 0 && !append {
            tracing::debug!(url, "Server ignored range request, restarting from zero");
        }
        let total = entry
            .size
            .or_else(|| response.content_length().map(|len| len + written));

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(partial)
            .await
            .map_err(|e| io_error(partial, e))?;

        let mut stream = response.bytes_stream();
        let mut last_emit = Instant::now();
        let mut since_emit: u64 = 0;

        loop {
            let chunk = tokio::select! {
                c = stream.next() => c,
                _ = ctx.cancel.cancelled() => {
                    file.flush().await.ok();
                    return Err(DownloadError::Cancelled);
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| network_error(url, &e))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| io_error(partial, e))?;
            written += chunk.len() as u64;
            since_emit += chunk.len() as u64;

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                ctx.emit(Event::Downloading {
                    id: ctx.id,
                    downloaded_bytes: written,
                    total_bytes: total,
                    delta_bytes: since_emit,
                });
                since_emit = 0;
                last_emit = Instant::now();
            }
        }

        file.flush().await.map_err(|e| io_error(partial, e))?;
        file.sync_all().await.map_err(|e| io_error(partial, e))?;

        if since_emit > 0 {
            ctx.emit(Event::Downloading {
                id: ctx.id,
                downloaded_bytes: written,
                total_bytes: total,
                delta_bytes: since_emit,
            });
        }

        if entry.size.is_none()
            && let Some(expected) = total
            && expected != written
        {
            return Err(DownloadError::SizeMismatch {
                path: partial.to_path_buf(),
                expected,
                actual: written,
            });
        }
        Ok(written)
    }
}

/// Check the partial file against the advertised size and checksum
async fn verify(entry: &RemoteEntry, partial: &Path, written: u64) -> Result<(), DownloadError> {
    let actual = tokio::fs::metadata(partial)
        .await
        .map_err(|e| io_error(partial, e))?
        .len();
    if actual != written {
        return Err(DownloadError::SizeMismatch {
            path: partial.to_path_buf(),
            expected: written,
            actual,
        });
    }
    if let Some(expected) = entry.size
        && expected != actual
    {
        return Err(DownloadError::SizeMismatch {
            path: partial.to_path_buf(),
            expected,
            actual,
        });
    }

    if let Some(expected) = entry.md5.as_deref() {
        let path = partial.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || file_md5(&path))
            .await
            .map_err(|e| io_error(partial, e))?
            .map_err(|e| io_error(partial, e))?;
        if !actual.eq_ignore_ascii_case(expected) {
            // A corrupt body cannot be resumed
            tokio::fs::remove_file(partial).await.ok();
            return Err(DownloadError::HashMismatch {
                path: partial.to_path_buf(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        entry: &RemoteEntry,
        dest: &Path,
        ctx: &FetchContext,
    ) -> Result<u64, DownloadError> {
        if let Ok(meta) = tokio::fs::metadata(dest).await
            && meta.is_file()
            && entry.size.is_none_or(|s| s == meta.len())
        {
            tracing::info!(path = %dest.display(), "File already present, skipping download");
            return Ok(meta.len());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        with_backoff(&self.retry, || self.attempt(entry, dest, ctx)).await
    }
}
