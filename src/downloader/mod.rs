//! Bounded-concurrency download pool
//!
//! - [`fetch`] - streaming a single file with resume and verification
//!
//! The [`DownloadManager`] runs one task per job. Permits from a semaphore
//! are acquired in listing order, so at most `concurrency` bodies are in
//! flight and submission order follows the listing. Finished jobs come back
//! over an mpsc channel in completion order.

pub mod fetch;


pub use fetch::{FetchContext, Fetcher, HttpFetcher, partial_path};

use crate::error::{DownloadError, Error};
use crate::types::{Event, JobFailure, JobStatus, Stage, TransferJob};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Work done on a job right after its body lands, inside the same task
///
/// Runs after the download permit is released, so it overlaps other
/// downloads without counting against the concurrency limit.
#[async_trait]
pub trait AfterDownload: Send + Sync {
    /// Continue the job; failures are recorded on the job itself
    async fn after_download(&self, job: &mut TransferJob);
}

/// Leaves downloaded jobs as they are
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFollowUp;

#[async_trait]
impl AfterDownload for NoFollowUp {
    async fn after_download(&self, _job: &mut TransferJob) {}
}

/// Runs a batch of jobs through a [`Fetcher`] with bounded concurrency
pub struct DownloadManager {
    fetcher: Arc<dyn Fetcher>,
    concurrency: usize,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl DownloadManager {
    /// Create a manager; `concurrency` is clamped to at least 1
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        concurrency: usize,
        event_tx: broadcast::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
            event_tx,
            cancel,
        }
    }

    /// Download every pending job, then hand each to `follow_up`
    ///
    /// Jobs that are not pending (already skipped or failed) pass through
    /// untouched. If the run is cancelled, jobs that were never started are
    /// failed with [`DownloadError::Cancelled`]. Returned jobs are in listing
    /// order.
    pub async fn run(
        &self,
        jobs: Vec<TransferJob>,
        follow_up: Arc<dyn AfterDownload>,
    ) -> Vec<TransferJob> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::channel::<TransferJob>(jobs.len().max(1));
        let mut finished = Vec::with_capacity(jobs.len());

        for mut job in jobs {
            if job.status() != JobStatus::Pending {
                finished.push(job);
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                p = semaphore.clone().acquire_owned() => p.ok(),
            };
            let Some(permit) = permit else {
                job.fail(JobFailure::new(
                    Stage::Download,
                    &Error::Download(DownloadError::Cancelled),
                ));
                finished.push(job);
                continue;
            };

            let fetcher = self.fetcher.clone();
            let follow_up = follow_up.clone();
            let ctx = FetchContext {
                id: job.id,
                events: self.event_tx.clone(),
                cancel: self.cancel.clone(),
            };
            let tx = tx.clone();

            tokio::spawn(async move {
                let downloaded = download_one(fetcher.as_ref(), &mut job, &ctx).await;
                drop(permit);
                if downloaded {
                    follow_up.after_download(&mut job).await;
                }
                if tx.send(job).await.is_err() {
                    tracing::error!("Download outcome receiver dropped");
                }
            });
        }
        drop(tx);

        while let Some(job) = rx.recv().await {
            finished.push(job);
        }
        finished.sort_by_key(|j| j.index);
        finished
    }
}

/// Fetch one job's body and record the outcome on the job; true when downloaded
async fn download_one(fetcher: &dyn Fetcher, job: &mut TransferJob, ctx: &FetchContext) -> bool {
    if let Err(e) = job.advance(JobStatus::Downloading) {
        tracing::error!(job_id = %job.id, error = %e, "Job not startable");
        return false;
    }
    ctx.events
        .send(Event::DownloadStarted {
            id: job.id,
            name: job.entry.name.clone(),
            total_bytes: job.entry.size,
        })
        .ok();
    tracing::debug!(job_id = %job.id, url = %job.entry.download_url, path = %job.local_path.display(), "Download started");

    match fetcher.fetch(&job.entry, &job.local_path, ctx).await {
        Ok(bytes) => {
            if let Err(e) = job.advance(JobStatus::Downloaded) {
                tracing::error!(job_id = %job.id, error = %e, "Unexpected job state");
                return false;
            }
            ctx.events.send(Event::DownloadComplete { id: job.id }).ok();
            tracing::info!(job_id = %job.id, name = %job.entry.name, bytes, "Downloaded");
            true
        }
        Err(e) => {
            let error = Error::Download(e);
            if matches!(error, Error::Download(DownloadError::Cancelled)) {
                tracing::info!(job_id = %job.id, name = %job.entry.name, "Download cancelled, partial file kept");
            } else {
                tracing::warn!(job_id = %job.id, name = %job.entry.name, error = %error, "Download failed");
            }
            ctx.events
                .send(Event::JobFailed {
                    id: job.id,
                    stage: Stage::Download,
                    error: error.to_string(),
                })
                .ok();
            job.fail(JobFailure::new(Stage::Download, &error));
            false
        }
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("concurrency", &self.concurrency)
            .finish()
    }
}
