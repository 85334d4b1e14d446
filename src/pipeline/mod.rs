//! Run driver: list, filter, batch, download, extract, upload, record
//!
//! Each batch runs to a barrier: every download (and the extraction of
//! single archives, which happens inside the download workers) finishes
//! before multi-volume sets are extracted and the batch is uploaded.

pub mod summary;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use summary::{FailedJob, RunSummary, exit};

use crate::bookkeeping::{BookkeepingStore, CompletionRecord};
use crate::config::{RetryConfig, RunConfig};
use crate::downloader::{DownloadManager, Fetcher, HttpFetcher};
use crate::error::{DownloadError, Error, Result, UploadError};
use crate::extraction::{ArchiveProcessor, volume_key};
use crate::index::{IndexClient, Session, adapter_for};
use crate::types::{Event, JobFailure, JobId, JobStatus, RemoteEntry, Stage, TransferJob};
use crate::upload::{Rclone, SyncTool, UploadManager};
use crate::utils::remote_to_relative_path;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One configured run
pub struct Pipeline {
    config: RunConfig,
    index: IndexClient,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn BookkeepingStore>,
    processor: Arc<ArchiveProcessor>,
    uploader: Option<UploadManager>,
    events: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Wire up the index client, downloader, extractor and uploader
    ///
    /// With upload enabled, a missing rclone binary is reported here, before
    /// anything is downloaded.
    pub fn new(
        config: RunConfig,
        store: Arc<dyn BookkeepingStore>,
        events: broadcast::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let sync_tool: Option<Arc<dyn SyncTool>> = match &config.upload {
            Some(upload) => Some(Arc::new(
                Rclone::locate(config.tools.rclone_path.as_deref())?
                    .with_config_file(upload.rclone_config.clone())
                    .with_options(upload.options.clone()),
            )),
            None => None,
        };
        Self::with_sync_tool(config, store, events, cancel, sync_tool)
    }

    /// Like [`Pipeline::new`] with an explicit sync tool
    ///
    /// The tool is ignored when upload is not configured.
    pub fn with_sync_tool(
        config: RunConfig,
        store: Arc<dyn BookkeepingStore>,
        events: broadcast::Sender<Event>,
        cancel: CancellationToken,
        sync_tool: Option<Arc<dyn SyncTool>>,
    ) -> Result<Self> {
        let session = Session::new(config.credentials.clone(), config.connect_timeout)?;
        let listing_retry = RetryConfig {
            max_attempts: config.listing_retries,
            ..config.retry.clone()
        };
        let index = IndexClient::new(
            session.clone(),
            adapter_for(config.site_type),
            config.url.clone(),
            listing_retry,
        );
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(session, config.retry.clone()));

        let uploader = match (&config.upload, sync_tool) {
            (Some(upload), Some(tool)) => {
                Some(UploadManager::new(tool, upload.clone(), events.clone()))
            }
            _ => None,
        };

        let processor = Arc::new(ArchiveProcessor::new(
            config.extraction.clone(),
            config.tools.clone(),
            store.clone(),
            events.clone(),
        ));

        Ok(Self {
            config,
            index,
            fetcher,
            store,
            processor,
            uploader,
            events,
            cancel,
        })
    }

    /// Replace the HTTP fetcher
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }

    /// Run every batch and summarize
    ///
    /// Only a listing failure or a required store failing aborts the run;
    /// everything else is recorded per job.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        let entries = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                summary.interrupted = true;
                return Ok(summary);
            }
            listed = self.index.list_all() => listed?,
        };
        summary.listed = entries.len();

        let selected = self.config.filter.apply(entries);
        summary.selected = selected.len();
        if selected.is_empty() {
            info!(listed = summary.listed, "nothing to do");
            return Ok(summary);
        }

        let folder = remote_to_relative_path(&self.index.folder_path());
        let staged = self.config.base_folder.join(&folder);
        let relative_folder = folder
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let jobs = build_jobs(&self.config.base_folder, selected);
        let batches = split_batches(jobs, self.config.batch_limit);
        let batch_count = batches.len();

        for (n, batch) in batches.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(batch = n + 1, of = batch_count, jobs = batch.len(), "starting batch");
            summary.batches += 1;
            let finished = self
                .run_batch(batch, &staged, &relative_folder, &mut summary)
                .await?;
            for job in &finished {
                summary.record(job);
            }
        }

        summary.interrupted = self.cancel.is_cancelled();
        Ok(summary)
    }

    async fn run_batch(
        &self,
        mut batch: Vec<TransferJob>,
        staged: &Path,
        relative_folder: &str,
        summary: &mut RunSummary,
    ) -> Result<Vec<TransferJob>> {
        self.emit(Event::BatchStarted {
            jobs: batch.len(),
            total_bytes: batch.iter().filter_map(|j| j.entry.size).sum(),
        });

        for job in &mut batch {
            if job.status() == JobStatus::Pending && self.store.has_completed(job.entry.key()).await? {
                job.skip()?;
                info!(job_id = job.id.0, path = %job.entry.path, "already transferred, skipping");
                self.emit(Event::JobSkipped {
                    id: job.id,
                    name: job.entry.name.clone(),
                });
            }
        }

        let manager = DownloadManager::new(
            self.fetcher.clone(),
            self.config.simultaneous,
            self.events.clone(),
            self.cancel.clone(),
        );
        let mut jobs = manager.run(batch, self.processor.clone()).await;

        if self.cancel.is_cancelled() {
            return Ok(jobs);
        }

        self.processor.process_volume_sets(&mut jobs).await;

        let destination = self.upload_batch(&mut jobs, staged, relative_folder, summary).await;

        for job in &mut jobs {
            if job.status() == JobStatus::Extracted && self.config.upload.is_none() {
                job.advance(JobStatus::Done)?;
            }
            if job.status() != JobStatus::Done {
                continue;
            }
            let record = CompletionRecord {
                name: job.entry.name.clone(),
                size: job.entry.size,
                md5: job.entry.md5.clone(),
                destination: destination.clone(),
            };
            self.store.mark_completed(job.entry.key(), &record).await?;
            self.emit(Event::JobDone { id: job.id });
        }

        Ok(jobs)
    }

    /// Upload the batch if enabled; returns the target on success
    async fn upload_batch(
        &self,
        jobs: &mut [TransferJob],
        staged: &Path,
        relative_folder: &str,
        summary: &mut RunSummary,
    ) -> Option<String> {
        let uploader = self.uploader.as_ref()?;
        let best_effort = self.config.upload.as_ref().is_some_and(|u| u.best_effort);

        let ready: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status() == JobStatus::Extracted)
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            return None;
        }

        let failed = jobs.iter().filter(|j| j.status() == JobStatus::Failed).count();
        if failed > 0 && !best_effort {
            let skipped = UploadError::SkippedAfterFailures { failed };
            warn!(error = %skipped, ready = ready.len(), "not uploading this batch");
            return None;
        }

        // Archives whose extraction failed stay on disk for the next run
        let kept: HashSet<&Path> = jobs
            .iter()
            .filter(|j| j.failure().is_some_and(|f| f.stage == Stage::Extract))
            .map(|j| j.local_path.as_path())
            .collect();
        let uploaded: Vec<PathBuf> = ready
            .iter()
            .flat_map(|&i| jobs[i].local_files())
            .filter(|p| !kept.contains(p.as_path()))
            .collect();

        for &i in &ready {
            jobs[i].advance(JobStatus::Uploading).ok();
        }

        match uploader.upload(staged, relative_folder, uploaded).await {
            Ok(target) => {
                for &i in &ready {
                    jobs[i].advance(JobStatus::Done).ok();
                }
                Some(target)
            }
            Err(e) => {
                let error = Error::Upload(e);
                summary.upload_errors.push(error.to_string());
                for &i in &ready {
                    self.emit(Event::JobFailed {
                        id: jobs[i].id,
                        stage: Stage::Upload,
                        error: error.to_string(),
                    });
                    jobs[i].fail(JobFailure::new(Stage::Upload, &error));
                }
                None
            }
        }
    }
}

/// Create one job per selected entry
///
/// A later entry whose local path is already taken fails with
/// [`DownloadError::PathCollision`] instead of overwriting the earlier one.
pub fn build_jobs(base_folder: &Path, selected: Vec<(usize, RemoteEntry)>) -> Vec<TransferJob> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    selected
        .into_iter()
        .enumerate()
        .map(|(n, (index, entry))| {
            let relative = remote_to_relative_path(&entry.path);
            let local_path = base_folder.join(&relative);
            let collides = relative.as_os_str().is_empty() || !seen.insert(local_path.clone());
            let mut job = TransferJob::new(JobId(n as u64 + 1), index, entry, local_path);
            if collides {
                let error = Error::Download(DownloadError::PathCollision {
                    path: job.local_path.clone(),
                });
                warn!(job_id = job.id.0, path = %job.entry.path, error = %error, "skipping entry");
                job.fail(JobFailure::new(Stage::Download, &error));
            }
            job
        })
        .collect()
}

/// Split jobs into batches of at most `limit`, never splitting a volume set
///
/// A batch that reaches the limit in the middle of a multi-volume set is
/// extended until the set is complete.
pub fn split_batches(jobs: Vec<TransferJob>, limit: Option<usize>) -> Vec<Vec<TransferJob>> {
    let Some(limit) = limit else {
        return if jobs.is_empty() { Vec::new() } else { vec![jobs] };
    };

    let mut batches = Vec::new();
    let mut current: Vec<TransferJob> = Vec::new();
    let mut open_sets: HashSet<(PathBuf, String)> = HashSet::new();

    for job in jobs {
        let key = volume_key(&job.local_path);
        let continues_set = key.as_ref().is_some_and(|k| open_sets.contains(k));
        if current.len() >= limit.max(1) && !continues_set {
            batches.push(std::mem::take(&mut current));
            open_sets.clear();
        }
        if let Some(key) = key {
            open_sets.insert(key);
        }
        current.push(job);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
