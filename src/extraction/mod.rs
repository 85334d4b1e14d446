//! Archive extraction with password support
//!
//! This module extracts RAR, 7z, and ZIP archives after they are downloaded.
//! Passwords are tried in order: the one cached in the bookkeeping store for
//! the archive's MD5, then the empty password, then the password file.
//!
//! Single archives are extracted inside the download worker as soon as their
//! body lands. Multi-volume RAR sets wait for the batch barrier and are
//! handled by [`ArchiveProcessor::process_volume_sets`].

mod password_list;
mod rar;
mod sevenz;
mod shared;
mod zip;


// Re-exports
pub use password_list::PasswordList;
pub use rar::RarExtractor;
pub use sevenz::SevenZipExtractor;
pub use shared::{ArchiveKind, Extracted, classify, detect_archive_type};
pub use zip::ZipExtractor;

use crate::bookkeeping::BookkeepingStore;
use crate::config::{ExtractionConfig, ToolsConfig};
use crate::downloader::AfterDownload;
use crate::error::{Error, ExtractionError, Result};
use crate::types::{ArchiveType, Event, JobFailure, JobStatus, Stage, TransferJob};
use crate::utils::{archive_stem, file_md5, parse_volume_name};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Extracts downloaded archives and keeps the password cache up to date
pub struct ArchiveProcessor {
    config: ExtractionConfig,
    tools: ToolsConfig,
    store: Arc<dyn BookkeepingStore>,
    events: broadcast::Sender<Event>,
}

/// Volumes of one multi-volume set found on disk
#[derive(Debug, PartialEq, Eq)]
struct VolumeSet {
    /// Every volume file, ordered by volume number
    volumes: Vec<PathBuf>,
}

impl ArchiveProcessor {
    /// Create a processor
    pub fn new(
        config: ExtractionConfig,
        tools: ToolsConfig,
        store: Arc<dyn BookkeepingStore>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            tools,
            store,
            events,
        }
    }

    /// Directory an archive is extracted into
    pub fn destination(&self, archive: &Path) -> PathBuf {
        let parent = archive.parent().unwrap_or(Path::new("."));
        if !self.config.into_subdir {
            return parent.to_path_buf();
        }
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parent.join(archive_stem(&name))
    }

    /// MD5 of an archive, only computed when a store will use it
    async fn archive_md5(&self, archive: &Path) -> Option<String> {
        if !self.store.enabled() {
            return None;
        }
        let path = archive.to_path_buf();
        match tokio::task::spawn_blocking(move || file_md5(&path)).await {
            Ok(Ok(md5)) => Some(md5),
            Ok(Err(e)) => {
                warn!(archive = %archive.display(), error = %e, "cannot hash archive");
                None
            }
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "hashing task failed");
                None
            }
        }
    }

    /// Extract one archive (or the first volume of a set)
    ///
    /// On success with a non-empty password, the password is saved to the
    /// store keyed by the archive's MD5.
    pub async fn extract(&self, archive: &Path) -> Result<Extracted> {
        let archive_type =
            detect_archive_type(archive).ok_or_else(|| ExtractionError::UnknownType {
                archive: archive.to_path_buf(),
            })?;
        let dest = self.destination(archive);

        let md5 = self.archive_md5(archive).await;
        let cached = match &md5 {
            Some(hash) => self.store.cached_password(hash).await?,
            None => None,
        };
        let passwords = PasswordList::collect(
            cached.as_deref(),
            self.tools.password_file.as_deref(),
            self.tools.try_empty_password,
        )
        .await;

        info!(
            archive = %archive.display(),
            dest = %dest.display(),
            ?archive_type,
            "extracting archive"
        );

        let extracted = match archive_type {
            ArchiveType::Rar => {
                RarExtractor::locate(self.tools.unrar_path.as_deref())?
                    .extract_with_passwords(archive, &dest, &passwords)
                    .await?
            }
            ArchiveType::SevenZip => {
                SevenZipExtractor::extract_with_passwords(archive, &dest, &passwords).await?
            }
            ArchiveType::Zip => {
                ZipExtractor::extract_with_passwords(archive, &dest, &passwords).await?
            }
        };

        if !extracted.password.is_empty()
            && let Some(hash) = &md5
        {
            let filename = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.store
                .save_password(&filename, hash, &extracted.password)
                .await?;
        }

        Ok(extracted)
    }

    fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }

    fn fail_job(&self, job: &mut TransferJob, error: &Error) {
        self.emit(Event::JobFailed {
            id: job.id,
            stage: Stage::Extract,
            error: error.to_string(),
        });
        job.fail(JobFailure::new(Stage::Extract, error));
    }

    /// Remove archive files after a successful extraction
    async fn delete_archives(&self, archives: &[PathBuf]) {
        for archive in archives {
            match tokio::fs::remove_file(archive).await {
                Ok(()) => debug!(archive = %archive.display(), "deleted archive"),
                Err(e) => warn!(archive = %archive.display(), error = %e, "failed to delete archive"),
            }
        }
    }

    async fn extract_single(&self, job: &mut TransferJob) {
        let archive = job.local_path.clone();
        if let Err(e) = job.advance(JobStatus::Extracting) {
            warn!(job_id = job.id.0, error = %e, "job not ready for extraction");
            return;
        }
        self.emit(Event::Extracting {
            id: job.id,
            archive: job.entry.name.clone(),
        });

        match self.extract(&archive).await {
            Ok(extracted) => {
                self.emit(Event::ExtractComplete {
                    id: job.id,
                    files: extracted.files.len(),
                });
                job.record_outputs(extracted.files);
                if job.advance(JobStatus::Extracted).is_ok() && self.config.delete_after {
                    self.delete_archives(std::slice::from_ref(&archive)).await;
                }
            }
            Err(e) => {
                warn!(job_id = job.id.0, archive = %archive.display(), error = %e, "extraction failed");
                self.fail_job(job, &e);
            }
        }
    }

    /// Extract every multi-volume set that finished downloading in this batch
    ///
    /// Volumes are grouped by directory and set name. A set extracts only
    /// when no volume of it failed in this batch and the volumes on disk are
    /// numbered contiguously from 1. Every job of a set ends in the same
    /// state.
    pub async fn process_volume_sets(&self, jobs: &mut [TransferJob]) {
        let mut sets: BTreeMap<(PathBuf, String), Vec<usize>> = BTreeMap::new();
        let mut failed_sets: BTreeMap<(PathBuf, String), String> = BTreeMap::new();

        for (i, job) in jobs.iter().enumerate() {
            let Some(key) = volume_key(&job.local_path) else {
                continue;
            };
            match job.status() {
                JobStatus::Downloaded => sets.entry(key).or_default().push(i),
                JobStatus::Failed => {
                    failed_sets.entry(key).or_insert_with(|| job.entry.name.clone());
                }
                _ => {}
            }
        }

        for (key, members) in sets {
            let (dir, _) = &key;
            let first_job = members.iter().copied().min_by_key(|&i| {
                jobs[i]
                    .local_path
                    .file_name()
                    .and_then(|n| parse_volume_name(&n.to_string_lossy()))
                    .map(|v| v.number)
                    .unwrap_or(u32::MAX)
            });
            let Some(first_job) = first_job else {
                continue;
            };
            let set_name = jobs[first_job].entry.name.clone();

            let set = match failed_sets.get(&key) {
                Some(failed_volume) => Err(Error::from(ExtractionError::IncompleteSet {
                    archive: jobs[first_job].local_path.clone(),
                    reason: format!("volume {} failed to download", failed_volume),
                })),
                None => scan_volume_set(dir, &key.1, &jobs[first_job].local_path).await,
            };

            let outcome = match set {
                Ok(set) => {
                    for &i in &members {
                        jobs[i].advance(JobStatus::Extracting).ok();
                    }
                    self.emit(Event::Extracting {
                        id: jobs[first_job].id,
                        archive: set_name.clone(),
                    });
                    match set.volumes.first().cloned() {
                        Some(first) => self.extract(&first).await.map(|e| (e, set)),
                        None => Err(Error::Other("empty volume set".to_string())),
                    }
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok((extracted, set)) => {
                    info!(
                        set = %set_name,
                        volumes = set.volumes.len(),
                        files = extracted.files.len(),
                        "multi-volume set extracted"
                    );
                    self.emit(Event::ExtractComplete {
                        id: jobs[first_job].id,
                        files: extracted.files.len(),
                    });
                    jobs[first_job].record_outputs(extracted.files);
                    for &i in &members {
                        jobs[i].advance(JobStatus::Extracted).ok();
                    }
                    if self.config.delete_after {
                        self.delete_archives(&set.volumes).await;
                    }
                }
                Err(e) => {
                    warn!(set = %set_name, error = %e, "multi-volume set not extracted");
                    for &i in &members {
                        self.fail_job(&mut jobs[i], &e);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AfterDownload for ArchiveProcessor {
    async fn after_download(&self, job: &mut TransferJob) {
        match classify(&job.local_path) {
            ArchiveKind::Plain => {
                job.advance(JobStatus::Extracted).ok();
            }
            // Waits for the batch barrier
            ArchiveKind::Volume => {}
            ArchiveKind::Single(_) => self.extract_single(job).await,
        }
    }
}

/// Grouping key for a volume: its directory and lowercased set name
pub(crate) fn volume_key(path: &Path) -> Option<(PathBuf, String)> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    let volume = parse_volume_name(&name)?;
    let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    Some((dir, volume.stem.to_lowercase()))
}

/// Find every volume of a set on disk and check none is missing
async fn scan_volume_set(dir: &Path, stem: &str, reference: &Path) -> Result<VolumeSet> {
    let incomplete = |reason: String| {
        Error::from(ExtractionError::IncompleteSet {
            archive: reference.to_path_buf(),
            reason,
        })
    };

    let mut found: Vec<(u32, PathBuf)> = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| incomplete(format!("cannot read {}: {}", dir.display(), e)))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| incomplete(format!("cannot read {}: {}", dir.display(), e)))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(volume) = parse_volume_name(&name)
            && volume.stem.to_lowercase() == stem
        {
            found.push((volume.number, entry.path()));
        }
    }
    found.sort();

    let missing: Vec<String> = (1..=found.last().map(|(n, _)| *n).unwrap_or(0))
        .filter(|n| !found.iter().any(|(f, _)| f == n))
        .map(|n| n.to_string())
        .collect();
    if found.is_empty() || !missing.is_empty() {
        return Err(incomplete(format!(
            "missing volume(s) {}",
            if missing.is_empty() {
                "1".to_string()
            } else {
                missing.join(", ")
            }
        )));
    }

    Ok(VolumeSet {
        volumes: found.into_iter().map(|(_, p)| p).collect(),
    })
}
