//! Core types for index-mirror

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Identifier of a transfer job within one run
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Get the inner value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One file discovered on a remote index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// File name as shown by the index (decoded)
    pub name: String,
    /// Path relative to the index root, including the file name
    pub path: String,
    /// Size in bytes, when the index reports it
    pub size: Option<u64>,
    /// Absolute URL the file body is fetched from
    pub download_url: String,
    /// MD5 checksum (lowercase hex), when the index reports it
    pub md5: Option<String>,
}

impl RemoteEntry {
    /// Stable bookkeeping key for this entry
    pub fn key(&self) -> &str {
        &self.path
    }
}

/// Lifecycle of a transfer job
///
/// Statuses are ordered; a job only moves forward. `Failed` and `Skipped` are
/// terminal and reachable from any non-terminal state.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created from the listing, not started
    Pending,
    /// Body is being fetched
    Downloading,
    /// Body is complete at its final path
    Downloaded,
    /// Archive extraction running
    Extracting,
    /// Extraction finished, or nothing to extract
    Extracted,
    /// Included in a running upload
    Uploading,
    /// Fully transferred
    Done,
    /// Already recorded as complete by the bookkeeping store
    Skipped,
    /// Failed at some stage
    Failed,
}

impl JobStatus {
    /// Whether the job has stopped moving
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Skipped | JobStatus::Failed)
    }

    /// Lowercase name used in logs and summaries
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Downloaded => "downloaded",
            JobStatus::Extracting => "extracting",
            JobStatus::Extracted => "extracted",
            JobStatus::Uploading => "uploading",
            JobStatus::Done => "done",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage, used to attribute failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Fetching the file body
    Download,
    /// Extracting an archive
    Extract,
    /// Pushing to the sync remote
    Upload,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Upload => "upload",
        })
    }
}

/// Archive type detected by file extension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    /// RAR archive (.rar)
    Rar,
    /// 7-Zip archive (.7z)
    SevenZip,
    /// ZIP archive (.zip)
    Zip,
}

/// Why a job failed, kept for the run summary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Stage where the failure happened
    pub stage: Stage,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl JobFailure {
    /// Capture an error at a given stage
    pub fn new(stage: Stage, error: &Error) -> Self {
        Self {
            stage,
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }
}

/// One (remote entry -> local path) mapping moving through the pipeline
#[derive(Clone, Debug)]
pub struct TransferJob {
    /// Job identifier, unique within the run
    pub id: JobId,
    /// 1-based position in the full listing
    pub index: usize,
    /// The remote file
    pub entry: RemoteEntry,
    /// Final local path
    pub local_path: PathBuf,
    status: JobStatus,
    failure: Option<JobFailure>,
    outputs: Vec<PathBuf>,
}

impl TransferJob {
    /// Create a pending job
    pub fn new(id: JobId, index: usize, entry: RemoteEntry, local_path: PathBuf) -> Self {
        Self {
            id,
            index,
            entry,
            local_path,
            status: JobStatus::Pending,
            failure: None,
            outputs: Vec::new(),
        }
    }

    /// Current status
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Failure details, if the job failed
    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    /// Remember the files extraction produced for this job
    pub fn record_outputs(&mut self, files: Vec<PathBuf>) {
        self.outputs = files;
    }

    /// Files extraction produced for this job
    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    /// Every local file this job is responsible for: the download itself
    /// plus anything extracted from it
    pub fn local_files(&self) -> Vec<PathBuf> {
        std::iter::once(self.local_path.clone())
            .chain(self.outputs.iter().cloned())
            .collect()
    }

    /// Move the job forward
    ///
    /// Stages may be skipped but never revisited. Terminal jobs do not move.
    pub fn advance(&mut self, to: JobStatus) -> Result<()> {
        if self.status.is_terminal()
            || to <= self.status
            || matches!(to, JobStatus::Failed | JobStatus::Skipped)
        {
            return Err(Error::InvalidTransition {
                job: self.id.0,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Mark the job failed; ignored if it already reached a terminal state
    pub fn fail(&mut self, failure: JobFailure) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Failed;
        self.failure = Some(failure);
    }

    /// Mark the job as already transferred by an earlier run
    pub fn skip(&mut self) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(Error::InvalidTransition {
                job: self.id.0,
                from: self.status.to_string(),
                to: JobStatus::Skipped.to_string(),
            });
        }
        self.status = JobStatus::Skipped;
        Ok(())
    }
}

/// Event emitted as jobs move through the pipeline
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A batch was resolved and is about to start
    BatchStarted {
        /// Number of jobs in the batch
        jobs: usize,
        /// Sum of known entry sizes
        total_bytes: u64,
    },

    /// A download began
    DownloadStarted {
        /// Job ID
        id: JobId,
        /// File name
        name: String,
        /// Expected size, if known
        total_bytes: Option<u64>,
    },

    /// Download progress update
    Downloading {
        /// Job ID
        id: JobId,
        /// Bytes written so far (including resumed bytes)
        downloaded_bytes: u64,
        /// Expected size, if known
        total_bytes: Option<u64>,
        /// Bytes written since the previous update
        delta_bytes: u64,
    },

    /// Download finished and was verified
    DownloadComplete {
        /// Job ID
        id: JobId,
    },

    /// Archive extraction started
    Extracting {
        /// Job ID
        id: JobId,
        /// Archive filename
        archive: String,
    },

    /// Archive extraction completed
    ExtractComplete {
        /// Job ID
        id: JobId,
        /// Number of files written
        files: usize,
    },

    /// Upload of a staged folder started
    UploadStarted {
        /// Remote target
        target: String,
    },

    /// Upload finished
    UploadComplete {
        /// Remote target
        target: String,
        /// Whether the sync tool succeeded
        success: bool,
    },

    /// Job finished successfully
    JobDone {
        /// Job ID
        id: JobId,
    },

    /// Job skipped (already transferred)
    JobSkipped {
        /// Job ID
        id: JobId,
        /// File name
        name: String,
    },

    /// Job failed at some stage
    JobFailed {
        /// Job ID
        id: JobId,
        /// Stage where failure occurred
        stage: Stage,
        /// Error message
        error: String,
    },

    /// Interrupt received
    Shutdown,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> TransferJob {
        TransferJob::new(
            JobId(1),
            1,
            RemoteEntry {
                name: "a.rar".into(),
                path: "show/a.rar".into(),
                size: Some(10),
                download_url: "https://idx.example/0:down/show/a.rar".into(),
                md5: None,
            },
            PathBuf::from("/tmp/show/a.rar"),
        )
    }

    #[test]
    fn status_only_moves_forward() {
        let mut j = job();
        j.advance(JobStatus::Downloading).unwrap();
        j.advance(JobStatus::Downloaded).unwrap();
        assert!(j.advance(JobStatus::Downloading).is_err());
        assert!(j.advance(JobStatus::Downloaded).is_err());
        j.advance(JobStatus::Extracted).unwrap();
        j.advance(JobStatus::Done).unwrap();
        assert!(j.advance(JobStatus::Uploading).is_err());
    }

    #[test]
    fn failed_is_terminal() {
        let mut j = job();
        j.advance(JobStatus::Downloading).unwrap();
        let err = Error::Other("boom".into());
        j.fail(JobFailure::new(Stage::Download, &err));
        assert_eq!(j.status(), JobStatus::Failed);
        assert!(j.advance(JobStatus::Downloaded).is_err());
        assert_eq!(j.failure().unwrap().code, "internal_error");

        // A second failure does not overwrite the first
        let other = Error::Cancelled;
        j.fail(JobFailure::new(Stage::Extract, &other));
        assert_eq!(j.failure().unwrap().stage, Stage::Download);
    }

    #[test]
    fn advance_cannot_target_failed() {
        let mut j = job();
        assert!(j.advance(JobStatus::Failed).is_err());
        assert_eq!(j.status(), JobStatus::Pending);
    }

    #[test]
    fn skip_only_from_pending() {
        let mut j = job();
        j.skip().unwrap();
        assert_eq!(j.status(), JobStatus::Skipped);

        let mut k = job();
        k.advance(JobStatus::Downloading).unwrap();
        assert!(k.skip().is_err());
    }

    #[test]
    fn local_files_cover_download_and_outputs() {
        let mut j = job();
        assert_eq!(j.local_files(), vec![PathBuf::from("/tmp/show/a.rar")]);

        j.record_outputs(vec![PathBuf::from("/tmp/show/a/ep01.mkv")]);
        assert_eq!(j.outputs(), [PathBuf::from("/tmp/show/a/ep01.mkv")]);
        assert_eq!(
            j.local_files(),
            vec![
                PathBuf::from("/tmp/show/a.rar"),
                PathBuf::from("/tmp/show/a/ep01.mkv"),
            ]
        );
    }

    #[test]
    fn entry_key_is_remote_path() {
        assert_eq!(job().entry.key(), "show/a.rar");
    }
}
