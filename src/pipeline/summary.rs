//! Run summary and process exit codes

use crate::types::{JobFailure, JobStatus, TransferJob};
use crate::utils::format_size;
use serde::Serialize;
use tracing::{info, warn};

/// Process exit codes
pub mod exit {
    /// Everything selected was transferred (or there was nothing to do)
    pub const SUCCESS: i32 = 0;
    /// Some jobs failed, others succeeded
    pub const PARTIAL_FAILURE: i32 = 1;
    /// Every attempted job failed
    pub const NOTHING_TRANSFERRED: i32 = 2;
    /// The remote listing could not be read
    pub const LISTING_FAILED: i32 = 3;
    /// The sync tool failed
    pub const UPLOAD_FAILED: i32 = 4;
    /// Invalid configuration
    pub const CONFIG: i32 = 5;
    /// SIGINT/SIGTERM
    pub const INTERRUPTED: i32 = 130;
}

/// A job that did not make it, for the final report
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailedJob {
    /// 1-based listing position
    pub index: usize,
    /// Remote path
    pub path: String,
    /// What went wrong
    pub failure: JobFailure,
}

/// Totals for one run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Entries in the remote listing
    pub listed: usize,
    /// Entries left after the index filter
    pub selected: usize,
    /// Batches processed
    pub batches: usize,
    /// Jobs that finished the whole pipeline
    pub done: usize,
    /// Jobs skipped as already transferred
    pub skipped: usize,
    /// Jobs that finished locally but were not uploaded
    pub not_uploaded: usize,
    /// Bytes of the jobs that finished
    pub bytes_transferred: u64,
    /// Failed jobs in listing order
    pub failures: Vec<FailedJob>,
    /// Sync tool errors, one per failed batch upload
    pub upload_errors: Vec<String>,
    /// Whether the run was interrupted
    pub interrupted: bool,
}

impl RunSummary {
    /// Count one finished job
    pub fn record(&mut self, job: &TransferJob) {
        match job.status() {
            JobStatus::Done => {
                self.done += 1;
                self.bytes_transferred += job.entry.size.unwrap_or(0);
            }
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Failed => {
                if let Some(failure) = job.failure() {
                    self.failures.push(FailedJob {
                        index: job.index,
                        path: job.entry.path.clone(),
                        failure: failure.clone(),
                    });
                }
            }
            _ => self.not_uploaded += 1,
        }
    }

    /// Number of failed jobs
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            return exit::INTERRUPTED;
        }
        if !self.upload_errors.is_empty() {
            return exit::UPLOAD_FAILED;
        }
        let failed = self.failed();
        if failed == 0 {
            return exit::SUCCESS;
        }
        if self.done == 0 && self.not_uploaded == 0 {
            return exit::NOTHING_TRANSFERRED;
        }
        exit::PARTIAL_FAILURE
    }

    /// Log the summary at the end of a run
    pub fn log(&self) {
        info!(
            listed = self.listed,
            selected = self.selected,
            batches = self.batches,
            done = self.done,
            skipped = self.skipped,
            failed = self.failed(),
            not_uploaded = self.not_uploaded,
            transferred = %format_size(self.bytes_transferred),
            "run finished"
        );
        for failed in &self.failures {
            warn!(
                index = failed.index,
                path = %failed.path,
                stage = %failed.failure.stage,
                code = %failed.failure.code,
                "{}",
                failed.failure.message
            );
        }
        for error in &self.upload_errors {
            warn!(error = %error, "upload failed");
        }
        if self.interrupted {
            warn!("run was interrupted; partial downloads are kept for the next run");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DownloadError, Error};
    use crate::types::{JobId, RemoteEntry, Stage};
    use std::path::PathBuf;

    fn job(id: u64) -> TransferJob {
        TransferJob::new(
            JobId(id),
            id as usize,
            RemoteEntry {
                name: format!("f{}", id),
                path: format!("show/f{}", id),
                size: Some(10),
                download_url: String::new(),
                md5: None,
            },
            PathBuf::from(format!("/tmp/f{}", id)),
        )
    }

    fn done(id: u64) -> TransferJob {
        let mut j = job(id);
        j.advance(JobStatus::Done).unwrap();
        j
    }

    fn failed(id: u64) -> TransferJob {
        let mut j = job(id);
        j.fail(JobFailure::new(
            Stage::Download,
            &Error::Download(DownloadError::Status {
                url: "http://x/".into(),
                status: 404,
            }),
        ));
        j
    }

    fn summary(jobs: &[TransferJob]) -> RunSummary {
        let mut s = RunSummary::default();
        for j in jobs {
            s.record(j);
        }
        s
    }

    #[test]
    fn empty_run_succeeds() {
        assert_eq!(RunSummary::default().exit_code(), exit::SUCCESS);
    }

    #[test]
    fn all_done_succeeds_and_counts_bytes() {
        let s = summary(&[done(1), done(2)]);
        assert_eq!(s.exit_code(), exit::SUCCESS);
        assert_eq!(s.bytes_transferred, 20);
    }

    #[test]
    fn mixed_outcome_is_partial_failure() {
        let s = summary(&[done(1), failed(2)]);
        assert_eq!(s.exit_code(), exit::PARTIAL_FAILURE);
        assert_eq!(s.failures[0].index, 2);
        assert_eq!(s.failures[0].failure.code, "download_http_status");
    }

    #[test]
    fn only_failures_is_nothing_transferred() {
        let mut skipped = job(3);
        skipped.skip().unwrap();
        let s = summary(&[failed(1), failed(2), skipped]);
        assert_eq!(s.exit_code(), exit::NOTHING_TRANSFERRED);
        assert_eq!(s.skipped, 1);
    }

    #[test]
    fn upload_failure_and_interrupt_take_precedence() {
        let mut s = summary(&[done(1)]);
        s.upload_errors.push("rclone exited with code Some(1)".into());
        assert_eq!(s.exit_code(), exit::UPLOAD_FAILED);
        s.interrupted = true;
        assert_eq!(s.exit_code(), exit::INTERRUPTED);
    }
}
