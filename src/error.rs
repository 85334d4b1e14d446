//! Error types for index-mirror
//!
//! The taxonomy follows the pipeline stages:
//! - [`ListingError`] - fatal, aborts the run before anything is downloaded
//! - [`DownloadError`] / [`ExtractionError`] - per-job, isolated to one transfer
//! - [`UploadError`] - fatal to the upload phase, local files are kept
//! - [`Error::Config`] - fatal at startup
//!
//! Every error carries a machine-readable code (see [`Error::error_code`]) so the
//! run summary can group failures and a rerun can target the failed subset.

use crate::pipeline::summary::exit;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for index-mirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for index-mirror
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The flag or environment variable that caused the error (e.g., "HTTP_USER")
        key: Option<String>,
    },

    /// Remote listing failed
    #[error("listing error: {0}")]
    Listing(#[from] ListingError),

    /// Download of a single entry failed
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Archive extraction failed
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Upload to the sync remote failed
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    /// Bookkeeping store failure
    #[error("bookkeeping error: {0}")]
    Store(#[from] StoreError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A job was asked to move backwards or out of a terminal state
    #[error("job {job} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Job identifier
        job: u64,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// The run was interrupted
    #[error("interrupted")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a flag or variable
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Listing(e) => e.error_code(),
            Error::Download(e) => e.error_code(),
            Error::Extraction(e) => e.error_code(),
            Error::Upload(e) => e.error_code(),
            Error::Store(_) => "store_error",
            Error::Sqlx(_) => "store_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Cancelled => "cancelled",
            Error::Other(_) => "internal_error",
        }
    }

    /// Process exit code for an error that aborts the run
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config { .. } => exit::CONFIG,
            Error::Listing(_) => exit::LISTING_FAILED,
            Error::Upload(_) => exit::UPLOAD_FAILED,
            Error::Cancelled => exit::INTERRUPTED,
            Error::Download(DownloadError::Cancelled) => exit::INTERRUPTED,
            _ => exit::PARTIAL_FAILURE,
        }
    }
}

/// Errors produced while enumerating a remote index
#[derive(Debug, Error)]
pub enum ListingError {
    /// Host could not be reached (DNS, connect, timeout)
    #[error("cannot reach {url}: {reason}")]
    Unreachable {
        /// URL that was requested
        url: String,
        /// Underlying transport error
        reason: String,
    },

    /// The index rejected the credentials (401/403)
    #[error("authentication rejected by {url} (HTTP {status})")]
    AuthRejected {
        /// URL that was requested
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Any other non-success HTTP status
    #[error("unexpected HTTP {status} from {url}")]
    Status {
        /// URL that was requested
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The response body could not be understood
    #[error("cannot parse listing from {url}: {reason}")]
    Parse {
        /// URL that was requested
        url: String,
        /// What went wrong
        reason: String,
    },
}

impl ListingError {
    fn error_code(&self) -> &'static str {
        match self {
            ListingError::Unreachable { .. } => "listing_unreachable",
            ListingError::AuthRejected { .. } => "listing_auth_rejected",
            ListingError::Status { .. } => "listing_http_status",
            ListingError::Parse { .. } => "listing_parse",
        }
    }
}

/// Errors for a single download
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport failure while fetching
    #[error("network failure for {url}: {reason}")]
    Network {
        /// Download URL
        url: String,
        /// Underlying transport error
        reason: String,
        /// Whether the failure looks transient (timeout, reset)
        transient: bool,
    },

    /// Non-success HTTP status
    #[error("HTTP {status} for {url}")]
    Status {
        /// Download URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Bytes on disk do not match the advertised size
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Temporary file that was checked
        path: PathBuf,
        /// Expected size in bytes
        expected: u64,
        /// Actual size in bytes
        actual: u64,
    },

    /// MD5 of the downloaded file does not match the index
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Temporary file that was checked
        path: PathBuf,
        /// Expected MD5 (hex)
        expected: String,
        /// Actual MD5 (hex)
        actual: String,
    },

    /// Disk write or rename failure
    #[error("disk error at {path}: {reason}")]
    Io {
        /// Path being written
        path: PathBuf,
        /// Underlying I/O error
        reason: String,
    },

    /// Another entry in the listing already targets this destination
    #[error("destination {path} is already claimed by another entry")]
    PathCollision {
        /// Conflicting destination
        path: PathBuf,
    },

    /// The run was interrupted mid-transfer
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    fn error_code(&self) -> &'static str {
        match self {
            DownloadError::Network { .. } => "download_network",
            DownloadError::Status { .. } => "download_http_status",
            DownloadError::SizeMismatch { .. } => "download_size_mismatch",
            DownloadError::HashMismatch { .. } => "download_hash_mismatch",
            DownloadError::Io { .. } => "download_io",
            DownloadError::PathCollision { .. } => "download_path_collision",
            DownloadError::Cancelled => "cancelled",
        }
    }
}

/// Archive extraction errors
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Archive is damaged or truncated
    #[error("corrupt archive {archive}: {reason}")]
    Corrupt {
        /// The archive file that failed to extract
        archive: PathBuf,
        /// The reason extraction failed
        reason: String,
    },

    /// Wrong password for encrypted archive
    #[error("wrong password for encrypted archive {archive}")]
    WrongPassword {
        /// The encrypted archive that could not be opened
        archive: PathBuf,
    },

    /// All passwords failed for archive extraction
    #[error("all {count} passwords failed for archive {archive}")]
    AllPasswordsFailed {
        /// The encrypted archive that could not be opened
        archive: PathBuf,
        /// The number of passwords that were tried
        count: usize,
    },

    /// No passwords available for encrypted archive
    #[error("no passwords available for encrypted archive {archive}")]
    NoPasswordsAvailable {
        /// The encrypted archive that requires a password
        archive: PathBuf,
    },

    /// Extension not handled by any extractor
    #[error("unknown archive type: {archive}")]
    UnknownType {
        /// The file that was offered for extraction
        archive: PathBuf,
    },

    /// A multi-volume set is missing volumes
    #[error("multi-volume set {archive} is incomplete: {reason}")]
    IncompleteSet {
        /// First volume of the set
        archive: PathBuf,
        /// Which volumes are missing
        reason: String,
    },

    /// The external extraction binary is not installed
    #[error("{tool} not found in PATH")]
    ToolMissing {
        /// Binary name
        tool: String,
    },

    /// The external extraction binary exited with an error
    #[error("{tool} failed on {archive} (exit code {code:?}): {reason}")]
    ToolFailed {
        /// Binary name
        tool: String,
        /// The archive being extracted
        archive: PathBuf,
        /// Process exit code, if any
        code: Option<i32>,
        /// Captured stderr
        reason: String,
    },

    /// Filesystem error while writing output
    #[error("I/O error at {path}: {reason}")]
    Io {
        /// Path being written
        path: PathBuf,
        /// Underlying error
        reason: String,
    },
}

impl ExtractionError {
    fn error_code(&self) -> &'static str {
        match self {
            ExtractionError::Corrupt { .. } => "extraction_corrupt",
            ExtractionError::WrongPassword { .. } => "wrong_password",
            ExtractionError::AllPasswordsFailed { .. } => "all_passwords_failed",
            ExtractionError::NoPasswordsAvailable { .. } => "no_passwords_available",
            ExtractionError::UnknownType { .. } => "unknown_archive_type",
            ExtractionError::IncompleteSet { .. } => "incomplete_volume_set",
            ExtractionError::ToolMissing { .. } => "extraction_tool_missing",
            ExtractionError::ToolFailed { .. } => "extraction_tool_failed",
            ExtractionError::Io { .. } => "extraction_io",
        }
    }
}

/// Upload (rclone) errors
#[derive(Debug, Error)]
pub enum UploadError {
    /// rclone binary not found
    #[error("{tool} not found in PATH")]
    ToolMissing {
        /// Binary name
        tool: String,
    },

    /// Could not start the sync process
    #[error("failed to execute {tool}: {reason}")]
    Spawn {
        /// Binary name
        tool: String,
        /// Underlying error
        reason: String,
    },

    /// The sync tool reported failure
    #[error("{tool} exited with code {code:?}: {stderr}")]
    ExitStatus {
        /// Binary name
        tool: String,
        /// Process exit code (None when killed by a signal)
        code: Option<i32>,
        /// Tail of stderr
        stderr: String,
    },

    /// Upload skipped because earlier jobs failed
    #[error("upload skipped: {failed} job(s) failed and best-effort is off")]
    SkippedAfterFailures {
        /// Number of failed jobs in the batch
        failed: usize,
    },
}

impl UploadError {
    fn error_code(&self) -> &'static str {
        match self {
            UploadError::ToolMissing { .. } => "upload_tool_missing",
            UploadError::Spawn { .. } => "upload_spawn_failed",
            UploadError::ExitStatus { .. } => "upload_exit_status",
            UploadError::SkippedAfterFailures { .. } => "upload_skipped",
        }
    }
}

/// Bookkeeping store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store
    #[error("failed to connect to store: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Hosted REST store answered with an error status
    #[error("store returned HTTP {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },
}
