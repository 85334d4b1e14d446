//! rclone-backed sync tool

use crate::error::UploadError;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::SyncTool;

const TOOL: &str = "rclone";
const STDERR_TAIL: usize = 2048;

/// Runs `rclone copy <source> <target>`
#[derive(Clone, Debug)]
pub struct Rclone {
    binary_path: PathBuf,
    config_file: Option<PathBuf>,
    options: Vec<String>,
}

impl Rclone {
    /// Create with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            binary_path,
            config_file: None,
            options: Vec::new(),
        }
    }

    /// Attempt to find rclone in PATH
    pub fn from_path() -> Option<Self> {
        which::which(TOOL).ok().map(Self::new)
    }

    /// Use the configured binary if given, else look it up in PATH
    pub fn locate(configured: Option<&Path>) -> Result<Self, UploadError> {
        let found = match configured {
            Some(path) => which::which(path).ok().map(Self::new),
            None => Self::from_path(),
        };
        found.ok_or_else(|| UploadError::ToolMissing {
            tool: TOOL.to_string(),
        })
    }

    /// Pass `--config <file>` on every run
    pub fn with_config_file(mut self, config_file: Option<PathBuf>) -> Self {
        self.config_file = config_file;
        self
    }

    /// Extra flags appended after the paths
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    /// Arguments for one copy run
    pub fn copy_args(&self, source: &Path, target: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["copy".into(), source.into(), target.into()];
        if let Some(config) = &self.config_file {
            args.push("--config".into());
            args.push(config.into());
        }
        args.extend(self.options.iter().map(OsString::from));
        args
    }
}

fn tail(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - limit;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[async_trait]
impl SyncTool for Rclone {
    fn name(&self) -> &'static str {
        TOOL
    }

    async fn sync(&self, source: &Path, target: &str) -> Result<(), UploadError> {
        let args = self.copy_args(source, target);
        debug!(binary = %self.binary_path.display(), ?args, "running rclone");

        let output = Command::new(&self.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| UploadError::Spawn {
                tool: TOOL.to_string(),
                reason: e.to_string(),
            })?;

        // Exit status is the only success signal
        if output.status.success() {
            return Ok(());
        }
        Err(UploadError::ExitStatus {
            tool: TOOL.to_string(),
            code: output.status.code(),
            stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL),
        })
    }
}
