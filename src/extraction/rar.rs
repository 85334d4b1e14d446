//! RAR extraction through the external `unrar` binary

use crate::error::{Error, ExtractionError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::password_list::PasswordList;
use super::shared::{Extracted, extract_with_passwords_impl, io_error};

const TOOL: &str = "unrar";

/// unrar exit codes that mean the archive was extracted
const SUCCESS_CODES: &[i32] = &[0, 1, 10];
const EXIT_CRC_ERROR: i32 = 3;
const EXIT_BAD_PASSWORD: i32 = 11;

/// Archive extractor for RAR files, single or multi-volume
///
/// Multi-volume sets are extracted by pointing unrar at the first volume; it
/// walks the remaining volumes in the same directory itself.
#[derive(Clone, Debug)]
pub struct RarExtractor {
    binary_path: PathBuf,
}

impl RarExtractor {
    /// Create an extractor with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find unrar in PATH
    pub fn from_path() -> Option<Self> {
        which::which(TOOL).ok().map(Self::new)
    }

    /// Use the configured binary if given, else look it up in PATH
    ///
    /// A configured path that does not exist counts as missing.
    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        let found = match configured {
            Some(path) => which::which(path).ok().map(Self::new),
            None => Self::from_path(),
        };
        found.ok_or_else(|| {
            ExtractionError::ToolMissing {
                tool: TOOL.to_string(),
            }
            .into()
        })
    }

    /// Path of the binary this extractor runs
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    fn password_arg(password: &str) -> String {
        if password.is_empty() {
            "-p-".to_string()
        } else {
            format!("-p{}", password)
        }
    }

    /// Try to extract a RAR archive with a single password
    pub async fn try_extract(
        &self,
        archive_path: &Path,
        password: &str,
        dest_path: &Path,
    ) -> Result<Vec<PathBuf>> {
        debug!(
            ?archive_path,
            password_length = password.len(),
            ?dest_path,
            "attempting RAR extraction"
        );

        tokio::fs::create_dir_all(dest_path)
            .await
            .map_err(|e| io_error(dest_path, e))?;

        // unrar treats a trailing separator as "extract into this directory"
        let mut dest_arg = dest_path.as_os_str().to_owned();
        dest_arg.push(std::path::MAIN_SEPARATOR_STR);

        let output = Command::new(&self.binary_path)
            .arg("x")
            .arg("-o-") // never overwrite
            .arg("-y")
            .arg("-c-")
            .arg(Self::password_arg(password))
            .arg(archive_path)
            .arg(&dest_arg)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExtractionError::ToolFailed {
                tool: TOOL.to_string(),
                archive: archive_path.to_path_buf(),
                code: None,
                reason: format!("failed to execute {}: {}", TOOL, e),
            })?;

        let code = output.status.code();
        let text = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if let Some(c) = code
            && SUCCESS_CODES.contains(&c)
        {
            let files = self.list_files(archive_path, password, dest_path).await;
            info!(
                ?archive_path,
                extracted_count = files.len(),
                "RAR extraction successful"
            );
            return Ok(files);
        }

        Err(classify_failure(archive_path, code, &text))
    }

    /// Files in the archive that now exist under `dest_path`
    ///
    /// Listing failures are not fatal; the extraction already succeeded.
    async fn list_files(&self, archive_path: &Path, password: &str, dest_path: &Path) -> Vec<PathBuf> {
        let output = Command::new(&self.binary_path)
            .arg("lb")
            .arg(Self::password_arg(password))
            .arg(archive_path)
            .stdin(Stdio::null())
            .output()
            .await;

        let Ok(output) = output else {
            return Vec::new();
        };

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|name| dest_path.join(name.replace('\\', "/")))
            .filter(|path| path.is_file())
            .collect()
    }

    /// Extract RAR archive with password attempts
    pub async fn extract_with_passwords(
        &self,
        archive_path: &Path,
        dest_path: &Path,
        passwords: &PasswordList,
    ) -> Result<Extracted> {
        extract_with_passwords_impl(
            "RAR",
            |archive: PathBuf, password: String, dest: PathBuf| {
                let extractor = self.clone();
                async move { extractor.try_extract(&archive, &password, &dest).await }
            },
            archive_path,
            dest_path,
            passwords,
        )
        .await
    }
}

/// Map a failed unrar run onto an extraction error
fn classify_failure(archive_path: &Path, code: Option<i32>, output: &str) -> Error {
    let archive = archive_path.to_path_buf();
    let lower = output.to_lowercase();

    if lower.contains("cannot find volume") {
        return ExtractionError::IncompleteSet {
            archive,
            reason: last_line(output),
        }
        .into();
    }
    if code == Some(EXIT_BAD_PASSWORD) || lower.contains("password") {
        return ExtractionError::WrongPassword { archive }.into();
    }
    if code == Some(EXIT_CRC_ERROR) {
        return ExtractionError::Corrupt {
            archive,
            reason: last_line(output),
        }
        .into();
    }
    ExtractionError::ToolFailed {
        tool: TOOL.to_string(),
        archive,
        code,
        reason: last_line(output),
    }
    .into()
}

fn last_line(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string()
}
