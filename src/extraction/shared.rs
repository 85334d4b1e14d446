use crate::error::{Error, ExtractionError, Result};
use crate::types::ArchiveType;
use crate::utils::is_multivolume;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use super::password_list::PasswordList;

/// Files produced by one extraction and the password that opened the archive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extracted {
    /// Files written (or already present) under the destination
    pub files: Vec<PathBuf>,
    /// The password that worked (empty for unencrypted archives)
    pub password: String,
}

/// Shared implementation for archive extraction with password attempts.
///
/// Tries each password in order. A [`ExtractionError::WrongPassword`] moves on
/// to the next one; any other error stops immediately.
pub(crate) async fn extract_with_passwords_impl<F, Fut>(
    format_name: &str,
    try_extract_fn: F,
    archive_path: &Path,
    dest_path: &Path,
    passwords: &PasswordList,
) -> Result<Extracted>
where
    F: Fn(PathBuf, String, PathBuf) -> Fut,
    Fut: Future<Output = Result<Vec<PathBuf>>>,
{
    if passwords.is_empty() {
        warn!(
            ?archive_path,
            "no passwords to try for {} extraction", format_name
        );
        return Err(ExtractionError::NoPasswordsAvailable {
            archive: archive_path.to_path_buf(),
        }
        .into());
    }

    info!(
        ?archive_path,
        password_count = passwords.len(),
        "attempting {} extraction",
        format_name
    );

    for (i, password) in passwords.iter().enumerate() {
        debug!(
            attempt = i + 1,
            total = passwords.len(),
            password_length = password.len(),
            "trying password {}/{}",
            i + 1,
            passwords.len()
        );

        let result = try_extract_fn(
            archive_path.to_path_buf(),
            password.clone(),
            dest_path.to_path_buf(),
        )
        .await;

        match result {
            Ok(files) => {
                info!(
                    ?archive_path,
                    attempt = i + 1,
                    files = files.len(),
                    "{} extraction successful",
                    format_name
                );
                return Ok(Extracted {
                    files,
                    password: password.clone(),
                });
            }
            Err(Error::Extraction(ExtractionError::WrongPassword { .. })) => {
                debug!(attempt = i + 1, "wrong password, trying next");
                continue;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    ?archive_path,
                    "{} extraction failed with non-password error",
                    format_name
                );
                return Err(e);
            }
        }
    }

    warn!(
        ?archive_path,
        attempted = passwords.len(),
        "all passwords failed for {} extraction",
        format_name
    );
    Err(ExtractionError::AllPasswordsFailed {
        archive: archive_path.to_path_buf(),
        count: passwords.len(),
    }
    .into())
}

/// Run a blocking extraction attempt on the blocking pool
pub(crate) async fn run_blocking<F>(archive_path: PathBuf, f: F) -> Result<Vec<PathBuf>>
where
    F: FnOnce() -> Result<Vec<PathBuf>> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        Error::from(ExtractionError::Corrupt {
            archive: archive_path,
            reason: format!("extraction task panicked: {}", e),
        })
    })?
}

/// Detect archive type by file extension
///
/// Supports RAR (.rar), 7z (.7z), and ZIP (.zip) formats.
pub fn detect_archive_type(path: &Path) -> Option<ArchiveType> {
    let ext = path.extension()?.to_str()?.to_lowercase();

    match ext.as_str() {
        "rar" => Some(ArchiveType::Rar),
        "7z" => Some(ArchiveType::SevenZip),
        "zip" => Some(ArchiveType::Zip),
        _ => None,
    }
}

/// How a downloaded file is handled after its body lands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Not an archive; nothing to extract
    Plain,
    /// Self-contained archive, extracted as soon as it is downloaded
    Single(ArchiveType),
    /// One volume of a multi-volume RAR set, extracted after the batch barrier
    Volume,
}

/// Classify a downloaded file by name
pub fn classify(path: &Path) -> ArchiveKind {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if is_multivolume(&name) {
        return ArchiveKind::Volume;
    }
    match detect_archive_type(path) {
        Some(t) => ArchiveKind::Single(t),
        None => ArchiveKind::Plain,
    }
}

/// Join an archive entry name onto `dest`, refusing anything that escapes it
pub(crate) fn safe_join(dest: &Path, entry_name: &str) -> Option<PathBuf> {
    let normalized = entry_name.replace('\\', "/");
    let relative = Path::new(&normalized);
    let mut out = dest.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (depth > 0).then_some(out)
}

/// Map an I/O failure during extraction
pub(crate) fn io_error(path: &Path, e: impl std::fmt::Display) -> Error {
    ExtractionError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
    .into()
}
