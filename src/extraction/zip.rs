use crate::error::{Error, ExtractionError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::password_list::PasswordList;
use super::shared::{Extracted, extract_with_passwords_impl, io_error, run_blocking};

/// Archive extractor for ZIP files
pub struct ZipExtractor;

fn looks_like_password_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("password") || lower.contains("encrypted")
}

impl ZipExtractor {
    /// Open a ZIP entry by index, handling password decryption if needed
    fn open_zip_entry<'a>(
        archive: &'a mut zip::ZipArchive<std::fs::File>,
        index: usize,
        password: &str,
        archive_path: &Path,
    ) -> Result<zip::read::ZipFile<'a>> {
        let map_err = |e: zip::result::ZipError| -> Error {
            if looks_like_password_error(&e.to_string()) {
                ExtractionError::WrongPassword {
                    archive: archive_path.to_path_buf(),
                }
                .into()
            } else {
                ExtractionError::Corrupt {
                    archive: archive_path.to_path_buf(),
                    reason: format!("failed to read ZIP entry: {}", e),
                }
                .into()
            }
        };

        if password.is_empty() {
            archive.by_index(index).map_err(map_err)
        } else {
            archive
                .by_index_decrypt(index, password.as_bytes())
                .map_err(map_err)?
                .map_err(|_| {
                    ExtractionError::WrongPassword {
                        archive: archive_path.to_path_buf(),
                    }
                    .into()
                })
        }
    }

    /// Extract a single ZIP entry to disk, creating directories as needed
    ///
    /// Existing files are left untouched and reported as extracted.
    fn extract_zip_entry(
        mut file: zip::read::ZipFile,
        dest_path: &Path,
        archive_path: &Path,
        password: &str,
    ) -> Result<Option<PathBuf>> {
        let file_path = match file.enclosed_name() {
            Some(path) => dest_path.join(path),
            None => {
                warn!(entry = file.name(), "skipping entry with unsafe path");
                return Ok(None);
            }
        };

        if file.is_dir() {
            std::fs::create_dir_all(&file_path).map_err(|e| io_error(&file_path, e))?;
            return Ok(None);
        }

        if let Ok(meta) = std::fs::metadata(&file_path) {
            if meta.len() != file.size() {
                warn!(
                    path = %file_path.display(),
                    existing = meta.len(),
                    expected = file.size(),
                    "output already exists with a different size, not overwriting"
                );
            } else {
                debug!(path = %file_path.display(), "output already exists, skipping");
            }
            return Ok(Some(file_path));
        }

        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let mut outfile = std::fs::File::create(&file_path).map_err(|e| io_error(&file_path, e))?;

        if let Err(e) = std::io::copy(&mut file, &mut outfile) {
            drop(outfile);
            std::fs::remove_file(&file_path).ok();
            let message = e.to_string();
            // A wrong ZipCrypto password can slip past the header check and fail the CRC
            if looks_like_password_error(&message) || !password.is_empty() {
                return Err(ExtractionError::WrongPassword {
                    archive: archive_path.to_path_buf(),
                }
                .into());
            }
            return Err(ExtractionError::Corrupt {
                archive: archive_path.to_path_buf(),
                reason: format!("failed to extract {}: {}", file_path.display(), message),
            }
            .into());
        }

        Ok(Some(file_path))
    }

    /// Try to extract a ZIP archive with a single password
    pub fn try_extract(
        archive_path: &Path,
        password: &str,
        dest_path: &Path,
    ) -> Result<Vec<PathBuf>> {
        debug!(
            ?archive_path,
            password_length = password.len(),
            ?dest_path,
            "attempting ZIP extraction"
        );

        std::fs::create_dir_all(dest_path).map_err(|e| io_error(dest_path, e))?;

        let file = std::fs::File::open(archive_path).map_err(|e| io_error(archive_path, e))?;

        let mut archive = zip::ZipArchive::new(file).map_err(|e| ExtractionError::Corrupt {
            archive: archive_path.to_path_buf(),
            reason: format!("failed to read ZIP archive: {}", e),
        })?;

        let mut extracted_files = Vec::new();

        for i in 0..archive.len() {
            let file = Self::open_zip_entry(&mut archive, i, password, archive_path)?;

            if let Some(file_path) = Self::extract_zip_entry(file, dest_path, archive_path, password)? {
                extracted_files.push(file_path);
            }
        }

        info!(
            ?archive_path,
            extracted_count = extracted_files.len(),
            "ZIP extraction successful"
        );

        Ok(extracted_files)
    }

    /// Extract ZIP archive with password attempts
    pub async fn extract_with_passwords(
        archive_path: &Path,
        dest_path: &Path,
        passwords: &PasswordList,
    ) -> Result<Extracted> {
        extract_with_passwords_impl(
            "ZIP",
            |archive: PathBuf, password: String, dest: PathBuf| {
                run_blocking(archive.clone(), move || {
                    Self::try_extract(&archive, &password, &dest)
                })
            },
            archive_path,
            dest_path,
            passwords,
        )
        .await
    }
}
