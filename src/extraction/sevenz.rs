use crate::error::{Error, ExtractionError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::password_list::PasswordList;
use super::shared::{Extracted, extract_with_passwords_impl, io_error, run_blocking, safe_join};

/// Archive extractor for 7z files
pub struct SevenZipExtractor;

impl SevenZipExtractor {
    /// Try to extract a 7z archive with a single password
    ///
    /// Entry paths are confined to `dest_path` and existing files are not
    /// overwritten.
    pub fn try_extract(
        archive_path: &Path,
        password: &str,
        dest_path: &Path,
    ) -> Result<Vec<PathBuf>> {
        debug!(
            ?archive_path,
            password_length = password.len(),
            ?dest_path,
            "attempting 7z extraction"
        );

        std::fs::create_dir_all(dest_path).map_err(|e| io_error(dest_path, e))?;

        let mut extracted_files = Vec::new();
        let extract_fn = |entry: &sevenz_rust::SevenZArchiveEntry,
                          reader: &mut dyn Read,
                          _default_dest: &PathBuf|
         -> std::result::Result<bool, sevenz_rust::Error> {
            let Some(target) = safe_join(dest_path, entry.name()) else {
                warn!(entry = entry.name(), "skipping entry with unsafe path");
                std::io::copy(reader, &mut std::io::sink())?;
                return Ok(true);
            };

            if !entry.is_directory() && target.exists() {
                debug!(path = %target.display(), "output already exists, skipping");
                std::io::copy(reader, &mut std::io::sink())?;
                extracted_files.push(target);
                return Ok(true);
            }

            let keep_going = sevenz_rust::default_entry_extract_fn(entry, reader, &target)?;
            if !entry.is_directory() {
                extracted_files.push(target);
            }
            Ok(keep_going)
        };

        use sevenz_rust::Password;
        let result = if password.is_empty() {
            sevenz_rust::decompress_file_with_extract_fn(archive_path, dest_path, extract_fn)
        } else {
            let file = std::fs::File::open(archive_path).map_err(|e| io_error(archive_path, e))?;
            sevenz_rust::decompress_with_extract_fn_and_password(
                file,
                dest_path,
                Password::from(password),
                extract_fn,
            )
        };

        match result {
            Ok(()) => {
                info!(
                    ?archive_path,
                    extracted_count = extracted_files.len(),
                    "7z extraction successful"
                );
                Ok(extracted_files)
            }
            Err(e) => Err(Self::classify_error(archive_path, &e)),
        }
    }

    fn classify_error(archive_path: &Path, e: &sevenz_rust::Error) -> Error {
        let text = format!("{:?} {}", e, e).to_lowercase();
        if text.contains("password") || text.contains("encrypted") {
            ExtractionError::WrongPassword {
                archive: archive_path.to_path_buf(),
            }
            .into()
        } else {
            ExtractionError::Corrupt {
                archive: archive_path.to_path_buf(),
                reason: format!("failed to extract 7z archive: {}", e),
            }
            .into()
        }
    }

    /// Extract 7z archive with password attempts
    pub async fn extract_with_passwords(
        archive_path: &Path,
        dest_path: &Path,
        passwords: &PasswordList,
    ) -> Result<Extracted> {
        extract_with_passwords_impl(
            "7z",
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
