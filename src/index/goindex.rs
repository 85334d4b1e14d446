//! GoIndex adapters (`achrou/goindex`, `donwa/goindex`)
//!
//! Both variants answer a POST on the folder URL with a JSON listing. achrou
//! nests files under `data.files` and pages with `nextPageToken`; donwa returns
//! a flat `files` array. Downloads are served from a `0:down/` prefix on achrou
//! and from the folder URL itself on donwa.

use super::{Page, Session, SiteAdapter, folder_url, join_remote};
use crate::config::SiteType;
use crate::error::ListingError;
use crate::types::RemoteEntry;
use crate::utils::decode_until_stable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// Google Drive MIME type used for folders
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Path segment that marks the drive root on achrou-style URLs
const DRIVE_ROOT: &str = "0:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flavor {
    Achrou,
    Donwa,
}

/// GoIndex adapter
#[derive(Clone, Debug)]
pub struct GoIndex {
    flavor: Flavor,
}

impl GoIndex {
    /// `achrou/goindex`
    pub fn achrou() -> Self {
        Self {
            flavor: Flavor::Achrou,
        }
    }

    /// `donwa/goindex`
    pub fn donwa() -> Self {
        Self {
            flavor: Flavor::Donwa,
        }
    }

    fn download_url(&self, folder: &Url, name: &str) -> Result<Url, ListingError> {
        let base = match self.flavor {
            Flavor::Achrou => {
                let mut base = folder.clone();
                let path = folder
                    .path()
                    .replacen(&format!("/{}/", DRIVE_ROOT), &format!("/{}down/", DRIVE_ROOT), 1);
                base.set_path(&path);
                base
            }
            Flavor::Donwa => folder.clone(),
        };
        folder_url(&base)
            .join(&urlencoding::encode(name))
            .map_err(|e| ListingError::Parse {
                url: folder.to_string(),
                reason: format!("cannot build download URL for '{}': {}", name, e),
            })
    }
}

#[derive(Serialize)]
struct ListRequest<'a> {
    password: &'a str,
    page_token: Option<&'a str>,
    page_index: u32,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(default)]
    data: Option<ListData>,
    #[serde(default)]
    files: Option<Vec<DriveFile>>,
}

#[derive(Deserialize)]
struct ListData {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct DriveFile {
    name: String,
    #[serde(default, rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(default)]
    size: Option<SizeField>,
    #[serde(default, rename = "md5Checksum")]
    md5_checksum: Option<String>,
}

/// Drive reports sizes as strings; some forks send numbers
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeField {
    Number(u64),
    Text(String),
}

impl SizeField {
    fn bytes(&self) -> Option<u64> {
        match self {
            SizeField::Number(n) => Some(*n),
            SizeField::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[async_trait]
impl SiteAdapter for GoIndex {
    fn site_type(&self) -> SiteType {
        match self.flavor {
            Flavor::Achrou => SiteType::AchrouGoIndex,
            Flavor::Donwa => SiteType::DonwaGoIndex,
        }
    }

    async fn list_page(
        &self,
        session: &Session,
        folder: &Url,
        cursor: Option<&str>,
        page_index: u32,
    ) -> Result<Page, ListingError> {
        let body = ListRequest {
            password: "",
            page_token: cursor,
            page_index,
        };
        let request = session.client().post(folder.clone()).json(&body);
        let response: ListResponse = session.send_json(request, folder.as_str()).await?;

        let files = match (response.data, response.files) {
            (Some(data), _) => data.files,
            (None, Some(files)) => files,
            (None, None) => {
                return Err(ListingError::Parse {
                    url: folder.to_string(),
                    reason: "response has neither data.files nor files".to_string(),
                });
            }
        };

        let folder_path = self.folder_path(folder);
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            if file.mime_type.as_deref() == Some(FOLDER_MIME) {
                tracing::debug!(name = %file.name, "Skipping sub-folder");
                continue;
            }
            let download_url = self.download_url(folder, &file.name)?;
            entries.push(RemoteEntry {
                path: join_remote(&folder_path, &file.name),
                size: file.size.as_ref().and_then(SizeField::bytes),
                download_url: download_url.to_string(),
                md5: file.md5_checksum.map(|m| m.to_ascii_lowercase()),
                name: file.name,
            });
        }

        let next = response.next_page_token.filter(|t| !t.is_empty());
        Ok(Page { entries, next })
    }

    fn folder_path(&self, folder: &Url) -> String {
        let decoded = decode_until_stable(folder.path());
        let marker = format!("/{}/", DRIVE_ROOT);
        let path = match decoded.find(&marker) {
            Some(pos) => &decoded[pos + marker.len()..],
            None => decoded.as_str(),
        };
        path.trim_matches('/').to_string()
    }
}
