//! `spencerwooo/onedrive` (onedrive-vercel-index) adapter
//!
//! Listing: `GET /api/?path=<folder>[&next=<token>]`, items under
//! `folder.value`. Files are served from `/api/raw/?path=<folder>/<name>`.

use super::{Page, Session, SiteAdapter, join_remote};
use crate::config::SiteType;
use crate::error::ListingError;
use crate::types::RemoteEntry;
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

/// onedrive-vercel-index adapter
#[derive(Clone, Copy, Debug, Default)]
pub struct OneDrive;

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    folder: Option<FolderBody>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Deserialize)]
struct FolderBody {
    #[serde(default)]
    value: Vec<DriveItem>,
}

#[derive(Deserialize)]
struct DriveItem {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
}

fn api_url(folder: &Url, endpoint: &str) -> Result<Url, ListingError> {
    folder.join(endpoint).map_err(|e| ListingError::Parse {
        url: folder.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl SiteAdapter for OneDrive {
    fn site_type(&self) -> SiteType {
        SiteType::OneDrive
    }

    async fn list_page(
        &self,
        session: &Session,
        folder: &Url,
        cursor: Option<&str>,
        _page_index: u32,
    ) -> Result<Page, ListingError> {
        let folder_path = self.folder_path(folder);
        let remote_dir = format!("/{}", folder_path);

        let mut url = api_url(folder, "/api/")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", &remote_dir);
            if let Some(token) = cursor {
                query.append_pair("next", token);
            }
        }

        let request = session.client().get(url.clone());
        let response: ListResponse = session.send_json(request, url.as_str()).await?;
        let Some(body) = response.folder else {
            return Err(ListingError::Parse {
                url: url.to_string(),
                reason: "response is not a folder listing".to_string(),
            });
        };

        let mut entries = Vec::with_capacity(body.value.len());
        for item in body.value {
            if item.folder.is_some() {
                tracing::debug!(name = %item.name, "Skipping sub-folder");
                continue;
            }
            let path = join_remote(&folder_path, &item.name);
            let mut download = api_url(folder, "/api/raw/")?;
            download
                .query_pairs_mut()
                .append_pair("path", &format!("/{}", path));
            entries.push(RemoteEntry {
                name: item.name,
                path,
                size: item.size,
                download_url: download.to_string(),
                md5: None,
            });
        }

        Ok(Page {
            entries,
            next: response.next.filter(|t| !t.is_empty()),
        })
    }
}
