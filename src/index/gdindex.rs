//! `maple3142/GDIndex` adapter
//!
//! The listing is a single HTML page. Archive links are picked out of `href`
//! attributes and resolved against the folder URL.

use super::{Page, Session, SiteAdapter, decoded_url_path};
use crate::config::SiteType;
use crate::error::ListingError;
use crate::types::RemoteEntry;
use crate::utils::decode_until_stable;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

/// Extensions worth downloading from a GDIndex page
const ARCHIVE_EXTENSIONS: &[&str] = &["rar", "zip", "7z"];

fn href_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).ok())
        .as_ref()
}

/// GDIndex adapter
#[derive(Clone, Copy, Debug, Default)]
pub struct GdIndex;

/// Extract archive entries from a listing page
pub(crate) fn parse_listing(html: &str, folder: &Url) -> Result<Vec<RemoteEntry>, ListingError> {
    let re = href_regex().ok_or_else(|| ListingError::Parse {
        url: folder.to_string(),
        reason: "href pattern unavailable".to_string(),
    })?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for caps in re.captures_iter(html) {
        let Some(href) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let href = href.as_str().trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(url) = folder.join(href) else {
            tracing::debug!(href, "Ignoring unparseable link");
            continue;
        };

        let path = decoded_url_path(&url);
        let is_archive = path
            .rsplit_once('.')
            .map(|(_, ext)| {
                ARCHIVE_EXTENSIONS
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false);
        if !is_archive || !seen.insert(url.to_string()) {
            continue;
        }

        let name = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .map(decode_until_stable)
            .unwrap_or_else(|| path.clone());

        entries.push(RemoteEntry {
            name,
            path,
            size: None,
            download_url: url.to_string(),
            md5: None,
        });
    }
    Ok(entries)
}

#[async_trait]
impl SiteAdapter for GdIndex {
    fn site_type(&self) -> SiteType {
        SiteType::GdIndex
    }

    async fn list_page(
        &self,
        session: &Session,
        folder: &Url,
        _cursor: Option<&str>,
        _page_index: u32,
    ) -> Result<Page, ListingError> {
        let request = session.client().get(folder.clone());
        let html = session.send_text(request, folder.as_str()).await?;
        Ok(Page {
            entries: parse_listing(&html, folder)?,
            next: None,
        })
    }
}
