//! Remote index enumeration
//!
//! An [`IndexClient`] walks one folder of a file-index front-end and yields
//! [`RemoteEntry`] values. Each supported front-end is a [`SiteAdapter`]:
//! - [`goindex`] - `achrou/goindex` and `donwa/goindex` (POST JSON API)
//! - [`gdindex`] - `maple3142/GDIndex` (HTML listing)
//! - [`onedrive`] - `spencerwooo/onedrive` (GET JSON API)

pub mod gdindex;
pub mod goindex;
pub mod onedrive;


use crate::config::{Credentials, RetryConfig, SiteType};
use crate::error::ListingError;
use crate::retry::with_backoff;
use crate::types::RemoteEntry;
use crate::utils::decode_until_stable;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt, stream};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Hard stop for runaway pagination
const MAX_PAGES: u32 = 10_000;

/// One page of a folder listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Page {
    /// Files on this page, in listing order
    pub entries: Vec<RemoteEntry>,
    /// Cursor for the next page; `None` when this was the last one
    pub next: Option<String>,
}

/// HTTP access to an index, with optional basic auth
#[derive(Clone, Debug)]
pub struct Session {
    client: reqwest::Client,
    credentials: Option<Credentials>,
}

impl Session {
    /// Create a session with the given connect timeout
    pub fn new(
        credentials: Option<Credentials>,
        connect_timeout: Duration,
    ) -> Result<Self, ListingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("index-mirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ListingError::Unreachable {
                url: String::new(),
                reason: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            credentials,
        })
    }

    /// Underlying HTTP client
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Credentials attached to every request, if any
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Attach credentials to a request
    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(c) => request.basic_auth(&c.user, Some(&c.password)),
            None => request,
        }
    }

    /// Send a request and map transport and status failures
    pub async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, ListingError> {
        let response =
            self.authorize(request)
                .send()
                .await
                .map_err(|e| ListingError::Unreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ListingError::AuthRejected {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(ListingError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// Send a request and decode a JSON body
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<T, ListingError> {
        let body = self.send_text(request, url).await?;
        serde_json::from_str(&body).map_err(|e| ListingError::Parse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Send a request and read the body as text
    pub async fn send_text(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<String, ListingError> {
        self.send(request, url)
            .await?
            .text()
            .await
            .map_err(|e| ListingError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

/// A file-index front-end
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Which front-end this adapter speaks to
    fn site_type(&self) -> SiteType;

    /// Fetch one page of `folder`. `cursor` is `None` for the first page.
    async fn list_page(
        &self,
        session: &Session,
        folder: &Url,
        cursor: Option<&str>,
        page_index: u32,
    ) -> Result<Page, ListingError>;

    /// Remote folder path (decoded, no leading or trailing slash) for a folder URL
    fn folder_path(&self, folder: &Url) -> String {
        decoded_url_path(folder)
    }
}

/// Adapter for a site type
pub fn adapter_for(site_type: SiteType) -> Arc<dyn SiteAdapter> {
    match site_type {
        SiteType::AchrouGoIndex => Arc::new(goindex::GoIndex::achrou()),
        SiteType::DonwaGoIndex => Arc::new(goindex::GoIndex::donwa()),
        SiteType::GdIndex => Arc::new(gdindex::GdIndex),
        SiteType::OneDrive => Arc::new(onedrive::OneDrive),
    }
}

/// Decoded URL path without surrounding slashes
pub(crate) fn decoded_url_path(url: &Url) -> String {
    decode_until_stable(url.path()).trim_matches('/').to_string()
}

/// Join a folder path and a file name into a remote path
pub(crate) fn join_remote(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

/// Folder URL with a guaranteed trailing slash, so relative joins stay inside it
pub(crate) fn folder_url(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Enumerates one folder of a remote index
#[derive(Clone)]
pub struct IndexClient {
    session: Session,
    adapter: Arc<dyn SiteAdapter>,
    folder: Url,
    retry: RetryConfig,
}

impl std::fmt::Debug for IndexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexClient")
            .field("site_type", &self.adapter.site_type())
            .field("folder", &self.folder.as_str())
            .finish()
    }
}

impl IndexClient {
    /// Create a client for a folder URL
    pub fn new(
        session: Session,
        adapter: Arc<dyn SiteAdapter>,
        folder: Url,
        retry: RetryConfig,
    ) -> Self {
        Self {
            session,
            adapter,
            folder: folder_url(&folder),
            retry,
        }
    }

    /// Decoded remote folder path, used to lay out local files and the upload target
    pub fn folder_path(&self) -> String {
        self.adapter.folder_path(&self.folder)
    }

    async fn fetch_page(&self, cursor: Option<&str>, page_index: u32) -> Result<Page, ListingError> {
        with_backoff(&self.retry, || {
            self.adapter
                .list_page(&self.session, &self.folder, cursor, page_index)
        })
        .await
    }

    /// Lazily page through the folder
    ///
    /// Each page is requested only when the previous one has been consumed.
    /// The stream ends when the remote stops returning a cursor.
    pub fn entries(&self) -> impl Stream<Item = Result<RemoteEntry, ListingError>> + '_ {
        #[derive(Clone)]
        enum Cursor {
            Start,
            Next(String, u32),
            Done,
        }

        stream::try_unfold(Cursor::Start, move |cursor| async move {
            let (token, index) = match cursor {
                Cursor::Start => (None, 0),
                Cursor::Next(token, index) => (Some(token), index),
                Cursor::Done => return Ok(None),
            };

            let page = self.fetch_page(token.as_deref(), index).await?;
            tracing::debug!(
                folder = %self.folder,
                page = index,
                entries = page.entries.len(),
                has_next = page.next.is_some(),
                "Fetched listing page"
            );

            let next = match page.next {
                Some(next) if Some(&next) == token.as_ref() => {
                    tracing::warn!(folder = %self.folder, "Index repeated its page cursor, stopping");
                    Cursor::Done
                }
                Some(_) if index + 1 >= MAX_PAGES => {
                    tracing::warn!(folder = %self.folder, pages = MAX_PAGES, "Page limit reached");
                    Cursor::Done
                }
                Some(next) => Cursor::Next(next, index + 1),
                None => Cursor::Done,
            };

            let items = page.entries.into_iter().map(Ok::<_, ListingError>);
            Ok(Some((stream::iter(items), next)))
        })
        .try_flatten()
    }

    /// Collect the whole listing; any failed page fails the listing
    pub async fn list_all(&self) -> Result<Vec<RemoteEntry>, ListingError> {
        let entries: Vec<RemoteEntry> = self.entries().try_collect().await?;
        tracing::info!(
            folder = %self.folder,
            site_type = %self.adapter.site_type(),
            count = entries.len(),
            "Listed remote folder"
        );
        Ok(entries)
    }
}
