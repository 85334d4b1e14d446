//! Bookkeeping store
//!
//! Records which remote entries have already been transferred so reruns only
//! pick up what is new, and caches archive passwords by the archive's MD5.
//!
//! ## Submodules
//!
//! - [`sqlite`]: local database through sqlx
//! - [`supabase`]: hosted PostgREST tables over HTTP
//!
//! The store is chosen once at startup by [`open_store`] and passed to the
//! pipeline as an `Arc<dyn BookkeepingStore>`.

use crate::config::{BookkeepingBackend, BookkeepingConfig};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub mod sqlite;
pub mod supabase;


pub use sqlite::SqliteStore;
pub use supabase::SupabaseStore;

/// What is recorded when an entry finishes its pipeline
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Remote file name
    pub name: String,
    /// Size in bytes, when the index reported one
    pub size: Option<u64>,
    /// MD5 reported by the index
    pub md5: Option<String>,
    /// Upload target (`remote:group/folder`), when the batch was uploaded
    pub destination: Option<String>,
}

/// Persistent record of completed transfers and known archive passwords
///
/// `has_completed`/`mark_completed` are keyed by the entry's remote path and
/// are idempotent: marking twice is not an error.
#[async_trait]
pub trait BookkeepingStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Whether this store persists anything
    ///
    /// Callers use this to skip work that only feeds the store, such as
    /// hashing archives for the password cache.
    fn enabled(&self) -> bool {
        true
    }

    /// Has this entry already gone through the whole pipeline?
    async fn has_completed(&self, key: &str) -> Result<bool>;

    /// Record that this entry went through the whole pipeline
    async fn mark_completed(&self, key: &str, record: &CompletionRecord) -> Result<()>;

    /// Password known to open the archive with this MD5
    async fn cached_password(&self, md5: &str) -> Result<Option<String>>;

    /// Remember the password that opened an archive
    async fn save_password(&self, filename: &str, md5: &str, password: &str) -> Result<()>;
}

/// Store used when no backend is configured
///
/// Nothing is ever completed and nothing is stored.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpStore;

#[async_trait]
impl BookkeepingStore for NoOpStore {
    fn name(&self) -> &'static str {
        "none"
    }

    fn enabled(&self) -> bool {
        false
    }

    async fn has_completed(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn mark_completed(&self, _key: &str, _record: &CompletionRecord) -> Result<()> {
        Ok(())
    }

    async fn cached_password(&self, _md5: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn save_password(&self, _filename: &str, _md5: &str, _password: &str) -> Result<()> {
        Ok(())
    }
}

/// Wrapper that turns store failures into warnings
///
/// A failed lookup reads as "not completed" / "no cached password" and a
/// failed write is dropped, so an unreachable store never fails a run unless
/// the store was marked required.
pub struct LenientStore {
    inner: Arc<dyn BookkeepingStore>,
}

impl LenientStore {
    /// Wrap a store
    pub fn new(inner: Arc<dyn BookkeepingStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BookkeepingStore for LenientStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn enabled(&self) -> bool {
        self.inner.enabled()
    }

    async fn has_completed(&self, key: &str) -> Result<bool> {
        match self.inner.has_completed(key).await {
            Ok(done) => Ok(done),
            Err(e) => {
                warn!(store = self.name(), key, error = %e, "completion lookup failed, treating as not completed");
                Ok(false)
            }
        }
    }

    async fn mark_completed(&self, key: &str, record: &CompletionRecord) -> Result<()> {
        if let Err(e) = self.inner.mark_completed(key, record).await {
            warn!(store = self.name(), key, error = %e, "failed to record completion");
        }
        Ok(())
    }

    async fn cached_password(&self, md5: &str) -> Result<Option<String>> {
        match self.inner.cached_password(md5).await {
            Ok(pw) => Ok(pw),
            Err(e) => {
                warn!(store = self.name(), md5, error = %e, "password lookup failed");
                Ok(None)
            }
        }
    }

    async fn save_password(&self, filename: &str, md5: &str, password: &str) -> Result<()> {
        if let Err(e) = self.inner.save_password(filename, md5, password).await {
            warn!(store = self.name(), filename, error = %e, "failed to save archive password");
        }
        Ok(())
    }
}

/// Open the configured store
///
/// When the store cannot be opened and `required` is false, a warning is
/// logged and a [`NoOpStore`] is returned. Opened stores that are not
/// required are wrapped in a [`LenientStore`].
pub async fn open_store(config: &BookkeepingConfig) -> Result<Arc<dyn BookkeepingStore>> {
    let opened: Result<Arc<dyn BookkeepingStore>> = match &config.backend {
        BookkeepingBackend::None => return Ok(Arc::new(NoOpStore)),
        BookkeepingBackend::Sqlite { path } => SqliteStore::open(path)
            .await
            .map(|s| Arc::new(s) as Arc<dyn BookkeepingStore>),
        BookkeepingBackend::Supabase { url, key } => SupabaseStore::new(url, key)
            .map(|s| Arc::new(s) as Arc<dyn BookkeepingStore>),
    };

    match opened {
        Ok(store) if config.required => Ok(store),
        Ok(store) => Ok(Arc::new(LenientStore::new(store))),
        Err(e) if config.required => Err(e),
        Err(e) => {
            warn!(error = %e, "bookkeeping store unavailable, continuing without it");
            Ok(Arc::new(NoOpStore))
        }
    }
}
