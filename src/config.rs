//! Configuration types for index-mirror
//!
//! A [`RunConfig`] is immutable for the lifetime of a run. It is assembled from
//! command-line flags (see [`crate::cli`]) and the process environment
//! ([`EnvConfig`]), then checked by [`RunConfig::validate`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};
use url::Url;

/// Supported index front-ends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiteType {
    /// `achrou/goindex` (paged JSON API, `0:down` download prefix)
    AchrouGoIndex,
    /// `donwa/goindex` (single-page JSON API)
    DonwaGoIndex,
    /// `maple3142/GDIndex` (HTML listing)
    GdIndex,
    /// `spencerwooo/onedrive` (onedrive-vercel-index JSON API)
    OneDrive,
}

impl SiteType {
    /// Identifier as accepted on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteType::AchrouGoIndex => "achrou/goindex",
            SiteType::DonwaGoIndex => "donwa/goindex",
            SiteType::GdIndex => "maple3142/GDIndex",
            SiteType::OneDrive => "spencerwooo/onedrive",
        }
    }

    /// All supported identifiers
    pub fn all() -> [SiteType; 4] {
        [
            SiteType::AchrouGoIndex,
            SiteType::DonwaGoIndex,
            SiteType::GdIndex,
            SiteType::OneDrive,
        ]
    }
}

impl std::fmt::Display for SiteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SiteType::all()
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let known: Vec<&str> = SiteType::all().iter().map(|t| t.as_str()).collect();
                Error::config(
                    format!("unknown site type '{}' (expected one of: {})", s, known.join(", ")),
                    "--site-type",
                )
            })
    }
}

/// Inclusive, 1-based range of listing positions (`--filter 10-20`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRange {
    /// First position (1-based, inclusive)
    pub start: usize,
    /// Last position (1-based, inclusive)
    pub end: usize,
}

impl FromStr for IndexRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::config(
                format!("'{}' is not a range in the form 'start-end'", s),
                "--filter",
            )
        };
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start: usize = start.trim().parse().map_err(|_| invalid())?;
        let end: usize = end.trim().parse().map_err(|_| invalid())?;
        if start == 0 {
            return Err(Error::config("range positions start at 1", "--filter"));
        }
        if start > end {
            return Err(Error::config(
                "the start of the range cannot be greater than the end",
                "--filter",
            ));
        }
        Ok(Self { start, end })
    }
}

/// Which listing positions are processed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryFilter {
    /// Every entry
    #[default]
    All,
    /// Entries at positions `start..=end` (1-based)
    Range(IndexRange),
    /// The last N entries
    Last(usize),
}

impl EntryFilter {
    /// Apply the filter, returning each kept item with its 1-based listing position
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<(usize, T)> {
        let total = items.len();
        let keep = |pos: usize| match self {
            EntryFilter::All => true,
            EntryFilter::Range(r) => pos >= r.start && pos <= r.end,
            EntryFilter::Last(n) => pos > total.saturating_sub(*n),
        };
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (i + 1, item))
            .filter(|(pos, _)| keep(*pos))
            .collect()
    }
}

/// Progress display mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// Aggregate bar plus one bar per in-flight file
    #[default]
    MultiLine,
    /// One continuously updated aggregate line
    OneLine,
    /// Periodic log lines (no terminal)
    Plain,
    /// No progress output
    Off,
}

/// HTTP basic-auth credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub user: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// External tool paths and password configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to password file (one password per line)
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Try empty password as fallback
    #[serde(default = "default_true")]
    pub try_empty_password: bool,

    /// Path to unrar executable (auto-detected if None)
    #[serde(default)]
    pub unrar_path: Option<PathBuf>,

    /// Path to rclone executable (auto-detected if None)
    #[serde(default)]
    pub rclone_path: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            password_file: None,
            try_empty_password: true,
            unrar_path: None,
            rclone_path: None,
        }
    }
}

/// Archive handling after download
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Remove the archive (all volumes) after a successful extraction
    #[serde(default)]
    pub delete_after: bool,

    /// Extract into `<archive stem>/` instead of the archive's directory
    #[serde(default)]
    pub into_subdir: bool,
}

/// Cloud upload through rclone
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// rclone remote name (`RCLONE_REMOTE`)
    pub remote: String,

    /// Group directory on the remote (`--group-name`)
    pub group: String,

    /// rclone config file (`RCLONE_CONFIG`)
    #[serde(default)]
    pub rclone_config: Option<PathBuf>,

    /// Extra rclone flags (`RCLONE_OPTIONS`)
    #[serde(default = "default_rclone_options")]
    pub options: Vec<String>,

    /// Delete local files after a successful upload
    #[serde(default)]
    pub remove_uploaded: bool,

    /// Upload even if some jobs in the batch failed
    #[serde(default)]
    pub best_effort: bool,
}

/// Bookkeeping backend selection (`DB_TYPE`)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookkeepingBackend {
    /// No persistence
    #[default]
    None,
    /// Hosted PostgREST service with API key
    Supabase {
        /// Project URL
        url: String,
        /// Service or anon key
        key: String,
    },
    /// Local SQL database through sqlx
    Sqlite {
        /// Database file path
        path: PathBuf,
    },
}

/// Bookkeeping store configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BookkeepingConfig {
    /// Selected backend
    #[serde(default)]
    pub backend: BookkeepingBackend,

    /// Abort the run instead of degrading when the store is unreachable
    #[serde(default)]
    pub required: bool,
}

/// Values read from the process environment
///
/// Two schema generations exist for the store variables: the hosted store
/// uses `SUPABASE_URL`/`SUPABASE_KEY`, and the older `DB_URL`/`DB_PASSWORD`
/// names are accepted as aliases for it.
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// `HTTP_USER`
    pub http_user: Option<String>,
    /// `HTTP_PASSWORD`
    pub http_password: Option<String>,
    /// `DB_TYPE`
    pub db_type: Option<String>,
    /// `SUPABASE_URL`
    pub supabase_url: Option<String>,
    /// `SUPABASE_KEY`
    pub supabase_key: Option<String>,
    /// `DB_URL`
    pub db_url: Option<String>,
    /// `DB_USER`
    pub db_user: Option<String>,
    /// `DB_PASSWORD`
    pub db_password: Option<String>,
    /// `DB_REQUIRED`
    pub db_required: bool,
    /// `RCLONE_REMOTE`
    pub rclone_remote: Option<String>,
    /// `RCLONE_OPTIONS`
    pub rclone_options: Option<String>,
    /// `RCLONE_CONFIG`
    pub rclone_config: Option<PathBuf>,
    /// `RCLONE_BINARY`
    pub rclone_binary: Option<PathBuf>,
    /// `UNRAR_BINARY`
    pub unrar_binary: Option<PathBuf>,
}

impl EnvConfig {
    /// Read from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup function; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            http_user: get("HTTP_USER"),
            http_password: get("HTTP_PASSWORD"),
            db_type: get("DB_TYPE"),
            supabase_url: get("SUPABASE_URL"),
            supabase_key: get("SUPABASE_KEY"),
            db_url: get("DB_URL"),
            db_user: get("DB_USER"),
            db_password: get("DB_PASSWORD"),
            db_required: get("DB_REQUIRED")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            rclone_remote: get("RCLONE_REMOTE"),
            rclone_options: get("RCLONE_OPTIONS"),
            rclone_config: get("RCLONE_CONFIG").map(PathBuf::from),
            rclone_binary: get("RCLONE_BINARY").map(PathBuf::from),
            unrar_binary: get("UNRAR_BINARY").map(PathBuf::from),
        }
    }

    /// Basic-auth credentials, if both halves are present
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.http_user, &self.http_password) {
            (Some(user), Some(password)) => Some(Credentials {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Resolve the bookkeeping backend from `DB_TYPE` and its credentials
    pub fn bookkeeping(&self) -> Result<BookkeepingConfig> {
        let backend = match self.db_type.as_deref().map(str::trim) {
            None => BookkeepingBackend::None,
            Some(t) if t.eq_ignore_ascii_case("none") => BookkeepingBackend::None,
            Some(t) if t.eq_ignore_ascii_case("supabase") => {
                let url = self
                    .supabase_url
                    .clone()
                    .or_else(|| self.db_url.clone())
                    .ok_or_else(|| {
                        Error::config("DB_TYPE=Supabase requires SUPABASE_URL", "SUPABASE_URL")
                    })?;
                let key = self
                    .supabase_key
                    .clone()
                    .or_else(|| self.db_password.clone())
                    .ok_or_else(|| {
                        Error::config("DB_TYPE=Supabase requires SUPABASE_KEY", "SUPABASE_KEY")
                    })?;
                BookkeepingBackend::Supabase { url, key }
            }
            Some(t) if t.eq_ignore_ascii_case("sqlite") || t.eq_ignore_ascii_case("sql") => {
                let raw = self
                    .db_url
                    .clone()
                    .ok_or_else(|| Error::config("DB_TYPE=Sqlite requires DB_URL", "DB_URL"))?;
                let path = raw.strip_prefix("sqlite://").or_else(|| raw.strip_prefix("sqlite:"));
                BookkeepingBackend::Sqlite {
                    path: PathBuf::from(path.unwrap_or(&raw)),
                }
            }
            Some(other) => {
                return Err(Error::config(
                    format!(
                        "unknown DB_TYPE '{}' (expected Supabase, Sqlite or none)",
                        other
                    ),
                    "DB_TYPE",
                ));
            }
        };
        Ok(BookkeepingConfig {
            backend,
            required: self.db_required,
        })
    }

    /// rclone flags: `RCLONE_OPTIONS` split on whitespace, or the defaults
    pub fn rclone_options(&self) -> Vec<String> {
        match &self.rclone_options {
            Some(raw) => raw.split_whitespace().map(str::to_string).collect(),
            None => default_rclone_options(),
        }
    }
}

/// Complete, validated configuration for one run
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Index folder URL
    pub url: Url,
    /// Index front-end type
    pub site_type: SiteType,
    /// Basic-auth credentials (set when `--use-auth` is given)
    pub credentials: Option<Credentials>,
    /// Maximum concurrent downloads
    pub simultaneous: usize,
    /// Files per batch (None = whole listing in one batch)
    pub batch_limit: Option<usize>,
    /// Listing position filter
    pub filter: EntryFilter,
    /// Local staging root
    pub base_folder: PathBuf,
    /// Progress display
    pub progress: ProgressMode,
    /// Archive handling
    pub extraction: ExtractionConfig,
    /// Upload settings (None = upload disabled)
    pub upload: Option<UploadConfig>,
    /// Bookkeeping store
    pub bookkeeping: BookkeepingConfig,
    /// Retry policy for downloads
    pub retry: RetryConfig,
    /// Listing retry attempts for transient errors
    pub listing_retries: u32,
    /// External tools and passwords
    pub tools: ToolsConfig,
    /// Per-request connect timeout
    pub connect_timeout: Duration,
}

impl RunConfig {
    /// Minimal configuration for a URL and site type, all else default
    pub fn new(url: Url, site_type: SiteType) -> Self {
        Self {
            url,
            site_type,
            credentials: None,
            simultaneous: default_simultaneous(),
            batch_limit: None,
            filter: EntryFilter::All,
            base_folder: PathBuf::from("."),
            progress: ProgressMode::default(),
            extraction: ExtractionConfig::default(),
            upload: None,
            bookkeeping: BookkeepingConfig::default(),
            retry: RetryConfig::default(),
            listing_retries: default_listing_retries(),
            tools: ToolsConfig::default(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.simultaneous == 0 {
            return Err(Error::config(
                "simultaneous downloads must be at least 1",
                "--simultaneous",
            ));
        }
        if self.batch_limit == Some(0) {
            return Err(Error::config("batch limit must be at least 1", "--limit"));
        }
        if let EntryFilter::Last(0) = self.filter {
            return Err(Error::config("--last must be at least 1", "--last"));
        }
        if !matches!(self.url.scheme(), "http" | "https") {
            return Err(Error::config(
                format!("unsupported URL scheme '{}'", self.url.scheme()),
                "--url",
            ));
        }
        if let Some(upload) = &self.upload {
            if upload.remote.trim().is_empty() {
                return Err(Error::config("upload requires RCLONE_REMOTE", "RCLONE_REMOTE"));
            }
            if upload.group.trim().is_empty() {
                return Err(Error::config("upload requires --group-name", "--group-name"));
            }
        }
        Ok(())
    }
}

fn default_simultaneous() -> usize {
    4
}

fn default_listing_retries() -> u32 {
    3
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_rclone_options() -> Vec<String> {
    vec![
        "--transfers=4".into(),
        "--checkers=8".into(),
        "--ignore-existing".into(),
    ]
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> EnvConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn site_type_round_trips_identifiers() {
        for t in SiteType::all() {
            assert_eq!(t.as_str().parse::<SiteType>().unwrap(), t);
        }
        assert_eq!(
            "Maple3142/gdindex".parse::<SiteType>().unwrap(),
            SiteType::GdIndex
        );
        assert!("foo/bar".parse::<SiteType>().is_err());
    }

    #[test]
    fn range_parsing() {
        let r: IndexRange = "10-20".parse().unwrap();
        assert_eq!(r, IndexRange { start: 10, end: 20 });
        assert!("20-10".parse::<IndexRange>().is_err());
        assert!("0-3".parse::<IndexRange>().is_err());
        assert!("abc".parse::<IndexRange>().is_err());
        assert!("5".parse::<IndexRange>().is_err());
    }

    #[test]
    fn range_filter_is_inclusive_and_one_based() {
        let items: Vec<u32> = (1..=30).collect();
        let kept = EntryFilter::Range(IndexRange { start: 10, end: 20 }).apply(items);
        let positions: Vec<usize> = kept.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, (10..=20).collect::<Vec<_>>());
        assert_eq!(kept.first().unwrap().1, 10);
        assert_eq!(kept.last().unwrap().1, 20);
    }

    #[test]
    fn range_past_end_is_truncated() {
        let kept = EntryFilter::Range(IndexRange { start: 3, end: 50 }).apply(vec!['a', 'b', 'c', 'd']);
        assert_eq!(kept, vec![(3, 'c'), (4, 'd')]);
    }

    #[test]
    fn last_filter_keeps_tail() {
        let kept = EntryFilter::Last(2).apply(vec!['a', 'b', 'c', 'd']);
        assert_eq!(kept, vec![(3, 'c'), (4, 'd')]);
        let all = EntryFilter::Last(10).apply(vec!['a', 'b']);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn last_filter_larger_than_listing_keeps_everything() {
        let kept = EntryFilter::Last(usize::MAX).apply(vec!['a', 'b', 'c']);
        assert_eq!(kept, vec![(1, 'a'), (2, 'b'), (3, 'c')]);
        assert!(EntryFilter::Last(usize::MAX).apply(Vec::<char>::new()).is_empty());
        assert!(EntryFilter::Last(0).apply(vec!['a']).is_empty());
    }

    #[test]
    fn supabase_backend_accepts_legacy_names() {
        let cfg = env(&[
            ("DB_TYPE", "Supabase"),
            ("DB_URL", "https://proj.supabase.co"),
            ("DB_PASSWORD", "anon-key"),
        ])
        .bookkeeping()
        .unwrap();
        assert_eq!(
            cfg.backend,
            BookkeepingBackend::Supabase {
                url: "https://proj.supabase.co".into(),
                key: "anon-key".into()
            }
        );
    }

    #[test]
    fn supabase_backend_prefers_current_names() {
        let cfg = env(&[
            ("DB_TYPE", "supabase"),
            ("SUPABASE_URL", "https://new.supabase.co"),
            ("SUPABASE_KEY", "new-key"),
            ("DB_URL", "https://old.supabase.co"),
        ])
        .bookkeeping()
        .unwrap();
        assert!(matches!(
            cfg.backend,
            BookkeepingBackend::Supabase { ref url, .. } if url == "https://new.supabase.co"
        ));
    }

    #[test]
    fn supabase_without_key_is_config_error() {
        let err = env(&[("DB_TYPE", "Supabase"), ("SUPABASE_URL", "https://x")])
            .bookkeeping()
            .unwrap_err();
        assert!(matches!(err, Error::Config { key: Some(ref k), .. } if k == "SUPABASE_KEY"));
    }

    #[test]
    fn sqlite_backend_strips_scheme() {
        let cfg = env(&[("DB_TYPE", "Sqlite"), ("DB_URL", "sqlite:///var/lib/mirror.db")])
            .bookkeeping()
            .unwrap();
        assert_eq!(
            cfg.backend,
            BookkeepingBackend::Sqlite {
                path: PathBuf::from("/var/lib/mirror.db")
            }
        );
    }

    #[test]
    fn unknown_db_type_is_rejected() {
        assert!(env(&[("DB_TYPE", "mongo")]).bookkeeping().is_err());
        assert_eq!(
            env(&[]).bookkeeping().unwrap().backend,
            BookkeepingBackend::None
        );
    }

    #[test]
    fn db_required_flag() {
        assert!(env(&[("DB_REQUIRED", "true")]).db_required);
        assert!(env(&[("DB_REQUIRED", "1")]).db_required);
        assert!(!env(&[("DB_REQUIRED", "no")]).db_required);
    }

    #[test]
    fn credentials_need_both_halves() {
        assert!(env(&[("HTTP_USER", "u")]).credentials().is_none());
        let c = env(&[("HTTP_USER", "u"), ("HTTP_PASSWORD", "p")])
            .credentials()
            .unwrap();
        assert_eq!(c.user, "u");
        assert!(format!("{:?}", c).contains("<redacted>"));
    }

    #[test]
    fn rclone_options_default_and_override() {
        assert!(env(&[]).rclone_options().contains(&"--ignore-existing".to_string()));
        assert_eq!(
            env(&[("RCLONE_OPTIONS", "--transfers=2  --fast-list")]).rclone_options(),
            vec!["--transfers=2".to_string(), "--fast-list".to_string()]
        );
    }

    #[test]
    fn validate_rejects_zero_concurrency_and_missing_group() {
        let url = Url::parse("https://idx.example/0:/show/").unwrap();
        let mut cfg = RunConfig::new(url, SiteType::AchrouGoIndex);
        assert!(cfg.validate().is_ok());

        cfg.simultaneous = 0;
        assert!(cfg.validate().is_err());
        cfg.simultaneous = 2;

        cfg.upload = Some(UploadConfig {
            remote: "gdrive".into(),
            group: " ".into(),
            rclone_config: None,
            options: vec![],
            remove_uploaded: false,
            best_effort: false,
        });
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Config { key: Some(ref k), .. } if k == "--group-name"));
    }
}
