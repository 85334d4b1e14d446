//! Command-line interface
//!
//! Flags describe one run; credentials, the bookkeeping backend and rclone
//! settings come from the environment (see [`EnvConfig`]).
//! [`Cli::into_config`] merges both into a validated [`RunConfig`].

use crate::config::{
    EntryFilter, EnvConfig, ExtractionConfig, IndexRange, ProgressMode, RunConfig, SiteType,
    ToolsConfig, UploadConfig,
};
use crate::error::{Error, Result};
use clap::Parser;
use std::path::PathBuf;
use url::Url;

/// Mirror a folder of a web-based cloud index to local disk and, optionally,
/// to an rclone remote
#[derive(Debug, Parser)]
#[command(name = "index-mirror", version, about)]
pub struct Cli {
    /// Index folder URL
    #[arg(long)]
    pub url: String,

    /// Index front-end: achrou/goindex, donwa/goindex, maple3142/GDIndex or spencerwooo/onedrive
    #[arg(long, alias = "site_type")]
    pub site_type: String,

    /// Send basic auth from HTTP_USER/HTTP_PASSWORD
    #[arg(long, alias = "use_auth")]
    pub use_auth: bool,

    /// Maximum concurrent downloads
    #[arg(long, default_value_t = 4)]
    pub simultaneous: usize,

    /// Files per batch; each batch is downloaded, extracted and uploaded before the next
    #[arg(long)]
    pub limit: Option<usize>,

    /// Only process listing positions START-END (1-based, inclusive)
    #[arg(long, value_name = "START-END", conflicts_with = "last")]
    pub filter: Option<String>,

    /// Only process the last N entries of the listing
    #[arg(long, value_name = "N")]
    pub last: Option<usize>,

    /// Delete archives after a successful extraction
    #[arg(long)]
    pub delete_after: bool,

    /// Extract each archive into a folder named after it
    #[arg(long)]
    pub extract_subdir: bool,

    /// File with one archive password per line
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// Upload each finished batch with rclone
    #[arg(long, requires = "group_name")]
    pub upload: bool,

    /// Directory on the remote that receives the mirrored folder
    #[arg(long)]
    pub group_name: Option<String>,

    /// Upload a batch even when some of its jobs failed
    #[arg(long, requires = "upload")]
    pub best_effort: bool,

    /// Delete local files once they are uploaded
    #[arg(long, requires = "upload")]
    pub remove_uploaded: bool,

    /// Show a single progress line instead of per-file bars
    #[arg(long)]
    pub stats_one_line: bool,

    /// Disable the progress display
    #[arg(long, conflicts_with = "stats_one_line")]
    pub no_progress: bool,

    /// Local staging root
    #[arg(long, default_value = ".")]
    pub base_folder: PathBuf,

    /// Attempts for transient listing errors
    #[arg(long, default_value_t = 3)]
    pub listing_retries: u32,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Requested progress mode, before terminal detection
    pub fn progress_mode(&self) -> ProgressMode {
        if self.no_progress {
            ProgressMode::Off
        } else if self.stats_one_line {
            ProgressMode::OneLine
        } else {
            ProgressMode::MultiLine
        }
    }

    /// Merge flags with the environment into a validated run configuration
    pub fn into_config(self, env: &EnvConfig) -> Result<RunConfig> {
        let url = Url::parse(self.url.trim())
            .map_err(|e| Error::config(format!("invalid URL '{}': {}", self.url, e), "--url"))?;
        let site_type: SiteType = self.site_type.parse()?;
        let progress = self.progress_mode();

        let credentials = if self.use_auth {
            Some(env.credentials().ok_or_else(|| {
                Error::config(
                    "--use-auth requires HTTP_USER and HTTP_PASSWORD",
                    "HTTP_USER",
                )
            })?)
        } else {
            None
        };

        let filter = match (&self.filter, self.last) {
            (Some(range), _) => EntryFilter::Range(range.parse::<IndexRange>()?),
            (None, Some(n)) => EntryFilter::Last(n),
            (None, None) => EntryFilter::All,
        };

        let upload = if self.upload {
            let remote = env.rclone_remote.clone().ok_or_else(|| {
                Error::config("--upload requires RCLONE_REMOTE", "RCLONE_REMOTE")
            })?;
            Some(UploadConfig {
                remote,
                group: self.group_name.clone().unwrap_or_default(),
                rclone_config: env.rclone_config.clone(),
                options: env.rclone_options(),
                remove_uploaded: self.remove_uploaded,
                best_effort: self.best_effort,
            })
        } else {
            None
        };

        let mut config = RunConfig::new(url, site_type);
        config.credentials = credentials;
        config.simultaneous = self.simultaneous;
        config.batch_limit = self.limit;
        config.filter = filter;
        config.base_folder = self.base_folder;
        config.progress = progress;
        config.extraction = ExtractionConfig {
            delete_after: self.delete_after,
            into_subdir: self.extract_subdir,
        };
        config.upload = upload;
        config.bookkeeping = env.bookkeeping()?;
        config.listing_retries = self.listing_retries;
        config.tools = ToolsConfig {
            password_file: self.password_file,
            unrar_path: env.unrar_binary.clone(),
            rclone_path: env.rclone_binary.clone(),
            ..ToolsConfig::default()
        };

        config.validate()?;
        Ok(config)
    }
}
