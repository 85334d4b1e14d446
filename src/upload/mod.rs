//! Upload of staged folders to a cloud remote
//!
//! One sync per batch, after every job of the batch has finished. The tool's
//! exit status decides success; on failure local files stay where they are.

use crate::config::UploadConfig;
use crate::downloader::fetch::PARTIAL_SUFFIX;
use crate::error::UploadError;
use crate::types::Event;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub mod rclone;


pub use rclone::Rclone;

/// External tool that copies a local folder to a remote target
#[async_trait]
pub trait SyncTool: Send + Sync {
    /// Binary name for logs
    fn name(&self) -> &'static str;

    /// Copy everything under `source` to `target`
    async fn sync(&self, source: &Path, target: &str) -> Result<(), UploadError>;
}

/// Drives uploads for a run
pub struct UploadManager {
    tool: Arc<dyn SyncTool>,
    config: UploadConfig,
    events: broadcast::Sender<Event>,
}

impl UploadManager {
    /// Create a manager
    pub fn new(tool: Arc<dyn SyncTool>, config: UploadConfig, events: broadcast::Sender<Event>) -> Self {
        Self {
            tool,
            config,
            events,
        }
    }

    /// Remote target for a folder path relative to the index root
    ///
    /// `remote:group/relative`, with empty segments left out.
    pub fn target_for(&self, relative_folder: &str) -> String {
        let segments: Vec<&str> = [self.config.group.as_str(), relative_folder]
            .iter()
            .flat_map(|s| s.split('/'))
            .filter(|s| !s.is_empty())
            .collect();
        format!("{}:{}", self.config.remote, segments.join("/"))
    }

    /// Upload a staged folder
    ///
    /// Returns the target that was written. With `remove_uploaded`, the
    /// listed `uploaded` files are deleted only after the tool reported
    /// success; anything else under `staged` is left alone.
    pub async fn upload(
        &self,
        staged: &Path,
        relative_folder: &str,
        uploaded: Vec<PathBuf>,
    ) -> Result<String, UploadError> {
        let target = self.target_for(relative_folder);
        info!(
            tool = self.tool.name(),
            source = %staged.display(),
            %target,
            "uploading batch"
        );
        self.events
            .send(Event::UploadStarted {
                target: target.clone(),
            })
            .ok();

        let result = self.tool.sync(staged, &target).await;
        self.events
            .send(Event::UploadComplete {
                target: target.clone(),
                success: result.is_ok(),
            })
            .ok();

        if let Err(e) = result {
            warn!(%target, error = %e, "upload failed, local files kept");
            return Err(e);
        }

        if self.config.remove_uploaded {
            let staged = staged.to_path_buf();
            let removed =
                tokio::task::spawn_blocking(move || remove_uploaded_files(&staged, &uploaded))
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "cleanup task failed");
                        0
                    });
            info!(removed, "removed uploaded local files");
        }

        Ok(target)
    }
}

/// Delete the given uploaded files, then any of their directories left empty
///
/// Only files inside `root` are touched. In-progress `.partial` files are
/// kept so a later run can resume them. Emptied directories are pruned up
/// to, but not including, `root`.
fn remove_uploaded_files(root: &Path, files: &[PathBuf]) -> usize {
    let mut removed = 0;
    let mut parents = BTreeSet::new();

    for path in files {
        if !path.starts_with(root) || path == root || is_partial(path) {
            continue;
        }
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove uploaded file");
                continue;
            }
        }
        if let Some(parent) = path.parent() {
            parents.insert(parent.to_path_buf());
        }
    }

    // Deepest first so nested directories empty out before their parents
    let mut parents: Vec<PathBuf> = parents.into_iter().collect();
    parents.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in parents {
        let mut current = dir.as_path();
        while current != root && current.starts_with(root) {
            if std::fs::remove_dir(current).is_err() {
                break;
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    removed
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().ends_with(PARTIAL_SUFFIX))
}
