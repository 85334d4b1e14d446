use super::*;
use crate::bookkeeping::{NoOpStore, SqliteStore};
use crate::config::{EntryFilter, IndexRange, SiteType, UploadConfig};
use crate::downloader::FetchContext;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Writes the file name as the body; fails for names in `fail`
#[derive(Default)]
struct FakeFetcher {
    fail: Vec<String>,
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        entry: &RemoteEntry,
        dest: &Path,
        _ctx: &FetchContext,
    ) -> std::result::Result<u64, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.contains(&entry.name) {
            return Err(DownloadError::Status {
                url: entry.download_url.clone(),
                status: 404,
            });
        }
        tokio::fs::create_dir_all(dest.parent().unwrap()).await.unwrap();
        tokio::fs::write(dest, entry.name.as_bytes()).await.unwrap();
        Ok(entry.name.len() as u64)
    }
}

struct FakeSync {
    calls: Mutex<Vec<(PathBuf, String)>>,
    fail: bool,
}

impl FakeSync {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail,
        })
    }
}

#[async_trait]
impl SyncTool for FakeSync {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn sync(&self, source: &Path, target: &str) -> std::result::Result<(), UploadError> {
        self.calls
            .lock()
            .unwrap()
            .push((source.to_path_buf(), target.to_string()));
        if self.fail {
            return Err(UploadError::ExitStatus {
                tool: "fake".into(),
                code: Some(1),
                stderr: "denied".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn index_with(files: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    let listing: Vec<serde_json::Value> = files
        .iter()
        .map(|name| json!({"name": name, "mimeType": "video/x-matroska", "size": name.len().to_string()}))
        .collect();
    Mock::given(method("POST"))
        .and(path("/Show/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": listing })))
        .mount(&server)
        .await;
    server
}

fn run_config(server: &MockServer, base: &Path) -> RunConfig {
    let url = Url::parse(&format!("{}/Show/", server.uri())).unwrap();
    let mut config = RunConfig::new(url, SiteType::DonwaGoIndex);
    config.base_folder = base.to_path_buf();
    config.simultaneous = 2;
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.jitter = false;
    config
}

fn upload_config(best_effort: bool) -> UploadConfig {
    UploadConfig {
        remote: "gdrive".into(),
        group: "anime".into(),
        rclone_config: None,
        options: Vec::new(),
        remove_uploaded: false,
        best_effort,
    }
}

fn pipeline(
    config: RunConfig,
    store: Arc<dyn BookkeepingStore>,
    fetcher: Arc<FakeFetcher>,
    sync: Option<Arc<FakeSync>>,
) -> Pipeline {
    let (tx, _rx) = broadcast::channel(256);
    Pipeline::with_sync_tool(
        config,
        store,
        tx,
        CancellationToken::new(),
        sync.map(|s| s as Arc<dyn SyncTool>),
    )
    .unwrap()
    .with_fetcher(fetcher)
}

fn entry(name: &str, path: &str) -> RemoteEntry {
    RemoteEntry {
        name: name.into(),
        path: path.into(),
        size: None,
        download_url: format!("http://idx.example/{}", path),
        md5: None,
    }
}

// ---------------------------------------------------------------------------
// Job construction and batching
// ---------------------------------------------------------------------------

#[test]
fn colliding_local_paths_fail_the_later_job() {
    let jobs = build_jobs(
        Path::new("/dl"),
        vec![
            (1, entry("a b.mkv", "Show/a b.mkv")),
            (2, entry("a%20b.mkv", "Show/a%20b.mkv")),
            (3, entry("c.mkv", "Show/c.mkv")),
        ],
    );

    assert_eq!(jobs[0].local_path, PathBuf::from("/dl/Show/a b.mkv"));
    assert_eq!(jobs[0].status(), JobStatus::Pending);
    assert_eq!(jobs[1].status(), JobStatus::Failed);
    assert_eq!(jobs[1].failure().unwrap().code, "download_path_collision");
    assert_eq!(jobs[2].status(), JobStatus::Pending);
    let ids: Vec<u64> = jobs.iter().map(|j| j.id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn batches_respect_the_limit() {
    let selected = (1..=5)
        .map(|i| (i, entry(&format!("f{i}.mkv"), &format!("Show/f{i}.mkv"))))
        .collect();
    let batches = split_batches(build_jobs(Path::new("/dl"), selected), Some(2));
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[test]
fn batches_never_split_a_volume_set() {
    let names = [
        "a.mkv",
        "Pack.part1.rar",
        "Pack.part2.rar",
        "Pack.part3.rar",
        "b.mkv",
    ];
    let selected = names
        .iter()
        .enumerate()
        .map(|(i, n)| (i + 1, entry(n, &format!("Show/{n}"))))
        .collect();
    let batches = split_batches(build_jobs(Path::new("/dl"), selected), Some(2));

    let names: Vec<Vec<&str>> = batches
        .iter()
        .map(|b| b.iter().map(|j| j.entry.name.as_str()).collect())
        .collect();
    assert_eq!(
        names,
        vec![
            vec!["a.mkv", "Pack.part1.rar", "Pack.part2.rar", "Pack.part3.rar"],
            vec!["b.mkv"],
        ]
    );
}

#[test]
fn no_limit_means_one_batch() {
    let selected = (1..=3)
        .map(|i| (i, entry(&format!("f{i}"), &format!("Show/f{i}"))))
        .collect();
    assert_eq!(split_batches(build_jobs(Path::new("/dl"), selected), None).len(), 1);
    assert!(split_batches(Vec::new(), None).is_empty());
}

// ---------------------------------------------------------------------------
// Whole runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn downloads_every_entry_into_the_folder_layout() {
    let server = index_with(&["ep01.mkv", "ep02.mkv", "ep03.mkv"]).await;
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher::default());

    let summary = pipeline(run_config(&server, dir.path()), Arc::new(NoOpStore), fetcher.clone(), None)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.listed, 3);
    assert_eq!(summary.done, 3);
    assert_eq!(summary.exit_code(), exit::SUCCESS);
    assert_eq!(
        std::fs::read(dir.path().join("Show/ep02.mkv")).unwrap(),
        b"ep02.mkv"
    );
}

#[tokio::test]
async fn rerun_with_a_store_transfers_nothing() {
    let server = index_with(&["ep01.mkv", "ep02.mkv"]).await;
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn BookkeepingStore> =
        Arc::new(SqliteStore::open(&dir.path().join("state.db")).await.unwrap());

    let first = Arc::new(FakeFetcher::default());
    let summary = pipeline(run_config(&server, dir.path()), store.clone(), first.clone(), None)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.done, 2);
    assert_eq!(first.calls.load(Ordering::SeqCst), 2);

    let second = Arc::new(FakeFetcher::default());
    let summary = pipeline(run_config(&server, dir.path()), store, second.clone(), None)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.done, 0);
    assert_eq!(summary.exit_code(), exit::SUCCESS);
    assert_eq!(second.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn filter_selects_listing_positions() {
    let names: Vec<String> = (1..=30).map(|i| format!("ep{:02}.mkv", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let server = index_with(&refs).await;
    let dir = TempDir::new().unwrap();

    let mut config = run_config(&server, dir.path());
    config.filter = EntryFilter::Range(IndexRange { start: 10, end: 20 });
    let fetcher = Arc::new(FakeFetcher::default());
    let summary = pipeline(config, Arc::new(NoOpStore), fetcher.clone(), None)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.selected, 11);
    assert_eq!(summary.done, 11);
    assert!(dir.path().join("Show/ep10.mkv").exists());
    assert!(dir.path().join("Show/ep20.mkv").exists());
    assert!(!dir.path().join("Show/ep09.mkv").exists());
    assert!(!dir.path().join("Show/ep21.mkv").exists());
}

#[tokio::test]
async fn empty_listing_is_nothing_to_do() {
    let server = index_with(&[]).await;
    let dir = TempDir::new().unwrap();
    let summary = pipeline(
        run_config(&server, dir.path()),
        Arc::new(NoOpStore),
        Arc::new(FakeFetcher::default()),
        None,
    )
    .run()
    .await
    .unwrap();
    assert_eq!(summary.batches, 0);
    assert_eq!(summary.exit_code(), exit::SUCCESS);
}

#[tokio::test]
async fn listing_failure_aborts_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();

    let err = pipeline(
        run_config(&server, dir.path()),
        Arc::new(NoOpStore),
        Arc::new(FakeFetcher::default()),
        None,
    )
    .run()
    .await
    .unwrap_err();
    assert_eq!(err.exit_code(), exit::LISTING_FAILED);
}

#[tokio::test]
async fn upload_targets_group_and_folder() {
    let server = index_with(&["ep01.mkv", "ep02.mkv"]).await;
    let dir = TempDir::new().unwrap();
    let mut config = run_config(&server, dir.path());
    config.upload = Some(upload_config(false));
    let sync = FakeSync::new(false);

    let summary = pipeline(config, Arc::new(NoOpStore), Arc::new(FakeFetcher::default()), Some(sync.clone()))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.done, 2);
    assert_eq!(
        *sync.calls.lock().unwrap(),
        vec![(dir.path().join("Show"), "gdrive:anime/Show".to_string())]
    );
}

#[tokio::test]
async fn failures_block_the_upload_unless_best_effort() {
    let server = index_with(&["ep01.mkv", "ep02.mkv", "ep03.mkv"]).await;
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(FakeFetcher {
        fail: vec!["ep02.mkv".into()],
        ..Default::default()
    });

    let mut config = run_config(&server, dir.path());
    config.upload = Some(upload_config(false));
    let sync = FakeSync::new(false);
    let summary = pipeline(config, Arc::new(NoOpStore), fetcher.clone(), Some(sync.clone()))
        .run()
        .await
        .unwrap();

    assert!(sync.calls.lock().unwrap().is_empty());
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.not_uploaded, 2);
    assert_eq!(summary.exit_code(), exit::PARTIAL_FAILURE);

    let mut config = run_config(&server, dir.path());
    config.upload = Some(upload_config(true));
    let sync = FakeSync::new(false);
    let summary = pipeline(config, Arc::new(NoOpStore), fetcher, Some(sync.clone()))
        .run()
        .await
        .unwrap();

    assert_eq!(sync.calls.lock().unwrap().len(), 1);
    assert_eq!(summary.done, 2);
    assert_eq!(summary.exit_code(), exit::PARTIAL_FAILURE);
}

#[tokio::test]
async fn failed_upload_keeps_files_and_records_nothing() {
    let server = index_with(&["ep01.mkv"]).await;
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn BookkeepingStore> =
        Arc::new(SqliteStore::open(&dir.path().join("state.db")).await.unwrap());

    let mut config = run_config(&server, dir.path());
    config.upload = Some(UploadConfig {
        remove_uploaded: true,
        ..upload_config(false)
    });
    let summary = pipeline(
        config,
        store.clone(),
        Arc::new(FakeFetcher::default()),
        Some(FakeSync::new(true)),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.exit_code(), exit::UPLOAD_FAILED);
    assert_eq!(summary.failures[0].failure.stage, Stage::Upload);
    assert!(dir.path().join("Show/ep01.mkv").exists());
    assert!(!store.has_completed("Show/ep01.mkv").await.unwrap());
}

#[tokio::test]
async fn best_effort_cleanup_keeps_failed_archives_and_foreign_files() {
    let server = index_with(&["ok.mkv", "bad.zip"]).await;
    let dir = TempDir::new().unwrap();
    let staged = dir.path().join("Show");
    std::fs::create_dir_all(&staged).unwrap();
    std::fs::write(staged.join("notes.txt"), b"not from the index").unwrap();

    let mut config = run_config(&server, dir.path());
    config.extraction.delete_after = true;
    config.upload = Some(UploadConfig {
        remove_uploaded: true,
        ..upload_config(true)
    });
    let sync = FakeSync::new(false);
    // The fake body of bad.zip is its own name, which is no zip at all
    let summary = pipeline(
        config,
        Arc::new(NoOpStore),
        Arc::new(FakeFetcher::default()),
        Some(sync.clone()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(sync.calls.lock().unwrap().len(), 1);
    assert_eq!(summary.done, 1);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.failures[0].failure.stage, Stage::Extract);
    assert_eq!(summary.exit_code(), exit::PARTIAL_FAILURE);

    assert!(!staged.join("ok.mkv").exists(), "uploaded file is removed");
    assert!(staged.join("bad.zip").exists(), "failed archive is kept for a rerun");
    assert!(staged.join("notes.txt").exists(), "unrelated files are kept");
}

#[tokio::test]
async fn cancelled_run_is_interrupted() {
    let server = index_with(&["ep01.mkv"]).await;
    let dir = TempDir::new().unwrap();
    let (tx, _rx) = broadcast::channel(16);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let fetcher = Arc::new(FakeFetcher::default());
    let summary = Pipeline::with_sync_tool(
        run_config(&server, dir.path()),
        Arc::new(NoOpStore),
        tx,
        cancel,
        None,
    )
    .unwrap()
    .with_fetcher(fetcher.clone())
    .run()
    .await
    .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.exit_code(), exit::INTERRUPTED);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}
