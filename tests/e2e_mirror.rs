//! End-to-end runs against a mock GoIndex folder
//!
//! Listing, download (through the real HTTP fetcher), extraction and
//! bookkeeping run exactly as in the binary; only the remote is mocked.

mod common;

use common::{FOLDER, RemoteFile, body_fetches, config_for, mock_index, zip_bytes};
use index_mirror::config::{EntryFilter, IndexRange};
use index_mirror::{
    BookkeepingStore, Event, NoOpStore, Pipeline, RunConfig, RunSummary, SqliteStore, Stage, exit,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

async fn run(config: RunConfig, store: Arc<dyn BookkeepingStore>) -> (RunSummary, Vec<Event>) {
    let (events, mut rx) = broadcast::channel(4096);
    let summary = Pipeline::new(config, store, events, CancellationToken::new())
        .unwrap()
        .run()
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    (summary, seen)
}

#[tokio::test]
async fn mirrors_plain_files_and_extracts_archives() {
    let files = vec![
        RemoteFile::new("notes.txt", b"plain body".to_vec()),
        RemoteFile::new(
            "pack.zip",
            zip_bytes(&[("pack/ep01.mkv", b"one"), ("pack/ep02.mkv", b"two")]),
        ),
    ];
    let server = mock_index(&files, Some(1)).await;
    let dir = TempDir::new().unwrap();

    let (summary, events) = run(config_for(&server, dir.path()), Arc::new(NoOpStore)).await;

    assert_eq!(summary.listed, 2);
    assert_eq!(summary.done, 2);
    assert_eq!(summary.exit_code(), exit::SUCCESS);

    let staged = dir.path().join(FOLDER);
    assert_eq!(std::fs::read(staged.join("notes.txt")).unwrap(), b"plain body");
    assert_eq!(std::fs::read(staged.join("pack/ep01.mkv")).unwrap(), b"one");
    assert_eq!(std::fs::read(staged.join("pack/ep02.mkv")).unwrap(), b"two");
    assert!(staged.join("pack.zip").exists(), "archives are kept by default");

    let done = events
        .iter()
        .filter(|e| matches!(e, Event::JobDone { .. }))
        .count();
    assert_eq!(done, 2);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::ExtractComplete { files: 2, .. }))
    );
}

#[tokio::test]
async fn second_run_fetches_nothing() {
    let files: Vec<RemoteFile> = (1..=4)
        .map(|i| RemoteFile::new(format!("ep{:02}.mkv", i), vec![b'x'; 64 * i]))
        .collect();
    // Every body is requested once across both runs
    let server = mock_index(&files, Some(1)).await;
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state").join("mirror.db");

    let store: Arc<dyn BookkeepingStore> = Arc::new(SqliteStore::open(&db).await.unwrap());
    let (first, _) = run(config_for(&server, dir.path()), store).await;
    assert_eq!(first.done, 4);
    assert_eq!(first.bytes_transferred, 64 * (1 + 2 + 3 + 4));

    let store: Arc<dyn BookkeepingStore> = Arc::new(SqliteStore::open(&db).await.unwrap());
    let (second, events) = run(config_for(&server, dir.path()), store).await;
    assert_eq!(second.skipped, 4);
    assert_eq!(second.done, 0);
    assert_eq!(second.exit_code(), exit::SUCCESS);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::JobSkipped { .. }))
            .count(),
        4
    );
    assert_eq!(body_fetches(&server).await, 4);
}

#[tokio::test]
async fn range_filter_downloads_only_the_selected_positions() {
    let files: Vec<RemoteFile> = (1..=30)
        .map(|i| RemoteFile::new(format!("ep{:02}.mkv", i), format!("episode {}", i)))
        .collect();
    let server = mock_index(&files, None).await;
    let dir = TempDir::new().unwrap();

    let mut config = config_for(&server, dir.path());
    config.filter = EntryFilter::Range(IndexRange { start: 10, end: 20 });
    config.batch_limit = Some(4);
    let (summary, _) = run(config, Arc::new(NoOpStore)).await;

    assert_eq!(summary.listed, 30);
    assert_eq!(summary.selected, 11);
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.done, 11);
    assert_eq!(body_fetches(&server).await, 11);

    let staged = dir.path().join(FOLDER);
    for i in 1..=30 {
        let present = staged.join(format!("ep{:02}.mkv", i)).exists();
        assert_eq!(present, (10..=20).contains(&i), "position {}", i);
    }
}

#[tokio::test]
async fn one_corrupt_archive_does_not_stop_the_others() {
    let files: Vec<RemoteFile> = (1..=10)
        .map(|i| {
            let name = format!("vol{:02}.zip", i);
            let body = if i == 7 {
                b"PK\x03\x04 this is not really a zip".to_vec()
            } else {
                let inner = format!("file{:02}.bin", i);
                zip_bytes(&[(inner.as_str(), format!("content {}", i).as_bytes())])
            };
            RemoteFile::new(name, body)
        })
        .collect();
    let server = mock_index(&files, Some(1)).await;
    let dir = TempDir::new().unwrap();

    let mut config = config_for(&server, dir.path());
    config.extraction.delete_after = true;
    config.extraction.into_subdir = true;
    let (summary, _) = run(config, Arc::new(NoOpStore)).await;

    assert_eq!(summary.done, 9);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.exit_code(), exit::PARTIAL_FAILURE);

    let failure = &summary.failures[0];
    assert_eq!(failure.index, 7);
    assert_eq!(failure.path, format!("{}/vol07.zip", FOLDER));
    assert_eq!(failure.failure.stage, Stage::Extract);

    let staged = dir.path().join(FOLDER);
    assert!(
        staged.join("vol07.zip").exists(),
        "a failed archive is never deleted"
    );
    for i in (1..=10).filter(|&i| i != 7) {
        assert!(!staged.join(format!("vol{:02}.zip", i)).exists());
        let extracted = staged.join(format!("vol{:02}", i)).join(format!("file{:02}.bin", i));
        assert_eq!(
            std::fs::read_to_string(extracted).unwrap(),
            format!("content {}", i)
        );
    }
}
