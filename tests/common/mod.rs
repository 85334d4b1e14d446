//! Shared fixtures for the end-to-end tests: a mock donwa/goindex folder
//! that serves both the listing and the file bodies

#![allow(dead_code)]

use index_mirror::config::SiteType;
use index_mirror::RunConfig;
use serde_json::json;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Folder the mock index serves
pub const FOLDER: &str = "Show";

/// One file on the mock index
pub struct RemoteFile {
    pub name: String,
    pub body: Vec<u8>,
}

impl RemoteFile {
    pub fn new(name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// Start a mock index listing `files`; each body must be fetched exactly
/// `expected_fetches` times when given
pub async fn mock_index(files: &[RemoteFile], expected_fetches: Option<u64>) -> MockServer {
    let server = MockServer::start().await;

    let listing: Vec<serde_json::Value> = files
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "mimeType": "application/octet-stream",
                "size": f.body.len().to_string(),
            })
        })
        .collect();
    Mock::given(method("POST"))
        .and(path(format!("/{}/", FOLDER)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": listing })))
        .mount(&server)
        .await;

    for file in files {
        let mock = Mock::given(method("GET"))
            .and(path(format!("/{}/{}", FOLDER, file.name)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(file.body.clone()));
        let mock = match expected_fetches {
            Some(n) => mock.expect(n),
            None => mock,
        };
        mock.mount(&server).await;
    }

    server
}

/// Configuration pointing at the mock folder, staging under `base`
pub fn config_for(server: &MockServer, base: &Path) -> RunConfig {
    let url = Url::parse(&format!("{}/{}/", server.uri(), FOLDER)).unwrap();
    let mut config = RunConfig::new(url, SiteType::DonwaGoIndex);
    config.base_folder = base.to_path_buf();
    config.simultaneous = 3;
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_attempts = 1;
    config.retry.jitter = false;
    config
}

/// A stored (uncompressed) zip holding `entries`
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Number of GET requests the server saw
pub async fn body_fetches(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .count()
}
