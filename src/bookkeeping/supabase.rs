//! Hosted bookkeeping over Supabase's PostgREST interface
//!
//! Tables:
//! - `transfers (key, name, size, md5, destination, completed_at)`
//! - `rar_files (filename, hash, password)`

use crate::error::{Error, Result, StoreError};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::{BookkeepingStore, CompletionRecord};

const BODY_LIMIT: usize = 512;

/// Bookkeeping through a Supabase project
#[derive(Clone, Debug)]
pub struct SupabaseStore {
    client: reqwest::Client,
    rest_base: Url,
}

#[derive(Serialize)]
struct TransferRow<'a> {
    key: &'a str,
    name: &'a str,
    size: Option<u64>,
    md5: Option<&'a str>,
    destination: Option<&'a str>,
    completed_at: String,
}

#[derive(Serialize)]
struct PasswordRow<'a> {
    filename: &'a str,
    hash: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct PasswordOnly {
    password: String,
}

fn connection_failed(e: impl std::fmt::Display) -> Error {
    Error::Store(StoreError::ConnectionFailed(e.to_string()))
}

impl SupabaseStore {
    /// Create a client for the project at `url` authenticated with `key`
    pub fn new(url: &str, key: &str) -> Result<Self> {
        let mut base = Url::parse(url).map_err(|e| {
            Error::config(
                format!("invalid Supabase URL '{}': {}", url, e),
                "SUPABASE_URL",
            )
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let rest_base = base.join("rest/v1/").map_err(connection_failed)?;

        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(key).map_err(connection_failed)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(connection_failed)?;
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(connection_failed)?;

        Ok(Self { client, rest_base })
    }

    fn table(&self, name: &str) -> Result<Url> {
        self.rest_base.join(name).map_err(connection_failed)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > BODY_LIMIT {
            let mut cut = BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(Error::Store(StoreError::Http {
            status: status.as_u16(),
            body,
        }))
    }

    async fn upsert<T: Serialize + Sync>(&self, table: &str, conflict: &str, row: &T) -> Result<()> {
        let url = self.table(table)?;
        let response = self
            .client
            .post(url)
            .query(&[("on_conflict", conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl BookkeepingStore for SupabaseStore {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn has_completed(&self, key: &str) -> Result<bool> {
        let url = self.table("transfers")?;
        let filter = format!("eq.{}", key);
        let response = self
            .client
            .get(url)
            .query(&[("select", "key"), ("key", filter.as_str()), ("limit", "1")])
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = Self::check(response).await?.json().await?;
        Ok(!rows.is_empty())
    }

    async fn mark_completed(&self, key: &str, record: &CompletionRecord) -> Result<()> {
        let row = TransferRow {
            key,
            name: &record.name,
            size: record.size,
            md5: record.md5.as_deref(),
            destination: record.destination.as_deref(),
            completed_at: chrono::Utc::now().to_rfc3339(),
        };
        self.upsert("transfers", "key", &row).await
    }

    async fn cached_password(&self, md5: &str) -> Result<Option<String>> {
        let url = self.table("rar_files")?;
        let filter = format!("eq.{}", md5);
        let response = self
            .client
            .get(url)
            .query(&[("select", "password"), ("hash", filter.as_str()), ("limit", "1")])
            .send()
            .await?;
        let rows: Vec<PasswordOnly> = Self::check(response).await?.json().await?;
        Ok(rows.into_iter().next().map(|r| r.password))
    }

    async fn save_password(&self, filename: &str, md5: &str, password: &str) -> Result<()> {
        let row = PasswordRow {
            filename,
            hash: md5,
            password,
        };
        self.upsert("rar_files", "hash", &row).await
    }
}
