//! HTTP remote store.
//!
//! This module maps the [`RemoteStore`] operations onto a JSON record API.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, ureq, a scripted client in tests, etc.).

use crate::clock::Clock;
use crate::config::{RemoteConfig, MAX_PAGE_SIZE};
use crate::error::{EngineResult, SyncError};
use crate::remote::RemoteStore;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shelfsync_model::{EntityKind, Fields, RemoteSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP method used by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PATCH
    Patch,
}

impl HttpMethod {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// A request handed to the [`HttpClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL without query string.
    pub url: String,
    /// Query parameters, unencoded.
    pub query: Vec<(String, String)>,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
}

/// A response returned by the [`HttpClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Raw `Retry-After` header, if present.
    pub retry_after: Option<String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with a body and no `Retry-After`.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual transport. Return `Err` only
/// when no response was received (connection refused, timeout, TLS failure);
/// every received response, whatever its status, is `Ok`.
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, String>;
}

#[derive(Deserialize)]
struct WireRecord {
    id: String,
    #[serde(default)]
    fields: Fields,
    last_edited_time: DateTime<Utc>,
    #[serde(default)]
    archived: bool,
}

impl WireRecord {
    fn into_snapshot(self, kind: EntityKind) -> RemoteSnapshot {
        RemoteSnapshot {
            kind,
            remote_id: self.id,
            fields: self.fields,
            remote_modified_at: self.last_edited_time,
            archived: self.archived,
        }
    }
}

#[derive(Deserialize)]
struct WirePage {
    #[serde(default)]
    results: Vec<WireRecord>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Serialize)]
struct WireFields<'a> {
    fields: &'a Fields,
}

/// Remote store speaking the JSON record API over an [`HttpClient`].
///
/// Requests are paced to at most one per `min_request_interval`.
pub struct HttpRemoteStore<C: HttpClient> {
    config: RemoteConfig,
    client: C,
    clock: Arc<dyn Clock>,
    page_size: u32,
    last_request: Mutex<Option<DateTime<Utc>>>,
}

impl<C: HttpClient> HttpRemoteStore<C> {
    /// Creates an HTTP remote store.
    pub fn new(config: RemoteConfig, client: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            client,
            clock,
            page_size: MAX_PAGE_SIZE,
            last_request: Mutex::new(None),
        }
    }

    /// Sets the page size used by queries.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Returns the remote configuration.
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn records_url(&self, kind: EntityKind) -> EngineResult<String> {
        let collection = self
            .config
            .collection(kind)
            .ok_or_else(|| SyncError::Config(format!("no remote collection configured for {kind}")))?;
        Ok(format!(
            "{}/collections/{}/records",
            self.config.endpoint.trim_end_matches('/'),
            collection
        ))
    }

    fn pace(&self) {
        let mut last = self.last_request.lock();
        if let Some(previous) = *last {
            let elapsed = (self.clock.now() - previous).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.config.min_request_interval {
                self.clock.sleep(self.config.min_request_interval - elapsed);
            }
        }
        *last = Some(self.clock.now());
    }

    fn send(
        &self,
        method: HttpMethod,
        url: String,
        query: Vec<(String, String)>,
        body: Option<&Fields>,
    ) -> EngineResult<Vec<u8>> {
        let body = body
            .map(|fields| serde_json::to_vec(&WireFields { fields }))
            .transpose()
            .map_err(|e| SyncError::Codec(e.to_string()))?;

        let request = HttpRequest {
            method,
            url,
            query,
            headers: vec![
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", self.config.api_token),
                ),
                ("Accept".to_string(), "application/json".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body,
        };

        self.pace();
        debug!(method = method.as_str(), url = %request.url, "remote request");
        let response = self.client.send(&request).map_err(|e| {
            warn!(url = %request.url, error = %e, "transport failure");
            SyncError::TransientRemote(e)
        })?;

        check_status(&response)?;
        Ok(response.body)
    }
}

impl<C: HttpClient> RemoteStore for HttpRemoteStore<C> {
    fn query_changed_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<RemoteSnapshot>> {
        let url = self.records_url(kind)?;
        let mut snapshots = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("page_size".to_string(), self.page_size.to_string())];
            if let Some(since) = since {
                query.push((
                    "changed_since".to_string(),
                    since.to_rfc3339_opts(SecondsFormat::Millis, true),
                ));
            }
            if let Some(cursor) = &cursor {
                query.push(("start_cursor".to_string(), cursor.clone()));
            }

            let page: WirePage = decode(&self.send(HttpMethod::Get, url.clone(), query, None)?)?;
            snapshots.extend(page.results.into_iter().map(|r| r.into_snapshot(kind)));

            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        // Servers filter at their own timestamp granularity.
        if let Some(since) = since {
            snapshots.retain(|s| s.remote_modified_at > since);
        }
        snapshots.sort_by(|a, b| a.remote_modified_at.cmp(&b.remote_modified_at));
        debug!(%kind, count = snapshots.len(), "queried remote changes");
        Ok(snapshots)
    }

    fn get(&self, kind: EntityKind, remote_id: &str) -> EngineResult<Option<RemoteSnapshot>> {
        let url = format!("{}/{}", self.records_url(kind)?, remote_id);
        match self.send(HttpMethod::Get, url, Vec::new(), None) {
            Ok(body) => Ok(Some(decode::<WireRecord>(&body)?.into_snapshot(kind))),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create(&self, kind: EntityKind, fields: &Fields) -> EngineResult<String> {
        let url = self.records_url(kind)?;
        let body = self.send(HttpMethod::Post, url, Vec::new(), Some(fields))?;
        Ok(decode::<WireRecord>(&body)?.id)
    }

    fn update(&self, kind: EntityKind, remote_id: &str, fields: &Fields) -> EngineResult<()> {
        let url = format!("{}/{}", self.records_url(kind)?, remote_id);
        self.send(HttpMethod::Patch, url, Vec::new(), Some(fields))?;
        Ok(())
    }

    fn archive(&self, kind: EntityKind, remote_id: &str) -> EngineResult<()> {
        let url = format!("{}/{}/archive", self.records_url(kind)?, remote_id);
        self.send(HttpMethod::Post, url, Vec::new(), None)?;
        Ok(())
    }
}

fn check_status(response: &HttpResponse) -> EngineResult<()> {
    let status = response.status;
    if (200..300).contains(&status) {
        return Ok(());
    }

    let message = summarize(&response.body);
    match status {
        429 => {
            let retry_after = parse_retry_after(response.retry_after.as_deref());
            warn!(?retry_after, "remote rate limit hit");
            Err(SyncError::RateLimited { retry_after })
        }
        404 => Err(SyncError::NotFound(message)),
        408 | 500..=599 => Err(SyncError::TransientRemote(format!("HTTP {status}: {message}"))),
        _ => Err(SyncError::FatalRemote(format!("HTTP {status}: {message}"))),
    }
}

fn parse_retry_after(header: Option<&str>) -> Duration {
    header
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(Duration::from_secs(1))
}

fn summarize(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(200) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> EngineResult<T> {
    serde_json::from_slice(body).map_err(|e| SyncError::Codec(e.to_string()))
}
