//! Remote wiki access: the client trait the sync engine drives and its
//! Confluence REST implementation.

use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::MirrorConfig;
use crate::error::RemoteError;

const PAGE_LIMIT: usize = 100;
const PAGE_EXPAND: &str = "body.storage,version,ancestors";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePage {
    pub id: String,
    pub title: String,
    pub raw_markup: String,
    pub version: u64,
    pub parent_id: Option<String>,
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemotePageRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteVersion {
    pub version: u64,
    pub raw_markup: String,
    pub author: String,
    pub author_email: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

pub trait RemoteWikiClient {
    fn get_page(&mut self, id: &str) -> Result<RemotePage, RemoteError>;
    /// Direct children in position order.
    fn get_all_children(&mut self, id: &str) -> Result<Vec<RemotePageRef>, RemoteError>;
    /// Every stored version, oldest first.
    fn get_version_history(&mut self, id: &str) -> Result<Vec<RemoteVersion>, RemoteError>;
    fn create_page(
        &mut self,
        parent_id: &str,
        title: &str,
        markup: &str,
    ) -> Result<String, RemoteError>;
    /// Returns the new version number.
    fn update_page(
        &mut self,
        id: &str,
        title: &str,
        markup: &str,
        comment: Option<&str>,
    ) -> Result<u64, RemoteError>;
    fn delete_page(&mut self, id: &str) -> Result<(), RemoteError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub space_key: Option<String>,
    pub user_agent: String,
    pub username: Option<String>,
    pub api_token: Option<String>,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl ConfluenceClientConfig {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            base_url: config.base_url().unwrap_or_default(),
            space_key: config.space_key(),
            user_agent: config.user_agent(),
            username: env_secret("WIKI_USER"),
            api_token: env_secret("WIKI_API_TOKEN"),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("WIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self, RemoteError> {
        if config.base_url.trim().is_empty() {
            return Err(RemoteError::Transport(
                "wiki base URL is not configured; set WIKI_BASE_URL or [wiki].base_url"
                    .to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|error| {
                RemoteError::Transport(format!("failed to build HTTP client: {error}"))
            })?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn content_url(&self, suffix: &str) -> String {
        format!(
            "{}/rest/api/content{suffix}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request_json(
        &mut self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        subject: &str,
    ) -> Result<Value, RemoteError> {
        let is_write = method != Method::GET;
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let mut request = self
                .client
                .request(method.clone(), url)
                .header("User-Agent", self.config.user_agent.clone())
                .header("Accept", "application/json")
                .query(query);
            if let Some(username) = &self.config.username {
                request = request.basic_auth(username, self.config.api_token.as_deref());
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            debug!(method = %method, url, attempt, "wiki request");

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        let retry_after_ms = retry_after_ms(response.headers());
                        let message = response.text().unwrap_or_default();
                        return Err(status_error(status, subject, retry_after_ms, &message));
                    }

                    let text = response
                        .text()
                        .map_err(|error| RemoteError::Decode(error.to_string()))?;
                    if text.trim().is_empty() {
                        return Ok(Value::Null);
                    }
                    return serde_json::from_str(&text)
                        .map_err(|error| RemoteError::Decode(error.to_string()));
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(RemoteError::Transport(error.to_string()));
                }
            }
        }

        Err(RemoteError::Transport(
            "wiki API request exhausted retry budget".to_string(),
        ))
    }

    fn get_json(
        &mut self,
        url: &str,
        query: &[(&str, String)],
        subject: &str,
    ) -> Result<Value, RemoteError> {
        self.request_json(Method::GET, url, query, None, subject)
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        let delay = base.saturating_mul(multiplier).saturating_add(jitter);
        warn!(attempt, delay_ms = delay, "retrying wiki request");
        sleep(Duration::from_millis(delay));
    }

    fn fetch_content(&mut self, id: &str, expand: &str) -> Result<ContentPayload, RemoteError> {
        let url = self.content_url(&format!("/{id}"));
        let value = self.get_json(&url, &[("expand", expand.to_string())], id)?;
        decode(value)
    }

    fn fetch_version_body(&mut self, id: &str, version: u64) -> Result<String, RemoteError> {
        let url = self.content_url(&format!("/{id}"));
        let value = self.get_json(
            &url,
            &[
                ("status", "historical".to_string()),
                ("version", version.to_string()),
                ("expand", "body.storage".to_string()),
            ],
            id,
        )?;
        let content: ContentPayload = decode(value)?;
        Ok(content.storage_value())
    }

    fn resolve_space_key(&mut self, parent_id: &str) -> Result<String, RemoteError> {
        if let Some(key) = &self.config.space_key {
            return Ok(key.clone());
        }
        let parent = self.fetch_content(parent_id, "space")?;
        parent.space.map(|space| space.key).ok_or_else(|| {
            RemoteError::Decode(format!("page {parent_id} has no space; set WIKI_SPACE_KEY"))
        })
    }
}

impl RemoteWikiClient for ConfluenceClient {
    fn get_page(&mut self, id: &str) -> Result<RemotePage, RemoteError> {
        let content = self.fetch_content(id, PAGE_EXPAND)?;
        content.into_page()
    }

    fn get_all_children(&mut self, id: &str) -> Result<Vec<RemotePageRef>, RemoteError> {
        let url = self.content_url(&format!("/{id}/child/page"));
        let mut out = Vec::new();
        let mut start = 0usize;
        loop {
            let value = self.get_json(
                &url,
                &[
                    ("start", start.to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                ],
                id,
            )?;
            let listing: ListingPayload<RefPayload> = decode(value)?;
            let received = listing.results.len();
            out.extend(listing.results.into_iter().map(|item| RemotePageRef {
                id: item.id,
                title: item.title,
            }));
            if received == 0 || listing.links.next.is_none() {
                break;
            }
            start += received;
        }
        Ok(out)
    }

    fn get_version_history(&mut self, id: &str) -> Result<Vec<RemoteVersion>, RemoteError> {
        let url = self.content_url(&format!("/{id}/version"));
        let mut versions = Vec::new();
        let mut start = 0usize;
        loop {
            let value = self.get_json(
                &url,
                &[
                    ("start", start.to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                ],
                id,
            )?;
            let listing: ListingPayload<VersionPayload> = decode(value)?;
            let received = listing.results.len();
            versions.extend(listing.results);
            if received == 0 || listing.links.next.is_none() {
                break;
            }
            start += received;
        }
        versions.sort_by_key(|version| version.number);

        let mut out = Vec::with_capacity(versions.len());
        for version in versions {
            let raw_markup = self.fetch_version_body(id, version.number)?;
            let timestamp = version
                .when
                .as_deref()
                .and_then(parse_timestamp)
                .ok_or_else(|| {
                    RemoteError::Decode(format!(
                        "version {} of page {id} has no timestamp",
                        version.number
                    ))
                })?;
            let (author, author_email) = match version.by {
                Some(user) => (user.display_label(), user.email.filter(|e| !e.is_empty())),
                None => ("Unknown".to_string(), None),
            };
            out.push(RemoteVersion {
                version: version.number,
                raw_markup,
                author,
                author_email,
                timestamp,
                message: version.message.filter(|message| !message.trim().is_empty()),
            });
        }
        Ok(out)
    }

    fn create_page(
        &mut self,
        parent_id: &str,
        title: &str,
        markup: &str,
    ) -> Result<String, RemoteError> {
        let space_key = self.resolve_space_key(parent_id)?;
        let url = self.content_url("");
        let body = create_payload(&space_key, parent_id, title, markup);
        let value = self.request_json(Method::POST, &url, &[], Some(&body), title)?;
        let created: RefPayload = decode(value)?;
        Ok(created.id)
    }

    fn update_page(
        &mut self,
        id: &str,
        title: &str,
        markup: &str,
        comment: Option<&str>,
    ) -> Result<u64, RemoteError> {
        let current = self.fetch_content(id, "version")?;
        let next_version = current.version.map(|version| version.number).unwrap_or(0) + 1;
        let url = self.content_url(&format!("/{id}"));
        let body = update_payload(id, title, markup, next_version, comment);
        let value = self.request_json(Method::PUT, &url, &[], Some(&body), id)?;
        let updated: ContentPayload = decode(value)?;
        Ok(updated
            .version
            .map(|version| version.number)
            .unwrap_or(next_version))
    }

    fn delete_page(&mut self, id: &str) -> Result<(), RemoteError> {
        let url = self.content_url(&format!("/{id}"));
        self.request_json(Method::DELETE, &url, &[], None, id)?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn create_payload(space_key: &str, parent_id: &str, title: &str, markup: &str) -> Value {
    json!({
        "type": "page",
        "title": title,
        "space": { "key": space_key },
        "ancestors": [{ "id": parent_id }],
        "body": { "storage": { "value": markup, "representation": "storage" } },
    })
}

fn update_payload(
    id: &str,
    title: &str,
    markup: &str,
    version: u64,
    comment: Option<&str>,
) -> Value {
    let mut version_body = json!({ "number": version });
    if let Some(comment) = comment {
        version_body["message"] = Value::String(comment.to_string());
    }
    json!({
        "id": id,
        "type": "page",
        "title": title,
        "version": version_body,
        "body": { "storage": { "value": markup, "representation": "storage" } },
    })
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, RemoteError> {
    serde_json::from_value(value).map_err(|error| RemoteError::Decode(error.to_string()))
}

fn status_error(
    status: StatusCode,
    subject: &str,
    retry_after_ms: Option<u64>,
    body: &str,
) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(subject.to_string()),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited { retry_after_ms },
        _ => RemoteError::Api {
            status: status.as_u16(),
            message: api_message(body),
        },
    }
}

/// Error text from a JSON error body, or the raw body trimmed.
fn api_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(message) = value.get("message").and_then(Value::as_str)
    {
        return message.to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|seconds| seconds.saturating_mul(1_000))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

fn env_secret(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize)]
struct ContentPayload {
    id: String,
    #[serde(default)]
    title: String,
    version: Option<VersionPayload>,
    body: Option<BodyPayload>,
    #[serde(default)]
    ancestors: Vec<RefPayload>,
    space: Option<SpacePayload>,
}

impl ContentPayload {
    fn storage_value(&self) -> String {
        self.body
            .as_ref()
            .and_then(|body| body.storage.as_ref())
            .map(|storage| storage.value.clone())
            .unwrap_or_default()
    }

    fn into_page(self) -> Result<RemotePage, RemoteError> {
        let raw_markup = self.storage_value();
        let version = self.version.ok_or_else(|| {
            RemoteError::Decode(format!("page {} response has no version", self.id))
        })?;
        Ok(RemotePage {
            parent_id: self.ancestors.last().map(|ancestor| ancestor.id.clone()),
            updated: version.when.as_deref().and_then(parse_timestamp),
            version: version.number,
            id: self.id,
            title: self.title,
            raw_markup,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RefPayload {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct SpacePayload {
    key: String,
}

#[derive(Debug, Deserialize)]
struct BodyPayload {
    storage: Option<StoragePayload>,
}

#[derive(Debug, Deserialize)]
struct StoragePayload {
    value: String,
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    number: u64,
    when: Option<String>,
    message: Option<String>,
    by: Option<UserPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPayload {
    display_name: Option<String>,
    public_name: Option<String>,
    username: Option<String>,
    email: Option<String>,
}

impl UserPayload {
    fn display_label(&self) -> String {
        [&self.display_name, &self.public_name, &self.username]
            .into_iter()
            .flatten()
            .map(|name| name.trim())
            .find(|name| !name.is_empty())
            .unwrap_or("Unknown")
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ListingPayload<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(rename = "_links", default)]
    links: LinksPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LinksPayload {
    next: Option<String>,
}
