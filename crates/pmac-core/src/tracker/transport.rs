//! JSON-over-HTTP transport beneath the adapters.
//!
//! Adapters speak in logical operations and hand [`Request`]s to a
//! [`Transport`]. [`HttpTransport`] is the reqwest implementation; tests
//! substitute a scripted one. Status codes are mapped onto the shared
//! [`TrackerError`] taxonomy by [`classify`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde_json::Value;

use super::error::TrackerError;
use super::types::TrackerKind;

/// Wait assumed when a tracker rate-limits without saying for how long.
const DEFAULT_RATE_LIMIT_WAIT_SECS: i64 = 60;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

/// One call against a tracker API, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Put,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Patch,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

/// A failed call, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportError {
    /// HTTP status, if a response arrived.
    pub status: Option<u16>,
    pub message: String,
    /// When the tracker says its rate limit resets.
    pub reset_at: Option<DateTime<Utc>>,
    pub timed_out: bool,
}

impl TransportError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Sends a request and returns the decoded JSON body (`Null` when empty).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Value, TransportError>;
}

// Compile-time assertion: Transport must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Transport) {}
};

/// Map a transport failure onto the tracker error taxonomy.
pub fn classify(
    tracker: TrackerKind,
    path: &str,
    err: TransportError,
    now: DateTime<Utc>,
) -> TrackerError {
    let Some(status) = err.status.filter(|_| !err.timed_out) else {
        return TrackerError::Api {
            tracker,
            status: None,
            message: err.message,
            transient: true,
        };
    };
    match status {
        401 | 403 => TrackerError::Auth {
            tracker,
            message: err.message,
        },
        429 => TrackerError::RateLimited {
            tracker,
            resume_at: err
                .reset_at
                .unwrap_or(now + TimeDelta::seconds(DEFAULT_RATE_LIMIT_WAIT_SECS)),
        },
        404 => TrackerError::not_found(tracker, path),
        408 | 500..=599 => TrackerError::Api {
            tracker,
            status: Some(status),
            message: err.message,
            transient: true,
        },
        _ => TrackerError::Api {
            tracker,
            status: Some(status),
            message: err.message,
            transient: false,
        },
    }
}

/// Send through `transport` and classify any failure.
pub async fn call(
    transport: &dyn Transport,
    tracker: TrackerKind,
    request: Request,
) -> Result<Value, TrackerError> {
    let path = request.path.clone();
    tracing::debug!(tracker = %tracker, method = ?request.method, path = %path, "tracker request");
    transport
        .send(request)
        .await
        .map_err(|err| classify(tracker, &path, err, Utc::now()))
}

/// Bound a tracker operation by `limit`; expiry is a transient failure.
pub async fn with_deadline<T, F>(
    tracker: TrackerKind,
    limit: Duration,
    fut: F,
) -> Result<T, TrackerError>
where
    F: Future<Output = Result<T, TrackerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TrackerError::transient(
            tracker,
            format!("call timed out after {}s", limit.as_secs_f64()),
        )),
    }
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// Credentials attached to every request.
#[derive(Clone)]
pub enum Credentials {
    /// GitHub personal access token.
    Bearer(String),
    /// Jira Cloud account email and API token.
    Basic { user: String, token: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(***)"),
            Credentials::Basic { user, .. } => write!(f, "Basic({user}, ***)"),
        }
    }
}

/// reqwest-backed [`Transport`] with a per-call timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pmac/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method.into(), &url)
            .query(&request.query);
        builder = match &self.credentials {
            Credentials::Bearer(token) => builder.bearer_auth(token),
            Credentials::Basic { user, token } => builder.basic_auth(user, Some(token)),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if status.is_success() {
            let text = resp.text().await.map_err(from_reqwest)?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| {
                TransportError::status(status.as_u16(), format!("invalid JSON response: {e}"))
            });
        }

        let headers = resp.headers().clone();
        let mut code = status.as_u16();
        let mut body = resp.text().await.unwrap_or_default();
        if is_rate_limited(code, &headers, &body) {
            code = 429;
        }
        body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
        Err(TransportError {
            status: Some(code),
            message: body,
            reset_at: rate_limit_reset(&headers, Utc::now()),
            timed_out: false,
        })
    }
}

fn from_reqwest(err: reqwest::Error) -> TransportError {
    TransportError {
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
        reset_at: None,
        timed_out: err.is_timeout(),
    }
}

/// GitHub answers both rate limits with 403: the primary one with
/// `x-ratelimit-remaining: 0`, the secondary one with `Retry-After` or a
/// "secondary rate limit" message while quota remains.
fn is_rate_limited(code: u16, headers: &HeaderMap, body: &str) -> bool {
    match code {
        429 => true,
        403 => {
            limit_exhausted(headers)
                || headers.contains_key("retry-after")
                || body.to_ascii_lowercase().contains("secondary rate limit")
        }
        _ => false,
    }
}

fn limit_exhausted(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0")
}

/// Reset time from `Retry-After` (delay seconds) or `x-ratelimit-reset`
/// (epoch seconds). `Retry-After` wins: a secondary limit still carries the
/// primary window's reset.
fn rate_limit_reset(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let header_secs = |name: &'static str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    if let Some(secs) = header_secs("retry-after") {
        return Some(now + TimeDelta::seconds(secs));
    }
    header_secs("x-ratelimit-reset").and_then(|epoch| DateTime::from_timestamp(epoch, 0))
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}
