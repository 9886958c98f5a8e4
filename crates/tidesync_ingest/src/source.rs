//! External data sources.
//!
//! A source returns a raw response body. Parsing and merging are the
//! pipeline's job, so a source only has to classify transport failures.

use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode, Url};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A remote API that external records are fetched from.
#[async_trait]
pub trait ExternalSource: Send + Sync {
    /// Fetches the current response body.
    ///
    /// `bearer` is the signed-in user's id token.
    async fn fetch(&self, bearer: Option<&str>) -> IngestResult<String>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl<S: ExternalSource + ?Sized> ExternalSource for Arc<S> {
    async fn fetch(&self, bearer: Option<&str>) -> IngestResult<String> {
        (**self).fetch(bearer).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// HTTP source backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: Url,
    method: Method,
    body: Option<String>,
    headers: Vec<(String, String)>,
    bearer_auth: bool,
}

impl HttpSource {
    /// Creates a GET source for `url`.
    pub fn new(url: &str) -> IngestResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| IngestError::network_fatal(format!("invalid url {url}: {e}")))?;
        let client = Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| IngestError::network_fatal(e.to_string()))?;
        Ok(Self {
            client,
            url,
            method: Method::GET,
            body: None,
            headers: Vec::new(),
            bearer_auth: false,
        })
    }

    /// Uses a preconfigured client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Sends a POST with the given body instead of a GET.
    pub fn post(mut self, body: impl Into<String>) -> Self {
        self.method = Method::POST;
        self.body = Some(body.into());
        self
    }

    /// Attaches the session's id token as a bearer token.
    pub fn with_bearer_auth(mut self, enabled: bool) -> Self {
        self.bearer_auth = enabled;
        self
    }

    /// Adds a header to every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl ExternalSource for HttpSource {
    async fn fetch(&self, bearer: Option<&str>) -> IngestResult<String> {
        let mut request = self.client.request(self.method.clone(), self.url.clone());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if self.bearer_auth {
            let token = bearer.ok_or(IngestError::NoSession)?;
            request = request.bearer_auth(token);
        }
        if let Some(body) = &self.body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| IngestError::network_retryable(e.to_string()))?;
        let status = response.status();
        debug!(url = %self.url, %status, "fetched");
        classify_status(status)?;

        response
            .text()
            .await
            .map_err(|e| IngestError::network_retryable(format!("reading body: {e}")))
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

fn classify_status(status: StatusCode) -> IngestResult<()> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("HTTP {status}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(IngestError::Unauthorized(message)),
        StatusCode::TOO_MANY_REQUESTS => Err(IngestError::network_retryable(message)),
        s if s.is_server_error() => Err(IngestError::network_retryable(message)),
        _ => Err(IngestError::network_fatal(message)),
    }
}

/// Scripted source for tests and demos.
///
/// Queued responses are returned in order; once they run out every fetch
/// returns the fallback body.
#[derive(Debug, Default)]
pub struct StaticSource {
    responses: Mutex<VecDeque<IngestResult<String>>>,
    fallback: Mutex<String>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
    last_bearer: Mutex<Option<String>>,
}

impl StaticSource {
    /// Creates a source that always returns `body`.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            fallback: Mutex::new(body.into()),
            ..Self::default()
        }
    }

    /// Queues a one-off response.
    pub fn push_response(&self, response: IngestResult<String>) {
        self.responses.lock().push_back(response);
    }

    /// Replaces the fallback body.
    pub fn set_body(&self, body: impl Into<String>) {
        *self.fallback.lock() = body.into();
    }

    /// Delays every fetch.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of fetches made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bearer token passed to the latest fetch.
    pub fn last_bearer(&self) -> Option<String> {
        self.last_bearer.lock().clone()
    }
}

#[async_trait]
impl ExternalSource for StaticSource {
    async fn fetch(&self, bearer: Option<&str>) -> IngestResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_bearer.lock() = bearer.map(str::to_string);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let queued = self.responses.lock().pop_front();
        match queued {
            Some(response) => response,
            None => Ok(self.fallback.lock().clone()),
        }
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}
