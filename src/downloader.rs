use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use reqwest::header::{CONTENT_LENGTH, USER_AGENT};
use reqwest::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::limiter::ProbeGate;
use crate::retry::{FailureClass, RetryPolicies, Retryable};

/// Errors raised at the network boundary.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("status {status} on {url}")]
    Response { status: u16, url: String },
    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no content length for {url}")]
    MissingContentLength { url: String },
    #[error("invalid body from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("probe task failed: {0}")]
    Task(String),
}

impl FetchError {
    /// Classifies a reqwest failure for `url`.
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        let url = url.to_string();
        if let Some(status) = err.status() {
            FetchError::Response {
                status: status.as_u16(),
                url,
            }
        } else if err.is_timeout() {
            FetchError::Timeout { url }
        } else if err.is_builder() {
            FetchError::InvalidUrl {
                url,
                reason: err.to_string(),
            }
        } else if err.is_decode() {
            FetchError::Decode {
                url,
                reason: err.to_string(),
            }
        } else {
            FetchError::Connection {
                url,
                reason: err.to_string(),
            }
        }
    }
}

impl Retryable for FetchError {
    fn failure_class(&self) -> FailureClass {
        match self {
            FetchError::Response { .. } => FailureClass::Response,
            FetchError::Connection { .. } | FetchError::Task(_) => FailureClass::Connection,
            FetchError::Timeout { .. } => FailureClass::Timeout,
            FetchError::InvalidUrl { .. }
            | FetchError::MissingContentLength { .. }
            | FetchError::Decode { .. } => FailureClass::Content,
        }
    }

    fn is_client_error(&self) -> bool {
        matches!(self, FetchError::Response { status: 400..=499, .. })
    }
}

/// The HTTP operations the resolver needs. Implemented over reqwest by
/// [`HttpTransport`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url` and return the body. Error statuses are failures.
    async fn get_bytes(&self, url: &str) -> Result<Bytes, FetchError>;

    /// POST `body` as JSON to `url` and return the response body.
    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<Bytes, FetchError>;

    /// HEAD `url` and return its declared `Content-Length`.
    async fn content_length(&self, url: &str, timeout: Duration) -> Result<u64, FetchError>;
}

/// reqwest-backed transport. Connections are not kept alive between requests.
///
/// Every request is bounded by `request_timeout`; size probes use their own
/// shorter timeout instead.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(user_agent: impl Into<String>, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        resp.bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<Bytes, FetchError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        resp.bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))
    }

    async fn content_length(&self, url: &str, timeout: Duration) -> Result<u64, FetchError> {
        let resp = self
            .client
            .head(url)
            .header(USER_AGENT, &self.user_agent)
            .timeout(timeout)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| FetchError::MissingContentLength {
                url: url.to_string(),
            })
    }
}

/// GET `url` through the retry policies.
pub async fn fetch(
    transport: &dyn Transport,
    retry: &RetryPolicies,
    url: &str,
) -> Result<Bytes, FetchError> {
    retry.execute(move || transport.get_bytes(url)).await
}

/// GET `url` through the retry policies and decode the body as JSON.
pub async fn fetch_json<T: DeserializeOwned>(
    transport: &dyn Transport,
    retry: &RetryPolicies,
    url: &str,
) -> Result<T, FetchError> {
    let body = fetch(transport, retry, url).await?;
    serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Resolves segment sizes with one HEAD probe per segment.
#[derive(Clone)]
pub struct SegmentProber {
    transport: Arc<dyn Transport>,
    retry: Arc<RetryPolicies>,
    timeout: Duration,
}

impl SegmentProber {
    pub fn new(transport: Arc<dyn Transport>, retry: Arc<RetryPolicies>, timeout: Duration) -> Self {
        Self {
            transport,
            retry,
            timeout,
        }
    }

    /// Probes every url and returns one result per url, in input order.
    ///
    /// All probes are launched up front and all run to completion; `gate`
    /// bounds how many are on the wire at once. A probe holds its permit only
    /// while a request is in flight, not while backing off.
    pub async fn probe_all(&self, urls: &[Url], gate: &ProbeGate) -> Vec<Result<u64, FetchError>> {
        let mut tasks = Vec::with_capacity(urls.len());
        for url in urls {
            let url = url.as_str().to_string();
            let transport = self.transport.clone();
            let retry = self.retry.clone();
            let gate = gate.clone();
            let timeout = self.timeout;
            tasks.push(tokio::spawn(async move {
                let transport = transport.as_ref();
                let gate = &gate;
                let url = url.as_str();
                retry
                    .execute(move || async move {
                        let _permit = gate
                            .acquire()
                            .await
                            .map_err(|e| FetchError::Task(e.to_string()))?;
                        transport.content_length(url, timeout).await
                    })
                    .await
            }));
        }

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(FetchError::Task(e.to_string()))))
            .collect()
    }

    /// Probes every url and returns the sizes in input order, or the first
    /// failure in input order once every probe has finished.
    pub async fn probe_sizes(&self, urls: &[Url], gate: &ProbeGate) -> Result<Vec<u64>, FetchError> {
        let results = self.probe_all(urls, gate).await;
        debug!(segments = results.len(), peak = gate.peak(), "probes finished");
        results.into_iter().collect()
    }
}
