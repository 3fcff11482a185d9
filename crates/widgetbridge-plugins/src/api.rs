//! HTTP facade injected into plugins.
//!
//! [`HttpApiProxy`] is the host-managed client (base URL, host headers).
//! [`DirectFetch`] is what a widget falls back to when the bridge carries no
//! proxy. Both go through the same request path, so a widget cannot tell them
//! apart: 2xx resolves with the parsed JSON body, anything else rejects with
//! an [`ApiError`].

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use widgetbridge_core::{ApiConfig, CoreError, CoreResult};

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("HTTP {status}")]
    Status { status: u16, body: Option<String> },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ApiProxy: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value, ApiError>;
    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpApiProxy {
    client: Client,
    base_url: Url,
}

impl HttpApiProxy {
    pub fn new(base_url: &str, timeout: Option<Duration>, headers: HeaderMap) -> CoreResult<Self> {
        let base_url = parse_base(base_url)?;
        let client = build_client(timeout, headers)?;
        Ok(Self { client, base_url })
    }

    /// Builds the host proxy described by `cfg`, or `None` when no base URL
    /// is configured.
    pub fn from_config(cfg: &ApiConfig) -> CoreResult<Option<Self>> {
        let Some(base) = cfg.base_url.as_deref() else {
            return Ok(None);
        };
        let mut headers = HeaderMap::new();
        for (name, value) in &cfg.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CoreError::Config(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CoreError::Config(format!("header value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        Self::new(base, cfg.timeout(), headers).map(Some)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl ApiProxy for HttpApiProxy {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = resolve(Some(&self.base_url), path)?;
        send(&self.client, Method::GET, url, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let url = resolve(Some(&self.base_url), path)?;
        send(&self.client, Method::POST, url, Some(body)).await
    }
}

/// Plain network path used when the host injected no proxy.
#[derive(Debug, Clone)]
pub struct DirectFetch {
    client: Client,
    origin: Option<Url>,
}

impl DirectFetch {
    pub fn new(origin: Option<&str>, timeout: Option<Duration>) -> CoreResult<Self> {
        let origin = origin.map(parse_base).transpose()?;
        let client = build_client(timeout, HeaderMap::new())?;
        Ok(Self { client, origin })
    }

    pub fn from_config(cfg: &ApiConfig) -> CoreResult<Self> {
        Self::new(cfg.fallback_origin.as_deref(), cfg.timeout())
    }
}

#[async_trait]
impl ApiProxy for DirectFetch {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = resolve(self.origin.as_ref(), path)?;
        send(&self.client, Method::GET, url, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let url = resolve(self.origin.as_ref(), path)?;
        send(&self.client, Method::POST, url, Some(body)).await
    }
}

fn build_client(timeout: Option<Duration>, headers: HeaderMap) -> CoreResult<Client> {
    let mut builder = Client::builder().default_headers(headers);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|e| CoreError::Network(e.to_string()))
}

fn parse_base(raw: &str) -> CoreResult<Url> {
    // A base without a trailing slash would drop its last segment on join.
    let normalized = if raw.ends_with('/') { raw.to_string() } else { format!("{raw}/") };
    Url::parse(&normalized).map_err(|e| CoreError::Config(format!("invalid base url {raw:?}: {e}")))
}

fn resolve(base: Option<&Url>, path: &str) -> Result<Url, ApiError> {
    if let Ok(absolute) = Url::parse(path) {
        return Ok(absolute);
    }
    let base = base.ok_or_else(|| ApiError::InvalidUrl(format!("{path} (no base url)")))?;
    base.join(path.trim_start_matches('/'))
        .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))
}

async fn send(
    client: &Client,
    method: Method,
    url: Url,
    body: Option<&Value>,
) -> Result<Value, ApiError> {
    debug!(%method, %url, "api request");
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(body);
    }
    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(classify)?;

    if !status.is_success() {
        let body = (!bytes.is_empty()).then(|| {
            let text = String::from_utf8_lossy(&bytes);
            text.chars().take(MAX_ERROR_BODY).collect::<String>()
        });
        return Err(ApiError::Status { status: status.as_u16(), body });
    }
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

fn classify(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if err.is_decode() {
        ApiError::Decode(err.to_string())
    } else {
        ApiError::Network(err.to_string())
    }
}
