//! Single-request HTTP execution.

use crate::model::{BodyType, HttpMethod, ResponseSnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{redirect, Client, Method as ReqMethod};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};

const MAX_REDIRECTS: usize = 10;

/// Fully resolved request, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
    pub body_type: BodyType,
    pub timeout: Duration,
}

/// Transport-level failure. A 4xx/5xx response is not one of these.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0} seconds")]
    Timeout(u64),
    #[error("connection error: {0}")]
    Connect(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// Seam between the case runner and the network.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &PreparedRequest) -> Result<ResponseSnapshot, TransportError>;
}

/// [`HttpExecutor`] backed by `reqwest`.
///
/// Certificate verification is disabled: targets are test and staging
/// hosts that routinely use self-signed certificates.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }

    fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            return TransportError::Timeout(timeout.as_secs());
        }
        if err.is_builder() {
            return TransportError::InvalidRequest(error_chain(&err));
        }
        let detail = error_chain(&err);
        // The top-level message carries the request URL; only the causes
        // say what actually went wrong.
        if err.source().is_some_and(|cause| looks_like_tls(&error_chain(cause))) {
            return TransportError::Tls(detail);
        }
        if err.is_connect() {
            return TransportError::Connect(detail);
        }
        TransportError::Other(detail)
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &PreparedRequest) -> Result<ResponseSnapshot, TransportError> {
        let mut builder = self
            .client
            .request(Self::convert_method(request.method), &request.url)
            .timeout(request.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        if let Some(body) = request.body.as_ref().filter(|_| request.method.sends_body()) {
            builder = match request.body_type {
                BodyType::Json => builder.json(body),
                BodyType::Form => builder.form(&form_fields(body)),
                BodyType::Raw => builder.body(raw_text(body)),
            };
        }

        debug!("Sending request");
        let start = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| Self::classify(e, request.timeout))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::classify(e, request.timeout))?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        debug!(status, elapsed_ms, size = bytes.len(), "Received response");
        if status >= 400 {
            warn!(status, "Request returned an error status");
        }

        Ok(ResponseSnapshot {
            status,
            headers,
            body,
            elapsed_ms,
            size_bytes: bytes.len(),
            size: format_size(bytes.len()),
        })
    }
}

/// Flatten an error and its sources into one line.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn looks_like_tls(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    ["tls", "ssl", "certificate", "handshake"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn form_fields(body: &Value) -> Vec<(String, String)> {
    match body {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect(),
        Value::String(encoded) => url::form_urlencoded::parse(encoded.as_bytes())
            .into_owned()
            .collect(),
        _ => Vec::new(),
    }
}

fn raw_text(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let size = bytes as f64;
    if size > MB {
        format!("{:.2} MB", size / MB)
    } else if size > KB {
        format!("{:.2} KB", size / KB)
    } else {
        format!("{bytes} B")
    }
}
