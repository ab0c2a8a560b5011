//! Upstream client for calling the Google Generative Language API

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Client, Response};
use serde_json::Value;
use tokio::time::Duration;

use crate::config::{GenerationConfig, UpstreamConfig};
use crate::proxy::mappers::gemini::GeminiEnvelope;
use crate::proxy::mappers::request::OutgoingRequest;
use crate::proxy::rate_limit;

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Raw upstream body for streaming calls.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection, timeout or body read failure.
    Transport,
    /// Non-success HTTP status.
    Status(u16),
    /// Success status but the body was not a usable envelope.
    MalformedEnvelope,
}

/// One failed attempt against one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ProviderFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Transport, message: message.into(), retry_after_secs: None }
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Status(code), message: message.into(), retry_after_secs: None }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::MalformedEnvelope, message: message.into(), retry_after_secs: None }
    }

    pub fn with_retry_after(mut self, secs: Option<u64>) -> Self {
        self.retry_after_secs = secs;
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == FailureKind::Status(429)
    }
}

/// A generative backend addressed by model identifier.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    /// Single-shot generation returning the success envelope.
    async fn generate(&self, model: &str, request: &OutgoingRequest) -> Result<Value, ProviderFailure>;

    /// Streaming generation. Success means the upstream accepted the call;
    /// the body is returned unread.
    async fn generate_stream(
        &self,
        model: &str,
        request: &OutgoingRequest,
    ) -> Result<ByteStream, ProviderFailure>;
}

#[derive(Clone)]
pub struct GeminiClient {
    http_client: Client,
    base_url: String,
    api_key: String,
    envelope: GeminiEnvelope,
    attempt_timeout: Duration,
}

impl GeminiClient {
    pub fn new(upstream: &UpstreamConfig, generation: &GenerationConfig) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(upstream.connect_timeout_secs))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!("nutrik/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            base_url: upstream.base_url.trim_end_matches('/').to_string(),
            api_key: upstream.api_key.clone(),
            envelope: GeminiEnvelope::new(upstream.api_version, generation.clone()),
            attempt_timeout: Duration::from_secs(upstream.attempt_timeout_secs.max(1)),
        })
    }

    fn build_url(&self, model: &str, method: &str, query_string: Option<&str>) -> String {
        let version = self.envelope.version().path_segment();
        if let Some(qs) = query_string {
            format!("{}/{}/models/{}:{}?{}", self.base_url, version, model, method, qs)
        } else {
            format!("{}/{}/models/{}:{}", self.base_url, version, model, method)
        }
    }

    fn request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .http_client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if !self.api_key.is_empty() {
            builder = builder.header("x-goog-api-key", &self.api_key);
        }
        builder
    }

    /// Turn a non-success response into a failure with a readable message.
    async fn failure_from(response: Response) -> ProviderFailure {
        let status = response.status().as_u16();
        let retry_header = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        let retry_after = if status == 429 {
            rate_limit::retry_after_secs(retry_header.as_deref(), &body)
        } else {
            None
        };

        ProviderFailure::status(status, normalize_error_message(status, &body)).with_retry_after(retry_after)
    }
}

/// Prefer Google's `{"error": {"message": ...}}`, then the raw body, then the status.
pub fn normalize_error_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
        {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {}", status);
    }
    trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[async_trait]
impl GenerativeProvider for GeminiClient {
    async fn generate(&self, model: &str, request: &OutgoingRequest) -> Result<Value, ProviderFailure> {
        let url = self.build_url(model, "generateContent", None);
        let body = self.envelope.encode(request);

        let response = self
            .request(&url, &body)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(|e| ProviderFailure::transport(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::failure_from(response).await);
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProviderFailure::transport(format!("Failed to read body: {}", e)))?;

        match serde_json::from_str::<Value>(&text) {
            Ok(value) if value.is_object() => Ok(value),
            Ok(_) => Err(ProviderFailure::malformed("Envelope is not a JSON object")),
            Err(e) => Err(ProviderFailure::malformed(format!("Invalid JSON response: {}", e))),
        }
    }

    async fn generate_stream(
        &self,
        model: &str,
        request: &OutgoingRequest,
    ) -> Result<ByteStream, ProviderFailure> {
        let url = self.build_url(model, "streamGenerateContent", Some("alt=sse"));
        let body = self.envelope.encode(request);

        // Bound only the wait for headers; the body may legitimately stream for longer.
        let response = tokio::time::timeout(self.attempt_timeout, self.request(&url, &body).send())
            .await
            .map_err(|_| ProviderFailure::transport(format!("No response within {:?}", self.attempt_timeout)))?
            .map_err(|e| ProviderFailure::transport(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::failure_from(response).await);
        }

        Ok(response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed())
    }
}
