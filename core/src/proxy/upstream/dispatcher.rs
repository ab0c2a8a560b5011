//! Ordered model fallback
//!
//! Model names and API versions drift from release to release, so each
//! request walks an ordered list of candidate models and takes the first one
//! the provider accepts. Attempts are sequential: the upstream is metered.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::config::UpstreamConfig;
use crate::error::ChatError;
use crate::proxy::mappers::request::OutgoingRequest;
use crate::proxy::upstream::client::{ByteStream, FailureKind, GenerativeProvider, ProviderFailure};

/// Deduplicated, non-empty model identifiers in attempt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateModelList {
    models: Vec<String>,
}

impl CandidateModelList {
    pub fn new<I, S>(explicit: Option<&str>, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut models: Vec<String> = Vec::new();
        let explicit = explicit.map(|m| m.to_string());
        let all = explicit
            .into_iter()
            .chain(fallbacks.into_iter().map(|m| m.as_ref().to_string()));

        for raw in all {
            let trimmed = raw.trim();
            let model = trimmed.strip_prefix("models/").unwrap_or(trimmed);
            if model.is_empty() || models.iter().any(|m| m == model) {
                continue;
            }
            models.push(model.to_string());
        }

        Self { models }
    }

    pub fn from_config(upstream: &UpstreamConfig) -> Self {
        Self::new(upstream.model.as_deref(), &upstream.fallback_models)
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Successful attempt and the model that served it.
#[derive(Debug)]
pub struct Dispatched<T> {
    pub model: String,
    pub attempts: usize,
    pub value: T,
}

pub struct ModelFallbackDispatcher {
    provider: Arc<dyn GenerativeProvider>,
}

impl ModelFallbackDispatcher {
    pub fn new(provider: Arc<dyn GenerativeProvider>) -> Self {
        Self { provider }
    }

    pub async fn dispatch(
        &self,
        trace_id: &str,
        request: &OutgoingRequest,
        candidates: &CandidateModelList,
    ) -> Result<Dispatched<Value>, ChatError> {
        let provider = self.provider.as_ref();
        first_success(trace_id, candidates, |model| async move {
            provider.generate(&model, request).await
        })
        .await
    }

    pub async fn dispatch_stream(
        &self,
        trace_id: &str,
        request: &OutgoingRequest,
        candidates: &CandidateModelList,
    ) -> Result<Dispatched<ByteStream>, ChatError> {
        let provider = self.provider.as_ref();
        first_success(trace_id, candidates, |model| async move {
            provider.generate_stream(&model, request).await
        })
        .await
    }
}

/// Try each candidate in order, stopping at the first success. When every
/// candidate fails the last failure is surfaced.
async fn first_success<T, F, Fut>(
    trace_id: &str,
    candidates: &CandidateModelList,
    mut attempt: F,
) -> Result<Dispatched<T>, ChatError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, ProviderFailure>>,
{
    let mut last_failure: Option<ProviderFailure> = None;

    for (idx, model) in candidates.models().iter().enumerate() {
        match attempt(model.clone()).await {
            Ok(value) => {
                if idx > 0 {
                    tracing::info!("[{}] Model fallback succeeded: {} (attempt {})", trace_id, model, idx + 1);
                }
                return Ok(Dispatched {
                    model: model.clone(),
                    attempts: idx + 1,
                    value,
                });
            }
            Err(failure) => {
                match failure.kind {
                    FailureKind::Transport => {
                        tracing::warn!("[{}] {} transport error: {}", trace_id, model, failure.message)
                    }
                    FailureKind::Status(code) => {
                        tracing::warn!("[{}] {} returned {}: {}", trace_id, model, code, failure.message)
                    }
                    FailureKind::MalformedEnvelope => {
                        tracing::warn!("[{}] {} sent a malformed envelope: {}", trace_id, model, failure.message)
                    }
                }
                last_failure = Some(failure);
            }
        }
    }

    match last_failure {
        Some(failure) if failure.is_rate_limited() => Err(ChatError::RateLimited {
            message: failure.message,
            retry_after_secs: failure.retry_after_secs,
        }),
        Some(failure) => Err(ChatError::Upstream(failure.message)),
        None => Err(ChatError::NoCandidates),
    }
}
