//! Chat pipeline: normalize history, build the request, dispatch, extract

use std::sync::Arc;

use crate::config::{ApiVersion, ChatConfig, Config, SystemPlacement, UpstreamConfig};
use crate::error::ChatError;
use crate::proxy::mappers::gemini::{extract_reply, Reply};
use crate::proxy::mappers::history::{normalize_history, HistoryEntry};
use crate::proxy::mappers::request::{OutgoingRequest, RequestBuilder};
use crate::proxy::streaming::{spawn_decoder, FragmentStream};
use crate::proxy::upstream::client::{GeminiClient, GenerativeProvider};
use crate::proxy::upstream::dispatcher::{CandidateModelList, ModelFallbackDispatcher};

/// One inbound chat turn plus its history.
#[derive(Debug, Clone, Default)]
pub struct ChatInput {
    pub message: Option<String>,
    /// `data:<mime>;base64,<payload>`
    pub image: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl ChatInput {
    fn has_content(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty());
        present(&self.message) || present(&self.image)
    }
}

pub struct ChatService {
    dispatcher: ModelFallbackDispatcher,
    chat: ChatConfig,
    placement: SystemPlacement,
    explicit_model: Option<String>,
    fallback_models: Vec<String>,
}

impl ChatService {
    pub fn new(chat: ChatConfig, upstream: &UpstreamConfig, provider: Arc<dyn GenerativeProvider>) -> Self {
        let placement = resolve_placement(chat.system_placement, upstream.api_version);
        Self {
            dispatcher: ModelFallbackDispatcher::new(provider),
            chat,
            placement,
            explicit_model: upstream.model.clone(),
            fallback_models: upstream.fallback_models.clone(),
        }
    }

    /// Service backed by the real Gemini client.
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let client = GeminiClient::new(&config.upstream, &config.generation)?;
        Ok(Self::new(config.chat.clone(), &config.upstream, Arc::new(client)))
    }

    pub fn candidates(&self) -> CandidateModelList {
        CandidateModelList::new(self.explicit_model.as_deref(), &self.fallback_models)
    }

    fn prepare(&self, trace_id: &str, input: &ChatInput) -> Result<OutgoingRequest, ChatError> {
        if !input.has_content() {
            return Err(ChatError::MissingInput);
        }

        let history = normalize_history(&input.history, self.chat.history_window, true);
        tracing::debug!(
            "[{}] History: {} raw entries -> {} turns",
            trace_id,
            input.history.len(),
            history.len()
        );

        RequestBuilder::new(&self.chat, self.placement).build(
            input.message.as_deref(),
            input.image.as_deref(),
            history,
        )
    }

    pub async fn reply(&self, trace_id: &str, input: ChatInput) -> Result<String, ChatError> {
        let request = self.prepare(trace_id, &input)?;
        let candidates = self.candidates();

        tracing::info!(
            "[{}] Chat request | Turns: {} | Media: {} | Candidates: {}",
            trace_id,
            request.turns.len(),
            request.has_media(),
            candidates.len()
        );

        let dispatched = self.dispatcher.dispatch(trace_id, &request, &candidates).await?;

        match extract_reply(&dispatched.value) {
            Ok(Reply::Text(text)) => {
                tracing::info!(
                    "[{}] Completed | Model: {} | Attempts: {} | Reply: {} chars",
                    trace_id,
                    dispatched.model,
                    dispatched.attempts,
                    text.chars().count()
                );
                Ok(text)
            }
            Ok(Reply::Blocked(reason)) => {
                tracing::warn!("[{}] Reply withheld by content filter: {}", trace_id, reason);
                Ok(self.chat.safety_reply.clone())
            }
            Err(e) => {
                tracing::error!(
                    "[{}] Unexpected envelope shape from {}: {}",
                    trace_id,
                    dispatched.model,
                    dispatched.value
                );
                Err(e)
            }
        }
    }

    /// Dispatch a streaming call and decode its body on a background task.
    /// Failures before the upstream accepted the call are returned directly.
    pub async fn reply_stream(&self, trace_id: &str, input: ChatInput) -> Result<FragmentStream, ChatError> {
        let request = self.prepare(trace_id, &input)?;
        let candidates = self.candidates();

        tracing::info!(
            "[{}] Streaming chat request | Turns: {} | Media: {} | Candidates: {}",
            trace_id,
            request.turns.len(),
            request.has_media(),
            candidates.len()
        );

        let dispatched = self.dispatcher.dispatch_stream(trace_id, &request, &candidates).await?;
        tracing::info!("[{}] Streaming from {} (attempt {})", trace_id, dispatched.model, dispatched.attempts);

        Ok(spawn_decoder(
            trace_id.to_string(),
            dispatched.value,
            Some(self.chat.safety_reply.clone()),
        ))
    }
}

fn resolve_placement(configured: SystemPlacement, version: ApiVersion) -> SystemPlacement {
    let resolved = configured.resolve(version);
    if resolved == SystemPlacement::Dedicated && !version.supports_system_instruction() {
        tracing::warn!(
            "{} has no systemInstruction field; using primed turns instead",
            version.path_segment()
        );
        return SystemPlacement::PrimedTurns;
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::upstream::client::{ByteStream, ProviderFailure};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Records the requests it sees and answers with a fixed envelope.
    struct FixedProvider {
        envelope: Value,
        seen: Mutex<Vec<OutgoingRequest>>,
    }

    impl FixedProvider {
        fn new(envelope: Value) -> Arc<Self> {
            Arc::new(Self { envelope, seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl GenerativeProvider for FixedProvider {
        async fn generate(&self, _model: &str, request: &OutgoingRequest) -> Result<Value, ProviderFailure> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.envelope.clone())
        }

        async fn generate_stream(
            &self,
            _model: &str,
            request: &OutgoingRequest,
        ) -> Result<ByteStream, ProviderFailure> {
            self.seen.lock().unwrap().push(request.clone());
            let body = format!("data: {}\n\n", self.envelope);
            Ok(futures::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from(body))]).boxed())
        }
    }

    fn service(provider: Arc<FixedProvider>) -> ChatService {
        ChatService::new(ChatConfig::default(), &UpstreamConfig::default(), provider)
    }

    fn text_input(message: &str) -> ChatInput {
        ChatInput {
            message: Some(message.to_string()),
            ..ChatInput::default()
        }
    }

    #[tokio::test]
    async fn replies_with_extracted_text() {
        let provider = FixedProvider::new(json!({
            "candidates": [{ "content": { "parts": [{ "text": "olá" }] } }]
        }));
        let reply = service(provider).reply("t", text_input("oi")).await.unwrap();
        assert_eq!(reply, "olá");
    }

    #[tokio::test]
    async fn missing_input_never_reaches_upstream() {
        let provider = FixedProvider::new(json!({}));
        let svc = service(provider.clone());
        let input = ChatInput {
            message: Some("  ".to_string()),
            ..ChatInput::default()
        };
        assert_eq!(svc.reply("t", input).await.unwrap_err(), ChatError::MissingInput);
        assert!(provider.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn safety_block_becomes_apology() {
        let provider = FixedProvider::new(json!({ "promptFeedback": { "blockReason": "SAFETY" } }));
        let reply = service(provider).reply("t", text_input("oi")).await.unwrap();
        assert_eq!(reply, ChatConfig::default().safety_reply);
    }

    #[tokio::test]
    async fn trailing_user_history_is_replaced_by_current_turn() {
        let provider = FixedProvider::new(json!({
            "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }]
        }));
        let svc = service(provider.clone());
        let input = ChatInput {
            message: Some("segunda".to_string()),
            image: None,
            history: vec![
                HistoryEntry::new("user", Some("q")),
                HistoryEntry::new("model", Some("a")),
                HistoryEntry::new("user", Some("primeira")),
            ],
        };
        svc.reply("t", input).await.unwrap();

        let seen = provider.seen.lock().unwrap();
        let turns = seen[0].turns.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].text, "a");
    }

    #[tokio::test]
    async fn stream_yields_decoded_fragments() {
        let provider = FixedProvider::new(json!({
            "candidates": [{ "content": { "parts": [{ "text": "olá" }] } }]
        }));
        let fragments: Vec<_> = service(provider)
            .reply_stream("t", text_input("oi"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(fragments, vec![Ok("olá".to_string())]);
    }

    #[tokio::test]
    async fn blocked_stream_becomes_apology() {
        let provider = FixedProvider::new(json!({ "promptFeedback": { "blockReason": "SAFETY" } }));
        let fragments: Vec<_> = service(provider)
            .reply_stream("t", text_input("oi"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(fragments, vec![Ok(ChatConfig::default().safety_reply)]);
    }

    #[test]
    fn dedicated_placement_degrades_on_v1() {
        assert_eq!(
            resolve_placement(SystemPlacement::Dedicated, ApiVersion::V1),
            SystemPlacement::PrimedTurns
        );
        assert_eq!(
            resolve_placement(SystemPlacement::Auto, ApiVersion::V1beta),
            SystemPlacement::Dedicated
        );
    }
}
