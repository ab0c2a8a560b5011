//! Gemini wire format: request envelopes per API version, reply extraction

use serde_json::{json, Map, Value};

use crate::config::{ApiVersion, GenerationConfig};
use crate::error::ChatError;
use crate::proxy::mappers::history::Turn;
use crate::proxy::mappers::request::{prepend_primer, ContentPart, OutgoingRequest};

/// Acknowledgement used when a dedicated system field has to be inlined.
const INLINED_SYSTEM_ACK: &str = "Understood. I will follow these instructions.";

/// Finish reasons that mean the candidate was withheld by a content filter.
const BLOCKING_FINISH_REASONS: [&str; 5] =
    ["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII", "RECITATION"];

/// Builds `generateContent` bodies for one API version.
#[derive(Debug, Clone)]
pub struct GeminiEnvelope {
    version: ApiVersion,
    generation: GenerationConfig,
}

impl GeminiEnvelope {
    pub fn new(version: ApiVersion, generation: GenerationConfig) -> Self {
        Self { version, generation }
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    pub fn encode(&self, request: &OutgoingRequest) -> Value {
        let mut turns = request.turns.clone();
        let mut system_instruction = None;

        if let Some(system) = &request.system_framing {
            if self.version.supports_system_instruction() {
                system_instruction = Some(json!({ "parts": [{ "text": system }] }));
            } else {
                tracing::debug!("{} has no systemInstruction field, inlining persona", self.version.path_segment());
                prepend_primer(&mut turns, system, INLINED_SYSTEM_ACK);
            }
        }

        let mut contents: Vec<Value> = turns.turns().iter().map(encode_turn).collect();
        let current_parts: Vec<Value> = request
            .current_turn
            .iter()
            .map(|part| self.encode_part(part))
            .collect();
        contents.push(json!({ "role": "user", "parts": current_parts }));

        let mut body = json!({ "contents": contents });

        if let Some(sys) = system_instruction {
            body["systemInstruction"] = sys;
        }

        if !self.generation.is_empty() {
            body["generationConfig"] = self.encode_generation();
        }

        body
    }

    fn encode_part(&self, part: &ContentPart) -> Value {
        match part {
            ContentPart::Text(text) => json!({ "text": text }),
            ContentPart::Media(media) => match self.version {
                ApiVersion::V1 => json!({
                    "inline_data": {
                        "mime_type": media.mime_type,
                        "data": media.to_base64()
                    }
                }),
                ApiVersion::V1beta => json!({
                    "inlineData": {
                        "mimeType": media.mime_type,
                        "data": media.to_base64()
                    }
                }),
            },
        }
    }

    fn encode_generation(&self) -> Value {
        let mut config = Map::new();
        if let Some(t) = self.generation.temperature {
            config.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = self.generation.top_p {
            config.insert("topP".to_string(), json!(p));
        }
        if let Some(k) = self.generation.top_k {
            config.insert("topK".to_string(), json!(k));
        }
        if let Some(max) = self.generation.max_output_tokens {
            config.insert("maxOutputTokens".to_string(), json!(max));
        }
        Value::Object(config)
    }
}

fn encode_turn(turn: &Turn) -> Value {
    json!({
        "role": turn.role.as_gemini(),
        "parts": [{ "text": turn.text }]
    })
}

/// Outcome of reading a success envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    /// Withheld by a content filter; carries the provider's reason.
    Blocked(String),
}

/// Pull the reply out of a `generateContent` envelope.
///
/// All text parts of the first candidate are joined with newlines. With no
/// usable text, a prompt-feedback block or a filtering finish reason yields
/// [`Reply::Blocked`]; anything else is [`ChatError::NoContent`].
pub fn extract_reply(envelope: &Value) -> Result<Reply, ChatError> {
    let candidate = envelope
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    let texts: Vec<&str> = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(|t| t.as_bool()).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if !texts.is_empty() {
        return Ok(Reply::Text(texts.join("\n")));
    }

    if let Some(reason) = envelope
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(|r| r.as_str())
    {
        return Ok(Reply::Blocked(reason.to_string()));
    }

    if let Some(reason) = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|r| r.as_str())
        .filter(|r| BLOCKING_FINISH_REASONS.contains(r))
    {
        return Ok(Reply::Blocked(reason.to_string()));
    }

    Err(ChatError::NoContent)
}
