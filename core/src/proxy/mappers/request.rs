//! Outgoing request assembly (persona, history, current multimodal turn)

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{ChatConfig, SystemPlacement};
use crate::error::ChatError;
use crate::proxy::mappers::history::{ConversationLog, Role, Turn};

static DATA_URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^data:([a-zA-Z0-9]+/[a-zA-Z0-9\-.+]+);base64,(.+)$")
        .expect("data URI pattern is valid")
});

/// Clients paste base64 with or without padding, sometimes wrapped.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Binary content embedded directly in the request.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineMedia {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl InlineMedia {
    /// Parse `data:<mime>;base64,<payload>`. Returns `None` when the string
    /// does not match or the payload is not valid base64.
    pub fn from_data_uri(uri: &str) -> Option<InlineMedia> {
        let caps = DATA_URI_RE.captures(uri.trim())?;
        let mime_type = caps.get(1)?.as_str().to_string();
        let payload: String = caps
            .get(2)?
            .as_str()
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let data = LENIENT_BASE64.decode(payload.as_bytes()).ok()?;
        if data.is_empty() {
            return None;
        }
        Some(InlineMedia { mime_type, data })
    }

    /// Canonical padded base64 of the payload.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Media(InlineMedia),
}

/// Provider-neutral request, built fresh for every call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    pub system_framing: Option<String>,
    pub turns: ConversationLog,
    pub current_turn: Vec<ContentPart>,
}

impl OutgoingRequest {
    pub fn has_media(&self) -> bool {
        self.current_turn.iter().any(|p| matches!(p, ContentPart::Media(_)))
    }
}

/// Synthetic user/assistant exchange carrying the persona for providers that
/// have no dedicated system field.
pub fn primer_turns(system: &str, ack: &str) -> ConversationLog {
    let mut log = ConversationLog::new();
    log.push(Turn::user(system));
    log.push(Turn::assistant(ack));
    log
}

/// Put the persona in front of `turns` as a primer exchange. Leading
/// assistant turns are dropped so the seam still alternates.
pub fn prepend_primer(turns: &mut ConversationLog, system: &str, ack: &str) {
    turns.trim_leading_assistant();
    turns.prepend(primer_turns(system, ack));
}

pub struct RequestBuilder<'a> {
    chat: &'a ChatConfig,
    placement: SystemPlacement,
}

impl<'a> RequestBuilder<'a> {
    /// `placement` must already be resolved against the API version.
    pub fn new(chat: &'a ChatConfig, placement: SystemPlacement) -> Self {
        Self { chat, placement }
    }

    pub fn build(
        &self,
        message: Option<&str>,
        image: Option<&str>,
        mut history: ConversationLog,
    ) -> Result<OutgoingRequest, ChatError> {
        let text = message.filter(|m| !m.trim().is_empty());
        let image = image.filter(|i| !i.trim().is_empty());

        let media = match image.map(InlineMedia::from_data_uri) {
            Some(Some(media)) => Some(media),
            Some(None) if text.is_none() => return Err(ChatError::MalformedMedia),
            Some(None) => {
                tracing::warn!("Ignoring malformed image data URI ({} bytes)", image.map_or(0, str::len));
                None
            }
            None => None,
        };

        let mut current_turn = Vec::with_capacity(2);
        match (text, &media) {
            (Some(t), _) => current_turn.push(ContentPart::Text(t.to_string())),
            (None, Some(_)) => {
                current_turn.push(ContentPart::Text(self.chat.default_image_prompt.clone()))
            }
            (None, None) => current_turn.push(ContentPart::Text(self.chat.default_greeting.clone())),
        }
        if let Some(media) = media {
            current_turn.push(ContentPart::Media(media));
        }

        // The current turn is a user turn.
        history.pop_trailing_user();

        let system = self.chat.system_prompt.trim();
        let system_framing = if system.is_empty() {
            None
        } else {
            match self.placement {
                SystemPlacement::PrimedTurns => {
                    prepend_primer(&mut history, system, &self.chat.primer_ack);
                    None
                }
                SystemPlacement::Dedicated | SystemPlacement::Auto => Some(system.to_string()),
            }
        };

        debug_assert!(history.last_role() != Some(Role::User));

        Ok(OutgoingRequest {
            system_framing,
            turns: history,
            current_turn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::history::{normalize_history, HistoryEntry};
    use pretty_assertions::assert_eq;

    const PNG_BYTES: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0xFF];

    fn chat_config() -> ChatConfig {
        ChatConfig {
            system_prompt: "persona".to_string(),
            primer_ack: "ok".to_string(),
            default_image_prompt: "analyze this photo nutritionally".to_string(),
            default_greeting: "hello".to_string(),
            ..ChatConfig::default()
        }
    }

    fn png_uri() -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(PNG_BYTES))
    }

    #[test]
    fn data_uri_round_trips_into_inline_media() {
        let media = InlineMedia::from_data_uri(&png_uri()).unwrap();
        assert_eq!(media.mime_type, "image/png");
        assert_eq!(media.data, PNG_BYTES);
        assert_eq!(media.to_base64(), STANDARD.encode(PNG_BYTES));
    }

    #[test]
    fn data_uri_tolerates_missing_padding_and_wrapping() {
        let encoded = STANDARD.encode(b"abcd");
        let unpadded = encoded.trim_end_matches('=');
        let uri = format!("data:image/jpeg;base64,{}\n", unpadded);
        let media = InlineMedia::from_data_uri(&uri).unwrap();
        assert_eq!(media.data, b"abcd");
    }

    #[test]
    fn data_uri_rejects_other_shapes() {
        assert!(InlineMedia::from_data_uri("not-a-data-uri").is_none());
        assert!(InlineMedia::from_data_uri("data:image/png,abcd").is_none());
        assert!(InlineMedia::from_data_uri("data:image/png;base64,@@@@").is_none());
        assert!(InlineMedia::from_data_uri("https://example.com/a.png").is_none());
    }

    #[test]
    fn text_comes_first_then_media() {
        let chat = chat_config();
        let request = RequestBuilder::new(&chat, SystemPlacement::Dedicated)
            .build(Some("o que tem aqui?"), Some(&png_uri()), ConversationLog::new())
            .unwrap();

        assert_eq!(request.system_framing.as_deref(), Some("persona"));
        assert_eq!(request.current_turn.len(), 2);
        assert_eq!(request.current_turn[0], ContentPart::Text("o que tem aqui?".to_string()));
        match &request.current_turn[1] {
            ContentPart::Media(media) => assert_eq!(media.data, PNG_BYTES),
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[test]
    fn malformed_image_with_text_is_dropped() {
        let chat = chat_config();
        let request = RequestBuilder::new(&chat, SystemPlacement::Dedicated)
            .build(Some("oi"), Some("garbage"), ConversationLog::new())
            .unwrap();
        assert_eq!(request.current_turn, vec![ContentPart::Text("oi".to_string())]);
        assert!(!request.has_media());
    }

    #[test]
    fn malformed_image_alone_is_an_input_error() {
        let chat = chat_config();
        let err = RequestBuilder::new(&chat, SystemPlacement::Dedicated)
            .build(None, Some("garbage"), ConversationLog::new())
            .unwrap_err();
        assert_eq!(err, ChatError::MalformedMedia);
    }

    #[test]
    fn image_alone_gets_default_prompt() {
        let chat = chat_config();
        let request = RequestBuilder::new(&chat, SystemPlacement::Dedicated)
            .build(Some("   "), Some(&png_uri()), ConversationLog::new())
            .unwrap();
        assert_eq!(
            request.current_turn[0],
            ContentPart::Text("analyze this photo nutritionally".to_string())
        );
        assert!(request.has_media());
    }

    #[test]
    fn empty_turn_gets_greeting() {
        let chat = chat_config();
        let request = RequestBuilder::new(&chat, SystemPlacement::Dedicated)
            .build(None, None, ConversationLog::new())
            .unwrap();
        assert_eq!(request.current_turn, vec![ContentPart::Text("hello".to_string())]);
    }

    #[test]
    fn primed_turns_replace_dedicated_field() {
        let chat = chat_config();
        let history = normalize_history(
            &[
                HistoryEntry::new("model", Some("stray reply")),
                HistoryEntry::new("user", Some("q1")),
                HistoryEntry::new("model", Some("a1")),
            ],
            10,
            true,
        );

        let request = RequestBuilder::new(&chat, SystemPlacement::PrimedTurns)
            .build(Some("q2"), None, history)
            .unwrap();

        assert_eq!(request.system_framing, None);
        assert_eq!(
            request.turns.turns(),
            &[
                Turn::user("persona"),
                Turn::assistant("ok"),
                Turn::user("q1"),
                Turn::assistant("a1"),
            ]
        );
    }

    #[test]
    fn empty_persona_is_omitted() {
        let chat = ChatConfig {
            system_prompt: String::new(),
            ..chat_config()
        };
        let request = RequestBuilder::new(&chat, SystemPlacement::PrimedTurns)
            .build(Some("oi"), None, ConversationLog::new())
            .unwrap();
        assert!(request.system_framing.is_none());
        assert!(request.turns.is_empty());
    }
}
