//! Conversation history normalization
//!
//! Incoming history arrives in whatever shape the client kept it in. The
//! provider only accepts strictly alternating user/model turns, so this
//! module folds the raw entries into a [`ConversationLog`] that upholds that.

use serde_json::Value;

/// Text used when a history entry carries no text of its own.
pub const MISSING_TEXT_PLACEHOLDER: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Map a vendor role spelling onto the canonical role. Unknown or
    /// missing roles count as the user.
    pub fn from_synonym(raw: Option<&str>) -> Role {
        match raw.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
            Some("model" | "assistant" | "ai" | "bot") => Role::Assistant,
            _ => Role::User,
        }
    }

    /// Role name on the Gemini wire.
    pub fn as_gemini(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

/// Raw history entry as the client sent it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryEntry {
    pub role: Option<String>,
    pub text: Option<String>,
}

impl HistoryEntry {
    pub fn new(role: &str, text: Option<&str>) -> Self {
        Self {
            role: Some(role.to_string()),
            text: text.map(str::to_string),
        }
    }

    /// Parse entries from a loosely-typed JSON value.
    ///
    /// Accepts `{role, text}`, `{role, content: "..."}` and provider-style
    /// `{role, parts: [{text}]}`. Non-object entries are ignored and a
    /// non-array value yields no entries.
    pub fn collect(value: Option<&Value>) -> Vec<HistoryEntry> {
        let Some(items) = value.and_then(|v| v.as_array()) else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let role = obj.get("role").and_then(|v| v.as_str()).map(str::to_string);
                let text = obj
                    .get("text")
                    .and_then(|v| v.as_str())
                    .or_else(|| obj.get("content").and_then(|v| v.as_str()))
                    .map(str::to_string)
                    .or_else(|| {
                        let parts = obj.get("parts")?.as_array()?;
                        let joined = parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n");
                        Some(joined)
                    });
                Some(HistoryEntry { role, text })
            })
            .collect()
    }
}

/// Ordered turns with no two adjacent turns sharing a role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationLog {
    turns: Vec<Turn>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn unless it repeats the role of the last one.
    /// Returns whether the turn was kept.
    pub fn push(&mut self, turn: Turn) -> bool {
        if self.last_role() == Some(turn.role) {
            return false;
        }
        self.turns.push(turn);
        true
    }

    /// Drop a trailing user turn so a new user turn can follow.
    pub fn pop_trailing_user(&mut self) -> Option<Turn> {
        if self.last_role() == Some(Role::User) {
            self.turns.pop()
        } else {
            None
        }
    }

    /// Drop leading assistant turns so the log can follow an assistant turn.
    pub fn trim_leading_assistant(&mut self) {
        while self.turns.first().map(|t| t.role) == Some(Role::Assistant) {
            self.turns.remove(0);
        }
    }

    pub fn last_role(&self) -> Option<Role> {
        self.turns.last().map(|t| t.role)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Prepend another log. The caller guarantees the seam alternates.
    pub(crate) fn prepend(&mut self, mut head: ConversationLog) {
        head.turns.append(&mut self.turns);
        self.turns = head.turns;
    }
}

/// Fold raw history into an alternating log.
///
/// Only the last `window` entries of the raw history are considered. Within a
/// run of same-role entries the first one wins. When `appending_user_turn` is
/// set a trailing user turn is removed, since the current turn is itself a
/// user turn. Never fails; the worst case is an empty log.
pub fn normalize_history(
    entries: &[HistoryEntry],
    window: usize,
    appending_user_turn: bool,
) -> ConversationLog {
    let start = entries.len().saturating_sub(window);
    let mut log = ConversationLog::new();

    for entry in &entries[start..] {
        let role = Role::from_synonym(entry.role.as_deref());
        let text = match entry.text.as_deref() {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => MISSING_TEXT_PLACEHOLDER.to_string(),
        };
        log.push(Turn { role, text });
    }

    if appending_user_turn {
        if let Some(dropped) = log.pop_trailing_user() {
            tracing::debug!("Dropped trailing user turn ({} chars) before current turn", dropped.text.len());
        }
    }

    log
}
