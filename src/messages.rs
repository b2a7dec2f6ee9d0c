//! Wire message envelopes and conversion to the flat backend format.
//!
//! Inbound requests carry ordered [`Message`] envelopes with typed parts.
//! The backend only understands flat `(role, text)` pairs, so this module
//! provides the pure translation in both directions. Conversion is total:
//! it never fails, and the inbound direction preserves envelope count 1:1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire prefix marking backend-produced content, e.g. `agent/chat`.
const AGENT_ROLE_PREFIX: &str = "agent/";

/// Author of a message envelope.
///
/// Decoded once from the wire string at the boundary so internal logic
/// never re-parses role strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Caller-provided content (`"user"` on the wire).
    User,
    /// Backend-produced content (`"agent/<name>"` on the wire).
    Agent(String),
}

impl Role {
    /// Parse a wire role string. Anything without the agent prefix is a user
    /// role; the conversion is total.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix(AGENT_ROLE_PREFIX) {
            Some(name) => Self::Agent(name.to_string()),
            None => Self::User,
        }
    }

    /// Render the wire role string.
    #[must_use]
    pub fn as_wire(&self) -> String {
        match self {
            Self::User => "user".to_string(),
            Self::Agent(name) => format!("{AGENT_ROLE_PREFIX}{name}"),
        }
    }
}

impl Serialize for Role {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.as_wire())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Role::parse(&s))
    }
}

/// One typed part of a message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    /// MIME type of the content (`text/plain` for generated text).
    pub content_type: String,
    /// Raw content.
    pub content: String,
}

impl MessagePart {
    /// Create a `text/plain` part.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content_type: "text/plain".to_string(),
            content: content.into(),
        }
    }

    fn is_text(&self) -> bool {
        self.content_type.starts_with("text/")
    }
}

/// An ordered, typed-part container representing one conversation turn.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub completed_at: DateTime<Utc>,
}

impl Message {
    /// Construct a user envelope with a single text part, timestamped now.
    #[must_use]
    pub fn user_text(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            role: Role::User,
            parts: vec![MessagePart::text(content)],
            created_at: now,
            completed_at: now,
        }
    }
}

/// Role tag understood by the chat-completions backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Flat `(role, text)` pair sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Flatten inbound envelopes into backend pairs, preserving order and count.
///
/// Text-typed parts are concatenated in part order joined by newline;
/// non-text parts are ignored. An envelope with zero text parts becomes an
/// empty-string pair rather than being dropped.
#[must_use]
pub fn to_backend(input: &[Message]) -> Vec<ChatMessage> {
    input
        .iter()
        .map(|message| {
            let content = message
                .parts
                .iter()
                .filter(|p| p.is_text())
                .map(|p| p.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let role = match &message.role {
                Role::User => ChatRole::User,
                Role::Agent(_) => ChatRole::Assistant,
            };
            ChatMessage { role, content }
        })
        .collect()
}

/// Wrap a backend text result as a single outbound envelope attributed to
/// the agent, timestamped at conversion time.
#[must_use]
pub fn from_backend(content: &str, agent_name: &str) -> Message {
    let now = Utc::now();
    Message {
        role: Role::Agent(agent_name.to_string()),
        parts: vec![MessagePart::text(content)],
        created_at: now,
        completed_at: now,
    }
}
