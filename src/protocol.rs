//! Wire protocol types and JSON envelope codec.
//!
//! Every WebSocket text frame carries exactly one [`Envelope`]:
//!
//! ```text
//! {"name":"add","channel":"/math","data":[2,3],"replyWith":"1"}
//! ```
//!
//! Field rules:
//! - `name`: event identifier (required).
//! - `channel`: absent, `""`, and `"/"` are all aliases for the root
//!   channel; any other value names a channel. Decode normalizes the
//!   aliases to `None`.
//! - `data`: positional JSON arguments; absent on the wire decodes to the
//!   empty vector, empty vectors are still written on encode.
//! - `replyWith` / `replyTo`: correlation ids. Mutually exclusive on a
//!   single envelope; a frame carrying both is rejected at decode.

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved channel for handshake and join bootstrap messages.
pub const CONTROL_CHANNEL: &str = "$control";

/// Control message name for the connection handshake.
pub const MSG_CONNECT: &str = "connect";

/// Control message name for a named-channel join request.
pub const MSG_CHANNEL: &str = "channel";

/// One wire message.
///
/// Construct via [`Envelope::event`] / [`Envelope::request`] /
/// [`Envelope::reply`] rather than struct literals so the correlation-field
/// exclusivity invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event / message identifier.
    pub name: String,

    /// Target channel; `None` is the root channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Positional JSON arguments.
    #[serde(default)]
    pub data: Vec<Value>,

    /// Correlation id when the sender expects a reply.
    #[serde(rename = "replyWith", default, skip_serializing_if = "Option::is_none")]
    pub reply_with: Option<String>,

    /// Correlation id when this envelope is the reply.
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Errors produced by [`Envelope::decode`].
#[derive(Debug)]
pub enum DecodeError {
    /// The frame is not valid JSON, or does not match the envelope shape.
    Json(String),
    /// The frame carries both `replyWith` and `replyTo`.
    ConflictingCorrelation,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "malformed envelope: {msg}"),
            Self::ConflictingCorrelation => {
                write!(f, "envelope carries both replyWith and replyTo")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl Envelope {
    /// Build a fire-and-forget event envelope.
    #[must_use]
    pub fn event(name: impl Into<String>, channel: Option<String>, data: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            channel,
            data,
            reply_with: None,
            reply_to: None,
        }
    }

    /// Build a request envelope expecting a reply under `correlation_id`.
    #[must_use]
    pub fn request(
        name: impl Into<String>,
        channel: Option<String>,
        data: Vec<Value>,
        correlation_id: String,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            data,
            reply_with: Some(correlation_id),
            reply_to: None,
        }
    }

    /// Build the reply to an earlier request.
    ///
    /// `name` and `channel` mirror the request envelope.
    #[must_use]
    pub fn reply(
        name: impl Into<String>,
        channel: Option<String>,
        data: Vec<Value>,
        correlation_id: String,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            data,
            reply_with: None,
            reply_to: Some(correlation_id),
        }
    }

    /// Serialize to the wire text form.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }

    /// Parse and normalize one wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Json`] on malformed input and
    /// [`DecodeError::ConflictingCorrelation`] when both correlation fields
    /// are present.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let mut envelope: Envelope =
            serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
        if envelope.reply_with.is_some() && envelope.reply_to.is_some() {
            return Err(DecodeError::ConflictingCorrelation);
        }
        envelope.channel = normalize_channel(envelope.channel);
        Ok(envelope)
    }

    /// Whether this envelope is addressed to the control channel.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.channel.as_deref() == Some(CONTROL_CHANNEL)
    }
}

/// Collapse the root-channel aliases (`""`, `"/"`) to `None`.
#[must_use]
pub fn normalize_channel(channel: Option<String>) -> Option<String> {
    match channel.as_deref() {
        Some("") | Some("/") => None,
        _ => channel,
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────
