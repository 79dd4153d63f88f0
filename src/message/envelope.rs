//! The wire envelope shared by every frame.
//!
//! One JSON object shape covers requests, subscriptions, responses, events
//! and errors; [`MessageType`] discriminates. Payloads stay as raw JSON
//! (`RawValue`) until the registry types them, so the envelope itself never
//! needs to know payload shapes.
//!
//! # Format
//!
//! ```json
//! {
//!   "uri": "build/progress",
//!   "id": "a1b2c3d4",
//!   "type": "request",
//!   "error": "...",
//!   "payload": { ... }
//! }
//! ```
//!
//! Fields are written in exactly that order. `uri` is omitted when empty,
//! `id`/`error`/`payload` are omitted when absent; `type` is always present.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;

use crate::error::{Error, Result};
use crate::ids::CallId;

// ============================================================================
// MessageType
// ============================================================================

/// Frame type discriminator.
///
/// `request`, `subscribe` and `unsubscribe` flow caller → responder;
/// `response`, `event` and `error` flow responder → caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// One-shot command expecting exactly one reply.
    #[default]
    Request,
    /// Adds the sender to an endpoint's subscriber set.
    Subscribe,
    /// Removes the sender from an endpoint's subscriber set.
    Unsubscribe,
    /// Successful reply or server-initiated message.
    Response,
    /// Fan-out notification to subscribers.
    Event,
    /// Failed reply; `error` carries the reason.
    Error,
}

impl MessageType {
    /// Returns the lowercase wire name.
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Response => "response",
            Self::Event => "event",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A single protocol frame.
///
/// Field declaration order is the canonical wire order; serialization relies
/// on it, so do not reorder fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical endpoint address. Empty for the pairing handshake and for
    /// frames addressed purely by id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,

    /// Correlation id. Present on calls and their replies, absent on events
    /// and server-initiated pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CallId>,

    /// Frame type. Frames without an explicit `type` decode as requests.
    #[serde(rename = "type", default)]
    pub kind: MessageType,

    /// Failure reason; only present on error frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Raw JSON payload, typed later via the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl Envelope {
    /// Creates a frame with an already-serialized payload.
    #[inline]
    #[must_use]
    pub fn new(
        kind: MessageType,
        uri: impl Into<String>,
        id: Option<CallId>,
        payload: Option<Box<RawValue>>,
    ) -> Self {
        Self {
            uri: uri.into(),
            id,
            kind,
            error: None,
            payload,
        }
    }

    /// Creates a request frame carrying `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload fails to serialize.
    pub fn request<T: Serialize>(uri: impl Into<String>, id: CallId, payload: &T) -> Result<Self> {
        Ok(Self::new(
            MessageType::Request,
            uri,
            Some(id),
            Some(serde_json::value::to_raw_value(payload)?),
        ))
    }

    /// Creates a response frame echoing `uri` and `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload fails to serialize.
    pub fn response<T: Serialize>(
        uri: impl Into<String>,
        id: Option<CallId>,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::new(
            MessageType::Response,
            uri,
            id,
            Some(serde_json::value::to_raw_value(payload)?),
        ))
    }

    /// Creates a payload-less response acknowledging the call `id`.
    ///
    /// Used to confirm subscribe/unsubscribe frames, which have no response
    /// body; resolution is purely id-keyed.
    #[inline]
    #[must_use]
    pub fn ack(id: Option<CallId>) -> Self {
        Self::new(MessageType::Response, "", id, None)
    }

    /// Creates an event frame for `uri`.
    ///
    /// Events carry no id: they correlate by endpoint, not by call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload fails to serialize.
    pub fn event<T: Serialize>(uri: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(
            MessageType::Event,
            uri,
            None,
            Some(serde_json::value::to_raw_value(payload)?),
        ))
    }

    /// Creates an error frame answering the call `id` (when known).
    #[must_use]
    pub fn error_reply(id: Option<CallId>, message: impl Into<String>) -> Self {
        Self {
            uri: String::new(),
            id,
            kind: MessageType::Error,
            error: Some(message.into()),
            payload: None,
        }
    }

    /// Serializes the frame to its canonical JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on serialization failure.
    #[inline]
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a frame from JSON text without typing the payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the text is not a valid envelope.
    #[inline]
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns `true` for reply frames (`response` or `error`).
    ///
    /// Replies resolve by id; everything else resolves by uri.
    #[inline]
    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageType::Response | MessageType::Error)
    }

    /// Deserializes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the frame has no payload, or
    /// [`Error::Json`] if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self
            .payload
            .as_deref()
            .ok_or_else(|| Error::protocol("frame carries no payload"))?;
        Ok(serde_json::from_str(raw.get())?)
    }
}

// ============================================================================
// Tests
// ============================================================================
