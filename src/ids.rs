//! Identifier newtypes used across the protocol.
//!
//! Two id spaces exist and never mix:
//!
//! - [`CallId`] correlates a request with its response on one connection.
//!   It is minted by the *sender* of a request and echoed verbatim by the
//!   responder.
//! - [`ConnectionId`] names a transport connection on the server side. It is
//!   minted by the server when a connection is accepted and is never visible
//!   on the wire.
//!
//! Both serialize as plain JSON strings.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CallId
// ============================================================================

/// Correlation id for a single request/response exchange.
///
/// Eight hex characters taken from a freshly generated v4 UUID: short enough
/// to keep frames readable in logs, random enough to be unique among the
/// calls in flight on one connection. The pending-call table additionally
/// rejects duplicates, so a collision fails fast instead of cross-resolving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Number of characters in a generated id.
    pub const LENGTH: usize = 8;

    /// Generates a fresh call id.
    #[must_use]
    pub fn generate() -> Self {
        let mut hex = Uuid::new_v4().simple().to_string();
        hex.truncate(Self::LENGTH);
        Self(hex)
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the id is empty.
    ///
    /// Decoded frames may legitimately carry no id; an empty `CallId` is the
    /// in-memory stand-in for that case.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Server-side identity of one accepted transport connection.
///
/// A full v4 UUID string. Used as the key of the session table and as the
/// membership token in per-endpoint subscriber sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generates a fresh connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the id is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_length_and_charset() {
        let id = CallId::generate();
        assert_eq!(id.as_str().len(), CallId::LENGTH);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_call_ids_are_unique() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_call_id_serializes_as_plain_string() {
        let id = CallId::from("a1b2c3d4");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"a1b2c3d4\"");

        let back: CallId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_connection_id_is_full_uuid() {
        let id = ConnectionId::generate();
        assert_eq!(id.as_str().len(), 36);
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_default_ids_are_empty() {
        assert!(CallId::default().is_empty());
        assert!(ConnectionId::default().is_empty());
    }
}
