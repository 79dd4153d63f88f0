//! Pairing handshake types.
//!
//! Pairing is an application-level trust exchange riding the ordinary
//! request/response machinery on the reserved endpoint [`HANDSHAKE_URI`].
//! The client presents its stored key (empty on first contact); the server
//! either accepts, returning the key the client must store for next time,
//! or declines. Transport security is orthogonal: pairing only decides
//! whether commands are allowed.
//!
//! Approval policy is pluggable via [`PairingHook`]; without a hook the
//! server accepts every handshake and mints a fresh key each time.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Reserved endpoint uri addressing the handshake handler.
///
/// The empty uri is valid only here; every other endpoint must be non-empty.
pub const HANDSHAKE_URI: &str = "";

// ============================================================================
// Wire Types
// ============================================================================

/// Handshake request payload.
///
/// # Format
///
/// ```json
/// { "key": "previously-issued-key" }
/// ```
///
/// `key` is omitted when the client has never paired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// The pairing key from a previous handshake, empty on first contact.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

/// Handshake response payload.
///
/// # Format
///
/// ```json
/// { "returnValue": true, "key": "issued-key" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// `true` if pairing was accepted.
    #[serde(rename = "returnValue")]
    pub return_value: bool,

    /// The key the client must store and present next time. Empty when
    /// pairing was declined.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

impl HandshakeResponse {
    /// Creates an accepting response issuing `key`.
    #[inline]
    #[must_use]
    pub fn accepted(key: impl Into<String>) -> Self {
        Self {
            return_value: true,
            key: key.into(),
        }
    }

    /// Creates a declining response.
    #[inline]
    #[must_use]
    pub fn declined() -> Self {
        Self {
            return_value: false,
            key: String::new(),
        }
    }
}

// ============================================================================
// Approval Hook
// ============================================================================

/// Async approval callback deciding a pairing attempt.
///
/// Receives the client's request (including any previously issued key) and
/// returns the key to issue, or an empty string to decline. The future may
/// take a while: this is where a confirmation prompt or device allow-list
/// check lives, which is also why the client's handshake timeout is longer
/// than its call timeout.
pub type PairingHook = Arc<dyn Fn(HandshakeRequest) -> BoxFuture<'static, String> + Send + Sync>;

/// Mints a fresh pairing key.
#[inline]
#[must_use]
pub(crate) fn mint_pairing_key() -> String {
    Uuid::new_v4().to_string()
}

/// Produces the handshake response for one attempt.
///
/// Without a hook every attempt is accepted with a freshly minted key, so a
/// re-pairing client always observes a key change. With a hook the returned
/// key decides: non-empty accepts, empty declines.
pub(crate) async fn respond(
    hook: Option<&PairingHook>,
    request: HandshakeRequest,
) -> HandshakeResponse {
    match hook {
        None => HandshakeResponse::accepted(mint_pairing_key()),
        Some(hook) => {
            let key = hook(request).await;
            if key.is_empty() {
                HandshakeResponse::declined()
            } else {
                HandshakeResponse::accepted(key)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_omits_empty_key() {
        let json = serde_json::to_string(&HandshakeRequest::default()).unwrap();
        assert_eq!(json, "{}");

        let json = serde_json::to_string(&HandshakeRequest {
            key: "issued".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"key":"issued"}"#);
    }

    #[test]
    fn test_response_wire_names() {
        let json = serde_json::to_string(&HandshakeResponse::accepted("abc")).unwrap();
        assert_eq!(json, r#"{"returnValue":true,"key":"abc"}"#);

        let json = serde_json::to_string(&HandshakeResponse::declined()).unwrap();
        assert_eq!(json, r#"{"returnValue":false}"#);
    }

    #[test]
    fn test_request_tolerates_absent_key() {
        let request: HandshakeRequest = serde_json::from_str("{}").unwrap();
        assert!(request.key.is_empty());
    }

    #[tokio::test]
    async fn test_respond_without_hook_mints_unique_keys() {
        let first = respond(None, HandshakeRequest::default()).await;
        let second = respond(None, HandshakeRequest::default()).await;

        assert!(first.return_value);
        assert!(!first.key.is_empty());
        assert_ne!(first.key, second.key);
    }

    #[tokio::test]
    async fn test_respond_with_accepting_hook() {
        let hook: PairingHook = Arc::new(|request| {
            Box::pin(async move {
                if request.key.is_empty() {
                    "fresh-key".to_string()
                } else {
                    request.key
                }
            })
        });

        let first = respond(Some(&hook), HandshakeRequest::default()).await;
        assert_eq!(first, HandshakeResponse::accepted("fresh-key"));

        let again = respond(
            Some(&hook),
            HandshakeRequest {
                key: "fresh-key".into(),
            },
        )
        .await;
        assert_eq!(again, HandshakeResponse::accepted("fresh-key"));
    }

    #[tokio::test]
    async fn test_respond_with_declining_hook() {
        let hook: PairingHook = Arc::new(|_| Box::pin(async { String::new() }));
        let response = respond(Some(&hook), HandshakeRequest::default()).await;
        assert_eq!(response, HandshakeResponse::declined());
    }
}
