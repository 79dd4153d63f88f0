//! Error types for the messaging crate.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use webmessage::{MessageClient, Result};
//!
//! async fn example(client: &MessageClient) -> Result<()> {
//!     let progress: BuildProgress = client.call("build/progress", &Query::default()).await?;
//!     println!("{:.0}%", progress.progress * 100.0);
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | State | [`Error::Precondition`] |
//! | Registration | [`Error::DuplicateId`], [`Error::ShapeConflict`], [`Error::SessionConflict`], [`Error::DuplicateService`] |
//! | Execution | [`Error::Timeout`], [`Error::Command`], [`Error::Handler`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::ids::{CallId, ConnectionId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection failed.
    ///
    /// Returned when neither the secure nor the plaintext endpoint of a
    /// device could be reached, or when an explicit URL fails to connect.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed while an operation was in flight.
    ///
    /// Pending calls resolve with this error when the connection drops or
    /// the client is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // State Errors
    // ========================================================================
    /// Operation attempted in the wrong lifecycle state.
    ///
    /// Returned when a call is made before a device is attached, before
    /// pairing completed, or against a payload type that was never
    /// registered.
    #[error("Precondition failed: {message}")]
    Precondition {
        /// Description of the violated precondition.
        message: String,
    },

    // ========================================================================
    // Registration Errors
    // ========================================================================
    /// A call id is already awaiting a response.
    ///
    /// Returned without sending anything; indicates a correlation-id
    /// collision among in-flight calls.
    #[error("Duplicate call id: {id}")]
    DuplicateId {
        /// The colliding call id.
        id: CallId,
    },

    /// A registry key is already bound to a different payload shape.
    ///
    /// Registering the *same* shape under a key is idempotent; only a
    /// conflicting shape is an error.
    #[error("Payload shape conflict for '{key}': registered {existing}, requested {requested}")]
    ShapeConflict {
        /// The contested registry key (an endpoint uri or a call id).
        key: String,
        /// Type name already registered under the key.
        existing: String,
        /// Type name of the rejected registration.
        requested: String,
    },

    /// A session id is already bound to a different connection.
    ///
    /// Re-adding the same id with the same connection handle is a no-op;
    /// only a different handle under an existing id is an error.
    #[error("Session id already in use: {id}")]
    SessionConflict {
        /// The contested session id.
        id: ConnectionId,
    },

    /// A service path is already registered on the server.
    #[error("Service path already registered: {path}")]
    DuplicateService {
        /// The contested upgrade-request path.
        path: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Call did not complete within its deadline.
    ///
    /// The pending entry is removed before this is returned, so a late
    /// response is silently ignored rather than resolving a stale call.
    #[error("Call {id} timed out after {timeout_ms}ms")]
    Timeout {
        /// The call id that timed out.
        id: CallId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The peer answered with an error envelope.
    ///
    /// Carries the remote-supplied message verbatim.
    #[error("Command failed: {message}")]
    Command {
        /// Error message reported by the peer.
        message: String,
    },

    /// A request handler failed.
    ///
    /// Never crosses the dispatch boundary: the server converts it into an
    /// error envelope for the requesting connection.
    #[error("Handler error: {message}")]
    Handler {
        /// Description of the handler failure.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected frame content.
    ///
    /// Returned when a frame decodes as JSON but violates the envelope
    /// contract, e.g. a typed payload that does not match its registered
    /// shape or a response that should carry a payload but does not.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a precondition error.
    #[inline]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Creates a duplicate call id error.
    #[inline]
    pub fn duplicate_id(id: CallId) -> Self {
        Self::DuplicateId { id }
    }

    /// Creates a payload shape conflict error.
    #[inline]
    pub fn shape_conflict(
        key: impl Into<String>,
        existing: impl Into<String>,
        requested: impl Into<String>,
    ) -> Self {
        Self::ShapeConflict {
            key: key.into(),
            existing: existing.into(),
            requested: requested.into(),
        }
    }

    /// Creates a session conflict error.
    #[inline]
    pub fn session_conflict(id: ConnectionId) -> Self {
        Self::SessionConflict { id }
    }

    /// Creates a duplicate service path error.
    #[inline]
    pub fn duplicate_service(path: impl Into<String>) -> Self {
        Self::DuplicateService { path: path.into() }
    }

    /// Creates a call timeout error.
    #[inline]
    pub fn timeout(id: CallId, timeout_ms: u64) -> Self {
        Self::Timeout { id, timeout_ms }
    }

    /// Creates a command error from a peer-supplied message.
    #[inline]
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Creates a handler error.
    #[inline]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is a precondition error.
    #[inline]
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }

    /// Returns `true` if this is a registration conflict.
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId { .. }
                | Self::ShapeConflict { .. }
                | Self::SessionConflict { .. }
                | Self::DuplicateService { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry, possibly after a reconnect.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection { .. } | Self::ConnectionClosed
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("failed to connect");
        assert_eq!(err.to_string(), "Connection failed: failed to connect");
    }

    #[test]
    fn test_timeout_display_includes_id() {
        let err = Error::timeout(CallId::from("a1b2c3d4"), 5000);
        assert_eq!(err.to_string(), "Call a1b2c3d4 timed out after 5000ms");
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::timeout(CallId::generate(), 5000);
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        let conn_err = Error::connection("test");
        let closed_err = Error::ConnectionClosed;
        let other_err = Error::precondition("test");

        assert!(conn_err.is_connection_error());
        assert!(closed_err.is_connection_error());
        assert!(!other_err.is_connection_error());
    }

    #[test]
    fn test_is_conflict() {
        let shape_err = Error::shape_conflict("build/progress", "TypeA", "TypeB");
        let dup_err = Error::duplicate_id(CallId::from("deadbeef"));
        let other_err = Error::command("test");

        assert!(shape_err.is_conflict());
        assert!(dup_err.is_conflict());
        assert!(!other_err.is_conflict());
    }

    #[test]
    fn test_is_recoverable() {
        let timeout_err = Error::timeout(CallId::generate(), 1000);
        let precondition_err = Error::precondition("test");

        assert!(timeout_err.is_recoverable());
        assert!(!precondition_err.is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
