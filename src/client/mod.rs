//! Client side: device description, transport and correlation engine.
//!
//! The pieces layer strictly:
//!
//! | Module | Description |
//! |--------|-------------|
//! | `device` | The pairing target (address, port, stored key) |
//! | `socket` | One WebSocket and its event loop, fallback dialing |
//! | `client` | Correlation, subscriptions, pairing, lifecycle |
//!
//! [`SocketConnection`] knows nothing about frames beyond text in/out;
//! [`MessageClient`] owns all protocol semantics.

// ============================================================================
// Submodules
// ============================================================================

/// The pairing target.
pub mod device;

/// Client-side WebSocket transport.
pub mod socket;

/// Correlation engine and connection lifecycle.
pub mod client;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{
    ClientEvents, ClientNotification, DEFAULT_CALL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    MessageClient,
};
pub use device::{DEFAULT_PORT, Device};
pub use socket::{SocketConnection, SocketEvent};
