//! Wire protocol types.
//!
//! This module defines the JSON frame format shared by client and server
//! and the registry that types frame payloads.
//!
//! # Protocol Overview
//!
//! | Message type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `request` | Caller → Responder | One-shot command |
//! | `subscribe` | Caller → Responder | Join an endpoint's subscriber set |
//! | `unsubscribe` | Caller → Responder | Leave an endpoint's subscriber set |
//! | `response` | Responder → Caller | Reply or server-initiated push |
//! | `event` | Responder → Caller | Fan-out notification to subscribers |
//! | `error` | Responder → Caller | Failed reply with reason |
//!
//! Replies correlate by call id; everything else addresses an endpoint uri.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | The wire frame and its builders |
//! | `registry` | Payload type registration and frame decoding |

// ============================================================================
// Submodules
// ============================================================================

/// The wire frame and its builders.
pub mod envelope;

/// Payload type registration and frame decoding.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{Envelope, MessageType};
pub use registry::{BoxedPayload, Decoded, PayloadRegistry, PayloadShape};
