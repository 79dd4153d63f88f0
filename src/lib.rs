//! webmessage - Typed request/response and event messaging over WebSocket.
//!
//! This library implements a small JSON frame protocol for talking to paired
//! devices: every frame is one envelope (`uri`, `id`, `type`, `error`,
//! `payload`), requests correlate with their responses by caller-minted id,
//! and endpoints fan out `event` frames to subscribed connections.
//!
//! # Architecture
//!
//! Both halves share the envelope and the payload type registry:
//!
//! - **Client**: [`MessageClient`] attaches to a [`Device`] (secure attempt
//!   first, plaintext fallback), performs the pairing handshake, then
//!   exchanges typed calls and subscriptions. A reader task resolves pending
//!   calls; callers suspend on their own completion slot.
//! - **Server**: a [`MessageServer`] routes WebSocket upgrades by path to
//!   [`MessageService`]s, which dispatch inbound frames to registered typed
//!   handlers, track subscriber sets per endpoint and push responses,
//!   broadcasts and events back out.
//!
//! Pairing is application-level trust: the server issues a key the client
//! stores and presents on later handshakes; an approval hook can gate it.
//!
//! # Quick Start
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use webmessage::{Device, MessageClient, MessageServer, MessageService, Result};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct BuildProgress {
//!     progress: f64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Host a service at the root path.
//!     let server = MessageServer::bind(13000).await?;
//!     let (service, _events) = MessageService::new();
//!     service.register_handler("build/progress", |_context, _query: Option<()>| async move {
//!         Ok(BuildProgress { progress: 0.42 })
//!     })?;
//!     server.add_service("/", service.clone())?;
//!
//!     // Pair and call from a client.
//!     let (client, _notifications) = MessageClient::new();
//!     client.attach(Device::new("127.0.0.1", 13000)).await?;
//!     client.connect().await?;
//!
//!     let progress: BuildProgress = client.call("build/progress", &()).await?;
//!     println!("build at {:.0}%", progress.progress * 100.0);
//!
//!     // Push an event to whoever subscribed.
//!     service.publish_event(&BuildProgress { progress: 1.0 }).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`MessageClient`], [`Device`], socket transport |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`handshake`] | Pairing frames and the approval hook |
//! | [`ids`] | [`CallId`] and [`ConnectionId`] newtypes |
//! | [`message`] | The wire envelope and the payload type registry |
//! | [`server`] | [`MessageServer`], [`MessageService`], sessions |
//!
//! # Wire Format
//!
//! Frames are JSON objects; fields are omitted when absent:
//!
//! ```json
//! {"uri":"build/progress","id":"a1b2c3d4","type":"request","payload":{}}
//! {"uri":"build/progress","id":"a1b2c3d4","type":"response","payload":{"progress":0.42}}
//! {"uri":"build/progress","type":"event","payload":{"progress":1.0}}
//! {"id":"a1b2c3d4","type":"error","error":"Invalid request uri: build/nope"}
//! ```
//!
//! A frame without a `type` counts as a request; unknown keys are ignored.

// ============================================================================
// Modules
// ============================================================================

/// Client side: device description, transport and correlation engine.
///
/// Use [`MessageClient`] to attach, pair and exchange typed frames with a
/// device.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Pairing handshake frames and the approval hook.
pub mod handshake;

/// Identifier newtypes.
///
/// [`CallId`] correlates calls with replies; [`ConnectionId`] names accepted
/// connections on the server.
pub mod ids;

/// Wire protocol types.
///
/// The envelope shared by every frame and the registry that types payloads.
pub mod message;

/// Server side: sessions, dispatch and the WebSocket host.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    ClientEvents, ClientNotification, DEFAULT_CALL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_PORT, Device, MessageClient, SocketConnection, SocketEvent,
};

// Error types
pub use error::{Error, Result};

// Handshake types
pub use handshake::{HANDSHAKE_URI, HandshakeRequest, HandshakeResponse, PairingHook};

// Identifier types
pub use ids::{CallId, ConnectionId};

// Protocol types
pub use message::{BoxedPayload, Decoded, Envelope, MessageType, PayloadRegistry, PayloadShape};

// Server types
pub use server::{
    MessageServer, MessageService, RequestContext, ServiceEvents, ServiceNotification, Session,
};
