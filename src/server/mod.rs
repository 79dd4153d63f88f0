//! Server side: connection sessions, dispatch and the WebSocket host.
//!
//! The pieces layer strictly:
//!
//! | Module | Description |
//! |--------|-------------|
//! | `session` | Per-connection outbound writer |
//! | `service` | Handlers, subscriber sets, session table, fan-out |
//! | `server` | Listener, path routing, accept loop, shutdown |
//!
//! [`Session`] knows nothing about frames beyond text out; a
//! [`MessageService`] owns all dispatch semantics for one path; the
//! [`MessageServer`] only binds, routes and pumps connections.

// ============================================================================
// Submodules
// ============================================================================

/// Per-connection outbound writer.
pub mod session;

/// Request dispatch, subscriptions and fan-out.
pub mod service;

/// WebSocket host with path-routed services.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use server::MessageServer;
pub use service::{MessageService, RequestContext, ServiceEvents, ServiceNotification};
pub use session::Session;
