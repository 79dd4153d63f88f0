//! WebSocket server hosting message services.
//!
//! A [`MessageServer`] binds one listener and routes each WebSocket upgrade
//! to a [`MessageService`] by the request path; unknown paths are rejected
//! during the handshake with `404`. Every accepted connection gets a
//! [`Session`] for its writes and a serial reader that feeds frames to the
//! service's dispatcher, so frames from one connection are processed in
//! arrival order while connections stay independent.
//!
//! Adding a service installs the pairing handshake on its reserved uri,
//! either auto-accepting or deferring to a [`PairingHook`].

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handshake::{self, HANDSHAKE_URI, HandshakeRequest, PairingHook};
use crate::ids::ConnectionId;
use crate::server::service::MessageService;
use crate::server::session::Session;

// ============================================================================
// Constants
// ============================================================================

/// Default bind address: all interfaces, so devices can pair over the LAN.
const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Accept poll interval; bounds shutdown latency.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// MessageServer
// ============================================================================

/// Path-routed WebSocket host for [`MessageService`]s.
///
/// # Example
///
/// ```ignore
/// let server = MessageServer::bind(13000).await?;
/// let (service, events) = MessageService::new();
/// service.register_handler("build/progress", handler)?;
/// server.add_service("/", service)?;
/// ```
pub struct MessageServer {
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    /// Services by upgrade-request path.
    services: Mutex<FxHashMap<String, Arc<MessageService>>>,
    /// Shutdown flag polled by the accept loop.
    shutdown: AtomicBool,
}

// ============================================================================
// MessageServer - Constructors
// ============================================================================

impl MessageServer {
    /// Binds to all interfaces on `port` and starts the accept loop.
    ///
    /// Use port 0 to let the OS assign one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(port: u16) -> Result<Arc<Self>> {
        Self::bind_addr(SocketAddr::new(DEFAULT_BIND_IP, port)).await
    }

    /// Binds to a specific address and starts the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind_addr(addr: SocketAddr) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            local_addr,
            services: Mutex::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
        });

        let accept = Arc::clone(&server);
        tokio::spawn(async move {
            accept.accept_loop(listener).await;
        });

        info!(addr = %local_addr, "Server started");
        Ok(server)
    }
}

// ============================================================================
// MessageServer - Public API
// ============================================================================

impl MessageServer {
    /// Returns the bound socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns `true` until [`shutdown`](Self::shutdown) is called.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    /// Registers `service` under `path`, auto-accepting every pairing
    /// attempt with a freshly minted key.
    ///
    /// Paths are matched against the upgrade request exactly; a missing
    /// leading `/` is added and the empty path means `/`, the path a
    /// client reaches when connecting to the bare address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateService`] if the path is taken, or
    /// [`Error::ShapeConflict`] if the service already binds the handshake
    /// uri to different payload types.
    pub fn add_service(&self, path: impl Into<String>, service: Arc<MessageService>) -> Result<()> {
        self.install(path.into(), service, None)
    }

    /// Registers `service` under `path` with a pairing approval hook.
    ///
    /// The hook decides each handshake: the key it returns is issued to the
    /// client, an empty key declines. See [`add_service`](Self::add_service)
    /// for path matching and errors.
    pub fn add_service_with_pairing(
        &self,
        path: impl Into<String>,
        service: Arc<MessageService>,
        hook: PairingHook,
    ) -> Result<()> {
        self.install(path.into(), service, Some(hook))
    }

    /// Removes the service under `path` and closes its sessions.
    ///
    /// Returns `true` if a service was registered.
    pub fn remove_service(&self, path: &str) -> bool {
        let removed = self.services.lock().remove(&Self::normalize_path(path));
        match removed {
            Some(service) => {
                service.close_all_sessions();
                info!(path = %Self::normalize_path(path), "Service removed");
                true
            }
            None => false,
        }
    }

    /// Returns the number of registered services.
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.services.lock().len()
    }

    /// Stops accepting connections and closes every session.
    ///
    /// The accept loop exits within one poll interval. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Server shutting down");

        let services: Vec<Arc<MessageService>> = self.services.lock().values().cloned().collect();
        for service in services {
            service.close_all_sessions();
        }
    }
}

// ============================================================================
// MessageServer - Internals
// ============================================================================

impl MessageServer {
    fn normalize_path(path: &str) -> String {
        if path.is_empty() {
            "/".to_owned()
        } else if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        }
    }

    fn install(
        &self,
        path: String,
        service: Arc<MessageService>,
        hook: Option<PairingHook>,
    ) -> Result<()> {
        let path = Self::normalize_path(&path);

        let mut services = self.services.lock();
        if services.contains_key(&path) {
            return Err(Error::duplicate_service(path));
        }

        service.register_handler(
            HANDSHAKE_URI,
            move |_context, request: Option<HandshakeRequest>| {
                let hook = hook.clone();
                async move {
                    let request = request.unwrap_or_default();
                    debug!(returning = !request.key.is_empty(), "Handshake received");
                    Ok(handshake::respond(hook.as_ref(), request).await)
                }
            },
        )?;
        services.insert(path.clone(), service);
        drop(services);

        info!(path = %path, "Service registered");
        Ok(())
    }

    /// Background task accepting connections until shutdown.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            // Accept with a timeout so the shutdown flag stays responsive.
            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            warn!(error = %e, ?addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Upgrades one connection, routes it to its service and reads frames
    /// until the peer goes away.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        use tokio_tungstenite::tungstenite::handshake::server::{
            ErrorResponse, Request as UpgradeRequest, Response as UpgradeResponse,
        };
        use tokio_tungstenite::tungstenite::http::StatusCode;

        let mut path = String::new();
        let mut selected: Option<Arc<MessageService>> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &UpgradeRequest, response: UpgradeResponse| {
                path = request.uri().path().to_owned();
                match self.services.lock().get(&path) {
                    Some(service) => {
                        selected = Some(Arc::clone(service));
                        Ok(response)
                    }
                    None => {
                        let mut reject = ErrorResponse::new(None);
                        *reject.status_mut() = StatusCode::NOT_FOUND;
                        Err(reject)
                    }
                }
            },
        )
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;
        let service = selected.ok_or_else(|| Error::connection("upgrade selected no service"))?;

        let connection = ConnectionId::generate();
        let (write, mut read) = ws_stream.split();
        let session = Session::spawn(write);
        if let Err(err) = service.add_session(connection.clone(), session.clone()) {
            session.close();
            return Err(err);
        }
        info!(connection = %connection, path = %path, ?addr, "Connection established");

        // Serial reader: one frame dispatched at a time per connection.
        while let Some(frame) = read.next().await {
            match frame {
                Ok(message) if message.is_text() => {
                    let text = message.into_text()?;
                    let reply = service.dispatch(&connection, text.as_str()).await;
                    if !session.send(reply).await {
                        break;
                    }
                }
                Ok(message) if message.is_close() => break,
                // Binary, ping and pong frames are not part of the protocol.
                Ok(_) => {}
                Err(e) => {
                    debug!(connection = %connection, error = %e, "Read failed");
                    break;
                }
            }
        }

        service.remove_session(&connection);
        session.close();
        debug!(connection = %connection, "Connection ended");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
