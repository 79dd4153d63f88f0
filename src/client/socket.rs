//! Client-side WebSocket transport.
//!
//! [`SocketConnection`] owns one WebSocket and nothing else: no ids, no
//! payload typing, no pairing. It dials a [`Device`] by trying the secure
//! endpoint first and silently falling back to plaintext, then runs an
//! event loop that forwards inbound text frames and transport drops to the
//! owner as [`SocketEvent`]s.
//!
//! A locally requested close ends the loop *without* emitting
//! [`SocketEvent::Disconnected`], so deliberate shutdown never masquerades
//! as a connection loss.

// ============================================================================
// Imports
// ============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use crate::client::device::Device;
use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// WebSocket stream type, TLS-capable for the secure endpoint.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level happenings surfaced to the owning client.
#[derive(Debug)]
pub enum SocketEvent {
    /// A text frame arrived.
    Message(String),

    /// The connection dropped: remote close, transport error or stream end.
    /// Never emitted for a locally requested close.
    Disconnected,
}

/// Internal commands for the event loop.
enum SocketCommand {
    /// Write a text frame.
    Send(String),
    /// Close the socket and end the loop silently.
    Close,
}

// ============================================================================
// SocketConnection
// ============================================================================

/// Handle to one live WebSocket and its event loop task.
///
/// Cheap to clone; all clones drive the same socket. The handle stays valid
/// after the loop ends; sends then fail with [`Error::ConnectionClosed`]
/// and [`is_alive`](Self::is_alive) turns false.
#[derive(Debug)]
pub struct SocketConnection {
    /// Channel into the event loop.
    command_tx: mpsc::UnboundedSender<SocketCommand>,
    /// The URL that actually connected (secure or fallback).
    url: String,
}

impl Clone for SocketConnection {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            url: self.url.clone(),
        }
    }
}

impl SocketConnection {
    /// Connects to a device, preferring its secure endpoint.
    ///
    /// Tries `wss://address:port+1` first and falls back to
    /// `ws://address:port`. The intermediate failure is logged, not
    /// surfaced: no event loop exists until an attempt succeeds, so a
    /// failed first attempt can never look like a disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] when both endpoints are unreachable.
    pub async fn connect(device: &Device) -> Result<(Self, mpsc::UnboundedReceiver<SocketEvent>)> {
        let secure = device.secure_url();
        match Self::connect_url(&secure).await {
            Ok(connected) => Ok(connected),
            Err(err) => {
                debug!(url = %secure, error = %err, "Secure endpoint unreachable, trying plaintext");
                let plain = device.plain_url();
                Self::connect_url(&plain).await.map_err(|fallback_err| {
                    Error::connection(format!(
                        "neither {secure} nor {plain} reachable: {fallback_err}"
                    ))
                })
            }
        }
    }

    /// Connects to an explicit WebSocket URL, without fallback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] for a malformed URL, a non-WebSocket
    /// scheme, or a failed connection attempt.
    pub async fn connect_url(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<SocketEvent>)> {
        let parsed =
            Url::parse(url).map_err(|e| Error::connection(format!("invalid URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::connection(format!(
                "unsupported scheme '{}' in '{url}'",
                parsed.scheme()
            )));
        }

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::connection(format!("{url}: {e}")))?;
        debug!(url = %url, "WebSocket connected");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_event_loop(ws_stream, command_rx, event_tx));

        Ok((
            Self {
                command_tx,
                url: url.to_owned(),
            },
            event_rx,
        ))
    }

    /// Queues a text frame for sending.
    ///
    /// The write happens on the event loop task, off the caller's path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the event loop has ended.
    pub fn send(&self, text: String) -> Result<()> {
        self.command_tx
            .send(SocketCommand::Send(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Requests a silent close.
    ///
    /// Idempotent; a no-op if the loop already ended.
    pub fn close(&self) {
        let _ = self.command_tx.send(SocketCommand::Close);
    }

    /// Returns `true` while the event loop is running.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Returns the URL this socket actually connected to.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Event loop that owns the WebSocket halves.
    async fn run_event_loop(
        ws_stream: WsStream,
        mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
        event_tx: mpsc::UnboundedSender<SocketEvent>,
    ) {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                // Inbound frames from the peer
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            let _ = event_tx.send(SocketEvent::Message(text.to_string()));
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            let _ = event_tx.send(SocketEvent::Disconnected);
                            break;
                        }

                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket error");
                            let _ = event_tx.send(SocketEvent::Disconnected);
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            let _ = event_tx.send(SocketEvent::Disconnected);
                            break;
                        }

                        // Ignore Binary, Ping, Pong
                        _ => {}
                    }
                }

                // Commands from the owning client
                command = command_rx.recv() => {
                    match command {
                        Some(SocketCommand::Send(text)) => {
                            trace!(data = %text, "Sending");
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                warn!(error = %e, "WebSocket send failed");
                                let _ = event_tx.send(SocketEvent::Disconnected);
                                break;
                            }
                        }

                        Some(SocketCommand::Close) | None => {
                            debug!("Closing WebSocket");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        debug!("Socket event loop terminated");
    }
}

// ============================================================================
// Tests
// ============================================================================
