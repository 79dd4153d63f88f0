//! Per-connection outbound writer.
//!
//! Replies, pushes and events for one connection all funnel through its
//! [`Session`]: a queue in front of the WebSocket write half, drained by a
//! dedicated writer task. Queuing keeps dispatch and fan-out off the socket;
//! the per-frame acknowledgement lets senders report delivery truthfully.

// ============================================================================
// Imports
// ============================================================================

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

// ============================================================================
// Types
// ============================================================================

/// The write half a session owns.
type WriteHalf = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Queue entries for the writer task.
enum Outbound {
    /// A frame to write; `done` reports whether the write succeeded.
    Frame {
        text: String,
        done: oneshot::Sender<bool>,
    },
    /// Close the socket and end the writer.
    Close,
}

// ============================================================================
// Session
// ============================================================================

/// Handle to one connection's writer task.
///
/// Cheap to clone; clones are interchangeable and compare equal under
/// [`same_handle`](Self::same_handle). After the writer ends (explicit
/// close or write failure), sends resolve `false` immediately.
pub struct Session {
    out_tx: mpsc::UnboundedSender<Outbound>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            out_tx: self.out_tx.clone(),
        }
    }
}

impl Session {
    /// Spawns the writer task for a connection's write half.
    pub(crate) fn spawn(write: WriteHalf) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_writer(write, out_rx));
        Self { out_tx }
    }

    /// Queues a frame and awaits its delivery outcome.
    ///
    /// Returns `false` if the writer has ended or the write failed.
    pub async fn send(&self, text: String) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .out_tx
            .send(Outbound::Frame {
                text,
                done: done_tx,
            })
            .is_err()
        {
            return false;
        }
        done_rx.await.unwrap_or(false)
    }

    /// Requests the writer to close the socket and stop.
    ///
    /// Idempotent; a no-op if the writer already ended.
    pub fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close);
    }

    /// Returns `true` while the writer task is running.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.out_tx.is_closed()
    }

    /// Returns `true` if both handles drive the same writer.
    #[inline]
    #[must_use]
    pub fn same_handle(&self, other: &Self) -> bool {
        self.out_tx.same_channel(&other.out_tx)
    }

    /// Writer task: drains the queue into the socket.
    async fn run_writer(mut write: WriteHalf, mut out_rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Frame { text, done } => {
                    let delivered = match write.send(Message::Text(text.into())).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(error = %e, "Session write failed");
                            false
                        }
                    };
                    let _ = done.send(delivered);
                    if !delivered {
                        break;
                    }
                }

                Outbound::Close => {
                    let _ = write.close().await;
                    break;
                }
            }
        }
        debug!("Session writer terminated");
    }
}

// ============================================================================
// Tests
// ============================================================================
