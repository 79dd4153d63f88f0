//! Message client: correlation engine and connection lifecycle.
//!
//! [`MessageClient`] drives one device relationship end to end:
//!
//! - **attach** opens the transport (secure first, plaintext fallback),
//! - **connect** performs the pairing handshake on the reserved uri,
//! - **call** / **subscribe** exchange typed frames once paired,
//! - **close** discards the device and cancels everything in flight.
//!
//! Correlation is id-keyed: every outgoing call registers its response
//! shape and a oneshot completion slot under a fresh [`CallId`]. The reader
//! task claims the slot by removing it from the pending map, so exactly one
//! of {response, error, timeout, close} resolves each call.
//!
//! # Thread Safety
//!
//! `MessageClient` is `Send + Sync` and cheap to clone; all clones share
//! one engine. Callers suspend on their own oneshot without ever blocking
//! frame processing.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::client::device::Device;
use crate::client::socket::{SocketConnection, SocketEvent};
use crate::error::{Error, Result};
use crate::handshake::{HANDSHAKE_URI, HandshakeRequest, HandshakeResponse};
use crate::ids::CallId;
use crate::message::envelope::{Envelope, MessageType};
use crate::message::registry::{BoxedPayload, Decoded, PayloadRegistry};

// ============================================================================
// Constants
// ============================================================================

/// Default deadline for ordinary calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default deadline for the pairing handshake.
///
/// Deliberately longer than ordinary calls: approval may involve a human
/// confirming a prompt on the device.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Types
// ============================================================================

/// Map of call ids to completion slots.
type PendingMap = FxHashMap<CallId, oneshot::Sender<Result<CallReply>>>;

/// Type-erased event sink, invoked with the raw event payload.
type EventSink = Arc<dyn Fn(&RawValue) + Send + Sync>;

/// Sinks per endpoint uri, keyed by the subscribe call that added them.
type SinkMap = FxHashMap<String, FxHashMap<CallId, EventSink>>;

/// A resolved (non-error) reply: the envelope plus its typed payload, when
/// the response carried one.
struct CallReply {
    envelope: Envelope,
    payload: Option<BoxedPayload>,
}

impl std::fmt::Debug for CallReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallReply")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Out-of-band happenings surfaced to the client's owner.
#[derive(Debug)]
pub enum ClientNotification {
    /// Transport connectivity changed.
    ///
    /// `connected: false` is emitted only for transport-initiated drops;
    /// a deliberate [`MessageClient::close`] is silent.
    ConnectionChanged {
        /// The device involved.
        device: Device,
        /// New connectivity state.
        connected: bool,
    },

    /// A frame arrived that could not be decoded.
    ///
    /// Carries the raw text for diagnostics. No pending call is affected.
    InvalidMessage {
        /// The undecodable frame text.
        raw: String,
    },

    /// A pairing handshake concluded successfully.
    PairingUpdated {
        /// The device, with its stored key already updated.
        device: Device,
        /// `true` if the issued key differs from the previously stored one.
        key_changed: bool,
    },
}

/// Receiver half for [`ClientNotification`]s.
pub type ClientEvents = mpsc::UnboundedReceiver<ClientNotification>;

// ============================================================================
// Shared State
// ============================================================================

/// State shared between API callers and the reader task.
struct ClientShared {
    /// Payload shapes: response types under call ids, event types under uris.
    registry: PayloadRegistry,
    /// In-flight calls awaiting resolution.
    pending: Mutex<PendingMap>,
    /// Event sinks per endpoint.
    sinks: Mutex<SinkMap>,
    /// The attached device, if any.
    device: Mutex<Option<Device>>,
    /// The live transport, if any.
    socket: Mutex<Option<SocketConnection>>,
    /// Whether the last handshake was accepted.
    paired: AtomicBool,
    /// Notification channel to the owner.
    notify_tx: mpsc::UnboundedSender<ClientNotification>,
}

impl ClientShared {
    fn notify(&self, notification: ClientNotification) {
        let _ = self.notify_tx.send(notification);
    }

    /// Fails every pending call with [`Error::ConnectionClosed`] and drops
    /// the response shapes registered under their ids.
    fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (id, tx) in drained {
            self.registry.unregister(id.as_str());
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending calls");
        }
    }
}

// ============================================================================
// MessageClient
// ============================================================================

/// Typed command/event client for one paired device.
pub struct MessageClient {
    shared: Arc<ClientShared>,
}

impl Clone for MessageClient {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl MessageClient {
    /// Creates a detached client and the receiver for its notifications.
    #[must_use]
    pub fn new() -> (Self, ClientEvents) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            registry: PayloadRegistry::new(),
            pending: Mutex::new(PendingMap::default()),
            sinks: Mutex::new(SinkMap::default()),
            device: Mutex::new(None),
            socket: Mutex::new(None),
            paired: AtomicBool::new(false),
            notify_tx,
        });
        (Self { shared }, notify_rx)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Attaches to a device: opens the transport without pairing.
    ///
    /// Useful on its own for discovery: reaching the socket proves the
    /// device is there without triggering an approval prompt. Re-attaching
    /// the same target while its socket is alive is a no-op (the stored
    /// device snapshot is still refreshed); any other previous transport is
    /// closed silently first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] when neither endpoint of the device is
    /// reachable. The client then stays detached.
    pub async fn attach(&self, device: Device) -> Result<()> {
        let already_attached = {
            let mut current = self.shared.device.lock();
            let socket = self.shared.socket.lock();
            match (current.as_ref(), socket.as_ref()) {
                (Some(cur), Some(sock)) if cur.same_target(&device) && sock.is_alive() => {
                    *current = Some(device.clone());
                    true
                }
                _ => false,
            }
        };
        if already_attached {
            debug!(address = %device.address(), "Already attached");
            return Ok(());
        }

        // Retargeting: drop the old transport silently and cancel whatever
        // was riding on it.
        if let Some(old) = self.shared.socket.lock().take() {
            old.close();
            self.shared.fail_pending();
        }

        let (socket, events) = SocketConnection::connect(&device).await?;

        *self.shared.device.lock() = Some(device.clone());
        *self.shared.socket.lock() = Some(socket);
        tokio::spawn(Self::run_reader(Arc::clone(&self.shared), events));

        self.shared.notify(ClientNotification::ConnectionChanged {
            device,
            connected: true,
        });
        Ok(())
    }

    /// Performs the pairing handshake with the default handshake timeout.
    ///
    /// # Errors
    ///
    /// See [`connect_with_timeout`](Self::connect_with_timeout).
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_timeout(DEFAULT_HANDSHAKE_TIMEOUT).await
    }

    /// Performs the pairing handshake.
    ///
    /// Requires an attached device; reconnects the transport first if it
    /// died since attach. Exactly one handshake call is sent, presenting
    /// the stored key (empty on first contact). On acceptance the issued
    /// key replaces the stored one and [`ClientNotification::PairingUpdated`]
    /// reports whether it changed. A declined handshake is not an error:
    /// the client simply remains unpaired.
    ///
    /// # Errors
    ///
    /// - [`Error::Precondition`] if no device is attached
    /// - [`Error::Connection`] if reconnecting fails
    /// - [`Error::Timeout`] if the peer does not answer in time
    /// - [`Error::Command`] if the peer answers with an error frame
    pub async fn connect_with_timeout(&self, handshake_timeout: Duration) -> Result<()> {
        let device = self
            .shared
            .device
            .lock()
            .clone()
            .ok_or_else(|| Error::precondition("no device attached; call attach first"))?;

        self.attach(device.clone()).await?;

        let request = HandshakeRequest {
            key: device.pairing_key.clone(),
        };
        let reply = self
            .call_internal::<_, HandshakeResponse>(
                HANDSHAKE_URI,
                MessageType::Request,
                Some(&request),
                handshake_timeout,
            )
            .await?;
        let response: HandshakeResponse = Self::typed_payload(reply)?;

        if !response.return_value {
            debug!("Pairing declined by peer");
            self.shared.paired.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let key_changed = device.pairing_key != response.key;
        let updated = {
            let mut stored = self.shared.device.lock();
            match stored.as_mut() {
                Some(stored) => {
                    stored.pairing_key = response.key.clone();
                    stored.clone()
                }
                // close() raced the handshake; stay detached.
                None => return Err(Error::ConnectionClosed),
            }
        };
        self.shared.paired.store(true, Ordering::SeqCst);
        debug!(key_changed, "Paired");
        self.shared.notify(ClientNotification::PairingUpdated {
            device: updated,
            key_changed,
        });
        Ok(())
    }

    /// Closes the client: discards the device, resets pairing, shuts the
    /// transport silently and fails every in-flight call with
    /// [`Error::ConnectionClosed`].
    ///
    /// Subscriptions and their payload shapes are dropped too; a later
    /// attach starts from a clean slate. Idempotent.
    pub fn close(&self) {
        let device = self.shared.device.lock().take();
        let socket = self.shared.socket.lock().take();
        self.shared.paired.store(false, Ordering::SeqCst);

        if let Some(socket) = socket {
            socket.close();
        }
        self.shared.fail_pending();
        self.shared.sinks.lock().clear();
        self.shared.registry.clear();

        if device.is_some() {
            debug!("Client closed");
        }
    }

    // ========================================================================
    // State Accessors
    // ========================================================================

    /// Returns `true` if a device is attached.
    #[inline]
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.shared.device.lock().is_some()
    }

    /// Returns `true` if the transport is currently alive.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared
            .socket
            .lock()
            .as_ref()
            .is_some_and(SocketConnection::is_alive)
    }

    /// Returns `true` if the last handshake was accepted.
    #[inline]
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.shared.paired.load(Ordering::SeqCst)
    }

    /// Returns a snapshot of the attached device, if any.
    #[must_use]
    pub fn device(&self) -> Option<Device> {
        self.shared.device.lock().clone()
    }

    /// Returns the number of calls awaiting resolution.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Sends a command and awaits its typed response with the default
    /// timeout.
    ///
    /// # Errors
    ///
    /// See [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call<C, R>(&self, uri: &str, command: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        self.call_with_timeout(uri, command, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Sends a command and awaits its typed response.
    ///
    /// # Errors
    ///
    /// - [`Error::Precondition`] if not attached or not paired
    /// - [`Error::Connection`] if an automatic reconnect fails
    /// - [`Error::DuplicateId`] on a correlation-id collision (nothing sent)
    /// - [`Error::Timeout`] if no reply arrives within `call_timeout`
    /// - [`Error::Command`] if the peer answers with an error frame
    /// - [`Error::Protocol`] if the reply carries no usable payload
    pub async fn call_with_timeout<C, R>(
        &self,
        uri: &str,
        command: &C,
        call_timeout: Duration,
    ) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        self.ensure_ready().await?;
        let reply = self
            .call_internal::<C, R>(uri, MessageType::Request, Some(command), call_timeout)
            .await?;
        Self::typed_payload(reply)
    }

    /// Subscribes to an endpoint's events with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`subscribe_with_timeout`](Self::subscribe_with_timeout).
    pub async fn subscribe<C, R, F>(&self, uri: &str, command: &C, sink: F) -> Result<()>
    where
        C: Serialize,
        R: DeserializeOwned + Send + 'static,
        F: Fn(R) + Send + Sync + 'static,
    {
        self.subscribe_with_timeout(uri, command, sink, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Subscribes to an endpoint's events.
    ///
    /// Sends a subscribe frame and registers `sink` for every `event` frame
    /// on `uri`. The sink is bound *before* the frame goes out: the ack and
    /// the first events may arrive back to back, and a sink bound late would
    /// silently miss them. A failed subscribe rolls the binding back, though
    /// events arriving in the window may already have been delivered.
    ///
    /// Sinks accumulate: subscribing twice delivers each event twice. They
    /// live until [`unsubscribe`](Self::unsubscribe) or
    /// [`close`](Self::close) and run on their own task, never on the
    /// reader.
    ///
    /// # Errors
    ///
    /// - [`Error::ShapeConflict`] if `uri` already decodes into a different
    ///   event type (nothing sent)
    /// - plus every failure mode of [`call_with_timeout`](Self::call_with_timeout)
    pub async fn subscribe_with_timeout<C, R, F>(
        &self,
        uri: &str,
        command: &C,
        sink: F,
        call_timeout: Duration,
    ) -> Result<()>
    where
        C: Serialize,
        R: DeserializeOwned + Send + 'static,
        F: Fn(R) + Send + Sync + 'static,
    {
        self.ensure_ready().await?;

        // Conflicting event shapes fail here, before anything is sent.
        let had_shape = self.shared.registry.contains(uri);
        self.shared.registry.register::<R>(uri)?;

        let id = CallId::generate();
        let sink: EventSink = Arc::new(move |raw: &RawValue| {
            match serde_json::from_str::<R>(raw.get()) {
                Ok(payload) => sink(payload),
                Err(e) => warn!(error = %e, "Event payload did not match subscription type"),
            }
        });
        self.shared
            .sinks
            .lock()
            .entry(uri.to_owned())
            .or_default()
            .insert(id.clone(), sink);

        let outcome = self
            .send_call::<C, R>(id.clone(), uri, MessageType::Subscribe, Some(command), call_timeout)
            .await;
        if let Err(err) = outcome {
            let mut sinks = self.shared.sinks.lock();
            if let Some(entries) = sinks.get_mut(uri) {
                entries.remove(&id);
                if entries.is_empty() {
                    sinks.remove(uri);
                }
            }
            if !had_shape && !sinks.contains_key(uri) {
                self.shared.registry.unregister(uri);
            }
            return Err(err);
        }

        debug!(uri = %uri, "Subscribed");
        Ok(())
    }

    /// Leaves an endpoint's subscriber set with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`unsubscribe_with_timeout`](Self::unsubscribe_with_timeout).
    pub async fn unsubscribe(&self, uri: &str) -> Result<()> {
        self.unsubscribe_with_timeout(uri, DEFAULT_CALL_TIMEOUT).await
    }

    /// Leaves an endpoint's subscriber set.
    ///
    /// Sends an unsubscribe frame, then drops every local sink and the
    /// event shape for `uri`.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`call_with_timeout`](Self::call_with_timeout).
    pub async fn unsubscribe_with_timeout(&self, uri: &str, call_timeout: Duration) -> Result<()> {
        self.ensure_ready().await?;

        self.call_internal::<(), ()>(uri, MessageType::Unsubscribe, None, call_timeout)
            .await?;

        self.shared.sinks.lock().remove(uri);
        self.shared.registry.unregister(uri);
        debug!(uri = %uri, "Unsubscribed");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Validates that calls are allowed, reconnecting a dead transport.
    ///
    /// The pairing flag survives transport drops (the key is still
    /// trusted), so a paired client transparently re-attaches and
    /// re-handshakes instead of failing.
    async fn ensure_ready(&self) -> Result<()> {
        if !self.is_attached() {
            return Err(Error::precondition("no device attached; call attach first"));
        }
        if !self.is_paired() {
            return Err(Error::precondition("not paired; call connect first"));
        }
        if !self.is_connected() {
            debug!("Transport down, reconnecting");
            self.connect().await?;
        }
        Ok(())
    }

    /// Sends one correlated frame and awaits its resolution.
    ///
    /// `R` is the expected response payload type, registered under the
    /// fresh call id until resolution. The pending-map insert is the
    /// collision check; the reader's remove is the resolution claim.
    async fn call_internal<C, R>(
        &self,
        uri: &str,
        kind: MessageType,
        command: Option<&C>,
        call_timeout: Duration,
    ) -> Result<CallReply>
    where
        C: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let id = CallId::generate();
        self.send_call::<C, R>(id, uri, kind, command, call_timeout)
            .await
    }

    /// [`call_internal`](Self::call_internal) with an explicit id.
    async fn send_call<C, R>(
        &self,
        id: CallId,
        uri: &str,
        kind: MessageType,
        command: Option<&C>,
        call_timeout: Duration,
    ) -> Result<CallReply>
    where
        C: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let socket = self
            .shared
            .socket
            .lock()
            .clone()
            .ok_or(Error::ConnectionClosed)?;

        let payload = match command {
            Some(command) => Some(serde_json::value::to_raw_value(command)?),
            None => None,
        };
        let json = Envelope::new(kind, uri, Some(id.clone()), payload).to_json()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.contains_key(&id) {
                return Err(Error::duplicate_id(id));
            }
            pending.insert(id.clone(), tx);
        }
        if let Err(err) = self.shared.registry.register::<R>(id.as_str()) {
            self.shared.pending.lock().remove(&id);
            return Err(err);
        }

        if let Err(err) = socket.send(json) {
            self.remove_call(&id);
            return Err(err);
        }
        trace!(id = %id, uri = %uri, kind = %kind, "Call sent");

        match timeout(call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                // Deadline first: remove the claim so a late reply is a
                // silent no-op instead of resolving a stale call.
                self.remove_call(&id);
                Err(Error::timeout(id, call_timeout.as_millis() as u64))
            }
        }
    }

    /// Removes a call's pending slot and response shape.
    fn remove_call(&self, id: &CallId) {
        self.shared.pending.lock().remove(id);
        self.shared.registry.unregister(id.as_str());
    }

    /// Extracts the typed payload from a resolved reply.
    fn typed_payload<R: 'static>(reply: CallReply) -> Result<R> {
        let id = reply.envelope.id.clone().unwrap_or_default();
        let payload = reply
            .payload
            .ok_or_else(|| Error::protocol(format!("response {id} carried no payload")))?;
        payload
            .downcast::<R>()
            .map(|boxed| *boxed)
            .map_err(|_| Error::protocol(format!("response {id} payload had unexpected type")))
    }

    // ========================================================================
    // Reader Task
    // ========================================================================

    /// Consumes socket events until the transport ends.
    async fn run_reader(
        shared: Arc<ClientShared>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Message(text) => Self::handle_frame(&shared, &text),
                SocketEvent::Disconnected => {
                    Self::handle_disconnect(&shared);
                    break;
                }
            }
        }
        debug!("Reader task terminated");
    }

    /// Routes one inbound frame.
    fn handle_frame(shared: &Arc<ClientShared>, text: &str) {
        trace!(data = %text, "Received");

        let decoded = match shared.registry.decode(text) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(error = %err, "Undecodable frame");
                shared.notify(ClientNotification::InvalidMessage {
                    raw: text.to_owned(),
                });
                return;
            }
        };

        // A matching id claims its pending call; the map removal is the
        // atomic claim, so each call resolves at most once.
        if let Some(id) = decoded.envelope().id.clone() {
            let claimed = shared.pending.lock().remove(&id);
            if let Some(tx) = claimed {
                shared.registry.unregister(id.as_str());

                let (envelope, payload) = decoded.into_parts();
                let outcome = if envelope.kind == MessageType::Error {
                    let message = envelope
                        .error
                        .clone()
                        .unwrap_or_else(|| "unspecified error".to_owned());
                    Err(Error::command(message))
                } else {
                    Ok(CallReply { envelope, payload })
                };
                let _ = tx.send(outcome);
                return;
            }
        }

        if decoded.envelope().kind == MessageType::Event {
            Self::dispatch_event(shared, decoded);
            return;
        }

        // Unmatched non-event frame, e.g. a reply landing after its call
        // timed out: dropped without ceremony.
        trace!(kind = %decoded.envelope().kind, "Frame matched no pending call; dropped");
    }

    /// Fans an event frame out to the endpoint's sinks.
    fn dispatch_event(shared: &Arc<ClientShared>, decoded: Decoded) {
        let (envelope, _) = decoded.into_parts();
        let Some(raw) = envelope.payload else {
            trace!(uri = %envelope.uri, "Event without payload; dropped");
            return;
        };

        let sinks: Vec<EventSink> = shared
            .sinks
            .lock()
            .get(&envelope.uri)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        if sinks.is_empty() {
            trace!(uri = %envelope.uri, "Event with no sinks; dropped");
            return;
        }

        // Sinks are caller code; keep them off the reader path.
        tokio::spawn(async move {
            for sink in sinks {
                sink(&raw);
            }
        });
    }

    /// Reacts to a transport-initiated drop.
    ///
    /// Pairing survives: the key is still trusted, so the next call
    /// reconnects instead of failing on a precondition.
    fn handle_disconnect(shared: &Arc<ClientShared>) {
        warn!("Connection lost");
        shared.fail_pending();
        if let Some(device) = shared.device.lock().clone() {
            shared.notify(ClientNotification::ConnectionChanged {
                device,
                connected: false,
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
