//! Request dispatch, subscriptions and fan-out for one service path.
//!
//! A [`MessageService`] owns everything the server needs to answer one
//! upgrade path: the handler table (uri → typed handler), the per-endpoint
//! subscriber sets, and the session table of live connections. Inbound
//! frames from any connection go through [`dispatch`](MessageService::dispatch);
//! outbound pushes go through [`send_to`](MessageService::send_to),
//! [`broadcast`](MessageService::broadcast) and
//! [`publish_event`](MessageService::publish_event).
//!
//! Handlers are registered with their request and response types; dispatch
//! decodes the inbound payload into the request type before the handler runs,
//! and outbound fan-out finds the endpoint uri by the response type alone.

// ============================================================================
// Imports
// ============================================================================

use std::any::{self, TypeId};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::ids::{CallId, ConnectionId};
use crate::message::envelope::{Envelope, MessageType};
use crate::message::registry::{BoxedPayload, PayloadRegistry, PayloadShape};
use crate::server::session::Session;

// ============================================================================
// Constants
// ============================================================================

/// Emitted when even the error envelope fails to serialize.
const FALLBACK_ERROR_FRAME: &str = r#"{"type":"error","error":"internal serialization failure"}"#;

// ============================================================================
// Types
// ============================================================================

/// What a handler learns about the request it is answering.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The connection the request arrived on.
    pub connection: ConnectionId,
    /// The call id the reply will echo; empty if the request carried none.
    pub call_id: CallId,
    /// The inbound frame type.
    pub kind: MessageType,
}

/// Notifications about connections joining and leaving the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceNotification {
    /// A connection was added to the session table.
    ClientConnected {
        /// The new connection's id.
        id: ConnectionId,
    },
    /// A connection was removed from the session table.
    ClientDisconnected {
        /// The removed connection's id.
        id: ConnectionId,
    },
}

/// Receiver half for [`ServiceNotification`]s.
pub type ServiceEvents = mpsc::UnboundedReceiver<ServiceNotification>;

/// Future returned by a type-erased handler.
type HandlerFuture = BoxFuture<'static, Result<Box<RawValue>>>;

/// A handler with its request/response types erased.
type BoxedHandler = Arc<dyn Fn(RequestContext, Option<BoxedPayload>) -> HandlerFuture + Send + Sync>;

/// One registered endpoint: its payload shapes, handler and subscribers.
struct HandlerEntry {
    request: PayloadShape,
    response_type: TypeId,
    response_name: &'static str,
    subscribers: FxHashSet<ConnectionId>,
    handler: BoxedHandler,
}

// ============================================================================
// MessageService
// ============================================================================

/// Dispatcher and connection registry for one service path.
pub struct MessageService {
    /// uri → handler entry. Subscriber sets live inside the entries, so an
    /// endpoint and its subscribers are always removed together.
    handlers: Mutex<FxHashMap<String, HandlerEntry>>,
    /// uri → request payload shape, consulted when decoding inbound frames.
    registry: PayloadRegistry,
    /// Live connections by id.
    sessions: Mutex<FxHashMap<ConnectionId, Session>>,
    notify_tx: mpsc::UnboundedSender<ServiceNotification>,
}

impl MessageService {
    /// Creates a service and the receiver for its notifications.
    #[must_use]
    pub fn new() -> (Arc<Self>, ServiceEvents) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            handlers: Mutex::new(FxHashMap::default()),
            registry: PayloadRegistry::new(),
            sessions: Mutex::new(FxHashMap::default()),
            notify_tx,
        });
        (service, notify_rx)
    }

    // ========================================================================
    // Handler Registration
    // ========================================================================

    /// Registers the handler for `uri`.
    ///
    /// `Req` is the payload type inbound frames for this uri decode into;
    /// the handler receives `None` when a frame carries no payload. `Rsp` is
    /// the reply payload, and also the type [`send_to`](Self::send_to),
    /// [`broadcast`](Self::broadcast) and
    /// [`publish_event`](Self::publish_event) use to find this uri.
    ///
    /// Re-registering with the same `Req`/`Rsp` pair replaces the handler in
    /// place and keeps the endpoint's subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeConflict`] if the uri is already registered
    /// with a different request or response type.
    pub fn register_handler<Req, Rsp, F, Fut>(&self, uri: impl Into<String>, handler: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(RequestContext, Option<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let uri = uri.into();
        let request = PayloadShape::of::<Req>();
        let response_type = TypeId::of::<Rsp>();
        let response_name = any::type_name::<Rsp>();

        let handler = Arc::new(handler);
        let erased: BoxedHandler = Arc::new(move |context, payload| -> HandlerFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request = match payload {
                    Some(boxed) => match boxed.downcast::<Req>() {
                        Ok(request) => Some(*request),
                        Err(_) => return Err(Error::protocol("request payload type mismatch")),
                    },
                    None => None,
                };
                let response = handler(context, request).await?;
                Ok(serde_json::value::to_raw_value(&response)?)
            })
        });

        let mut handlers = self.handlers.lock();
        if let Some(existing) = handlers.get_mut(&uri) {
            if existing.request.same_shape(&request) && existing.response_type == response_type {
                existing.handler = erased;
                debug!(uri = %uri, "Handler replaced");
                return Ok(());
            }
            let (registered, rejected) = if existing.request.same_shape(&request) {
                (existing.response_name, response_name)
            } else {
                (existing.request.type_name(), request.type_name())
            };
            return Err(Error::shape_conflict(uri, registered, rejected));
        }

        self.registry.register_shape(uri.clone(), request.clone())?;
        handlers.insert(
            uri.clone(),
            HandlerEntry {
                request,
                response_type,
                response_name,
                subscribers: FxHashSet::default(),
                handler: erased,
            },
        );
        drop(handlers);

        debug!(uri = %uri, "Handler registered");
        Ok(())
    }

    /// Removes the handler for `uri` along with its subscriber set.
    ///
    /// Returns `true` if a handler was registered.
    pub fn unregister_handler(&self, uri: &str) -> bool {
        let removed = self.handlers.lock().remove(uri).is_some();
        if removed {
            self.registry.unregister(uri);
            debug!(uri = %uri, "Handler unregistered");
        }
        removed
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Returns the number of connections subscribed to `uri`.
    #[must_use]
    pub fn subscriber_count(&self, uri: &str) -> usize {
        self.handlers
            .lock()
            .get(uri)
            .map_or(0, |entry| entry.subscribers.len())
    }

    // ========================================================================
    // Session Table
    // ========================================================================

    /// Adds a connection to the session table.
    ///
    /// Re-adding the same id with a handle to the same writer is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] for an empty id, or
    /// [`Error::SessionConflict`] if the id is bound to a different
    /// connection.
    pub fn add_session(&self, id: ConnectionId, session: Session) -> Result<()> {
        if id.is_empty() {
            return Err(Error::precondition("session id must not be empty"));
        }

        {
            let mut sessions = self.sessions.lock();
            if let Some(existing) = sessions.get(&id) {
                if existing.same_handle(&session) {
                    return Ok(());
                }
                return Err(Error::session_conflict(id));
            }
            sessions.insert(id.clone(), session);
        }

        debug!(connection = %id, "Session added");
        self.notify(ServiceNotification::ClientConnected { id });
        Ok(())
    }

    /// Removes a connection from the session table.
    ///
    /// The id is also removed from every subscriber set, so a gone
    /// connection never lingers as a phantom subscriber. Returns `true` if
    /// the id was present.
    pub fn remove_session(&self, id: &ConnectionId) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            let mut handlers = self.handlers.lock();
            for entry in handlers.values_mut() {
                entry.subscribers.remove(id);
            }
            drop(handlers);

            debug!(connection = %id, "Session removed");
            self.notify(ServiceNotification::ClientDisconnected { id: id.clone() });
        }
        removed
    }

    /// Closes every session and empties the table and all subscriber sets.
    pub fn close_all_sessions(&self) {
        let drained: Vec<(ConnectionId, Session)> = self.sessions.lock().drain().collect();
        if drained.is_empty() {
            return;
        }

        for entry in self.handlers.lock().values_mut() {
            entry.subscribers.clear();
        }

        let count = drained.len();
        for (id, session) in drained {
            session.close();
            self.notify(ServiceNotification::ClientDisconnected { id });
        }
        debug!(count, "All sessions closed");
    }

    /// Returns the number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handles one inbound frame from `connection` and returns the reply
    /// frame to send back.
    ///
    /// Every inbound frame produces exactly one reply: a response for
    /// handled requests, an ack for subscribe/unsubscribe, or an error
    /// envelope naming what was wrong with the frame.
    pub async fn dispatch(&self, connection: &ConnectionId, raw: &str) -> String {
        let reply = self.dispatch_inner(connection, raw).await;
        match reply.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!(error = %err, "Failed to serialize reply");
                FALLBACK_ERROR_FRAME.to_owned()
            }
        }
    }

    async fn dispatch_inner(&self, connection: &ConnectionId, raw: &str) -> Envelope {
        let decoded = match self.registry.decode(raw) {
            Ok(decoded) => decoded,
            Err(Error::Json(err)) => {
                debug!(connection = %connection, error = %err, "Unparseable frame");
                return Envelope::error_reply(None, format!("Unsupported request: {raw}"));
            }
            Err(err) => {
                // The envelope parsed but its payload did not match the
                // endpoint's request type. Recover the id for the reply.
                debug!(connection = %connection, error = %err, "Request payload mismatch");
                let id = Envelope::from_json(raw).ok().and_then(|envelope| envelope.id);
                return Envelope::error_reply(id, "Invalid request");
            }
        };

        let (envelope, payload) = decoded.into_parts();
        let id = envelope.id.clone();

        if envelope.is_reply() {
            return Envelope::error_reply(id, format!("Unsupported request type: {}", envelope.kind));
        }

        let uri = envelope.uri.clone();
        let handler = {
            let handlers = self.handlers.lock();
            handlers.get(&uri).map(|entry| Arc::clone(&entry.handler))
        };
        let Some(handler) = handler else {
            return Envelope::error_reply(id, format!("Invalid request uri: {uri}"));
        };

        match envelope.kind {
            MessageType::Subscribe => {
                self.update_subscription(&uri, connection, true);
                Envelope::ack(id)
            }

            MessageType::Unsubscribe => {
                self.update_subscription(&uri, connection, false);
                Envelope::ack(id)
            }

            _ => {
                let context = RequestContext {
                    connection: connection.clone(),
                    call_id: id.clone().unwrap_or_default(),
                    kind: envelope.kind,
                };
                match handler(context, payload).await {
                    Ok(body) => Envelope::new(MessageType::Response, uri, id, Some(body)),
                    Err(err) => {
                        debug!(uri = %uri, error = %err, "Handler failed");
                        Envelope::error_reply(id, err.to_string())
                    }
                }
            }
        }
    }

    fn update_subscription(&self, uri: &str, connection: &ConnectionId, subscribe: bool) {
        let mut handlers = self.handlers.lock();
        let Some(entry) = handlers.get_mut(uri) else {
            return;
        };
        let changed = if subscribe {
            entry.subscribers.insert(connection.clone())
        } else {
            entry.subscribers.remove(connection)
        };
        if changed {
            debug!(uri = %uri, connection = %connection, subscribe, "Subscription updated");
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Sends `payload` to one connection as a server-initiated response.
    ///
    /// The endpoint uri is found by the payload type, so `T` must be the
    /// response type of exactly the endpoint to push on. Returns `Ok(false)`
    /// if the connection is unknown or the write failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] if no endpoint responds with `T`, or
    /// [`Error::Json`] if the payload fails to serialize.
    pub async fn send_to<T: Serialize + 'static>(
        &self,
        connection: &ConnectionId,
        payload: &T,
    ) -> Result<bool> {
        let uri = self.uri_for_response::<T>()?;
        let json = Envelope::response(uri.clone(), None, payload)?.to_json()?;

        let session = self.sessions.lock().get(connection).cloned();
        let Some(session) = session else {
            warn!(connection = %connection, uri = %uri, "No session for send");
            return Ok(false);
        };

        let delivered = session.send(json).await;
        if !delivered {
            warn!(connection = %connection, uri = %uri, "Delivery failed");
        }
        Ok(delivered)
    }

    /// Sends `payload` to every live connection, subscribed or not.
    ///
    /// Returns `Ok(true)` only if every delivery succeeded; trivially true
    /// with no connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] if no endpoint responds with `T`, or
    /// [`Error::Json`] if the payload fails to serialize.
    pub async fn broadcast<T: Serialize + 'static>(&self, payload: &T) -> Result<bool> {
        let uri = self.uri_for_response::<T>()?;
        let json = Envelope::response(uri, None, payload)?.to_json()?;

        let sessions: Vec<Session> = self.sessions.lock().values().cloned().collect();
        if sessions.is_empty() {
            return Ok(true);
        }

        let deliveries = sessions.iter().map(|session| session.send(json.clone()));
        let results = join_all(deliveries).await;
        Ok(results.into_iter().all(|delivered| delivered))
    }

    /// Publishes `payload` as an event to the endpoint's subscribers.
    ///
    /// Only connections that subscribed to the endpoint receive the event.
    /// Returns `Ok(true)` only if every subscriber was reachable and every
    /// delivery succeeded; trivially true with no subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] if no endpoint responds with `T`, or
    /// [`Error::Json`] if the payload fails to serialize.
    pub async fn publish_event<T: Serialize + 'static>(&self, payload: &T) -> Result<bool> {
        let uri = self.uri_for_response::<T>()?;
        let json = Envelope::event(uri.clone(), payload)?.to_json()?;

        let subscribers: Vec<ConnectionId> = {
            let handlers = self.handlers.lock();
            handlers
                .get(&uri)
                .map(|entry| entry.subscribers.iter().cloned().collect())
                .unwrap_or_default()
        };
        if subscribers.is_empty() {
            trace!(uri = %uri, "Event published with no subscribers");
            return Ok(true);
        }

        // A subscriber whose session is already gone counts as a failed
        // delivery; disconnect cascades keep this a transient race.
        let sessions: Vec<Option<Session>> = {
            let sessions = self.sessions.lock();
            subscribers
                .iter()
                .map(|id| sessions.get(id).cloned())
                .collect()
        };
        let live: Vec<Session> = sessions.iter().flatten().cloned().collect();
        let missing = sessions.len() - live.len();
        if missing > 0 {
            warn!(uri = %uri, missing, "Subscribers without live sessions");
        }

        let deliveries = live.iter().map(|session| session.send(json.clone()));
        let results = join_all(deliveries).await;
        let delivered = results.into_iter().all(|delivered| delivered);
        trace!(uri = %uri, subscribers = subscribers.len(), delivered, "Event published");
        Ok(missing == 0 && delivered)
    }

    /// Finds the endpoint uri whose response type is `T`.
    fn uri_for_response<T: 'static>(&self) -> Result<String> {
        let handlers = self.handlers.lock();
        handlers
            .iter()
            .find(|(_, entry)| entry.response_type == TypeId::of::<T>())
            .map(|(uri, _)| uri.clone())
            .ok_or_else(|| {
                Error::precondition(format!(
                    "no endpoint responds with {}",
                    any::type_name::<T>()
                ))
            })
    }

    fn notify(&self, notification: ServiceNotification) {
        if self.notify_tx.send(notification).is_err() {
            trace!("Service notification dropped: no listener");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::StreamExt;
    use serde::Deserialize;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::{Duration, sleep, timeout};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Progress {
        progress: f64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Status {
        status: String,
    }

    /// Registers an echo endpoint at `uri`: replies with the inbound
    /// progress, or 0.0 for payload-less requests.
    fn register_echo(service: &MessageService, uri: &str) {
        service
            .register_handler(uri, |_context, payload: Option<Progress>| async move {
                Ok(Progress {
                    progress: payload.map_or(0.0, |p| p.progress),
                })
            })
            .expect("register echo");
    }

    async fn session_pair() -> (
        Session,
        WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept tcp");
            tokio_tungstenite::accept_async(stream).await.expect("accept ws")
        });
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("connect");
        let server = accept.await.expect("join");

        let (write, _read) = server.split();
        (Session::spawn(write), client)
    }

    /// Reads the next text frame from the client side of a session pair.
    async fn next_text(client: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> String {
        timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("frame ok")
            .into_text()
            .expect("text frame")
            .to_string()
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "echo");
        let conn = ConnectionId::generate();

        let reply = service
            .dispatch(
                &conn,
                r#"{"uri":"echo","id":"abc12345","type":"request","payload":{"progress":0.25}}"#,
            )
            .await;
        assert_eq!(
            reply,
            r#"{"uri":"echo","id":"abc12345","type":"response","payload":{"progress":0.25}}"#
        );
    }

    #[tokio::test]
    async fn test_dispatch_passes_request_context() {
        let (service, _events) = MessageService::new();
        let seen: Arc<Mutex<Option<RequestContext>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        service
            .register_handler("echo", move |context, _payload: Option<Progress>| {
                let slot = Arc::clone(&slot);
                async move {
                    *slot.lock() = Some(context);
                    Ok(Progress { progress: 1.0 })
                }
            })
            .expect("register");

        let conn = ConnectionId::generate();
        service
            .dispatch(&conn, r#"{"uri":"echo","id":"abc12345","type":"request"}"#)
            .await;

        let context = seen.lock().take().expect("handler ran");
        assert_eq!(context.connection, conn);
        assert_eq!(context.call_id, CallId::from("abc12345"));
        assert_eq!(context.kind, MessageType::Request);
    }

    #[tokio::test]
    async fn test_dispatch_without_payload_passes_none() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "echo");
        let conn = ConnectionId::generate();

        let reply = service
            .dispatch(&conn, r#"{"uri":"echo","id":"cafe0001","type":"request"}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"uri":"echo","id":"cafe0001","type":"response","payload":{"progress":0.0}}"#
        );
    }

    #[tokio::test]
    async fn test_dispatch_without_id_replies_without_id() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "echo");
        let conn = ConnectionId::generate();

        let reply = service
            .dispatch(&conn, r#"{"uri":"echo","payload":{"progress":0.5}}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"uri":"echo","type":"response","payload":{"progress":0.5}}"#
        );
    }

    #[tokio::test]
    async fn test_dispatch_unparseable_frame() {
        let (service, _events) = MessageService::new();
        let conn = ConnectionId::generate();

        let reply = service.dispatch(&conn, "junk").await;
        assert_eq!(reply, r#"{"type":"error","error":"Unsupported request: junk"}"#);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_reply_frames() {
        let (service, _events) = MessageService::new();
        let conn = ConnectionId::generate();

        let reply = service
            .dispatch(&conn, r#"{"id":"aa","type":"response"}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"id":"aa","type":"error","error":"Unsupported request type: response"}"#
        );

        let reply = service
            .dispatch(&conn, r#"{"type":"error","error":"x"}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"type":"error","error":"Unsupported request type: error"}"#
        );
    }

    #[tokio::test]
    async fn test_dispatch_unknown_uri() {
        let (service, _events) = MessageService::new();
        let conn = ConnectionId::generate();

        let reply = service
            .dispatch(&conn, r#"{"uri":"nope","id":"cafe0001"}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"id":"cafe0001","type":"error","error":"Invalid request uri: nope"}"#
        );
    }

    #[tokio::test]
    async fn test_dispatch_payload_mismatch() {
        let (service, _events) = MessageService::new();
        service
            .register_handler("status", |_context, payload: Option<Status>| async move {
                Ok(payload.map_or_else(String::new, |s| s.status))
            })
            .expect("register");
        let conn = ConnectionId::generate();

        let reply = service
            .dispatch(
                &conn,
                r#"{"uri":"status","id":"cafe0002","type":"request","payload":{"progress":1}}"#,
            )
            .await;
        assert_eq!(reply, r#"{"id":"cafe0002","type":"error","error":"Invalid request"}"#);
    }

    #[tokio::test]
    async fn test_dispatch_handler_failure_becomes_error_envelope() {
        let (service, _events) = MessageService::new();
        service
            .register_handler("flaky", |_context, _payload: Option<Progress>| async move {
                Err::<Progress, _>(Error::handler("storage offline"))
            })
            .expect("register");
        let conn = ConnectionId::generate();

        let reply = service
            .dispatch(&conn, r#"{"uri":"flaky","id":"abc12345","type":"request"}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"id":"abc12345","type":"error","error":"Handler error: storage offline"}"#
        );
    }

    // ------------------------------------------------------------------------
    // Handler Registration
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_register_handler_replaces_and_keeps_subscribers() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "echo");
        let conn = ConnectionId::generate();

        service
            .dispatch(&conn, r#"{"uri":"echo","id":"sub00001","type":"subscribe"}"#)
            .await;
        assert_eq!(service.subscriber_count("echo"), 1);

        // Same shapes: replace in place.
        service
            .register_handler("echo", |_context, _payload: Option<Progress>| async move {
                Ok(Progress { progress: 9.0 })
            })
            .expect("replace");
        assert_eq!(service.subscriber_count("echo"), 1);
        assert_eq!(service.handler_count(), 1);

        let reply = service
            .dispatch(&conn, r#"{"uri":"echo","id":"abc12345","type":"request"}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"uri":"echo","id":"abc12345","type":"response","payload":{"progress":9.0}}"#
        );
    }

    #[tokio::test]
    async fn test_register_handler_conflicts() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "echo");

        // Different request type.
        let err = service
            .register_handler("echo", |_context, _payload: Option<Status>| async move {
                Ok(Progress { progress: 0.0 })
            })
            .expect_err("request shape conflict");
        assert!(err.is_conflict());

        // Same request type, different response type.
        let err = service
            .register_handler("echo", |_context, _payload: Option<Progress>| async move {
                Ok(Status {
                    status: "idle".to_string(),
                })
            })
            .expect_err("response shape conflict");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unregister_handler() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "echo");
        let conn = ConnectionId::generate();

        assert!(service.unregister_handler("echo"));
        assert!(!service.unregister_handler("echo"));

        let reply = service
            .dispatch(&conn, r#"{"uri":"echo","id":"cafe0003"}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"id":"cafe0003","type":"error","error":"Invalid request uri: echo"}"#
        );

        // The uri is fully released: a different shape may take it over.
        service
            .register_handler("echo", |_context, payload: Option<Status>| async move {
                Ok(payload.map_or_else(String::new, |s| s.status))
            })
            .expect("re-register with new shapes");
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_subscribe_unsubscribe_via_dispatch() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "echo");
        let conn = ConnectionId::generate();

        let ack = service
            .dispatch(&conn, r#"{"uri":"echo","id":"sub00001","type":"subscribe"}"#)
            .await;
        assert_eq!(ack, r#"{"id":"sub00001","type":"response"}"#);
        assert_eq!(service.subscriber_count("echo"), 1);

        // Subscribing twice is idempotent.
        service
            .dispatch(&conn, r#"{"uri":"echo","id":"sub00002","type":"subscribe"}"#)
            .await;
        assert_eq!(service.subscriber_count("echo"), 1);

        let ack = service
            .dispatch(&conn, r#"{"uri":"echo","id":"sub00003","type":"unsubscribe"}"#)
            .await;
        assert_eq!(ack, r#"{"id":"sub00003","type":"response"}"#);
        assert_eq!(service.subscriber_count("echo"), 0);

        // Unsubscribing when not subscribed still acks.
        let ack = service
            .dispatch(&conn, r#"{"uri":"echo","id":"sub00004","type":"unsubscribe"}"#)
            .await;
        assert_eq!(ack, r#"{"id":"sub00004","type":"response"}"#);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_uri_is_invalid() {
        let (service, _events) = MessageService::new();
        let conn = ConnectionId::generate();

        let reply = service
            .dispatch(&conn, r#"{"uri":"nope","id":"sub00001","type":"subscribe"}"#)
            .await;
        assert_eq!(
            reply,
            r#"{"id":"sub00001","type":"error","error":"Invalid request uri: nope"}"#
        );
    }

    // ------------------------------------------------------------------------
    // Session Table
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_add_session_rules() {
        let (service, mut events) = MessageService::new();
        let (session_a, _client_a) = session_pair().await;
        let (session_b, _client_b) = session_pair().await;
        let id = ConnectionId::generate();

        let err = service
            .add_session(ConnectionId::default(), session_a.clone())
            .expect_err("empty id");
        assert!(err.is_precondition());

        service.add_session(id.clone(), session_a.clone()).expect("add");
        assert_eq!(
            events.recv().await,
            Some(ServiceNotification::ClientConnected { id: id.clone() })
        );

        // Same id, same connection: benign no-op without a notification.
        service.add_session(id.clone(), session_a.clone()).expect("re-add");
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(service.session_count(), 1);

        // Same id, different connection: conflict.
        let err = service
            .add_session(id.clone(), session_b)
            .expect_err("conflicting session");
        assert!(matches!(err, Error::SessionConflict { .. }));
    }

    #[tokio::test]
    async fn test_remove_session_cascades_subscriptions() {
        let (service, mut events) = MessageService::new();
        register_echo(&service, "echo");
        let (session, _client) = session_pair().await;
        let conn = ConnectionId::generate();

        service.add_session(conn.clone(), session).expect("add");
        let _ = events.recv().await;
        service
            .dispatch(&conn, r#"{"uri":"echo","id":"sub00001","type":"subscribe"}"#)
            .await;
        assert_eq!(service.subscriber_count("echo"), 1);

        assert!(service.remove_session(&conn));
        assert_eq!(service.subscriber_count("echo"), 0);
        assert_eq!(service.session_count(), 0);
        assert_eq!(
            events.recv().await,
            Some(ServiceNotification::ClientDisconnected { id: conn.clone() })
        );

        assert!(!service.remove_session(&conn));
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_to_delivers_response_frame() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "build/progress");
        let (session, mut client) = session_pair().await;
        let conn = ConnectionId::generate();
        service.add_session(conn.clone(), session).expect("add");

        let delivered = service
            .send_to(&conn, &Progress { progress: 0.5 })
            .await
            .expect("send_to");
        assert!(delivered);

        assert_eq!(
            next_text(&mut client).await,
            r#"{"uri":"build/progress","type":"response","payload":{"progress":0.5}}"#
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_session_is_false() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "build/progress");

        let delivered = service
            .send_to(&ConnectionId::generate(), &Progress { progress: 0.5 })
            .await
            .expect("send_to");
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_send_to_unregistered_type_is_precondition() {
        let (service, _events) = MessageService::new();

        let err = service
            .send_to(&ConnectionId::generate(), &Progress { progress: 0.5 })
            .await
            .expect_err("no endpoint for type");
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "build/progress");
        let (session_a, mut client_a) = session_pair().await;
        let (session_b, mut client_b) = session_pair().await;
        service
            .add_session(ConnectionId::generate(), session_a)
            .expect("add a");
        service
            .add_session(ConnectionId::generate(), session_b)
            .expect("add b");

        let delivered = service
            .broadcast(&Progress { progress: 1.0 })
            .await
            .expect("broadcast");
        assert!(delivered);

        let expected = r#"{"uri":"build/progress","type":"response","payload":{"progress":1.0}}"#;
        assert_eq!(next_text(&mut client_a).await, expected);
        assert_eq!(next_text(&mut client_b).await, expected);
    }

    #[tokio::test]
    async fn test_broadcast_without_sessions_is_true() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "build/progress");

        let delivered = service
            .broadcast(&Progress { progress: 1.0 })
            .await
            .expect("broadcast");
        assert!(delivered);
    }

    #[tokio::test]
    async fn test_publish_event_reaches_subscribers_only() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "build/progress");
        let (session_a, mut client_a) = session_pair().await;
        let (session_b, mut client_b) = session_pair().await;
        let (session_c, mut client_c) = session_pair().await;
        let conn_a = ConnectionId::generate();
        let conn_b = ConnectionId::generate();
        let conn_c = ConnectionId::generate();
        service.add_session(conn_a.clone(), session_a).expect("add a");
        service.add_session(conn_b.clone(), session_b).expect("add b");
        service.add_session(conn_c.clone(), session_c).expect("add c");

        for conn in [&conn_a, &conn_b] {
            service
                .dispatch(conn, r#"{"uri":"build/progress","id":"sub00001","type":"subscribe"}"#)
                .await;
        }

        let delivered = service
            .publish_event(&Progress { progress: 1.0 })
            .await
            .expect("publish");
        assert!(delivered);

        let expected = r#"{"uri":"build/progress","type":"event","payload":{"progress":1.0}}"#;
        assert_eq!(next_text(&mut client_a).await, expected);
        assert_eq!(next_text(&mut client_b).await, expected);

        // The unsubscribed connection must stay silent.
        let silent = timeout(Duration::from_millis(200), client_c.next()).await;
        assert!(silent.is_err(), "unsubscribed connection received an event");
    }

    #[tokio::test]
    async fn test_publish_event_without_subscribers_is_true() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "build/progress");

        let delivered = service
            .publish_event(&Progress { progress: 1.0 })
            .await
            .expect("publish");
        assert!(delivered);
    }

    #[tokio::test]
    async fn test_publish_event_reports_failed_delivery() {
        let (service, _events) = MessageService::new();
        register_echo(&service, "build/progress");
        let (session, _client) = session_pair().await;
        let conn = ConnectionId::generate();
        service.add_session(conn.clone(), session.clone()).expect("add");
        service
            .dispatch(&conn, r#"{"uri":"build/progress","id":"sub00001","type":"subscribe"}"#)
            .await;

        // End the writer; the session stays in the table but cannot deliver.
        session.close();
        timeout(Duration::from_secs(5), async {
            while session.is_alive() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("writer ends");

        let delivered = service
            .publish_event(&Progress { progress: 1.0 })
            .await
            .expect("publish");
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_close_all_sessions() {
        let (service, mut events) = MessageService::new();
        register_echo(&service, "echo");
        let (session_a, _client_a) = session_pair().await;
        let (session_b, _client_b) = session_pair().await;
        let conn_a = ConnectionId::generate();
        let conn_b = ConnectionId::generate();
        service.add_session(conn_a.clone(), session_a).expect("add a");
        service.add_session(conn_b.clone(), session_b).expect("add b");
        service
            .dispatch(&conn_a, r#"{"uri":"echo","id":"sub00001","type":"subscribe"}"#)
            .await;

        service.close_all_sessions();
        assert_eq!(service.session_count(), 0);
        assert_eq!(service.subscriber_count("echo"), 0);

        let mut disconnected = 0;
        while let Ok(notification) = events.try_recv() {
            if matches!(notification, ServiceNotification::ClientDisconnected { .. }) {
                disconnected += 1;
            }
        }
        assert_eq!(disconnected, 2);
    }
}
