//! Payload type registry.
//!
//! Endpoints and in-flight calls register the Rust type their payloads
//! decode into; inbound frames are then typed by looking the key up (the
//! endpoint uri for requests and events, the call id for replies).
//! There is no reflection and no payload sniffing: a key either has a
//! registered shape or its payload stays untyped.
//!
//! Key lifetimes differ by direction:
//!
//! - response shapes live under the *call id*, inserted when the call is
//!   sent and removed when it resolves or times out;
//! - event shapes live under the *endpoint uri* for the connection's
//!   lifetime;
//! - server request shapes live under the uri for the handler's lifetime.

// ============================================================================
// Imports
// ============================================================================

use std::any::{self, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;

use crate::error::{Error, Result};
use crate::ids::CallId;
use crate::message::envelope::Envelope;

// ============================================================================
// PayloadShape
// ============================================================================

/// Type-erased decoder for one registered payload type.
type DecodeFn = Arc<dyn Fn(&RawValue) -> serde_json::Result<BoxedPayload> + Send + Sync>;

/// A decoded payload with its concrete type erased.
///
/// Downcast back to the registered type with [`Box::downcast`].
pub type BoxedPayload = Box<dyn Any + Send>;

/// The decode recipe registered under a key.
///
/// Carries the target's [`TypeId`] so conflicting registrations are caught
/// at registration time rather than as garbled decodes later.
#[derive(Clone)]
pub struct PayloadShape {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl PayloadShape {
    /// Builds the shape for payload type `T`.
    #[must_use]
    pub fn of<T: DeserializeOwned + Send + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: any::type_name::<T>(),
            decode: Arc::new(|raw| {
                serde_json::from_str::<T>(raw.get()).map(|value| Box::new(value) as BoxedPayload)
            }),
        }
    }

    /// Returns the registered type's name, for diagnostics.
    #[inline]
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns `true` if this shape decodes into `T`.
    #[inline]
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Returns `true` if both shapes decode into the same type.
    #[inline]
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }

    /// Decodes a raw payload into the registered type.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error if the payload does not match.
    #[inline]
    pub fn decode(&self, raw: &RawValue) -> serde_json::Result<BoxedPayload> {
        (self.decode)(raw)
    }
}

impl fmt::Debug for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadShape")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Decoded
// ============================================================================

/// Outcome of decoding one inbound frame.
pub enum Decoded {
    /// No shape was registered for the frame's key, or the frame carried no
    /// payload. The payload (if any) has been dropped: unknown bytes are
    /// never handed to callers.
    Untyped(Envelope),

    /// The payload matched the registered shape. The envelope keeps the raw
    /// payload text so fan-out paths can re-decode per consumer.
    Typed {
        /// The decoded envelope, raw payload still attached.
        envelope: Envelope,
        /// The typed payload, erased; downcast to the registered type.
        payload: BoxedPayload,
    },
}

impl Decoded {
    /// Returns the decoded envelope.
    #[inline]
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Untyped(envelope) | Self::Typed { envelope, .. } => envelope,
        }
    }

    /// Splits into the envelope and the typed payload, if any.
    #[inline]
    #[must_use]
    pub fn into_parts(self) -> (Envelope, Option<BoxedPayload>) {
        match self {
            Self::Untyped(envelope) => (envelope, None),
            Self::Typed { envelope, payload } => (envelope, Some(payload)),
        }
    }

    /// Returns `true` if the payload was typed.
    #[inline]
    #[must_use]
    pub fn is_typed(&self) -> bool {
        matches!(self, Self::Typed { .. })
    }
}

impl fmt::Debug for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Untyped(envelope) => f.debug_tuple("Untyped").field(envelope).finish(),
            Self::Typed { envelope, .. } => f
                .debug_struct("Typed")
                .field("envelope", envelope)
                .finish_non_exhaustive(),
        }
    }
}

// ============================================================================
// PayloadRegistry
// ============================================================================

/// Key → payload shape table with conflict detection.
///
/// Thread-safe; every operation takes the internal lock briefly and never
/// holds it across decoding.
#[derive(Debug, Default)]
pub struct PayloadRegistry {
    shapes: Mutex<FxHashMap<String, PayloadShape>>,
}

impl PayloadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers payload type `T` under `key`.
    ///
    /// Re-registering the same type under the same key is a no-op, so
    /// concurrent callers agreeing on a shape never race into errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeConflict`] if the key is already bound to a
    /// different type.
    pub fn register<T: DeserializeOwned + Send + 'static>(
        &self,
        key: impl Into<String>,
    ) -> Result<()> {
        self.register_shape(key, PayloadShape::of::<T>())
    }

    /// Registers a pre-built shape under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeConflict`] if the key is already bound to a
    /// different type.
    pub fn register_shape(&self, key: impl Into<String>, shape: PayloadShape) -> Result<()> {
        let key = key.into();
        let mut shapes = self.shapes.lock();
        if let Some(existing) = shapes.get(&key) {
            if existing.same_shape(&shape) {
                return Ok(());
            }
            return Err(Error::shape_conflict(
                key,
                existing.type_name(),
                shape.type_name(),
            ));
        }
        shapes.insert(key, shape);
        Ok(())
    }

    /// Removes the shape under `key`, returning `true` if one was present.
    pub fn unregister(&self, key: &str) -> bool {
        self.shapes.lock().remove(key).is_some()
    }

    /// Returns the shape registered under `key`, if any.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<PayloadShape> {
        self.shapes.lock().get(key).cloned()
    }

    /// Returns `true` if a shape is registered under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.shapes.lock().contains_key(key)
    }

    /// Removes every registered shape.
    pub fn clear(&self) {
        self.shapes.lock().clear();
    }

    /// Returns the number of registered shapes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shapes.lock().len()
    }

    /// Returns `true` if no shapes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shapes.lock().is_empty()
    }

    /// Parses a frame and types its payload from the registered shapes.
    ///
    /// Replies (`response`/`error`) resolve their shape by call id, all
    /// other frames by endpoint uri. An unknown key or an absent payload
    /// yields [`Decoded::Untyped`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the text is not a valid envelope, or
    /// [`Error::Protocol`] if a payload is present under a known key but
    /// does not match the registered type.
    pub fn decode(&self, text: &str) -> Result<Decoded> {
        let mut envelope = Envelope::from_json(text)?;

        let key = if envelope.is_reply() {
            envelope
                .id
                .as_ref()
                .map(CallId::as_str)
                .unwrap_or_default()
                .to_owned()
        } else {
            envelope.uri.clone()
        };

        let Some(shape) = self.resolve(&key) else {
            envelope.payload = None;
            return Ok(Decoded::Untyped(envelope));
        };
        let Some(raw) = envelope.payload.take() else {
            return Ok(Decoded::Untyped(envelope));
        };

        match shape.decode(&raw) {
            Ok(payload) => {
                envelope.payload = Some(raw);
                Ok(Decoded::Typed { envelope, payload })
            }
            Err(err) => Err(Error::protocol(format!(
                "payload for '{key}' does not match {}: {err}",
                shape.type_name()
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
