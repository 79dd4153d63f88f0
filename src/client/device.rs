//! Pairing target description.
//!
//! A [`Device`] names the remote peer a client attaches to: an address, a
//! base port and the pairing key issued by the last successful handshake.
//! Devices are plain serializable data so callers can persist them between
//! runs; the stored key is what turns a reconnect into a silent re-pair
//! instead of a fresh approval prompt.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default base port for the plaintext endpoint.
///
/// The secure endpoint listens one above the base port.
pub const DEFAULT_PORT: u16 = 13000;

// ============================================================================
// Device
// ============================================================================

/// A remote peer the client can attach to and pair with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    /// Host name, preferred for addressing when non-empty.
    pub host_name: String,

    /// IP address, used when no host name is set.
    pub ip_address: String,

    /// Base (plaintext) port; the secure endpoint is `port + 1`.
    pub port: u16,

    /// Key issued by the last successful pairing, empty before first
    /// contact. Updated by the client whenever the server issues a new key.
    pub pairing_key: String,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            ip_address: String::new(),
            port: DEFAULT_PORT,
            pairing_key: String::new(),
        }
    }
}

impl Device {
    /// Creates a device addressed by host name.
    #[must_use]
    pub fn new(host_name: impl Into<String>, port: u16) -> Self {
        Self {
            host_name: host_name.into(),
            port,
            ..Self::default()
        }
    }

    /// Returns the address to dial: the host name when set, otherwise the
    /// IP address.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &str {
        if self.host_name.is_empty() {
            &self.ip_address
        } else {
            &self.host_name
        }
    }

    /// Returns the secure WebSocket URL (`wss://address:port+1`).
    #[must_use]
    pub fn secure_url(&self) -> String {
        format!("wss://{}:{}", self.address(), self.port.saturating_add(1))
    }

    /// Returns the plaintext WebSocket URL (`ws://address:port`).
    #[must_use]
    pub fn plain_url(&self) -> String {
        format!("ws://{}:{}", self.address(), self.port)
    }

    /// Returns `true` if both devices dial the same endpoint.
    ///
    /// Pairing keys are deliberately not compared: the key changes over the
    /// device's life, the endpoint is its identity.
    #[inline]
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        self.address() == other.address() && self.port == other.port
    }
}

// ============================================================================
// Tests
// ============================================================================
