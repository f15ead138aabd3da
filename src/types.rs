//! Core types shared by the framing, dispatch and transport layers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Byte that opens every frame on the wire.
pub const FRAME_START: u8 = b'-';

/// Byte that closes every frame on the wire.
pub const FRAME_END: u8 = b'.';

/// Emitted by a connection exactly once when it is torn down.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Listeners registered under this name receive every emitted event.
pub const WILDCARD_EVENT: &str = "*";

/// Server event carrying a newly accepted connection.
pub const CONNECTION_EVENT: &str = "connection";

/// Server event carrying a connection that just left the client set.
pub const DISCONNECTION_EVENT: &str = "disconnection";

/// Server event emitted once when the server is destroyed.
pub const DESTROY_EVENT: &str = "destroy";

/// Returns true for names only the local lifecycle logic may emit.
///
/// A remote peer can put any string in a frame, so the receive path drops
/// packets carrying one of these names.
pub fn is_reserved_event(name: &str) -> bool {
    name == DISCONNECT_EVENT || name == WILDCARD_EVENT
}

/// Payload carried by a connection event.
pub type Payload = Option<Bytes>;

/// A decoded application packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub event_type: String,
    pub payload: Payload,
}

impl Packet {
    /// Create a new packet
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Create a packet without payload
    pub fn signal(event_type: impl Into<String>) -> Self {
        Self::new(event_type, None)
    }

    /// Deserialize the payload as JSON.
    ///
    /// Returns `Ok(None)` when the packet has no payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        decode_json(&self.payload)
    }
}

pub(crate) fn decode_json<T: DeserializeOwned>(payload: &Payload) -> Result<Option<T>> {
    match payload {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        None => Ok(None),
    }
}

/// Process-unique identifier of a connection.
///
/// Peer addresses repeat across reconnects, so the server tracks clients by
/// this id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a frame body could not be turned into a packet.
///
/// Malformed frames are dropped by the receive path and never surface to
/// the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedFrame {
    #[error("frame body is not valid base64")]
    Encoding,
    #[error("frame body does not hold a valid envelope")]
    Envelope,
    #[error("envelope data field is not valid base64")]
    Payload,
}

/// Error types for eventsock operations
#[derive(Debug, Error)]
pub enum EventSockError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Server destroyed")]
    ServerDestroyed,
    #[error("Server is already listening")]
    AlreadyListening,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type alias using EventSockError.
pub type Result<T> = std::result::Result<T, EventSockError>;
