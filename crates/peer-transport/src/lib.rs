use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

mod local;

pub use local::{LocalSwitchboard, LocalTransport};

/// Identifier a peer is reachable under once registered with signaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Process-unique id for one data channel to one remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_endpoint_id() -> EndpointId {
    EndpointId(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Notifications a transport delivers after `open`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Signaling accepted us; the local peer id is now known.
    Registered { peer_id: PeerId },
    /// A remote party dialed us and its channel is open.
    Incoming { endpoint: EndpointId, remote: PeerId },
    /// A channel we dialed finished negotiating.
    Opened { endpoint: EndpointId },
    Message { endpoint: EndpointId, payload: Bytes },
    /// Graceful close and network loss look the same at this level.
    Closed { endpoint: EndpointId },
    Error {
        endpoint: Option<EndpointId>,
        message: String,
    },
    /// Lost the signaling registration; every endpoint is gone with it.
    Disconnected,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not registered with signaling")]
    NotRegistered,
    #[error("transport already opened")]
    AlreadyOpen,
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("peer {0} unavailable")]
    PeerUnavailable(PeerId),
    #[error("transport channel closed")]
    Closed,
    #[error("transport setup failed: {0}")]
    Setup(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Peer-to-peer message transport with asynchronous registration and dialing.
///
/// Calls return immediately; their effects arrive later as
/// [`TransportEvent`]s on the sender handed to [`PeerTransport::open`].
/// Delivery is ordered per endpoint.
pub trait PeerTransport: Send + Sync {
    fn open(&self, events: EventSender) -> TransportResult<()>;
    fn connect(&self, target: &PeerId) -> TransportResult<EndpointId>;
    fn send(&self, endpoint: EndpointId, payload: Bytes) -> TransportResult<()>;
    fn close(&self, endpoint: EndpointId);
    fn shutdown(&self);
    fn kind(&self) -> &'static str;
}
