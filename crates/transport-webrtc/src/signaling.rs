use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use peer_transport::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Session description exchanged during negotiation. Candidates are
/// gathered up front, so no trickle messages exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub from: PeerId,
    pub to: PeerId,
    /// Ties an answer back to the dial that produced the offer.
    pub connection_id: String,
    pub signal: Signal,
}

pub type SignalInbox = mpsc::UnboundedReceiver<SignalEnvelope>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("peer {0} is not registered")]
    UnknownPeer(PeerId),
    #[error("peer id {0} already taken")]
    Taken(PeerId),
    #[error("signaling service unavailable")]
    Unavailable,
}

/// Rendezvous service peers register with to exchange session descriptions.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Claims `requested` or a fresh id and returns the inbox for signals
    /// addressed to it.
    async fn register(
        &self,
        requested: Option<PeerId>,
    ) -> Result<(PeerId, SignalInbox), SignalingError>;
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
    async fn unregister(&self, peer: &PeerId);
}

/// In-process broker; every transport sharing one instance can reach the others.
#[derive(Clone, Default)]
pub struct LocalSignaling {
    peers: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<SignalEnvelope>>>>,
}

impl LocalSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }
}

#[async_trait]
impl Signaling for LocalSignaling {
    async fn register(
        &self,
        requested: Option<PeerId>,
    ) -> Result<(PeerId, SignalInbox), SignalingError> {
        let peer = requested.unwrap_or_else(PeerId::random);
        let mut peers = self.peers.write();
        if peers.contains_key(&peer) {
            return Err(SignalingError::Taken(peer));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(peer.clone(), tx);
        trace!(target = "transport_webrtc::signaling", %peer, "peer registered");
        Ok((peer, rx))
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let peers = self.peers.read();
        let inbox = peers
            .get(&envelope.to)
            .ok_or_else(|| SignalingError::UnknownPeer(envelope.to.clone()))?;
        trace!(
            target = "transport_webrtc::signaling",
            from = %envelope.from,
            to = %envelope.to,
            connection_id = %envelope.connection_id,
            "relaying signal"
        );
        inbox
            .send(envelope.clone())
            .map_err(|_| SignalingError::UnknownPeer(envelope.to))
    }

    async fn unregister(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }
}
