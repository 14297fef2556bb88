use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{
    EndpointId, EventSender, PeerId, PeerTransport, TransportError, TransportEvent,
    TransportResult, next_endpoint_id,
};

/// In-memory signaling plus data plane for tests and single-process demos.
#[derive(Clone, Default)]
pub struct LocalSwitchboard {
    inner: Arc<RwLock<Registry>>,
}

#[derive(Default)]
struct Registry {
    peers: HashMap<PeerId, EventSender>,
    routes: HashMap<EndpointId, Route>,
    partitioned: HashSet<PeerId>,
}

#[derive(Clone)]
struct Route {
    owner: PeerId,
    counterpart: EndpointId,
}

impl Registry {
    fn notify(&self, peer: &PeerId, event: TransportEvent) -> bool {
        self.peers
            .get(peer)
            .map(|events| events.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Tears down both halves of a channel and tells each owner.
    fn unlink(&mut self, endpoint: EndpointId) -> bool {
        let Some(route) = self.routes.remove(&endpoint) else {
            return false;
        };
        let other = self.routes.remove(&route.counterpart);
        self.notify(&route.owner, TransportEvent::Closed { endpoint });
        if let Some(other) = other {
            self.notify(
                &other.owner,
                TransportEvent::Closed {
                    endpoint: route.counterpart,
                },
            );
        }
        true
    }
}

impl LocalSwitchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that registers under a fresh random id.
    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            board: self.clone(),
            requested_id: None,
            local: Mutex::new(None),
        }
    }

    /// A transport that registers under a fixed id, e.g. one scanned from a link.
    pub fn transport_with_id(&self, id: impl Into<PeerId>) -> LocalTransport {
        LocalTransport {
            board: self.clone(),
            requested_id: Some(id.into()),
            local: Mutex::new(None),
        }
    }

    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.inner.read().peers.contains_key(peer)
    }

    /// Makes dials to `peer` vanish without any event, like an unreachable NAT.
    pub fn partition(&self, peer: &PeerId) {
        self.inner.write().partitioned.insert(peer.clone());
    }

    pub fn heal(&self, peer: &PeerId) {
        self.inner.write().partitioned.remove(peer);
    }

    /// Drops a live channel as a network failure would: both sides see `Closed`.
    pub fn sever(&self, endpoint: EndpointId) -> bool {
        let severed = self.inner.write().unlink(endpoint);
        if severed {
            debug!(target = "peer_transport::local", %endpoint, "channel severed");
        }
        severed
    }

    pub fn open_channels(&self) -> usize {
        self.inner.read().routes.len() / 2
    }
}

pub struct LocalTransport {
    board: LocalSwitchboard,
    requested_id: Option<PeerId>,
    local: Mutex<Option<PeerId>>,
}

impl LocalTransport {
    pub fn local_id(&self) -> Option<PeerId> {
        self.local.lock().clone()
    }

    fn registered_id(&self) -> TransportResult<PeerId> {
        self.local_id().ok_or(TransportError::NotRegistered)
    }
}

impl PeerTransport for LocalTransport {
    fn open(&self, events: EventSender) -> TransportResult<()> {
        let mut local = self.local.lock();
        if local.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        let peer_id = self.requested_id.clone().unwrap_or_else(PeerId::random);
        {
            let mut registry = self.board.inner.write();
            if registry.peers.contains_key(&peer_id) {
                return Err(TransportError::Setup(format!(
                    "peer id {peer_id} already registered"
                )));
            }
            registry.peers.insert(peer_id.clone(), events.clone());
        }
        *local = Some(peer_id.clone());
        debug!(target = "peer_transport::local", peer = %peer_id, "registered");
        events
            .send(TransportEvent::Registered { peer_id })
            .map_err(|_| TransportError::Closed)
    }

    fn connect(&self, target: &PeerId) -> TransportResult<EndpointId> {
        let local = self.registered_id()?;
        let endpoint = next_endpoint_id();
        let mut registry = self.board.inner.write();

        if registry.partitioned.contains(target) {
            trace!(target = "peer_transport::local", %endpoint, peer = %target, "dial swallowed by partition");
            return Ok(endpoint);
        }
        if !registry.peers.contains_key(target) {
            registry.notify(
                &local,
                TransportEvent::Error {
                    endpoint: Some(endpoint),
                    message: TransportError::PeerUnavailable(target.clone()).to_string(),
                },
            );
            return Ok(endpoint);
        }

        let remote_endpoint = next_endpoint_id();
        registry.routes.insert(
            endpoint,
            Route {
                owner: local.clone(),
                counterpart: remote_endpoint,
            },
        );
        registry.routes.insert(
            remote_endpoint,
            Route {
                owner: target.clone(),
                counterpart: endpoint,
            },
        );
        registry.notify(
            target,
            TransportEvent::Incoming {
                endpoint: remote_endpoint,
                remote: local.clone(),
            },
        );
        registry.notify(&local, TransportEvent::Opened { endpoint });
        debug!(
            target = "peer_transport::local",
            %endpoint,
            %remote_endpoint,
            from = %local,
            to = %target,
            "channel established"
        );
        Ok(endpoint)
    }

    fn send(&self, endpoint: EndpointId, payload: Bytes) -> TransportResult<()> {
        let registry = self.board.inner.read();
        let route = registry
            .routes
            .get(&endpoint)
            .ok_or(TransportError::UnknownEndpoint(endpoint))?;
        let receiver = registry
            .routes
            .get(&route.counterpart)
            .ok_or(TransportError::Closed)?;
        let delivered = registry.notify(
            &receiver.owner,
            TransportEvent::Message {
                endpoint: route.counterpart,
                payload,
            },
        );
        if delivered {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn close(&self, endpoint: EndpointId) {
        self.board.inner.write().unlink(endpoint);
    }

    fn shutdown(&self) {
        let Some(local) = self.local.lock().take() else {
            return;
        };
        let mut registry = self.board.inner.write();
        let owned: Vec<EndpointId> = registry
            .routes
            .iter()
            .filter(|(_, route)| route.owner == local)
            .map(|(endpoint, _)| *endpoint)
            .collect();
        for endpoint in owned {
            registry.unlink(endpoint);
        }
        registry.notify(&local, TransportEvent::Disconnected);
        registry.peers.remove(&local);
        debug!(target = "peer_transport::local", peer = %local, "unregistered");
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
