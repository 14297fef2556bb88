//! Connection lifecycle over a [`PeerTransport`].
//!
//! A link registers with signaling (`Idle -> Negotiating -> Open`), then
//! accepts inbound endpoints or dials outbound ones. Transport events are
//! drained by one task per link, so every state change is applied by a
//! single writer in the order the transport reported it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use peer_transport::{
    EndpointId, EventReceiver, PeerId, PeerTransport, TransportError, TransportEvent,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uplink_proto::{Envelope, encode};

use crate::router::DataChannelRouter;

const TARGET: &str = "uplink::link";

/// How many finished endpoints keep answering `endpoint_state`.
const CLOSED_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Open,
    Closed,
}

/// Why an endpoint ended up closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Never reached `Open`: the dial timed out or the transport refused it.
    DialFailed,
    /// Was open, then the channel closed or the network went away.
    Dropped,
    /// Closed by this side.
    LocalClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Negotiating,
    Open,
    Closed(CloseReason),
}

impl EndpointState {
    pub fn connection_state(self) -> ConnectionState {
        match self {
            EndpointState::Negotiating => ConnectionState::Negotiating,
            EndpointState::Open => ConnectionState::Open,
            EndpointState::Closed(_) => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One data channel to one remote party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHandle {
    id: EndpointId,
    remote: PeerId,
    direction: Direction,
}

impl EndpointHandle {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The endpoint was not open (or vanished mid-send); nothing went out.
    Skipped,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link has no local identifier yet")]
    NotRegistered,
    #[error("no tokio runtime available to drive the link")]
    NoRuntime,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub messages_in: u64,
    pub messages_out: u64,
    pub sends_skipped: u64,
    pub endpoints_attached: u64,
    pub endpoints_opened: u64,
    pub endpoints_closed: u64,
    pub dials_failed: u64,
}

#[derive(Default)]
struct Counters {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    sends_skipped: AtomicU64,
    endpoints_attached: AtomicU64,
    endpoints_opened: AtomicU64,
    endpoints_closed: AtomicU64,
    dials_failed: AtomicU64,
}

type EndpointCallback = Arc<dyn Fn(&EndpointHandle) + Send + Sync>;
type ClosedCallback = Arc<dyn Fn(&EndpointHandle, CloseReason) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    attached: Vec<EndpointCallback>,
    opened: Vec<EndpointCallback>,
    closed: Vec<ClosedCallback>,
}

struct Endpoint {
    handle: EndpointHandle,
    state: EndpointState,
    dial_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct LinkInner {
    local: Option<PeerId>,
    endpoints: HashMap<EndpointId, Endpoint>,
    /// Most recent last, capped at `CLOSED_HISTORY`.
    closed: VecDeque<(EndpointId, CloseReason)>,
    pump: Option<JoinHandle<()>>,
}

pub struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    router: Arc<DataChannelRouter>,
    dial_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<LinkInner>,
    callbacks: RwLock<Callbacks>,
    counters: Counters,
    this: Weak<PeerLink>,
}

impl PeerLink {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        router: Arc<DataChannelRouter>,
        dial_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new_cyclic(|this| Self {
            transport,
            router,
            dial_timeout,
            state,
            inner: Mutex::new(LinkInner::default()),
            callbacks: RwLock::new(Callbacks::default()),
            counters: Counters::default(),
            this: this.clone(),
        })
    }

    /// Starts registering with signaling. No-op while negotiating or open;
    /// a closed link registers afresh.
    pub fn open(&self) -> Result<(), LinkError> {
        let runtime = Handle::try_current().map_err(|_| LinkError::NoRuntime)?;
        let mut inner = self.inner.lock();
        let current = self.connection_state();
        if matches!(current, ConnectionState::Negotiating | ConnectionState::Open) {
            return Ok(());
        }
        if let Some(previous) = inner.pump.take() {
            previous.abort();
        }
        if current == ConnectionState::Closed {
            self.transport.shutdown();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.set_state(ConnectionState::Negotiating);
        if let Err(err) = self.transport.open(tx) {
            warn!(target = TARGET, transport = self.transport.kind(), error = %err, "transport open failed");
            self.set_state(ConnectionState::Closed);
            return Err(err.into());
        }
        inner.pump = Some(runtime.spawn(run_event_pump(self.this.clone(), rx)));
        info!(target = TARGET, transport = self.transport.kind(), "link opening");
        Ok(())
    }

    /// Dials `target`. The handle starts `Negotiating`; if it has not opened
    /// within the dial timeout it closes with [`CloseReason::DialFailed`].
    pub fn dial(&self, target: &PeerId) -> Result<EndpointHandle, LinkError> {
        // Held across connect so the pump cannot see this endpoint's events
        // before it is tracked.
        let mut inner = self.inner.lock();
        if inner.local.is_none() {
            return Err(LinkError::NotRegistered);
        }
        let endpoint = self.transport.connect(target)?;
        let handle = EndpointHandle {
            id: endpoint,
            remote: target.clone(),
            direction: Direction::Outbound,
        };
        inner.endpoints.insert(
            endpoint,
            Endpoint {
                handle: handle.clone(),
                state: EndpointState::Negotiating,
                dial_timer: self.arm_dial_timer(endpoint),
            },
        );
        info!(
            target = TARGET,
            %endpoint,
            peer = %target,
            timeout_ms = self.dial_timeout.as_millis() as u64,
            "dialing"
        );
        Ok(handle)
    }

    pub fn on_endpoint_attached<F>(&self, callback: F)
    where
        F: Fn(&EndpointHandle) + Send + Sync + 'static,
    {
        self.callbacks.write().attached.push(Arc::new(callback));
    }

    pub fn on_endpoint_opened<F>(&self, callback: F)
    where
        F: Fn(&EndpointHandle) + Send + Sync + 'static,
    {
        self.callbacks.write().opened.push(Arc::new(callback));
    }

    pub fn on_endpoint_closed<F>(&self, callback: F)
    where
        F: Fn(&EndpointHandle, CloseReason) + Send + Sync + 'static,
    {
        self.callbacks.write().closed.push(Arc::new(callback));
    }

    /// Fire-and-forget send. Never blocks and never errors; anything but an
    /// open endpoint yields [`SendOutcome::Skipped`].
    pub fn send(&self, endpoint: EndpointId, payload: Bytes) -> SendOutcome {
        if self.endpoint_state(endpoint) != Some(EndpointState::Open) {
            self.counters.sends_skipped.fetch_add(1, Ordering::Relaxed);
            trace!(target = TARGET, %endpoint, "send skipped; endpoint not open");
            return SendOutcome::Skipped;
        }
        match self.transport.send(endpoint, payload) {
            Ok(()) => {
                self.counters.messages_out.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(err) => {
                self.counters.sends_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(target = TARGET, %endpoint, error = %err, "transport send failed");
                SendOutcome::Skipped
            }
        }
    }

    pub fn send_envelope(&self, endpoint: EndpointId, envelope: &Envelope) -> SendOutcome {
        match encode(envelope) {
            Ok(bytes) => self.send(endpoint, Bytes::from(bytes)),
            Err(err) => {
                warn!(target = TARGET, %endpoint, error = %err, "failed to encode envelope");
                SendOutcome::Skipped
            }
        }
    }

    /// Sends to every open endpoint; returns how many sends went out.
    pub fn broadcast(&self, payload: Bytes) -> usize {
        self.open_endpoints()
            .into_iter()
            .filter(|handle| self.send(handle.id, payload.clone()) == SendOutcome::Sent)
            .count()
    }

    pub fn broadcast_envelope(&self, envelope: &Envelope) -> usize {
        match encode(envelope) {
            Ok(bytes) => self.broadcast(Bytes::from(bytes)),
            Err(err) => {
                warn!(target = TARGET, error = %err, "failed to encode envelope");
                0
            }
        }
    }

    pub fn close_endpoint(&self, endpoint: EndpointId) -> bool {
        if self.finish(endpoint, Some(CloseReason::LocalClose)) {
            self.transport.close(endpoint);
            true
        } else {
            false
        }
    }

    /// Page unload: closes every endpoint and drops the signaling registration.
    pub fn shutdown(&self) {
        let (pump, endpoints) = {
            let mut inner = self.inner.lock();
            inner.local = None;
            let endpoints: Vec<EndpointId> = inner.endpoints.keys().copied().collect();
            (inner.pump.take(), endpoints)
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        for endpoint in endpoints {
            self.finish(endpoint, Some(CloseReason::LocalClose));
        }
        self.transport.shutdown();
        self.set_state(ConnectionState::Closed);
        info!(target = TARGET, "link shut down");
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn local_identifier(&self) -> Option<PeerId> {
        self.inner.lock().local.clone()
    }

    pub fn endpoint_state(&self, endpoint: EndpointId) -> Option<EndpointState> {
        let inner = self.inner.lock();
        inner
            .endpoints
            .get(&endpoint)
            .map(|entry| entry.state)
            .or_else(|| {
                inner
                    .closed
                    .iter()
                    .find(|(id, _)| *id == endpoint)
                    .map(|(_, reason)| EndpointState::Closed(*reason))
            })
    }

    /// Live (negotiating or open) endpoints, oldest first.
    pub fn endpoints(&self) -> Vec<EndpointHandle> {
        let mut handles: Vec<EndpointHandle> = self
            .inner
            .lock()
            .endpoints
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        handles.sort_by_key(|handle| handle.id);
        handles
    }

    pub fn open_endpoints(&self) -> Vec<EndpointHandle> {
        let mut handles: Vec<EndpointHandle> = self
            .inner
            .lock()
            .endpoints
            .values()
            .filter(|entry| entry.state == EndpointState::Open)
            .map(|entry| entry.handle.clone())
            .collect();
        handles.sort_by_key(|handle| handle.id);
        handles
    }

    pub fn router(&self) -> &Arc<DataChannelRouter> {
        &self.router
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            messages_in: self.counters.messages_in.load(Ordering::Relaxed),
            messages_out: self.counters.messages_out.load(Ordering::Relaxed),
            sends_skipped: self.counters.sends_skipped.load(Ordering::Relaxed),
            endpoints_attached: self.counters.endpoints_attached.load(Ordering::Relaxed),
            endpoints_opened: self.counters.endpoints_opened.load(Ordering::Relaxed),
            endpoints_closed: self.counters.endpoints_closed.load(Ordering::Relaxed),
            dials_failed: self.counters.dials_failed.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(target = TARGET, state = ?next, "link state changed");
        }
    }

    fn arm_dial_timer(&self, endpoint: EndpointId) -> Option<JoinHandle<()>> {
        let runtime = Handle::try_current().ok()?;
        let link = self.this.clone();
        let timeout = self.dial_timeout;
        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(link) = link.upgrade() {
                link.on_dial_timeout(endpoint);
            }
        }))
    }

    fn on_dial_timeout(&self, endpoint: EndpointId) {
        if self.endpoint_state(endpoint) != Some(EndpointState::Negotiating) {
            return;
        }
        warn!(
            target = TARGET,
            %endpoint,
            timeout_ms = self.dial_timeout.as_millis() as u64,
            "dial timed out"
        );
        self.finish(endpoint, Some(CloseReason::DialFailed));
        self.transport.close(endpoint);
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Registered { peer_id } => {
                self.inner.lock().local = Some(peer_id.clone());
                info!(target = TARGET, peer = %peer_id, "registered with signaling");
                self.set_state(ConnectionState::Open);
            }
            TransportEvent::Incoming { endpoint, remote } => {
                let handle = EndpointHandle {
                    id: endpoint,
                    remote,
                    direction: Direction::Inbound,
                };
                self.inner.lock().endpoints.insert(
                    endpoint,
                    Endpoint {
                        handle: handle.clone(),
                        state: EndpointState::Open,
                        dial_timer: None,
                    },
                );
                self.counters.endpoints_attached.fetch_add(1, Ordering::Relaxed);
                info!(target = TARGET, %endpoint, peer = %handle.remote, "endpoint attached");
                let callbacks = self.callbacks.read().attached.clone();
                for callback in callbacks {
                    guarded("endpoint_attached", || callback(&handle));
                }
            }
            TransportEvent::Opened { endpoint } => self.on_opened(endpoint),
            TransportEvent::Message { endpoint, payload } => {
                if self.endpoint_state(endpoint) != Some(EndpointState::Open) {
                    trace!(target = TARGET, %endpoint, "message for endpoint that is not open");
                    return;
                }
                self.counters.messages_in.fetch_add(1, Ordering::Relaxed);
                let router = &self.router;
                guarded("dispatch", || {
                    router.dispatch(endpoint, &payload);
                });
            }
            TransportEvent::Closed { endpoint } => {
                self.finish(endpoint, None);
            }
            TransportEvent::Error {
                endpoint: Some(endpoint),
                message,
            } => {
                warn!(target = TARGET, %endpoint, error = %message, "endpoint error");
                if self.finish(endpoint, None) {
                    self.transport.close(endpoint);
                }
            }
            TransportEvent::Error {
                endpoint: None,
                message,
            } => {
                warn!(target = TARGET, error = %message, "transport error");
            }
            TransportEvent::Disconnected => {
                let endpoints: Vec<EndpointId> = {
                    let mut inner = self.inner.lock();
                    inner.local = None;
                    inner.endpoints.keys().copied().collect()
                };
                for endpoint in endpoints {
                    self.finish(endpoint, None);
                }
                warn!(target = TARGET, "lost signaling registration");
                self.set_state(ConnectionState::Closed);
            }
        }
    }

    fn on_opened(&self, endpoint: EndpointId) {
        let opened = {
            let mut inner = self.inner.lock();
            match inner.endpoints.get_mut(&endpoint) {
                Some(entry) if entry.state == EndpointState::Negotiating => {
                    entry.state = EndpointState::Open;
                    if let Some(timer) = entry.dial_timer.take() {
                        timer.abort();
                    }
                    Some(entry.handle.clone())
                }
                _ => None,
            }
        };
        let Some(handle) = opened else {
            // Opened after the dial was given up on; release the channel.
            if self.endpoint_state(endpoint).is_some() {
                trace!(target = TARGET, %endpoint, "late open; closing");
                self.transport.close(endpoint);
            }
            return;
        };
        self.counters.endpoints_opened.fetch_add(1, Ordering::Relaxed);
        info!(target = TARGET, %endpoint, peer = %handle.remote, "endpoint open");
        let callbacks = self.callbacks.read().opened.clone();
        for callback in callbacks {
            guarded("endpoint_opened", || callback(&handle));
        }
    }

    /// Moves an endpoint to `Closed` and runs the close callbacks. Returns
    /// false when it was already closed or never known.
    fn finish(&self, endpoint: EndpointId, forced: Option<CloseReason>) -> bool {
        let (handle, reason) = {
            let mut inner = self.inner.lock();
            let Some(mut entry) = inner.endpoints.remove(&endpoint) else {
                return false;
            };
            if let Some(timer) = entry.dial_timer.take() {
                timer.abort();
            }
            let reason = forced.unwrap_or(match entry.state {
                EndpointState::Negotiating => CloseReason::DialFailed,
                _ => CloseReason::Dropped,
            });
            if inner.closed.len() == CLOSED_HISTORY {
                inner.closed.pop_front();
            }
            inner.closed.push_back((endpoint, reason));
            (entry.handle, reason)
        };

        self.counters.endpoints_closed.fetch_add(1, Ordering::Relaxed);
        match reason {
            CloseReason::DialFailed => {
                self.counters.dials_failed.fetch_add(1, Ordering::Relaxed);
                warn!(target = TARGET, %endpoint, peer = %handle.remote, "dial failed");
            }
            CloseReason::Dropped => {
                info!(target = TARGET, %endpoint, peer = %handle.remote, "endpoint dropped");
            }
            CloseReason::LocalClose => {
                debug!(target = TARGET, %endpoint, peer = %handle.remote, "endpoint closed locally");
            }
        }

        let callbacks = self.callbacks.read().closed.clone();
        for callback in callbacks {
            guarded("endpoint_closed", || callback(&handle, reason));
        }
        true
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        for entry in inner.endpoints.values_mut() {
            if let Some(timer) = entry.dial_timer.take() {
                timer.abort();
            }
        }
    }
}

async fn run_event_pump(link: Weak<PeerLink>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(link) = link.upgrade() else {
            break;
        };
        link.handle_event(event);
    }
    trace!(target = TARGET, "event pump stopped");
}

/// A panicking consumer must not take the event pump down with it.
fn guarded(what: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(target = TARGET, callback = what, "callback panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_transport::LocalSwitchboard;

    const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

    fn link_on(board: &LocalSwitchboard, id: &str) -> Arc<PeerLink> {
        PeerLink::new(
            Arc::new(board.transport_with_id(id)),
            Arc::new(DataChannelRouter::for_client()),
            DIAL_TIMEOUT,
        )
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn open_registers_and_assigns_identifier() {
        let board = LocalSwitchboard::new();
        let link = link_on(&board, "client");
        assert_eq!(link.connection_state(), ConnectionState::Idle);
        assert_eq!(link.local_identifier(), None);

        link.open().expect("open");
        assert_eq!(link.connection_state(), ConnectionState::Negotiating);
        let mut state = link.watch_state();
        state
            .wait_for(|state| *state == ConnectionState::Open)
            .await
            .expect("state channel");
        assert_eq!(link.local_identifier(), Some(PeerId::new("client")));

        link.open().expect("reopen while open is a no-op");
        assert_eq!(link.connection_state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn dial_requires_registration() {
        let board = LocalSwitchboard::new();
        let link = link_on(&board, "remote");
        assert!(matches!(
            link.dial(&PeerId::new("client")),
            Err(LinkError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn send_to_unknown_or_closed_endpoint_is_skipped() {
        let board = LocalSwitchboard::new();
        let link = link_on(&board, "client");
        let stray = peer_transport::next_endpoint_id();
        assert_eq!(link.send(stray, Bytes::from_static(b"{}")), SendOutcome::Skipped);
        assert_eq!(link.broadcast(Bytes::from_static(b"{}")), 0);
        assert_eq!(link.stats().sends_skipped, 1);
    }

    #[tokio::test]
    async fn accepts_and_dials_across_switchboard() {
        let board = LocalSwitchboard::new();
        let client = link_on(&board, "client");
        let remote = link_on(&board, "remote");
        let attached = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&attached);
        client.on_endpoint_attached(move |handle| sink.lock().push(handle.clone()));

        client.open().expect("client open");
        remote.open().expect("remote open");
        until(|| remote.local_identifier().is_some()).await;

        let handle = remote.dial(&PeerId::new("client")).expect("dial");
        assert_eq!(handle.direction(), Direction::Outbound);
        until(|| remote.endpoint_state(handle.id()) == Some(EndpointState::Open)).await;
        until(|| attached.lock().len() == 1).await;

        let inbound = attached.lock()[0].clone();
        assert_eq!(inbound.remote(), &PeerId::new("remote"));
        assert_eq!(inbound.direction(), Direction::Inbound);
        assert_eq!(client.open_endpoints(), vec![inbound]);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_dial_fails_after_timeout() {
        let board = LocalSwitchboard::new();
        let client = link_on(&board, "client");
        let remote = link_on(&board, "remote");
        client.open().expect("client open");
        remote.open().expect("remote open");
        until(|| remote.local_identifier().is_some()).await;
        board.partition(&PeerId::new("client"));

        let closed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&closed);
        remote.on_endpoint_closed(move |handle, reason| sink.lock().push((handle.id(), reason)));

        let handle = remote.dial(&PeerId::new("client")).expect("dial");
        tokio::time::sleep(DIAL_TIMEOUT - Duration::from_millis(1)).await;
        assert_eq!(
            remote.endpoint_state(handle.id()),
            Some(EndpointState::Negotiating)
        );

        tokio::time::sleep(Duration::from_millis(2)).await;
        until(|| !closed.lock().is_empty()).await;
        assert_eq!(
            remote.endpoint_state(handle.id()),
            Some(EndpointState::Closed(CloseReason::DialFailed))
        );
        assert_eq!(*closed.lock(), vec![(handle.id(), CloseReason::DialFailed)]);
        assert_eq!(remote.stats().dials_failed, 1);
        assert!(remote.endpoints().is_empty());
    }

    #[tokio::test]
    async fn dialing_unknown_peer_fails_without_waiting() {
        let board = LocalSwitchboard::new();
        let remote = link_on(&board, "remote");
        remote.open().expect("open");
        until(|| remote.local_identifier().is_some()).await;

        let handle = remote.dial(&PeerId::new("nobody")).expect("dial");
        until(|| {
            remote.endpoint_state(handle.id())
                == Some(EndpointState::Closed(CloseReason::DialFailed))
        })
        .await;
    }

    #[tokio::test]
    async fn closed_history_keeps_only_recent_endpoints() {
        let board = LocalSwitchboard::new();
        let remote = link_on(&board, "remote");
        remote.open().expect("open");
        until(|| remote.local_identifier().is_some()).await;

        let total = CLOSED_HISTORY + 10;
        let mut dialed = Vec::with_capacity(total);
        for _ in 0..total {
            dialed.push(remote.dial(&PeerId::new("nobody")).expect("dial").id());
        }
        until(|| remote.stats().dials_failed == total as u64).await;

        assert_eq!(remote.inner.lock().closed.len(), CLOSED_HISTORY);
        assert_eq!(remote.endpoint_state(dialed[0]), None);
        assert_eq!(remote.endpoint_state(dialed[9]), None);
        assert_eq!(
            remote.endpoint_state(dialed[10]),
            Some(EndpointState::Closed(CloseReason::DialFailed))
        );
        assert_eq!(
            remote.endpoint_state(dialed[total - 1]),
            Some(EndpointState::Closed(CloseReason::DialFailed))
        );
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stop_the_pump() {
        let board = LocalSwitchboard::new();
        let client = link_on(&board, "client");
        let remote = link_on(&board, "remote");
        client.on_endpoint_attached(|_| panic!("consumer bug"));
        client.open().expect("client open");
        remote.open().expect("remote open");
        until(|| remote.local_identifier().is_some()).await;

        remote.dial(&PeerId::new("client")).expect("first dial");
        remote.dial(&PeerId::new("client")).expect("second dial");
        until(|| client.open_endpoints().len() == 2).await;
    }

    #[tokio::test]
    async fn shutdown_closes_locally_and_allows_reopen() {
        let board = LocalSwitchboard::new();
        let client = link_on(&board, "client");
        let remote = link_on(&board, "remote");
        client.open().expect("client open");
        remote.open().expect("remote open");
        until(|| remote.local_identifier().is_some()).await;
        let handle = remote.dial(&PeerId::new("client")).expect("dial");
        until(|| remote.endpoint_state(handle.id()) == Some(EndpointState::Open)).await;

        remote.shutdown();
        assert_eq!(remote.connection_state(), ConnectionState::Closed);
        assert_eq!(
            remote.endpoint_state(handle.id()),
            Some(EndpointState::Closed(CloseReason::LocalClose))
        );
        until(|| client.open_endpoints().is_empty()).await;

        remote.open().expect("reopen");
        until(|| remote.connection_state() == ConnectionState::Open).await;
        assert_eq!(remote.local_identifier(), Some(PeerId::new("remote")));
    }
}
