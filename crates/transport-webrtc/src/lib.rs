//! [`PeerTransport`] over real WebRTC data channels.
//!
//! Dialing sends a complete offer (non-trickle ICE) through a [`Signaling`]
//! service; the dialed side answers and the channel opens once ICE and
//! SCTP are up. Each endpoint owns one peer connection with one ordered
//! data channel.

mod config;
mod signaling;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use peer_transport::{
    EndpointId, EventSender, PeerId, PeerTransport, TransportError, TransportEvent,
    TransportResult, next_endpoint_id,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub use config::{DEFAULT_CHANNEL_LABEL, DEFAULT_STUN_URL, WebRtcConfig, WebRtcConfigBuilder};
pub use signaling::{
    LocalSignaling, Signal, SignalEnvelope, SignalInbox, Signaling, SignalingError,
};

const TARGET: &str = "transport_webrtc";

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn build_api(config: &WebRtcConfig) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(config.ice_disconnected_timeout),
        Some(config.ice_failed_timeout),
        Some(config.ice_keepalive_interval),
    );

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

struct Channel {
    remote: PeerId,
    direction: Direction,
    connection_id: String,
    pc: Option<Arc<RTCPeerConnection>>,
    /// Set once the data channel opens; dropping it ends the writer task.
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

#[derive(Default)]
struct State {
    local: Option<PeerId>,
    events: Option<EventSender>,
    channels: HashMap<EndpointId, Channel>,
    signal_task: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
}

struct Inner {
    config: WebRtcConfig,
    signaling: Arc<dyn Signaling>,
    requested_id: Option<PeerId>,
    state: Mutex<State>,
}

/// WebRTC-backed peer transport.
pub struct WebRtcTransport {
    inner: Arc<Inner>,
}

impl WebRtcTransport {
    pub fn new(config: WebRtcConfig, signaling: Arc<dyn Signaling>) -> Self {
        Self::build(config, signaling, None)
    }

    /// Registers under a fixed id instead of one assigned by signaling.
    pub fn with_id(config: WebRtcConfig, signaling: Arc<dyn Signaling>, id: PeerId) -> Self {
        Self::build(config, signaling, Some(id))
    }

    fn build(config: WebRtcConfig, signaling: Arc<dyn Signaling>, requested_id: Option<PeerId>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                signaling,
                requested_id,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.inner.state.lock().local.clone()
    }
}

impl Inner {
    /// Runs work on the runtime captured by `open`, the one the signaling
    /// task lives on. Returns false once shut down or before `open`.
    fn spawn<F>(&self, future: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let runtime = self.state.lock().runtime.clone();
        match runtime {
            Some(runtime) => {
                runtime.spawn(future);
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: TransportEvent) {
        let events = self.state.lock().events.clone();
        if let Some(events) = events {
            let _ = events.send(event);
        }
    }

    /// Removes the endpoint and reports `Closed` once; later calls are no-ops.
    fn finish(&self, endpoint: EndpointId) {
        let (channel, events) = {
            let mut state = self.state.lock();
            (state.channels.remove(&endpoint), state.events.clone())
        };
        let Some(channel) = channel else {
            return;
        };
        debug!(target = TARGET, %endpoint, remote = %channel.remote, "channel closed");
        if let Some(events) = events {
            let _ = events.send(TransportEvent::Closed { endpoint });
        }
        if let Some(pc) = channel.pc {
            self.spawn(async move {
                if let Err(err) = pc.close().await {
                    trace!(target = TARGET, %endpoint, error = %err, "peer connection close failed");
                }
            });
        }
    }

    /// Negotiation failed before the channel opened.
    fn fail(&self, endpoint: EndpointId, message: String) {
        let (channel, events) = {
            let mut state = self.state.lock();
            (state.channels.remove(&endpoint), state.events.clone())
        };
        let Some(channel) = channel else {
            return;
        };
        warn!(target = TARGET, %endpoint, remote = %channel.remote, error = %message, "negotiation failed");
        if let Some(events) = events {
            let _ = events.send(TransportEvent::Error {
                endpoint: Some(endpoint),
                message,
            });
        }
        if let Some(pc) = channel.pc {
            self.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }

    fn endpoint_for_connection(&self, connection_id: &str) -> Option<EndpointId> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|(_, channel)| channel.connection_id == connection_id)
            .map(|(endpoint, _)| *endpoint)
    }

    fn attach_pc(&self, endpoint: EndpointId, pc: &Arc<RTCPeerConnection>) -> bool {
        match self.state.lock().channels.get_mut(&endpoint) {
            Some(channel) => {
                channel.pc = Some(Arc::clone(pc));
                true
            }
            None => false,
        }
    }

    async fn new_peer_connection(
        self: &Arc<Self>,
        endpoint: EndpointId,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let api = build_api(&self.config)?;
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );
        let weak = Arc::downgrade(self);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                trace!(target = TARGET, %endpoint, ?state, "peer connection state");
                let lost = matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                );
                if lost {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_connection_lost(endpoint);
                    }
                }
            })
        }));
        Ok(pc)
    }

    fn on_connection_lost(&self, endpoint: EndpointId) {
        let opened = self
            .state
            .lock()
            .channels
            .get(&endpoint)
            .map(|channel| channel.outbound.is_some());
        match opened {
            Some(true) => self.finish(endpoint),
            Some(false) => self.fail(endpoint, "ice connection failed".into()),
            None => {}
        }
    }

    fn on_channel_open(self: &Arc<Self>, endpoint: EndpointId, dc: Arc<RTCDataChannel>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let event = {
            let mut state = self.state.lock();
            let Some(channel) = state.channels.get_mut(&endpoint) else {
                return;
            };
            channel.outbound = Some(tx);
            match channel.direction {
                Direction::Outbound => TransportEvent::Opened { endpoint },
                Direction::Inbound => TransportEvent::Incoming {
                    endpoint,
                    remote: channel.remote.clone(),
                },
            }
        };
        debug!(target = TARGET, %endpoint, "data channel open");

        let weak = Arc::downgrade(self);
        self.spawn(async move {
            trace!(target = TARGET, %endpoint, "sender loop start");
            while let Some(bytes) = rx.recv().await {
                if let Err(err) = dc.send(&bytes).await {
                    warn!(target = TARGET, %endpoint, error = %err, "data channel send failed");
                    if let Some(inner) = weak.upgrade() {
                        inner.finish(endpoint);
                    }
                    break;
                }
            }
            trace!(target = TARGET, %endpoint, "sender loop end");
        });

        self.emit(event);
    }

    fn wire_channel(self: &Arc<Self>, endpoint: EndpointId, dc: &Arc<RTCDataChannel>) {
        let weak = Arc::downgrade(self);
        let dc_for_open = Arc::clone(dc);
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_channel_open(endpoint, dc_for_open);
                }
            })
        }));

        let weak = Arc::downgrade(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                trace!(target = TARGET, %endpoint, frame_len = msg.data.len(), "received frame");
                if let Some(inner) = weak.upgrade() {
                    inner.emit(TransportEvent::Message {
                        endpoint,
                        payload: msg.data,
                    });
                }
            })
        }));

        let weak = Arc::downgrade(self);
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.finish(endpoint);
                }
            })
        }));
    }

    async fn run_offer(
        self: Arc<Self>,
        endpoint: EndpointId,
        local: PeerId,
        target: PeerId,
        connection_id: String,
    ) -> Result<(), TransportError> {
        let pc = self.new_peer_connection(endpoint).await?;
        if !self.attach_pc(endpoint, &pc) {
            let _ = pc.close().await;
            return Ok(());
        }

        let dc_init = RTCDataChannelInit {
            ordered: Some(self.config.ordered),
            max_retransmits: self.config.max_retransmits,
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(&self.config.data_channel_label, Some(dc_init))
            .await
            .map_err(to_setup_error)?;
        self.wire_channel(endpoint, &dc);

        let offer = pc.create_offer(None).await.map_err(to_setup_error)?;
        let sdp = gather_local_description(&pc, offer).await?;
        debug!(target = TARGET, %endpoint, %target, "sending offer");
        self.signaling
            .send(SignalEnvelope {
                from: local,
                to: target.clone(),
                connection_id,
                signal: Signal::Offer { sdp },
            })
            .await
            .map_err(|err| match err {
                SignalingError::UnknownPeer(peer) => TransportError::PeerUnavailable(peer),
                other => to_setup_error(other),
            })
    }

    async fn run_answer(
        self: Arc<Self>,
        endpoint: EndpointId,
        envelope: SignalEnvelope,
        offer_sdp: String,
    ) -> Result<(), TransportError> {
        let pc = self.new_peer_connection(endpoint).await?;
        if !self.attach_pc(endpoint, &pc) {
            let _ = pc.close().await;
            return Ok(());
        }

        let weak = Arc::downgrade(&self);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.wire_channel(endpoint, &dc);
                }
            })
        }));

        let offer = RTCSessionDescription::offer(offer_sdp).map_err(to_setup_error)?;
        pc.set_remote_description(offer)
            .await
            .map_err(to_setup_error)?;
        let answer = pc.create_answer(None).await.map_err(to_setup_error)?;
        let sdp = gather_local_description(&pc, answer).await?;
        debug!(target = TARGET, %endpoint, remote = %envelope.from, "sending answer");
        self.signaling
            .send(SignalEnvelope {
                from: envelope.to,
                to: envelope.from,
                connection_id: envelope.connection_id,
                signal: Signal::Answer { sdp },
            })
            .await
            .map_err(to_setup_error)
    }

    fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        match envelope.signal.clone() {
            Signal::Offer { sdp } => {
                let endpoint = next_endpoint_id();
                self.state.lock().channels.insert(
                    endpoint,
                    Channel {
                        remote: envelope.from.clone(),
                        direction: Direction::Inbound,
                        connection_id: envelope.connection_id.clone(),
                        pc: None,
                        outbound: None,
                    },
                );
                debug!(target = TARGET, %endpoint, remote = %envelope.from, "incoming offer");
                let inner = Arc::clone(self);
                self.spawn(async move {
                    if let Err(err) = Arc::clone(&inner).run_answer(endpoint, envelope, sdp).await {
                        inner.fail(endpoint, err.to_string());
                    }
                });
            }
            Signal::Answer { sdp } => {
                let Some(endpoint) = self.endpoint_for_connection(&envelope.connection_id) else {
                    trace!(target = TARGET, connection_id = %envelope.connection_id, "answer for unknown dial");
                    return;
                };
                let pc = self
                    .state
                    .lock()
                    .channels
                    .get(&endpoint)
                    .and_then(|channel| channel.pc.clone());
                let Some(pc) = pc else {
                    return;
                };
                let inner = Arc::clone(self);
                self.spawn(async move {
                    let applied = match RTCSessionDescription::answer(sdp) {
                        Ok(answer) => pc.set_remote_description(answer).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = applied {
                        inner.fail(endpoint, err.to_string());
                    }
                });
            }
        }
    }
}

/// Applies `description` and waits for ICE gathering so the returned SDP
/// carries every candidate.
async fn gather_local_description(
    pc: &Arc<RTCPeerConnection>,
    description: RTCSessionDescription,
) -> Result<String, TransportError> {
    let mut gather = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(to_setup_error)?;
    let _ = gather.recv().await;
    pc.local_description()
        .await
        .map(|desc| desc.sdp)
        .ok_or_else(|| TransportError::Setup("missing local description".into()))
}

impl PeerTransport for WebRtcTransport {
    fn open(&self, events: EventSender) -> TransportResult<()> {
        let handle = Handle::try_current()
            .map_err(|_| TransportError::Setup("no tokio runtime available".into()))?;
        {
            let mut state = self.inner.state.lock();
            if state.events.is_some() {
                return Err(TransportError::AlreadyOpen);
            }
            state.events = Some(events);
            state.runtime = Some(handle.clone());
        }

        let inner = Arc::clone(&self.inner);
        let task = handle.spawn(async move {
            let registration = inner.signaling.register(inner.requested_id.clone()).await;
            let (peer_id, mut inbox) = match registration {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(target = TARGET, error = %err, "signaling registration failed");
                    inner.emit(TransportEvent::Error {
                        endpoint: None,
                        message: err.to_string(),
                    });
                    inner.emit(TransportEvent::Disconnected);
                    return;
                }
            };
            inner.state.lock().local = Some(peer_id.clone());
            debug!(target = TARGET, peer = %peer_id, "registered with signaling");
            inner.emit(TransportEvent::Registered { peer_id });

            let weak: Weak<Inner> = Arc::downgrade(&inner);
            drop(inner);
            while let Some(envelope) = inbox.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_signal(envelope);
            }
            if let Some(inner) = weak.upgrade() {
                inner.emit(TransportEvent::Disconnected);
            }
        });
        self.inner.state.lock().signal_task = Some(task);
        Ok(())
    }

    fn connect(&self, target: &PeerId) -> TransportResult<EndpointId> {
        let local = self.local_id().ok_or(TransportError::NotRegistered)?;
        let endpoint = next_endpoint_id();
        let connection_id = format!("{local}:{}", endpoint.get());
        self.inner.state.lock().channels.insert(
            endpoint,
            Channel {
                remote: target.clone(),
                direction: Direction::Outbound,
                connection_id: connection_id.clone(),
                pc: None,
                outbound: None,
            },
        );

        let inner = Arc::clone(&self.inner);
        let target = target.clone();
        let spawned = self.inner.spawn(async move {
            let result = Arc::clone(&inner)
                .run_offer(endpoint, local, target, connection_id)
                .await;
            if let Err(err) = result {
                inner.fail(endpoint, err.to_string());
            }
        });
        if !spawned {
            self.inner.state.lock().channels.remove(&endpoint);
            return Err(TransportError::NotRegistered);
        }
        Ok(endpoint)
    }

    fn send(&self, endpoint: EndpointId, payload: Bytes) -> TransportResult<()> {
        let state = self.inner.state.lock();
        let channel = state
            .channels
            .get(&endpoint)
            .ok_or(TransportError::UnknownEndpoint(endpoint))?;
        let outbound = channel.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.send(payload).map_err(|_| TransportError::Closed)
    }

    fn close(&self, endpoint: EndpointId) {
        self.inner.finish(endpoint);
    }

    fn shutdown(&self) {
        let (endpoints, task, local) = {
            let mut state = self.inner.state.lock();
            let endpoints: Vec<EndpointId> = state.channels.keys().copied().collect();
            (endpoints, state.signal_task.take(), state.local.take())
        };
        for endpoint in endpoints {
            self.inner.finish(endpoint);
        }
        if let Some(task) = task {
            task.abort();
        }
        if let Some(local) = local {
            let signaling = Arc::clone(&self.inner.signaling);
            self.inner.spawn(async move {
                signaling.unregister(&local).await;
            });
        }
        self.inner.emit(TransportEvent::Disconnected);
        let mut state = self.inner.state.lock();
        state.events = None;
        state.runtime = None;
    }

    fn kind(&self) -> &'static str {
        "webrtc"
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        if let Some(task) = self.inner.state.lock().signal_task.take() {
            task.abort();
        }
    }
}
