//! Wires one link, router and state-sync object together per launch.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use peer_transport::{EndpointId, PeerId, PeerTransport};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uplink_proto::SensorSample;
use url::Url;

use crate::config::SessionConfig;
use crate::identity::{ClientIdentity, Identity, RemoteIdentity, Role, join_link};
use crate::link::{ConnectionState, EndpointHandle, LinkError, PeerLink};
use crate::pump::{ContinuousTelemetryPump, PumpError};
use crate::router::{DataChannelRouter, TelemetryRegistration};
use crate::sensor::SampleSource;
use crate::state_sync::{AuthoritativeState, StateMirror};

const TARGET: &str = "uplink::session";

pub enum Session {
    Client(ClientSession),
    Remote(RemoteSession),
}

impl Session {
    /// Builds the role's objects and opens the link. Needs a tokio runtime.
    pub fn start(
        identity: Identity,
        transport: Arc<dyn PeerTransport>,
        config: &SessionConfig,
    ) -> Result<Self, LinkError> {
        let session = match identity {
            Identity::Client(client) => Session::Client(ClientSession::start(&client, transport, config)?),
            Identity::Remote(remote) => Session::Remote(RemoteSession::start(remote, transport, config)?),
        };
        info!(target = TARGET, role = %session.role(), "session started");
        Ok(session)
    }

    pub fn role(&self) -> Role {
        match self {
            Session::Client(_) => Role::Client,
            Session::Remote(_) => Role::Remote,
        }
    }

    pub fn link(&self) -> &Arc<PeerLink> {
        match self {
            Session::Client(client) => client.link(),
            Session::Remote(remote) => remote.link(),
        }
    }

    pub fn shutdown(&self) {
        match self {
            Session::Client(client) => client.shutdown(),
            Session::Remote(remote) => remote.shutdown(),
        }
    }
}

/// The scene host: waits to be dialed and owns the session state.
pub struct ClientSession {
    link: Arc<PeerLink>,
    router: Arc<DataChannelRouter>,
    state: Arc<AuthoritativeState>,
}

impl ClientSession {
    fn start(
        identity: &ClientIdentity,
        transport: Arc<dyn PeerTransport>,
        config: &SessionConfig,
    ) -> Result<Self, LinkError> {
        let router = Arc::new(DataChannelRouter::for_client());
        let link = PeerLink::new(transport, Arc::clone(&router), config.dial_timeout);
        let state = Arc::new(AuthoritativeState::new(identity, Arc::clone(&link)));

        // A fresh mirror starts from defaults; seed it with what we have.
        let seeder = Arc::downgrade(&state);
        link.on_endpoint_attached(move |endpoint| {
            if let Some(state) = seeder.upgrade() {
                state.push_to(endpoint);
            }
        });
        link.open()?;
        Ok(Self { link, router, state })
    }

    pub fn link(&self) -> &Arc<PeerLink> {
        &self.link
    }

    pub fn state(&self) -> &Arc<AuthoritativeState> {
        &self.state
    }

    pub fn register_telemetry_handler<F>(&self, handler: F) -> TelemetryRegistration
    where
        F: Fn(EndpointId, &SensorSample) + Send + Sync + 'static,
    {
        self.router.register_telemetry_handler(handler)
    }

    pub fn unregister_telemetry_handler(&self, registration: TelemetryRegistration) -> bool {
        self.router.unregister(registration)
    }

    /// The link to advertise once registered; `None` before that.
    pub fn join_link(&self, base: &Url) -> Option<Url> {
        self.link
            .local_identifier()
            .map(|peer| join_link(base, &peer))
    }

    pub fn shutdown(&self) {
        self.link.shutdown();
    }
}

/// The controller: dials the client once registered and streams telemetry.
pub struct RemoteSession {
    identity: RemoteIdentity,
    link: Arc<PeerLink>,
    mirror: Arc<StateMirror>,
    pump: ContinuousTelemetryPump,
    dialer: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteSession {
    fn start(
        identity: RemoteIdentity,
        transport: Arc<dyn PeerTransport>,
        config: &SessionConfig,
    ) -> Result<Self, LinkError> {
        let runtime = Handle::try_current().map_err(|_| LinkError::NoRuntime)?;
        let mirror = Arc::new(StateMirror::new(&identity));
        let router = Arc::new(DataChannelRouter::for_remote(Arc::clone(&mirror)));
        let link = PeerLink::new(transport, router, config.dial_timeout);
        let pump = ContinuousTelemetryPump::new(&identity, config.frame_interval);

        let states = link.watch_state();
        link.open()?;
        let dialer = runtime.spawn(dial_once_open(
            Arc::downgrade(&link),
            states,
            identity.target().clone(),
        ));
        Ok(Self {
            identity,
            link,
            mirror,
            pump,
            dialer: Mutex::new(Some(dialer)),
        })
    }

    pub fn link(&self) -> &Arc<PeerLink> {
        &self.link
    }

    pub fn mirror(&self) -> &Arc<StateMirror> {
        &self.mirror
    }

    pub fn target(&self) -> &PeerId {
        self.identity.target()
    }

    pub fn pump(&self) -> &ContinuousTelemetryPump {
        &self.pump
    }

    /// Streams `source` to every open endpoint at the configured frame rate.
    pub fn start_telemetry(&self, source: Arc<dyn SampleSource>) -> Result<(), PumpError> {
        let link = Arc::downgrade(&self.link);
        self.pump.start(source, move |envelope| {
            if let Some(link) = link.upgrade() {
                link.broadcast_envelope(envelope);
            }
        })
    }

    pub fn stop_telemetry(&self) {
        self.pump.stop();
    }

    /// Dials the target again. There is no automatic reconnect; this is the
    /// only way back after a dropped or failed endpoint.
    pub fn redial(&self) -> Result<EndpointHandle, LinkError> {
        self.link.dial(self.identity.target())
    }

    pub fn shutdown(&self) {
        if let Some(dialer) = self.dialer.lock().take() {
            dialer.abort();
        }
        self.pump.stop();
        self.link.shutdown();
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Some(dialer) = self.dialer.get_mut().take() {
            dialer.abort();
        }
    }
}

async fn dial_once_open(
    link: Weak<PeerLink>,
    mut states: watch::Receiver<ConnectionState>,
    target: PeerId,
) {
    if states
        .wait_for(|state| *state == ConnectionState::Open)
        .await
        .is_err()
    {
        return;
    }
    let Some(link) = link.upgrade() else {
        return;
    };
    match link.dial(&target) {
        Ok(endpoint) => info!(target = TARGET, endpoint = %endpoint, "dialed client"),
        Err(err) => warn!(target = TARGET, peer = %target, error = %err, "initial dial failed"),
    }
}
