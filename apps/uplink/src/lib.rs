//! Peer-to-peer session layer between a scene host (the client) and a phone
//! acting as its controller (the remote).
//!
//! [`identity`] decides the role from launch parameters, [`link`] owns the
//! connection lifecycle, [`router`] splits inbound frames into telemetry and
//! state, [`state_sync`] replicates client state to remotes and [`pump`]
//! streams sensor samples from remotes.

pub mod config;
pub mod identity;
pub mod link;
pub mod logging;
pub mod pump;
pub mod router;
pub mod sensor;
pub mod session;
pub mod state_sync;

pub use config::{Config, ConfigError, SessionConfig, TransportChoice};
pub use identity::{
    ClientIdentity, Identity, IdentityResolver, LaunchParameters, RemoteIdentity, Role,
};
pub use link::{
    CloseReason, ConnectionState, Direction, EndpointHandle, EndpointState, LinkError, LinkStats,
    PeerLink, SendOutcome,
};
pub use pump::{ContinuousTelemetryPump, PumpError};
pub use router::{DataChannelRouter, Dispatch, RouterStats, TelemetryRegistration};
pub use sensor::{SampleSource, SensorHub, SensorPermission, SyntheticSensor};
pub use session::{ClientSession, RemoteSession, Session};
pub use state_sync::{AuthoritativeState, SessionAction, StateMirror};
