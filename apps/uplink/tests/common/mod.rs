#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use peer_transport::{LocalSwitchboard, PeerId};
use uplink_session::{
    ClientSession, Identity, IdentityResolver, LaunchParameters, RemoteSession, Session,
    SessionConfig,
};

pub const FRAME: Duration = Duration::from_millis(16);

pub fn session_config() -> SessionConfig {
    SessionConfig {
        dial_timeout: Duration::from_secs(10),
        frame_interval: FRAME,
    }
}

pub fn start_client(board: &LocalSwitchboard, id: &str) -> ClientSession {
    let identity = IdentityResolver::resolve(&LaunchParameters::default());
    match Session::start(identity, Arc::new(board.transport_with_id(id)), &session_config()) {
        Ok(Session::Client(client)) => client,
        Ok(Session::Remote(_)) => panic!("expected client session"),
        Err(err) => panic!("client failed to start: {err}"),
    }
}

pub fn start_remote(board: &LocalSwitchboard, target: &PeerId) -> RemoteSession {
    let params = LaunchParameters::from_query(&format!("id={target}"));
    let identity = IdentityResolver::resolve(&params);
    assert!(matches!(identity, Identity::Remote(_)));
    match Session::start(identity, Arc::new(board.transport()), &session_config()) {
        Ok(Session::Remote(remote)) => remote,
        Ok(Session::Client(_)) => panic!("expected remote session"),
        Err(err) => panic!("remote failed to start: {err}"),
    }
}

/// Lets the link pumps run until `condition` holds. Never advances time.
pub async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Yields enough times for every pending event to be drained.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
