mod common;

use std::sync::Arc;

use common::{FRAME, settle, start_client, start_remote, until};
use parking_lot::Mutex;
use peer_transport::{LocalSwitchboard, PeerId};
use tokio::time;
use uplink_proto::{Orientation, SensorSample};
use uplink_session::{
    CloseReason, ConnectionState, Direction, EndpointState, IdentityResolver, LaunchParameters,
    Role, SampleSource, SendOutcome, SensorHub, SessionAction,
};
use url::Url;

#[test_timeout::tokio_timeout_test(10)]
async fn remote_from_join_link_dials_waiting_client() {
    let board = LocalSwitchboard::new();
    let client = start_client(&board, "host-1");
    assert!(client.link().open_endpoints().is_empty());
    until(|| client.link().connection_state() == ConnectionState::Open).await;

    let base = Url::parse("http://localhost:3000").expect("base url");
    let join = client.join_link(&base).expect("client registered");
    let identity = IdentityResolver::resolve(&LaunchParameters::from_url(join.as_str()));
    assert_eq!(identity.role(), Role::Remote);
    assert_eq!(identity.target(), Some(&PeerId::new("host-1")));

    let remote = start_remote(&board, &PeerId::new("host-1"));
    until(|| remote.link().open_endpoints().len() == 1).await;
    until(|| client.link().open_endpoints().len() == 1).await;

    let outbound = &remote.link().open_endpoints()[0];
    assert_eq!(outbound.direction(), Direction::Outbound);
    assert_eq!(outbound.remote(), remote.target());

    let inbound = &client.link().open_endpoints()[0];
    assert_eq!(inbound.direction(), Direction::Inbound);
    assert_eq!(Some(inbound.remote().clone()), remote.link().local_identifier());

    settle().await;
    assert_eq!(remote.link().stats().endpoints_opened, 1, "dials exactly once");
}

#[test_timeout::tokio_timeout_test(10)]
async fn attaching_remote_receives_current_state() {
    let board = LocalSwitchboard::new();
    let client = start_client(&board, "host-2");
    until(|| client.link().connection_state() == ConnectionState::Open).await;
    client.state().set_taillights(true);
    client.state().apply_action(SessionAction::ShowCv(true));

    let remote = start_remote(&board, &PeerId::new("host-2"));
    until(|| remote.mirror().applied_count() == 1).await;
    assert_eq!(remote.mirror().snapshot(), client.state().snapshot());
}

#[test_timeout::tokio_timeout_test(10)]
async fn light_toggle_pushes_once_per_open_endpoint() {
    let board = LocalSwitchboard::new();
    let client = start_client(&board, "host-3");
    until(|| client.link().connection_state() == ConnectionState::Open).await;
    let first = start_remote(&board, &PeerId::new("host-3"));
    let second = start_remote(&board, &PeerId::new("host-3"));
    until(|| first.mirror().applied_count() == 1 && second.mirror().applied_count() == 1).await;
    let seeded = client.state().pushes_sent();
    assert_eq!(seeded, 2);

    assert_eq!(client.state().set_headlights(true), 2);
    assert_eq!(client.state().pushes_sent(), seeded + 2);
    until(|| first.mirror().snapshot().headlights_on && second.mirror().snapshot().headlights_on)
        .await;

    // Setting the same value again is not a mutation.
    assert_eq!(client.state().set_headlights(true), 0);
    settle().await;
    assert_eq!(first.mirror().applied_count(), 2);
    assert_eq!(second.mirror().applied_count(), 2);
}

#[test_timeout::tokio_timeout_test(10)]
async fn mirror_follows_the_last_push() {
    let board = LocalSwitchboard::new();
    let client = start_client(&board, "host-4");
    until(|| client.link().connection_state() == ConnectionState::Open).await;
    let remote = start_remote(&board, &PeerId::new("host-4"));
    until(|| remote.mirror().applied_count() == 1).await;

    client.state().apply_action(SessionAction::ShowAbout(true));
    client.state().apply_action(SessionAction::ShowCv(true));
    client.state().set_headlights(true);
    until(|| remote.mirror().applied_count() == 4).await;

    let mirrored = remote.mirror().snapshot();
    assert!(mirrored.show_cv);
    assert!(!mirrored.show_about);
    assert!(mirrored.headlights_on);
    assert_eq!(mirrored, client.state().snapshot());
}

#[test_timeout::tokio_timeout_test(10)]
async fn client_ignores_inbound_state_frames() {
    let board = LocalSwitchboard::new();
    let client = start_client(&board, "host-5");
    until(|| client.link().connection_state() == ConnectionState::Open).await;
    let remote = start_remote(&board, &PeerId::new("host-5"));
    until(|| remote.link().open_endpoints().len() == 1).await;

    let endpoint = remote.link().open_endpoints()[0].id();
    let forged = bytes::Bytes::from_static(br#"{"state":{"headlightsOn":true}}"#);
    assert_eq!(remote.link().send(endpoint, forged), SendOutcome::Sent);
    until(|| client.link().router().stats().state_ignored == 1).await;
    assert!(!client.state().snapshot().headlights_on);
}

#[tokio::test(start_paused = true)]
async fn rapid_samples_within_one_frame_send_at_most_once() {
    let board = LocalSwitchboard::new();
    let client = start_client(&board, "host-6");
    until(|| client.link().connection_state() == ConnectionState::Open).await;
    let remote = start_remote(&board, &PeerId::new("host-6"));
    until(|| client.link().open_endpoints().len() == 1).await;

    let received = Arc::new(Mutex::new(Vec::<SensorSample>::new()));
    let sink = Arc::clone(&received);
    client.register_telemetry_handler(move |_, sample| sink.lock().push(*sample));

    let hub = Arc::new(SensorHub::new());
    hub.grant();
    remote
        .start_telemetry(Arc::clone(&hub) as Arc<dyn SampleSource>)
        .expect("start telemetry");
    until(|| received.lock().len() == 1).await;

    for alpha in [10.0, 20.0, 30.0] {
        hub.record_orientation(Orientation {
            alpha,
            beta: 0.0,
            gamma: 0.0,
        });
    }
    time::advance(FRAME).await;
    until(|| received.lock().len() == 2).await;
    settle().await;

    let received = received.lock();
    assert_eq!(received.len(), 2);
    assert_eq!(received[1].orientation.alpha, 30.0);
    assert_eq!(remote.pump().frames_sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn telemetry_before_open_is_skipped_without_blocking() {
    let board = LocalSwitchboard::new();
    // Nobody hosts "ghost", so the remote never gets an open endpoint.
    board.partition(&PeerId::new("ghost"));
    let remote = start_remote(&board, &PeerId::new("ghost"));
    remote
        .start_telemetry(Arc::new(uplink_session::SyntheticSensor::new()))
        .expect("start telemetry");

    for _ in 0..5 {
        time::advance(FRAME).await;
        settle().await;
    }
    assert!(remote.pump().frames_sent() >= 5);
    assert_eq!(remote.link().stats().messages_out, 0);
    remote.stop_telemetry();
    remote.stop_telemetry();
    assert!(!remote.pump().is_running());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn dropped_endpoint_stays_closed_until_manual_redial() {
    let board = LocalSwitchboard::new();
    let client = start_client(&board, "host-7");
    until(|| client.link().connection_state() == ConnectionState::Open).await;
    let remote = start_remote(&board, &PeerId::new("host-7"));
    until(|| remote.link().open_endpoints().len() == 1).await;

    let closed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&closed);
    remote
        .link()
        .on_endpoint_closed(move |endpoint, reason| sink.lock().push((endpoint.id(), reason)));

    let dropped = remote.link().open_endpoints()[0].id();
    assert!(board.sever(dropped));
    until(|| !closed.lock().is_empty()).await;
    assert_eq!(
        remote.link().endpoint_state(dropped),
        Some(EndpointState::Closed(CloseReason::Dropped))
    );
    assert_eq!(
        remote.link().endpoint_state(dropped).map(EndpointState::connection_state),
        Some(ConnectionState::Closed)
    );
    until(|| client.link().open_endpoints().is_empty()).await;

    // No reconnect, however long we wait.
    time::sleep(std::time::Duration::from_secs(15)).await;
    settle().await;
    assert!(remote.link().endpoints().is_empty());
    assert_eq!(remote.link().stats().endpoints_opened, 1);
    assert_eq!(remote.link().connection_state(), ConnectionState::Open);

    let again = remote.redial().expect("manual redial");
    assert_ne!(again.id(), dropped);
    until(|| remote.link().endpoint_state(again.id()) == Some(EndpointState::Open)).await;
    until(|| remote.mirror().applied_count() == 2).await;
    assert_eq!(*closed.lock(), vec![(dropped, CloseReason::Dropped)]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn unreachable_client_fails_the_dial() {
    let board = LocalSwitchboard::new();
    board.partition(&PeerId::new("host-8"));
    let client = start_client(&board, "host-8");
    until(|| client.link().connection_state() == ConnectionState::Open).await;
    let remote = start_remote(&board, &PeerId::new("host-8"));
    until(|| remote.link().endpoints().len() == 1).await;
    let pending = remote.link().endpoints()[0].clone();
    assert_eq!(
        remote.link().endpoint_state(pending.id()),
        Some(EndpointState::Negotiating)
    );

    time::sleep(std::time::Duration::from_secs(11)).await;
    settle().await;
    assert_eq!(
        remote.link().endpoint_state(pending.id()),
        Some(EndpointState::Closed(CloseReason::DialFailed))
    );
    assert_eq!(remote.link().stats().dials_failed, 1);
    assert!(client.link().open_endpoints().is_empty());

    board.heal(&PeerId::new("host-8"));
    let retry = remote.redial().expect("redial");
    until(|| remote.link().endpoint_state(retry.id()) == Some(EndpointState::Open)).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn shutdown_tears_down_both_sides() {
    let board = LocalSwitchboard::new();
    let client = start_client(&board, "host-9");
    until(|| client.link().connection_state() == ConnectionState::Open).await;
    let remote = start_remote(&board, &PeerId::new("host-9"));
    until(|| client.link().open_endpoints().len() == 1).await;

    client.shutdown();
    assert_eq!(client.link().connection_state(), ConnectionState::Closed);
    assert!(!board.is_registered(&PeerId::new("host-9")));
    until(|| remote.link().open_endpoints().is_empty()).await;
    assert_eq!(board.open_channels(), 0);

    remote.shutdown();
    assert_eq!(remote.link().connection_state(), ConnectionState::Closed);
}
