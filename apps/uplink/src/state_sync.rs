//! Client-owned session state and its read-only copy on the remote.
//!
//! The client is the only writer. Every effective mutation is pushed as a full
//! snapshot to all open endpoints; remotes replace their mirror wholesale.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace};
use uplink_proto::{Envelope, SessionStateSnapshot};

use crate::identity::{ClientIdentity, RemoteIdentity};
use crate::link::{EndpointHandle, PeerLink, SendOutcome};

const TARGET: &str = "uplink::state";

/// Modal and light changes driven by the client's UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Sets the about panel; the CV panel is closed either way.
    ShowAbout(bool),
    /// Sets the CV panel; the about panel is closed either way.
    ShowCv(bool),
    ToggleAbout,
    ToggleCv,
    CloseModals,
}

impl SessionAction {
    fn reduce(self, state: &mut SessionStateSnapshot) {
        match self {
            SessionAction::ShowAbout(open) => {
                state.show_about = open;
                state.show_cv = false;
            }
            SessionAction::ShowCv(open) => {
                state.show_cv = open;
                state.show_about = false;
            }
            SessionAction::ToggleAbout => SessionAction::ShowAbout(!state.show_about).reduce(state),
            SessionAction::ToggleCv => SessionAction::ShowCv(!state.show_cv).reduce(state),
            SessionAction::CloseModals => {
                state.show_about = false;
                state.show_cv = false;
            }
        }
    }
}

pub struct AuthoritativeState {
    link: Arc<PeerLink>,
    current: Mutex<SessionStateSnapshot>,
    watchers: watch::Sender<SessionStateSnapshot>,
    pushes: AtomicU64,
}

impl AuthoritativeState {
    pub fn new(_identity: &ClientIdentity, link: Arc<PeerLink>) -> Self {
        let (watchers, _) = watch::channel(SessionStateSnapshot::default());
        Self {
            link,
            current: Mutex::new(SessionStateSnapshot::default()),
            watchers,
            pushes: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> SessionStateSnapshot {
        self.current.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStateSnapshot> {
        self.watchers.subscribe()
    }

    /// Applies `mutate` and, if the snapshot changed, pushes it to every open
    /// endpoint. Returns the number of endpoints the push reached.
    pub fn update<F>(&self, mutate: F) -> usize
    where
        F: FnOnce(&mut SessionStateSnapshot),
    {
        let mut current = self.current.lock();
        let mut next = current.clone();
        mutate(&mut next);
        if next == *current {
            trace!(target = TARGET, "update changed nothing; not pushing");
            return 0;
        }
        *current = next.clone();
        // Still under the lock, so concurrent updates reach the wire in the
        // order they were applied.
        let reached = self.link.broadcast_envelope(&Envelope::state_sync(next.clone()));
        drop(current);

        self.pushes.fetch_add(reached as u64, Ordering::Relaxed);
        self.watchers.send_replace(next);
        debug!(target = TARGET, endpoints = reached, "state pushed");
        reached
    }

    pub fn set_headlights(&self, on: bool) -> usize {
        self.update(|state| state.headlights_on = on)
    }

    pub fn set_taillights(&self, on: bool) -> usize {
        self.update(|state| state.taillights_on = on)
    }

    /// Sets a flag by wire name. `None` when a typed flag was given a
    /// non-boolean value; nothing is pushed in that case.
    pub fn set_flag(&self, name: &str, value: Value) -> Option<usize> {
        let mut accepted = true;
        let reached = self.update(|state| accepted = state.set_flag(name, value));
        accepted.then_some(reached)
    }

    pub fn apply_action(&self, action: SessionAction) -> usize {
        self.update(|state| action.reduce(state))
    }

    /// Sends the current snapshot to one endpoint, used to seed a mirror
    /// that just attached.
    pub fn push_to(&self, endpoint: &EndpointHandle) -> SendOutcome {
        let current = self.current.lock();
        let outcome = self
            .link
            .send_envelope(endpoint.id(), &Envelope::state_sync(current.clone()));
        if outcome == SendOutcome::Sent {
            self.pushes.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Snapshot deliveries handed to the transport so far.
    pub fn pushes_sent(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }
}

/// The remote's copy of the client's state. Only the router writes to it.
pub struct StateMirror {
    current: watch::Sender<SessionStateSnapshot>,
    applied: AtomicU64,
}

impl StateMirror {
    pub fn new(_identity: &RemoteIdentity) -> Self {
        let (current, _) = watch::channel(SessionStateSnapshot::default());
        Self {
            current,
            applied: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> SessionStateSnapshot {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStateSnapshot> {
        self.current.subscribe()
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub(crate) fn apply(&self, snapshot: SessionStateSnapshot) {
        let changed = self.current.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        self.applied.fetch_add(1, Ordering::Relaxed);
        trace!(target = TARGET, changed, "mirror applied snapshot");
    }
}
