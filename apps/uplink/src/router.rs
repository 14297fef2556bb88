use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use peer_transport::EndpointId;
use tracing::{debug, trace};
use uplink_proto::{ProtoError, SensorSample, SessionStateSnapshot, decode_frame};

use crate::state_sync::StateMirror;

const TARGET: &str = "uplink::router";

/// Bytes of a rejected frame echoed into the trace log.
const PREVIEW_BYTES: usize = 48;

pub type TelemetryHandler = Arc<dyn Fn(EndpointId, &SensorSample) + Send + Sync>;

/// Token for the telemetry slot. Unregistering with a stale token is a no-op,
/// so a consumer that was replaced cannot clear its successor.
#[derive(Debug, PartialEq, Eq)]
pub struct TelemetryRegistration(u64);

/// What a single inbound frame was routed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub telemetry: bool,
    pub state: bool,
}

impl Dispatch {
    pub fn is_dropped(&self) -> bool {
        !self.telemetry && !self.state
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub telemetry: u64,
    /// Telemetry that arrived while no handler was registered.
    pub telemetry_unhandled: u64,
    pub state_applied: u64,
    /// `state` frames seen by a router with no mirror (the client side).
    pub state_ignored: u64,
    pub malformed: u64,
    pub unrecognized: u64,
}

#[derive(Default)]
struct Counters {
    telemetry: AtomicU64,
    telemetry_unhandled: AtomicU64,
    state_applied: AtomicU64,
    state_ignored: AtomicU64,
    malformed: AtomicU64,
    unrecognized: AtomicU64,
}

/// Splits the shared data channel into the telemetry and state streams.
pub struct DataChannelRouter {
    slot: RwLock<Option<(u64, TelemetryHandler)>>,
    next_registration: AtomicU64,
    mirror: Option<Arc<StateMirror>>,
    counters: Counters,
}

impl DataChannelRouter {
    /// Client routers never apply inbound state; the client is the source of truth.
    pub fn for_client() -> Self {
        Self::new(None)
    }

    pub fn for_remote(mirror: Arc<StateMirror>) -> Self {
        Self::new(Some(mirror))
    }

    fn new(mirror: Option<Arc<StateMirror>>) -> Self {
        Self {
            slot: RwLock::new(None),
            next_registration: AtomicU64::new(1),
            mirror,
            counters: Counters::default(),
        }
    }

    /// Installs the telemetry consumer, replacing any previous one.
    pub fn register_telemetry_handler<F>(&self, handler: F) -> TelemetryRegistration
    where
        F: Fn(EndpointId, &SensorSample) + Send + Sync + 'static,
    {
        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let previous = self.slot.write().replace((id, Arc::new(handler)));
        if let Some((old, _)) = previous {
            debug!(target = TARGET, replaced = old, registration = id, "telemetry handler replaced");
        }
        TelemetryRegistration(id)
    }

    /// Clears the slot if `registration` is still the active handler.
    pub fn unregister(&self, registration: TelemetryRegistration) -> bool {
        let mut slot = self.slot.write();
        match slot.as_ref() {
            Some((active, _)) if *active == registration.0 => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_telemetry_handler(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Routes one raw frame. Never fails: frames that are not a JSON object
    /// with a `data` or `state` key are counted and dropped. The two keys are
    /// routed independently, so a bad one does not drop the other.
    pub fn dispatch(&self, endpoint: EndpointId, raw: &[u8]) -> Dispatch {
        let frame = match decode_frame(raw) {
            Ok(frame) => frame,
            Err(err) => {
                self.reject(endpoint, raw, "frame", &err);
                return Dispatch::default();
            }
        };
        if frame.is_unrecognized() {
            self.counters.unrecognized.fetch_add(1, Ordering::Relaxed);
            trace!(
                target = TARGET,
                %endpoint,
                frame = %frame_preview(raw),
                "dropping frame with neither data nor state"
            );
            return Dispatch::default();
        }

        let mut outcome = Dispatch::default();
        match frame.data {
            Some(Ok(sample)) => outcome.telemetry = self.deliver_telemetry(endpoint, &sample),
            Some(Err(err)) => self.reject(endpoint, raw, "data", &err),
            None => {}
        }
        match frame.state {
            Some(Ok(snapshot)) => outcome.state = self.apply_state(endpoint, snapshot),
            Some(Err(err)) => self.reject(endpoint, raw, "state", &err),
            None => {}
        }
        outcome
    }

    fn reject(&self, endpoint: EndpointId, raw: &[u8], part: &'static str, err: &ProtoError) {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
        trace!(
            target = TARGET,
            %endpoint,
            part,
            error = %err,
            frame = %frame_preview(raw),
            "dropping malformed payload"
        );
    }

    fn apply_state(&self, endpoint: EndpointId, snapshot: SessionStateSnapshot) -> bool {
        match &self.mirror {
            Some(mirror) => {
                mirror.apply(snapshot);
                self.counters.state_applied.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                self.counters.state_ignored.fetch_add(1, Ordering::Relaxed);
                trace!(target = TARGET, %endpoint, "ignoring inbound state on authoritative side");
                false
            }
        }
    }

    fn deliver_telemetry(&self, endpoint: EndpointId, sample: &SensorSample) -> bool {
        let handler = self.slot.read().as_ref().map(|(_, handler)| Arc::clone(handler));
        match handler {
            Some(handler) => {
                handler(endpoint, sample);
                self.counters.telemetry.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                self.counters.telemetry_unhandled.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            telemetry: self.counters.telemetry.load(Ordering::Relaxed),
            telemetry_unhandled: self.counters.telemetry_unhandled.load(Ordering::Relaxed),
            state_applied: self.counters.state_applied.load(Ordering::Relaxed),
            state_ignored: self.counters.state_ignored.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            unrecognized: self.counters.unrecognized.load(Ordering::Relaxed),
        }
    }
}

/// Printable head of a frame for logs; long frames are cut and the rest is
/// reported as a byte count.
fn frame_preview(raw: &[u8]) -> String {
    let head = &raw[..raw.len().min(PREVIEW_BYTES)];
    let mut preview = format!("\"{}\"", String::from_utf8_lossy(head).escape_debug());
    if raw.len() > head.len() {
        preview.push_str(&format!(" (+{} bytes)", raw.len() - head.len()));
    }
    preview
}
