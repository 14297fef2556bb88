use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};
use uplink_proto::{Acceleration, Orientation, SensorSample};

const TARGET: &str = "uplink::sensor";

/// Something the telemetry pump can read once per frame.
pub trait SampleSource: Send + Sync {
    /// Most recent reading. Sources that have seen nothing yet report zeros.
    fn latest(&self) -> SensorSample;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SensorPermission {
    #[default]
    Unknown,
    Granted,
    Denied,
}

#[derive(Default)]
struct HubState {
    permission: SensorPermission,
    sample: SensorSample,
}

/// Latest-value cell fed by the platform's orientation and motion events.
///
/// Orientation and motion arrive as separate events, so each one only
/// replaces its half of the sample. Nothing is recorded until permission
/// has been granted; platforms without a prompt call [`SensorHub::grant`]
/// right away.
#[derive(Default)]
pub struct SensorHub {
    state: RwLock<HubState>,
}

impl SensorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permission(&self) -> SensorPermission {
        self.state.read().permission
    }

    pub fn grant(&self) {
        self.set_permission(SensorPermission::Granted);
    }

    pub fn deny(&self) {
        self.set_permission(SensorPermission::Denied);
    }

    fn set_permission(&self, permission: SensorPermission) {
        self.state.write().permission = permission;
        debug!(target = TARGET, ?permission, "sensor permission updated");
    }

    /// Returns whether the reading was kept.
    pub fn record_orientation(&self, orientation: Orientation) -> bool {
        let mut state = self.state.write();
        if state.permission != SensorPermission::Granted {
            trace!(target = TARGET, "orientation ignored; permission not granted");
            return false;
        }
        state.sample.orientation = orientation;
        true
    }

    /// Returns whether the reading was kept.
    pub fn record_motion(&self, acceleration: Acceleration) -> bool {
        let mut state = self.state.write();
        if state.permission != SensorPermission::Granted {
            trace!(target = TARGET, "motion ignored; permission not granted");
            return false;
        }
        state.sample.acceleration = acceleration;
        true
    }
}

impl SampleSource for SensorHub {
    fn latest(&self) -> SensorSample {
        self.state.read().sample
    }
}

/// Slow deterministic wobble, for running without a device.
#[derive(Default)]
pub struct SyntheticSensor {
    step: AtomicU64,
}

impl SyntheticSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_at(step: u64) -> SensorSample {
        let phase = step as f64 / 30.0;
        SensorSample::new(
            Acceleration {
                x: 0.4 * phase.sin(),
                y: 0.2 * (phase * 0.5).cos(),
                z: 9.81 + 0.1 * (phase * 2.0).sin(),
            },
            Orientation {
                alpha: (step as f64 * 2.0) % 360.0,
                beta: 15.0 * phase.sin(),
                gamma: 10.0 * phase.cos(),
            },
        )
    }
}

impl SampleSource for SyntheticSensor {
    fn latest(&self) -> SensorSample {
        Self::sample_at(self.step.fetch_add(1, Ordering::Relaxed))
    }
}
