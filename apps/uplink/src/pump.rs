use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace};
use uplink_proto::Envelope;

use crate::identity::RemoteIdentity;
use crate::sensor::SampleSource;

const TARGET: &str = "uplink::pump";

pub type SendFn = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PumpError {
    #[error("no tokio runtime available to drive the frame loop")]
    NoRuntime,
}

/// Streams the latest sensor sample once per frame, fire-and-forget.
///
/// Frame-gated, not sample-gated: however many readings land between two
/// ticks, only the newest goes out, and it goes out even if it did not
/// change.
pub struct ContinuousTelemetryPump {
    frame_interval: Duration,
    frames: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ContinuousTelemetryPump {
    pub fn new(_identity: &RemoteIdentity, frame_interval: Duration) -> Self {
        Self {
            frame_interval,
            frames: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    /// Starts the frame loop, replacing any loop already running.
    pub fn start<F>(&self, source: Arc<dyn SampleSource>, send: F) -> Result<(), PumpError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| PumpError::NoRuntime)?;
        let send: SendFn = Arc::new(send);
        let frames = Arc::clone(&self.frames);
        let period = self.frame_interval;

        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
            debug!(target = TARGET, "restarting frame loop");
        }
        *task = Some(runtime.spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                run_frame(source.as_ref(), send.as_ref(), &frames);
            }
        }));
        debug!(
            target = TARGET,
            frame_ms = period.as_secs_f64() * 1000.0,
            "frame loop started"
        );
        Ok(())
    }

    /// Cancels the frame loop. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!(target = TARGET, frames = self.frames_sent(), "frame loop stopped");
        }
    }

    /// One frame's worth of work outside the loop.
    pub fn tick(&self, source: &dyn SampleSource, send: &dyn Fn(&Envelope)) {
        run_frame(source, send, &self.frames);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ContinuousTelemetryPump {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

fn run_frame(source: &dyn SampleSource, send: &dyn Fn(&Envelope), frames: &AtomicU64) {
    let sample = source.latest();
    send(&Envelope::telemetry(sample));
    let frame = frames.fetch_add(1, Ordering::Relaxed) + 1;
    trace!(target = TARGET, frame, "telemetry frame sent");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, IdentityResolver, LaunchParameters};
    use crate::sensor::{SensorHub, SyntheticSensor};
    use uplink_proto::{Orientation, SensorSample};

    const FRAME: Duration = Duration::from_millis(16);

    fn pump() -> ContinuousTelemetryPump {
        let Identity::Remote(remote) =
            IdentityResolver::resolve(&LaunchParameters::from_query("id=client"))
        else {
            panic!("expected remote identity");
        };
        ContinuousTelemetryPump::new(&remote, FRAME)
    }

    fn recorder() -> (Arc<Mutex<Vec<SensorSample>>>, impl Fn(&Envelope) + Send + Sync + 'static) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        (sent, move |envelope: &Envelope| {
            if let Some(sample) = envelope.data {
                sink.lock().push(sample);
            }
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn stop_before_start_is_harmless() {
        let pump = pump();
        pump.stop();
        pump.stop();
        assert!(!pump.is_running());
        assert_eq!(pump.frames_sent(), 0);
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let pump = pump();
        let (_, send) = recorder();
        assert_eq!(
            pump.start(Arc::new(SyntheticSensor::new()), send),
            Err(PumpError::NoRuntime)
        );
    }

    #[test]
    fn tick_sends_unchanged_samples_too() {
        let pump = pump();
        let hub = SensorHub::new();
        let (sent, send) = recorder();
        pump.tick(&hub, &send);
        pump.tick(&hub, &send);
        assert_eq!(sent.lock().len(), 2);
        assert_eq!(pump.frames_sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_readings_within_a_frame_send_once() {
        let pump = pump();
        let hub = Arc::new(SensorHub::new());
        hub.grant();
        let (sent, send) = recorder();
        pump.start(Arc::clone(&hub) as Arc<dyn SampleSource>, send)
            .expect("start");
        settle().await;
        assert_eq!(sent.lock().len(), 1, "first frame fires immediately");

        for alpha in [10.0, 20.0, 30.0] {
            hub.record_orientation(Orientation {
                alpha,
                beta: 0.0,
                gamma: 0.0,
            });
        }
        time::advance(FRAME).await;
        settle().await;

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].orientation.alpha, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_the_loop() {
        let pump = pump();
        let (sent, send) = recorder();
        pump.start(Arc::new(SyntheticSensor::new()), send).expect("start");
        assert!(pump.is_running());
        for _ in 0..3 {
            time::advance(FRAME).await;
            settle().await;
        }
        pump.stop();
        pump.stop();
        assert!(!pump.is_running());

        let frozen = sent.lock().len();
        assert!(frozen >= 3);
        time::advance(FRAME * 10).await;
        settle().await;
        assert_eq!(sent.lock().len(), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_running_loop() {
        let pump = pump();
        let (first, send_first) = recorder();
        let (second, send_second) = recorder();
        pump.start(Arc::new(SyntheticSensor::new()), send_first).expect("start");
        settle().await;
        pump.start(Arc::new(SyntheticSensor::new()), send_second).expect("restart");
        settle().await;

        let before = first.lock().len();
        time::advance(FRAME * 5).await;
        settle().await;
        assert_eq!(first.lock().len(), before);
        assert!(second.lock().len() >= 2);
    }
}
