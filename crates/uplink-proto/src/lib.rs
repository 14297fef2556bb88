//! Wire definitions shared by both ends of an uplink session.
//! Kept separate from the runtime so the browser side can mirror the
//! same JSON shapes without pulling in transport code.

mod envelope;
mod sample;
mod snapshot;

pub use envelope::{Envelope, InboundFrame, decode_frame, encode};
pub use sample::{Acceleration, Orientation, SensorSample};
pub use snapshot::SessionStateSnapshot;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is a json {0}, expected an object")]
    NotAnObject(&'static str),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
