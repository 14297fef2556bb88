use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ProtoError, ProtoResult, SensorSample, SessionStateSnapshot};

/// A frame on the shared data channel.
///
/// The two logical streams are told apart purely by which top-level key is
/// present: `data` carries telemetry, `state` carries a session snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SensorSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionStateSnapshot>,
}

/// An inbound frame split into its two streams.
///
/// Each key is decoded on its own so a bad `state` does not cost the
/// telemetry riding in the same frame, and vice versa. `None` means the key
/// was absent or `null`.
#[derive(Debug, Default)]
pub struct InboundFrame {
    pub data: Option<ProtoResult<SensorSample>>,
    pub state: Option<ProtoResult<SessionStateSnapshot>>,
}

impl InboundFrame {
    /// Neither stream's key is present.
    pub fn is_unrecognized(&self) -> bool {
        self.data.is_none() && self.state.is_none()
    }
}

impl Envelope {
    pub fn telemetry(sample: SensorSample) -> Self {
        Self {
            data: Some(sample),
            state: None,
        }
    }

    pub fn state_sync(snapshot: SessionStateSnapshot) -> Self {
        Self {
            data: None,
            state: Some(snapshot),
        }
    }
}

pub fn encode(envelope: &Envelope) -> ProtoResult<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parses a raw frame. Only a frame that is not a JSON object fails as a
/// whole; bad payloads under `data` or `state` fail just that part.
pub fn decode_frame(bytes: &[u8]) -> ProtoResult<InboundFrame> {
    let mut object = match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(object) => object,
        other => return Err(ProtoError::NotAnObject(json_type(&other))),
    };
    Ok(InboundFrame {
        data: take_part(&mut object, "data"),
        state: take_part(&mut object, "state"),
    })
}

fn take_part<T: DeserializeOwned>(object: &mut Map<String, Value>, key: &str) -> Option<ProtoResult<T>> {
    match object.remove(key)? {
        Value::Null => None,
        value => Some(serde_json::from_value(value).map_err(ProtoError::from)),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
