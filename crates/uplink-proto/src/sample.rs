use serde::{Deserialize, Deserializer, Serialize};

/// Device acceleration in m/s², excluding gravity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Acceleration {
    #[serde(default, deserialize_with = "null_as_zero")]
    pub x: f64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub y: f64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub z: f64,
}

/// Device orientation in degrees (z, x and y axis rotations).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    #[serde(default, deserialize_with = "null_as_zero")]
    pub alpha: f64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub beta: f64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub gamma: f64,
}

/// One reading from the remote's motion sensors.
///
/// On the wire both halves are flattened into a single object:
/// `{ "x", "y", "z", "alpha", "beta", "gamma" }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    #[serde(flatten)]
    pub acceleration: Acceleration,
    #[serde(flatten)]
    pub orientation: Orientation,
}

impl SensorSample {
    pub fn new(acceleration: Acceleration, orientation: Orientation) -> Self {
        Self {
            acceleration,
            orientation,
        }
    }
}

// Browsers report `null` for axes the device cannot measure.
fn null_as_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_both_axes_into_one_object() {
        let sample = SensorSample::new(
            Acceleration {
                x: 0.5,
                y: -1.0,
                z: 9.0,
            },
            Orientation {
                alpha: 180.0,
                beta: 12.5,
                gamma: -3.0,
            },
        );
        let value = serde_json::to_value(sample).expect("serialize");
        assert_eq!(value["x"], 0.5);
        assert_eq!(value["z"], 9.0);
        assert_eq!(value["alpha"], 180.0);
        assert_eq!(value["gamma"], -3.0);
        assert!(value.get("acceleration").is_none());
    }

    #[test]
    fn missing_and_null_axes_read_as_zero() {
        let sample: SensorSample =
            serde_json::from_str(r#"{"alpha": null, "beta": 4.0, "x": 1.5}"#).expect("decode");
        assert_eq!(sample.orientation.alpha, 0.0);
        assert_eq!(sample.orientation.beta, 4.0);
        assert_eq!(sample.orientation.gamma, 0.0);
        assert_eq!(sample.acceleration.x, 1.5);
        assert_eq!(sample.acceleration.y, 0.0);
    }
}
