use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Full set of replicated session UI flags.
///
/// Only the client ever mutates a snapshot; remotes receive whole copies.
/// Flags this build does not know about are kept in `extra` so a newer
/// client can add fields without breaking older mirrors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStateSnapshot {
    #[serde(default, rename = "showAbout")]
    pub show_about: bool,
    #[serde(default, rename = "showCV")]
    pub show_cv: bool,
    #[serde(default, rename = "headlightsOn")]
    pub headlights_on: bool,
    #[serde(default, rename = "taillightsOn")]
    pub taillights_on: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SessionStateSnapshot {
    /// Reads a flag by its wire name, including the typed ones.
    pub fn flag(&self, name: &str) -> Option<Value> {
        match name {
            "showAbout" => Some(Value::Bool(self.show_about)),
            "showCV" => Some(Value::Bool(self.show_cv)),
            "headlightsOn" => Some(Value::Bool(self.headlights_on)),
            "taillightsOn" => Some(Value::Bool(self.taillights_on)),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Writes a flag by its wire name. Typed flags only accept booleans;
    /// returns `false` when the value was rejected.
    pub fn set_flag(&mut self, name: &str, value: Value) -> bool {
        let slot = match name {
            "showAbout" => &mut self.show_about,
            "showCV" => &mut self.show_cv,
            "headlightsOn" => &mut self.headlights_on,
            "taillightsOn" => &mut self.taillights_on,
            other => {
                self.extra.insert(other.to_string(), value);
                return true;
            }
        };
        match value {
            Value::Bool(flag) => {
                *slot = flag;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uses_browser_field_names() {
        let snapshot = SessionStateSnapshot {
            show_cv: true,
            headlights_on: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(
            value,
            json!({
                "showAbout": false,
                "showCV": true,
                "headlightsOn": true,
                "taillightsOn": false,
            })
        );
    }

    #[test]
    fn keeps_unknown_flags() {
        let snapshot: SessionStateSnapshot =
            serde_json::from_value(json!({"showAbout": true, "showIntro": false, "theme": "neon"}))
                .expect("decode");
        assert!(snapshot.show_about);
        assert!(!snapshot.taillights_on);
        assert_eq!(snapshot.flag("theme"), Some(json!("neon")));

        let value = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(value["showIntro"], json!(false));
    }

    #[test]
    fn typed_flags_reject_non_booleans() {
        let mut snapshot = SessionStateSnapshot::default();
        assert!(!snapshot.set_flag("headlightsOn", json!("yes")));
        assert!(!snapshot.headlights_on);
        assert!(snapshot.set_flag("headlightsOn", json!(true)));
        assert!(snapshot.headlights_on);
        assert!(snapshot.set_flag("fogLights", json!(true)));
        assert_eq!(snapshot.flag("fogLights"), Some(json!(true)));
    }
}
