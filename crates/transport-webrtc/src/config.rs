use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "uplink";

/// Configuration for the WebRTC peer transport
#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Data channel label
    pub data_channel_label: String,
    /// Whether the data channel should be ordered
    pub ordered: bool,
    /// Maximum number of retransmissions for unreliable channels
    pub max_retransmits: Option<u16>,
    /// How long ICE may stay disconnected before the channel is failed
    pub ice_disconnected_timeout: Duration,
    pub ice_failed_timeout: Duration,
    pub ice_keepalive_interval: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            data_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: true,
            max_retransmits: None,
            ice_disconnected_timeout: Duration::from_secs(3),
            ice_failed_timeout: Duration::from_secs(10),
            ice_keepalive_interval: Duration::from_millis(500),
        }
    }
}

impl WebRtcConfig {
    /// Default configuration, minus public STUN when `disable_stun` is set.
    pub fn new(disable_stun: bool) -> Self {
        if disable_stun {
            Self::localhost()
        } else {
            Self::default()
        }
    }

    /// Host candidates only; both ends must share a network.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn builder() -> WebRtcConfigBuilder {
        WebRtcConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct WebRtcConfigBuilder {
    ice_servers: Vec<RTCIceServer>,
    data_channel_label: Option<String>,
    ordered: Option<bool>,
    max_retransmits: Option<u16>,
}

impl WebRtcConfigBuilder {
    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = Some(label.into());
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = Some(ordered);
        self
    }

    pub fn max_retransmits(mut self, max_retransmits: u16) -> Self {
        self.max_retransmits = Some(max_retransmits);
        self
    }

    pub fn build(self) -> Result<WebRtcConfig, String> {
        let label = self
            .data_channel_label
            .unwrap_or_else(|| DEFAULT_CHANNEL_LABEL.to_string());
        if label.trim().is_empty() {
            return Err("data channel label must not be empty".into());
        }
        let ordered = self.ordered.unwrap_or(true);
        if ordered && self.max_retransmits.is_some() {
            return Err("max_retransmits only applies to unordered channels".into());
        }
        Ok(WebRtcConfig {
            ice_servers: self.ice_servers,
            data_channel_label: label,
            ordered,
            max_retransmits: self.max_retransmits,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_public_stun_and_ordered_channel() {
        let config = WebRtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert_eq!(config.data_channel_label, "uplink");
        assert!(config.ordered);
    }

    #[test]
    fn disabling_stun_drops_ice_servers() {
        assert!(WebRtcConfig::new(true).ice_servers.is_empty());
        assert_eq!(WebRtcConfig::new(false).ice_servers.len(), 1);
    }

    #[test]
    fn builder_validates_channel_options() {
        let config = WebRtcConfig::builder()
            .add_ice_server(vec!["stun:example.test:3478".into()])
            .data_channel_label("telemetry")
            .build()
            .expect("valid config");
        assert_eq!(config.data_channel_label, "telemetry");
        assert_eq!(config.ice_servers.len(), 1);

        assert!(WebRtcConfig::builder().data_channel_label(" ").build().is_err());
        assert!(
            WebRtcConfig::builder()
                .max_retransmits(0)
                .build()
                .is_err()
        );
        let lossy = WebRtcConfig::builder()
            .ordered(false)
            .max_retransmits(0)
            .build()
            .expect("unordered config");
        assert_eq!(lossy.max_retransmits, Some(0));
    }
}
