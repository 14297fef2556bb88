use std::env;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;
use url::Url;

pub const DIAL_TIMEOUT_ENV: &str = "UPLINK_DIAL_TIMEOUT_MS";
pub const FRAME_RATE_ENV: &str = "UPLINK_FRAME_RATE";
pub const BASE_URL_ENV: &str = "UPLINK_BASE_URL";
pub const TRANSPORT_ENV: &str = "UPLINK_TRANSPORT";
pub const DISABLE_STUN_ENV: &str = "UPLINK_WEBRTC_DISABLE_STUN";

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FRAME_RATE: u32 = 60;
pub const MAX_FRAME_RATE: u32 = 240;
pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";

pub(crate) fn env_truthy(var: &str) -> Option<bool> {
    env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum TransportChoice {
    /// In-process switchboard, no networking
    #[default]
    Local,
    /// WebRTC data channels with in-process signaling
    Webrtc,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("UPLINK_BASE_URL is not a valid url: {0}")]
    InvalidBaseUrl(String),
    #[error("UPLINK_TRANSPORT must be `local` or `webrtc`, got {0:?}")]
    UnknownTransport(String),
}

/// Uplink process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a dial may stay negotiating before it is failed
    pub dial_timeout: Duration,
    /// Telemetry frames per second on the remote
    pub frame_rate: u32,
    /// Origin the client's join link points at
    pub base_url: Url,
    pub transport: TransportChoice,
    pub disable_stun: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            frame_rate: DEFAULT_FRAME_RATE,
            base_url: default_base_url(),
            transport: TransportChoice::Local,
            disable_stun: false,
        }
    }
}

fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("default base url parses")
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = read_number(DIAL_TIMEOUT_ENV)? {
            config.dial_timeout = Duration::from_millis(ms);
        }
        if let Some(rate) = read_number(FRAME_RATE_ENV)? {
            config.frame_rate = clamp_frame_rate(rate.min(u64::from(u32::MAX)) as u32);
        }
        if let Some(base) = read_var(BASE_URL_ENV) {
            config.base_url = Url::parse(&base).map_err(|_| ConfigError::InvalidBaseUrl(base))?;
        }
        if let Some(transport) = read_var(TRANSPORT_ENV) {
            config.transport = TransportChoice::from_str(&transport, true)
                .map_err(|_| ConfigError::UnknownTransport(transport))?;
        }
        config.disable_stun = env_truthy(DISABLE_STUN_ENV).unwrap_or(false);
        Ok(config)
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = clamp_frame_rate(frame_rate);
        self
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            dial_timeout: self.dial_timeout,
            frame_interval: frame_interval(self.frame_rate),
        }
    }
}

/// Timing knobs a session needs at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub dial_timeout: Duration,
    pub frame_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            frame_interval: frame_interval(DEFAULT_FRAME_RATE),
        }
    }
}

pub fn clamp_frame_rate(rate: u32) -> u32 {
    rate.clamp(1, MAX_FRAME_RATE)
}

pub fn frame_interval(rate: u32) -> Duration {
    Duration::from_secs(1) / clamp_frame_rate(rate)
}

fn read_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_number(var: &'static str) -> Result<Option<u64>, ConfigError> {
    let Some(value) = read_var(var) else {
        return Ok(None);
    };
    match value.parse::<u64>() {
        Ok(number) if number > 0 => Ok(Some(number)),
        _ => Err(ConfigError::InvalidNumber { var, value }),
    }
}
