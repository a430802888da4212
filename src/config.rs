//! Presentment settings.
//!
//! Settings are plain serde structs, read from JSON. Missing fields take their defaults.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportOptions;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse settings: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentmentConfig {
    /// Keep a proximity session open after the first response.
    pub allow_multiple_requests: bool,
    /// How long a completed presentment keeps its background tasks alive, so a final state can
    /// be observed before they are cancelled.
    pub completion_grace_ms: u64,
    /// Give up waiting for a reader request after this many seconds.
    pub request_timeout_secs: Option<u64>,
    pub ble: BleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Prefer an L2CAP channel when the peer offers one.
    pub use_l2cap: bool,
    /// MTU requested when acting as GATT client.
    pub desired_mtu: usize,
}

impl Default for PresentmentConfig {
    fn default() -> Self {
        Self {
            allow_multiple_requests: false,
            completion_grace_ms: 500,
            request_timeout_secs: None,
            ble: BleConfig::default(),
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            use_l2cap: true,
            desired_mtu: 515,
        }
    }
}

impl PresentmentConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let config = Self::from_json(&std::fs::read_to_string(path)?)?;
        tracing::debug!("loaded settings from {path:?}");
        Ok(config)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            ble_use_l2cap: self.ble.use_l2cap,
            ble_desired_mtu: self.ble.desired_mtu,
        }
    }
}
