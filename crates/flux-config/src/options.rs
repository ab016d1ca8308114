//! Typed broker options

use std::collections::HashSet;
use std::time::Duration;

use flux_core::EntityId;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Hub base URL inside the add-on container
pub const DEFAULT_HUB_URL: &str = "http://supervisor/core";

/// Broker configuration, as read from the add-on options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Hub base URL (REST lives under `{hub_url}/api`)
    pub hub_url: String,

    /// Explicit WebSocket URL; derived from `hub_url` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_ws_url: Option<String>,

    /// Long-lived access token for the hub
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_token: Option<String>,

    /// Controller device id in the hub's device registry
    pub irrigation_device_id: String,

    /// Explicit controller roster; resolved from the registry when empty
    pub controller_entities: Vec<String>,

    /// Remote keypads mirrored with the controller
    pub remote_devices: Vec<RemoteDeviceConfig>,

    /// Moisture probe sensors fed to the probe hook
    pub probe_sensor_entities: Vec<String>,

    /// Initial 12/24-hour flag, superseded by the controller's own entity
    pub use_12_hour_format: bool,

    /// Log filter used when RUST_LOG is not set
    pub log_level: String,

    /// Delays and TTLs
    pub timings: BrokerTimings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hub_url: DEFAULT_HUB_URL.to_string(),
            hub_ws_url: None,
            hub_token: None,
            irrigation_device_id: String::new(),
            controller_entities: Vec::new(),
            remote_devices: Vec::new(),
            probe_sensor_entities: Vec::new(),
            use_12_hour_format: false,
            log_level: "info".to_string(),
            timings: BrokerTimings::default(),
        }
    }
}

/// One remote keypad device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDeviceConfig {
    /// Device id in the hub's device registry
    pub device_id: String,

    /// Display name used in logs
    #[serde(default)]
    pub name: String,

    /// Explicit roster; resolved from the registry when empty
    #[serde(default)]
    pub entities: Vec<String>,
}

impl RemoteDeviceConfig {
    /// Name for logs, falling back to the device id
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.device_id
        } else {
            &self.name
        }
    }
}

/// Delays and TTLs, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerTimings {
    pub mirror_guard_ttl_ms: u64,
    pub pre_announce_ttl_ms: u64,
    pub resync_initial_settle_ms: u64,
    pub resync_second_settle_ms: u64,
    pub resync_final_settle_ms: u64,
    pub timeline_debounce_ms: u64,
    pub poll_interval_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for BrokerTimings {
    fn default() -> Self {
        Self {
            mirror_guard_ttl_ms: 2_000,
            pre_announce_ttl_ms: 15_000,
            resync_initial_settle_ms: 3_000,
            resync_second_settle_ms: 5_000,
            resync_final_settle_ms: 3_000,
            timeline_debounce_ms: 3_000,
            poll_interval_ms: 10_000,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl BrokerTimings {
    pub fn mirror_guard_ttl(&self) -> Duration {
        Duration::from_millis(self.mirror_guard_ttl_ms)
    }

    pub fn pre_announce_ttl(&self) -> Duration {
        Duration::from_millis(self.pre_announce_ttl_ms)
    }

    pub fn resync_initial_settle(&self) -> Duration {
        Duration::from_millis(self.resync_initial_settle_ms)
    }

    pub fn resync_second_settle(&self) -> Duration {
        Duration::from_millis(self.resync_second_settle_ms)
    }

    pub fn resync_final_settle(&self) -> Duration {
        Duration::from_millis(self.resync_final_settle_ms)
    }

    pub fn timeline_debounce(&self) -> Duration {
        Duration::from_millis(self.timeline_debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    fn as_named(&self) -> [(&'static str, u64); 9] {
        [
            ("mirror_guard_ttl_ms", self.mirror_guard_ttl_ms),
            ("pre_announce_ttl_ms", self.pre_announce_ttl_ms),
            ("resync_initial_settle_ms", self.resync_initial_settle_ms),
            ("resync_second_settle_ms", self.resync_second_settle_ms),
            ("resync_final_settle_ms", self.resync_final_settle_ms),
            ("timeline_debounce_ms", self.timeline_debounce_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("reconnect_initial_delay_ms", self.reconnect_initial_delay_ms),
            ("reconnect_max_delay_ms", self.reconnect_max_delay_ms),
        ]
    }
}

impl BrokerConfig {
    /// WebSocket endpoint of the hub
    ///
    /// The supervisor proxy serves it at `/core/websocket`, a directly
    /// reachable hub at `/api/websocket`.
    pub fn websocket_url(&self) -> String {
        if let Some(url) = &self.hub_ws_url {
            return url.clone();
        }
        let base = self.hub_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        if ws_base.ends_with("/core") {
            format!("{ws_base}/websocket")
        } else {
            format!("{ws_base}/api/websocket")
        }
    }

    /// Parse a list of configured entity ids
    pub fn parse_entity_ids(key: &str, ids: &[String]) -> ConfigResult<Vec<EntityId>> {
        ids.iter()
            .map(|id| {
                id.parse::<EntityId>()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: key.to_string(),
                        reason: format!("'{id}': {e}"),
                    })
            })
            .collect()
    }

    /// Check the configuration for values the broker cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.hub_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "hub_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        if self.irrigation_device_id.is_empty() && self.controller_entities.is_empty() {
            return Err(ConfigError::ValidationFailed {
                message: "either irrigation_device_id or controller_entities must be set"
                    .to_string(),
            });
        }

        Self::parse_entity_ids("controller_entities", &self.controller_entities)?;
        Self::parse_entity_ids("probe_sensor_entities", &self.probe_sensor_entities)?;

        let mut seen = HashSet::new();
        for remote in &self.remote_devices {
            if remote.device_id.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "remote_devices".to_string(),
                    reason: "device_id must not be empty".to_string(),
                });
            }
            if remote.device_id == self.irrigation_device_id {
                return Err(ConfigError::ValidationFailed {
                    message: format!(
                        "remote device '{}' is the irrigation controller itself",
                        remote.device_id
                    ),
                });
            }
            if !seen.insert(remote.device_id.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    message: format!("remote device '{}' listed twice", remote.device_id),
                });
            }
            Self::parse_entity_ids(
                &format!("remote_devices.{}.entities", remote.device_id),
                &remote.entities,
            )?;
        }

        for (name, value) in self.timings.as_named() {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("timings.{name}"),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.timings.reconnect_max_delay_ms < self.timings.reconnect_initial_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "timings.reconnect_max_delay_ms".to_string(),
                reason: "must not be below reconnect_initial_delay_ms".to_string(),
            });
        }

        Ok(())
    }
}
