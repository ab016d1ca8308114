//! Add-on options for the Flux irrigation broker
//!
//! # Example
//!
//! ```ignore
//! use flux_config::load_config;
//!
//! // ADDON_OPTIONS, then /data/options.json, then defaults
//! let config = load_config(None)?;
//! let timings = config.timings;
//! ```

mod error;
mod loader;
mod options;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    load_config, ConfigLoader, DEFAULT_OPTIONS_FILE, ENV_ADDON_OPTIONS, ENV_HUB_URL,
    ENV_SUPERVISOR_TOKEN,
};
pub use options::{BrokerConfig, BrokerTimings, RemoteDeviceConfig, DEFAULT_HUB_URL};
