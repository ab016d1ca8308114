//! Options loading
//!
//! Sources, first match wins:
//! - an explicit path (`.json`, `.yaml` or `.yml`)
//! - the `ADDON_OPTIONS` environment variable (JSON)
//! - the add-on options file (`/data/options.json`)
//! - built-in defaults
//!
//! After that, `SUPERVISOR_TOKEN` and `FLUX_HUB_URL` override the hub token
//! and base URL. YAML files may use `!env_var NAME` for any scalar.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, info, trace, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::options::BrokerConfig;

/// Add-on options file written by the supervisor
pub const DEFAULT_OPTIONS_FILE: &str = "/data/options.json";

/// Env var carrying the options JSON at startup
pub const ENV_ADDON_OPTIONS: &str = "ADDON_OPTIONS";

/// Env var carrying the supervisor's hub token
pub const ENV_SUPERVISOR_TOKEN: &str = "SUPERVISOR_TOKEN";

/// Env var overriding the hub base URL
pub const ENV_HUB_URL: &str = "FLUX_HUB_URL";

/// Where environment lookups are answered from
#[derive(Debug, Clone)]
enum EnvSource {
    Process,
    Fixed(HashMap<String, String>),
}

impl EnvSource {
    fn get(&self, var: &str) -> Option<String> {
        match self {
            Self::Process => std::env::var(var).ok(),
            Self::Fixed(map) => map.get(var).cloned(),
        }
    }
}

/// Loads and validates `BrokerConfig`
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    options_file: PathBuf,
    env: EnvSource,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader reading the process environment and the default options file
    pub fn new() -> Self {
        Self {
            options_file: PathBuf::from(DEFAULT_OPTIONS_FILE),
            env: EnvSource::Process,
        }
    }

    /// Use a different fallback options file
    pub fn with_options_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.options_file = path.into();
        self
    }

    /// Answer environment lookups from a fixed map instead of the process
    pub fn with_env(mut self, vars: HashMap<String, String>) -> Self {
        self.env = EnvSource::Fixed(vars);
        self
    }

    /// Load, apply env overrides and validate
    pub fn load(&self, path: Option<&Path>) -> ConfigResult<BrokerConfig> {
        let mut config = self.load_unvalidated(path)?;
        self.apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Load and apply env overrides without validating
    pub fn load_unvalidated(&self, path: Option<&Path>) -> ConfigResult<BrokerConfig> {
        if let Some(path) = path {
            info!(path = %path.display(), "Loading options file");
            return self.load_file(path);
        }

        if let Some(raw) = self.env.get(ENV_ADDON_OPTIONS) {
            match serde_json::from_str::<BrokerConfig>(&raw) {
                Ok(config) => {
                    info!("Loaded options from {}", ENV_ADDON_OPTIONS);
                    return Ok(config);
                }
                Err(e) => warn!(error = %e, "Ignoring malformed {}", ENV_ADDON_OPTIONS),
            }
        }

        if self.options_file.exists() {
            info!(path = %self.options_file.display(), "Loading add-on options");
            return self.load_file(&self.options_file);
        }

        warn!("No options found, using defaults");
        Ok(BrokerConfig::default())
    }

    fn apply_env_overrides(&self, config: &mut BrokerConfig) {
        match self.env.get(ENV_SUPERVISOR_TOKEN).filter(|t| !t.is_empty()) {
            Some(token) => {
                debug!(len = token.len(), "Hub token loaded from {}", ENV_SUPERVISOR_TOKEN);
                config.hub_token = Some(token);
            }
            None if config.hub_token.is_none() => {
                warn!("{} is empty or missing, hub calls will fail", ENV_SUPERVISOR_TOKEN);
            }
            None => {}
        }

        if let Some(url) = self.env.get(ENV_HUB_URL).filter(|u| !u.is_empty()) {
            debug!(url = %url, "Hub URL overridden by {}", ENV_HUB_URL);
            config.hub_url = url;
        }
    }

    fn load_file(&self, path: &Path) -> ConfigResult<BrokerConfig> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::ParseJson {
                origin: path.display().to_string(),
                source: e,
            }),
            Some("yaml") | Some("yml") => self.load_yaml_string(&content, path),
            _ => Err(ConfigError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Parse YAML options, resolving `!env_var` tags
    pub fn load_yaml_string(&self, content: &str, source_path: &Path) -> ConfigResult<BrokerConfig> {
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;
        let value = self.process_value(value)?;
        serde_yaml::from_value(value).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })
    }

    fn process_value(&self, value: Value) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                trace!("Processing tag '{}'", tag);
                match tag.as_str() {
                    "!env_var" => self.process_env_var(tagged.value),
                    _ => Err(ConfigError::InvalidValue {
                        key: tag,
                        reason: "unsupported YAML tag".to_string(),
                    }),
                }
            }
            Value::Mapping(map) => {
                let mut result = serde_yaml::Mapping::new();
                for (k, v) in map {
                    result.insert(k, self.process_value(v)?);
                }
                Ok(Value::Mapping(result))
            }
            Value::Sequence(seq) => {
                let result: ConfigResult<Vec<Value>> =
                    seq.into_iter().map(|v| self.process_value(v)).collect();
                Ok(Value::Sequence(result?))
            }
            _ => Ok(value),
        }
    }

    fn process_env_var(&self, value: Value) -> ConfigResult<Value> {
        let var_name = match value {
            Value::String(s) => s,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "!env_var".to_string(),
                    reason: "environment variable name must be a string".to_string(),
                })
            }
        };

        let env_value = self
            .env
            .get(&var_name)
            .ok_or_else(|| ConfigError::EnvVarNotFound {
                var: var_name.clone(),
            })?;

        debug!("Substituted env var: {}", var_name);
        Ok(Value::String(env_value))
    }
}

/// Load options with the process environment and default options file
pub fn load_config(path: Option<&Path>) -> ConfigResult<BrokerConfig> {
    ConfigLoader::new().load(path)
}
