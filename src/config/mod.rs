use chrono::TimeDelta;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::filter::to_filter_list;
use crate::metering_sml::transport::TransportOptions;
use crate::serial::LineConfig;

const CONFIG_PATHS: [&str; 2] = ["config/samler.yaml", "samler.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to parse config: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

fn mqtt_host_default() -> String { return "localhost".to_string() }
fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "samler".to_string() }
fn mqtt_base_topic_default() -> String { return "samler".to_string() }

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MqttConfig {
    #[serde(default="mqtt_host_default")]
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_base_topic_default")]
    pub base_topic: String,
}

fn filter_resend_after_secs_default() -> u64 { return 60 }

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FilterConfig {
    /// Idents ("C.D.E") to publish, empty for all
    #[serde(default)]
    pub idents: Vec<String>,
    /// Unchanged values are published again after this many seconds
    #[serde(default="filter_resend_after_secs_default")]
    pub resend_after_secs: u64,
}

fn cache_path_default() -> String {
    match std::env::var("HOME") {
        Ok(home) => format!("{}/.samler", home),
        Err(_) => ".samler".to_string(),
    }
}
fn cache_circuit_open_secs_default() -> u64 { return 30 }

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    /// Directory measurements wait in while the broker is unreachable
    #[serde(default="cache_path_default")]
    pub path: String,
    /// Publishing pauses this many seconds after a failure
    #[serde(default="cache_circuit_open_secs_default")]
    pub circuit_open_secs: u64,
}

fn mqtt_default() -> MqttConfig {
    return MqttConfig {
        host: mqtt_host_default(),
        port: mqtt_port_default(),
        user: String::new(),
        pass: String::new(),
        client_name: mqtt_client_name_default(),
        base_topic: mqtt_base_topic_default(),
    }
}
fn filter_default() -> FilterConfig { return FilterConfig { idents: Vec::new(), resend_after_secs: filter_resend_after_secs_default() } }
fn cache_default() -> CacheConfig { return CacheConfig { path: cache_path_default(), circuit_open_secs: cache_circuit_open_secs_default() } }

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub device: LineConfig,
    #[serde(default)]
    pub transport: TransportOptions,
    #[serde(default="mqtt_default")]
    pub mqtt: MqttConfig,
    #[serde(default="filter_default")]
    pub filter: FilterConfig,
    #[serde(default="cache_default")]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: LineConfig::default(),
            transport: TransportOptions::default(),
            mqtt: mqtt_default(),
            filter: filter_default(),
            cache: cache_default(),
        }
    }
}

impl Config {
    /// Loads the config file named by `SAMLER_CONFIG`, or the first of `config/samler.yaml`
    /// and `samler.yaml` that exists, and applies the environment on top. Without any file
    /// the defaults are used.
    pub fn load() -> Result<Config, ConfigError> {
        let mut config = match std::env::var("SAMLER_CONFIG") {
            Ok(path) => Config::load_from_path(Path::new(&path))?,
            Err(_) => match CONFIG_PATHS.iter().map(Path::new).find(|p| p.exists()) {
                Some(path) => Config::load_from_path(path)?,
                None => {
                    info!("No config file found, using defaults");
                    Config::default()
                }
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
        info!("Loading config from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Config, ConfigError> {
        // an empty file is a valid, all default config
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects durations `TimeDelta` cannot hold
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_seconds("filter.resend_after_secs", self.filter.resend_after_secs)?;
        check_seconds("cache.circuit_open_secs", self.cache.circuit_open_secs)?;
        Ok(())
    }

    /// Overrides single settings with the `SAMLER_*` variables `lookup` knows about
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup("SAMLER_DEVICE") {
            self.device.device = device;
        }
        if let Some(rate) = lookup("SAMLER_DEVICE_BAUD_RATE") {
            self.device.baud_rate = parse_value("SAMLER_DEVICE_BAUD_RATE", &rate)?;
        }
        if let Some(mode) = lookup("SAMLER_DEVICE_MODE") {
            self.device.mode = mode;
        }
        if let Some(filter) = lookup("SAMLER_IDENT_FILTER") {
            // "-" is the documented placeholder for no filter
            self.filter.idents = if filter.trim() == "-" { Vec::new() } else { to_filter_list(&filter) };
        }
        if let Some(host) = lookup("SAMLER_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("SAMLER_MQTT_PORT") {
            self.mqtt.port = parse_value("SAMLER_MQTT_PORT", &port)?;
        }
        if let Some(user) = lookup("SAMLER_MQTT_USER") {
            self.mqtt.user = user;
        }
        if let Some(pass) = lookup("SAMLER_MQTT_PASS") {
            self.mqtt.pass = pass;
        }
        if let Some(path) = lookup("SAMLER_CACHE_PATH") {
            self.cache.path = path;
        }

        debug!("Effective device config: {:?}", self.device);
        Ok(())
    }
}

/// `secs` as `TimeDelta`, `None` where it does not fit
pub fn seconds(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

fn check_seconds(key: &str, secs: u64) -> Result<(), ConfigError> {
    seconds(secs).map(|_| ()).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        value: secs.to_string(),
    })
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
