//! Configuration module
//!
//! Handles loading and saving padlink configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::browser::ControllerType;
use crate::discovery::{self, DiscoveryError};
use crate::network;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Service discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Remote session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Input publishing settings
    #[serde(default)]
    pub input: InputConfig,

    /// Browser settings
    #[serde(default)]
    pub browser: BrowserConfig,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name advertised to peers and given to published controllers
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "padlink".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to bind to (default: all)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Port of the control listener, 0 for OS-assigned
    #[serde(default)]
    pub control_port: u16,
    /// Port of the input socket, 0 for OS-assigned
    #[serde(default)]
    pub input_port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Largest accepted control frame
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            control_port: 0,
            input_port: 0,
            connect_timeout_ms: default_connect_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Service identifier, advertised as `_<identifier>._tcp.local.`
    #[serde(default = "default_service_identifier")]
    pub service_identifier: String,
    /// Advertise and browse at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_service_identifier() -> String {
    "padlink".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_identifier: default_service_identifier(),
            enabled: true,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a dropped controller may take to come back (ms)
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

fn default_grace_period() -> u64 {
    12_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
        }
    }
}

/// What the publisher sends for each input change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// One message per changed button or joystick
    #[default]
    Deltas,
    /// The whole gamepad state after every change
    FullState,
}

/// Input configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Coalesce changes per input within this window; unset sends every change
    pub coalesce_interval_ms: Option<u64>,
    #[serde(default)]
    pub publish_mode: PublishMode,
    /// Connect to every browser found
    #[serde(default)]
    pub auto_connect: bool,
}

/// Browser configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Controller types the browser takes in; without `remote` it does not
    /// listen or advertise
    #[serde(default = "default_controller_types")]
    pub controller_types: Vec<ControllerType>,
}

fn default_controller_types() -> Vec<ControllerType> {
    vec![ControllerType::Mfi, ControllerType::Hid, ControllerType::Remote]
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            controller_types: default_controller_types(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            Self::default_path(),
            Some(PathBuf::from("./padlink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Per-user configuration file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("padlink/config.toml"))
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the roles cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        discovery::validate_service_identifier(&self.discovery.service_identifier).map_err(
            |e: DiscoveryError| ConfigError::Invalid(e.to_string()),
        )?;

        if self.session.grace_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.grace_period_ms must be positive".to_string(),
            ));
        }
        if self.input.coalesce_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "input.coalesce_interval_ms must be positive when set".to_string(),
            ));
        }
        if self.browser.controller_types.is_empty() {
            return Err(ConfigError::Invalid(
                "browser.controller_types must name at least one type".to_string(),
            ));
        }
        if self.network.max_frame_size < crate::protocol::DATAGRAM_HEADER_SIZE {
            return Err(ConfigError::Invalid(
                "network.max_frame_size is too small".to_string(),
            ));
        }
        Ok(())
    }

    /// Full service type browsed and advertised
    pub fn service_type(&self) -> ConfigResult<String> {
        discovery::service_type(&self.discovery.service_identifier)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.session.grace_period_ms)
    }

    pub fn coalesce_interval(&self) -> Option<Duration> {
        self.input.coalesce_interval_ms.map(Duration::from_millis)
    }

    /// Socket settings for the network layer
    pub fn network_config(&self) -> network::NetworkConfig {
        network::NetworkConfig {
            bind_address: self.network.bind_address,
            control_port: self.network.control_port,
            input_port: self.network.input_port,
            connect_timeout_ms: self.network.connect_timeout_ms,
            max_frame_size: self.network.max_frame_size,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "Living Room".to_string(),
            verbose: false,
        },
        input: InputConfig {
            coalesce_interval_ms: Some(16),
            publish_mode: PublishMode::Deltas,
            auto_connect: true,
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
