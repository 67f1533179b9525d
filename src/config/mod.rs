//! Configuration module
//!
//! Handles loading and saving NanoServe configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::ReactorConfig;
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT};

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
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server reactor settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client reactor settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Server name shown in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    "nanoserve".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on each multiplexer wait in ms (unset: block)
    pub poll_timeout_ms: Option<u64>,
    /// Largest payload accepted from a client
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Readiness events fetched per wait
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_events_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_timeout_ms: None,
            max_frame_size: default_max_frame_size(),
            events_capacity: default_events_capacity(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string accepted by `Server::start`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            poll_timeout: self.poll_timeout_ms.map(Duration::from_millis),
            events_capacity: self.events_capacity,
            max_frame_size: self.max_frame_size,
            ..ReactorConfig::default()
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server to connect to
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Upper bound on each multiplexer wait in ms
    #[serde(default = "default_client_poll_timeout")]
    pub poll_timeout_ms: Option<u64>,
    /// Name sent when joining a game
    #[serde(default = "default_username")]
    pub username: String,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_client_poll_timeout() -> Option<u64> {
    Some(50)
}

fn default_username() -> String {
    "zafflins".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            poll_timeout_ms: default_client_poll_timeout(),
            username: default_username(),
        }
    }
}

impl ClientConfig {
    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            poll_timeout: self.poll_timeout_ms.map(Duration::from_millis),
            connect_timeout: Some(Duration::from_millis(self.connect_timeout_ms)),
            ..ReactorConfig::default()
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
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("nanoserve/config.toml")),
            Some(PathBuf::from("./nanoserve.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading config from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
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
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "arena".to_string(),
            verbose: false,
        },
        server: ServerConfig {
            host: "0.0.0.0".to_string(),
            poll_timeout_ms: Some(16),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
