//! Configuration module
//!
//! Handles loading and saving AVDP configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{NetworkConfig as RuntimeNetworkConfig, SequenceScope};
use crate::protocol::{DesyncPolicy, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT, PROTOCOL_VERSION};

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

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Framing settings
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name of this node, used in logs
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Idle read timeout in ms (0 = disabled)
    #[serde(default)]
    pub idle_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_ms: 0,
        }
    }
}

/// Framing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Version written into outgoing headers
    #[serde(default = "default_version")]
    pub version: u8,
    /// Largest accepted frame in bytes, header included (0 = unlimited)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// First sequence number sent
    #[serde(default = "default_sequence_start")]
    pub sequence_start: u32,
    /// Share one server counter across connections, or one per connection
    #[serde(default)]
    pub sequence_scope: SequenceScope,
    /// Close the connection on a sync mismatch, or scan for the next frame
    #[serde(default)]
    pub desync_policy: DesyncPolicy,
}

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_sequence_start() -> u32 {
    1
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            max_frame_size: default_max_frame_size(),
            sequence_start: default_sequence_start(),
            sequence_scope: SequenceScope::default(),
            desync_policy: DesyncPolicy::default(),
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
            dirs::config_dir().map(|p| p.join("avdp/config.toml")),
            Some(PathBuf::from("./avdp.toml")),
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

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Runtime network settings, with the port optionally overridden
    pub fn network_config(&self, port: Option<u16>) -> RuntimeNetworkConfig {
        RuntimeNetworkConfig {
            port: port.unwrap_or(self.network.port),
            bind_address: self.network.bind_address.clone(),
            connect_timeout_ms: self.network.connect_timeout_ms,
            idle_timeout_ms: self.network.idle_timeout_ms,
            protocol_version: self.protocol.version,
            max_frame_size: self.protocol.max_frame_size,
            desync_policy: self.protocol.desync_policy,
            sequence_start: self.protocol.sequence_start,
            sequence_scope: self.protocol.sequence_scope,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "camera-gateway".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            idle_timeout_ms: 30_000,
            ..Default::default()
        },
        protocol: ProtocolConfig {
            desync_policy: DesyncPolicy::Close,
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.protocol.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.protocol.sequence_scope, SequenceScope::Process);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.protocol.sequence_start = 500;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, config.network.port);
        assert_eq!(loaded.protocol.sequence_start, 500);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[protocol]\nsequence_scope = \"connection\"\ndesync_policy = \"resync\"\n\n[network]\nport = 7100"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.network.port, 7100);
        assert_eq!(config.network.connect_timeout_ms, 5000);
        assert_eq!(config.protocol.sequence_scope, SequenceScope::Connection);
        assert_eq!(config.protocol.desync_policy, DesyncPolicy::Resync);
        assert_eq!(config.protocol.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/avdp.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_network_config_override() {
        let config = Config::default();
        let net = config.network_config(Some(4000));
        assert_eq!(net.port, 4000);
        assert_eq!(net.sequence_start, 1);
        assert_eq!(config.network_config(None).port, DEFAULT_PORT);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "camera-gateway");
        assert_eq!(parsed.network.idle_timeout_ms, 30_000);
    }
}
