use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub persistence: PersistenceConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// External broker link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Disable to run a single-process relay without cross-process fan-out
    pub enabled: bool,
    pub url: String,
    pub key_prefix: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_seconds: u64,
    /// Keepalive ping interval on the broker link
    pub heartbeat_interval_seconds: u64,
    /// A ping unanswered for this long counts as a dead link
    pub heartbeat_timeout_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "cinemate:".to_string(),
            reconnect_delay_seconds: 5,
            heartbeat_interval_seconds: 4,
            heartbeat_timeout_seconds: 4,
        }
    }
}

/// Persistence collaborator (external chat-message store)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:3001".to_string(),
            request_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Outbound deliveries buffered per connection before drops kick in
    pub outbound_buffer: usize,
    /// Upper bound on a single protocol frame
    pub max_frame_bytes: usize,
    /// Connections silent for longer than this are closed
    pub idle_timeout_seconds: u64,
    /// How often the idle sweeper runs
    pub sweep_interval_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 1000,
            max_frame_bytes: 64 * 1024,
            idle_timeout_seconds: 60,
            sweep_interval_seconds: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CINEMATE_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CINEMATE")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Validate configuration, collecting every problem instead of stopping
    /// at the first one
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.broker.enabled && self.broker.url.is_empty() {
            errors.push("broker.url must be set when broker.enabled".to_string());
        }
        if self.broker.reconnect_delay_seconds == 0 {
            errors.push("broker.reconnect_delay_seconds must be non-zero".to_string());
        }
        if self.persistence.enabled && self.persistence.base_url.is_empty() {
            errors.push("persistence.base_url must be set when persistence.enabled".to_string());
        }
        if self.relay.outbound_buffer == 0 {
            errors.push("relay.outbound_buffer must be non-zero".to_string());
        }
        if self.relay.max_frame_bytes == 0 {
            errors.push("relay.max_frame_bytes must be non-zero".to_string());
        }
        if self.relay.idle_timeout_seconds <= self.relay.sweep_interval_seconds {
            errors.push(
                "relay.idle_timeout_seconds must exceed relay.sweep_interval_seconds".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Get broker URL
    #[must_use]
    pub fn broker_url(&self) -> &str {
        &self.broker.url
    }
}

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. CINEMATE_CONFIG_PATH environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
pub fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("CINEMATE_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            let cwd = "config.yaml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        })
        .or_else(|| {
            let k8s = "/config/config.yaml";
            Path::new(k8s).exists().then(|| k8s.to_string())
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        match Config::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load {path}: {e}");
                eprintln!("Falling back to environment variables");
                Config::from_env().unwrap_or_default()
            }
        }
    } else {
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config from environment: {e}");
            Config::default()
        })
    };

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.broker.enabled);
        assert_eq!(config.broker.reconnect_delay_seconds, 5);
        assert!(config.relay.outbound_buffer > 0);
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                http_port: 9000,
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validate_rejects_zero_reconnect_delay() {
        let mut config = Config::default();
        config.broker.reconnect_delay_seconds = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("reconnect_delay")));
    }

    #[test]
    fn test_validate_rejects_idle_below_sweep() {
        let mut config = Config::default();
        config.relay.idle_timeout_seconds = 10;
        config.relay.sweep_interval_seconds = 25;

        assert!(config.validate().is_err());
    }
}
