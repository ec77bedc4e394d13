//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (STRAND_*)
//! - TOML configuration file

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use strand_core::{HubOptions, OverflowPolicy};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind to (host:port).
    #[serde(default = "default_address")]
    pub address: String,

    /// Base path the hub endpoints are mounted under.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Glob patterns the `Origin` header must match. `*` allows any origin.
    #[serde(default = "default_origin_patterns")]
    pub allowed_origin_patterns: Vec<String>,

    /// Skip the origin check entirely. The bearer check, when enabled, is
    /// still enforced.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Connection timing.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Static bearer authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Hub instantiation mode.
    #[serde(default)]
    pub hub_mode: HubMode,

    /// Metrics export.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Connection timing configuration, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Ping cadence on an idle writer.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    /// Inbound inactivity deadline. Must be at least twice the keep-alive;
    /// clamped with a warning otherwise.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Handshake deadline after transport attach.
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,

    /// How long a channel-returning method may take per item.
    #[serde(default = "default_chan_receive_ms")]
    pub chan_receive_ms: u64,

    /// How long a negotiated connection token stays valid before the first
    /// transport request.
    #[serde(default = "default_connect_ttl_ms")]
    pub connect_ttl_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Bound for writer queues and upload-stream buffers.
    #[serde(default = "default_stream_buffer_capacity")]
    pub stream_buffer_capacity: usize,

    /// Maximum inbound transport message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// What hub-code sends do when a writer queue is full.
    #[serde(default)]
    pub overflow: OverflowMode,
}

/// Static bearer authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require a bearer token on every hub endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// The expected token.
    #[serde(default)]
    pub token: String,
}

/// Hub instantiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubMode {
    /// One hub instance shared by every connection.
    #[default]
    Singleton,
    /// A fresh hub per connection.
    PerConnection,
}

/// Writer-queue overflow behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    #[default]
    Block,
    Fail,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_address() -> String {
    std::env::var("STRAND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:8220".to_string())
}

fn default_base_path() -> String {
    std::env::var("STRAND_BASE_PATH").unwrap_or_else(|_| "/hub".to_string())
}

fn default_origin_patterns() -> Vec<String> {
    match std::env::var("STRAND_ALLOWED_ORIGINS") {
        Ok(patterns) => patterns.split(',').map(|s| s.trim().to_string()).collect(),
        Err(_) => vec!["*".to_string()],
    }
}

fn default_keep_alive_ms() -> u64 {
    15_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_ms() -> u64 {
    15_000
}

fn default_chan_receive_ms() -> u64 {
    5_000
}

fn default_connect_ttl_ms() -> u64 {
    30_000
}

fn default_stream_buffer_capacity() -> usize {
    32
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_metrics_port() -> u16 {
    9220
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            base_path: default_base_path(),
            allowed_origin_patterns: default_origin_patterns(),
            insecure_skip_verify: false,
            timing: TimingConfig::default(),
            limits: LimitsConfig::default(),
            auth: AuthConfig::default(),
            hub_mode: HubMode::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keep_alive_ms: default_keep_alive_ms(),
            timeout_ms: default_timeout_ms(),
            handshake_ms: default_handshake_ms(),
            chan_receive_ms: default_chan_receive_ms(),
            connect_ttl_ms: default_connect_ttl_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            stream_buffer_capacity: default_stream_buffer_capacity(),
            max_message_size: default_max_message_size(),
            overflow: OverflowMode::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first existing candidate file, falling
    /// back to defaults with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("STRAND_CONFIG") {
            return Self::from_file(path);
        }

        let config_paths = [
            "strand.toml",
            "/etc/strand/strand.toml",
            "~/.config/strand/strand.toml",
        ];
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// The socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparsable address; bad addresses are fatal
    /// at startup.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.address
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.address))
    }

    /// The connection options this configuration asks for. Validation (the
    /// timeout clamp) happens when the engine is built.
    #[must_use]
    pub fn hub_options(&self) -> HubOptions {
        HubOptions {
            keep_alive_interval: Duration::from_millis(self.timing.keep_alive_ms),
            timeout_interval: Duration::from_millis(self.timing.timeout_ms),
            handshake_timeout: Duration::from_millis(self.timing.handshake_ms),
            chan_receive_timeout: Duration::from_millis(self.timing.chan_receive_ms),
            stream_buffer_capacity: self.limits.stream_buffer_capacity,
            overflow_policy: match self.limits.overflow {
                OverflowMode::Block => OverflowPolicy::Block,
                OverflowMode::Fail => OverflowPolicy::Fail,
            },
        }
    }

    /// TTL of negotiated connection tokens.
    #[must_use]
    pub fn connect_ttl(&self) -> Duration {
        Duration::from_millis(self.timing.connect_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.base_path, "/hub");
        assert_eq!(config.timing.keep_alive_ms, 15_000);
        assert_eq!(config.timing.timeout_ms, 30_000);
        assert!(!config.auth.enabled);
        assert_eq!(config.hub_mode, HubMode::Singleton);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            address = "0.0.0.0:9000"
            base_path = "/iacmessagebus"
            allowed_origin_patterns = ["https://app.example.com", "*.example.org"]

            [timing]
            keep_alive_ms = 10000
            timeout_ms = 20000

            [auth]
            enabled = true
            token = "secret"

            [limits]
            overflow = "fail"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.address, "0.0.0.0:9000");
        assert_eq!(config.base_path, "/iacmessagebus");
        assert_eq!(config.allowed_origin_patterns.len(), 2);
        assert!(config.auth.enabled);
        assert_eq!(config.limits.overflow, OverflowMode::Fail);

        let options = config.hub_options();
        assert_eq!(options.keep_alive_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_bind_addr_rejects_garbage() {
        let config = Config {
            address: "nonsense".into(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_hub_mode_parses_snake_case() {
        let config: Config = toml::from_str("hub_mode = \"per_connection\"").unwrap();
        assert_eq!(config.hub_mode, HubMode::PerConnection);
    }
}
