//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (first found, or `PROFILES_CONFIG`)
//! - Environment variables (`HTTP_PORT`, `SLOW_POLICY`, ...)

use anyhow::{Context, Result};
use profile_core::{BackoffConfig, BusConfig, SlowPolicy};
use profile_protocol::NotificationFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables read as configuration overrides.
const ENV_KEYS: [&str; 12] = [
    "HTTP_HOST",
    "HTTP_PORT",
    "WS_QUEUE_CAPACITY",
    "SLOW_POLICY",
    "STORE_URI",
    "CHANGES_BACKOFF_INITIAL_MS",
    "CHANGES_BACKOFF_MAX_MS",
    "NOTIFICATION_FORMAT",
    "MAX_MESSAGE_SIZE",
    "STARTUP_TIMEOUT_MS",
    "METRICS_ENABLED",
    "METRICS_PORT",
];

/// Environment variable naming an explicit config file.
const CONFIG_PATH_ENV: &str = "PROFILES_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub http_host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub http_port: u16,

    /// Subscription queue capacity per WebSocket session.
    #[serde(default = "default_queue_capacity")]
    pub ws_queue_capacity: usize,

    /// What to do with a subscriber whose queue is full.
    #[serde(default)]
    pub slow_policy: SlowPolicy,

    /// Store connection string.
    #[serde(default = "default_store_uri")]
    pub store_uri: String,

    /// First upstream reconnect delay in milliseconds.
    #[serde(default = "default_backoff_initial")]
    pub changes_backoff_initial_ms: u64,

    /// Upstream reconnect delay ceiling in milliseconds.
    #[serde(default = "default_backoff_max")]
    pub changes_backoff_max_ms: u64,

    /// Notification frame encoding.
    #[serde(default)]
    pub notification_format: NotificationFormat,

    /// Maximum inbound WebSocket frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Time allowed for the upstream change stream to come up at boot.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Enable the Prometheus exporter.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Prometheus exporter port.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_queue_capacity() -> usize {
    profile_core::DEFAULT_QUEUE_CAPACITY
}

fn default_store_uri() -> String {
    "memory://".to_string()
}

fn default_backoff_initial() -> u64 {
    1_000 // 1 second
}

fn default_backoff_max() -> u64 {
    30_000 // 30 seconds
}

fn default_max_message_size() -> usize {
    profile_protocol::codec::DEFAULT_MAX_INBOUND_SIZE
}

fn default_startup_timeout() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_host(),
            http_port: default_port(),
            ws_queue_capacity: default_queue_capacity(),
            slow_policy: SlowPolicy::default(),
            store_uri: default_store_uri(),
            changes_backoff_initial_ms: default_backoff_initial(),
            changes_backoff_max_ms: default_backoff_max(),
            notification_format: NotificationFormat::default(),
            max_message_size: default_max_message_size(),
            startup_timeout_ms: default_startup_timeout(),
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found plus the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file or variable cannot be parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::locate_file().as_deref(), std::env::vars())
    }

    /// Load configuration from an optional file and a set of variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or a variable cannot be parsed.
    pub fn load_from(
        file: Option<&Path>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            // Report syntax errors against the file itself before layering.
            Self::from_file(path)?;
            let name = path.to_string_lossy();
            builder = builder.add_source(config::File::new(&name, config::FileFormat::Toml));
        }

        let overrides: HashMap<String, String> = vars
            .into_iter()
            .filter(|(key, _)| ENV_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();
        builder = builder.add_source(
            config::Environment::default()
                .source(Some(overrides))
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn locate_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        let config_paths = [
            "profiles.toml",
            "/etc/profiles/profiles.toml",
            "~/.config/profiles/profiles.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.http_host, self.http_port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.http_host, self.http_port))
    }

    /// Bus settings derived from this configuration.
    #[must_use]
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            default_capacity: self.ws_queue_capacity,
            policy: self.slow_policy,
            backoff: BackoffConfig {
                initial: Duration::from_millis(self.changes_backoff_initial_ms),
                max: Duration::from_millis(self.changes_backoff_max_ms),
                ..Default::default()
            },
        }
    }

    /// Time allowed for the bus to connect upstream at boot.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.ws_queue_capacity, 64);
        assert_eq!(config.slow_policy, SlowPolicy::DropOldest);
        assert_eq!(config.notification_format, NotificationFormat::Json);
        assert_eq!(config.changes_backoff_max_ms, 30_000);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            http_host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            http_host = "0.0.0.0"
            http_port = 9000
            slow_policy = "EVICT"
            notification_format = "id"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.http_host, "0.0.0.0");
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.slow_policy, SlowPolicy::Evict);
        assert_eq!(config.notification_format, NotificationFormat::Id);
        assert_eq!(config.store_uri, "memory://");
    }

    #[test]
    fn test_load_defaults_without_sources() {
        let config = Config::load_from(None, Vec::new()).unwrap();
        assert_eq!(config.http_host, "127.0.0.1");
        assert_eq!(config.max_message_size, 64 * 1024);
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::load_from(
            None,
            vars(&[
                ("HTTP_PORT", "9191"),
                ("WS_QUEUE_CAPACITY", "8"),
                ("SLOW_POLICY", "drop_newest"),
                ("CHANGES_BACKOFF_MAX_MS", "500"),
                ("METRICS_ENABLED", "false"),
                ("UNRELATED", "ignored"),
            ]),
        )
        .unwrap();

        assert_eq!(config.http_port, 9191);
        assert_eq!(config.ws_queue_capacity, 8);
        assert_eq!(config.slow_policy, SlowPolicy::DropNewest);
        assert!(!config.metrics_enabled);

        let bus = config.bus_config();
        assert_eq!(bus.default_capacity, 8);
        assert_eq!(bus.backoff.max, Duration::from_millis(500));
    }

    #[test]
    fn test_environment_beats_file() {
        let path = std::env::temp_dir().join(format!("profiles-{}.toml", std::process::id()));
        std::fs::write(&path, "http_port = 7000\nstore_uri = \"memory://?oplog=16\"\n").unwrap();

        let config = Config::load_from(Some(&path), vars(&[("HTTP_PORT", "7001")])).unwrap();
        assert_eq!(config.http_port, 7001);
        assert_eq!(config.store_uri, "memory://?oplog=16");

        let direct = Config::from_file(&path).unwrap();
        assert_eq!(direct.http_port, 7000);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        assert!(Config::load_from(None, vars(&[("SLOW_POLICY", "block")])).is_err());
    }
}
