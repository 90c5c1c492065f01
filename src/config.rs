//! Application configuration management.
//!
//! Configuration is layered with figment, lowest precedence first:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. The TOML file (`--config`, or the platform config directory)
//! 3. Environment variables prefixed `STATUSRELAY_`, with `__` between
//!    nested keys (`STATUSRELAY_BROKER__HOST=mq.lab`)
//! 4. Command-line flags, merged by the caller with the `merge_*` methods
//!
//! # Example
//!
//! ```toml
//! [watcher]
//! input_directory = "/var/spool/instruments"
//! use_file_hash = true
//!
//! [broker]
//! host = "mq.lab"
//! routing_key = "lab-2"
//!
//! [store]
//! database_path = "/var/lib/statusrelay/instrument.db"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::channel::{MqttSettings, RedeliveryPolicy};
use crate::cli::{BrokerArgs, ConsumeArgs, WatchArgs};
use crate::scanner::PollerConfig;

/// Prefix of environment variables read into the configuration.
pub const ENV_PREFIX: &str = "STATUSRELAY_";

/// Errors raised while loading, validating or saving configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A layer could not be read or did not match the expected shape.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// A value is out of range.
    #[error("Invalid configuration value for {key}: {reason}")]
    Invalid {
        /// Dotted key of the offending value
        key: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// No platform configuration directory could be determined.
    #[error("Failed to determine the configuration directory")]
    NoConfigDir,

    /// The configuration could not be serialized.
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration file could not be written.
    #[error("Failed to write {path}: {source}")]
    Write {
        /// Target path
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Settings of the watch process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Directory containing snapshot files.
    pub input_directory: PathBuf,
    /// Glob selecting snapshot files.
    pub pattern: String,
    /// Milliseconds between scans.
    pub interval_ms: u64,
    /// Include a content digest in fingerprints.
    pub use_file_hash: bool,
    /// Maximum files checked concurrently per scan.
    pub workers: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            input_directory: PathBuf::from("./input"),
            pattern: "*.xml".to_string(),
            interval_ms: 1000,
            use_file_hash: false,
            workers: 4,
        }
    }
}

/// Broker connection and delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional user name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Topic namespace.
    pub exchange: String,
    /// Topic below the namespace.
    pub routing_key: String,
    /// Durable consumer identity.
    pub queue: String,
    /// MQTT keep-alive in seconds.
    pub keep_alive_secs: u64,
    /// Startup connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Publish confirmation timeout in milliseconds.
    pub publish_timeout_ms: u64,
    /// Failed deliveries before dead-lettering; 0 requeues forever.
    pub max_deliveries: u32,
    /// Pause before a failed delivery is requeued, in milliseconds.
    pub requeue_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            exchange: "instruments".to_string(),
            routing_key: "default".to_string(),
            queue: "default-queue".to_string(),
            keep_alive_secs: 30,
            connect_timeout_ms: 5000,
            publish_timeout_ms: 5000,
            max_deliveries: 10,
            requeue_delay_ms: 500,
        }
    }
}

/// Module state store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("instrument.db"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Watch process settings.
    pub watcher: WatcherConfig,
    /// Broker settings shared by both processes.
    pub broker: BrokerConfig,
    /// Store settings of the consume process.
    pub store: StoreConfig,
}

impl Config {
    /// Get the default platform-specific configuration path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "statusrelay", "statusrelay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// The figment holding every layer except the CLI.
    ///
    /// A missing file contributes nothing.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load defaults, file and environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] if the file is not valid TOML or a
    /// value has the wrong type.
    pub fn try_load_from_path(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::figment(path).extract().map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Load like [`Config::try_load_from_path`], falling back to defaults
    /// with a warning when the configuration cannot be read.
    #[must_use]
    pub fn load_from_path(path: Option<&Path>) -> Self {
        match Self::try_load_from_path(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{}; using defaults", e);
                Self::default()
            }
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first value out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        }

        if self.watcher.interval_ms == 0 {
            return invalid("watcher.interval_ms", "must be at least 1");
        }
        if self.watcher.workers == 0 {
            return invalid("watcher.workers", "must be at least 1");
        }
        if self.watcher.pattern.trim().is_empty() {
            return invalid("watcher.pattern", "must not be empty");
        }
        if self.broker.host.trim().is_empty() {
            return invalid("broker.host", "must not be empty");
        }
        for (key, value) in [
            ("broker.exchange", &self.broker.exchange),
            ("broker.routing_key", &self.broker.routing_key),
            ("broker.queue", &self.broker.queue),
        ] {
            if value.trim().is_empty() {
                return invalid(key, "must not be empty");
            }
            if value.contains(['#', '+']) {
                return invalid(key, "must not contain MQTT wildcards");
            }
        }
        if self.broker.username.is_some() != self.broker.password.is_some() {
            return invalid("broker.username", "username and password must be set together");
        }
        Ok(())
    }

    /// Apply `watch` flags on top of the loaded layers.
    pub fn merge_watch_args(&mut self, args: &WatchArgs) {
        if let Some(dir) = &args.input_dir {
            self.watcher.input_directory.clone_from(dir);
        }
        if let Some(interval) = args.interval_ms {
            self.watcher.interval_ms = interval;
        }
        if let Some(use_hash) = args.use_hash() {
            self.watcher.use_file_hash = use_hash;
        }
        if let Some(pattern) = &args.pattern {
            self.watcher.pattern.clone_from(pattern);
        }
        if let Some(workers) = args.workers {
            self.watcher.workers = usize::try_from(workers).unwrap_or(usize::MAX);
        }
        self.merge_broker_args(&args.broker);
    }

    /// Apply `consume` flags on top of the loaded layers.
    pub fn merge_consume_args(&mut self, args: &ConsumeArgs) {
        if let Some(database) = &args.database {
            self.store.database_path.clone_from(database);
        }
        if let Some(max) = args.max_deliveries {
            self.broker.max_deliveries = max;
        }
        self.merge_broker_args(&args.broker);
    }

    fn merge_broker_args(&mut self, args: &BrokerArgs) {
        if let Some(host) = &args.broker_host {
            self.broker.host.clone_from(host);
        }
        if let Some(port) = args.broker_port {
            self.broker.port = port;
        }
        if let Some(key) = &args.routing_key {
            self.broker.routing_key.clone_from(key);
        }
    }

    /// Write the configuration as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] or [`ConfigError::Write`].
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(write_err)?;
        Ok(())
    }

    /// Poller settings for the watch process.
    #[must_use]
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig::new(&self.watcher.input_directory)
            .with_pattern(&self.watcher.pattern)
            .with_interval(Duration::from_millis(self.watcher.interval_ms))
            .with_hash(self.watcher.use_file_hash)
            .with_workers(self.watcher.workers)
    }

    /// Broker settings for either process.
    #[must_use]
    pub fn mqtt_settings(&self) -> MqttSettings {
        let broker = &self.broker;
        MqttSettings {
            host: broker.host.clone(),
            port: broker.port,
            credentials: broker.username.clone().zip(broker.password.clone()),
            exchange: broker.exchange.clone(),
            routing_key: broker.routing_key.clone(),
            queue: broker.queue.clone(),
            keep_alive: Duration::from_secs(broker.keep_alive_secs),
            connect_timeout: Duration::from_millis(broker.connect_timeout_ms),
            publish_timeout: Duration::from_millis(broker.publish_timeout_ms),
        }
    }

    /// Redelivery policy of the consume process.
    #[must_use]
    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_deliveries: self.broker.max_deliveries,
            requeue_delay: Duration::from_millis(self.broker.requeue_delay_ms),
        }
    }
}
