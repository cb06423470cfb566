//! Configuration management for the stratum pool client
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON) with validation and defaults. Values
//! given explicitly on the command line win over the file; values left at
//! their defaults are taken from the file.

use crate::worker::ShareTiming;
use crate::{Error, HashRate, PoolEndpoint, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level: tracing::Level = (*self).into();
        write!(f, "{}", level.as_str().to_lowercase())
    }
}

/// Timing and rate knobs of a `StratumPoolClient`
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Simulated hash rate; adjustable later through the client
    pub hash_rate: HashRate,
    pub share_timing: ShareTiming,
    /// Backoff base: the first retry waits this long, then it doubles
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Consecutive failed connects tolerated before giving up
    pub max_reconnect_attempts: u32,
    /// Time `connect` waits after the socket opens before returning
    pub connect_grace: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hash_rate: HashRate::new(1e12),
            share_timing: ShareTiming::default(),
            reconnect_delay: Duration::from_millis(default_reconnect_delay()),
            max_reconnect_delay: Duration::from_millis(default_max_reconnect_delay()),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_grace: Duration::from_millis(default_connect_grace()),
            connect_timeout: Duration::from_millis(default_connect_timeout()),
        }
    }
}

/// Complete configuration for the pool client binary
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "stratum-pool-client",
    version = env!("CARGO_PKG_VERSION"),
    about = crate::APP_DESCRIPTION
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Pool URL in scheme://host:port form
    #[arg(short = 'o', long, env = "STRATUM_POOL_URL")]
    pub pool_url: Option<String>,

    /// Wallet address or pool account identifier
    #[arg(short = 'u', long, env = "STRATUM_IDENTIFIER")]
    pub identifier: Option<String>,

    /// Worker label, sent to the pool as <identifier>.<worker>
    #[arg(short = 'w', long, default_value = "worker1")]
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Simulated hash rate (suffixes K, M, G, T, P)
    #[arg(short = 'r', long, default_value = "1T")]
    #[serde(default = "default_hash_rate")]
    pub hash_rate: String,

    /// Hash rate at which one difficulty-1 share takes the base interval
    #[arg(long, default_value = "1T")]
    #[serde(default = "default_hash_rate")]
    pub reference_hash_rate: String,

    /// Minimum delay between shares in milliseconds
    #[arg(long, default_value = "1000")]
    #[serde(default = "default_min_share_interval")]
    pub min_share_interval: u64,

    /// Delay between difficulty-1 shares at the reference rate, in milliseconds
    #[arg(long, default_value = "10000")]
    #[serde(default = "default_base_share_interval")]
    pub base_share_interval: u64,

    /// Base reconnect delay in milliseconds
    #[arg(long, default_value = "1000")]
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,

    /// Maximum reconnect delay in milliseconds
    #[arg(long, default_value = "60000")]
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: u64,

    /// Consecutive reconnect attempts before giving up
    #[arg(long, default_value = "10")]
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Grace period after the socket opens, in milliseconds
    #[arg(long, default_value = "500")]
    #[serde(default = "default_connect_grace")]
    pub connect_grace: u64,

    /// TCP connect timeout in milliseconds
    #[arg(long, default_value = "10000")]
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

/// Copy file values over fields the command line left at their defaults
macro_rules! merge_defaulted {
    ($config:ident, $file:ident, $matches:ident, $($field:ident),+ $(,)?) => {
        $(
            if is_defaulted($matches, stringify!($field)) {
                $config.$field = $file.$field;
            }
        )+
    };
}

fn is_defaulted(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        None | Some(ValueSource::DefaultValue)
    )
}

impl Config {
    /// Parse the process arguments and load the configuration file if given
    pub async fn load() -> Result<Self> {
        let matches = Self::command().get_matches();
        Self::from_matches(matches).await
    }

    /// Like [`Config::load`] with explicit arguments
    pub async fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command()
            .try_get_matches_from(args)
            .map_err(|e| Error::config(e.to_string()))?;
        Self::from_matches(matches).await
    }

    async fn from_matches(matches: ArgMatches) -> Result<Self> {
        let mut config =
            Self::from_arg_matches(&matches).map_err(|e| Error::config(e.to_string()))?;

        // Load from config file if specified
        if let Some(config_file) = &config.config_file {
            let file_config = Self::load_from_file(config_file).await?;
            config = config.merge_with_file(file_config, &matches);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Merge CLI config with file config (explicit CLI values take precedence)
    fn merge_with_file(mut self, file_config: Self, matches: &ArgMatches) -> Self {
        if self.pool_url.is_none() {
            self.pool_url = file_config.pool_url.clone();
        }

        if self.identifier.is_none() {
            self.identifier = file_config.identifier.clone();
        }

        merge_defaulted!(
            self,
            file_config,
            matches,
            worker_name,
            hash_rate,
            reference_hash_rate,
            min_share_interval,
            base_share_interval,
            reconnect_delay,
            max_reconnect_delay,
            max_reconnect_attempts,
            connect_grace,
            connect_timeout,
            log_level,
        );
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.pool_url {
            PoolEndpoint::parse(url)?;
        }

        if self.identifier.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(Error::config("Identifier must not be empty"));
        }

        if self.worker_name.trim().is_empty() {
            return Err(Error::config("Worker name must not be empty"));
        }

        self.hash_rate()?;
        self.reference_hash_rate()?;

        if self.base_share_interval == 0 {
            return Err(Error::config("Base share interval must be greater than 0"));
        }

        if self.reconnect_delay == 0 {
            return Err(Error::config("Reconnect delay must be greater than 0"));
        }

        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(Error::config(
                "Maximum reconnect delay must not be below the reconnect delay",
            ));
        }

        Ok(())
    }

    /// Get parsed hash rate
    pub fn hash_rate(&self) -> Result<HashRate> {
        HashRate::from_str_with_units(&self.hash_rate)?.ensure_positive()
    }

    /// Get parsed reference hash rate
    pub fn reference_hash_rate(&self) -> Result<HashRate> {
        HashRate::from_str_with_units(&self.reference_hash_rate)?.ensure_positive()
    }

    /// Pool URL and identifier, both required to mine
    pub fn pool(&self) -> Result<(&str, &str)> {
        let pool_url = self
            .pool_url
            .as_deref()
            .ok_or_else(|| Error::config("Pool URL is required. Use --pool-url"))?;
        let identifier = self
            .identifier
            .as_deref()
            .ok_or_else(|| Error::config("Identifier is required. Use --identifier"))?;
        Ok((pool_url, identifier))
    }

    /// Settings for the library client
    pub fn client_config(&self) -> Result<ClientConfig> {
        Ok(ClientConfig {
            hash_rate: self.hash_rate()?,
            share_timing: ShareTiming {
                min_interval: Duration::from_millis(self.min_share_interval),
                base_interval: Duration::from_millis(self.base_share_interval),
                reference_hash_rate: self.reference_hash_rate()?,
            },
            reconnect_delay: Duration::from_millis(self.reconnect_delay),
            max_reconnect_delay: Duration::from_millis(self.max_reconnect_delay),
            max_reconnect_attempts: self.max_reconnect_attempts,
            connect_grace: Duration::from_millis(self.connect_grace),
            connect_timeout: Duration::from_millis(self.connect_timeout),
        })
    }
}

// Default value functions for serde
fn default_worker_name() -> String { "worker1".to_string() }
fn default_hash_rate() -> String { "1T".to_string() }
fn default_min_share_interval() -> u64 { 1000 }
fn default_base_share_interval() -> u64 { 10000 }
fn default_reconnect_delay() -> u64 { 1000 }
fn default_max_reconnect_delay() -> u64 { 60000 }
fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_connect_grace() -> u64 { 500 }
fn default_connect_timeout() -> u64 { 10000 }
fn default_log_level() -> LogLevel { LogLevel::Info }
