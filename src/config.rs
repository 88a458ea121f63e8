//! Configuration module for line-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// Port used when none is given on the command line or in the config file.
pub const DEFAULT_PORT: u16 = 7000;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(author = "line-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A multiplexed TCP line broadcast relay", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0 or ::)
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum number of simultaneously connected clients
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Event runtime to serve connections with
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Which runtime drives the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Single-threaded readiness loop (epoll/kqueue via mio).
    #[default]
    Mio,
    /// One task per connection, hub owned by an actor task.
    Tokio,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub runtime: RuntimeType,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            runtime: RuntimeType::default(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection relay tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Bytes requested from the socket per read call.
    pub read_chunk_size: usize,
    /// Bytes a single connection may consume per readiness event before
    /// the loop moves on to other connections.
    pub read_budget: usize,
    /// Unterminated input longer than this is flushed as one message.
    pub max_line_length: usize,
    /// Bytes a slow peer may have queued before it is dropped (mio runtime).
    pub max_pending_output: usize,
    /// Frames a slow peer may have queued before it is dropped (tokio runtime).
    pub outbound_queue: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            read_chunk_size: 80,
            read_budget: 64 * 1024,
            max_line_length: 4096,
            max_pending_output: 64 * 1024,
            outbound_queue: 64,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_backlog() -> i32 {
    128
}

fn default_max_connections() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub runtime: RuntimeType,
    pub max_connections: usize,
    pub relay: RelaySettings,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::empty(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_parse().map_err(ConfigError::Usage)?;
        Self::from_cli(cli)
    }

    /// Resolve configuration from already-parsed CLI arguments.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            relay: toml_config.relay,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values the runtimes cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_connections", self.max_connections),
            ("relay.read_chunk_size", self.relay.read_chunk_size),
            ("relay.read_budget", self.relay.read_budget),
            ("relay.max_line_length", self.relay.max_line_length),
            ("relay.max_pending_output", self.relay.max_pending_output),
            ("relay.outbound_queue", self.relay.outbound_queue),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid {
                field: "server.backlog",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.listen_addr().map(|_| ())
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| ConfigError::InvalidAddress(self.host.clone(), e))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl CliArgs {
    fn empty() -> Self {
        Self {
            port: None,
            config: None,
            host: None,
            max_connections: None,
            runtime: None,
            log_level: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Usage(#[source] clap::Error),

    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen host '{0}': {1}")]
    InvalidAddress(String, #[source] AddrParseError),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
