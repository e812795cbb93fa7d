//! Configuration module for the time server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the time server
#[derive(Parser, Debug)]
#[command(name = "multiplex-time-server")]
#[command(author = "multiplex-time-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded readiness-loop TCP time server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Upper bound on a single readiness wait, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Maximum readiness events handled per wait
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Maximum number of live client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
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
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Readiness wait timeout; also bounds shutdown latency
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            max_events: default_max_events(),
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
    8080
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_events() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub poll_timeout: Duration,
    pub max_events: usize,
    pub max_connections: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: default_port(),
            poll_timeout: Duration::from_millis(default_poll_timeout_ms()),
            max_events: default_max_events(),
            max_connections: default_max_connections(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI args, reading the TOML file they point at.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let host = cli.host.unwrap_or(toml_config.server.host);
        let host: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(host.clone()))?;

        let port = cli.port.unwrap_or(toml_config.server.port);
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }

        // A zero wait timeout turns the readiness wait into a busy spin.
        let poll_timeout_ms = cli
            .poll_timeout_ms
            .unwrap_or(toml_config.runtime.poll_timeout_ms);
        if poll_timeout_ms == 0 {
            return Err(ConfigError::InvalidPollTimeout(poll_timeout_ms));
        }

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(max_connections));
        }

        Ok(Config {
            host,
            port,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            max_events: cli.max_events.unwrap_or(toml_config.runtime.max_events),
            max_connections,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Address the listening socket binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidHost(String),
    InvalidPort(u16),
    InvalidPollTimeout(u64),
    InvalidMaxConnections(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidHost(host) => write!(f, "Invalid host address '{}'", host),
            ConfigError::InvalidPort(port) => write!(f, "Invalid port {}", port),
            ConfigError::InvalidPollTimeout(ms) => {
                write!(f, "Invalid poll timeout {}ms (must be at least 1)", ms)
            }
            ConfigError::InvalidMaxConnections(n) => {
                write!(f, "Invalid max connections {} (must be at least 1)", n)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
