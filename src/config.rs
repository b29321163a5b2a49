//! Configuration module for line-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::index::{IndexOptions, TrailingLine, DEFAULT_CHUNK_SIZE};
use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Command-line arguments for the line server
#[derive(Parser, Debug)]
#[command(name = "line-server")]
#[command(author = "line-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Serves lines of an indexed text file over TCP", long_about = None)]
pub struct CliArgs {
    /// Text file to index and serve
    pub source_file: PathBuf,

    /// Port to listen on (1-65535)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Address to bind to (defaults to all IPv4 interfaces)
    #[arg(short = 'l', long)]
    pub host: Option<String>,

    /// Maximum number of concurrent client connections (0 = unlimited)
    #[arg(short = 'c', long)]
    pub max_clients: Option<usize>,

    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seconds a connection waits for a command before re-checking for shutdown
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Seconds the listener waits for a connection before re-checking for shutdown
    #[arg(long)]
    pub accept_timeout: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    pub port: Option<u16>,
    /// Maximum number of concurrent clients (0 = unlimited)
    pub max_clients: Option<usize>,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Per-connection read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Listener accept timeout in seconds
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            max_clients: None,
            workers: None,
            read_timeout: default_read_timeout(),
            accept_timeout: default_accept_timeout(),
        }
    }
}

/// Indexing configuration
#[derive(Debug, Deserialize)]
pub struct IndexConfig {
    /// Bytes read per scan step
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Whether an unterminated final line is served
    #[serde(default)]
    pub trailing_line: TrailingLine,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            trailing_line: TrailingLine::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_read_timeout() -> u64 {
    10
}

fn default_accept_timeout() -> u64 {
    2
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub source_file: PathBuf,
    pub host: String,
    pub port: u16,
    /// `None` means unlimited
    pub max_clients: Option<usize>,
    pub workers: Option<usize>,
    pub read_timeout: Duration,
    pub accept_timeout: Duration,
    pub chunk_size: usize,
    pub trailing_line: TrailingLine,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point to, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let port = match cli.port.or(toml_config.server.port) {
            None => return Err(ConfigError::MissingPort),
            Some(0) => return Err(ConfigError::InvalidValue("port", "must be 1-65535")),
            Some(port) => port,
        };

        let read_timeout = cli.read_timeout.unwrap_or(toml_config.server.read_timeout);
        if read_timeout == 0 {
            return Err(ConfigError::InvalidValue(
                "read_timeout",
                "must be at least one second",
            ));
        }

        let accept_timeout = cli
            .accept_timeout
            .unwrap_or(toml_config.server.accept_timeout);
        if accept_timeout == 0 {
            return Err(ConfigError::InvalidValue(
                "accept_timeout",
                "must be at least one second",
            ));
        }

        if toml_config.index.chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "chunk_size",
                "must be greater than zero",
            ));
        }

        let max_clients = cli
            .max_clients
            .or(toml_config.server.max_clients)
            .filter(|&n| n > 0);
        if max_clients.is_some_and(|n| n > Semaphore::MAX_PERMITS) {
            return Err(ConfigError::InvalidValue(
                "max_clients",
                "exceeds the supported connection limit",
            ));
        }

        Ok(Config {
            source_file: cli.source_file,
            host: cli.host.unwrap_or(toml_config.server.host),
            port,
            max_clients,
            workers: cli.workers.or(toml_config.server.workers),
            read_timeout: Duration::from_secs(read_timeout),
            accept_timeout: Duration::from_secs(accept_timeout),
            chunk_size: toml_config.index.chunk_size,
            trailing_line: toml_config.index.trailing_line,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Resolve the address to bind the listener to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidAddress(format!("{}:{}", self.host, self.port)))
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            chunk_size: self.chunk_size,
            trailing_line: self.trailing_line,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingPort,
    InvalidValue(&'static str, &'static str),
    InvalidAddress(String),
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
            ConfigError::MissingPort => {
                write!(f, "Missing listening port (use -p or [server] port)")
            }
            ConfigError::InvalidValue(name, reason) => {
                write!(f, "Invalid {}: {}", name, reason)
            }
            ConfigError::InvalidAddress(addr) => write!(f, "Invalid listen address: {}", addr),
        }
    }
}

impl std::error::Error for ConfigError {}
