//! Configuration module for the comet gateway.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the gateway
#[derive(Parser, Debug, Default)]
#[command(name = "comet")]
#[command(author = "comet authors")]
#[command(version = "0.1.0")]
#[command(about = "Comet connection gateway", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Handshake timeout in milliseconds
    #[arg(long)]
    pub handshake_timeout: Option<u64>,

    /// Heartbeat timeout in milliseconds
    #[arg(long)]
    pub heartbeat: Option<u64>,

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
    pub comet: CometConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and socket configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Enable TCP keepalive on accepted sockets
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,
    /// Kernel receive buffer size in bytes
    #[serde(default = "default_tcp_buf")]
    pub tcp_rcvbuf: usize,
    /// Kernel send buffer size in bytes
    #[serde(default = "default_tcp_buf")]
    pub tcp_sndbuf: usize,
    /// Userspace read buffer per connection
    #[serde(default = "default_io_buf")]
    pub read_buf: usize,
    /// Userspace write buffer per connection
    #[serde(default = "default_io_buf")]
    pub write_buf: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            tcp_keepalive: true,
            tcp_rcvbuf: default_tcp_buf(),
            tcp_sndbuf: default_tcp_buf(),
            read_buf: default_io_buf(),
            write_buf: default_io_buf(),
        }
    }
}

/// Connection protocol configuration
#[derive(Debug, Deserialize)]
pub struct CometConfig {
    /// Handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Heartbeat timeout in milliseconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u64,
    /// Inbound (client) frame slots per connection
    #[serde(default = "default_cli_proto")]
    pub cli_proto: usize,
    /// Outbound (server push) frame slots per connection
    #[serde(default = "default_svr_proto")]
    pub svr_proto: usize,
    /// Number of session registry buckets
    #[serde(default = "default_buckets")]
    pub buckets: usize,
}

impl Default for CometConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            heartbeat: default_heartbeat(),
            cli_proto: default_cli_proto(),
            svr_proto: default_svr_proto(),
            buckets: default_buckets(),
        }
    }
}

/// Deadline timer configuration
#[derive(Debug, Deserialize)]
pub struct TimerConfig {
    /// Number of independent timers
    #[serde(default = "default_timers")]
    pub count: usize,
    /// Maximum live deadlines per timer
    #[serde(default = "default_timer_size")]
    pub size: usize,
    /// Lazy renewal tolerance in milliseconds
    #[serde(default = "default_lazy_delay")]
    pub lazy_delay: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            count: default_timers(),
            size: default_timer_size(),
            lazy_delay: default_lazy_delay(),
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

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_tcp_buf() -> usize {
    256
}

fn default_io_buf() -> usize {
    1024
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_heartbeat() -> u64 {
    30_000
}

fn default_cli_proto() -> usize {
    8
}

fn default_svr_proto() -> usize {
    80
}

fn default_buckets() -> usize {
    16
}

fn default_timers() -> usize {
    4
}

fn default_timer_size() -> usize {
    10_000
}

fn default_lazy_delay() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub tcp_keepalive: bool,
    pub tcp_rcvbuf: usize,
    pub tcp_sndbuf: usize,
    pub read_buf: usize,
    pub write_buf: usize,
    pub handshake_timeout: Duration,
    pub heartbeat: Duration,
    pub cli_proto: usize,
    pub svr_proto: usize,
    pub buckets: usize,
    pub timers: usize,
    pub timer_size: usize,
    pub lazy_delay: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML values.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            comet,
            timer,
            logging,
        } = toml_config;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            tcp_keepalive: server.tcp_keepalive,
            tcp_rcvbuf: server.tcp_rcvbuf,
            tcp_sndbuf: server.tcp_sndbuf,
            read_buf: server.read_buf,
            write_buf: server.write_buf,
            handshake_timeout: Duration::from_millis(
                cli.handshake_timeout.unwrap_or(comet.handshake_timeout),
            ),
            heartbeat: Duration::from_millis(cli.heartbeat.unwrap_or(comet.heartbeat)),
            cli_proto: comet.cli_proto,
            svr_proto: comet.svr_proto,
            buckets: comet.buckets,
            timers: timer.count,
            timer_size: timer.size,
            lazy_delay: Duration::from_millis(timer.lazy_delay),
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
