//! Configuration module for the discard server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::{ConfigError, ServerError};
use clap::{ArgAction, Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Port used when none is supplied.
pub const DEFAULT_PORT: u16 = 8081;

/// Command-line arguments for the discard server
#[derive(Parser, Debug, Default)]
#[command(name = "discard-server")]
#[command(version = "0.1.0")]
#[command(about = "A TCP discard protocol server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum pending unaccepted connections
    #[arg(short, long)]
    pub backlog: Option<u32>,

    /// Enable TCP keep-alive probing on accepted sockets
    #[arg(long, action = ArgAction::Set)]
    pub keepalive: Option<bool>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Connection handler behavior
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Milliseconds to let open connections finish after stop
    #[arg(long)]
    pub shutdown_grace_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// What a connection handler does with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Read and drop everything, never write.
    #[default]
    Discard,
    /// Send one greeting on connect and log inbound text.
    Greeting,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub keepalive: bool,
    pub workers: usize,
    pub mode: Mode,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backlog: 128,
            keepalive: true,
            workers: 0,
            mode: Mode::Discard,
            max_connections: 10_000,
            buffer_size: 16 * 1024,
            batch_size: 1024,
            shutdown_grace_ms: 0,
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub keepalive: bool,
    /// Worker thread count; 0 means one per core.
    pub workers: usize,
    pub mode: Mode,
    /// Per-worker connection cap.
    pub max_connections: usize,
    /// Size of each read buffer in bytes.
    pub buffer_size: usize,
    /// Poll event batch capacity.
    pub batch_size: usize,
    pub shutdown_grace: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
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
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            backlog: cli.backlog.unwrap_or(server.backlog),
            keepalive: cli.keepalive.unwrap_or(server.keepalive),
            workers: cli.workers.unwrap_or(server.workers),
            mode: cli.mode.unwrap_or(server.mode),
            max_connections: server.max_connections,
            buffer_size: server.buffer_size,
            batch_size: server.batch_size,
            shutdown_grace: Duration::from_millis(
                cli.shutdown_grace_ms.unwrap_or(server.shutdown_grace_ms),
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 || self.backlog > i32::MAX as u32 {
            return Err(ConfigError::Invalid(format!(
                "backlog must be between 1 and {}",
                i32::MAX
            )));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be positive".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        Ok(())
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> Result<SocketAddr, ServerError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ServerError::InvalidAddress(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8081);
        assert_eq!(config.backlog, 128);
        assert!(config.keepalive);
        assert_eq!(config.mode, Mode::Discard);
        assert_eq!(config.shutdown_grace, Duration::ZERO);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9009
            backlog = 64
            keepalive = false
            workers = 4
            mode = "greeting"
            shutdown_grace_ms = 250

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.server.port, 9009);
        assert_eq!(parsed.server.mode, Mode::Greeting);
        assert_eq!(parsed.server.buffer_size, 16 * 1024);

        let config = Config::merge(CliArgs::default(), parsed);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.backlog, 64);
        assert!(!config.keepalive);
        assert_eq!(config.workers, 4);
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let parsed: TomlConfig = toml::from_str("[server]\nport = 9009\nmode = \"greeting\"").unwrap();
        let cli = CliArgs::parse_from(["discard-server", "7000", "--mode", "discard", "--keepalive", "false"]);

        let config = Config::merge(cli, parsed);
        assert_eq!(config.port, 7000);
        assert_eq!(config.mode, Mode::Discard);
        assert!(!config.keepalive);
    }

    #[test]
    fn test_validate_rejects_zero_backlog() {
        let config = Config {
            backlog: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_listen_addr() {
        let config = Config {
            host: "::1".to_string(),
            port: 4000,
            ..Config::default()
        };
        assert_eq!(
            config.listen_addr().unwrap(),
            "[::1]:4000".parse::<SocketAddr>().unwrap()
        );

        let config = Config {
            host: "not-an-ip".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.listen_addr(),
            Err(ServerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/discard.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead { .. })
        ));
    }
}
