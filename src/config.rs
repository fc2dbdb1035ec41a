//! Configuration module for echo-supervisor.
//!
//! Supports command-line arguments, environment variables and a TOML
//! configuration file. CLI arguments (and their env vars) take precedence
//! over config file values, which take precedence over compiled-in defaults.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionLimits;
use crate::worker::process::WORKER_FD;

/// Command-line arguments for the echo supervisor
#[derive(Parser, Debug)]
#[command(name = "echo-supervisor")]
#[command(author = "echo-supervisor authors")]
#[command(version = "0.1.0")]
#[command(about = "A supervised multi-worker TCP echo server", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Serve flags given without a subcommand
    #[command(flatten)]
    pub serve: ServeArgs,
}

impl CliArgs {
    /// The selected subcommand, `serve` when none was given.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the supervisor (default)
    Serve(ServeArgs),
    /// Serve one inherited connection (spawned by the supervisor)
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// Send numbered messages to a server and verify the echoes
    Client(ClientArgs),
}

/// How workers are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One child process per connection
    #[default]
    Process,
    /// One tokio task per connection
    Task,
}

/// Flags for the `serve` subcommand.
#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Path to TOML configuration file
    #[arg(short, long, env = "ECHO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9000)
    #[arg(short = 'l', long, env = "ECHO_LISTEN")]
    pub listen: Option<String>,

    /// Maximum number of concurrent workers
    #[arg(short = 'w', long, env = "ECHO_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Read/echo cycles served per connection
    #[arg(long, env = "ECHO_IO_TARGET")]
    pub io_target: Option<usize>,

    /// Per-call readiness timeout in milliseconds
    #[arg(long, env = "ECHO_POLL_TIMEOUT_MS")]
    pub poll_timeout_ms: Option<u64>,

    /// Seconds of inactivity after which a session is closed
    #[arg(long, env = "ECHO_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Milliseconds workers get to exit after a graceful stop request
    #[arg(long, env = "ECHO_GRACE_PERIOD_MS")]
    pub grace_period_ms: Option<u64>,

    /// Worker execution model
    #[arg(long, value_enum, env = "ECHO_WORKER_MODE")]
    pub worker_mode: Option<WorkerMode>,

    /// Close rejected connections without writing the capacity message
    #[arg(long)]
    pub no_capacity_message: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ECHO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Append log lines to this file instead of stderr
    #[arg(long, env = "ECHO_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Flags passed by the supervisor to a worker process.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Descriptor holding the client connection
    #[arg(long, default_value_t = WORKER_FD)]
    pub fd: i32,

    #[arg(long)]
    pub session_id: u64,

    /// Peer address; queried from the socket when absent
    #[arg(long)]
    pub peer: Option<SocketAddr>,

    #[arg(long, default_value_t = 10)]
    pub io_target: usize,

    #[arg(long, default_value_t = 1000)]
    pub poll_timeout_ms: u64,

    #[arg(long, default_value_t = 60_000)]
    pub idle_timeout_ms: u64,

    #[arg(long, default_value_t = 1024)]
    pub buffer_size: usize,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl WorkerArgs {
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            io_target: self.io_target,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            buffer_size: self.buffer_size,
        }
    }
}

/// Flags for the `client` subcommand.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server address
    #[arg(short = 'c', long, default_value = "127.0.0.1:9000")]
    pub connect: String,

    /// Number of messages to send
    #[arg(short = 'n', long, default_value_t = 10)]
    pub count: usize,

    /// Message prefix; messages are `<prefix>-<n>`
    #[arg(long, default_value = "ping")]
    pub prefix: String,

    /// Per-call readiness timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Accept loop wake-up interval in milliseconds
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            accept_poll_ms: default_accept_poll_ms(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub mode: WorkerMode,
    /// Written to connections rejected at capacity; empty disables it
    #[serde(default = "default_capacity_message")]
    pub capacity_message: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            mode: WorkerMode::default(),
            capacity_message: default_capacity_message(),
        }
    }
}

/// Per-session I/O configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_io_target")]
    pub io_target: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            io_target: default_io_target(),
            poll_timeout_ms: default_poll_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Two-phase shutdown configuration
#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_shutdown_poll_ms")]
    pub poll_interval_ms: u64,
    /// Wait after the forced kill before the final drain
    #[serde(default = "default_kill_settle_ms")]
    pub kill_settle_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            poll_interval_ms: default_shutdown_poll_ms(),
            kill_settle_ms: default_kill_settle_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_accept_poll_ms() -> u64 {
    1000
}

fn default_max_workers() -> usize {
    32
}

fn default_capacity_message() -> String {
    "service at capacity\r\n".to_string()
}

fn default_io_target() -> usize {
    10
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_buffer_size() -> usize {
    1024
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_shutdown_poll_ms() -> u64 {
    10
}

fn default_kill_settle_ms() -> u64 {
    150
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub accept_poll: Duration,
    pub max_workers: usize,
    pub worker_mode: WorkerMode,
    pub capacity_message: Option<String>,
    pub session: SessionLimits,
    pub grace_period: Duration,
    pub shutdown_poll: Duration,
    pub kill_settle: Duration,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load(cli: ServeArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over a parsed TOML config and validate the result.
    pub fn resolve(cli: ServeArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{listen_str}'")))?;

        let capacity_message = if cli.no_capacity_message || file.workers.capacity_message.is_empty() {
            None
        } else {
            Some(file.workers.capacity_message)
        };

        let config = Config {
            listen,
            backlog: file.server.backlog,
            accept_poll: Duration::from_millis(file.server.accept_poll_ms),
            max_workers: cli.max_workers.unwrap_or(file.workers.max_workers),
            worker_mode: cli.worker_mode.unwrap_or(file.workers.mode),
            capacity_message,
            session: SessionLimits {
                io_target: cli.io_target.unwrap_or(file.session.io_target),
                poll_timeout: Duration::from_millis(
                    cli.poll_timeout_ms.unwrap_or(file.session.poll_timeout_ms),
                ),
                idle_timeout: Duration::from_secs(
                    cli.idle_timeout_secs.unwrap_or(file.session.idle_timeout_secs),
                ),
                buffer_size: file.session.buffer_size,
            },
            grace_period: Duration::from_millis(
                cli.grace_period_ms.unwrap_or(file.shutdown.grace_period_ms),
            ),
            shutdown_poll: Duration::from_millis(file.shutdown.poll_interval_ms),
            kill_settle: Duration::from_millis(file.shutdown.kill_settle_ms),
            log_level: cli.log_level.unwrap_or(file.logging.level),
            log_file: cli.log_file.or(file.logging.file),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.session.io_target == 0 {
            return Err(ConfigError::Invalid("io_target must be at least 1".into()));
        }
        if self.session.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1".into()));
        }
        if self.session.poll_timeout.is_zero()
            || self.session.idle_timeout.is_zero()
            || self.accept_poll.is_zero()
            || self.shutdown_poll.is_zero()
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::resolve(ServeArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.max_workers, 32);
        assert_eq!(config.session.io_target, 10);
        assert_eq!(config.session.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.session.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.session.buffer_size, 1024);
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.worker_mode, WorkerMode::Process);
        assert_eq!(config.capacity_message.as_deref(), Some("service at capacity\r\n"));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7000"

            [workers]
            max_workers = 4
            mode = "task"

            [session]
            io_target = 3
            idle_timeout_secs = 5

            [shutdown]
            grace_period_ms = 250

            [logging]
            level = "debug"
        "#;

        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::resolve(ServeArgs::default(), file).unwrap();
        assert_eq!(config.listen, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.worker_mode, WorkerMode::Task);
        assert_eq!(config.session.io_target, 3);
        assert_eq!(config.session.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str("[workers]\nmax_workers = 4\n").unwrap();
        let cli = ServeArgs {
            max_workers: Some(2),
            worker_mode: Some(WorkerMode::Task),
            no_capacity_message: true,
            ..Default::default()
        };

        let config = Config::resolve(cli, file).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.worker_mode, WorkerMode::Task);
        assert!(config.capacity_message.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cli = ServeArgs {
            max_workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let cli = ServeArgs {
            listen: Some("not an address".into()),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nio_target = 7").unwrap();

        let cli = ServeArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let config = Config::load(cli).unwrap();
        assert_eq!(config.session.io_target, 7);
    }

    #[test]
    fn test_missing_file_reported() {
        let cli = ServeArgs {
            config: Some(PathBuf::from("/nonexistent/echo.toml")),
            ..Default::default()
        };
        assert!(matches!(Config::load(cli), Err(ConfigError::FileRead(..))));
    }

    #[test]
    fn test_serve_is_default_command() {
        std::env::set_var("ECHO_IDLE_TIMEOUT_SECS", "42");
        let bare = CliArgs::try_parse_from(["echo-supervisor"]).unwrap();
        let flags =
            CliArgs::try_parse_from(["echo-supervisor", "--max-workers", "2"]).unwrap();
        std::env::remove_var("ECHO_IDLE_TIMEOUT_SECS");

        match bare.into_command() {
            Command::Serve(args) => assert_eq!(args.idle_timeout_secs, Some(42)),
            other => panic!("unexpected: {:?}", other),
        }
        match flags.into_command() {
            Command::Serve(args) => assert_eq!(args.max_workers, Some(2)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_worker_args_limits() {
        let cli = CliArgs::try_parse_from([
            "echo-supervisor",
            "worker",
            "--session-id",
            "9",
            "--io-target",
            "4",
            "--idle-timeout-ms",
            "1500",
        ])
        .unwrap();

        match cli.command {
            Some(Command::Worker(args)) => {
                assert_eq!(args.fd, WORKER_FD);
                assert_eq!(args.session_id, 9);
                let limits = args.limits();
                assert_eq!(limits.io_target, 4);
                assert_eq!(limits.idle_timeout, Duration::from_millis(1500));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
