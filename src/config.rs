//! Configuration handling for the MSSQL MCP Server.
//!
//! This module provides configuration management via CLI arguments and
//! environment variables. The variable names follow the conventional
//! `MSSQL_*` surface so existing deployments carry over unchanged.

use crate::models::query::DEFAULT_QUERY_TIMEOUT_SECS;
use clap::{ArgAction, Parser, ValueEnum};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1433;
pub const DEFAULT_DATABASE: &str = "master";
pub const DEFAULT_USER: &str = "sa";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

// Pool configuration defaults
pub const DEFAULT_MIN_POOL_SIZE: u32 = 2;
pub const DEFAULT_MAX_POOL_SIZE: u32 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECTION_LIFETIME_SECS: u64 = 1800;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_VALIDATION_INTERVAL_SECS: u64 = 30;

// HTTP transport defaults
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_MCP_ENDPOINT: &str = "/";

/// Sizing and lifecycle settings for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connections kept alive even when idle.
    pub min_size: u32,
    /// Hard cap on live connections.
    pub max_size: u32,
    /// How long an acquire may wait before failing with pool exhaustion.
    pub acquire_timeout: Duration,
    /// Age after which a connection is recycled regardless of health.
    pub max_lifetime: Duration,
    /// Idle time after which a parked connection is closed.
    pub idle_timeout: Duration,
    /// A connection validated longer ago than this is re-pinged on checkout.
    pub validation_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_POOL_SIZE,
            max_size: DEFAULT_MAX_POOL_SIZE,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            max_lifetime: Duration::from_secs(DEFAULT_CONNECTION_LIFETIME_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            validation_interval: Duration::from_secs(DEFAULT_VALIDATION_INTERVAL_SECS),
        }
    }
}

impl PoolSettings {
    /// Validate pool settings and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max pool size must be greater than 0".to_string());
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "min pool size ({}) cannot exceed max pool size ({})",
                self.min_size, self.max_size
            ));
        }
        Ok(())
    }
}

/// Transport mode for the MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TransportMode {
    /// Standard input/output (for CLI integration)
    #[default]
    Stdio,
    /// Streamable HTTP (for web clients)
    Http,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Everything needed to open one connection to the server.
#[derive(Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Session default database.
    pub database: String,
    pub user: String,
    pub password: String,
    pub encrypt: bool,
    pub trust_server_certificate: bool,
    pub connect_timeout: Duration,
}

/// Credentials stay out of logs and error chains.
impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Configuration for the MSSQL MCP Server.
#[derive(Clone, Parser)]
#[command(
    name = "mssql-mcp-server",
    about = "MCP server for Microsoft SQL Server - enables AI assistants to query MSSQL databases safely",
    version,
    author
)]
pub struct Config {
    /// SQL Server hostname or IP address
    #[arg(long, default_value = DEFAULT_HOST, env = "MSSQL_HOST")]
    pub host: String,

    /// SQL Server TCP port
    #[arg(long, default_value_t = DEFAULT_PORT, env = "MSSQL_PORT")]
    pub port: u16,

    /// Default database for new sessions
    #[arg(long, default_value = DEFAULT_DATABASE, env = "MSSQL_DATABASE")]
    pub database: String,

    /// Login user
    #[arg(long, default_value = DEFAULT_USER, env = "MSSQL_USER")]
    pub user: String,

    /// Login password
    #[arg(long, env = "MSSQL_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Encrypt the connection (TLS). Pass `--encrypt false` for legacy servers.
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        env = "MSSQL_ENCRYPT"
    )]
    pub encrypt: bool,

    /// Accept the server certificate without CA verification
    #[arg(long, env = "MSSQL_TRUST_SERVER_CERTIFICATE")]
    pub trust_server_certificate: bool,

    /// Connection establishment timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS,
        env = "MSSQL_CONNECT_TIMEOUT"
    )]
    pub connect_timeout: u64,

    /// Default per-statement timeout in seconds (per-call override allowed)
    #[arg(
        long,
        default_value_t = DEFAULT_QUERY_TIMEOUT_SECS,
        env = "MSSQL_QUERY_TIMEOUT"
    )]
    pub query_timeout: u64,

    /// Connections kept open even when idle
    #[arg(
        long,
        default_value_t = DEFAULT_MIN_POOL_SIZE,
        env = "MSSQL_MIN_POOL_SIZE"
    )]
    pub min_pool_size: u32,

    /// Maximum concurrent connections
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_POOL_SIZE,
        env = "MSSQL_MAX_POOL_SIZE"
    )]
    pub max_pool_size: u32,

    /// Seconds an idle connection may sit in the pool before being closed
    #[arg(
        long,
        default_value_t = DEFAULT_IDLE_TIMEOUT_SECS,
        env = "MSSQL_IDLE_TIMEOUT"
    )]
    pub idle_timeout: u64,

    /// Seconds after which a connection is recycled regardless of health
    #[arg(
        long,
        default_value_t = DEFAULT_CONNECTION_LIFETIME_SECS,
        env = "MSSQL_CONNECTION_LIFETIME"
    )]
    pub connection_lifetime: u64,

    /// Seconds a caller may wait for a pooled connection
    #[arg(
        long,
        default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS,
        env = "MSSQL_ACQUIRE_TIMEOUT"
    )]
    pub acquire_timeout: u64,

    /// Seconds before a checked-out connection is re-validated with a ping
    #[arg(
        long,
        default_value_t = DEFAULT_VALIDATION_INTERVAL_SECS,
        env = "MSSQL_VALIDATION_INTERVAL"
    )]
    pub validation_interval: u64,

    /// Allow INSERT/UPDATE/DELETE statements and procedure execution
    #[arg(long, env = "MSSQL_ALLOW_WRITE_OPERATIONS")]
    pub allow_write: bool,

    /// Stored procedures callable via mssql_execute_procedure.
    /// Can be specified multiple times or as comma-separated values.
    #[arg(
        long = "procedure-allowlist",
        value_name = "NAME",
        env = "MSSQL_PROCEDURE_ALLOWLIST",
        value_delimiter = ','
    )]
    pub procedure_allowlist: Vec<String>,

    /// Transport mode (stdio or http)
    #[arg(
        short,
        long,
        value_enum,
        default_value = "stdio",
        env = "MSSQL_MCP_TRANSPORT"
    )]
    pub transport: TransportMode,

    /// HTTP host to bind to (only used with http transport)
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "MSSQL_MCP_HTTP_HOST")]
    pub http_host: String,

    /// HTTP port to bind to (only used with http transport)
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "MSSQL_MCP_HTTP_PORT")]
    pub http_port: u16,

    /// MCP endpoint path (only used with http transport)
    #[arg(long, default_value = DEFAULT_MCP_ENDPOINT, env = "MSSQL_MCP_ENDPOINT")]
    pub mcp_endpoint: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MSSQL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "MSSQL_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_string(),
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            encrypt: true,
            trust_server_certificate: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            min_pool_size: DEFAULT_MIN_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            connection_lifetime: DEFAULT_CONNECTION_LIFETIME_SECS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            validation_interval: DEFAULT_VALIDATION_INTERVAL_SECS,
            allow_write: false,
            procedure_allowlist: Vec::new(),
            transport: TransportMode::Stdio,
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            mcp_endpoint: DEFAULT_MCP_ENDPOINT.to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.pool_settings().validate()?;
        if !self.mcp_endpoint.starts_with('/') {
            return Err(format!(
                "MCP endpoint must start with '/', got '{}'",
                self.mcp_endpoint
            ));
        }
        Ok(())
    }

    /// Connection options for the tiberius factory.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            encrypt: self.encrypt,
            trust_server_certificate: self.trust_server_certificate,
            connect_timeout: Duration::from_secs(self.connect_timeout),
        }
    }

    /// Pool sizing and lifecycle settings.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            min_size: self.min_pool_size,
            max_size: self.max_pool_size,
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
            max_lifetime: Duration::from_secs(self.connection_lifetime),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            validation_interval: Duration::from_secs(self.validation_interval),
        }
    }

    /// Allowlisted procedure names, trimmed, with empty entries dropped.
    pub fn procedure_allowlist(&self) -> Vec<String> {
        self.procedure_allowlist
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Get the default query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Credentials stay out of logs and error chains.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("encrypt", &self.encrypt)
            .field("allow_write", &self.allow_write)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database, DEFAULT_DATABASE);
        assert_eq!(config.transport, TransportMode::Stdio);
        assert!(config.encrypt);
        assert!(!config.allow_write);
    }

    #[test]
    fn test_http_bind_addr() {
        let config = Config {
            http_host: "0.0.0.0".to_string(),
            http_port: 3000,
            ..Config::default()
        };
        assert_eq!(config.http_bind_addr(), "0.0.0.0:3000");
    }

    #[test]
    fn test_pool_settings_from_config() {
        let config = Config {
            min_pool_size: 3,
            max_pool_size: 7,
            acquire_timeout: 5,
            connection_lifetime: 60,
            idle_timeout: 30,
            validation_interval: 10,
            ..Config::default()
        };
        let settings = config.pool_settings();
        assert_eq!(settings.min_size, 3);
        assert_eq!(settings.max_size, 7);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(5));
        assert_eq!(settings.max_lifetime, Duration::from_secs(60));
        assert_eq!(settings.idle_timeout, Duration::from_secs(30));
        assert_eq!(settings.validation_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_pool_settings_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.min_size, DEFAULT_MIN_POOL_SIZE);
        assert_eq!(settings.max_size, DEFAULT_MAX_POOL_SIZE);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_pool_settings_rejects_zero_max() {
        let settings = PoolSettings {
            max_size: 0,
            min_size: 0,
            ..PoolSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_pool_settings_rejects_min_over_max() {
        let settings = PoolSettings {
            min_size: 11,
            max_size: 10,
            ..PoolSettings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.contains("cannot exceed"));
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let config = Config {
            mcp_endpoint: "mcp".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_connect_options_carries_fields() {
        let config = Config {
            host: "db.internal".to_string(),
            port: 11433,
            database: "sales".to_string(),
            user: "reader".to_string(),
            password: "s3cret".to_string(),
            connect_timeout: 12,
            ..Config::default()
        };
        let opts = config.connect_options();
        assert_eq!(opts.host, "db.internal");
        assert_eq!(opts.port, 11433);
        assert_eq!(opts.database, "sales");
        assert_eq!(opts.user, "reader");
        assert_eq!(opts.password, "s3cret");
        assert_eq!(opts.connect_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_connect_options_debug_redacts_password() {
        let config = Config {
            password: "hunter2".to_string(),
            ..Config::default()
        };
        let debug = format!("{:?}", config.connect_options());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let config = Config {
            password: "hunter2".to_string(),
            ..Config::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_procedure_allowlist_normalized() {
        let config = Config {
            procedure_allowlist: vec![
                " dbo.GetOrders ".to_string(),
                String::new(),
                "ReportSales".to_string(),
            ],
            ..Config::default()
        };
        assert_eq!(
            config.procedure_allowlist(),
            vec!["dbo.GetOrders".to_string(), "ReportSales".to_string()]
        );
    }

    #[test]
    fn test_transport_mode_display() {
        assert_eq!(TransportMode::Stdio.to_string(), "stdio");
        assert_eq!(TransportMode::Http.to_string(), "http");
    }

    #[test]
    fn test_query_timeout_duration() {
        let config = Config {
            query_timeout: 60,
            ..Config::default()
        };
        assert_eq!(config.query_timeout_duration(), Duration::from_secs(60));
    }
}
