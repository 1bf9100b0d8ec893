//! Error types for the MSSQL MCP Server.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Each error variant provides actionable messages to help AI assistants understand
//! and recover from error conditions. Driver failures are sanitized here: raw
//! connection details and credentials never reach the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Statement rejected: {reason}")]
    ValidationRejected { reason: String },

    #[error("Write operations are disabled: {operation}")]
    WriteDisabled { operation: String },

    #[error("Procedure '{procedure}' is not in the configured allowlist")]
    ProcedureNotAllowlisted { procedure: String },

    #[error("Connection pool exhausted: no connection became available within {waited_secs}s")]
    PoolExhausted { waited_secs: u64 },

    #[error("Connection unavailable: {message}")]
    ConnectionUnavailable { message: String },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Database '{database}' not found")]
    DatabaseNotFound { database: String },

    #[error("Driver error: {message}")]
    Driver { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a validation rejection with the rule that fired.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::ValidationRejected {
            reason: reason.into(),
        }
    }

    /// Create a write-disabled error naming the blocked operation.
    pub fn write_disabled(operation: impl Into<String>) -> Self {
        Self::WriteDisabled {
            operation: operation.into(),
        }
    }

    /// Create a procedure allowlist error.
    pub fn procedure_not_allowlisted(procedure: impl Into<String>) -> Self {
        Self::ProcedureNotAllowlisted {
            procedure: procedure.into(),
        }
    }

    /// Create a pool exhaustion error with the time spent waiting.
    pub fn pool_exhausted(waited_secs: u64) -> Self {
        Self::PoolExhausted { waited_secs }
    }

    /// Create a connection unavailable error. The message must already be
    /// free of credentials and connection strings.
    pub fn connection_unavailable(message: impl Into<String>) -> Self {
        Self::ConnectionUnavailable {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a database not found error.
    pub fn database_not_found(database: impl Into<String>) -> Self {
        Self::DatabaseNotFound {
            database: database.into(),
        }
    }

    /// Create a driver error with an already-sanitized message.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable discriminant, surfaced in MCP error data.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::WriteDisabled { .. } => "write_disabled",
            Self::ProcedureNotAllowlisted { .. } => "procedure_not_allowlisted",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::ConnectionUnavailable { .. } => "connection_unavailable",
            Self::PoolClosed => "pool_closed",
            Self::Timeout { .. } => "timeout",
            Self::DatabaseNotFound { .. } => "database_not_found",
            Self::Driver { .. } => "driver",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Internal { .. } => "internal",
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::ConnectionUnavailable { .. } | Self::Timeout { .. }
        )
    }

    /// Get the recovery suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ValidationRejected { .. } => Some(
                "Rewrite the statement as a single SELECT, or use mssql_execute_write in write mode",
            ),
            Self::WriteDisabled { .. } => Some(
                "Start the server with --allow-write (MSSQL_ALLOW_WRITE_OPERATIONS=true) to enable writes",
            ),
            Self::ProcedureNotAllowlisted { .. } => {
                Some("Add the procedure to --procedure-allowlist to permit it")
            }
            Self::PoolExhausted { .. } => {
                Some("Retry shortly, or raise --max-pool-size / --acquire-timeout")
            }
            Self::ConnectionUnavailable { .. } => {
                Some("Check network connectivity and SQL Server availability")
            }
            Self::Timeout { .. } => {
                Some("Consider increasing the timeout or optimizing the statement")
            }
            Self::DatabaseNotFound { .. } => {
                Some("Use mssql_list_databases to see available databases")
            }
            Self::Driver { .. } => Some("Check the SQL syntax and referenced objects"),
            _ => None,
        }
    }
}

/// Convert tiberius errors to DbError, keeping server diagnostics and
/// stripping everything that could echo connection details.
impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error;
        match err {
            Error::Server(e) => {
                DbError::driver(format!("server error {}: {}", e.code(), e.message()))
            }
            Error::Io { kind, .. } => {
                DbError::connection_unavailable(format!("network I/O failure ({kind})"))
            }
            Error::Tls(_) => {
                DbError::connection_unavailable("TLS negotiation with the server failed")
            }
            Error::Protocol(msg) => DbError::driver(format!("protocol error: {msg}")),
            Error::Encoding(msg) => DbError::driver(format!("encoding error: {msg}")),
            Error::Conversion(msg) => DbError::internal(format!("type conversion failed: {msg}")),
            _ => DbError::driver("unexpected driver failure"),
        }
    }
}

/// Socket-level failures during connect map to the retryable class.
impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::connection_unavailable(format!("network I/O failure ({})", err.kind()))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Build the `data` payload attached to MCP errors.
fn error_data(err: &DbError) -> Option<serde_json::Value> {
    let mut data = serde_json::json!({
        "kind": err.kind(),
        "retryable": err.is_retryable(),
    });
    if let Some(suggestion) = err.suggestion() {
        data["suggestion"] = serde_json::Value::String(suggestion.to_string());
    }
    Some(data)
}

/// Convert DbError to MCP ErrorData for semantic error categorization.
///
/// Caller mistakes (rejected statements, disabled writes, bad arguments) map
/// to `invalid_params`; a missing database maps to `resource_not_found`;
/// everything on the server/pool side maps to `internal_error`.
impl From<DbError> for rmcp::ErrorData {
    fn from(err: DbError) -> Self {
        let data = error_data(&err);
        match &err {
            DbError::ValidationRejected { .. }
            | DbError::WriteDisabled { .. }
            | DbError::ProcedureNotAllowlisted { .. }
            | DbError::InvalidInput { .. } => {
                rmcp::ErrorData::invalid_params(err.to_string(), data)
            }

            DbError::DatabaseNotFound { .. } => {
                rmcp::ErrorData::resource_not_found(err.to_string(), data)
            }

            DbError::PoolExhausted { .. }
            | DbError::ConnectionUnavailable { .. }
            | DbError::PoolClosed
            | DbError::Timeout { .. }
            | DbError::Driver { .. }
            | DbError::Internal { .. } => rmcp::ErrorData::internal_error(err.to_string(), data),
        }
    }
}
