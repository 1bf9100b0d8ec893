//! Data models for the MSSQL MCP Server.
//!
//! This module re-exports all model types used throughout the application.

pub mod catalog;
pub mod query;

// Re-export commonly used types
pub use catalog::{
    ColumnInfo, ConstraintInfo, DatabaseInfo, ForeignKeyInfo, IndexInfo, ReferentialAction,
    TableDetails, TableInfo, TableType,
};
pub use query::{
    ColumnMetadata, DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_ROW_LIMIT, MAX_QUERY_TIMEOUT_SECS,
    MAX_ROW_LIMIT, ProcedureRequest, ProcedureResult, QueryRequest, QueryResult, ResultSet,
    SqlParam,
};
