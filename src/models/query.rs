//! Query request and result types.
//!
//! Limits are clamped, not rejected: a caller asking for more rows or time
//! than the server allows gets the maximum and a warning, never an error.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default row limit applied when the caller does not specify one.
pub const DEFAULT_ROW_LIMIT: u32 = 1000;

/// Hard upper bound on rows returned by a single query.
pub const MAX_ROW_LIMIT: u32 = 10_000;

/// Default per-statement timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Hard upper bound on the per-statement timeout in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u64 = 300;

/// A parameter value bound over TDS. JSON-shaped on the wire; the driver
/// layer converts it to the matching SQL Server type. Values are always
/// bound, never interpolated into statement text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SqlParam {
    /// SQL NULL.
    Null,
    /// BIT.
    Bool(bool),
    /// BIGINT (covers all integer widths).
    Int(i64),
    /// FLOAT(53).
    Float(f64),
    /// NVARCHAR.
    Text(String),
}

impl SqlParam {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

/// One statement to run, with per-call overrides.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub statement: String,
    /// Target database for this call; the session default when absent.
    pub database: Option<String>,
    pub max_rows: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl QueryRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            database: None,
            max_rows: None,
            timeout_secs: None,
        }
    }

    pub fn with_database(mut self, database: Option<String>) -> Self {
        self.database = database;
        self
    }

    pub fn with_max_rows(mut self, max_rows: Option<u32>) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: Option<u64>) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Row limit with defaults and bounds applied: [1, MAX_ROW_LIMIT].
    pub fn effective_max_rows(&self) -> u32 {
        self.max_rows
            .unwrap_or(DEFAULT_ROW_LIMIT)
            .clamp(1, MAX_ROW_LIMIT)
    }
}

/// Name and SQL type of one result column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnMetadata {
    pub name: String,
    /// SQL Server type name, e.g. "int", "nvarchar", "datetime2".
    pub type_name: String,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// One result set: column metadata plus row tuples in column order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResultSet {
    pub columns: Vec<ColumnMetadata>,
    /// Row tuples; each inner vec is ordered like `columns`.
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnMetadata>, rows: Vec<Vec<Value>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
        }
    }

    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
        }
    }
}

/// Outcome of a single query execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryResult {
    pub columns: Vec<ColumnMetadata>,
    /// Row tuples; each inner vec is ordered like `columns`.
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    /// Set for write statements routed through the transactional path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// True when the row limit cut the result short.
    pub truncated: bool,
    /// Statement-run time only; queueing for a connection is excluded.
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Build a read result from a materialized result set.
    pub fn from_rows(result_set: ResultSet, truncated: bool, execution_time_ms: u64) -> Self {
        Self {
            columns: result_set.columns,
            rows: result_set.rows,
            row_count: result_set.row_count,
            rows_affected: None,
            truncated,
            execution_time_ms,
        }
    }

    /// Build a write result: no rows, only the affected count.
    pub fn from_write(rows_affected: u64, execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            rows_affected: Some(rows_affected),
            truncated: false,
            execution_time_ms,
        }
    }
}

/// One stored procedure call. Parameters are ordered by name so the
/// generated batch is deterministic.
#[derive(Debug, Clone)]
pub struct ProcedureRequest {
    /// `name` or `schema.name`; brackets are tolerated and stripped.
    pub procedure: String,
    pub parameters: BTreeMap<String, SqlParam>,
    pub database: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl ProcedureRequest {
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            parameters: BTreeMap::new(),
            database: None,
            timeout_secs: None,
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, SqlParam>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_database(mut self, database: Option<String>) -> Self {
        self.database = database;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: Option<u64>) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Outcome of a stored procedure call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProcedureResult {
    pub result_sets: Vec<ResultSet>,
    pub result_set_count: usize,
    /// Integer return value of the procedure, when the server reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<i32>,
    pub execution_time_ms: u64,
}
