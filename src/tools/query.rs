//! Query execution tool.
//!
//! This module implements the `mssql_query` MCP tool. Every statement goes
//! through the lexical gate first; in the default read-only mode that means
//! SELECT and nothing else. When the server runs with `--allow-write`, the
//! gate also admits single INSERT/UPDATE/DELETE statements, which are routed
//! through the transactional write path.

use crate::error::DbResult;
use crate::models::{
    ColumnMetadata, MAX_QUERY_TIMEOUT_SECS, MAX_ROW_LIMIT, QueryRequest, QueryResult,
};
use crate::tools::ToolContext;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::info;

/// Input for the `mssql_query` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct QueryInput {
    /// Single SQL statement to execute. SELECT only unless the server was
    /// started with --allow-write. Multi-statement batches are rejected.
    pub query: String,
    /// Database to run against. Omit for the connection's default database.
    #[serde(default)]
    pub database: Option<String>,
    /// Maximum rows to return. Default: 1000, max: 10000
    #[serde(default)]
    pub max_rows: Option<u32>,
    /// Statement timeout in seconds. Default: 30, max: 300
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Output from the `mssql_query` tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct QueryOutput {
    /// Column metadata for the first result set.
    pub columns: Vec<ColumnMetadata>,
    /// Result rows in column order.
    pub rows: Vec<Vec<JsonValue>>,
    /// Number of rows returned.
    pub row_count: usize,
    /// Rows affected, present when a write statement was executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// True if more rows existed than the row cap allowed.
    pub truncated: bool,
    /// Statement execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Set when a requested limit was silently capped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl QueryOutput {
    fn from_result_with_warning(result: QueryResult, warning: Option<String>) -> Self {
        Self {
            columns: result.columns,
            rows: result.rows,
            row_count: result.row_count,
            rows_affected: result.rows_affected,
            truncated: result.truncated,
            execution_time_ms: result.execution_time_ms,
            warning,
        }
    }
}

impl From<QueryResult> for QueryOutput {
    fn from(result: QueryResult) -> Self {
        Self::from_result_with_warning(result, None)
    }
}

/// Warning text when a requested cap exceeds the hard maximum. The request
/// still runs, clamped; the caller just gets told about it.
fn cap_warning(input: &QueryInput) -> Option<String> {
    let mut notes = Vec::new();
    if let Some(requested) = input.max_rows {
        if requested > MAX_ROW_LIMIT {
            notes.push(format!(
                "requested max_rows {requested} exceeds the maximum ({MAX_ROW_LIMIT}); results capped to {MAX_ROW_LIMIT} rows"
            ));
        }
    }
    if let Some(requested) = input.timeout {
        if requested > MAX_QUERY_TIMEOUT_SECS {
            notes.push(format!(
                "requested timeout {requested}s exceeds the maximum ({MAX_QUERY_TIMEOUT_SECS}s); capped to {MAX_QUERY_TIMEOUT_SECS}s"
            ));
        }
    }
    if notes.is_empty() {
        None
    } else {
        Some(notes.join("; "))
    }
}

/// Handler for the `mssql_query` tool.
pub struct QueryToolHandler {
    context: Arc<ToolContext>,
}

impl QueryToolHandler {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }

    /// Validate, acquire a connection, execute, release.
    ///
    /// Validation happens before the pool is touched, so a rejected
    /// statement never consumes a connection. The lease is released on
    /// both the success and the error path; its Drop impl covers
    /// cancellation in between.
    pub async fn query(&self, input: QueryInput) -> DbResult<QueryOutput> {
        let statement = self
            .context
            .validator
            .check(&input.query, self.context.allow_write)?;
        let is_write = self.context.validator.is_write_statement(&statement);
        let warning = cap_warning(&input);

        let request = QueryRequest::new(statement)
            .with_database(input.database)
            .with_max_rows(input.max_rows)
            .with_timeout_secs(input.timeout);

        let mut lease = self.context.pool.acquire().await?;
        let outcome = if is_write {
            self.context.executor.run_write(&mut lease, &request, &[]).await
        } else {
            self.context.executor.run_query(&mut lease, &request, &[]).await
        };
        lease.release().await;
        let result = outcome?;

        info!(
            row_count = result.row_count,
            rows_affected = result.rows_affected,
            truncated = result.truncated,
            execution_time_ms = result.execution_time_ms,
            write = is_write,
            "Statement executed"
        );

        Ok(QueryOutput::from_result_with_warning(result, warning))
    }
}
