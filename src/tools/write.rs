//! Write and stored procedure tools.
//!
//! Implements `mssql_execute_write` and `mssql_execute_procedure`. Both
//! tools refuse to run unless the server was started with `--allow-write`;
//! procedures additionally require an allowlist entry. Writes run inside an
//! explicit transaction and roll back on any failure.

use crate::db::executor::parse_procedure_name;
use crate::error::{DbError, DbResult};
use crate::models::{ProcedureRequest, ProcedureResult, QueryRequest, SqlParam};
use crate::tools::{ToolContext, ValidationVerdict};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Input for the `mssql_execute_write` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteWriteInput {
    /// Single INSERT, UPDATE, or DELETE statement.
    pub statement: String,
    /// Database to run against. Omit for the connection's default database.
    #[serde(default)]
    pub database: Option<String>,
    /// Validate the statement without executing it. Default: false
    #[serde(default)]
    pub dry_run: bool,
}

/// Output from the `mssql_execute_write` tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ExecuteWriteOutput {
    /// True when the statement ran and committed. False on dry runs.
    pub executed: bool,
    /// Rows affected by the committed statement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// Statement execution time in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Dry-run verdict. Nothing was executed when this is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationVerdict>,
}

impl ExecuteWriteOutput {
    fn committed(rows_affected: u64, execution_time_ms: u64) -> Self {
        Self {
            executed: true,
            rows_affected: Some(rows_affected),
            execution_time_ms: Some(execution_time_ms),
            validation: None,
        }
    }

    fn dry_run(validation: ValidationVerdict) -> Self {
        Self {
            executed: false,
            rows_affected: None,
            execution_time_ms: None,
            validation: Some(validation),
        }
    }
}

/// Input for the `mssql_execute_procedure` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProcedureInput {
    /// Procedure to call, as `name` or `schema.name`. Must be allowlisted.
    pub procedure_name: String,
    /// Named parameters, passed as `@name = value`.
    #[serde(default)]
    pub parameters: BTreeMap<String, SqlParam>,
    /// Database to run against. Omit for the connection's default database.
    #[serde(default)]
    pub database: Option<String>,
    /// Call timeout in seconds. Default: 30, max: 300
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Handler for the write-path tools.
pub struct WriteToolHandler {
    context: Arc<ToolContext>,
}

impl WriteToolHandler {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }

    /// Run one write statement inside a transaction, or just validate it
    /// when `dry_run` is set. The write-mode check comes first either way:
    /// on a read-only server this tool does nothing at all.
    pub async fn execute_write(&self, input: ExecuteWriteInput) -> DbResult<ExecuteWriteOutput> {
        if !self.context.allow_write {
            return Err(DbError::write_disabled("mssql_execute_write"));
        }

        if input.dry_run {
            let verdict = self.context.validator.validate_write(&input.statement);
            info!(approved = verdict.approved, "Dry run validated");
            return Ok(ExecuteWriteOutput::dry_run(verdict));
        }

        let statement = self.context.validator.check_write(&input.statement)?;
        let request = QueryRequest::new(statement).with_database(input.database);

        let mut lease = self.context.pool.acquire().await?;
        let outcome = self.context.executor.run_write(&mut lease, &request, &[]).await;
        lease.release().await;
        let result = outcome?;

        info!(
            rows_affected = result.rows_affected,
            execution_time_ms = result.execution_time_ms,
            "Write committed"
        );

        Ok(ExecuteWriteOutput::committed(
            result.rows_affected.unwrap_or(0),
            result.execution_time_ms,
        ))
    }

    /// Call an allowlisted stored procedure with named parameters.
    ///
    /// The reference is parsed before the allowlist check so that
    /// `usp_report`, `dbo.usp_report` and `[dbo].[usp_report]` are treated
    /// as the same procedure.
    pub async fn execute_procedure(&self, input: ProcedureInput) -> DbResult<ProcedureResult> {
        if !self.context.allow_write {
            return Err(DbError::write_disabled("mssql_execute_procedure"));
        }

        let (schema, name) = parse_procedure_name(&input.procedure_name)?;
        if !self.context.procedure_allowed(&schema, &name) {
            return Err(DbError::procedure_not_allowlisted(format!(
                "{schema}.{name}"
            )));
        }

        let request = ProcedureRequest::new(input.procedure_name)
            .with_parameters(input.parameters)
            .with_database(input.database)
            .with_timeout_secs(input.timeout);

        let mut lease = self.context.pool.acquire().await?;
        let outcome = self.context.executor.run_procedure(&mut lease, &request).await;
        lease.release().await;
        let result = outcome?;

        info!(
            procedure = %format!("{schema}.{name}"),
            result_sets = result.result_set_count,
            return_value = result.return_value,
            execution_time_ms = result.execution_time_ms,
            "Procedure executed"
        );

        Ok(result)
    }
}
