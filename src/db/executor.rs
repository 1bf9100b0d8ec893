//! Statement execution against a leased connection.
//!
//! The executor owns per-call policy: timeout budgets, row caps, database
//! overrides, and the transaction bracket around writes. Every step of a
//! call, the `USE` switch included, spends from one deadline, so a call
//! never outlives its budget. A call that times out leaves the session in
//! an unknown state; the lease is marked broken and the pool closes it
//! instead of re-idling it.

use std::time::{Duration, Instant};

use tokio::time::{timeout, timeout_at};
use tracing::{debug, warn};

use crate::db::MssqlLease;
use crate::db::catalog;
use crate::error::{DbError, DbResult};
use crate::models::{
    DEFAULT_QUERY_TIMEOUT_SECS, MAX_QUERY_TIMEOUT_SECS, ProcedureRequest, ProcedureResult,
    QueryRequest, QueryResult, ResultSet, SqlParam,
};

/// Bound on the `USE` that puts a session back on its default database.
const RESTORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs statements with timeouts and row caps applied.
pub struct QueryExecutor {
    default_timeout: Duration,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryExecutor {
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }

    /// Executor whose unspecified-timeout default comes from configuration.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: timeout,
        }
    }

    fn budget(&self, timeout_secs: Option<u64>) -> Duration {
        match timeout_secs {
            Some(secs) => Duration::from_secs(secs.clamp(1, MAX_QUERY_TIMEOUT_SECS)),
            None => self.default_timeout,
        }
    }

    /// Run a read statement, collecting at most the effective row cap.
    pub async fn run_query(
        &self,
        lease: &mut MssqlLease,
        request: &QueryRequest,
        params: &[SqlParam],
    ) -> DbResult<QueryResult> {
        let budget = self.budget(request.timeout_secs);
        let max_rows = request.effective_max_rows() as usize;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + budget;

        let switched = match timeout_at(
            deadline,
            enter_database(lease, request.database.as_deref()),
        )
        .await
        {
            Ok(entered) => entered?,
            Err(_) => {
                lease.mark_broken();
                return Err(DbError::timeout("query", budget.as_secs()));
            }
        };

        let outcome = timeout_at(deadline, lease.query(&request.statement, params, max_rows)).await;
        let result = match outcome {
            Ok(Ok((set, truncated))) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(rows = set.row_count, truncated, elapsed_ms, "query executed");
                Ok(QueryResult::from_rows(set, truncated, elapsed_ms))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                lease.mark_broken();
                return Err(DbError::timeout("query", budget.as_secs()));
            }
        };

        if switched {
            restore_database(lease).await;
        }
        result
    }

    /// Run a write statement inside an explicit transaction. The statement
    /// commits only if it succeeds; failures roll back, and a timeout kills
    /// the session so the server aborts the open transaction.
    pub async fn run_write(
        &self,
        lease: &mut MssqlLease,
        request: &QueryRequest,
        params: &[SqlParam],
    ) -> DbResult<QueryResult> {
        let budget = self.budget(request.timeout_secs);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + budget;

        let switched = match timeout_at(
            deadline,
            enter_database(lease, request.database.as_deref()),
        )
        .await
        {
            Ok(entered) => entered?,
            Err(_) => {
                lease.mark_broken();
                return Err(DbError::timeout("write", budget.as_secs()));
            }
        };

        let outcome = timeout_at(
            deadline,
            transactional_write(lease, &request.statement, params),
        )
        .await;
        let result = match outcome {
            Ok(Ok(rows_affected)) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(rows_affected, elapsed_ms, "write executed");
                Ok(QueryResult::from_write(rows_affected, elapsed_ms))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                lease.mark_broken();
                return Err(DbError::timeout("write", budget.as_secs()));
            }
        };

        if switched {
            restore_database(lease).await;
        }
        result
    }

    /// Call a stored procedure and collect every result set plus its
    /// integer return value.
    pub async fn run_procedure(
        &self,
        lease: &mut MssqlLease,
        request: &ProcedureRequest,
    ) -> DbResult<ProcedureResult> {
        let (schema, name) = parse_procedure_name(&request.procedure)?;
        let budget = self.budget(request.timeout_secs);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + budget;

        let mut params: Vec<SqlParam> = Vec::with_capacity(request.parameters.len());
        let mut assignments: Vec<String> = Vec::with_capacity(request.parameters.len());
        for (position, (param_name, value)) in request.parameters.iter().enumerate() {
            let cleaned = clean_parameter_name(param_name)?;
            assignments.push(format!("@{cleaned} = @P{}", position + 1));
            params.push(value.clone());
        }

        let call = format!(
            "DECLARE @rv INT; EXEC @rv = [{schema}].[{name}] {}; SELECT @rv AS return_value;",
            assignments.join(", ")
        );

        let switched = match timeout_at(
            deadline,
            enter_database(lease, request.database.as_deref()),
        )
        .await
        {
            Ok(entered) => entered?,
            Err(_) => {
                lease.mark_broken();
                return Err(DbError::timeout("procedure", budget.as_secs()));
            }
        };

        let outcome = timeout_at(deadline, lease.query_all_sets(&call, &params)).await;
        let result = match outcome {
            Ok(Ok(mut sets)) => {
                let return_value = extract_return_value(&mut sets);
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(
                    procedure = %request.procedure,
                    result_sets = sets.len(),
                    elapsed_ms,
                    "procedure executed"
                );
                Ok(ProcedureResult {
                    result_set_count: sets.len(),
                    result_sets: sets,
                    return_value,
                    execution_time_ms: elapsed_ms,
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                lease.mark_broken();
                return Err(DbError::timeout("procedure", budget.as_secs()));
            }
        };

        if switched {
            restore_database(lease).await;
        }
        result
    }
}

/// Switch the session to a per-call database override. The target must
/// exist; a typo surfaces as a not-found error instead of a driver error.
/// Returns whether a switch actually happened.
pub(crate) async fn enter_database(lease: &mut MssqlLease, database: Option<&str>) -> DbResult<bool> {
    let Some(database) = database else {
        return Ok(false);
    };
    if database.eq_ignore_ascii_case(lease.default_database()) {
        return Ok(false);
    }
    if !catalog::database_exists(lease, database).await? {
        return Err(DbError::database_not_found(database));
    }
    lease
        .batch(&format!("USE [{}]", escape_bracket(database)))
        .await?;
    Ok(true)
}

/// Put the session back on its default database. A session that cannot be
/// restored must not be re-idled, so failure marks the lease broken.
pub(crate) async fn restore_database(lease: &mut MssqlLease) {
    let sql = format!("USE [{}]", escape_bracket(lease.default_database()));
    match timeout(RESTORE_TIMEOUT, lease.batch(&sql)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(error = %err, "failed to restore session database, discarding connection");
            lease.mark_broken();
        }
        Err(_) => {
            warn!("timed out restoring session database, discarding connection");
            lease.mark_broken();
        }
    }
}

async fn transactional_write(
    lease: &mut MssqlLease,
    statement: &str,
    params: &[SqlParam],
) -> DbResult<u64> {
    lease.batch("BEGIN TRANSACTION").await?;
    match lease.exec(statement, params).await {
        Ok(rows_affected) => {
            if let Err(commit_err) = lease.batch("COMMIT TRANSACTION").await {
                // commit state unknown, session cannot be trusted
                lease.mark_broken();
                return Err(commit_err);
            }
            Ok(rows_affected)
        }
        Err(err) => {
            if let Err(rollback_err) = lease.batch("ROLLBACK TRANSACTION").await {
                warn!(error = %rollback_err, "rollback failed after write error");
                lease.mark_broken();
            }
            Err(err)
        }
    }
}

/// Peel off the trailing `SELECT @rv AS return_value` result set.
fn extract_return_value(sets: &mut Vec<ResultSet>) -> Option<i32> {
    let is_return_marker = sets.last().is_some_and(|set| {
        set.row_count == 1 && set.columns.len() == 1 && set.columns[0].name == "return_value"
    });
    if !is_return_marker {
        return None;
    }
    let set = sets.pop()?;
    set.rows.first()?.first()?.as_i64().map(|v| v as i32)
}

/// Split `name` or `schema.name` into validated parts, defaulting the
/// schema to `dbo`. Brackets are tolerated; anything beyond plain
/// identifier characters is refused, which is what keeps the generated
/// `EXEC` batch injection-free.
pub(crate) fn parse_procedure_name(raw: &str) -> DbResult<(String, String)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DbError::invalid_input("procedure name is empty"));
    }
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.len() > 2 {
        return Err(DbError::invalid_input(format!(
            "procedure name has too many parts: '{trimmed}'"
        )));
    }

    let clean = |part: &str| -> DbResult<String> {
        let part = part.trim().trim_start_matches('[').trim_end_matches(']');
        if part.is_empty() || !is_valid_identifier(part) {
            return Err(DbError::invalid_input(format!(
                "invalid identifier in procedure name: '{raw}'"
            )));
        }
        Ok(part.to_string())
    };

    if parts.len() == 2 {
        Ok((clean(parts[0])?, clean(parts[1])?))
    } else {
        Ok(("dbo".to_string(), clean(parts[0])?))
    }
}

fn clean_parameter_name(raw: &str) -> DbResult<&str> {
    let name = raw.trim().trim_start_matches('@');
    if name.is_empty() || !is_valid_identifier(name) {
        return Err(DbError::invalid_input(format!(
            "invalid parameter name: '{raw}'"
        )));
    }
    Ok(name)
}

fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_bracket(name: &str) -> String {
    name.replace(']', "]]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnMetadata;
    use serde_json::json;

    #[test]
    fn test_budget_prefers_override_then_default() {
        let executor = QueryExecutor::with_default_timeout(Duration::from_secs(45));
        assert_eq!(executor.budget(None), Duration::from_secs(45));
        assert_eq!(executor.budget(Some(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_budget_clamps_overrides() {
        let executor = QueryExecutor::new();
        assert_eq!(executor.budget(Some(0)), Duration::from_secs(1));
        assert_eq!(
            executor.budget(Some(100_000)),
            Duration::from_secs(MAX_QUERY_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_parse_plain_procedure_defaults_schema() {
        let (schema, name) = parse_procedure_name("GetOrders").unwrap();
        assert_eq!(schema, "dbo");
        assert_eq!(name, "GetOrders");
    }

    #[test]
    fn test_parse_schema_qualified_procedure() {
        let (schema, name) = parse_procedure_name("sales.GetOrders").unwrap();
        assert_eq!(schema, "sales");
        assert_eq!(name, "GetOrders");
    }

    #[test]
    fn test_parse_bracketed_procedure() {
        let (schema, name) = parse_procedure_name("[sales].[Get_Orders]").unwrap();
        assert_eq!(schema, "sales");
        assert_eq!(name, "Get_Orders");
    }

    #[test]
    fn test_parse_rejects_injection_attempts() {
        assert!(parse_procedure_name("p; DROP TABLE x").is_err());
        assert!(parse_procedure_name("sp'--").is_err());
        assert!(parse_procedure_name("a.b.c").is_err());
        assert!(parse_procedure_name("").is_err());
        assert!(parse_procedure_name("1starts_with_digit").is_err());
    }

    #[test]
    fn test_clean_parameter_name_strips_at_sign() {
        assert_eq!(clean_parameter_name("@customer_id").unwrap(), "customer_id");
        assert_eq!(clean_parameter_name("limit").unwrap(), "limit");
        assert!(clean_parameter_name("bad name").is_err());
        assert!(clean_parameter_name("@").is_err());
    }

    #[test]
    fn test_escape_bracket_doubles_closers() {
        assert_eq!(escape_bracket("plain"), "plain");
        assert_eq!(escape_bracket("odd]name"), "odd]]name");
    }

    #[test]
    fn test_extract_return_value_pops_marker_set() {
        let mut sets = vec![
            ResultSet::new(
                vec![ColumnMetadata::new("id", "int")],
                vec![vec![json!(1)]],
            ),
            ResultSet::new(
                vec![ColumnMetadata::new("return_value", "int")],
                vec![vec![json!(0)]],
            ),
        ];
        assert_eq!(extract_return_value(&mut sets), Some(0));
        assert_eq!(sets.len(), 1);
    }

    #[test]
    fn test_extract_return_value_leaves_ordinary_sets_alone() {
        let mut sets = vec![ResultSet::new(
            vec![ColumnMetadata::new("id", "int")],
            vec![vec![json!(1)]],
        )];
        assert_eq!(extract_return_value(&mut sets), None);
        assert_eq!(sets.len(), 1);
    }
}
