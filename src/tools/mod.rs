//! MCP tool implementations.
//!
//! This module contains the database tool handlers:
//! - `query`: Execute single SQL statements with row caps and timeouts
//! - `catalog`: List databases/tables and describe table structure
//! - `write`: Transactional writes and stored procedure execution
//! - `validator`: Lexical statement gate enforcing the read-only policy

pub mod catalog;
pub mod query;
pub mod validator;
pub mod write;

pub use catalog::{
    CatalogToolHandler, DescribeTableInput, ListDatabasesOutput, ListTablesInput, ListTablesOutput,
};
pub use query::{QueryInput, QueryOutput, QueryToolHandler};
pub use validator::{StatementValidator, ValidationVerdict};
pub use write::{ExecuteWriteInput, ExecuteWriteOutput, ProcedureInput, WriteToolHandler};

use std::sync::Arc;

use crate::config::Config;
use crate::db::executor::parse_procedure_name;
use crate::db::{MssqlPool, QueryExecutor};

/// Shared dependencies for every tool handler: the pool, the statement
/// gate, the executor, and the write policy resolved from configuration.
pub struct ToolContext {
    pub pool: Arc<MssqlPool>,
    pub validator: StatementValidator,
    pub executor: QueryExecutor,
    pub allow_write: bool,
    procedure_allowlist: Vec<String>,
}

impl ToolContext {
    pub fn new(config: &Config, pool: Arc<MssqlPool>) -> Self {
        Self {
            pool,
            validator: StatementValidator::new(),
            executor: QueryExecutor::with_default_timeout(config.query_timeout_duration()),
            allow_write: config.allow_write,
            procedure_allowlist: config.procedure_allowlist(),
        }
    }

    /// Whether a procedure reference matches an allowlist entry.
    ///
    /// Both sides are parsed into `(schema, name)` so that `usp_report`,
    /// `dbo.usp_report` and `[dbo].[usp_report]` all refer to the same
    /// procedure. Comparison is case-insensitive; entries that fail to
    /// parse never match anything.
    pub fn procedure_allowed(&self, schema: &str, name: &str) -> bool {
        self.procedure_allowlist.iter().any(|entry| {
            parse_procedure_name(entry).is_ok_and(|(allowed_schema, allowed_name)| {
                allowed_schema.eq_ignore_ascii_case(schema)
                    && allowed_name.eq_ignore_ascii_case(name)
            })
        })
    }

    /// Number of allowlist entries, for startup logging.
    pub fn allowlist_len(&self) -> usize {
        self.procedure_allowlist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MssqlFactory, SqlPool};

    fn context_with_allowlist(entries: &[&str]) -> ToolContext {
        let config = Config {
            procedure_allowlist: entries.iter().map(|s| s.to_string()).collect(),
            ..Config::default_config()
        };
        let pool = SqlPool::new(config.pool_settings(), MssqlFactory::new(config.connect_options()));
        ToolContext::new(&config, pool)
    }

    #[test]
    fn test_allowlist_matches_bare_and_qualified_names() {
        let context = context_with_allowlist(&["usp_sales_report", "dbo.usp_cleanup"]);
        assert!(context.procedure_allowed("dbo", "usp_sales_report"));
        assert!(context.procedure_allowed("dbo", "usp_cleanup"));
        assert!(!context.procedure_allowed("dbo", "usp_other"));
    }

    #[test]
    fn test_allowlist_is_case_insensitive() {
        let context = context_with_allowlist(&["dbo.USP_Report"]);
        assert!(context.procedure_allowed("DBO", "usp_report"));
    }

    #[test]
    fn test_allowlist_respects_schema_qualification() {
        let context = context_with_allowlist(&["reporting.usp_totals"]);
        assert!(context.procedure_allowed("reporting", "usp_totals"));
        assert!(!context.procedure_allowed("dbo", "usp_totals"));
    }

    #[test]
    fn test_bracketed_allowlist_entries_match() {
        let context = context_with_allowlist(&["[dbo].[usp_report]"]);
        assert!(context.procedure_allowed("dbo", "usp_report"));
    }

    #[test]
    fn test_malformed_allowlist_entry_matches_nothing() {
        let context = context_with_allowlist(&["a.b.c.d", "usp_good"]);
        assert!(context.procedure_allowed("dbo", "usp_good"));
        assert!(!context.procedure_allowed("a", "b"));
    }

    #[test]
    fn test_empty_allowlist_matches_nothing() {
        let context = context_with_allowlist(&[]);
        assert_eq!(context.allowlist_len(), 0);
        assert!(!context.procedure_allowed("dbo", "anything"));
    }
}
