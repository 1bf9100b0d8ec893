//! Catalog introspection tools.
//!
//! Implements `mssql_list_databases`, `mssql_list_tables`, and
//! `mssql_describe_table`. All three read from `sys.*` views through
//! parameterized queries; user-supplied names are never interpolated
//! into SQL text.

use crate::db::catalog;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseInfo, TableDetails, TableInfo};
use crate::tools::ToolContext;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

fn default_schema() -> String {
    "dbo".to_string()
}

/// Input for the `mssql_list_tables` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListTablesInput {
    /// Database to inspect. Omit for the connection's default database.
    #[serde(default)]
    pub database: Option<String>,
    /// Schema to filter by. Default: "dbo"
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Also list views. Default: false
    #[serde(default)]
    pub include_views: bool,
}

/// Output from the `mssql_list_tables` tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ListTablesOutput {
    pub tables: Vec<TableInfo>,
    pub count: usize,
}

/// Output from the `mssql_list_databases` tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ListDatabasesOutput {
    pub databases: Vec<DatabaseInfo>,
    pub count: usize,
}

/// Input for the `mssql_describe_table` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DescribeTableInput {
    /// Table to describe, without schema qualification.
    pub table_name: String,
    /// Schema the table lives in. Default: "dbo"
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Database to inspect. Omit for the connection's default database.
    #[serde(default)]
    pub database: Option<String>,
}

/// Handler for the catalog tools.
pub struct CatalogToolHandler {
    context: Arc<ToolContext>,
}

impl CatalogToolHandler {
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self { context }
    }

    /// Every database on the instance, with state and size.
    pub async fn list_databases(&self) -> DbResult<ListDatabasesOutput> {
        let mut lease = self.context.pool.acquire().await?;
        let outcome = catalog::list_databases(&mut lease).await;
        lease.release().await;
        let databases = outcome?;

        info!(count = databases.len(), "Listed databases");

        Ok(ListDatabasesOutput {
            count: databases.len(),
            databases,
        })
    }

    /// Tables (and optionally views) in one schema of one database.
    pub async fn list_tables(&self, input: ListTablesInput) -> DbResult<ListTablesOutput> {
        let schema = normalize_identifier(&input.schema, "schema")?;

        let mut lease = self.context.pool.acquire().await?;
        let outcome = catalog::list_tables(
            &mut lease,
            input.database.as_deref(),
            Some(&schema),
            input.include_views,
        )
        .await;
        lease.release().await;
        let tables = outcome?;

        info!(
            schema = %schema,
            include_views = input.include_views,
            count = tables.len(),
            "Listed tables"
        );

        Ok(ListTablesOutput {
            count: tables.len(),
            tables,
        })
    }

    /// Full structural description of one table.
    pub async fn describe_table(&self, input: DescribeTableInput) -> DbResult<TableDetails> {
        let table = normalize_identifier(&input.table_name, "table_name")?;
        let schema = normalize_identifier(&input.schema, "schema")?;

        let mut lease = self.context.pool.acquire().await?;
        let outcome =
            catalog::describe_table(&mut lease, input.database.as_deref(), &schema, &table).await;
        lease.release().await;
        let details = outcome?;

        info!(
            schema = %schema,
            table = %table,
            columns = details.columns.len(),
            "Described table"
        );

        Ok(details)
    }
}

/// Trim an identifier and reject empty or dotted input. Callers pass schema
/// and table separately; a dotted name here is almost always a mistake that
/// would otherwise surface as a confusing not-found error.
fn normalize_identifier(raw: &str, field: &str) -> DbResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DbError::invalid_input(format!("{field} must not be empty")));
    }
    if trimmed.contains('.') {
        return Err(DbError::invalid_input(format!(
            "{field} must be a bare identifier; pass schema and table separately"
        )));
    }
    Ok(trimmed.to_string())
}
