//! MCP service implementation using rmcp.
//!
//! This module defines the MssqlService struct with all SQL Server tools
//! exposed via the MCP protocol using the rmcp framework's macros. Tool
//! errors carry a structured payload (kind, retryable, suggestion) from
//! the `DbError` conversion instead of a bare message.

use crate::db::PoolStats;
use crate::models::{ProcedureResult, TableDetails};
use crate::tools::ToolContext;
use crate::tools::catalog::{
    CatalogToolHandler, DescribeTableInput, ListDatabasesOutput, ListTablesInput, ListTablesOutput,
};
use crate::tools::query::{QueryInput, QueryOutput, QueryToolHandler};
use crate::tools::write::{ExecuteWriteInput, ExecuteWriteOutput, ProcedureInput, WriteToolHandler};
use rmcp::Json;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct MssqlService {
    /// Shared pool, validator, executor, and write policy
    context: Arc<ToolContext>,
    /// Tool router for MCP tool dispatch (auto-generated)
    tool_router: ToolRouter<Self>,
}

impl MssqlService {
    /// Create a new MssqlService sharing the given context.
    pub fn new(context: Arc<ToolContext>) -> Self {
        Self {
            context,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl MssqlService {
    #[tool(
        description = "Execute a single SQL statement and return rows.\nSELECT only by default; with --allow-write the statement may also be INSERT/UPDATE/DELETE.\nMulti-statement batches are rejected. Results are capped at max_rows (default 1000, max 10000) and truncated:true marks a capped result."
    )]
    async fn mssql_query(
        &self,
        Parameters(input): Parameters<QueryInput>,
    ) -> Result<Json<QueryOutput>, McpError> {
        let handler = QueryToolHandler::new(self.context.clone());
        handler.query(input).await.map(Json).map_err(McpError::from)
    }

    #[tool(
        description = "List tables in a database.\nFilters by schema (default \"dbo\"); set include_views to also list views.\nReturns schema, name, type, and approximate row counts."
    )]
    async fn mssql_list_tables(
        &self,
        Parameters(input): Parameters<ListTablesInput>,
    ) -> Result<Json<ListTablesOutput>, McpError> {
        let handler = CatalogToolHandler::new(self.context.clone());
        handler.list_tables(input).await.map(Json).map_err(McpError::from)
    }

    #[tool(
        description = "Describe one table: columns with types and nullability, primary key, foreign keys, indexes, constraints, row count, and size."
    )]
    async fn mssql_describe_table(
        &self,
        Parameters(input): Parameters<DescribeTableInput>,
    ) -> Result<Json<TableDetails>, McpError> {
        let handler = CatalogToolHandler::new(self.context.clone());
        handler
            .describe_table(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "List all databases on the server with state and size.\nDatabases that are offline or restoring are included and marked by state."
    )]
    async fn mssql_list_databases(&self) -> Result<Json<ListDatabasesOutput>, McpError> {
        let handler = CatalogToolHandler::new(self.context.clone());
        handler.list_databases().await.map(Json).map_err(McpError::from)
    }

    #[tool(
        description = "Execute an allowlisted stored procedure with named parameters.\nRequires --allow-write and a matching --procedure-allowlist entry.\nReturns every result set plus the procedure's integer return value."
    )]
    async fn mssql_execute_procedure(
        &self,
        Parameters(input): Parameters<ProcedureInput>,
    ) -> Result<Json<ProcedureResult>, McpError> {
        let handler = WriteToolHandler::new(self.context.clone());
        handler
            .execute_procedure(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Execute a single INSERT, UPDATE, or DELETE inside a transaction.\nRequires --allow-write. The statement commits only on success and rolls back on any failure.\nSet dry_run to validate the statement without executing it."
    )]
    async fn mssql_execute_write(
        &self,
        Parameters(input): Parameters<ExecuteWriteInput>,
    ) -> Result<Json<ExecuteWriteOutput>, McpError> {
        let handler = WriteToolHandler::new(self.context.clone());
        handler
            .execute_write(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Snapshot of connection pool occupancy: total and idle connections plus the configured bounds."
    )]
    async fn mssql_pool_stats(&self) -> Json<PoolStats> {
        Json(self.context.pool.stats().await)
    }
}

#[tool_handler]
impl ServerHandler for MssqlService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "mssql-mcp-server".to_owned(),
                title: Some("MSSQL MCP Server".to_owned()),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "SQL access to one Microsoft SQL Server instance, read-only by default.\n\
                \n\
                ## Workflow\n\
                1. Call `mssql_list_databases` and `mssql_list_tables` to discover what exists\n\
                2. Call `mssql_describe_table` for columns, keys, and indexes\n\
                3. Call `mssql_query` with a single SELECT statement\n\
                \n\
                ## Rules\n\
                - One statement per call; multi-statement batches are rejected\n\
                - `mssql_query` accepts SELECT only unless the server runs with --allow-write\n\
                - Results are capped at max_rows (default 1000, max 10000);\n\
                  `truncated: true` means more rows exist, so narrow the query or raise max_rows\n\
                - Statements are cancelled after their timeout (default 30s, max 300s)\n\
                \n\
                ## Write mode (--allow-write)\n\
                - `mssql_query` also accepts single INSERT/UPDATE/DELETE statements\n\
                - `mssql_execute_write` runs one write inside a transaction;\n\
                  set `dry_run: true` to validate without executing\n\
                - `mssql_execute_procedure` calls stored procedures named in --procedure-allowlist\n\
                Without write mode these tools return a write_disabled error.\n\
                \n\
                ## Diagnostics\n\
                `mssql_pool_stats` reports connection pool occupancy. Errors carry a `kind`,\n\
                a `retryable` flag, and often a `suggestion` for the fix."
                    .to_string(),
            ),
        }
    }
}
