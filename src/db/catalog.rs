//! Catalog introspection over the SQL Server system views.
//!
//! SQL lives in the `queries` submodule as constants; the functions here
//! run them on a leased connection and map the JSON rows into the catalog
//! models. Every lookup is parameterized, so user-supplied names never
//! reach the server as SQL text. Lookups that take a database override
//! switch the session and put it back afterwards.

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::db::MssqlLease;
use crate::db::executor::{enter_database, restore_database};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnInfo, ConstraintInfo, DatabaseInfo, ForeignKeyInfo, IndexInfo, MAX_ROW_LIMIT,
    ReferentialAction, SqlParam, TableDetails, TableInfo, TableType,
};

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub const DATABASE_EXISTS: &str = "SELECT 1 FROM sys.databases WHERE name = @P1";

    pub const LIST_DATABASES: &str = r#"
        SELECT
            d.name,
            d.state_desc AS state,
            d.recovery_model_desc AS recovery_model,
            d.compatibility_level,
            CONVERT(BIGINT, SUM(CAST(mf.size AS BIGINT)) * 8) AS size_kb
        FROM sys.databases d
        LEFT JOIN sys.master_files mf ON mf.database_id = d.database_id
        GROUP BY d.name, d.state_desc, d.recovery_model_desc, d.compatibility_level
        ORDER BY d.name
        "#;

    pub const LIST_TABLES: &str = r#"
        SELECT
            s.name AS schema_name,
            t.name AS table_name,
            p.row_count,
            t.create_date,
            t.modify_date
        FROM sys.tables t
        JOIN sys.schemas s ON s.schema_id = t.schema_id
        LEFT JOIN (
            SELECT object_id, SUM(row_count) AS row_count
            FROM sys.dm_db_partition_stats
            WHERE index_id < 2
            GROUP BY object_id
        ) p ON p.object_id = t.object_id
        WHERE (@P1 IS NULL OR s.name = @P1)
        ORDER BY s.name, t.name
        "#;

    pub const LIST_VIEWS: &str = r#"
        SELECT
            s.name AS schema_name,
            v.name AS view_name,
            NULL AS row_count,
            v.create_date,
            v.modify_date
        FROM sys.views v
        JOIN sys.schemas s ON s.schema_id = v.schema_id
        WHERE (@P1 IS NULL OR s.name = @P1)
        ORDER BY s.name, v.name
        "#;

    pub const TABLE_OBJECT_ID: &str = "SELECT OBJECT_ID(@P1) AS object_id";

    pub const TABLE_COLUMNS: &str = r#"
        SELECT
            c.name,
            t.name AS data_type,
            CASE
                WHEN t.name IN ('nvarchar', 'nchar') AND c.max_length > 0 THEN c.max_length / 2
                ELSE c.max_length
            END AS max_length,
            c.precision,
            c.scale,
            c.is_nullable,
            c.is_identity,
            d.definition AS default_value
        FROM sys.columns c
        JOIN sys.types t ON t.user_type_id = c.user_type_id
        LEFT JOIN sys.default_constraints d ON d.object_id = c.default_object_id
        WHERE c.object_id = OBJECT_ID(@P1)
        ORDER BY c.column_id
        "#;

    pub const TABLE_PRIMARY_KEY: &str = r#"
        SELECT c.name
        FROM sys.index_columns ic
        JOIN sys.indexes i ON i.object_id = ic.object_id AND i.index_id = ic.index_id
        JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
        WHERE ic.object_id = OBJECT_ID(@P1) AND i.is_primary_key = 1
        ORDER BY ic.key_ordinal
        "#;

    pub const TABLE_FOREIGN_KEYS: &str = r#"
        SELECT
            fk.name,
            pc.name AS column_name,
            rs.name + '.' + rt.name AS referenced_table,
            rc.name AS referenced_column,
            fk.delete_referential_action_desc AS on_delete,
            fk.update_referential_action_desc AS on_update
        FROM sys.foreign_keys fk
        JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id
        JOIN sys.columns pc
            ON pc.object_id = fkc.parent_object_id AND pc.column_id = fkc.parent_column_id
        JOIN sys.columns rc
            ON rc.object_id = fkc.referenced_object_id AND rc.column_id = fkc.referenced_column_id
        JOIN sys.tables rt ON rt.object_id = fk.referenced_object_id
        JOIN sys.schemas rs ON rs.schema_id = rt.schema_id
        WHERE fk.parent_object_id = OBJECT_ID(@P1)
        ORDER BY fk.name, fkc.constraint_column_id
        "#;

    pub const TABLE_INDEXES: &str = r#"
        SELECT
            i.name,
            i.type_desc AS index_type,
            i.is_unique,
            i.is_primary_key,
            STRING_AGG(c.name, ', ') WITHIN GROUP (ORDER BY ic.key_ordinal) AS columns
        FROM sys.indexes i
        JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id
        JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id
        WHERE i.object_id = OBJECT_ID(@P1) AND i.type > 0
        GROUP BY i.name, i.type_desc, i.is_unique, i.is_primary_key
        ORDER BY i.name
        "#;

    pub const TABLE_CONSTRAINTS: &str = r#"
        SELECT cc.name, 'CHECK' AS constraint_type, cc.definition
        FROM sys.check_constraints cc
        WHERE cc.parent_object_id = OBJECT_ID(@P1)
        UNION ALL
        SELECT dc.name, 'DEFAULT', dc.definition
        FROM sys.default_constraints dc
        WHERE dc.parent_object_id = OBJECT_ID(@P1)
        ORDER BY name
        "#;

    pub const TABLE_STORAGE: &str = r#"
        SELECT
            SUM(CASE WHEN p.index_id IN (0, 1) THEN p.row_count ELSE 0 END) AS row_count,
            CONVERT(BIGINT, SUM(CAST(p.reserved_page_count AS BIGINT)) * 8) AS size_kb
        FROM sys.dm_db_partition_stats p
        WHERE p.object_id = OBJECT_ID(@P1)
        "#;
}

// =============================================================================
// Lookups
// =============================================================================

/// Whether a database of this name exists on the server.
pub async fn database_exists(lease: &mut MssqlLease, name: &str) -> DbResult<bool> {
    let params = [SqlParam::text(name)];
    let (set, _) = lease.query(queries::DATABASE_EXISTS, &params, 1).await?;
    Ok(set.row_count > 0)
}

/// Every database on the server with state and file-backed size.
pub async fn list_databases(lease: &mut MssqlLease) -> DbResult<Vec<DatabaseInfo>> {
    let (set, _) = lease
        .query(queries::LIST_DATABASES, &[], MAX_ROW_LIMIT as usize)
        .await?;
    debug!(databases = set.row_count, "listed databases");
    Ok(set.rows.iter().map(|row| map_database_row(row)).collect())
}

/// Tables (and optionally views) visible in the current database, with an
/// optional schema filter.
pub async fn list_tables(
    lease: &mut MssqlLease,
    database: Option<&str>,
    schema: Option<&str>,
    include_views: bool,
) -> DbResult<Vec<TableInfo>> {
    let switched = enter_database(lease, database).await?;
    let result = list_tables_inner(lease, schema, include_views).await;
    if switched {
        restore_database(lease).await;
    }
    result
}

async fn list_tables_inner(
    lease: &mut MssqlLease,
    schema: Option<&str>,
    include_views: bool,
) -> DbResult<Vec<TableInfo>> {
    let filter = [schema.map_or(SqlParam::Null, SqlParam::text)];

    let (tables, _) = lease
        .query(queries::LIST_TABLES, &filter, MAX_ROW_LIMIT as usize)
        .await?;
    let mut infos: Vec<TableInfo> = tables
        .rows
        .iter()
        .map(|row| map_table_row(row, TableType::Table))
        .collect();

    if include_views {
        let (views, _) = lease
            .query(queries::LIST_VIEWS, &filter, MAX_ROW_LIMIT as usize)
            .await?;
        infos.extend(
            views
                .rows
                .iter()
                .map(|row| map_table_row(row, TableType::View)),
        );
    }

    debug!(tables = infos.len(), include_views, "listed tables");
    Ok(infos)
}

/// Columns, keys, indexes, constraints, and storage for one table.
pub async fn describe_table(
    lease: &mut MssqlLease,
    database: Option<&str>,
    schema: &str,
    table: &str,
) -> DbResult<TableDetails> {
    let switched = enter_database(lease, database).await?;
    let result = describe_table_inner(lease, schema, table).await;
    if switched {
        restore_database(lease).await;
    }
    result
}

async fn describe_table_inner(
    lease: &mut MssqlLease,
    schema: &str,
    table: &str,
) -> DbResult<TableDetails> {
    let qualified = format!(
        "[{}].[{}]",
        schema.replace(']', "]]"),
        table.replace(']', "]]")
    );
    let params = [SqlParam::text(qualified.clone())];

    let (object_id, _) = lease.query(queries::TABLE_OBJECT_ID, &params, 1).await?;
    let found = object_id
        .rows
        .first()
        .and_then(|row| row.first())
        .is_some_and(|id| !id.is_null());
    if !found {
        return Err(DbError::invalid_input(format!(
            "table not found: '{schema}.{table}'; use mssql_list_tables to see what exists"
        )));
    }

    let (columns, _) = lease
        .query(queries::TABLE_COLUMNS, &params, MAX_ROW_LIMIT as usize)
        .await?;
    let (primary_key, _) = lease
        .query(queries::TABLE_PRIMARY_KEY, &params, MAX_ROW_LIMIT as usize)
        .await?;
    let (foreign_keys, _) = lease
        .query(queries::TABLE_FOREIGN_KEYS, &params, MAX_ROW_LIMIT as usize)
        .await?;
    let (indexes, _) = lease
        .query(queries::TABLE_INDEXES, &params, MAX_ROW_LIMIT as usize)
        .await?;
    let (constraints, _) = lease
        .query(queries::TABLE_CONSTRAINTS, &params, MAX_ROW_LIMIT as usize)
        .await?;
    let (storage, _) = lease.query(queries::TABLE_STORAGE, &params, 1).await?;

    let mut details = TableDetails::new(schema, table);
    details.columns = columns.rows.iter().map(|row| map_column_row(row)).collect();
    details.primary_key = primary_key
        .rows
        .iter()
        .filter_map(|row| cell_str(row, 0))
        .collect();
    details.foreign_keys = group_foreign_keys(&foreign_keys.rows);
    details.indexes = indexes.rows.iter().map(|row| map_index_row(row)).collect();
    details.constraints = constraints
        .rows
        .iter()
        .map(|row| map_constraint_row(row))
        .collect();

    if let Some(row) = storage.rows.first() {
        details.row_count = cell_u64(row, 0);
        if let Some(size_kb) = cell_u64(row, 1) {
            details = details.with_size_kb(size_kb);
        }
    }

    debug!(
        table = %qualified,
        columns = details.columns.len(),
        "described table"
    );
    Ok(details)
}

// =============================================================================
// Row Mapping
// =============================================================================

fn map_database_row(row: &[JsonValue]) -> DatabaseInfo {
    let mut info = DatabaseInfo::new(
        cell_str(row, 0).unwrap_or_default(),
        cell_str(row, 1).unwrap_or_default(),
    );
    if let Some(model) = cell_str(row, 2) {
        info = info.with_recovery_model(model);
    }
    if let Some(level) = cell_u64(row, 3) {
        info = info.with_compatibility_level(level as u8);
    }
    if let Some(size_kb) = cell_u64(row, 4) {
        info = info.with_size_kb(size_kb);
    }
    info
}

fn map_table_row(row: &[JsonValue], table_type: TableType) -> TableInfo {
    let mut info = TableInfo::new(
        cell_str(row, 1).unwrap_or_default(),
        cell_str(row, 0).unwrap_or_default(),
        table_type,
    );
    if let Some(rows) = cell_u64(row, 2) {
        info = info.with_row_count_estimate(rows);
    }
    if let Some(created) = cell_str(row, 3) {
        info = info.with_create_date(created);
    }
    if let Some(modified) = cell_str(row, 4) {
        info = info.with_modify_date(modified);
    }
    info
}

fn map_column_row(row: &[JsonValue]) -> ColumnInfo {
    let data_type = cell_str(row, 1).unwrap_or_default();
    let max_length = match data_type.as_str() {
        "char" | "varchar" | "nchar" | "nvarchar" | "binary" | "varbinary" => cell_i64(row, 2)
            .and_then(|v| if v < 0 { None } else { Some(v as i32) }),
        _ => None,
    };
    let (precision, scale) = match data_type.as_str() {
        "decimal" | "numeric" => (
            cell_u64(row, 3).map(|v| v as u8),
            cell_u64(row, 4).map(|v| v as u8),
        ),
        _ => (None, None),
    };

    ColumnInfo {
        name: cell_str(row, 0).unwrap_or_default(),
        data_type,
        max_length,
        precision,
        scale,
        nullable: cell_bool(row, 5),
        is_identity: cell_bool(row, 6),
        default_value: cell_str(row, 7),
    }
}

/// Collapse one row per column pair into one entry per constraint.
/// Rows arrive ordered by constraint name, then column position.
fn group_foreign_keys(rows: &[Vec<JsonValue>]) -> Vec<ForeignKeyInfo> {
    let mut keys: Vec<ForeignKeyInfo> = Vec::new();
    for row in rows {
        let name = cell_str(row, 0).unwrap_or_default();
        let column = cell_str(row, 1).unwrap_or_default();
        let referenced_column = cell_str(row, 3).unwrap_or_default();

        match keys.last_mut() {
            Some(last) if last.name == name => {
                last.columns.push(column);
                last.referenced_columns.push(referenced_column);
            }
            _ => keys.push(ForeignKeyInfo {
                name,
                columns: vec![column],
                referenced_table: cell_str(row, 2).unwrap_or_default(),
                referenced_columns: vec![referenced_column],
                on_delete: ReferentialAction::parse(&cell_str(row, 4).unwrap_or_default()),
                on_update: ReferentialAction::parse(&cell_str(row, 5).unwrap_or_default()),
            }),
        }
    }
    keys
}

fn map_index_row(row: &[JsonValue]) -> IndexInfo {
    IndexInfo {
        name: cell_str(row, 0).unwrap_or_default(),
        index_type: cell_str(row, 1).unwrap_or_default(),
        is_unique: cell_bool(row, 2),
        is_primary_key: cell_bool(row, 3),
        columns: cell_str(row, 4)
            .map(|joined| joined.split(", ").map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

fn map_constraint_row(row: &[JsonValue]) -> ConstraintInfo {
    ConstraintInfo {
        name: cell_str(row, 0).unwrap_or_default(),
        constraint_type: cell_str(row, 1).unwrap_or_default(),
        definition: cell_str(row, 2),
    }
}

// =============================================================================
// Cell Extraction
// =============================================================================

fn cell<'a>(row: &'a [JsonValue], idx: usize) -> &'a JsonValue {
    row.get(idx).unwrap_or(&JsonValue::Null)
}

fn cell_str(row: &[JsonValue], idx: usize) -> Option<String> {
    cell(row, idx).as_str().map(str::to_string)
}

fn cell_i64(row: &[JsonValue], idx: usize) -> Option<i64> {
    cell(row, idx).as_i64()
}

fn cell_u64(row: &[JsonValue], idx: usize) -> Option<u64> {
    cell(row, idx).as_u64()
}

fn cell_bool(row: &[JsonValue], idx: usize) -> bool {
    cell(row, idx).as_bool().unwrap_or(false)
}
