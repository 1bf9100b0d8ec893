//! Catalog introspection data models.
//!
//! Shapes returned by the `sys.*` catalog queries: databases, tables, and
//! per-table detail (columns, keys, indexes, constraints, size).

use humansize::{DECIMAL, format_size};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One database visible on the server.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DatabaseInfo {
    pub name: String,
    /// Catalog state, e.g. "ONLINE", "RESTORING".
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatibility_level: Option<u8>,
    /// Allocated size in kilobytes across all database files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_kb: Option<u64>,
    /// Human-readable rendering of `size_kb`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl DatabaseInfo {
    /// Create a new database info.
    pub fn new(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: state.into(),
            recovery_model: None,
            compatibility_level: None,
            size_kb: None,
            size: None,
        }
    }

    /// Set the recovery model, e.g. "SIMPLE" or "FULL".
    pub fn with_recovery_model(mut self, recovery_model: impl Into<String>) -> Self {
        self.recovery_model = Some(recovery_model.into());
        self
    }

    /// Set the compatibility level, e.g. 160 for SQL Server 2022.
    pub fn with_compatibility_level(mut self, level: u8) -> Self {
        self.compatibility_level = Some(level);
        self
    }

    /// Set the allocated size; also fills the human-readable form.
    pub fn with_size_kb(mut self, size_kb: u64) -> Self {
        self.size_kb = Some(size_kb);
        self.size = Some(format_size(size_kb * 1024, DECIMAL));
        self
    }
}

/// Type of catalog object listed by the table tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Table,
    View,
}

impl TableType {
    /// Parse from the marker column emitted by the listing query.
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "view" => Self::View,
            _ => Self::Table,
        }
    }
}

/// One table or view in a schema listing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TableInfo {
    pub name: String,
    pub schema: String,
    pub table_type: TableType,
    /// Partition-stats estimate; absent for views.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count_estimate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modify_date: Option<String>,
}

impl TableInfo {
    /// Create a new table info.
    pub fn new(name: impl Into<String>, schema: impl Into<String>, table_type: TableType) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            table_type,
            row_count_estimate: None,
            create_date: None,
            modify_date: None,
        }
    }

    /// Set the estimated row count.
    pub fn with_row_count_estimate(mut self, row_count_estimate: u64) -> Self {
        self.row_count_estimate = Some(row_count_estimate);
        self
    }

    /// Set the creation timestamp.
    pub fn with_create_date(mut self, create_date: impl Into<String>) -> Self {
        self.create_date = Some(create_date.into());
        self
    }

    /// Set the last DDL modification timestamp.
    pub fn with_modify_date(mut self, modify_date: impl Into<String>) -> Self {
        self.modify_date = Some(modify_date.into());
        self
    }
}

/// One column of a described table.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ColumnInfo {
    pub name: String,
    /// SQL Server type name, e.g. "nvarchar", "decimal".
    pub data_type: String,
    /// Declared length for character/binary types; `None` means MAX.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
    pub nullable: bool,
    pub is_identity: bool,
    /// Default constraint definition as stored, e.g. "((0))".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// Referential action on a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    NoAction,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Parse from the `*_referential_action_desc` catalog columns.
    pub fn parse(value: &str) -> Self {
        match value.to_uppercase().as_str() {
            "CASCADE" => Self::Cascade,
            "SET_NULL" => Self::SetNull,
            "SET_DEFAULT" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }
}

/// A foreign key with its column pairs grouped under one constraint name.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub columns: Vec<String>,
    /// Schema-qualified target, e.g. "dbo.Customers".
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

/// One index on a described table.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IndexInfo {
    pub name: String,
    /// e.g. "CLUSTERED", "NONCLUSTERED".
    pub index_type: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary_key: bool,
}

/// A check or default constraint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConstraintInfo {
    pub name: String,
    /// "CHECK" or "DEFAULT".
    pub constraint_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

/// Full description of one table.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TableDetails {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    /// Primary key columns in key order; empty when the table has none.
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub indexes: Vec<IndexInfo>,
    pub constraints: Vec<ConstraintInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    /// Reserved size in kilobytes (data + indexes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_kb: Option<u64>,
    /// Human-readable rendering of `size_kb`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

impl TableDetails {
    /// Create an empty description for a table.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            row_count: None,
            size_kb: None,
            size: None,
        }
    }

    /// Set the reserved size; also fills the human-readable form.
    pub fn with_size_kb(mut self, size_kb: u64) -> Self {
        self.size_kb = Some(size_kb);
        self.size = Some(format_size(size_kb * 1024, DECIMAL));
        self
    }
}
