pub mod partition;

use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tally_core::hierarchy::{validate_directory, FacilityAncestry, HierarchyError};
use tally_core::naming::{quote_ident, NamingError};
use thiserror::Error;

pub use partition::{
    CatalogEntry, CommitReport, PartitionLayout, PartitionManager, PartitionScheme,
    PartitionTarget, ProvisionMode, ProvisionedPartition, StagingTable, CURRENT_LAYOUT_VERSION,
    LEGACY_LAYOUT_VERSION,
};

pub const WAREHOUSE_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_HIERARCHY_TABLE: &str = "hierarchy_directory";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("data integrity fault: {0}")]
    DataIntegrity(String),
    #[error("partition catalog error: {0}")]
    Catalog(String),
    #[error("partition {table} already holds {existing}, refusing to reuse it for {requested}")]
    NameCollision {
        table: String,
        existing: String,
        requested: String,
    },
    #[error("naming error: {0}")]
    Naming(#[from] NamingError),
    #[error("hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),
}

/// One value of a fetched row, independent of the connection lifetime.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Cell {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Real(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<ValueRef<'_>> for Cell {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(value) => Self::Integer(value),
            ValueRef::Real(value) => Self::Real(value),
            ValueRef::Text(bytes) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Blob(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// SQLite warehouse holding event sources, registries, the hierarchy
/// directory, the partition catalog and every domain's partitions.
pub struct Warehouse {
    conn: Connection,
    hierarchy_table: String,
}

impl Warehouse {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let warehouse = Self::from_connection(conn);
        warehouse.migrate()?;
        Ok(warehouse)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let warehouse = Self::from_connection(conn);
        warehouse.migrate()?;
        Ok(warehouse)
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            hierarchy_table: DEFAULT_HIERARCHY_TABLE.to_string(),
        }
    }

    /// Reads the hierarchy from another table with the same column layout.
    pub fn with_hierarchy_table(mut self, table: impl Into<String>) -> Result<Self, StorageError> {
        let table = table.into();
        tally_core::naming::validate_identifier(&table)?;
        self.hierarchy_table = table;
        Ok(self)
    }

    pub fn hierarchy_table(&self) -> &str {
        &self.hierarchy_table
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StorageError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > WAREHOUSE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: WAREHOUSE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_catalog.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Runs one statement that returns no rows; yields the affected row count.
    pub fn execute(&self, sql: &str) -> Result<usize, StorageError> {
        Ok(self.conn.execute(sql, [])?)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Runs a query whose first column of the first row is a count.
    pub fn count(&self, sql: &str) -> Result<i64, StorageError> {
        let value: Option<i64> = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(value.unwrap_or(0))
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        self.object_exists("table", table_name)
    }

    pub fn view_exists(&self, view_name: &str) -> Result<bool, StorageError> {
        self.object_exists("view", view_name)
    }

    fn object_exists(&self, kind: &str, name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type = ?1 AND name = ?2
                LIMIT 1
                ",
                params![kind, name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Column names of a table or view in declaration order.
    pub fn columns_of(&self, table_name: &str) -> Result<Vec<String>, StorageError> {
        let mut statement = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table_name)))?;
        let rows = statement.query_map([], |row| row.get::<_, String>(1))?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row?);
        }
        Ok(columns)
    }

    /// Names from `required` that `table_name` lacks; every name when the table is absent.
    pub fn missing_columns<'a>(
        &self,
        table_name: &str,
        required: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>, StorageError> {
        let present = self.columns_of(table_name)?;
        Ok(required
            .into_iter()
            .filter(|column| !present.iter().any(|name| name == column))
            .map(str::to_string)
            .collect())
    }

    pub fn row_count(&self, table_name: &str) -> Result<i64, StorageError> {
        self.count(&format!("SELECT COUNT(*) FROM {}", quote_ident(table_name)))
    }

    pub fn fetch_rows(&self, sql: &str) -> Result<Vec<Vec<Cell>>, StorageError> {
        let mut statement = self.conn.prepare(sql)?;
        let width = statement.column_count();
        let rows = statement.query_map([], |row| {
            (0..width)
                .map(|index| row.get_ref(index).map(Cell::from))
                .collect::<Result<Vec<_>, _>>()
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn replace_hierarchy(&self, rows: &[FacilityAncestry]) -> Result<(), StorageError> {
        validate_directory(rows)?;
        let table = quote_ident(&self.hierarchy_table);
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(&format!("DELETE FROM {table}"), [])?;
        {
            let mut statement = tx.prepare(&format!(
                "
                INSERT INTO {table} (
                    facility_id, supervisor_id, block_id, district_id, state_id,
                    facility_is_test, supervisor_is_test, block_is_test,
                    district_is_test, state_is_test
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "
            ))?;
            for row in rows {
                statement.execute(params![
                    row.facility_id,
                    row.supervisor_id,
                    row.block_id,
                    row.district_id,
                    row.state_id,
                    row.facility_is_test as i64,
                    row.supervisor_is_test as i64,
                    row.block_is_test as i64,
                    row.district_is_test as i64,
                    row.state_is_test as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_hierarchy(&self) -> Result<Vec<FacilityAncestry>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT facility_id, supervisor_id, block_id, district_id, state_id,
                   facility_is_test, supervisor_is_test, block_is_test,
                   district_is_test, state_is_test
            FROM {}
            ORDER BY facility_id
            ",
            quote_ident(&self.hierarchy_table)
        ))?;
        let rows = statement.query_map([], |row| {
            Ok(FacilityAncestry {
                facility_id: row.get(0)?,
                supervisor_id: row.get(1)?,
                block_id: row.get(2)?,
                district_id: row.get(3)?,
                state_id: row.get(4)?,
                facility_is_test: row.get::<_, Option<i64>>(5)?.unwrap_or(0) != 0,
                supervisor_is_test: row.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
                block_is_test: row.get::<_, Option<i64>>(7)?.unwrap_or(0) != 0,
                district_is_test: row.get::<_, Option<i64>>(8)?.unwrap_or(0) != 0,
                state_is_test: row.get::<_, Option<i64>>(9)?.unwrap_or(0) != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Loads the directory and checks it describes a tree.
    pub fn validate_hierarchy(&self) -> Result<usize, StorageError> {
        let rows = self.load_hierarchy()?;
        validate_directory(&rows)?;
        Ok(rows.len())
    }

    pub fn state_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "SELECT DISTINCT state_id FROM {} WHERE state_id IS NOT NULL ORDER BY state_id",
            quote_ident(&self.hierarchy_table)
        ))?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Supervisors in the directory, optionally restricted to one state.
    pub fn supervisor_ids(&self, state_id: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut sql = format!(
            "SELECT DISTINCT supervisor_id FROM {} WHERE supervisor_id IS NOT NULL",
            quote_ident(&self.hierarchy_table)
        );
        if state_id.is_some() {
            sql.push_str(" AND state_id = ?1");
        }
        sql.push_str(" ORDER BY supervisor_id");
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(state_id), |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
