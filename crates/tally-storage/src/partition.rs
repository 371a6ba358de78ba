//! Partition lifecycle: provision → stage → commit → retire.
//!
//! A domain's parent table is a view over the partitions recorded in the
//! catalog. Partitions are only listed there once committed, so a freshly
//! created or half-populated table is never visible to readers. Replacing a
//! committed partition happens inside one `BEGIN IMMEDIATE` transaction that
//! drops, refills, re-indexes and re-attaches it.

use crate::{StorageError, Warehouse};
use chrono::Utc;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tally_core::hierarchy::AggregationLevel;
use tally_core::manifest::{DomainKind, DomainManifest, TableSchema};
use tally_core::naming::{
    partition_name, quote_ident, sql_text, staging_name, validate_identifier, CATALOG_TABLE,
};
use tally_core::period::PeriodKey;

/// One partition per month holding every level and state.
pub const LEGACY_LAYOUT_VERSION: u32 = 1;
/// Per-level partitions for facility domains, per-state for carry-forward domains.
pub const CURRENT_LAYOUT_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    Monthly,
    PerState,
    PerLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub parent: String,
    pub schema: TableSchema,
    pub scheme: PartitionScheme,
    pub version: u32,
}

impl PartitionLayout {
    pub fn for_domain(manifest: &DomainManifest) -> Self {
        let scheme = match &manifest.kind {
            DomainKind::Facility(_) => PartitionScheme::PerLevel,
            DomainKind::CarryForward(spec) if spec.partition_by_state => PartitionScheme::PerState,
            DomainKind::CarryForward(_) => PartitionScheme::Monthly,
        };
        Self {
            parent: manifest.base_table.clone(),
            schema: manifest.table_schema(),
            scheme,
            version: CURRENT_LAYOUT_VERSION,
        }
    }

    pub fn legacy(manifest: &DomainManifest) -> Self {
        Self {
            parent: manifest.base_table.clone(),
            schema: manifest.table_schema(),
            scheme: PartitionScheme::Monthly,
            version: LEGACY_LAYOUT_VERSION,
        }
    }

    /// Physical tables covering `key` under this layout.
    pub fn targets(&self, key: &PeriodKey) -> Result<Vec<PartitionTarget>, StorageError> {
        match (self.scheme, key.state_id.as_deref()) {
            (PartitionScheme::PerState, Some(state)) => Ok(vec![PartitionTarget {
                name: partition_name(&self.parent, key.month, Some(state), None),
                level: None,
            }]),
            (PartitionScheme::PerState, None) => Err(StorageError::Catalog(format!(
                "{} is partitioned by state but period {key} names none",
                self.parent
            ))),
            (_, Some(state)) => Err(StorageError::Catalog(format!(
                "{} is not partitioned by state; got state {state}",
                self.parent
            ))),
            (PartitionScheme::Monthly, None) => Ok(vec![PartitionTarget {
                name: partition_name(&self.parent, key.month, None, None),
                level: None,
            }]),
            (PartitionScheme::PerLevel, None) => Ok(AggregationLevel::ALL
                .into_iter()
                .map(|level| PartitionTarget {
                    name: partition_name(&self.parent, key.month, None, Some(level)),
                    level: Some(level),
                })
                .collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTarget {
    pub name: String,
    /// Rows with this `aggregation_level` only; `None` takes every row.
    pub level: Option<AggregationLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionMode {
    /// Newly created, not yet attached.
    Create,
    /// Existing and attached; dropped and recreated inside the commit.
    Replace,
    /// Existing and kept; cleared and refilled inside the commit.
    Reuse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedTarget {
    pub target: PartitionTarget,
    pub mode: ProvisionMode,
}

/// Handle returned by [`PartitionManager::provision`]; consumed by commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedPartition {
    layout: PartitionLayout,
    key: PeriodKey,
    targets: Vec<ProvisionedTarget>,
}

impl ProvisionedPartition {
    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    pub fn key(&self) -> &PeriodKey {
        &self.key
    }

    pub fn targets(&self) -> &[ProvisionedTarget] {
        &self.targets
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.targets
            .iter()
            .map(|target| target.target.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTable {
    name: String,
    parent: String,
    key: PeriodKey,
}

impl StagingTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn key(&self) -> &PeriodKey {
        &self.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommittedPartition {
    pub name: String,
    pub level: Option<AggregationLevel>,
    pub mode: ProvisionMode,
    pub rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub parent: String,
    pub period: PeriodKey,
    pub partitions: Vec<CommittedPartition>,
}

impl CommitReport {
    pub fn rows_committed(&self) -> i64 {
        self.partitions.iter().map(|partition| partition.rows).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub partition_name: String,
    pub parent: String,
    pub month: String,
    pub state_id: Option<String>,
    pub level: Option<i64>,
    pub layout_version: u32,
    pub row_count: i64,
    pub committed_at: String,
}

pub struct PartitionManager<'a> {
    warehouse: &'a Warehouse,
}

impl<'a> PartitionManager<'a> {
    pub fn new(warehouse: &'a Warehouse) -> Self {
        Self { warehouse }
    }

    /// Creates the (possibly empty) parent view if it does not exist yet.
    pub fn ensure_parent(&self, layout: &PartitionLayout) -> Result<(), StorageError> {
        validate_identifier(&layout.parent)?;
        if self.warehouse.table_exists(&layout.parent)? {
            return Err(StorageError::Catalog(format!(
                "{} exists as a plain table; register it as a partition first",
                layout.parent
            )));
        }
        if !self.warehouse.view_exists(&layout.parent)? {
            rebuild_parent_view(self.warehouse.connection(), layout)?;
        }
        Ok(())
    }

    /// Ensures the parent view and the physical tables for `key`. Missing
    /// tables are created unattached; existing ones are reused or marked
    /// for replacement at commit.
    pub fn provision(
        &self,
        layout: &PartitionLayout,
        key: &PeriodKey,
        reuse: bool,
    ) -> Result<ProvisionedPartition, StorageError> {
        self.ensure_parent(layout)?;

        let catalogued = self.list_partitions(None)?;
        let mut targets = Vec::new();
        for target in layout.targets(key)? {
            // Distinct ids can reduce to the same table name.
            if let Some(entry) = catalogued
                .iter()
                .find(|entry| entry.partition_name == target.name)
            {
                if entry.parent != layout.parent
                    || entry.month != key.month.as_ymd()
                    || entry.state_id != key.state_id
                {
                    return Err(StorageError::NameCollision {
                        table: target.name,
                        existing: format!(
                            "{} {} state={}",
                            entry.parent,
                            entry.month,
                            entry.state_id.as_deref().unwrap_or("-")
                        ),
                        requested: format!("{} {key}", layout.parent),
                    });
                }
            }
            let mode = if !self.warehouse.table_exists(&target.name)? {
                self.warehouse
                    .execute(&layout.schema.create_table_sql(&target.name))?;
                ProvisionMode::Create
            } else if reuse {
                ProvisionMode::Reuse
            } else {
                ProvisionMode::Replace
            };
            targets.push(ProvisionedTarget { target, mode });
        }

        Ok(ProvisionedPartition {
            layout: layout.clone(),
            key: key.clone(),
            targets,
        })
    }

    /// Provisions with reuse and attaches any table that was just created, so
    /// lookback reads always find a (possibly empty) committed partition.
    pub fn ensure(
        &self,
        layout: &PartitionLayout,
        key: &PeriodKey,
    ) -> Result<ProvisionedPartition, StorageError> {
        let provisioned = self.provision(layout, key, true)?;
        let created: Vec<&ProvisionedTarget> = provisioned
            .targets
            .iter()
            .filter(|target| target.mode == ProvisionMode::Create)
            .collect();
        if created.is_empty() {
            return Ok(provisioned);
        }

        let tx = Transaction::new_unchecked(self.warehouse.connection(), TransactionBehavior::Immediate)?;
        for target in created {
            create_indexes(&tx, &layout.schema, &target.target.name)?;
            upsert_catalog(&tx, layout, key, &target.target, 0)?;
        }
        rebuild_parent_view(&tx, layout)?;
        tx.commit()?;
        Ok(provisioned)
    }

    /// Creates an empty, unindexed staging clone of the partition schema,
    /// replacing any stale table of the same name.
    pub fn stage(&self, provisioned: &ProvisionedPartition) -> Result<StagingTable, StorageError> {
        self.stage_named(provisioned, None)
    }

    pub fn stage_with_suffix(
        &self,
        provisioned: &ProvisionedPartition,
        suffix: &str,
    ) -> Result<StagingTable, StorageError> {
        self.stage_named(provisioned, Some(suffix))
    }

    /// Staging that is never committed, used for side-by-side comparisons.
    /// Nothing is provisioned for the period.
    pub fn stage_scratch(
        &self,
        layout: &PartitionLayout,
        key: &PeriodKey,
        suffix: &str,
    ) -> Result<StagingTable, StorageError> {
        self.create_staging(layout, key, Some(suffix))
    }

    fn stage_named(
        &self,
        provisioned: &ProvisionedPartition,
        suffix: Option<&str>,
    ) -> Result<StagingTable, StorageError> {
        self.create_staging(&provisioned.layout, &provisioned.key, suffix)
    }

    fn create_staging(
        &self,
        layout: &PartitionLayout,
        key: &PeriodKey,
        suffix: Option<&str>,
    ) -> Result<StagingTable, StorageError> {
        let name = staging_name(&layout.parent, key.month, key.state_id.as_deref(), suffix);
        self.warehouse
            .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))?;
        self.warehouse.execute(&layout.schema.create_table_sql(&name))?;
        Ok(StagingTable {
            name,
            parent: layout.parent.clone(),
            key: key.clone(),
        })
    }

    /// Copies staging into the partitions and attaches them atomically, then
    /// drops the staging table.
    pub fn commit(
        &self,
        provisioned: ProvisionedPartition,
        staging: StagingTable,
    ) -> Result<CommitReport, StorageError> {
        let layout = &provisioned.layout;
        let key = &provisioned.key;
        if staging.parent != layout.parent || &staging.key != key {
            return Err(StorageError::DataIntegrity(format!(
                "staging {} ({}) does not match partition period {} of {}",
                staging.name, staging.key, key, layout.parent
            )));
        }
        self.check_staged_period(&staging)?;

        let staging_ident = quote_ident(&staging.name);
        let columns = layout.schema.column_list();
        let order_by = layout.schema.sort_list();
        let mut partitions = Vec::new();

        let tx = Transaction::new_unchecked(self.warehouse.connection(), TransactionBehavior::Immediate)?;
        for provisioned_target in &provisioned.targets {
            let target = &provisioned_target.target;
            let table = quote_ident(&target.name);
            match provisioned_target.mode {
                ProvisionMode::Replace => {
                    tx.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
                    tx.execute(&layout.schema.create_table_sql(&target.name), [])?;
                }
                ProvisionMode::Create | ProvisionMode::Reuse => {
                    tx.execute(
                        &layout
                            .schema
                            .create_table_sql(&target.name)
                            .replacen("CREATE TABLE", "CREATE TABLE IF NOT EXISTS", 1),
                        [],
                    )?;
                    tx.execute(&format!("DELETE FROM {table}"), [])?;
                }
            }

            let filter = match target.level {
                Some(level) => format!(" WHERE \"aggregation_level\" = {}", level.rank()),
                None => String::new(),
            };
            let order = if order_by.is_empty() {
                String::new()
            } else {
                format!(" ORDER BY {order_by}")
            };
            let rows = tx.execute(
                &format!(
                    "INSERT INTO {table} ({columns}) SELECT {columns} FROM {staging_ident}{filter}{order}"
                ),
                [],
            )? as i64;
            create_indexes(&tx, &layout.schema, &target.name)?;
            upsert_catalog(&tx, layout, key, target, rows)?;
            partitions.push(CommittedPartition {
                name: target.name.clone(),
                level: target.level,
                mode: provisioned_target.mode,
                rows,
            });
        }
        rebuild_parent_view(&tx, layout)?;
        tx.commit()?;

        self.discard(staging)?;

        Ok(CommitReport {
            parent: layout.parent.clone(),
            period: key.clone(),
            partitions,
        })
    }

    fn check_staged_period(&self, staging: &StagingTable) -> Result<(), StorageError> {
        let mut condition = format!("\"month\" IS NOT {}", sql_text(&staging.key.month.as_ymd()));
        if let Some(state) = &staging.key.state_id {
            condition.push_str(&format!(" OR \"state_id\" IS NOT {}", sql_text(state)));
        }
        let stray = self.warehouse.count(&format!(
            "SELECT COUNT(*) FROM {} WHERE {condition}",
            quote_ident(&staging.name)
        ))?;
        if stray > 0 {
            return Err(StorageError::DataIntegrity(format!(
                "{stray} staged rows in {} fall outside period {}",
                staging.name, staging.key
            )));
        }
        Ok(())
    }

    /// Retires partitions of the same parent and period written by an older
    /// layout. A legacy table shared by every state only loses the rows of
    /// `key`'s state and is dropped once empty. Returns the dropped table names.
    pub fn retire_legacy(
        &self,
        layout: &PartitionLayout,
        key: &PeriodKey,
    ) -> Result<Vec<String>, StorageError> {
        let legacy: Vec<CatalogEntry> = self
            .list_partitions(Some(&layout.parent))?
            .into_iter()
            .filter(|entry| {
                entry.month == key.month.as_ymd()
                    && entry.layout_version < layout.version
                    && (entry.state_id.is_none() || entry.state_id == key.state_id)
            })
            .collect();
        if legacy.is_empty() {
            return Ok(Vec::new());
        }

        let tx = Transaction::new_unchecked(self.warehouse.connection(), TransactionBehavior::Immediate)?;
        let mut dropped = Vec::new();
        for entry in legacy {
            let table = quote_ident(&entry.partition_name);
            if let (None, Some(state)) = (&entry.state_id, &key.state_id) {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE \"state_id\" = ?1"),
                    [state],
                )?;
                let remaining: i64 =
                    tx.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
                if remaining > 0 {
                    tx.execute(
                        &format!("UPDATE {CATALOG_TABLE} SET row_count = ?1 WHERE partition_name = ?2"),
                        params![remaining, entry.partition_name],
                    )?;
                    continue;
                }
            }
            tx.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
            tx.execute(
                &format!("DELETE FROM {CATALOG_TABLE} WHERE partition_name = ?1"),
                [&entry.partition_name],
            )?;
            dropped.push(entry.partition_name);
        }
        rebuild_parent_view(&tx, layout)?;
        tx.commit()?;
        Ok(dropped)
    }

    pub fn discard(&self, staging: StagingTable) -> Result<(), StorageError> {
        self.warehouse
            .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&staging.name)))?;
        Ok(())
    }

    /// Adopts an existing physical table into the catalog under `layout_version`.
    pub fn register_existing(
        &self,
        layout: &PartitionLayout,
        key: &PeriodKey,
        table: &str,
        level: Option<AggregationLevel>,
        layout_version: u32,
    ) -> Result<CatalogEntry, StorageError> {
        if !self.warehouse.table_exists(table)? {
            return Err(StorageError::Catalog(format!("table {table} does not exist")));
        }
        let missing = self
            .warehouse
            .missing_columns(table, layout.schema.column_names())?;
        if !missing.is_empty() {
            return Err(StorageError::Catalog(format!(
                "table {table} lacks columns {}",
                missing.join(", ")
            )));
        }
        if self.warehouse.table_exists(&layout.parent)? {
            return Err(StorageError::Catalog(format!(
                "{} exists as a plain table",
                layout.parent
            )));
        }

        let rows = self.warehouse.row_count(table)?;
        let target = PartitionTarget {
            name: table.to_string(),
            level,
        };
        let registered = PartitionLayout {
            version: layout_version,
            ..layout.clone()
        };
        let tx = Transaction::new_unchecked(self.warehouse.connection(), TransactionBehavior::Immediate)?;
        upsert_catalog(&tx, &registered, key, &target, rows)?;
        rebuild_parent_view(&tx, layout)?;
        tx.commit()?;

        self.list_partitions(Some(&layout.parent))?
            .into_iter()
            .find(|entry| entry.partition_name == table)
            .ok_or_else(|| StorageError::Catalog(format!("{table} missing after registration")))
    }

    pub fn list_partitions(&self, parent: Option<&str>) -> Result<Vec<CatalogEntry>, StorageError> {
        let mut statement = self.warehouse.connection().prepare(&format!(
            "
            SELECT partition_name, parent, month, state_id, level,
                   layout_version, row_count, committed_at
            FROM {CATALOG_TABLE}
            WHERE ?1 IS NULL OR parent = ?1
            ORDER BY parent, month, state_id, level, partition_name
            "
        ))?;
        let rows = statement.query_map([parent], |row| {
            Ok(CatalogEntry {
                partition_name: row.get(0)?,
                parent: row.get(1)?,
                month: row.get(2)?,
                state_id: row.get(3)?,
                level: row.get(4)?,
                layout_version: row.get(5)?,
                row_count: row.get(6)?,
                committed_at: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn create_indexes(conn: &Connection, schema: &TableSchema, table: &str) -> Result<(), StorageError> {
    for (position, columns) in schema.indexes.iter().enumerate() {
        let index_name = format!("{table}_idx_{}", position + 1);
        let column_list = columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({column_list})",
                quote_ident(&index_name),
                quote_ident(table)
            ),
            [],
        )?;
    }
    Ok(())
}

fn upsert_catalog(
    conn: &Connection,
    layout: &PartitionLayout,
    key: &PeriodKey,
    target: &PartitionTarget,
    rows: i64,
) -> Result<(), StorageError> {
    conn.execute(
        &format!(
            "
            INSERT INTO {CATALOG_TABLE} (
                partition_name, parent, month, state_id, level,
                layout_version, row_count, committed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(partition_name) DO UPDATE SET
                parent = excluded.parent,
                month = excluded.month,
                state_id = excluded.state_id,
                level = excluded.level,
                layout_version = excluded.layout_version,
                row_count = excluded.row_count,
                committed_at = excluded.committed_at
            "
        ),
        params![
            target.name,
            layout.parent,
            key.month.as_ymd(),
            key.state_id,
            target.level.map(|level| level.rank() as i64),
            layout.version,
            rows,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Recreates the parent view as the union of every catalogued partition.
fn rebuild_parent_view(conn: &Connection, layout: &PartitionLayout) -> Result<(), StorageError> {
    let names = {
        let mut statement = conn.prepare(&format!(
            "SELECT partition_name FROM {CATALOG_TABLE} WHERE parent = ?1 ORDER BY month, partition_name"
        ))?;
        let rows = statement.query_map([&layout.parent], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let columns = layout.schema.column_list();
    let body = if names.is_empty() {
        let typed_nulls = layout
            .schema
            .columns
            .iter()
            .map(|column| {
                format!(
                    "CAST(NULL AS {}) AS {}",
                    column.ty.sql_type(),
                    quote_ident(&column.name)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("SELECT {typed_nulls} WHERE 0")
    } else {
        names
            .iter()
            .map(|name| format!("SELECT {columns} FROM {}", quote_ident(name)))
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
    };

    let parent = quote_ident(&layout.parent);
    conn.execute(&format!("DROP VIEW IF EXISTS {parent}"), [])?;
    conn.execute(&format!("CREATE VIEW {parent} AS {body}"), [])?;
    Ok(())
}
