//! Side-by-side run of both strategies for one job. Neither result is
//! committed; the distributed output is treated as authoritative.

use crate::pipeline::{Pipeline, PreparedJob};
use crate::strategy::StrategyKind;
use crate::{EngineError, JobSpec};
use serde::Serialize;
use tally_core::manifest::ColumnType;
use tally_core::naming::quote_ident;
use tally_core::period::PeriodKey;
use tally_storage::partition::{PartitionLayout, PartitionManager, StagingTable};
use tally_storage::Warehouse;
use tracing::{info, warn};

const SAMPLE_LIMIT: usize = 5;
/// Decimal places REAL columns are compared at; summation order differs
/// between a single statement and per-shard statements.
const REAL_PRECISION: u32 = 6;
const COPIES: &str = "\"_tally_copies\"";
const EXCESS: &str = "\"_tally_excess\"";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EquivalenceReport {
    pub domain: String,
    pub period: PeriodKey,
    pub authoritative: StrategyKind,
    /// Set when no distributed variant is registered and single-node ran twice.
    pub distributed_fell_back: bool,
    pub single_node_rows: i64,
    pub distributed_rows: i64,
    /// Row copies the distributed run produced that single-node did not.
    pub missing_from_single_node: i64,
    /// Row copies single-node produced that the distributed run did not.
    pub unexpected_in_single_node: i64,
    pub samples: Vec<String>,
}

impl EquivalenceReport {
    pub fn is_equivalent(&self) -> bool {
        self.missing_from_single_node == 0
            && self.unexpected_in_single_node == 0
            && self.single_node_rows == self.distributed_rows
    }
}

pub fn verify_equivalence(
    pipeline: &Pipeline<'_>,
    job: &JobSpec,
) -> Result<EquivalenceReport, EngineError> {
    let prepared = pipeline.prepare(job)?;
    let warehouse = pipeline.warehouse();
    let partitions = PartitionManager::new(warehouse);

    for joined in &prepared.joins {
        partitions.ensure_parent(&PartitionLayout::for_domain(&joined.manifest))?;
    }
    for period in prepared.lookback_periods()? {
        partitions.ensure(&prepared.layout, &period)?;
    }

    let single = run_scratch(pipeline, &prepared, StrategyKind::SingleNode, "verify_single")?;
    let distributed = match run_scratch(
        pipeline,
        &prepared,
        StrategyKind::Distributed,
        "verify_distributed",
    ) {
        Ok(result) => result,
        Err(err) => {
            discard_quietly(&partitions, single.0);
            return Err(err);
        }
    };

    let outcome = diff(warehouse, &prepared, single.0.name(), distributed.0.name());
    discard_quietly(&partitions, single.0);
    discard_quietly(&partitions, distributed.0);
    let outcome = outcome?;

    let report = EquivalenceReport {
        domain: prepared.manifest.key.clone(),
        period: prepared.period.clone(),
        authoritative: StrategyKind::Distributed,
        distributed_fell_back: distributed.1 != StrategyKind::Distributed,
        single_node_rows: outcome.single_rows,
        distributed_rows: outcome.distributed_rows,
        missing_from_single_node: outcome.missing,
        unexpected_in_single_node: outcome.unexpected,
        samples: outcome.samples,
    };
    if report.is_equivalent() {
        info!(
            event = "strategies_equivalent",
            domain = %report.domain,
            period = %report.period,
            rows = report.distributed_rows
        );
    } else {
        warn!(
            event = "strategy_divergence",
            domain = %report.domain,
            period = %report.period,
            missing_from_single_node = report.missing_from_single_node,
            unexpected_in_single_node = report.unexpected_in_single_node
        );
    }
    Ok(report)
}

fn run_scratch(
    pipeline: &Pipeline<'_>,
    prepared: &PreparedJob,
    kind: StrategyKind,
    suffix: &str,
) -> Result<(StagingTable, StrategyKind), EngineError> {
    let warehouse = pipeline.warehouse();
    let partitions = PartitionManager::new(warehouse);
    let strategy = pipeline.registry().resolve(&prepared.manifest.key, kind)?;
    let staging = partitions.stage_scratch(&prepared.layout, &prepared.period, suffix)?;
    let ctx = prepared.context(staging.name(), warehouse.hierarchy_table());
    match strategy.aggregate(warehouse, &ctx) {
        Ok(execution) => Ok((staging, execution.strategy)),
        Err(err) => {
            discard_quietly(&partitions, staging);
            Err(err)
        }
    }
}

fn discard_quietly(partitions: &PartitionManager<'_>, staging: StagingTable) {
    let name = staging.name().to_string();
    if let Err(err) = partitions.discard(staging) {
        warn!(event = "staging_discard_failed", staging = %name, error = %err);
    }
}

struct DiffOutcome {
    missing: i64,
    unexpected: i64,
    samples: Vec<String>,
    single_rows: i64,
    distributed_rows: i64,
}

/// Multiset difference: every distinct row is compared together with how
/// many times it occurs, so a duplicated row counts as a divergence.
fn diff(
    warehouse: &Warehouse,
    prepared: &PreparedJob,
    single: &str,
    distributed: &str,
) -> Result<DiffOutcome, EngineError> {
    let columns = &prepared.layout.schema.columns;
    let keys = columns
        .iter()
        .map(|column| match column.ty {
            ColumnType::Real => format!("ROUND({}, {REAL_PRECISION})", quote_ident(&column.name)),
            _ => quote_ident(&column.name),
        })
        .collect::<Vec<_>>();
    let projected = keys
        .iter()
        .zip(columns)
        .map(|(key, column)| format!("{key} AS {}", quote_ident(&column.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let group_by = keys.join(", ");
    let grouped = |table: &str| {
        format!(
            "SELECT {projected}, COUNT(*) AS {COPIES} FROM {} GROUP BY {group_by}",
            quote_ident(table)
        )
    };
    let matched = columns
        .iter()
        .map(|column| {
            let name = quote_ident(&column.name);
            format!("\"l\".{name} IS \"r\".{name}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    let left_columns = columns
        .iter()
        .map(|column| format!("\"l\".{}", quote_ident(&column.name)))
        .collect::<Vec<_>>()
        .join(", ");
    // Rows of `left` with their copies in excess of `right`.
    let excess = |left: &str, right: &str| {
        format!(
            "SELECT {left_columns}, \"l\".{COPIES} - COALESCE(\"r\".{COPIES}, 0) AS {EXCESS} FROM ({}) AS \"l\" LEFT JOIN ({}) AS \"r\" ON {matched} WHERE \"l\".{COPIES} > COALESCE(\"r\".{COPIES}, 0)",
            grouped(left),
            grouped(right)
        )
    };

    let missing_sql = excess(distributed, single);
    let unexpected_sql = excess(single, distributed);
    let missing = warehouse.count(&format!(
        "SELECT COALESCE(SUM({EXCESS}), 0) FROM ({missing_sql})"
    ))?;
    let unexpected = warehouse.count(&format!(
        "SELECT COALESCE(SUM({EXCESS}), 0) FROM ({unexpected_sql})"
    ))?;

    let mut samples = Vec::new();
    for (label, sql) in [("missing", &missing_sql), ("unexpected", &unexpected_sql)] {
        let rows = warehouse.fetch_rows(&format!("{sql} LIMIT {SAMPLE_LIMIT}"))?;
        for row in rows {
            let rendered = row
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" | ");
            samples.push(format!("{label}: {rendered}"));
        }
    }

    Ok(DiffOutcome {
        missing,
        unexpected,
        samples,
        single_rows: warehouse.row_count(single)?,
        distributed_rows: warehouse.row_count(distributed)?,
    })
}
