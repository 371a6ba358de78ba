//! One aggregation job end to end: validate, provision, aggregate into
//! staging, commit, retire legacy partitions.

use crate::domains::DomainCatalog;
use crate::strategy::{AggregationStrategy, DeploymentConfig, StrategyKind, StrategyRegistry};
use crate::{EngineError, JobContext, JoinedDomain};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tally_core::hierarchy::AggregationLevel;
use tally_core::manifest::{DomainKind, DomainManifest, MergePolicy};
use tally_core::naming::{quote_ident, staging_name};
use tally_core::period::PeriodKey;
use tally_core::plan::JobPlan;
use tally_storage::partition::{CommitReport, PartitionLayout, PartitionManager};
use tally_storage::Warehouse;
use tracing::{info, warn};
use uuid::Uuid;

/// Request to aggregate one domain for one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub domain: String,
    pub period: PeriodKey,
    /// Overrides the deployment's choice for this run.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
}

impl JobSpec {
    pub fn new(domain: impl Into<String>, period: PeriodKey) -> Self {
        Self {
            domain: domain.into(),
            period,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub domain: String,
    pub period: PeriodKey,
    pub requested_strategy: StrategyKind,
    pub strategy: StrategyKind,
    pub staging_table: String,
    pub statements_executed: usize,
    pub checks_passed: usize,
    pub rows_written: usize,
    pub plan_fingerprint: String,
    pub commit: CommitReport,
    pub retired: Vec<String>,
}

/// A job that passed every configuration check, ready to plan or run.
#[derive(Clone)]
pub struct PreparedJob {
    pub manifest: DomainManifest,
    pub joins: Vec<JoinedDomain>,
    pub layout: PartitionLayout,
    pub period: PeriodKey,
    pub requested: StrategyKind,
    pub strategy: Arc<dyn AggregationStrategy>,
    pub shards: Vec<String>,
}

impl PreparedJob {
    pub fn context(&self, staging_table: impl Into<String>, hierarchy_table: &str) -> JobContext {
        JobContext {
            manifest: self.manifest.clone(),
            joins: self.joins.clone(),
            period: self.period.clone(),
            staging_table: staging_table.into(),
            hierarchy_table: hierarchy_table.to_string(),
            shards: self.shards.clone(),
        }
    }

    /// Months read back from earlier partitions, most recent first.
    pub fn lookback_periods(&self) -> Result<Vec<PeriodKey>, EngineError> {
        let reads_back = match &self.manifest.kind {
            DomainKind::CarryForward(_) => true,
            DomainKind::Facility(spec) => !spec.sticky_flags.is_empty(),
        };
        if !reads_back {
            return Ok(Vec::new());
        }
        let mut periods = Vec::new();
        for months in 1..=self.manifest.lookback_months {
            periods.push(self.period.shifted_back(months)?);
        }
        Ok(periods)
    }
}

pub struct Pipeline<'a> {
    warehouse: &'a Warehouse,
    catalog: &'a DomainCatalog,
    registry: StrategyRegistry,
    deployment: DeploymentConfig,
}

impl<'a> Pipeline<'a> {
    /// Every catalog domain gets both built-in strategies and the deployment
    /// default is single-node.
    pub fn new(warehouse: &'a Warehouse, catalog: &'a DomainCatalog) -> Self {
        Self {
            warehouse,
            catalog,
            registry: StrategyRegistry::with_defaults(catalog.keys()),
            deployment: DeploymentConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_deployment(mut self, deployment: DeploymentConfig) -> Self {
        self.deployment = deployment;
        self
    }

    pub fn warehouse(&self) -> &Warehouse {
        self.warehouse
    }

    pub fn catalog(&self) -> &DomainCatalog {
        self.catalog
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Runs every check that does not write: manifest, joins, state scope,
    /// source columns and strategy resolution.
    pub fn prepare(&self, job: &JobSpec) -> Result<PreparedJob, EngineError> {
        let manifest = self.catalog.get(&job.domain)?.clone();
        manifest.validate().map_err(|err| {
            EngineError::configuration(&manifest.key, format!("invalid manifest: {err}"))
        })?;
        let joins = self.catalog.joined(&manifest)?;

        match (manifest.requires_state(), job.period.state_id.as_deref()) {
            (true, None) => {
                return Err(EngineError::configuration(
                    &manifest.key,
                    "jobs for this domain must name a state",
                ));
            }
            (false, Some(state)) => {
                return Err(EngineError::configuration(
                    &manifest.key,
                    format!("domain is not partitioned by state; got state {state}"),
                ));
            }
            _ => {}
        }

        self.check_source_columns(&manifest)?;

        let requested = job
            .strategy
            .unwrap_or_else(|| self.deployment.strategy_for(&manifest.key));
        let strategy = self.registry.resolve(&manifest.key, requested)?;

        let shards = match &manifest.kind {
            DomainKind::CarryForward(_) => self
                .warehouse
                .supervisor_ids(job.period.state_id.as_deref())?,
            DomainKind::Facility(_) => self.warehouse.state_ids()?,
        };

        Ok(PreparedJob {
            layout: PartitionLayout::for_domain(&manifest),
            manifest,
            joins,
            period: job.period.clone(),
            requested,
            strategy,
            shards,
        })
    }

    fn check_source_columns(&self, manifest: &DomainManifest) -> Result<(), EngineError> {
        let mut required: Vec<(String, BTreeSet<String>)> = Vec::new();
        match &manifest.kind {
            DomainKind::CarryForward(spec) => {
                let source = &spec.source;
                let mut columns: BTreeSet<String> = [
                    &source.entity_column,
                    &source.supervisor_column,
                    &source.state_column,
                    &source.timestamp_column,
                    &source.event_id_column,
                ]
                .into_iter()
                .cloned()
                .collect();
                for column in &spec.columns {
                    match (column.merge, &column.tracks) {
                        (Some(MergePolicy::Span), Some(tracks)) => {
                            columns.insert(tracks.clone());
                        }
                        (Some(MergePolicy::Span), None) => {}
                        _ => {
                            columns.insert(column.source_column().to_string());
                        }
                    }
                }
                required.push((source.table.clone(), columns));
            }
            DomainKind::Facility(spec) => {
                required.push((spec.registry.table.clone(), spec.registry_columns()));
                let mut hierarchy = BTreeSet::new();
                for level in AggregationLevel::ALL {
                    hierarchy.insert(level.id_column().to_string());
                    hierarchy.insert(level.is_test_column().to_string());
                }
                required.push((self.warehouse.hierarchy_table().to_string(), hierarchy));
            }
        }

        for (table, columns) in required {
            let missing = self
                .warehouse
                .missing_columns(&table, columns.iter().map(String::as_str))?;
            if !missing.is_empty() {
                return Err(EngineError::configuration(
                    &manifest.key,
                    format!("{table} is missing columns: {}", missing.join(", ")),
                ));
            }
        }
        Ok(())
    }

    /// Plans a job without touching partitions or staging.
    pub fn plan(&self, job: &JobSpec) -> Result<JobPlan, EngineError> {
        let prepared = self.prepare(job)?;
        let staging = staging_name(
            &prepared.layout.parent,
            prepared.period.month,
            prepared.period.state_id.as_deref(),
            None,
        );
        let ctx = prepared.context(staging, self.warehouse.hierarchy_table());
        prepared.strategy.plan(&ctx)
    }

    pub fn run(&self, job: &JobSpec) -> Result<JobReport, EngineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            event = "job_start",
            run_id = %run_id,
            domain = %job.domain,
            period = %job.period
        );

        let prepared = self.prepare(job)?;
        let partitions = PartitionManager::new(self.warehouse);

        for joined in &prepared.joins {
            partitions.ensure_parent(&PartitionLayout::for_domain(&joined.manifest))?;
        }
        for period in prepared.lookback_periods()? {
            partitions.ensure(&prepared.layout, &period)?;
        }

        let provisioned = partitions.provision(&prepared.layout, &prepared.period, false)?;
        let staging = partitions.stage(&provisioned)?;
        let ctx = prepared.context(staging.name(), self.warehouse.hierarchy_table());

        let execution = match prepared.strategy.aggregate(self.warehouse, &ctx) {
            Ok(execution) => execution,
            Err(err) => {
                warn!(
                    event = "job_failed",
                    run_id = %run_id,
                    domain = %prepared.manifest.key,
                    period = %prepared.period,
                    error = %err
                );
                let staging_table = staging.name().to_string();
                if let Err(discard_err) = partitions.discard(staging) {
                    warn!(
                        event = "staging_discard_failed",
                        staging = %staging_table,
                        error = %discard_err
                    );
                }
                return Err(err);
            }
        };

        let staging_table = staging.name().to_string();
        let commit = match partitions.commit(provisioned, staging) {
            Ok(commit) => commit,
            Err(err) => {
                warn!(
                    event = "commit_failed",
                    run_id = %run_id,
                    domain = %prepared.manifest.key,
                    period = %prepared.period,
                    error = %err
                );
                let drop_staging = format!("DROP TABLE IF EXISTS {}", quote_ident(&staging_table));
                if let Err(discard_err) = self.warehouse.execute(&drop_staging) {
                    warn!(
                        event = "staging_discard_failed",
                        staging = %staging_table,
                        error = %discard_err
                    );
                }
                return Err(err.into());
            }
        };
        info!(
            event = "partition_committed",
            run_id = %run_id,
            domain = %prepared.manifest.key,
            period = %prepared.period,
            partitions = commit.partitions.len(),
            rows = commit.rows_committed()
        );

        let retired = partitions.retire_legacy(&prepared.layout, &prepared.period)?;
        if !retired.is_empty() {
            info!(
                event = "legacy_retired",
                run_id = %run_id,
                domain = %prepared.manifest.key,
                period = %prepared.period,
                tables = %retired.join(",")
            );
        }

        Ok(JobReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            domain: prepared.manifest.key.clone(),
            period: prepared.period.clone(),
            requested_strategy: prepared.requested,
            strategy: execution.strategy,
            staging_table,
            statements_executed: execution.statements_executed,
            checks_passed: execution.checks_passed,
            rows_written: execution.rows_written,
            plan_fingerprint: execution.plan_fingerprint,
            commit,
            retired,
        })
    }
}
