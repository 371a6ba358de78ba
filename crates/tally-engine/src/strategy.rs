//! Strategy abstraction: the same job planned for one node or fanned out over
//! shards, selected per domain by deployment configuration.

use crate::{leaf, merge, rollup, EngineError, JobContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tally_core::manifest::DomainKind;
use tally_core::plan::{JobPlan, PlanStep};
use tally_storage::Warehouse;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[serde(alias = "single-node", alias = "single")]
    SingleNode,
    Distributed,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleNode => "single_node",
            Self::Distributed => "distributed",
        }
    }
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::SingleNode
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().replace('-', "_").as_str() {
            "single_node" | "single" => Ok(Self::SingleNode),
            "distributed" => Ok(Self::Distributed),
            other => Err(format!("unknown strategy {other:?}")),
        }
    }
}

/// What executing a plan against the warehouse did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub strategy: StrategyKind,
    pub statements_executed: usize,
    pub checks_passed: usize,
    pub rows_written: usize,
    pub plan_fingerprint: String,
}

pub trait AggregationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Builds the ordered statement list. Never touches the warehouse.
    fn plan(&self, ctx: &JobContext) -> Result<JobPlan, EngineError>;

    /// Runs the plan against staging. Nothing is committed here.
    fn aggregate(
        &self,
        warehouse: &Warehouse,
        ctx: &JobContext,
    ) -> Result<ExecutionReport, EngineError> {
        let plan = self.plan(ctx)?;
        execute_plan(warehouse, &plan, self.kind())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleNodeStrategy;

impl AggregationStrategy for SingleNodeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SingleNode
    }

    fn plan(&self, ctx: &JobContext) -> Result<JobPlan, EngineError> {
        build_plan(ctx, StrategyKind::SingleNode)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DistributedStrategy;

impl AggregationStrategy for DistributedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Distributed
    }

    fn plan(&self, ctx: &JobContext) -> Result<JobPlan, EngineError> {
        build_plan(ctx, StrategyKind::Distributed)
    }
}

pub fn build_plan(ctx: &JobContext, kind: StrategyKind) -> Result<JobPlan, EngineError> {
    let mut plan = JobPlan::new(
        &ctx.manifest.key,
        ctx.period.clone(),
        kind.as_str(),
        &ctx.staging_table,
    );
    match &ctx.manifest.kind {
        DomainKind::CarryForward(_) => plan.extend(merge::plan_steps(ctx, kind)?),
        DomainKind::Facility(_) => {
            plan.extend(leaf::plan_steps(ctx, kind)?);
            plan.extend(rollup::plan_steps(ctx, kind)?);
        }
    }
    Ok(plan)
}

/// Runs every step in order. A check returning a non-zero count aborts with
/// a data integrity fault naming the check.
pub fn execute_plan(
    warehouse: &Warehouse,
    plan: &JobPlan,
    kind: StrategyKind,
) -> Result<ExecutionReport, EngineError> {
    let mut report = ExecutionReport {
        strategy: kind,
        statements_executed: 0,
        checks_passed: 0,
        rows_written: 0,
        plan_fingerprint: plan.fingerprint(),
    };
    for step in &plan.steps {
        match step {
            PlanStep::Execute(statement) => {
                let rows = warehouse.execute(&statement.sql)?;
                report.statements_executed += 1;
                report.rows_written += rows;
                info!(
                    event = "pass_executed",
                    domain = %plan.domain,
                    period = %plan.period,
                    label = %statement.label,
                    rows = rows
                );
            }
            PlanStep::Check(check) => {
                let offending = warehouse.count(&check.sql)?;
                if offending > 0 {
                    warn!(
                        event = "integrity_check_failed",
                        domain = %plan.domain,
                        label = %check.label,
                        offending = offending
                    );
                    return Err(EngineError::data_integrity(
                        &plan.domain,
                        format!("{}: {} ({offending} rows)", check.label, check.description),
                    ));
                }
                report.checks_passed += 1;
                debug!(event = "check_passed", domain = %plan.domain, label = %check.label);
            }
        }
    }
    Ok(report)
}

#[derive(Clone)]
struct Registered {
    single_node: Arc<dyn AggregationStrategy>,
    distributed: Option<Arc<dyn AggregationStrategy>>,
}

/// Per-domain strategy implementations.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    entries: BTreeMap<String, Registered>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers both built-in strategies for every key.
    pub fn with_defaults<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut registry = Self::new();
        for key in keys {
            registry.register(
                key,
                Arc::new(SingleNodeStrategy),
                Some(Arc::new(DistributedStrategy)),
            );
        }
        registry
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        single_node: Arc<dyn AggregationStrategy>,
        distributed: Option<Arc<dyn AggregationStrategy>>,
    ) {
        self.entries.insert(
            key.into(),
            Registered {
                single_node,
                distributed,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Falls back to single-node when no distributed variant is registered.
    pub fn resolve(
        &self,
        key: &str,
        requested: StrategyKind,
    ) -> Result<Arc<dyn AggregationStrategy>, EngineError> {
        let Some(entry) = self.entries.get(key) else {
            return Err(EngineError::configuration(key, "no aggregation strategy registered"));
        };
        match requested {
            StrategyKind::SingleNode => Ok(Arc::clone(&entry.single_node)),
            StrategyKind::Distributed => match &entry.distributed {
                Some(strategy) => Ok(Arc::clone(strategy)),
                None => {
                    warn!(
                        event = "strategy_fallback",
                        domain = key,
                        requested = %requested,
                        using = %StrategyKind::SingleNode
                    );
                    Ok(Arc::clone(&entry.single_node))
                }
            },
        }
    }
}

/// Deployment-level strategy selection with per-domain overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub default_strategy: StrategyKind,
    #[serde(default)]
    pub overrides: BTreeMap<String, StrategyKind>,
}

impl DeploymentConfig {
    pub fn strategy_for(&self, domain: &str) -> StrategyKind {
        self.overrides
            .get(domain)
            .copied()
            .unwrap_or(self.default_strategy)
    }
}
