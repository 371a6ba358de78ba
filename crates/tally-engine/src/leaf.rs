//! Facility-level (leaf) aggregation.
//!
//! Three passes fill staging with level-5 rows:
//! 1. group registry rows per facility and dimension values, joined to the
//!    hierarchy directory and any carry-forward domains for the same month
//! 2. stamp the five is-test flags from the hierarchy directory
//! 3. re-assert sticky flags that were set for the facility last month

use crate::sql::{column, column_ref, number, shards, MonthBounds, PredicateCompiler};
use crate::strategy::StrategyKind;
use crate::{EngineError, JobContext};
use tally_core::hierarchy::AggregationLevel;
use tally_core::manifest::{
    DimensionSource, DimensionSpec, DomainKind, FacilitySpec, MeasureSpec, MeasureValue,
};
use tally_core::naming::{quote_ident, sql_text};
use tally_core::plan::{PlanStep, Statement};
use tally_core::predicate::REGISTRY_ALIAS;

const HIERARCHY_ALIAS: &str = "h";

pub fn plan_steps(ctx: &JobContext, kind: StrategyKind) -> Result<Vec<PlanStep>, EngineError> {
    let spec = facility_spec(ctx)?;
    let leaf = LeafAggregator::new(ctx, spec);

    let mut steps = Vec::new();
    match kind {
        StrategyKind::SingleNode => steps.push(PlanStep::Execute(Statement::new(
            "leaf_aggregate",
            leaf.insert_sql(None)?,
        ))),
        StrategyKind::Distributed => {
            for shard in shards(&ctx.shards) {
                let condition = shard.condition(&column(HIERARCHY_ALIAS, "state_id"));
                steps.push(PlanStep::Execute(Statement::new(
                    format!("leaf_aggregate[state={}]", shard.label()),
                    leaf.insert_sql(Some(&condition))?,
                )));
            }
        }
    }
    steps.push(PlanStep::Execute(Statement::new(
        "leaf_test_flags",
        leaf.test_flags_sql(),
    )));
    for flag in &spec.sticky_flags {
        steps.push(PlanStep::Execute(Statement::new(
            format!("sticky_flag[{flag}]"),
            leaf.sticky_flag_sql(flag)?,
        )));
    }
    Ok(steps)
}

pub(crate) fn facility_spec(ctx: &JobContext) -> Result<&FacilitySpec, EngineError> {
    match &ctx.manifest.kind {
        DomainKind::Facility(spec) => Ok(spec),
        DomainKind::CarryForward(_) => Err(EngineError::configuration(
            &ctx.manifest.key,
            "leaf aggregation requires a facility domain",
        )),
    }
}

struct LeafAggregator<'a> {
    ctx: &'a JobContext,
    spec: &'a FacilitySpec,
    bounds: MonthBounds,
}

impl<'a> LeafAggregator<'a> {
    fn new(ctx: &'a JobContext, spec: &'a FacilitySpec) -> Self {
        Self {
            ctx,
            spec,
            bounds: MonthBounds::new(ctx.period.month),
        }
    }

    fn compiler(&self) -> PredicateCompiler<'_> {
        PredicateCompiler::new(
            &self.ctx.manifest.key,
            &self.spec.registry,
            &self.spec.predicates,
            &self.bounds,
        )
    }

    fn registry_column(&self, name: &str) -> String {
        column(REGISTRY_ALIAS, name)
    }

    fn dimension_expr(&self, dimension: &DimensionSpec) -> String {
        match &dimension.source {
            DimensionSource::Column { column } => {
                format!("CAST({} AS TEXT)", column_ref(column))
            }
            DimensionSource::AgeTranche {
                thresholds,
                newborn_days,
            } => {
                let compiler = self.compiler();
                let mut arms = Vec::new();
                for threshold in thresholds {
                    if *threshold == 0 {
                        arms.push(format!(
                            "WHEN {} <= {newborn_days} THEN '0'",
                            compiler.age_days_at_end()
                        ));
                    } else {
                        arms.push(format!(
                            "WHEN {} <= {threshold} THEN '{threshold}'",
                            compiler.age_months_at_start()
                        ));
                    }
                }
                format!("CASE {} ELSE NULL END", arms.join(" "))
            }
        }
    }

    fn measure_expr(&self, measure: &MeasureSpec) -> Result<String, EngineError> {
        let compiler = self.compiler();
        let sql = match &measure.value {
            MeasureValue::Count { when } => format!(
                "SUM(CASE WHEN {} THEN 1 ELSE 0 END)",
                compiler.compile_optional(when.as_ref())?
            ),
            MeasureValue::Value {
                column,
                when,
                default,
            } => {
                let value = column_ref(column);
                let value = match default {
                    Some(default) => format!("COALESCE({value}, {})", number(*default)),
                    None => value,
                };
                format!(
                    "SUM(CASE WHEN {} THEN {value} ELSE NULL END)",
                    compiler.compile_optional(when.as_ref())?
                )
            }
            MeasureValue::Flag { when } => format!(
                "CASE WHEN SUM(CASE WHEN {} THEN 1 ELSE 0 END) > 0 THEN 1 ELSE 0 END",
                compiler.compile_optional(when.as_ref())?
            ),
            MeasureValue::Constant { value } => number(*value),
        };
        Ok(sql)
    }

    fn joins_sql(&self) -> Result<String, EngineError> {
        let mut joins = vec![format!(
            "JOIN {} AS {} ON {} = {}",
            quote_ident(&self.ctx.hierarchy_table),
            quote_ident(HIERARCHY_ALIAS),
            column(HIERARCHY_ALIAS, "facility_id"),
            self.registry_column(&self.spec.registry.facility_column),
        )];
        for joined in &self.ctx.joins {
            let Some(entity) = joined.entity_column() else {
                return Err(EngineError::configuration(
                    &self.ctx.manifest.key,
                    format!("joined domain {} is not a carry-forward domain", joined.manifest.key),
                ));
            };
            joins.push(format!(
                "LEFT JOIN {} AS {} ON {} = {} AND {} = {} AND {} = {}",
                quote_ident(&joined.manifest.base_table),
                quote_ident(&joined.alias),
                column(&joined.alias, entity),
                self.registry_column(&self.spec.registry.entity_column),
                column(&joined.alias, "supervisor_id"),
                self.registry_column(&self.spec.registry.supervisor_column),
                column(&joined.alias, "month"),
                self.bounds.start,
            ));
        }
        Ok(joins.join(" "))
    }

    /// Pass 1. `shard` restricts the insert to one slice of the states.
    fn insert_sql(&self, shard: Option<&str>) -> Result<String, EngineError> {
        let ids: Vec<String> = AggregationLevel::ALL
            .into_iter()
            .map(|level| column(HIERARCHY_ALIAS, level.id_column()))
            .collect();
        let dimensions: Vec<String> = self
            .spec
            .dimensions
            .iter()
            .map(|dimension| self.dimension_expr(dimension))
            .collect();

        let mut select = ids.clone();
        select.push(self.bounds.start.clone());
        select.push(AggregationLevel::LEAF.rank().to_string());
        select.extend(dimensions.iter().cloned());
        select.extend(AggregationLevel::ALL.into_iter().map(|_| "NULL".to_string()));
        for measure in &self.spec.measures {
            select.push(self.measure_expr(measure)?);
        }

        let mut filter = self
            .compiler()
            .compile_optional(self.spec.entity_filter.as_ref())?;
        if let Some(shard) = shard {
            filter = format!("{filter} AND {shard}");
        }

        let mut group_by = ids;
        group_by.extend(dimensions);

        Ok(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} AS {} {} WHERE {filter} GROUP BY {}",
            quote_ident(&self.ctx.staging_table),
            self.ctx.manifest.table_schema().column_list(),
            select.join(", "),
            quote_ident(&self.spec.registry.table),
            quote_ident(REGISTRY_ALIAS),
            self.joins_sql()?,
            group_by.join(", "),
        ))
    }

    /// Pass 2.
    fn test_flags_sql(&self) -> String {
        let assignments = AggregationLevel::ALL
            .into_iter()
            .map(|level| {
                format!(
                    "{} = {}",
                    quote_ident(level.is_test_column()),
                    column(HIERARCHY_ALIAS, level.is_test_column())
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {} AS \"s\" SET {assignments} FROM {} AS {} WHERE {} = \"s\".\"facility_id\" AND \"s\".\"aggregation_level\" = {}",
            quote_ident(&self.ctx.staging_table),
            quote_ident(&self.ctx.hierarchy_table),
            quote_ident(HIERARCHY_ALIAS),
            column(HIERARCHY_ALIAS, "facility_id"),
            AggregationLevel::LEAF.rank(),
        )
    }

    /// Pass 3: a flag set for a facility last month stays set.
    fn sticky_flag_sql(&self, flag: &str) -> Result<String, EngineError> {
        let prior = self.ctx.period.month.prev()?;
        let flag = quote_ident(flag);
        let leaf = AggregationLevel::LEAF.rank();
        Ok(format!(
            "UPDATE {} AS \"s\" SET {flag} = 1 FROM (SELECT DISTINCT \"facility_id\" FROM {} WHERE \"month\" = {} AND \"aggregation_level\" = {leaf} AND {flag} = 1) AS \"prior\" WHERE \"prior\".\"facility_id\" = \"s\".\"facility_id\" AND \"s\".\"aggregation_level\" = {leaf}",
            quote_ident(&self.ctx.staging_table),
            quote_ident(&self.ctx.manifest.base_table),
            sql_text(&prior.as_ymd()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::DomainCatalog;
    use tally_core::period::PeriodKey;

    fn context(key: &str, shards: Vec<String>) -> JobContext {
        let catalog = DomainCatalog::builtin();
        let manifest = catalog.get(key).expect("builtin domain").clone();
        let joins = catalog.joined(&manifest).expect("joins");
        JobContext {
            manifest,
            joins,
            period: PeriodKey::month("2019-01".parse().expect("month")),
            staging_table: "tmp_child_nutrition_2019-01-01".to_string(),
            hierarchy_table: "hierarchy_directory".to_string(),
            shards,
        }
    }

    #[test]
    fn leaf_insert_joins_hierarchy_and_carry_forward_domains() {
        let ctx = context("child-nutrition", Vec::new());
        let steps = plan_steps(&ctx, StrategyKind::SingleNode).expect("plan");
        let insert = steps[0].sql();
        assert!(insert.starts_with("INSERT INTO \"tmp_child_nutrition_2019-01-01\""));
        assert!(insert.contains("JOIN \"hierarchy_directory\" AS \"h\" ON \"h\".\"facility_id\" = \"r\".\"facility_id\""));
        assert!(insert.contains("LEFT JOIN \"agg_growth_monitoring\" AS \"gm\""));
        assert!(insert.contains("\"gm\".\"month\" = '2019-01-01'"));
        assert!(insert.contains("THEN '0'"));
        assert_eq!(steps[1].label(), "leaf_test_flags");
    }

    #[test]
    fn distributed_leaf_fans_out_per_state() {
        let ctx = context("child-nutrition", vec!["st1".to_string(), "st2".to_string()]);
        let steps = plan_steps(&ctx, StrategyKind::Distributed).expect("plan");
        let labels: Vec<&str> = steps.iter().map(|step| step.label()).collect();
        assert_eq!(
            &labels[..3],
            &[
                "leaf_aggregate[state=st1]",
                "leaf_aggregate[state=st2]",
                "leaf_aggregate[state=remainder]"
            ]
        );
        assert!(steps[0].sql().contains("\"h\".\"state_id\" = 'st1'"));
    }

    #[test]
    fn sticky_flags_read_the_previous_month() {
        let ctx = context("facility-activity", Vec::new());
        let steps = plan_steps(&ctx, StrategyKind::SingleNode).expect("plan");
        let sticky: Vec<&PlanStep> = steps
            .iter()
            .filter(|step| step.label().starts_with("sticky_flag["))
            .collect();
        assert_eq!(sticky.len(), 5);
        assert!(sticky[0].sql().contains("\"month\" = '2018-12-01'"));
    }
}
