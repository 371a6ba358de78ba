//! Rollup propagation: level 5 → 4 → 3 → 2 → 1 inside staging.
//!
//! Each pass groups the rows of level L+1 by the ids still distinguished at
//! level L (finer ids become `All`), drops rows whose level-(L+1) node is a
//! test node, and combines measures by their declared rollup rule. Integrity
//! checks guard the source level of every pass and the final state level.

use crate::leaf::facility_spec;
use crate::sql::{shards, Shard};
use crate::strategy::StrategyKind;
use crate::{EngineError, JobContext};
use tally_core::hierarchy::{AggregationLevel, ALL_PLACEHOLDER};
use tally_core::manifest::{FacilitySpec, MeasureSpec, RollupRule};
use tally_core::naming::{quote_ident, sql_text};
use tally_core::plan::{IntegrityCheck, PlanStep, Statement};

pub fn plan_steps(ctx: &JobContext, kind: StrategyKind) -> Result<Vec<PlanStep>, EngineError> {
    let spec = facility_spec(ctx)?;
    let rollup = Rollup { ctx, spec };

    let mut steps = Vec::new();
    for target in AggregationLevel::rollup_targets() {
        let Some(source) = target.finer() else {
            continue;
        };
        steps.extend(rollup.checks(source).into_iter().map(PlanStep::Check));
        match kind {
            StrategyKind::SingleNode => steps.push(PlanStep::Execute(Statement::new(
                format!("rollup[level={}]", target.rank()),
                rollup.insert_sql(target, &Shard::All)?,
            ))),
            StrategyKind::Distributed => {
                for shard in shards(&ctx.shards) {
                    steps.push(PlanStep::Execute(Statement::new(
                        format!("rollup[level={},state={}]", target.rank(), shard.label()),
                        rollup.insert_sql(target, &shard)?,
                    )));
                }
            }
        }
    }
    steps.extend(
        rollup
            .checks(AggregationLevel::State)
            .into_iter()
            .map(PlanStep::Check),
    );
    Ok(steps)
}

/// SQL combining one measure of level-(L+1) rows into a level-L row.
pub fn rollup_expr(
    domain: &str,
    spec: &FacilitySpec,
    measure: &MeasureSpec,
    target: AggregationLevel,
) -> Result<String, EngineError> {
    let column = quote_ident(&measure.name);
    let sql = match &measure.rollup {
        RollupRule::Sum => format!("SUM({column})"),
        RollupRule::SumOrZero => format!("COALESCE(SUM({column}), 0)"),
        RollupRule::Max => format!("MAX({column})"),
        RollupRule::Min => format!("MIN({column})"),
        RollupRule::Null => "NULL".to_string(),
        RollupRule::Literal { value } => sql_text(value),
        RollupRule::Launched { level } if *level > target => format!("SUM({column})"),
        RollupRule::Launched { level } => {
            let companion = target
                .finer()
                .and_then(|source| spec.launched_column(source))
                .ok_or_else(|| {
                    EngineError::configuration(
                        domain,
                        format!("launched measure {} has no companion below {target}", measure.name),
                    )
                })?;
            format!(
                "CASE WHEN SUM({}) > 0 THEN 1 ELSE 0 END",
                quote_ident(companion)
            )
        }
    };
    Ok(sql)
}

struct Rollup<'a> {
    ctx: &'a JobContext,
    spec: &'a FacilitySpec,
}

impl Rollup<'_> {
    fn staging(&self) -> String {
        quote_ident(&self.ctx.staging_table)
    }

    fn retained_dimensions(&self, level: AggregationLevel) -> Vec<String> {
        self.spec
            .dimensions
            .iter()
            .filter(|dimension| level >= dimension.retained_through)
            .map(|dimension| quote_ident(&dimension.name))
            .collect()
    }

    fn insert_sql(&self, target: AggregationLevel, shard: &Shard) -> Result<String, EngineError> {
        let Some(source) = target.finer() else {
            return Err(EngineError::configuration(
                &self.ctx.manifest.key,
                "the facility level has no finer source",
            ));
        };
        let all = sql_text(ALL_PLACEHOLDER);

        let mut select: Vec<String> = AggregationLevel::ALL
            .into_iter()
            .map(|level| {
                if level <= target {
                    quote_ident(level.id_column())
                } else {
                    all.clone()
                }
            })
            .collect();
        select.push("\"month\"".to_string());
        select.push(target.rank().to_string());
        for dimension in &self.spec.dimensions {
            if target >= dimension.retained_through {
                select.push(quote_ident(&dimension.name));
            } else {
                select.push(all.clone());
            }
        }
        for level in AggregationLevel::ALL {
            if level <= target {
                select.push(format!("MAX({})", quote_ident(level.is_test_column())));
            } else {
                select.push("0".to_string());
            }
        }
        for measure in &self.spec.measures {
            select.push(rollup_expr(&self.ctx.manifest.key, self.spec, measure, target)?);
        }

        let mut group_by: Vec<String> = target
            .retained()
            .map(|level| quote_ident(level.id_column()))
            .collect();
        group_by.push("\"month\"".to_string());
        group_by.extend(self.retained_dimensions(target));

        let mut filter = format!(
            "\"aggregation_level\" = {} AND {} = 0",
            source.rank(),
            quote_ident(source.is_test_column())
        );
        if *shard != Shard::All {
            filter.push_str(&format!(" AND {}", shard.condition("\"state_id\"")));
        }

        Ok(format!(
            "INSERT INTO {staging} ({}) SELECT {} FROM {staging} WHERE {filter} GROUP BY {}",
            self.ctx.manifest.table_schema().column_list(),
            select.join(", "),
            group_by.join(", "),
            staging = self.staging(),
        ))
    }

    /// Each check counts offending rows; a non-zero count aborts the job.
    fn checks(&self, level: AggregationLevel) -> Vec<IntegrityCheck> {
        let staging = self.staging();
        let at_level = format!("\"aggregation_level\" = {}", level.rank());
        let rank = level.rank();
        let mut checks = Vec::new();

        let null_flags = AggregationLevel::ALL
            .into_iter()
            .map(|level| format!("{} IS NULL", quote_ident(level.is_test_column())))
            .collect::<Vec<_>>()
            .join(" OR ");
        checks.push(IntegrityCheck::new(
            format!("null_test_flags[level={rank}]"),
            "rows with an unset is-test flag",
            format!("SELECT COUNT(*) FROM {staging} WHERE {at_level} AND ({null_flags})"),
        ));

        let null_ids = level
            .retained()
            .map(|level| format!("{} IS NULL", quote_ident(level.id_column())))
            .collect::<Vec<_>>()
            .join(" OR ");
        checks.push(IntegrityCheck::new(
            format!("null_location[level={rank}]"),
            "rows missing a location id at a retained level",
            format!("SELECT COUNT(*) FROM {staging} WHERE {at_level} AND ({null_ids})"),
        ));

        let collapsed: Vec<String> = AggregationLevel::ALL
            .into_iter()
            .filter(|finer| *finer > level)
            .map(|finer| {
                format!(
                    "{} IS NOT {}",
                    quote_ident(finer.id_column()),
                    sql_text(ALL_PLACEHOLDER)
                )
            })
            .collect();
        if !collapsed.is_empty() {
            checks.push(IntegrityCheck::new(
                format!("collapsed_location[level={rank}]"),
                "rows with a specific id below their aggregation level",
                format!(
                    "SELECT COUNT(*) FROM {staging} WHERE {at_level} AND ({})",
                    collapsed.join(" OR ")
                ),
            ));
        }

        let mut key: Vec<String> = AggregationLevel::ALL
            .into_iter()
            .map(|level| quote_ident(level.id_column()))
            .collect();
        key.extend(
            self.spec
                .dimensions
                .iter()
                .map(|dimension| quote_ident(&dimension.name)),
        );
        checks.push(IntegrityCheck::new(
            format!("duplicate_keys[level={rank}]"),
            "location and dimension combinations appearing more than once",
            format!(
                "SELECT COUNT(*) FROM (SELECT 1 FROM {staging} WHERE {at_level} GROUP BY {} HAVING COUNT(*) > 1)",
                key.join(", ")
            ),
        ));

        checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::DomainCatalog;
    use tally_core::manifest::{ColumnType, MeasureValue};
    use tally_core::period::PeriodKey;

    fn context(key: &str) -> JobContext {
        let catalog = DomainCatalog::builtin();
        let manifest = catalog.get(key).expect("builtin domain").clone();
        let joins = catalog.joined(&manifest).expect("joins");
        JobContext {
            manifest,
            joins,
            period: PeriodKey::month("2019-01".parse().expect("month")),
            staging_table: "tmp_agg_facility_2019-01-01".to_string(),
            hierarchy_table: "hierarchy_directory".to_string(),
            shards: vec!["st1".to_string()],
        }
    }

    fn measure(rollup: RollupRule) -> MeasureSpec {
        MeasureSpec {
            name: "cases".to_string(),
            ty: ColumnType::Integer,
            value: MeasureValue::Count { when: None },
            rollup,
        }
    }

    #[test]
    fn rollup_rules_render_their_aggregates() {
        let ctx = context("facility-activity");
        let spec = facility_spec(&ctx).expect("facility");
        let block = AggregationLevel::Block;
        assert_eq!(
            rollup_expr("facility-activity", spec, &measure(RollupRule::SumOrZero), block).expect("sum"),
            "COALESCE(SUM(\"cases\"), 0)"
        );
        assert_eq!(rollup_expr("facility-activity", spec, &measure(RollupRule::Null), block).expect("null"), "NULL");
        assert_eq!(
            rollup_expr("facility-activity", spec, &measure(RollupRule::Literal { value: "n/a".to_string() }), block)
                .expect("literal"),
            "'n/a'"
        );
        assert_eq!(
            rollup_expr("facility-activity", spec, &measure(RollupRule::Min), block).expect("min"),
            "MIN(\"cases\")"
        );
    }

    #[test]
    fn launched_rule_counts_finer_nodes_and_flags_its_own_level() {
        let ctx = context("facility-activity");
        let spec = facility_spec(&ctx).expect("facility");
        let supervisors = measure(RollupRule::Launched {
            level: AggregationLevel::Supervisor,
        });
        assert_eq!(
            rollup_expr("facility-activity", spec, &supervisors, AggregationLevel::Supervisor).expect("own level"),
            "CASE WHEN SUM(\"num_launched_facilities\") > 0 THEN 1 ELSE 0 END"
        );
        assert_eq!(
            rollup_expr("facility-activity", spec, &supervisors, AggregationLevel::Block).expect("coarser"),
            "SUM(\"cases\")"
        );
    }

    #[test]
    fn every_pass_is_guarded_by_checks() {
        let ctx = context("facility-activity");
        let steps = plan_steps(&ctx, StrategyKind::SingleNode).expect("plan");
        let labels: Vec<&str> = steps.iter().map(|step| step.label()).collect();
        assert_eq!(labels[0], "null_test_flags[level=5]");
        assert!(labels.contains(&"rollup[level=4]"));
        assert!(labels.contains(&"duplicate_keys[level=1]"));
        assert!(!labels.contains(&"collapsed_location[level=5]"));

        let to_district = steps
            .iter()
            .find(|step| step.label() == "rollup[level=2]")
            .expect("district pass");
        assert!(to_district
            .sql()
            .contains("SELECT \"state_id\", \"district_id\", 'All', 'All', 'All', \"month\", 2"));
        assert!(to_district
            .sql()
            .contains("WHERE \"aggregation_level\" = 3 AND \"block_is_test\" = 0"));
    }

    #[test]
    fn distributed_rollup_shards_by_state() {
        let ctx = context("facility-activity");
        let steps = plan_steps(&ctx, StrategyKind::Distributed).expect("plan");
        assert!(steps
            .iter()
            .any(|step| step.label() == "rollup[level=4,state=remainder]"));
    }
}
