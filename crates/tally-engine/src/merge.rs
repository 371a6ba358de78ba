//! Carry-forward merger: folds one month of events into the previous month's
//! state rows.
//!
//! Delta reduction per column:
//! * `latest`: last non-null value ordered by (timestamp, event id)
//! * `ever`: 1 if any event was positive, 0 if only non-positive, NULL if none
//! * `span`: latest timestamp at which the tracked column had a value
//!
//! The single-node formulation uses correlated subqueries and a key union; the
//! distributed formulation uses window functions and a full outer join fanned
//! out over supervisor shards. Both insert the same rows.

use crate::sql::{column, shards, MonthBounds, Shard};
use crate::strategy::StrategyKind;
use crate::{EngineError, JobContext};
use tally_core::manifest::{CarryForwardSpec, DomainKind, MergePolicy, StateColumn};
use tally_core::naming::{quote_ident, sql_text};
use tally_core::plan::{PlanStep, Statement};

const ENTITY_KEY: &str = "_tally_entity";
const SUPERVISOR_KEY: &str = "_tally_supervisor";

pub fn plan_steps(ctx: &JobContext, kind: StrategyKind) -> Result<Vec<PlanStep>, EngineError> {
    let DomainKind::CarryForward(spec) = &ctx.manifest.kind else {
        return Err(EngineError::configuration(
            &ctx.manifest.key,
            "merge requires a carry-forward domain",
        ));
    };
    for state_column in &spec.columns {
        if state_column.merge.is_none() {
            return Err(EngineError::configuration(
                &ctx.manifest.key,
                format!("column {} has no merge policy", state_column.name),
            ));
        }
    }

    let merger = Merger::new(ctx, spec)?;
    let steps = match kind {
        StrategyKind::SingleNode => vec![PlanStep::Execute(Statement::new(
            "merge_carry_forward",
            merger.single_node_sql(),
        ))],
        StrategyKind::Distributed => shards(&ctx.shards)
            .iter()
            .map(|shard| {
                PlanStep::Execute(Statement::new(
                    format!("merge_carry_forward[supervisor={}]", shard.label()),
                    merger.distributed_sql(shard),
                ))
            })
            .collect(),
    };
    Ok(steps)
}

struct Merger<'a> {
    ctx: &'a JobContext,
    spec: &'a CarryForwardSpec,
    bounds: MonthBounds,
    prior_month: String,
}

impl<'a> Merger<'a> {
    fn new(ctx: &'a JobContext, spec: &'a CarryForwardSpec) -> Result<Self, EngineError> {
        let prior = ctx.period.month.prev()?;
        Ok(Self {
            ctx,
            spec,
            bounds: MonthBounds::new(ctx.period.month),
            prior_month: sql_text(&prior.as_ymd()),
        })
    }

    fn source_column(&self, name: &str) -> String {
        column("ev", name)
    }

    fn event_filter(&self) -> String {
        let source = &self.spec.source;
        let ts = self.source_column(&source.timestamp_column);
        let mut filter = format!(
            "{ts} >= {} AND {ts} < {} AND {} IS NOT NULL AND {} IS NOT NULL",
            self.bounds.start,
            self.bounds.next_start,
            self.source_column(&source.entity_column),
            self.source_column(&source.supervisor_column),
        );
        if let Some(state) = &self.ctx.period.state_id {
            filter.push_str(&format!(
                " AND {} = {}",
                self.source_column(&source.state_column),
                sql_text(state)
            ));
        }
        filter
    }

    fn prior_cte(&self, shard: &Shard) -> String {
        let mut select = vec![
            format!("{} AS {ENTITY_KEY}", quote_ident(&self.spec.entity_column)),
            format!("\"supervisor_id\" AS {SUPERVISOR_KEY}"),
            "\"state_id\"".to_string(),
        ];
        select.extend(self.spec.columns.iter().map(|c| quote_ident(&c.name)));
        let mut filter = format!("\"month\" = {}", self.prior_month);
        if let Some(state) = &self.ctx.period.state_id {
            filter.push_str(&format!(" AND \"state_id\" = {}", sql_text(state)));
        }
        if *shard != Shard::All {
            filter.push_str(&format!(" AND {}", shard.condition("\"supervisor_id\"")));
        }
        format!(
            "p AS (SELECT {} FROM {} WHERE {filter})",
            select.join(", "),
            quote_ident(&self.ctx.manifest.base_table)
        )
    }

    fn ever_expr(&self, state_column: &StateColumn) -> String {
        let source = self.source_column(state_column.source_column());
        format!("CASE WHEN {source} IS NULL THEN NULL WHEN {source} > 0 THEN 1 ELSE 0 END")
    }

    fn span_expr(&self, state_column: &StateColumn) -> String {
        let ts = self.source_column(&self.spec.source.timestamp_column);
        match &state_column.tracks {
            Some(tracks) => format!(
                "CASE WHEN {} IS NOT NULL THEN {ts} END",
                self.source_column(tracks)
            ),
            None => ts,
        }
    }

    fn single_node_delta(&self) -> String {
        let source = &self.spec.source;
        let entity = self.source_column(&source.entity_column);
        let supervisor = self.source_column(&source.supervisor_column);
        let state = self.source_column(&source.state_column);
        let ts = &source.timestamp_column;
        let event_id = &source.event_id_column;

        let mut select = vec![
            format!("{entity} AS {ENTITY_KEY}"),
            format!("{supervisor} AS {SUPERVISOR_KEY}"),
            format!("MAX({state}) AS \"state_id\""),
        ];
        for state_column in &self.spec.columns {
            let name = quote_ident(&state_column.name);
            let expr = match state_column.merge {
                Some(MergePolicy::Latest) => {
                    let value = column("x", state_column.source_column());
                    let mut filter = format!(
                        "{} = {entity} AND {} = {supervisor} AND {} >= {} AND {} < {} AND {value} IS NOT NULL",
                        column("x", &source.entity_column),
                        column("x", &source.supervisor_column),
                        column("x", ts),
                        self.bounds.start,
                        column("x", ts),
                        self.bounds.next_start,
                    );
                    if let Some(state_id) = &self.ctx.period.state_id {
                        filter.push_str(&format!(
                            " AND {} = {}",
                            column("x", &source.state_column),
                            sql_text(state_id)
                        ));
                    }
                    format!(
                        "(SELECT {value} FROM {} AS \"x\" WHERE {filter} ORDER BY {} DESC, {} DESC LIMIT 1)",
                        quote_ident(&source.table),
                        column("x", ts),
                        column("x", event_id),
                    )
                }
                Some(MergePolicy::Ever) => format!("MAX({})", self.ever_expr(state_column)),
                Some(MergePolicy::Span) | None => format!("MAX({})", self.span_expr(state_column)),
            };
            select.push(format!("{expr} AS {name}"));
        }

        format!(
            "d AS (SELECT {} FROM {} AS \"ev\" WHERE {} GROUP BY {entity}, {supervisor})",
            select.join(", "),
            quote_ident(&source.table),
            self.event_filter(),
        )
    }

    fn distributed_delta(&self, shard: &Shard) -> String {
        let source = &self.spec.source;
        let entity = self.source_column(&source.entity_column);
        let supervisor = self.source_column(&source.supervisor_column);
        let ts = self.source_column(&source.timestamp_column);
        let event_id = self.source_column(&source.event_id_column);

        let mut inner = vec![
            format!("{entity} AS {ENTITY_KEY}"),
            format!("{supervisor} AS {SUPERVISOR_KEY}"),
            format!("{} AS \"state_id\"", self.source_column(&source.state_column)),
        ];
        let mut outer = vec![
            ENTITY_KEY.to_string(),
            SUPERVISOR_KEY.to_string(),
            "MAX(\"state_id\") AS \"state_id\"".to_string(),
        ];
        for state_column in &self.spec.columns {
            let name = quote_ident(&state_column.name);
            let expr = match state_column.merge {
                Some(MergePolicy::Latest) => {
                    let value = self.source_column(state_column.source_column());
                    format!(
                        "LAST_VALUE({value}) OVER (PARTITION BY {supervisor}, {entity} ORDER BY {value} IS NOT NULL, {ts}, {event_id} ROWS BETWEEN UNBOUNDED PRECEDING AND UNBOUNDED FOLLOWING)"
                    )
                }
                Some(MergePolicy::Ever) => self.ever_expr(state_column),
                Some(MergePolicy::Span) | None => self.span_expr(state_column),
            };
            inner.push(format!("{expr} AS {name}"));
            outer.push(format!("MAX({name}) AS {name}"));
        }

        let mut filter = self.event_filter();
        if *shard != Shard::All {
            filter.push_str(&format!(" AND {}", shard.condition(&supervisor)));
        }
        format!(
            "d AS (SELECT {} FROM (SELECT {} FROM {} AS \"ev\" WHERE {filter}) AS \"w\" GROUP BY {ENTITY_KEY}, {SUPERVISOR_KEY})",
            outer.join(", "),
            inner.join(", "),
            quote_ident(&source.table),
        )
    }

    fn merged_columns(&self) -> Vec<String> {
        self.spec
            .columns
            .iter()
            .map(|state_column| {
                let delta = column("d", &state_column.name);
                let prior = column("p", &state_column.name);
                match state_column.merge {
                    Some(MergePolicy::Latest) => format!("COALESCE({delta}, {prior})"),
                    Some(MergePolicy::Ever) => format!(
                        "CASE WHEN COALESCE({delta}, 0) > 0 OR COALESCE({prior}, 0) > 0 THEN 1 WHEN {delta} IS NULL AND {prior} IS NULL THEN NULL ELSE 0 END"
                    ),
                    Some(MergePolicy::Span) | None => format!(
                        "CASE WHEN {delta} IS NULL THEN {prior} WHEN {prior} IS NULL THEN {delta} WHEN {delta} > {prior} THEN {delta} ELSE {prior} END"
                    ),
                }
            })
            .collect()
    }

    fn target_columns(&self) -> String {
        self.ctx.manifest.table_schema().column_list()
    }

    fn single_node_sql(&self) -> String {
        let key_join = |alias: &str| {
            format!(
                "{} = \"k\".{ENTITY_KEY} AND {} = \"k\".{SUPERVISOR_KEY}",
                column(alias, ENTITY_KEY),
                column(alias, SUPERVISOR_KEY)
            )
        };
        let mut select = vec![
            format!("\"k\".{ENTITY_KEY}"),
            format!("\"k\".{SUPERVISOR_KEY}"),
            "COALESCE(\"d\".\"state_id\", \"p\".\"state_id\")".to_string(),
            self.bounds.start.clone(),
        ];
        select.extend(self.merged_columns());

        format!(
            "WITH {}, {} INSERT INTO {} ({}) SELECT {} FROM (SELECT {ENTITY_KEY}, {SUPERVISOR_KEY} FROM \"d\" UNION SELECT {ENTITY_KEY}, {SUPERVISOR_KEY} FROM \"p\") AS \"k\" LEFT JOIN \"d\" ON {} LEFT JOIN \"p\" ON {}",
            self.single_node_delta(),
            self.prior_cte(&Shard::All),
            quote_ident(&self.ctx.staging_table),
            self.target_columns(),
            select.join(", "),
            key_join("d"),
            key_join("p"),
        )
    }

    fn distributed_sql(&self, shard: &Shard) -> String {
        let mut select = vec![
            format!("COALESCE({}, {})", column("d", ENTITY_KEY), column("p", ENTITY_KEY)),
            format!("COALESCE({}, {})", column("d", SUPERVISOR_KEY), column("p", SUPERVISOR_KEY)),
            "COALESCE(\"d\".\"state_id\", \"p\".\"state_id\")".to_string(),
            self.bounds.start.clone(),
        ];
        select.extend(self.merged_columns());

        format!(
            "WITH {}, {} INSERT INTO {} ({}) SELECT {} FROM \"d\" FULL OUTER JOIN \"p\" ON {} = {} AND {} = {}",
            self.distributed_delta(shard),
            self.prior_cte(shard),
            quote_ident(&self.ctx.staging_table),
            self.target_columns(),
            select.join(", "),
            column("d", ENTITY_KEY),
            column("p", ENTITY_KEY),
            column("d", SUPERVISOR_KEY),
            column("p", SUPERVISOR_KEY),
        )
    }
}
