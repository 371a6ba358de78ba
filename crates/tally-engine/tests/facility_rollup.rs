mod common;

use common::{gm_event, int, period, real, register, register_many, state_period, text, warehouse, Child};
use tally_engine::domains::{CHILD_NUTRITION, FACILITY_ACTIVITY, GROWTH_MONITORING};
use std::sync::Arc;
use tally_core::plan::JobPlan;
use tally_engine::strategy::build_plan;
use tally_engine::{
    verify_equivalence, AggregationStrategy, DomainCatalog, EngineError, JobContext, JobSpec,
    Pipeline, SingleNodeStrategy, StrategyKind, StrategyRegistry,
};
use tally_storage::Warehouse;

/// Distributed plan that writes one leaf row twice.
struct DuplicatingStrategy;

impl AggregationStrategy for DuplicatingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Distributed
    }

    fn plan(&self, ctx: &JobContext) -> Result<JobPlan, EngineError> {
        let mut plan = build_plan(ctx, StrategyKind::Distributed)?;
        plan.execute(
            "duplicate_leaf_row",
            format!(
                "INSERT INTO \"{staging}\" SELECT * FROM \"{staging}\" WHERE aggregation_level = 5 AND facility_id = 'f1'",
                staging = ctx.staging_table
            ),
        );
        Ok(plan)
    }
}

fn seed_caseload(db: &Warehouse) {
    register_many(db, "a", "f1", "sup1", 3);
    for index in 0..2 {
        register(
            db,
            Child {
                case_id: &format!("b-{index}"),
                facility: "f2",
                supervisor: "sup1",
                opened_on: "2018-03-01",
                closed_on: Some("2019-01-20"),
                dob: "2016-05-01",
                sex: "M",
            },
        );
    }
    register_many(db, "t", "f3", "sup2", 10);
    register_many(db, "d", "f4", "sup3", 1);
}

/// Registry row at f1 opened on its birth date. Flags are SQL literals so
/// NULL can be written.
fn enroll(db: &Warehouse, case_id: &str, dob: &str, sex: &str, is_availing: &str, is_migrated: &str) {
    db.execute(&format!(
        "INSERT INTO child_health_registry (case_id, facility_id, supervisor_id, opened_on, closed_on, dob, date_death, is_migrated, is_availing, sex)
         VALUES ('{case_id}', 'f1', 'sup1', '{dob}', NULL, '{dob}', NULL, {is_migrated}, {is_availing}, '{sex}')"
    ))
    .expect("insert registry row");
}

fn nutrition_leaf(db: &Warehouse, sex: &str, tranche: &str, column: &str) -> Option<i64> {
    int(
        db,
        &format!(
            "SELECT {column} FROM agg_child_nutrition WHERE aggregation_level = 5 AND facility_id = 'f1' AND sex = '{sex}' AND age_tranche = '{tranche}'"
        ),
    )
}

fn activity(db: &Warehouse, level: u8, filter: &str, column: &str) -> Option<i64> {
    int(
        db,
        &format!(
            "SELECT {column} FROM agg_facility_activity WHERE month = '2019-01-01' AND aggregation_level = {level} AND {filter}"
        ),
    )
}

#[test]
fn rollups_exclude_test_facilities_and_count_launched_nodes() {
    let db = warehouse();
    seed_caseload(&db);
    let catalog = DomainCatalog::builtin();
    let pipeline = Pipeline::new(&db, &catalog);

    let report = pipeline
        .run(&JobSpec::new(FACILITY_ACTIVITY, period("2019-01")))
        .expect("facility run");
    assert_eq!(report.commit.partitions.len(), 5);
    assert!(report.checks_passed > 0);

    assert_eq!(activity(&db, 5, "1", "COUNT(*)"), Some(4));
    assert_eq!(
        activity(&db, 5, "facility_id = 'f3'", "facility_is_test"),
        Some(1)
    );
    assert_eq!(
        activity(&db, 5, "facility_id = 'f3'", "cases_registered"),
        Some(10)
    );

    let sup1 = "supervisor_id = 'sup1'";
    assert_eq!(activity(&db, 4, sup1, "cases_registered"), Some(5));
    assert_eq!(activity(&db, 4, sup1, "largest_caseload"), Some(3));
    assert_eq!(activity(&db, 4, sup1, "contributing_facilities"), Some(2));
    assert_eq!(activity(&db, 4, sup1, "num_launched_facilities"), Some(2));
    assert_eq!(activity(&db, 4, sup1, "num_launched_supervisors"), Some(1));
    assert_eq!(activity(&db, 4, sup1, "facility_id = 'All'"), Some(1));
    assert_eq!(
        activity(&db, 4, "supervisor_id = 'sup2'", "COUNT(*)"),
        Some(0)
    );

    let st1 = "state_id = 'st1'";
    assert_eq!(activity(&db, 1, st1, "cases_registered"), Some(5));
    assert_eq!(activity(&db, 1, st1, "num_launched_supervisors"), Some(1));
    assert_eq!(activity(&db, 1, st1, "num_launched_blocks"), Some(1));
    assert_eq!(activity(&db, 1, st1, "num_launched_districts"), Some(1));
    assert_eq!(activity(&db, 1, st1, "num_launched_states"), Some(1));
    assert_eq!(
        text(
            &db,
            "SELECT district_id FROM agg_facility_activity WHERE aggregation_level = 1 AND state_id = 'st1'"
        )
        .as_deref(),
        Some("All")
    );
}

#[test]
fn rollup_conserves_non_test_totals_at_every_level() {
    let db = warehouse();
    seed_caseload(&db);
    let catalog = DomainCatalog::builtin();
    Pipeline::new(&db, &catalog)
        .run(&JobSpec::new(FACILITY_ACTIVITY, period("2019-01")))
        .expect("facility run");

    let leaf_total = activity(&db, 5, "facility_is_test = 0", "SUM(cases_registered)");
    assert_eq!(leaf_total, Some(6));
    for level in 1..=4 {
        assert_eq!(
            activity(&db, level, "1", "SUM(cases_registered)"),
            leaf_total,
            "level {level}"
        );
    }
}

#[test]
fn sticky_launched_flags_survive_an_empty_month() {
    let db = warehouse();
    seed_caseload(&db);
    let catalog = DomainCatalog::builtin();
    let pipeline = Pipeline::new(&db, &catalog);
    pipeline
        .run(&JobSpec::new(FACILITY_ACTIVITY, period("2019-01")))
        .expect("january run");
    pipeline
        .run(&JobSpec::new(FACILITY_ACTIVITY, period("2019-02")))
        .expect("february run");

    let feb = |level: u8, filter: &str, column: &str| {
        int(
            &db,
            &format!(
                "SELECT {column} FROM agg_facility_activity WHERE month = '2019-02-01' AND aggregation_level = {level} AND {filter}"
            ),
        )
    };
    assert_eq!(feb(5, "facility_id = 'f2'", "cases_registered"), Some(0));
    assert_eq!(feb(5, "facility_id = 'f2'", "num_launched_facilities"), Some(1));
    assert_eq!(feb(1, "state_id = 'st1'", "cases_registered"), Some(3));
    assert_eq!(feb(1, "state_id = 'st1'", "num_launched_facilities"), Some(2));
}

#[test]
fn integrity_failure_keeps_the_committed_partition() {
    let db = warehouse();
    seed_caseload(&db);
    let catalog = DomainCatalog::builtin();
    Pipeline::new(&db, &catalog)
        .run(&JobSpec::new(FACILITY_ACTIVITY, period("2019-01")))
        .expect("january run");

    db.execute_batch(
        "
        CREATE TABLE hierarchy_loose AS SELECT * FROM hierarchy_directory WHERE 0;
        INSERT INTO hierarchy_loose SELECT * FROM hierarchy_directory;
        UPDATE hierarchy_loose SET facility_is_test = NULL WHERE facility_id = 'f1';
        ",
    )
    .expect("loose hierarchy");
    let db = db
        .with_hierarchy_table("hierarchy_loose")
        .expect("hierarchy table");
    let err = Pipeline::new(&db, &catalog)
        .run(&JobSpec::new(FACILITY_ACTIVITY, period("2019-01")))
        .expect_err("null test flag");
    assert!(err.is_data_integrity());
    assert!(err.to_string().contains("null_test_flags[level=5]"));

    assert_eq!(activity(&db, 1, "state_id = 'st1'", "cases_registered"), Some(5));
    assert!(!db
        .table_exists("tmp_agg_facility_activity_2019-01-01")
        .expect("staging check"));
}

#[test]
fn distributed_rollup_matches_single_node() {
    let db = warehouse();
    seed_caseload(&db);
    let catalog = DomainCatalog::builtin();
    let pipeline = Pipeline::new(&db, &catalog);

    let job = JobSpec::new(FACILITY_ACTIVITY, period("2019-01"));
    let report = verify_equivalence(&pipeline, &job).expect("verify");
    assert!(report.is_equivalent(), "divergence: {:?}", report.samples);
    assert_eq!(report.single_node_rows, report.distributed_rows);

    let distributed = pipeline
        .run(&job.with_strategy(StrategyKind::Distributed))
        .expect("distributed run");
    assert_eq!(distributed.strategy, StrategyKind::Distributed);
    assert_eq!(distributed.commit.rows_committed(), report.distributed_rows);
}

#[test]
fn duplicated_rows_count_as_divergence() {
    let db = warehouse();
    seed_caseload(&db);
    let catalog = DomainCatalog::builtin();
    let mut registry = StrategyRegistry::with_defaults(catalog.keys());
    registry.register(
        FACILITY_ACTIVITY,
        Arc::new(SingleNodeStrategy),
        Some(Arc::new(DuplicatingStrategy)),
    );
    let pipeline = Pipeline::new(&db, &catalog).with_registry(registry);

    let report = verify_equivalence(&pipeline, &JobSpec::new(FACILITY_ACTIVITY, period("2019-01")))
        .expect("verify");
    assert!(!report.is_equivalent());
    assert!(!report.distributed_fell_back);
    assert_eq!(report.distributed_rows, report.single_node_rows + 1);
    assert_eq!(report.missing_from_single_node, 1);
    assert_eq!(report.unexpected_in_single_node, 0);
    assert!(report.samples.iter().any(|sample| sample.starts_with("missing: ")));
}

#[test]
fn child_nutrition_joins_carry_forward_state() {
    let db = warehouse();
    register(
        &db,
        Child {
            case_id: "E",
            facility: "f1",
            supervisor: "sup1",
            opened_on: "2018-06-20",
            closed_on: None,
            dob: "2018-06-15",
            sex: "F",
        },
    );
    gm_event(&db, "ev-1", "E", "st1", "2019-01-15 09:00:00", Some(9.5));
    let catalog = DomainCatalog::builtin();
    let pipeline = Pipeline::new(&db, &catalog);
    pipeline
        .run(&JobSpec::new(GROWTH_MONITORING, state_period("2019-01", "st1")))
        .expect("growth monitoring run");
    pipeline
        .run(&JobSpec::new(CHILD_NUTRITION, period("2019-01")))
        .expect("child nutrition run");

    let leaf = |column: &str| {
        format!(
            "SELECT {column} FROM agg_child_nutrition WHERE aggregation_level = 5 AND facility_id = 'f1'"
        )
    };
    assert_eq!(text(&db, &leaf("sex")).as_deref(), Some("F"));
    assert_eq!(text(&db, &leaf("age_tranche")).as_deref(), Some("12"));
    assert_eq!(int(&db, &leaf("wer_eligible")), Some(1));
    assert_eq!(int(&db, &leaf("nutrition_status_weighed")), Some(1));
    assert_eq!(int(&db, &leaf("nutrition_status_normal")), Some(1));
    assert_eq!(int(&db, &leaf("thr_eligible")), Some(1));
    assert_eq!(int(&db, &leaf("days_ration_given_child")), Some(0));
    assert_eq!(real(&db, &leaf("weight_recorded_sum")), Some(9.5));

    let district = "SELECT age_tranche, sex, nutrition_status_weighed FROM agg_child_nutrition WHERE aggregation_level = 2";
    let rows = db.fetch_rows(district).expect("district rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0].as_str(), Some("All"));
    assert_eq!(rows[0][1].as_str(), Some("F"));
    assert_eq!(rows[0][2].as_i64(), Some(1));
    assert_eq!(
        text(
            &db,
            "SELECT age_tranche FROM agg_child_nutrition WHERE aggregation_level = 3"
        )
        .as_deref(),
        Some("12")
    );
}

#[test]
fn age_tranches_split_on_newborn_days_and_month_boundaries() {
    let db = warehouse();
    // Days to 2019-01-31: 28 and 29.
    enroll(&db, "n28", "2019-01-03", "M", "1", "0");
    enroll(&db, "n29", "2019-01-02", "M", "1", "0");
    // Days from 2019-01-01: 182 and 183 either side of 6 x 30.4.
    enroll(&db, "m182", "2018-07-03", "M", "1", "0");
    enroll(&db, "m183", "2018-07-02", "M", "1", "0");
    // 1824 days is exactly 60 x 30.4.
    enroll(&db, "m1824", "2014-01-03", "M", "1", "0");
    enroll(&db, "m1825", "2014-01-02", "M", "1", "0");
    let catalog = DomainCatalog::builtin();
    Pipeline::new(&db, &catalog)
        .run(&JobSpec::new(CHILD_NUTRITION, period("2019-01")))
        .expect("child nutrition run");

    assert_eq!(nutrition_leaf(&db, "M", "0", "valid_in_month"), Some(1));
    assert_eq!(nutrition_leaf(&db, "M", "6", "valid_in_month"), Some(2));
    assert_eq!(nutrition_leaf(&db, "M", "6", "born_in_month"), Some(1));
    assert_eq!(nutrition_leaf(&db, "M", "12", "valid_in_month"), Some(1));
    assert_eq!(nutrition_leaf(&db, "M", "60", "valid_in_month"), Some(1));
    assert_eq!(nutrition_leaf(&db, "M", "60", "wer_eligible"), Some(1));
    assert_eq!(nutrition_leaf(&db, "M", "72", "valid_in_month"), Some(1));
    assert_eq!(nutrition_leaf(&db, "M", "72", "wer_eligible"), Some(0));
    assert_eq!(nutrition_leaf(&db, "M", "0", "born_in_month"), Some(1));
    assert_eq!(
        int(
            &db,
            "SELECT COUNT(*) FROM agg_child_nutrition WHERE aggregation_level = 5 AND facility_id = 'f1'"
        ),
        Some(5)
    );
}

#[test]
fn null_registry_flags_count_as_seeking_services() {
    let db = warehouse();
    enroll(&db, "availing-null", "2017-01-01", "F", "NULL", "0");
    enroll(&db, "migrated-null", "2017-01-01", "F", "1", "NULL");
    enroll(&db, "not-availing", "2017-01-01", "F", "0", "0");
    enroll(&db, "migrated", "2017-01-01", "F", "1", "1");
    let catalog = DomainCatalog::builtin();
    Pipeline::new(&db, &catalog)
        .run(&JobSpec::new(CHILD_NUTRITION, period("2019-01")))
        .expect("child nutrition run");

    assert_eq!(nutrition_leaf(&db, "F", "36", "valid_in_month"), Some(2));
    assert_eq!(nutrition_leaf(&db, "F", "36", "wer_eligible"), Some(2));
    assert_eq!(nutrition_leaf(&db, "F", "36", "thr_eligible"), Some(2));
}
