#![allow(dead_code)]

use tally_core::hierarchy::FacilityAncestry;
use tally_core::period::{Month, PeriodKey};
use tally_storage::partition::{CatalogEntry, PartitionManager};
use tally_storage::{Cell, Warehouse};

pub fn month(value: &str) -> Month {
    value.parse().expect("valid month")
}

pub fn state_period(value: &str, state: &str) -> PeriodKey {
    PeriodKey::month_state(month(value), state)
}

pub fn period(value: &str) -> PeriodKey {
    PeriodKey::month(month(value))
}

pub fn ancestry(facility: &str, supervisor: &str, block: &str, district: &str, state: &str) -> FacilityAncestry {
    FacilityAncestry {
        facility_id: facility.to_string(),
        supervisor_id: supervisor.to_string(),
        block_id: block.to_string(),
        district_id: district.to_string(),
        state_id: state.to_string(),
        facility_is_test: false,
        supervisor_is_test: false,
        block_is_test: false,
        district_is_test: false,
        state_is_test: false,
    }
}

/// st1: d1/b1/sup1 {f1, f2}, d1/b1/sup2 {f3 (test)}; st2: d2/b2/sup3 {f4}.
pub fn hierarchy() -> Vec<FacilityAncestry> {
    let mut test_facility = ancestry("f3", "sup2", "b1", "d1", "st1");
    test_facility.facility_is_test = true;
    vec![
        ancestry("f1", "sup1", "b1", "d1", "st1"),
        ancestry("f2", "sup1", "b1", "d1", "st1"),
        test_facility,
        ancestry("f4", "sup3", "b2", "d2", "st2"),
    ]
}

/// In-memory warehouse with source tables for every built-in domain.
pub fn warehouse() -> Warehouse {
    let db = Warehouse::open_in_memory().expect("open warehouse");
    db.execute_batch(
        "
        CREATE TABLE growth_monitoring_events (
            event_id TEXT NOT NULL,
            case_id TEXT,
            supervisor_id TEXT,
            state_id TEXT,
            timestamp TEXT NOT NULL,
            weight_child REAL,
            height_child REAL,
            zscore_grading_wfa INTEGER,
            zscore_grading_hfa INTEGER,
            zscore_grading_wfh INTEGER,
            muac_grading INTEGER
        );
        CREATE TABLE thr_events (
            event_id TEXT NOT NULL,
            case_id TEXT,
            supervisor_id TEXT,
            state_id TEXT,
            timestamp TEXT NOT NULL,
            days_ration_given_child INTEGER
        );
        CREATE TABLE child_health_registry (
            case_id TEXT PRIMARY KEY,
            facility_id TEXT,
            supervisor_id TEXT,
            opened_on TEXT,
            closed_on TEXT,
            dob TEXT,
            date_death TEXT,
            is_migrated INTEGER,
            is_availing INTEGER,
            sex TEXT
        );
        ",
    )
    .expect("create source tables");
    db.replace_hierarchy(&hierarchy()).expect("load hierarchy");
    db
}

pub fn gm_event(db: &Warehouse, event_id: &str, case_id: &str, state: &str, timestamp: &str, weight: Option<f64>) {
    let weight = weight.map_or("NULL".to_string(), |value| value.to_string());
    let supervisor = if state == "st1" { "sup1" } else { "sup3" };
    db.execute(&format!(
        "INSERT INTO growth_monitoring_events (event_id, case_id, supervisor_id, state_id, timestamp, weight_child, zscore_grading_wfa)
         VALUES ('{event_id}', '{case_id}', '{supervisor}', '{state}', '{timestamp}', {weight}, CASE WHEN {weight} IS NULL THEN NULL ELSE 3 END)"
    ))
    .expect("insert growth monitoring event");
}

pub struct Child<'a> {
    pub case_id: &'a str,
    pub facility: &'a str,
    pub supervisor: &'a str,
    pub opened_on: &'a str,
    pub closed_on: Option<&'a str>,
    pub dob: &'a str,
    pub sex: &'a str,
}

pub fn register(db: &Warehouse, child: Child<'_>) {
    let closed = child
        .closed_on
        .map_or("NULL".to_string(), |value| format!("'{value}'"));
    db.execute(&format!(
        "INSERT INTO child_health_registry (case_id, facility_id, supervisor_id, opened_on, closed_on, dob, date_death, is_migrated, is_availing, sex)
         VALUES ('{}', '{}', '{}', '{}', {closed}, '{}', NULL, 0, 1, '{}')",
        child.case_id, child.facility, child.supervisor, child.opened_on, child.dob, child.sex
    ))
    .expect("register child");
}

/// Registers `count` open children at a facility.
pub fn register_many(db: &Warehouse, prefix: &str, facility: &str, supervisor: &str, count: usize) {
    for index in 0..count {
        register(
            db,
            Child {
                case_id: &format!("{prefix}-{index}"),
                facility,
                supervisor,
                opened_on: "2018-06-01",
                closed_on: None,
                dob: "2017-01-01",
                sex: if index % 2 == 0 { "F" } else { "M" },
            },
        );
    }
}

pub fn int(db: &Warehouse, sql: &str) -> Option<i64> {
    let rows = db.fetch_rows(sql).expect("query");
    rows.first().and_then(|row| row[0].as_i64())
}

pub fn real(db: &Warehouse, sql: &str) -> Option<f64> {
    let rows = db.fetch_rows(sql).expect("query");
    rows.first().and_then(|row| row[0].as_f64())
}

pub fn text(db: &Warehouse, sql: &str) -> Option<String> {
    let rows = db.fetch_rows(sql).expect("query");
    rows.first().and_then(|row| match &row[0] {
        Cell::Null => None,
        cell => Some(cell.to_string()),
    })
}

/// Catalogued partitions of `parent` for the key's month and state.
pub fn committed_for_period(db: &Warehouse, parent: &str, key: &PeriodKey) -> Vec<CatalogEntry> {
    PartitionManager::new(db)
        .list_partitions(Some(parent))
        .expect("catalog")
        .into_iter()
        .filter(|entry| {
            entry.month == key.month.as_ymd()
                && (key.state_id.is_none() || entry.state_id == key.state_id)
        })
        .collect()
}
