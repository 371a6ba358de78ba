//! Domain catalog: the manifests a deployment knows about, validated as a set
//! so joins always point at carry-forward domains that exist.

use crate::{EngineError, JoinedDomain};
use std::collections::BTreeMap;
use tally_core::hierarchy::AggregationLevel;
use tally_core::manifest::{
    CarryForwardSpec, ColumnType, DimensionSource, DimensionSpec, DomainKind, DomainManifest,
    EventSourceSpec, FacilitySpec, JoinSpec, MeasureSpec, MeasureValue, MergePolicy, RegistrySpec,
    RollupRule, StateColumn, DEFAULT_AGE_TRANCHES, DEFAULT_NEWBORN_DAYS,
};
use tally_core::predicate::{ColumnRef, Eligibility};

pub const GROWTH_MONITORING: &str = "growth-monitoring";
pub const THR_DISTRIBUTION: &str = "thr-distribution";
pub const CHILD_NUTRITION: &str = "child-nutrition";
pub const FACILITY_ACTIVITY: &str = "facility-activity";

#[derive(Debug, Clone, Default)]
pub struct DomainCatalog {
    domains: BTreeMap<String, DomainManifest>,
}

impl DomainCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four domains shipped with the engine.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for manifest in [
            growth_monitoring(),
            thr_distribution(),
            child_nutrition(),
            facility_activity(),
        ] {
            catalog.domains.insert(manifest.key.clone(), manifest);
        }
        catalog
    }

    /// Validates and adds (or replaces) a manifest. Joined domains must
    /// already be present.
    pub fn insert(&mut self, manifest: DomainManifest) -> Result<(), EngineError> {
        manifest.validate()?;
        self.joined(&manifest)?;
        self.domains.insert(manifest.key.clone(), manifest);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&DomainManifest, EngineError> {
        self.domains
            .get(key)
            .ok_or_else(|| EngineError::configuration(key, "unknown domain"))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainManifest> {
        self.domains.values()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Resolves the joins of a facility domain. Every joined domain must be a
    /// carry-forward domain exposing each column referenced through its alias.
    pub fn joined(&self, manifest: &DomainManifest) -> Result<Vec<JoinedDomain>, EngineError> {
        let DomainKind::Facility(spec) = &manifest.kind else {
            return Ok(Vec::new());
        };
        let refs = spec.column_refs();
        let mut joined = Vec::new();
        for join in &spec.joins {
            let target = self.domains.get(&join.domain).ok_or_else(|| {
                EngineError::configuration(
                    &manifest.key,
                    format!("join {} names unknown domain {}", join.alias, join.domain),
                )
            })?;
            if !target.is_carry_forward() {
                return Err(EngineError::configuration(
                    &manifest.key,
                    format!("join {} must name a carry-forward domain, not {}", join.alias, join.domain),
                ));
            }
            let schema = target.table_schema();
            for reference in refs.iter().filter(|reference| reference.alias == join.alias) {
                if !schema.has_column(&reference.column) {
                    return Err(EngineError::configuration(
                        &manifest.key,
                        format!("{} has no column {}", join.domain, reference.column),
                    ));
                }
            }
            joined.push(JoinedDomain {
                alias: join.alias.clone(),
                manifest: target.clone(),
            });
        }
        Ok(joined)
    }

    /// Validates every manifest and every join; returns the keys checked.
    pub fn validate_all(&self) -> Result<Vec<String>, EngineError> {
        let mut checked = Vec::new();
        for manifest in self.domains.values() {
            manifest.validate()?;
            self.joined(manifest)?;
            checked.push(manifest.key.clone());
        }
        Ok(checked)
    }
}

fn state_column(name: &str, ty: ColumnType, merge: MergePolicy) -> StateColumn {
    StateColumn {
        name: name.to_string(),
        ty,
        merge: Some(merge),
        source: None,
        tracks: None,
    }
}

fn last_recorded(tracks: &str) -> StateColumn {
    StateColumn {
        name: format!("{tracks}_last_recorded"),
        ty: ColumnType::Timestamp,
        merge: Some(MergePolicy::Span),
        source: None,
        tracks: Some(tracks.to_string()),
    }
}

fn event_source(table: &str) -> EventSourceSpec {
    EventSourceSpec {
        table: table.to_string(),
        entity_column: "case_id".to_string(),
        supervisor_column: "supervisor_id".to_string(),
        state_column: "state_id".to_string(),
        timestamp_column: "timestamp".to_string(),
        event_id_column: "event_id".to_string(),
    }
}

fn child_registry() -> RegistrySpec {
    RegistrySpec {
        table: "child_health_registry".to_string(),
        entity_column: "case_id".to_string(),
        facility_column: "facility_id".to_string(),
        supervisor_column: "supervisor_id".to_string(),
        opened_column: "opened_on".to_string(),
        closed_column: "closed_on".to_string(),
        dob_column: "dob".to_string(),
        death_column: "date_death".to_string(),
        migrated_column: "is_migrated".to_string(),
        registered_column: "is_availing".to_string(),
    }
}

fn measure(name: &str, value: MeasureValue, rollup: RollupRule) -> MeasureSpec {
    MeasureSpec {
        name: name.to_string(),
        ty: ColumnType::Integer,
        value,
        rollup,
    }
}

fn count(name: &str, when: Eligibility) -> MeasureSpec {
    measure(name, MeasureValue::Count { when: Some(when) }, RollupRule::Sum)
}

fn launched(name: &str, level: AggregationLevel) -> MeasureSpec {
    measure(
        name,
        MeasureValue::Flag {
            when: Some(Eligibility::OpenInMonth),
        },
        RollupRule::Launched { level },
    )
}

/// Latest anthropometry per child, with the timestamp each value was taken.
pub fn growth_monitoring() -> DomainManifest {
    let mut columns = Vec::new();
    for (name, ty) in [
        ("weight_child", ColumnType::Real),
        ("height_child", ColumnType::Real),
        ("zscore_grading_wfa", ColumnType::Integer),
        ("zscore_grading_hfa", ColumnType::Integer),
        ("zscore_grading_wfh", ColumnType::Integer),
        ("muac_grading", ColumnType::Integer),
    ] {
        columns.push(state_column(name, ty, MergePolicy::Latest));
        columns.push(last_recorded(name));
    }
    DomainManifest {
        key: GROWTH_MONITORING.to_string(),
        base_table: "agg_growth_monitoring".to_string(),
        description: "Latest growth measurements per child and when they were recorded".to_string(),
        lookback_months: 1,
        kind: DomainKind::CarryForward(CarryForwardSpec {
            source: event_source("growth_monitoring_events"),
            entity_column: "case_id".to_string(),
            partition_by_state: true,
            columns,
        }),
    }
}

/// Take-home-ration distribution per child.
pub fn thr_distribution() -> DomainManifest {
    DomainManifest {
        key: THR_DISTRIBUTION.to_string(),
        base_table: "agg_thr_distribution".to_string(),
        description: "Take-home ration days per child and whether a ration was ever received"
            .to_string(),
        lookback_months: 1,
        kind: DomainKind::CarryForward(CarryForwardSpec {
            source: event_source("thr_events"),
            entity_column: "case_id".to_string(),
            partition_by_state: true,
            columns: vec![
                state_column("days_ration_given_child", ColumnType::Integer, MergePolicy::Latest),
                StateColumn {
                    name: "received_thr_ever".to_string(),
                    ty: ColumnType::Integer,
                    merge: Some(MergePolicy::Ever),
                    source: Some("days_ration_given_child".to_string()),
                    tracks: None,
                },
                last_recorded("days_ration_given_child"),
            ],
        }),
    }
}

/// Monthly child nutrition indicators per facility, sex and age tranche.
pub fn child_nutrition() -> DomainManifest {
    let mut predicates = BTreeMap::new();
    predicates.insert(
        "seeking_services".to_string(),
        Eligibility::all(vec![Eligibility::Registered, Eligibility::NotMigrated]),
    );
    predicates.insert(
        "valid_in_month".to_string(),
        Eligibility::all(vec![
            Eligibility::OpenInMonth,
            Eligibility::AliveInMonth,
            Eligibility::named("seeking_services"),
            Eligibility::age(None, Some(72.0)),
        ]),
    );
    predicates.insert(
        "wer_eligible".to_string(),
        Eligibility::all(vec![
            Eligibility::named("valid_in_month"),
            Eligibility::age(None, Some(60.0)),
        ]),
    );
    predicates.insert(
        "height_eligible".to_string(),
        Eligibility::all(vec![
            Eligibility::named("valid_in_month"),
            Eligibility::age(Some(6.0), Some(60.0)),
        ]),
    );
    predicates.insert(
        "thr_eligible".to_string(),
        Eligibility::all(vec![
            Eligibility::named("valid_in_month"),
            Eligibility::age(Some(6.0), Some(36.0)),
        ]),
    );

    let weighed = Eligibility::recorded_in_month(ColumnRef::new("gm", "weight_child_last_recorded"));
    let measured = Eligibility::recorded_in_month(ColumnRef::new("gm", "height_child_last_recorded"));
    let wfa = |grades: Vec<i64>| {
        Eligibility::all(vec![
            Eligibility::named("wer_eligible"),
            Eligibility::recorded_in_month(ColumnRef::new("gm", "zscore_grading_wfa_last_recorded")),
            Eligibility::in_set(ColumnRef::new("gm", "zscore_grading_wfa"), grades),
        ])
    };

    let measures = vec![
        count("valid_in_month", Eligibility::named("valid_in_month")),
        count("wer_eligible", Eligibility::named("wer_eligible")),
        count(
            "nutrition_status_weighed",
            Eligibility::all(vec![Eligibility::named("wer_eligible"), weighed.clone()]),
        ),
        count("nutrition_status_severely_underweight", wfa(vec![1])),
        count("nutrition_status_moderately_underweight", wfa(vec![2])),
        count("nutrition_status_normal", wfa(vec![3, 4])),
        count("height_eligible", Eligibility::named("height_eligible")),
        count(
            "height_measured_in_month",
            Eligibility::all(vec![Eligibility::named("height_eligible"), measured.clone()]),
        ),
        count(
            "weighed_and_height_measured_in_month",
            Eligibility::all(vec![Eligibility::named("height_eligible"), weighed.clone(), measured]),
        ),
        count("thr_eligible", Eligibility::named("thr_eligible")),
        measure(
            "days_ration_given_child",
            MeasureValue::Value {
                column: ColumnRef::new("thr", "days_ration_given_child"),
                when: Some(Eligibility::named("thr_eligible")),
                default: Some(0.0),
            },
            RollupRule::SumOrZero,
        ),
        MeasureSpec {
            name: "weight_recorded_sum".to_string(),
            ty: ColumnType::Real,
            value: MeasureValue::Value {
                column: ColumnRef::new("gm", "weight_child"),
                when: Some(Eligibility::all(vec![Eligibility::named("wer_eligible"), weighed])),
                default: None,
            },
            rollup: RollupRule::Sum,
        },
        count(
            "born_in_month",
            Eligibility::all(vec![Eligibility::BornInMonth, Eligibility::named("seeking_services")]),
        ),
    ];

    DomainManifest {
        key: CHILD_NUTRITION.to_string(),
        base_table: "agg_child_nutrition".to_string(),
        description: "Child nutrition indicators by facility, sex and age tranche".to_string(),
        lookback_months: 0,
        kind: DomainKind::Facility(FacilitySpec {
            registry: child_registry(),
            joins: vec![
                JoinSpec {
                    alias: "gm".to_string(),
                    domain: GROWTH_MONITORING.to_string(),
                },
                JoinSpec {
                    alias: "thr".to_string(),
                    domain: THR_DISTRIBUTION.to_string(),
                },
            ],
            predicates,
            entity_filter: Some(Eligibility::all(vec![
                Eligibility::OpenInMonth,
                Eligibility::AliveInMonth,
            ])),
            dimensions: vec![
                DimensionSpec {
                    name: "sex".to_string(),
                    source: DimensionSource::Column {
                        column: ColumnRef::registry("sex"),
                    },
                    retained_through: AggregationLevel::State,
                },
                DimensionSpec {
                    name: "age_tranche".to_string(),
                    source: DimensionSource::AgeTranche {
                        thresholds: DEFAULT_AGE_TRANCHES.to_vec(),
                        newborn_days: DEFAULT_NEWBORN_DAYS,
                    },
                    retained_through: AggregationLevel::Block,
                },
            ],
            measures,
            sticky_flags: Vec::new(),
        }),
    }
}

/// Per-facility activity with launched counts at every level.
pub fn facility_activity() -> DomainManifest {
    let active = Eligibility::all(vec![
        Eligibility::OpenInMonth,
        Eligibility::AliveInMonth,
        Eligibility::Registered,
    ]);
    DomainManifest {
        key: FACILITY_ACTIVITY.to_string(),
        base_table: "agg_facility_activity".to_string(),
        description: "Registered caseload and launched facilities per hierarchy node".to_string(),
        lookback_months: 1,
        kind: DomainKind::Facility(FacilitySpec {
            registry: child_registry(),
            joins: Vec::new(),
            predicates: BTreeMap::new(),
            entity_filter: None,
            dimensions: Vec::new(),
            measures: vec![
                count("cases_registered", active.clone()),
                measure(
                    "largest_caseload",
                    MeasureValue::Count { when: Some(active) },
                    RollupRule::Max,
                ),
                measure(
                    "contributing_facilities",
                    MeasureValue::Constant { value: 1.0 },
                    RollupRule::Sum,
                ),
                launched("num_launched_states", AggregationLevel::State),
                launched("num_launched_districts", AggregationLevel::District),
                launched("num_launched_blocks", AggregationLevel::Block),
                launched("num_launched_supervisors", AggregationLevel::Supervisor),
                launched("num_launched_facilities", AggregationLevel::Facility),
            ],
            sticky_flags: vec![
                "num_launched_states".to_string(),
                "num_launched_districts".to_string(),
                "num_launched_blocks".to_string(),
                "num_launched_supervisors".to_string(),
                "num_launched_facilities".to_string(),
            ],
        }),
    }
}
