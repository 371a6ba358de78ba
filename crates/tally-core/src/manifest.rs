use crate::hierarchy::AggregationLevel;
use crate::naming::{quote_ident, validate_identifier, NamingError};
use crate::predicate::{check_named_predicates, ColumnRef, Eligibility, PredicateError, REGISTRY_ALIAS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub const MAX_LOOKBACK_MONTHS: u32 = 3;
pub const DEFAULT_AGE_TRANCHES: [u32; 8] = [0, 6, 12, 24, 36, 48, 60, 72];
pub const DEFAULT_NEWBORN_DAYS: u32 = 28;

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("domain key {0:?} must be lower-case kebab-case")]
    InvalidKey(String),
    #[error("naming error: {0}")]
    Naming(#[from] NamingError),
    #[error("predicate error: {0}")]
    Predicate(#[from] PredicateError),
    #[error("lookback of {found} months exceeds the maximum of {max}")]
    LookbackOutOfRange { found: u32, max: u32 },
    #[error("{reason} requires lookback_months >= 1")]
    LookbackRequired { reason: String },
    #[error("carry-forward column {0} has no merge policy")]
    MissingMergePolicy(String),
    #[error("ever column {0} must be an integer column")]
    EverColumnType(String),
    #[error("column {0} is declared more than once")]
    DuplicateColumn(String),
    #[error("column reference {0} uses an alias that is neither the registry nor a joined domain")]
    UnknownAlias(String),
    #[error("join alias {0} is declared more than once")]
    DuplicateAlias(String),
    #[error("constant measure {0} is only allowed in domains without dimensions")]
    ConstantWithDimensions(String),
    #[error("sticky flag {0} is not a flag measure")]
    StickyFlagNotFlag(String),
    #[error("launched measure {measure} needs a launched companion column at level {level}")]
    MissingLaunchedCompanion {
        measure: String,
        level: AggregationLevel,
    },
    #[error("age tranche thresholds for {0} must be strictly increasing")]
    UnorderedTranches(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Date => "DATE",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Named, ordered column list shared by staging tables and partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub sort_key: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column.name == name)
    }

    /// Quoted, comma separated column list in declaration order.
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|column| quote_ident(&column.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn sort_list(&self) -> String {
        self.sort_key
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn create_table_sql(&self, table: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| format!("{} {}", quote_ident(&column.name), column.ty.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({columns})", quote_ident(table))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Most recent non-null value wins.
    Latest,
    /// Sticky boolean: once positive, stays positive.
    Ever,
    /// Most recent timestamp at which the tracked column had a value.
    Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSourceSpec {
    pub table: String,
    pub entity_column: String,
    #[serde(default = "default_supervisor_column")]
    pub supervisor_column: String,
    #[serde(default = "default_state_column")]
    pub state_column: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default = "default_event_id_column")]
    pub event_id_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub merge: Option<MergePolicy>,
    /// Event column feeding this state column; defaults to `name`.
    #[serde(default)]
    pub source: Option<String>,
    /// For span columns: event column whose presence marks a recording.
    #[serde(default)]
    pub tracks: Option<String>,
}

impl StateColumn {
    pub fn source_column(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarryForwardSpec {
    pub source: EventSourceSpec,
    pub entity_column: String,
    #[serde(default = "default_true")]
    pub partition_by_state: bool,
    pub columns: Vec<StateColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySpec {
    pub table: String,
    pub entity_column: String,
    #[serde(default = "default_facility_column")]
    pub facility_column: String,
    #[serde(default = "default_supervisor_column")]
    pub supervisor_column: String,
    #[serde(default = "default_opened_column")]
    pub opened_column: String,
    #[serde(default = "default_closed_column")]
    pub closed_column: String,
    #[serde(default = "default_dob_column")]
    pub dob_column: String,
    #[serde(default = "default_death_column")]
    pub death_column: String,
    #[serde(default = "default_migrated_column")]
    pub migrated_column: String,
    #[serde(default = "default_registered_column")]
    pub registered_column: String,
}

/// A carry-forward domain joined on (entity, supervisor, month).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub alias: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DimensionSource {
    Column {
        column: ColumnRef,
    },
    AgeTranche {
        #[serde(default = "default_tranches")]
        thresholds: Vec<u32>,
        #[serde(default = "default_newborn_days")]
        newborn_days: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub name: String,
    pub source: DimensionSource,
    /// Finest-to-coarsest cut-off: rows at coarser levels carry `All`.
    pub retained_through: AggregationLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasureValue {
    Count {
        #[serde(default)]
        when: Option<Eligibility>,
    },
    Value {
        column: ColumnRef,
        #[serde(default)]
        when: Option<Eligibility>,
        #[serde(default)]
        default: Option<f64>,
    },
    Flag {
        #[serde(default)]
        when: Option<Eligibility>,
    },
    Constant {
        value: f64,
    },
}

impl MeasureValue {
    pub fn condition(&self) -> Option<&Eligibility> {
        match self {
            Self::Count { when } | Self::Value { when, .. } | Self::Flag { when } => when.as_ref(),
            Self::Constant { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RollupRule {
    Sum,
    SumOrZero,
    Max,
    Min,
    Null,
    Literal { value: String },
    Launched { level: AggregationLevel },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    pub value: MeasureValue,
    #[serde(default = "default_rollup")]
    pub rollup: RollupRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitySpec {
    pub registry: RegistrySpec,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub predicates: BTreeMap<String, Eligibility>,
    /// Registry rows failing this filter contribute nothing.
    #[serde(default)]
    pub entity_filter: Option<Eligibility>,
    #[serde(default)]
    pub dimensions: Vec<DimensionSpec>,
    pub measures: Vec<MeasureSpec>,
    #[serde(default)]
    pub sticky_flags: Vec<String>,
}

impl FacilitySpec {
    /// Launched-rule measure counting nodes of `level`, if declared.
    pub fn launched_column(&self, level: AggregationLevel) -> Option<&str> {
        self.measures.iter().find_map(|measure| match measure.rollup {
            RollupRule::Launched { level: declared } if declared == level => {
                Some(measure.name.as_str())
            }
            _ => None,
        })
    }

    /// Registry columns the declared predicates and measures read.
    pub fn registry_columns(&self) -> BTreeSet<String> {
        let mut columns = BTreeSet::new();
        columns.insert(self.registry.entity_column.clone());
        columns.insert(self.registry.facility_column.clone());
        columns.insert(self.registry.supervisor_column.clone());
        for predicate in self.all_predicates() {
            collect_registry_columns(predicate, &self.registry, &mut columns);
        }
        for column in self.column_refs() {
            if column.is_registry() {
                columns.insert(column.column);
            }
        }
        if self
            .dimensions
            .iter()
            .any(|dimension| matches!(dimension.source, DimensionSource::AgeTranche { .. }))
        {
            columns.insert(self.registry.dob_column.clone());
        }
        columns
    }

    /// Every `alias.column` reference in predicates, measures and dimensions.
    pub fn column_refs(&self) -> BTreeSet<ColumnRef> {
        let mut refs = BTreeSet::new();
        for predicate in self.all_predicates() {
            refs.extend(predicate.column_refs());
        }
        for measure in &self.measures {
            if let MeasureValue::Value { column, .. } = &measure.value {
                refs.insert(column.clone());
            }
        }
        for dimension in &self.dimensions {
            if let DimensionSource::Column { column } = &dimension.source {
                refs.insert(column.clone());
            }
        }
        refs
    }

    fn all_predicates(&self) -> impl Iterator<Item = &Eligibility> {
        self.predicates
            .values()
            .chain(self.entity_filter.iter())
            .chain(self.measures.iter().filter_map(|measure| measure.value.condition()))
    }
}

fn collect_registry_columns(
    predicate: &Eligibility,
    registry: &RegistrySpec,
    columns: &mut BTreeSet<String>,
) {
    match predicate {
        Eligibility::All { of } | Eligibility::Any { of } => {
            for child in of {
                collect_registry_columns(child, registry, columns);
            }
        }
        Eligibility::Not { of } => collect_registry_columns(of, registry, columns),
        Eligibility::OpenInMonth => {
            columns.insert(registry.opened_column.clone());
            columns.insert(registry.closed_column.clone());
        }
        Eligibility::AliveInMonth => {
            columns.insert(registry.death_column.clone());
        }
        Eligibility::NotMigrated => {
            columns.insert(registry.migrated_column.clone());
        }
        Eligibility::Registered => {
            columns.insert(registry.registered_column.clone());
        }
        Eligibility::BornInMonth | Eligibility::AgeMonths { .. } => {
            columns.insert(registry.dob_column.clone());
        }
        Eligibility::RecordedInMonth { .. } | Eligibility::InSet { .. } | Eligibility::Ref { .. } => {}
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainKind {
    CarryForward(CarryForwardSpec),
    Facility(FacilitySpec),
}

/// Declarative description of one indicator domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainManifest {
    pub key: String,
    pub base_table: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lookback_months: u32,
    pub kind: DomainKind,
}

impl DomainManifest {
    pub fn is_carry_forward(&self) -> bool {
        matches!(self.kind, DomainKind::CarryForward(_))
    }

    /// Jobs for this domain must name a state.
    pub fn requires_state(&self) -> bool {
        matches!(&self.kind, DomainKind::CarryForward(spec) if spec.partition_by_state)
    }

    pub fn joined_domains(&self) -> Vec<&str> {
        match &self.kind {
            DomainKind::Facility(spec) => spec.joins.iter().map(|join| join.domain.as_str()).collect(),
            DomainKind::CarryForward(_) => Vec::new(),
        }
    }

    /// Schema of every partition and staging table of this domain.
    pub fn table_schema(&self) -> TableSchema {
        match &self.kind {
            DomainKind::CarryForward(spec) => carry_forward_schema(spec),
            DomainKind::Facility(spec) => fact_schema(spec),
        }
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_kebab_case(&self.key) {
            return Err(ManifestError::InvalidKey(self.key.clone()));
        }
        validate_identifier(&self.base_table)?;
        if self.lookback_months > MAX_LOOKBACK_MONTHS {
            return Err(ManifestError::LookbackOutOfRange {
                found: self.lookback_months,
                max: MAX_LOOKBACK_MONTHS,
            });
        }

        match &self.kind {
            DomainKind::CarryForward(spec) => self.validate_carry_forward(spec),
            DomainKind::Facility(spec) => self.validate_facility(spec),
        }
    }

    fn validate_carry_forward(&self, spec: &CarryForwardSpec) -> Result<(), ManifestError> {
        if self.lookback_months < 1 {
            return Err(ManifestError::LookbackRequired {
                reason: format!("carry-forward domain {}", self.key),
            });
        }
        let source = &spec.source;
        for name in [
            &source.table,
            &source.entity_column,
            &source.supervisor_column,
            &source.state_column,
            &source.timestamp_column,
            &source.event_id_column,
            &spec.entity_column,
        ] {
            validate_identifier(name)?;
        }

        let schema = carry_forward_schema(spec);
        check_unique(schema.column_names())?;

        for column in &spec.columns {
            validate_identifier(&column.name)?;
            validate_identifier(column.source_column())?;
            if let Some(tracks) = &column.tracks {
                validate_identifier(tracks)?;
            }
            match column.merge {
                None => return Err(ManifestError::MissingMergePolicy(column.name.clone())),
                Some(MergePolicy::Ever) if column.ty != ColumnType::Integer => {
                    return Err(ManifestError::EverColumnType(column.name.clone()));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn validate_facility(&self, spec: &FacilitySpec) -> Result<(), ManifestError> {
        validate_identifier(&spec.registry.table)?;
        for column in spec.registry_columns() {
            validate_identifier(&column)?;
        }

        let mut aliases = BTreeSet::new();
        aliases.insert(REGISTRY_ALIAS.to_string());
        for join in &spec.joins {
            validate_identifier(&join.alias)?;
            if !aliases.insert(join.alias.clone()) {
                return Err(ManifestError::DuplicateAlias(join.alias.clone()));
            }
        }
        for column in spec.column_refs() {
            if !aliases.contains(&column.alias) {
                return Err(ManifestError::UnknownAlias(column.to_string()));
            }
            validate_identifier(&column.column)?;
        }

        let roots: Vec<&Eligibility> = spec
            .entity_filter
            .iter()
            .chain(spec.measures.iter().filter_map(|measure| measure.value.condition()))
            .collect();
        check_named_predicates(&spec.predicates, &roots)?;

        check_unique(fact_schema(spec).column_names())?;

        for dimension in &spec.dimensions {
            validate_identifier(&dimension.name)?;
            if let DimensionSource::AgeTranche { thresholds, .. } = &dimension.source {
                if thresholds.is_empty() || thresholds.windows(2).any(|pair| pair[0] >= pair[1]) {
                    return Err(ManifestError::UnorderedTranches(dimension.name.clone()));
                }
            }
        }

        for measure in &spec.measures {
            validate_identifier(&measure.name)?;
            if matches!(measure.value, MeasureValue::Constant { .. }) && !spec.dimensions.is_empty() {
                return Err(ManifestError::ConstantWithDimensions(measure.name.clone()));
            }
        }

        for sticky in &spec.sticky_flags {
            let is_flag = spec
                .measures
                .iter()
                .any(|measure| &measure.name == sticky && matches!(measure.value, MeasureValue::Flag { .. }));
            if !is_flag {
                return Err(ManifestError::StickyFlagNotFlag(sticky.clone()));
            }
        }
        if !spec.sticky_flags.is_empty() && self.lookback_months < 1 {
            return Err(ManifestError::LookbackRequired {
                reason: format!("sticky flags of {}", self.key),
            });
        }

        for measure in &spec.measures {
            let RollupRule::Launched { level } = measure.rollup else {
                continue;
            };
            let mut finer = level.finer();
            while let Some(companion) = finer {
                if spec.launched_column(companion).is_none() {
                    return Err(ManifestError::MissingLaunchedCompanion {
                        measure: measure.name.clone(),
                        level: companion,
                    });
                }
                finer = companion.finer();
            }
        }

        Ok(())
    }
}

fn carry_forward_schema(spec: &CarryForwardSpec) -> TableSchema {
    let mut columns = vec![
        ColumnDef::new(spec.entity_column.clone(), ColumnType::Text),
        ColumnDef::new("supervisor_id", ColumnType::Text),
        ColumnDef::new("state_id", ColumnType::Text),
        ColumnDef::new("month", ColumnType::Date),
    ];
    columns.extend(
        spec.columns
            .iter()
            .map(|column| ColumnDef::new(column.name.clone(), column.ty)),
    );
    TableSchema {
        columns,
        sort_key: vec!["supervisor_id".to_string(), spec.entity_column.clone()],
        indexes: vec![vec![spec.entity_column.clone()], vec!["supervisor_id".to_string()]],
    }
}

fn fact_schema(spec: &FacilitySpec) -> TableSchema {
    let mut columns: Vec<ColumnDef> = AggregationLevel::ALL
        .into_iter()
        .map(|level| ColumnDef::new(level.id_column(), ColumnType::Text))
        .collect();
    columns.push(ColumnDef::new("month", ColumnType::Date));
    columns.push(ColumnDef::new("aggregation_level", ColumnType::Integer));
    columns.extend(
        spec.dimensions
            .iter()
            .map(|dimension| ColumnDef::new(dimension.name.clone(), ColumnType::Text)),
    );
    columns.extend(
        AggregationLevel::ALL
            .into_iter()
            .map(|level| ColumnDef::new(level.is_test_column(), ColumnType::Integer)),
    );
    columns.extend(
        spec.measures
            .iter()
            .map(|measure| ColumnDef::new(measure.name.clone(), measure.ty)),
    );

    let mut sort_key: Vec<String> = AggregationLevel::ALL
        .into_iter()
        .map(|level| level.id_column().to_string())
        .collect();
    sort_key.extend(spec.dimensions.iter().map(|dimension| dimension.name.clone()));

    TableSchema {
        columns,
        sort_key,
        indexes: vec![
            vec!["state_id".to_string()],
            vec!["district_id".to_string()],
            vec!["block_id".to_string()],
            vec!["supervisor_id".to_string()],
        ],
    }
}

fn check_unique(names: Vec<&str>) -> Result<(), ManifestError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ManifestError::DuplicateColumn(name.to_string()));
        }
    }
    Ok(())
}

fn is_kebab_case(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('-')
        && !key.ends_with('-')
        && !key.contains("--")
        && key
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
}

fn default_true() -> bool {
    true
}

fn default_rollup() -> RollupRule {
    RollupRule::Sum
}

fn default_tranches() -> Vec<u32> {
    DEFAULT_AGE_TRANCHES.to_vec()
}

fn default_newborn_days() -> u32 {
    DEFAULT_NEWBORN_DAYS
}

fn default_supervisor_column() -> String {
    "supervisor_id".to_string()
}

fn default_state_column() -> String {
    "state_id".to_string()
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_event_id_column() -> String {
    "event_id".to_string()
}

fn default_facility_column() -> String {
    "facility_id".to_string()
}

fn default_opened_column() -> String {
    "opened_on".to_string()
}

fn default_closed_column() -> String {
    "closed_on".to_string()
}

fn default_dob_column() -> String {
    "dob".to_string()
}

fn default_death_column() -> String {
    "date_death".to_string()
}

fn default_migrated_column() -> String {
    "is_migrated".to_string()
}

fn default_registered_column() -> String {
    "is_availing".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carry_forward() -> DomainManifest {
        DomainManifest {
            key: "growth-monitoring".to_string(),
            base_table: "agg_growth_monitoring".to_string(),
            description: String::new(),
            lookback_months: 1,
            kind: DomainKind::CarryForward(CarryForwardSpec {
                source: EventSourceSpec {
                    table: "gm_events".to_string(),
                    entity_column: "case_id".to_string(),
                    supervisor_column: default_supervisor_column(),
                    state_column: default_state_column(),
                    timestamp_column: default_timestamp_column(),
                    event_id_column: default_event_id_column(),
                },
                entity_column: "case_id".to_string(),
                partition_by_state: true,
                columns: vec![
                    StateColumn {
                        name: "weight_child".to_string(),
                        ty: ColumnType::Real,
                        merge: Some(MergePolicy::Latest),
                        source: None,
                        tracks: None,
                    },
                    StateColumn {
                        name: "weight_child_last_recorded".to_string(),
                        ty: ColumnType::Timestamp,
                        merge: Some(MergePolicy::Span),
                        source: None,
                        tracks: Some("weight_child".to_string()),
                    },
                ],
            }),
        }
    }

    fn facility(measures: Vec<MeasureSpec>) -> DomainManifest {
        DomainManifest {
            key: "facility-activity".to_string(),
            base_table: "agg_facility".to_string(),
            description: String::new(),
            lookback_months: 1,
            kind: DomainKind::Facility(FacilitySpec {
                registry: serde_json::from_str(r#"{"table":"person_registry","entity_column":"person_id"}"#)
                    .expect("registry"),
                joins: Vec::new(),
                predicates: BTreeMap::new(),
                entity_filter: None,
                dimensions: Vec::new(),
                measures,
                sticky_flags: Vec::new(),
            }),
        }
    }

    fn launched(name: &str, level: AggregationLevel) -> MeasureSpec {
        MeasureSpec {
            name: name.to_string(),
            ty: ColumnType::Integer,
            value: MeasureValue::Flag { when: None },
            rollup: RollupRule::Launched { level },
        }
    }

    #[test]
    fn valid_carry_forward_manifest_passes() {
        carry_forward().validate().expect("valid manifest");
        assert!(carry_forward().requires_state());
    }

    #[test]
    fn missing_merge_policy_is_a_fault() {
        let mut manifest = carry_forward();
        if let DomainKind::CarryForward(spec) = &mut manifest.kind {
            spec.columns[0].merge = None;
        }
        assert_eq!(
            manifest.validate(),
            Err(ManifestError::MissingMergePolicy("weight_child".to_string()))
        );
    }

    #[test]
    fn lookback_is_bounded() {
        let mut manifest = carry_forward();
        manifest.lookback_months = 4;
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::LookbackOutOfRange { found: 4, max: 3 })
        ));
        manifest.lookback_months = 0;
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::LookbackRequired { .. })
        ));
    }

    #[test]
    fn launched_rules_need_finer_companions() {
        let complete = facility(vec![
            launched("num_launched_supervisors", AggregationLevel::Supervisor),
            launched("num_launched_facilities", AggregationLevel::Facility),
        ]);
        complete.validate().expect("complete launched chain");

        let broken = facility(vec![
            launched("num_launched_blocks", AggregationLevel::Block),
            launched("num_launched_facilities", AggregationLevel::Facility),
        ]);
        assert_eq!(
            broken.validate(),
            Err(ManifestError::MissingLaunchedCompanion {
                measure: "num_launched_blocks".to_string(),
                level: AggregationLevel::Supervisor,
            })
        );
    }

    #[test]
    fn fact_schema_orders_location_dimension_flag_measure_columns() {
        let manifest = facility(vec![launched("num_launched_facilities", AggregationLevel::Facility)]);
        let schema = manifest.table_schema();
        let names = schema.column_names();
        assert_eq!(&names[..7], &[
            "state_id",
            "district_id",
            "block_id",
            "supervisor_id",
            "facility_id",
            "month",
            "aggregation_level"
        ]);
        assert_eq!(names.last().copied(), Some("num_launched_facilities"));
        assert!(schema
            .create_table_sql("agg_facility_2019-01-01_5")
            .starts_with("CREATE TABLE \"agg_facility_2019-01-01_5\" (\"state_id\" TEXT"));
    }

    #[test]
    fn unknown_alias_is_rejected() {
        let manifest = facility(vec![MeasureSpec {
            name: "wer_eligible".to_string(),
            ty: ColumnType::Integer,
            value: MeasureValue::Count {
                when: Some(Eligibility::recorded_in_month(ColumnRef::new("gm", "weight_child_last_recorded"))),
            },
            rollup: RollupRule::Sum,
        }]);
        assert_eq!(
            manifest.validate(),
            Err(ManifestError::UnknownAlias("gm.weight_child_last_recorded".to_string()))
        );
    }

    #[test]
    fn manifests_round_trip_through_toml_shape() {
        let json = serde_json::to_value(carry_forward()).expect("serialize");
        assert_eq!(json["kind"]["type"], "carry_forward");
        assert_eq!(json["kind"]["columns"][0]["merge"], "latest");
        let back: DomainManifest = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, carry_forward());
    }
}
