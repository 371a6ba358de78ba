//! Shared contracts for the tally aggregation engine: calendar periods, the
//! administrative hierarchy, declarative domain manifests, eligibility
//! predicates, table naming and generated statement plans.

pub mod hierarchy;
pub mod manifest;
pub mod naming;
pub mod period;
pub mod plan;
pub mod predicate;

pub use hierarchy::{AggregationLevel, FacilityAncestry, HierarchyError, HierarchyNode, ALL_PLACEHOLDER};
pub use manifest::{
    ColumnDef, ColumnType, DomainKind, DomainManifest, ManifestError, MergePolicy, RollupRule,
    TableSchema,
};
pub use naming::{partition_name, quote_ident, sql_text, staging_name, NamingError};
pub use period::{Month, PeriodError, PeriodKey};
pub use plan::{IntegrityCheck, JobPlan, PlanStep, Statement};
pub use predicate::{ColumnRef, Eligibility, PredicateError};
