//! Incremental monthly aggregation over a five-level administrative hierarchy.
//!
//! Every job follows the same shape: the Partition Manager provisions the
//! target period and a staging table, a strategy fills staging (carry-forward
//! merge, or leaf aggregation followed by rollups), and the Partition Manager
//! commits staging into the partitions in one transaction.

pub mod compare;
pub mod domains;
pub mod leaf;
pub mod merge;
pub mod pipeline;
pub mod rollup;
pub mod sql;
pub mod strategy;

use serde::{Deserialize, Serialize};
use tally_core::manifest::{DomainKind, DomainManifest, ManifestError};
use tally_core::period::{PeriodError, PeriodKey};
use tally_storage::StorageError;
use thiserror::Error;

pub use compare::{verify_equivalence, EquivalenceReport};
pub use domains::DomainCatalog;
pub use pipeline::{JobReport, JobSpec, Pipeline};
pub use strategy::{
    AggregationStrategy, DeploymentConfig, DistributedStrategy, SingleNodeStrategy, StrategyKind,
    StrategyRegistry,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration fault in {domain}: {reason}")]
    Configuration { domain: String, reason: String },
    #[error("data integrity fault in {domain}: {reason}")]
    DataIntegrity { domain: String, reason: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("period error: {0}")]
    Period(#[from] PeriodError),
}

impl EngineError {
    pub fn configuration(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            domain: domain.into(),
            reason: reason.into(),
        }
    }

    pub fn data_integrity(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            domain: domain.into(),
            reason: reason.into(),
        }
    }

    /// Faults fixed by changing the manifest, the job or the hierarchy ids.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::Manifest(_)
                | Self::Storage(StorageError::NameCollision { .. })
        )
    }

    /// Integrity faults raised by the engine or by the commit period check.
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Self::DataIntegrity { .. } | Self::Storage(StorageError::DataIntegrity(_))
        )
    }
}

/// A carry-forward domain visible to a facility domain under `alias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedDomain {
    pub alias: String,
    pub manifest: DomainManifest,
}

impl JoinedDomain {
    pub fn entity_column(&self) -> Option<&str> {
        match &self.manifest.kind {
            DomainKind::CarryForward(spec) => Some(&spec.entity_column),
            DomainKind::Facility(_) => None,
        }
    }
}

/// Everything a strategy needs to plan one job. Pure data: planning never
/// touches the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub manifest: DomainManifest,
    pub joins: Vec<JoinedDomain>,
    pub period: PeriodKey,
    pub staging_table: String,
    pub hierarchy_table: String,
    /// Fan-out values for the distributed strategy: supervisor ids for
    /// carry-forward domains, state ids for facility domains.
    pub shards: Vec<String>,
}
