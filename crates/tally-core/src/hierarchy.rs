use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Placeholder location/dimension value for rows above the granularity that
/// still distinguishes the attribute.
pub const ALL_PLACEHOLDER: &str = "All";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("unknown aggregation level {0}")]
    UnknownLevel(String),
    #[error("facility {0} appears more than once in the hierarchy directory")]
    DuplicateFacility(String),
    #[error("{level} {node_id} has conflicting parents {first} and {second}")]
    ConflictingParent {
        level: AggregationLevel,
        node_id: String,
        first: String,
        second: String,
    },
    #[error("{level} {node_id} has conflicting is-test flags")]
    ConflictingTestFlag {
        level: AggregationLevel,
        node_id: String,
    },
    #[error("facility {facility_id} has an empty {level} id")]
    EmptyAncestor {
        facility_id: String,
        level: AggregationLevel,
    },
}

/// Rank in the administrative hierarchy: 1 = state (root) … 5 = facility (leaf).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationLevel {
    State = 1,
    District = 2,
    Block = 3,
    Supervisor = 4,
    Facility = 5,
}

impl AggregationLevel {
    /// Coarsest first.
    pub const ALL: [AggregationLevel; 5] = [
        AggregationLevel::State,
        AggregationLevel::District,
        AggregationLevel::Block,
        AggregationLevel::Supervisor,
        AggregationLevel::Facility,
    ];

    pub const LEAF: AggregationLevel = AggregationLevel::Facility;

    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(Self::State),
            2 => Some(Self::District),
            3 => Some(Self::Block),
            4 => Some(Self::Supervisor),
            5 => Some(Self::Facility),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::District => "district",
            Self::Block => "block",
            Self::Supervisor => "supervisor",
            Self::Facility => "facility",
        }
    }

    pub fn id_column(self) -> &'static str {
        match self {
            Self::State => "state_id",
            Self::District => "district_id",
            Self::Block => "block_id",
            Self::Supervisor => "supervisor_id",
            Self::Facility => "facility_id",
        }
    }

    pub fn is_test_column(self) -> &'static str {
        match self {
            Self::State => "state_is_test",
            Self::District => "district_is_test",
            Self::Block => "block_is_test",
            Self::Supervisor => "supervisor_is_test",
            Self::Facility => "facility_is_test",
        }
    }

    /// Next level towards the leaves, `None` at the facility level.
    pub fn finer(self) -> Option<Self> {
        Self::from_rank(self.rank() + 1)
    }

    /// Next level towards the root, `None` at the state level.
    pub fn coarser(self) -> Option<Self> {
        self.rank().checked_sub(1).and_then(Self::from_rank)
    }

    /// Levels this level still distinguishes, coarsest first (inclusive).
    pub fn retained(self) -> impl Iterator<Item = AggregationLevel> {
        Self::ALL.into_iter().filter(move |level| *level <= self)
    }

    /// Rollup targets in execution order: 4, 3, 2, 1.
    pub fn rollup_targets() -> [AggregationLevel; 4] {
        [
            AggregationLevel::Supervisor,
            AggregationLevel::Block,
            AggregationLevel::District,
            AggregationLevel::State,
        ]
    }
}

impl fmt::Display for AggregationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationLevel {
    type Err = HierarchyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        if let Ok(rank) = normalized.parse::<u8>() {
            return Self::from_rank(rank).ok_or(HierarchyError::UnknownLevel(normalized));
        }
        match normalized.as_str() {
            "state" => Ok(Self::State),
            "district" => Ok(Self::District),
            "block" => Ok(Self::Block),
            "supervisor" => Ok(Self::Supervisor),
            "facility" | "awc" => Ok(Self::Facility),
            other => Err(HierarchyError::UnknownLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub node_id: String,
    pub level: AggregationLevel,
    pub parent_id: Option<String>,
    pub is_test: bool,
}

/// One row of the denormalised hierarchy directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityAncestry {
    pub facility_id: String,
    pub supervisor_id: String,
    pub block_id: String,
    pub district_id: String,
    pub state_id: String,
    #[serde(default)]
    pub facility_is_test: bool,
    #[serde(default)]
    pub supervisor_is_test: bool,
    #[serde(default)]
    pub block_is_test: bool,
    #[serde(default)]
    pub district_is_test: bool,
    #[serde(default)]
    pub state_is_test: bool,
}

impl FacilityAncestry {
    pub fn id_at(&self, level: AggregationLevel) -> &str {
        match level {
            AggregationLevel::State => &self.state_id,
            AggregationLevel::District => &self.district_id,
            AggregationLevel::Block => &self.block_id,
            AggregationLevel::Supervisor => &self.supervisor_id,
            AggregationLevel::Facility => &self.facility_id,
        }
    }

    pub fn is_test_at(&self, level: AggregationLevel) -> bool {
        match level {
            AggregationLevel::State => self.state_is_test,
            AggregationLevel::District => self.district_is_test,
            AggregationLevel::Block => self.block_is_test,
            AggregationLevel::Supervisor => self.supervisor_is_test,
            AggregationLevel::Facility => self.facility_is_test,
        }
    }

    /// The five ancestor nodes, root first.
    pub fn nodes(&self) -> Vec<HierarchyNode> {
        AggregationLevel::ALL
            .into_iter()
            .map(|level| HierarchyNode {
                node_id: self.id_at(level).to_string(),
                level,
                parent_id: level.coarser().map(|parent| self.id_at(parent).to_string()),
                is_test: self.is_test_at(level),
            })
            .collect()
    }
}

/// Checks that the directory describes a tree: unique facilities, one parent per
/// node and one is-test flag per node.
pub fn validate_directory(rows: &[FacilityAncestry]) -> Result<(), HierarchyError> {
    let mut facilities = BTreeMap::<&str, ()>::new();
    let mut nodes = BTreeMap::<(AggregationLevel, String), (Option<String>, bool)>::new();

    for row in rows {
        if facilities.insert(row.facility_id.as_str(), ()).is_some() {
            return Err(HierarchyError::DuplicateFacility(row.facility_id.clone()));
        }
        for node in row.nodes() {
            if node.node_id.trim().is_empty() {
                return Err(HierarchyError::EmptyAncestor {
                    facility_id: row.facility_id.clone(),
                    level: node.level,
                });
            }
            let key = (node.level, node.node_id.clone());
            match nodes.get(&key) {
                None => {
                    nodes.insert(key, (node.parent_id.clone(), node.is_test));
                }
                Some((parent, is_test)) => {
                    if parent != &node.parent_id {
                        return Err(HierarchyError::ConflictingParent {
                            level: node.level,
                            node_id: node.node_id,
                            first: parent.clone().unwrap_or_default(),
                            second: node.parent_id.unwrap_or_default(),
                        });
                    }
                    if *is_test != node.is_test {
                        return Err(HierarchyError::ConflictingTestFlag {
                            level: node.level,
                            node_id: node.node_id,
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facility(id: &str, supervisor: &str) -> FacilityAncestry {
        FacilityAncestry {
            facility_id: id.to_string(),
            supervisor_id: supervisor.to_string(),
            block_id: "b1".to_string(),
            district_id: "d1".to_string(),
            state_id: "s1".to_string(),
            facility_is_test: false,
            supervisor_is_test: false,
            block_is_test: false,
            district_is_test: false,
            state_is_test: false,
        }
    }

    #[test]
    fn level_navigation_is_consistent() {
        assert_eq!(AggregationLevel::Facility.coarser(), Some(AggregationLevel::Supervisor));
        assert_eq!(AggregationLevel::State.coarser(), None);
        assert_eq!(AggregationLevel::Facility.finer(), None);
        assert_eq!(
            AggregationLevel::Block.retained().collect::<Vec<_>>(),
            vec![
                AggregationLevel::State,
                AggregationLevel::District,
                AggregationLevel::Block
            ]
        );
        assert_eq!("4".parse::<AggregationLevel>(), Ok(AggregationLevel::Supervisor));
        assert_eq!("awc".parse::<AggregationLevel>(), Ok(AggregationLevel::Facility));
        assert!("6".parse::<AggregationLevel>().is_err());
    }

    #[test]
    fn nodes_chain_parents_to_root() {
        let nodes = facility("f1", "sup1").nodes();
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0].parent_id, None);
        assert_eq!(nodes[4].node_id, "f1");
        assert_eq!(nodes[4].parent_id.as_deref(), Some("sup1"));
    }

    #[test]
    fn directory_validation_rejects_conflicts() {
        let ok = vec![facility("f1", "sup1"), facility("f2", "sup1")];
        assert!(validate_directory(&ok).is_ok());

        let duplicate = vec![facility("f1", "sup1"), facility("f1", "sup2")];
        assert_eq!(
            validate_directory(&duplicate),
            Err(HierarchyError::DuplicateFacility("f1".to_string()))
        );

        let mut moved = facility("f2", "sup1");
        moved.block_id = "b2".to_string();
        assert!(matches!(
            validate_directory(&[facility("f1", "sup1"), moved]),
            Err(HierarchyError::ConflictingParent { .. })
        ));

        let mut flagged = facility("f2", "sup1");
        flagged.supervisor_is_test = true;
        assert!(matches!(
            validate_directory(&[facility("f1", "sup1"), flagged]),
            Err(HierarchyError::ConflictingTestFlag { .. })
        ));
    }
}
