use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Alias under which the dimension registry is visible to predicates and measures.
pub const REGISTRY_ALIAS: &str = "r";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredicateError {
    #[error("invalid column reference {0:?}: expected alias.column")]
    InvalidColumnRef(String),
    #[error("unknown predicate {0:?}")]
    UnknownPredicate(String),
    #[error("predicate {0:?} refers to itself")]
    Cycle(String),
    #[error("age bounds are empty: over {over} is not below up_to {up_to}")]
    EmptyAgeWindow { over: String, up_to: String },
}

/// `alias.column` reference into the registry (`r`) or a joined domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            column: column.into(),
        }
    }

    pub fn registry(column: impl Into<String>) -> Self {
        Self::new(REGISTRY_ALIAS, column)
    }

    pub fn is_registry(&self) -> bool {
        self.alias == REGISTRY_ALIAS
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

impl FromStr for ColumnRef {
    type Err = PredicateError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((alias, column)) = input.trim().split_once('.') else {
            return Err(PredicateError::InvalidColumnRef(input.to_string()));
        };
        if alias.is_empty() || column.is_empty() || column.contains('.') {
            return Err(PredicateError::InvalidColumnRef(input.to_string()));
        }
        Ok(Self::new(alias, column))
    }
}

impl TryFrom<String> for ColumnRef {
    type Error = PredicateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnRef> for String {
    fn from(value: ColumnRef) -> Self {
        value.to_string()
    }
}

/// Eligibility expression evaluated per registry entity as of a given month.
///
/// Every primitive is evaluated against literal month boundaries so that
/// reprocessing a past month never depends on the wall clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Eligibility {
    All { of: Vec<Eligibility> },
    Any { of: Vec<Eligibility> },
    Not { of: Box<Eligibility> },
    /// Opened on or before month end and not closed before month start.
    OpenInMonth,
    /// No death date before month start.
    AliveInMonth,
    NotMigrated,
    Registered,
    BornInMonth,
    /// `over`: age at month end is strictly greater; `up_to`: age at month start
    /// is less than or equal.
    AgeMonths {
        #[serde(default)]
        over: Option<f64>,
        #[serde(default)]
        up_to: Option<f64>,
    },
    RecordedInMonth { column: ColumnRef },
    InSet { column: ColumnRef, values: Vec<i64> },
    Ref { name: String },
}

impl Eligibility {
    pub fn all(of: Vec<Eligibility>) -> Self {
        Self::All { of }
    }

    pub fn any(of: Vec<Eligibility>) -> Self {
        Self::Any { of }
    }

    pub fn negate(of: Eligibility) -> Self {
        Self::Not { of: Box::new(of) }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Ref { name: name.into() }
    }

    pub fn age(over: Option<f64>, up_to: Option<f64>) -> Self {
        Self::AgeMonths { over, up_to }
    }

    pub fn recorded_in_month(column: ColumnRef) -> Self {
        Self::RecordedInMonth { column }
    }

    pub fn in_set(column: ColumnRef, values: Vec<i64>) -> Self {
        Self::InSet { column, values }
    }

    pub fn referenced_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.visit(&mut |node| {
            if let Eligibility::Ref { name } = node {
                names.insert(name.clone());
            }
        });
        names
    }

    pub fn column_refs(&self) -> BTreeSet<ColumnRef> {
        let mut refs = BTreeSet::new();
        self.visit(&mut |node| match node {
            Eligibility::RecordedInMonth { column } | Eligibility::InSet { column, .. } => {
                refs.insert(column.clone());
            }
            _ => {}
        });
        refs
    }

    fn visit<F: FnMut(&Eligibility)>(&self, visitor: &mut F) {
        visitor(self);
        match self {
            Eligibility::All { of } | Eligibility::Any { of } => {
                for child in of {
                    child.visit(visitor);
                }
            }
            Eligibility::Not { of } => of.visit(visitor),
            _ => {}
        }
    }

    fn check_local(&self) -> Result<(), PredicateError> {
        let mut result = Ok(());
        self.visit(&mut |node| {
            if let Eligibility::AgeMonths {
                over: Some(over),
                up_to: Some(up_to),
            } = node
            {
                if over >= up_to && result.is_ok() {
                    result = Err(PredicateError::EmptyAgeWindow {
                        over: over.to_string(),
                        up_to: up_to.to_string(),
                    });
                }
            }
        });
        result
    }
}

/// Verifies that every `ref` resolves and that named predicates do not form a cycle.
pub fn check_named_predicates(
    named: &BTreeMap<String, Eligibility>,
    roots: &[&Eligibility],
) -> Result<(), PredicateError> {
    for predicate in named.values().chain(roots.iter().copied()) {
        predicate.check_local()?;
        for name in predicate.referenced_names() {
            if !named.contains_key(&name) {
                return Err(PredicateError::UnknownPredicate(name));
            }
        }
    }

    for name in named.keys() {
        let mut path = Vec::new();
        detect_cycle(name, named, &mut path)?;
    }

    Ok(())
}

fn detect_cycle(
    name: &str,
    named: &BTreeMap<String, Eligibility>,
    path: &mut Vec<String>,
) -> Result<(), PredicateError> {
    if path.iter().any(|seen| seen == name) {
        return Err(PredicateError::Cycle(name.to_string()));
    }
    let Some(predicate) = named.get(name) else {
        return Err(PredicateError::UnknownPredicate(name.to_string()));
    };
    path.push(name.to_string());
    for child in predicate.referenced_names() {
        detect_cycle(&child, named, path)?;
    }
    path.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_refs_parse_alias_and_column() {
        let parsed: ColumnRef = "gm.weight_child".parse().expect("parse");
        assert_eq!(parsed, ColumnRef::new("gm", "weight_child"));
        assert!("weight_child".parse::<ColumnRef>().is_err());
        assert!("a.b.c".parse::<ColumnRef>().is_err());
        assert!(ColumnRef::registry("dob").is_registry());
    }

    #[test]
    fn predicates_deserialize_from_tagged_json() {
        let json = r#"{"op":"all","of":[{"op":"open_in_month"},{"op":"age_months","up_to":72},{"op":"ref","name":"seeking"}]}"#;
        let parsed: Eligibility = serde_json::from_str(json).expect("parse");
        assert_eq!(
            parsed,
            Eligibility::all(vec![
                Eligibility::OpenInMonth,
                Eligibility::age(None, Some(72.0)),
                Eligibility::named("seeking"),
            ])
        );
        assert_eq!(
            parsed.referenced_names().into_iter().collect::<Vec<_>>(),
            vec!["seeking".to_string()]
        );
    }

    #[test]
    fn named_predicate_checks_catch_unknown_and_cycles() {
        let mut named = BTreeMap::new();
        named.insert("a".to_string(), Eligibility::named("b"));
        named.insert("b".to_string(), Eligibility::OpenInMonth);
        assert!(check_named_predicates(&named, &[]).is_ok());

        let missing = Eligibility::named("zzz");
        assert_eq!(
            check_named_predicates(&named, &[&missing]),
            Err(PredicateError::UnknownPredicate("zzz".to_string()))
        );

        named.insert("b".to_string(), Eligibility::named("a"));
        assert!(matches!(
            check_named_predicates(&named, &[]),
            Err(PredicateError::Cycle(_))
        ));
    }

    #[test]
    fn empty_age_window_is_rejected() {
        let named = BTreeMap::new();
        let empty = Eligibility::age(Some(24.0), Some(6.0));
        assert!(matches!(
            check_named_predicates(&named, &[&empty]),
            Err(PredicateError::EmptyAgeWindow { .. })
        ));
    }

    #[test]
    fn column_refs_are_collected_through_nesting() {
        let predicate = Eligibility::all(vec![
            Eligibility::negate(Eligibility::recorded_in_month(ColumnRef::new(
                "gm",
                "weight_child_last_recorded",
            ))),
            Eligibility::in_set(ColumnRef::new("gm", "zscore_grading_wfa"), vec![1]),
        ]);
        assert_eq!(predicate.column_refs().len(), 2);
    }
}
