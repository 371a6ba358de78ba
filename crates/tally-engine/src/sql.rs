//! SQL fragments shared by the merge, leaf and rollup generators.

use crate::EngineError;
use std::collections::BTreeMap;
use tally_core::manifest::RegistrySpec;
use tally_core::naming::{quote_ident, sql_text};
use tally_core::period::Month;
use tally_core::predicate::{ColumnRef, Eligibility, REGISTRY_ALIAS};

/// Days per month used for age-in-months arithmetic.
pub const DAYS_PER_MONTH: f64 = 30.4;

const MAX_PREDICATE_DEPTH: usize = 32;

/// Literal boundaries of one month; generated SQL never reads the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthBounds {
    pub start: String,
    pub end: String,
    pub next_start: String,
    pub year_month: String,
}

impl MonthBounds {
    pub fn new(month: Month) -> Self {
        Self {
            start: sql_text(&month.as_ymd()),
            end: sql_text(&month.last_day().format("%Y-%m-%d").to_string()),
            next_start: sql_text(&month.next_start().format("%Y-%m-%d").to_string()),
            year_month: sql_text(&month.start().format("%Y-%m").to_string()),
        }
    }
}

pub fn column(alias: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(name))
}

pub fn column_ref(reference: &ColumnRef) -> String {
    column(&reference.alias, &reference.column)
}

pub fn number(value: f64) -> String {
    format!("{value}")
}

/// Slice of a fan-out: one listed value, or everything the list misses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shard {
    All,
    One(String),
    Remainder(Vec<String>),
}

impl Shard {
    pub fn label(&self) -> &str {
        match self {
            Self::All => "all",
            Self::One(value) => value,
            Self::Remainder(_) => "remainder",
        }
    }

    pub fn condition(&self, expr: &str) -> String {
        match self {
            Self::All => "1".to_string(),
            Self::One(value) => format!("{expr} = {}", sql_text(value)),
            Self::Remainder(listed) => {
                let listed = listed
                    .iter()
                    .map(|value| sql_text(value))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({expr} IS NULL OR {expr} NOT IN ({listed}))")
            }
        }
    }
}

/// One shard per value plus a remainder shard; an empty list yields `All`.
pub fn shards(values: &[String]) -> Vec<Shard> {
    if values.is_empty() {
        return vec![Shard::All];
    }
    let mut out: Vec<Shard> = values.iter().cloned().map(Shard::One).collect();
    out.push(Shard::Remainder(values.to_vec()));
    out
}

/// Compiles eligibility predicates to 0/1 SQL expressions over the registry
/// alias `r` and joined-domain aliases.
pub struct PredicateCompiler<'a> {
    registry: &'a RegistrySpec,
    named: &'a BTreeMap<String, Eligibility>,
    bounds: &'a MonthBounds,
    domain: &'a str,
}

impl<'a> PredicateCompiler<'a> {
    pub fn new(
        domain: &'a str,
        registry: &'a RegistrySpec,
        named: &'a BTreeMap<String, Eligibility>,
        bounds: &'a MonthBounds,
    ) -> Self {
        Self {
            registry,
            named,
            bounds,
            domain,
        }
    }

    pub fn compile(&self, predicate: &Eligibility) -> Result<String, EngineError> {
        self.compile_at(predicate, 0)
    }

    pub fn compile_optional(&self, predicate: Option<&Eligibility>) -> Result<String, EngineError> {
        match predicate {
            Some(predicate) => self.compile(predicate),
            None => Ok("1".to_string()),
        }
    }

    fn registry_column(&self, name: &str) -> String {
        column(REGISTRY_ALIAS, name)
    }

    /// `julianday(E) - julianday(dob)`: age in days at month end.
    pub fn age_days_at_end(&self) -> String {
        format!(
            "(julianday({}) - julianday(date({})))",
            self.bounds.end,
            self.registry_column(&self.registry.dob_column)
        )
    }

    pub fn age_months_at_start(&self) -> String {
        format!(
            "((julianday({}) - julianday(date({}))) / {})",
            self.bounds.start,
            self.registry_column(&self.registry.dob_column),
            number(DAYS_PER_MONTH)
        )
    }

    pub fn age_months_at_end(&self) -> String {
        format!("({} / {})", self.age_days_at_end(), number(DAYS_PER_MONTH))
    }

    fn compile_at(&self, predicate: &Eligibility, depth: usize) -> Result<String, EngineError> {
        if depth > MAX_PREDICATE_DEPTH {
            return Err(EngineError::configuration(
                self.domain,
                "predicate nesting is too deep",
            ));
        }
        let bounds = self.bounds;
        let sql = match predicate {
            Eligibility::All { of } => self.join(of, " AND ", "1", depth)?,
            Eligibility::Any { of } => self.join(of, " OR ", "0", depth)?,
            Eligibility::Not { of } => format!("(NOT {})", self.compile_at(of, depth + 1)?),
            Eligibility::OpenInMonth => {
                let opened = self.registry_column(&self.registry.opened_column);
                let closed = self.registry_column(&self.registry.closed_column);
                format!(
                    "COALESCE(julianday({}) - julianday(date({opened})) >= 0 AND ({closed} IS NULL OR julianday(date({closed})) - julianday({}) > 0), 0)",
                    bounds.end, bounds.start
                )
            }
            Eligibility::AliveInMonth => {
                let death = self.registry_column(&self.registry.death_column);
                format!(
                    "COALESCE({death} IS NULL OR julianday(date({death})) - julianday({}) >= 0, 0)",
                    bounds.start
                )
            }
            Eligibility::NotMigrated => format!(
                "({} IS NOT 1)",
                self.registry_column(&self.registry.migrated_column)
            ),
            Eligibility::Registered => format!(
                "({} IS NOT 0)",
                self.registry_column(&self.registry.registered_column)
            ),
            Eligibility::BornInMonth => format!(
                "COALESCE(date({}) BETWEEN {} AND {}, 0)",
                self.registry_column(&self.registry.dob_column),
                bounds.start,
                bounds.end
            ),
            Eligibility::AgeMonths { over, up_to } => {
                let mut parts = Vec::new();
                if let Some(over) = over {
                    parts.push(format!("{} > {}", self.age_months_at_end(), number(*over)));
                }
                if let Some(up_to) = up_to {
                    parts.push(format!("{} <= {}", self.age_months_at_start(), number(*up_to)));
                }
                if parts.is_empty() {
                    "1".to_string()
                } else {
                    format!("COALESCE({}, 0)", parts.join(" AND "))
                }
            }
            Eligibility::RecordedInMonth { column } => format!(
                "COALESCE(strftime('%Y-%m', {}) = {}, 0)",
                column_ref(column),
                bounds.year_month
            ),
            Eligibility::InSet { column, values } => {
                if values.is_empty() {
                    "0".to_string()
                } else {
                    let listed = values
                        .iter()
                        .map(|value| value.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("COALESCE({} IN ({listed}), 0)", column_ref(column))
                }
            }
            Eligibility::Ref { name } => {
                let Some(named) = self.named.get(name) else {
                    return Err(EngineError::configuration(
                        self.domain,
                        format!("unknown predicate {name}"),
                    ));
                };
                self.compile_at(named, depth + 1)?
            }
        };
        Ok(sql)
    }

    fn join(
        &self,
        parts: &[Eligibility],
        separator: &str,
        empty: &str,
        depth: usize,
    ) -> Result<String, EngineError> {
        if parts.is_empty() {
            return Ok(empty.to_string());
        }
        let compiled = parts
            .iter()
            .map(|part| self.compile_at(part, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", compiled.join(separator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RegistrySpec {
        serde_json::from_str(r#"{"table":"child_registry","entity_column":"case_id"}"#)
            .expect("registry")
    }

    #[test]
    fn month_bounds_are_literal_dates() {
        let bounds = MonthBounds::new("2020-02".parse().expect("month"));
        assert_eq!(bounds.start, "'2020-02-01'");
        assert_eq!(bounds.end, "'2020-02-29'");
        assert_eq!(bounds.next_start, "'2020-03-01'");
        assert_eq!(bounds.year_month, "'2020-02'");
    }

    #[test]
    fn shards_cover_listed_and_remaining_values() {
        let all = shards(&["st1".to_string(), "st2".to_string()]);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].condition("\"h\".\"state_id\""), "\"h\".\"state_id\" = 'st1'");
        assert_eq!(all[2].label(), "remainder");
        assert!(all[2].condition("x").contains("NOT IN ('st1', 'st2')"));
        assert_eq!(shards(&[]), vec![Shard::All]);
        assert_eq!(Shard::All.condition("x"), "1");
    }

    #[test]
    fn predicates_compile_with_month_boundaries() {
        let registry = registry();
        let mut named = BTreeMap::new();
        named.insert(
            "valid".to_string(),
            Eligibility::all(vec![Eligibility::OpenInMonth, Eligibility::age(None, Some(72.0))]),
        );
        let bounds = MonthBounds::new("2019-01".parse().expect("month"));
        let compiler = PredicateCompiler::new("child-nutrition", &registry, &named, &bounds);

        let sql = compiler
            .compile(&Eligibility::all(vec![
                Eligibility::named("valid"),
                Eligibility::negate(Eligibility::NotMigrated),
            ]))
            .expect("compile");
        assert!(sql.contains("julianday('2019-01-31') - julianday(date(\"r\".\"opened_on\")) >= 0"));
        assert!(sql.contains("/ 30.4) <= 72"));
        assert!(sql.contains("(NOT (\"r\".\"is_migrated\" IS NOT 1))"));

        let err = compiler
            .compile(&Eligibility::named("missing"))
            .expect_err("unknown ref");
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[test]
    fn empty_compositions_have_identity_values() {
        let registry = registry();
        let named = BTreeMap::new();
        let bounds = MonthBounds::new("2019-01".parse().expect("month"));
        let compiler = PredicateCompiler::new("d", &registry, &named, &bounds);
        assert_eq!(compiler.compile(&Eligibility::all(vec![])).expect("all"), "1");
        assert_eq!(compiler.compile(&Eligibility::any(vec![])).expect("any"), "0");
        assert_eq!(
            compiler
                .compile(&Eligibility::in_set(ColumnRef::new("gm", "grade"), vec![]))
                .expect("in_set"),
            "0"
        );
    }
}
