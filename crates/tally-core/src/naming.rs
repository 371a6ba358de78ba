use crate::hierarchy::AggregationLevel;
use crate::period::Month;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub const STAGING_PREFIX: &str = "tmp";
pub const CATALOG_TABLE: &str = "tally_partitions";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    #[error("invalid identifier {0:?}: use letters, digits and underscores, not starting with a digit")]
    InvalidIdentifier(String),
    #[error("identifier {0:?} is reserved")]
    Reserved(String),
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex")
    })
}

pub fn validate_identifier(name: &str) -> Result<(), NamingError> {
    if !identifier_pattern().is_match(name) {
        return Err(NamingError::InvalidIdentifier(name.to_string()));
    }
    if name.starts_with("sqlite_") || name == CATALOG_TABLE {
        return Err(NamingError::Reserved(name.to_string()));
    }
    Ok(())
}

/// Lower-cases and replaces anything outside `[a-z0-9_]` so that external ids
/// can be embedded in table names.
pub fn name_fragment(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|ch| {
            let lower = ch.to_ascii_lowercase();
            if lower.is_ascii_alphanumeric() || lower == '_' {
                lower
            } else {
                '_'
            }
        })
        .collect()
}

/// `{base}_{YYYY-MM-DD}[_{state}][_{level}]`
pub fn partition_name(
    base: &str,
    month: Month,
    state_id: Option<&str>,
    level: Option<AggregationLevel>,
) -> String {
    let mut name = format!("{base}_{}", month.as_ymd());
    if let Some(state) = state_id {
        name.push('_');
        name.push_str(&name_fragment(state));
    }
    if let Some(level) = level {
        name.push('_');
        name.push_str(&level.rank().to_string());
    }
    name
}

/// `tmp_{base}_{YYYY-MM-DD}[_{state}][_{suffix}]`
pub fn staging_name(
    base: &str,
    month: Month,
    state_id: Option<&str>,
    suffix: Option<&str>,
) -> String {
    let mut name = format!("{STAGING_PREFIX}_{}", partition_name(base, month, state_id, None));
    if let Some(suffix) = suffix.map(name_fragment).filter(|value| !value.is_empty()) {
        name.push('_');
        name.push_str(&suffix);
    }
    name
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn sql_text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
