use crate::period::PeriodKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Bumped whenever the rendered plan text changes shape.
pub const PLAN_FINGERPRINT_VERSION: &str = "tally-plan-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub label: String,
    pub sql: String,
}

impl Statement {
    pub fn new(label: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            sql: sql.into(),
        }
    }
}

/// Query returning a single count of violating rows; any non-zero count is a
/// data-integrity fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub label: String,
    pub description: String,
    pub sql: String,
}

impl IntegrityCheck {
    pub fn new(
        label: impl Into<String>,
        description: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
            sql: sql.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    Execute(Statement),
    Check(IntegrityCheck),
}

impl PlanStep {
    pub fn label(&self) -> &str {
        match self {
            Self::Execute(statement) => &statement.label,
            Self::Check(check) => &check.label,
        }
    }

    pub fn sql(&self) -> &str {
        match self {
            Self::Execute(statement) => &statement.sql,
            Self::Check(check) => &check.sql,
        }
    }
}

/// Ordered statements for one (domain, period, strategy) job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPlan {
    pub domain: String,
    pub period: PeriodKey,
    pub strategy: String,
    pub staging_table: String,
    pub steps: Vec<PlanStep>,
}

impl JobPlan {
    pub fn new(
        domain: impl Into<String>,
        period: PeriodKey,
        strategy: impl Into<String>,
        staging_table: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            period,
            strategy: strategy.into(),
            staging_table: staging_table.into(),
            steps: Vec::new(),
        }
    }

    pub fn execute(&mut self, label: impl Into<String>, sql: impl Into<String>) {
        self.steps.push(PlanStep::Execute(Statement::new(label, sql)));
    }

    pub fn check(&mut self, check: IntegrityCheck) {
        self.steps.push(PlanStep::Check(check));
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = PlanStep>) {
        self.steps.extend(steps);
    }

    pub fn statement_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step, PlanStep::Execute(_)))
            .count()
    }

    /// Stable text form used for review and golden comparison.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "-- domain: {}", self.domain);
        let _ = writeln!(out, "-- period: {}", self.period);
        let _ = writeln!(out, "-- strategy: {}", self.strategy);
        let _ = writeln!(out, "-- staging: {}", self.staging_table);
        for (index, step) in self.steps.iter().enumerate() {
            let kind = match step {
                PlanStep::Execute(_) => "execute",
                PlanStep::Check(_) => "check",
            };
            let _ = writeln!(out);
            let _ = writeln!(out, "-- [{:02}] {kind} {}", index + 1, step.label());
            if let PlanStep::Check(check) = step {
                let _ = writeln!(out, "-- expect 0: {}", check.description);
            }
            let _ = writeln!(out, "{};", step.sql().trim());
        }
        out
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(PLAN_FINGERPRINT_VERSION.as_bytes());
        hasher.update(b"|");
        hasher.update(self.render().as_bytes());
        let digest = hasher.finalize();
        let mut output = String::with_capacity(7 + digest.len() * 2);
        output.push_str("sha256:");
        for byte in digest {
            let _ = write!(output, "{byte:02x}");
        }
        output
    }
}
