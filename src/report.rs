//! Lineage output: the record set, non-fatal warnings and per-statement
//! detail.

use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;
use serde::Serialize;

use crate::relation::LineageRecord;

/// A condition worth reporting that did not stop analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Sibling CTEs reference each other; the clause was resolved in
    /// declaration order.
    CteCycle { ctes: Vec<String> },
    /// Two sources of one FROM/JOIN list share an alias; the later one wins.
    DuplicateAlias { alias: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::CteCycle { ctes } => {
                write!(f, "CTE dependency cycle: {}", ctes.iter().join(" -> "))
            }
            Warning::DuplicateAlias { alias } => write!(f, "duplicate alias: {}", alias),
        }
    }
}

/// Deduplicated lineage of one or more queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LineageReport {
    pub records: BTreeSet<LineageRecord>,
    pub warnings: Vec<Warning>,
}

impl LineageReport {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One `db.schema.table.column` line per record, in presentation order.
    pub fn lines(&self) -> Vec<String> {
        self.records.iter().map(ToString::to_string).collect()
    }

    pub fn merge(&mut self, other: LineageReport) {
        self.records.extend(other.records);
        for warning in other.warnings {
            if !self.warnings.contains(&warning) {
                self.warnings.push(warning);
            }
        }
    }
}

/// Lineage of a single statement with its kind and source position.
#[derive(Debug, Clone, Serialize)]
pub struct StatementLineage {
    pub stmt_index: usize,
    pub stmt_type: String,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    #[serde(flatten)]
    pub report: LineageReport,
    pub statement: String,
}
