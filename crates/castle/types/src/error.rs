//! Error types for castle-types.
//!
//! Loading a specification either succeeds completely or fails with a
//! [`ValidationError`] listing every problem found.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Section of the specification an issue was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Catalog {
    /// The `node` block.
    Node,
    /// The `components` catalog.
    Components,
    /// The `services` catalog.
    Services,
    /// The `jobs` catalog.
    Jobs,
}

impl fmt::Display for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Catalog::Node => write!(f, "node"),
            Catalog::Components => write!(f, "components"),
            Catalog::Services => write!(f, "services"),
            Catalog::Jobs => write!(f, "jobs"),
        }
    }
}

/// A single problem with one entry of the specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub catalog: Catalog,
    pub entry: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(catalog: Catalog, entry: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            catalog,
            entry: entry.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.catalog, self.entry, self.message)
    }
}

/// Errors produced while loading a specification.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The document is not well-formed YAML or does not match the schema.
    #[error("failed to parse specification: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document parsed but one or more entries are invalid.
    #[error("invalid specification: {}", join_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

impl ValidationError {
    /// Issues attached to this error, empty for parse failures.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            ValidationError::Parse(_) => &[],
            ValidationError::Invalid(issues) => issues,
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced while parsing a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} value {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u8,
        max: u8,
    },

    #[error("invalid {field} step {step:?}")]
    InvalidStep { field: &'static str, step: String },

    #[error("empty {field} range {start}-{end}")]
    EmptyRange {
        field: &'static str,
        start: u8,
        end: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_display_names_entry() {
        let issue = ValidationIssue::new(Catalog::Services, "notes", "port must be positive");
        assert_eq!(issue.to_string(), "services.notes: port must be positive");
    }

    #[test]
    fn test_invalid_error_lists_all_issues() {
        let err = ValidationError::Invalid(vec![
            ValidationIssue::new(Catalog::Services, "a", "first"),
            ValidationIssue::new(Catalog::Jobs, "b", "second"),
        ]);
        let text = err.to_string();
        assert!(text.contains("services.a: first"));
        assert!(text.contains("jobs.b: second"));
        assert_eq!(err.issues().len(), 2);
    }
}
