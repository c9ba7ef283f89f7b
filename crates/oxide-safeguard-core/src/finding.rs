//! Validation findings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::revision::RevisionId;

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Halts only in strict mode.
    Warning,
    /// Always halts.
    Blocking,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Blocking => "blocking",
        })
    }
}

/// A single rule violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    /// Id of the rule that produced the finding.
    pub rule: String,
    /// Severity.
    pub severity: Severity,
    /// Revision the finding is about.
    pub revision: RevisionId,
    /// Index of the offending operation within the revision.
    pub operation: Option<usize>,
    /// Explanation.
    pub message: String,
}

impl ValidationFinding {
    /// Creates a finding about a whole revision.
    #[must_use]
    pub fn new(
        rule: impl Into<String>,
        severity: Severity,
        revision: &RevisionId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            severity,
            revision: revision.clone(),
            operation: None,
            message: message.into(),
        }
    }

    /// Points the finding at an operation.
    #[must_use]
    pub fn at(mut self, operation: usize) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Returns true if the finding halts the pipeline.
    #[must_use]
    pub fn halts(&self, strict: bool) -> bool {
        match self.severity {
            Severity::Blocking => true,
            Severity::Warning => strict,
            Severity::Info => false,
        }
    }
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.severity, self.rule, self.revision)?;
        if let Some(op) = self.operation {
            write!(f, "#{op}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Returns true if any finding halts the pipeline.
#[must_use]
pub fn halts(findings: &[ValidationFinding], strict: bool) -> bool {
    findings.iter().any(|f| f.halts(strict))
}
