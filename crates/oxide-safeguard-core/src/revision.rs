//! Revisions: immutable, ordered units of schema change.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::operations::{Operation, RiskClass, SchemaTarget};

/// Identifier of a revision, e.g. `0003_add_email`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    /// Creates a revision id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RevisionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A post-apply invariant check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Probe {
    /// The table must exist.
    TableExists {
        /// Table name.
        table: String,
    },
    /// The column must exist.
    ColumnExists {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// The index must exist.
    IndexExists {
        /// Index name.
        name: String,
    },
    /// The table's row count must fall within bounds.
    RowCount {
        /// Table name.
        table: String,
        /// Inclusive lower bound.
        #[serde(default)]
        min: Option<u64>,
        /// Inclusive upper bound.
        #[serde(default)]
        max: Option<u64>,
    },
    /// The statement must prepare and yield its first row without error.
    Query {
        /// Probe label used in reports.
        name: String,
        /// Read-only statement.
        sql: String,
    },
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableExists { table } => write!(f, "table_exists({table})"),
            Self::ColumnExists { table, column } => write!(f, "column_exists({table}.{column})"),
            Self::IndexExists { name } => write!(f, "index_exists({name})"),
            Self::RowCount { table, min, max } => {
                write!(f, "row_count({table}")?;
                if let Some(min) = min {
                    write!(f, ", min={min}")?;
                }
                if let Some(max) = max {
                    write!(f, ", max={max}")?;
                }
                f.write_str(")")
            }
            Self::Query { name, .. } => write!(f, "query({name})"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A revision as declared in a revision file.
///
/// The checksum covers the operation list only and is computed once when
/// the revision joins a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Revision identifier.
    pub id: RevisionId,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Parent revisions; more than one makes this a merge point.
    #[serde(default)]
    pub parents: Vec<RevisionId>,
    /// Whether the revision's statements may share one transaction.
    #[serde(default = "default_true")]
    pub transactional: bool,
    /// Tables and columns this revision marks for later removal.
    #[serde(default)]
    pub deprecates: Vec<SchemaTarget>,
    /// Rule ids whose non-blocking findings the author acknowledges.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Ordered operations.
    #[serde(default, rename = "operation")]
    pub operations: Vec<Operation>,
    /// Explicit reverse operations, replacing the derived ones.
    #[serde(default)]
    pub reverse: Option<Vec<Operation>>,
    /// Invariants that must hold once the revision is applied.
    #[serde(default)]
    pub expect: Vec<Probe>,
    #[serde(skip)]
    checksum: String,
}

impl Revision {
    /// Creates an empty root revision.
    #[must_use]
    pub fn new(id: impl Into<RevisionId>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            parents: Vec::new(),
            transactional: true,
            deprecates: Vec::new(),
            allow: Vec::new(),
            operations: Vec::new(),
            reverse: None,
            expect: Vec::new(),
            checksum: String::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a parent.
    #[must_use]
    pub fn parent(mut self, parent: impl Into<RevisionId>) -> Self {
        self.parents.push(parent.into());
        self
    }

    /// Adds an operation.
    #[must_use]
    pub fn operation(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    /// Marks a table or column as deprecated.
    #[must_use]
    pub fn deprecate(mut self, target: SchemaTarget) -> Self {
        self.deprecates.push(target);
        self
    }

    /// Sets the explicit reverse operations.
    #[must_use]
    pub fn reverse_with(mut self, operations: Vec<Operation>) -> Self {
        self.reverse = Some(operations);
        self
    }

    /// Adds a post-apply probe.
    #[must_use]
    pub fn expect(mut self, probe: Probe) -> Self {
        self.expect.push(probe);
        self
    }

    /// Computes and stores the checksum of the operation list.
    pub fn seal(&mut self) -> Result<(), serde_json::Error> {
        self.checksum = operations_checksum(&self.operations)?;
        Ok(())
    }

    /// Returns the checksum computed by [`Revision::seal`].
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Returns the operations undoing this revision, newest first.
    ///
    /// Uses the explicit `reverse` list when present, otherwise derives one
    /// from the operations. Returns `None` if any operation has no inverse.
    #[must_use]
    pub fn reverse_operations(&self) -> Option<Vec<Operation>> {
        if let Some(reverse) = &self.reverse {
            return Some(reverse.clone());
        }
        self.operations
            .iter()
            .rev()
            .map(Operation::reverse)
            .collect()
    }

    /// Returns true if the revision can be undone without a restore.
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.reverse_operations().is_some()
    }

    /// Returns true if any statement must run outside a transaction.
    #[must_use]
    pub fn is_non_transactional(&self) -> bool {
        !self.transactional || self.operations.iter().any(|op| !op.is_transactional())
    }

    /// Returns the distinct risk classes of the operations.
    #[must_use]
    pub fn risks(&self) -> Vec<RiskClass> {
        let mut risks: Vec<RiskClass> = self.operations.iter().map(Operation::risk_class).collect();
        risks.sort();
        risks.dedup();
        risks
    }

    /// Returns true if the revision has a raw statement whose schema effect
    /// the replay engine cannot know.
    #[must_use]
    pub fn is_opaque(&self) -> bool {
        self.operations.iter().any(Operation::is_schema_opaque)
    }
}

/// SHA-256 hex of the JSON encoding of an operation list.
pub fn operations_checksum(operations: &[Operation]) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(operations)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, SqlType};

    const REVISION: &str = r#"
id = "0002_add_email"
description = "Add email to users"
parents = ["0001_initial"]
deprecates = ["users.nickname"]

[[operation]]
kind = "add_column"
table = "users"
column = { name = "email", type = "varchar(255)" }

[[operation]]
kind = "raw_statement"
sql = "UPDATE users SET email = '' WHERE email IS NULL"

[[expect]]
kind = "column_exists"
table = "users"
column = "email"
"#;

    #[test]
    fn test_parse_revision_file() {
        let rev: Revision = toml::from_str(REVISION).unwrap();
        assert_eq!(rev.id, RevisionId::from("0002_add_email"));
        assert_eq!(rev.parents, vec![RevisionId::from("0001_initial")]);
        assert_eq!(rev.operations.len(), 2);
        assert!(rev.transactional);
        assert_eq!(rev.deprecates, vec![SchemaTarget::column("users", "nickname")]);
        assert_eq!(rev.expect.len(), 1);
        assert!(rev.checksum().is_empty());
    }

    #[test]
    fn test_checksum_depends_on_operations_only() {
        let mut a: Revision = toml::from_str(REVISION).unwrap();
        let mut b = a.clone().description("something else");
        a.seal().unwrap();
        b.seal().unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);

        let mut c = a.clone().operation(Operation::drop_column("users", "nickname"));
        c.seal().unwrap();
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn test_derived_reverse_operations() {
        let rev = Revision::new("0001")
            .operation(Operation::add_table(
                "users",
                vec![ColumnSchema::new("id", SqlType::Integer).primary_key()],
            ))
            .operation(Operation::add_column(
                "users",
                ColumnSchema::new("email", SqlType::Text),
            ));

        let reverse = rev.reverse_operations().unwrap();
        assert_eq!(
            reverse,
            vec![
                Operation::drop_column("users", "email"),
                Operation::drop_table("users")
            ]
        );
    }

    #[test]
    fn test_explicit_reverse_overrides_derivation() {
        let rev = Revision::new("0003")
            .operation(Operation::drop_column("users", "nickname"))
            .reverse_with(vec![Operation::add_column(
                "users",
                ColumnSchema::new("nickname", SqlType::Text),
            )]);
        assert!(rev.is_reversible());

        let rev = Revision::new("0003").operation(Operation::drop_column("users", "nickname"));
        assert!(!rev.is_reversible());
    }

    #[test]
    fn test_non_transactional_detection() {
        let rev = Revision::new("0004").operation(Operation::raw("VACUUM", None));
        assert!(rev.is_non_transactional());

        let mut rev = Revision::new("0005");
        rev.transactional = false;
        assert!(rev.is_non_transactional());
    }
}
