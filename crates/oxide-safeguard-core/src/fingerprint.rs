//! Canonical schema shape and fingerprints.
//!
//! Both a live database and a replayed revision path reduce to a
//! [`CanonicalSchema`], so the two compare directly. The fingerprint is the
//! SHA-256 of the canonical rendering.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dialect::MigrationDialect;
use crate::schema::DatabaseSchema;

/// Table name prefixes left out of every fingerprint.
pub const INTERNAL_TABLE_PREFIXES: &[&str] = &["safeguard_", "sqlite_"];

/// Returns true for orchestrator bookkeeping and engine-internal tables.
#[must_use]
pub fn is_internal_table(name: &str) -> bool {
    INTERNAL_TABLE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Normalizes a declared column type.
#[must_use]
pub fn normalize_type(declared: &str) -> String {
    declared
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Canonical column shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalColumn {
    /// Normalized type name.
    pub sql_type: String,
    /// NOT NULL, including primary key columns.
    pub not_null: bool,
    /// Part of the primary key.
    pub primary_key: bool,
}

/// Canonical index shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalIndex {
    /// Unique index.
    pub unique: bool,
    /// Indexed columns in key order.
    pub columns: Vec<String>,
}

/// Canonical foreign key shape. Constraint names are not observable in
/// every engine and are left out.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalForeignKey {
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub references_table: String,
    /// Referenced columns.
    pub references_columns: Vec<String>,
}

/// Canonical table shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalTable {
    /// Columns by name.
    pub columns: BTreeMap<String, CanonicalColumn>,
    /// Explicitly created indexes by name.
    pub indexes: BTreeMap<String, CanonicalIndex>,
    /// Foreign keys.
    pub foreign_keys: BTreeSet<CanonicalForeignKey>,
}

/// Ordered, engine-neutral description of a schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSchema {
    /// Tables by name.
    pub tables: BTreeMap<String, CanonicalTable>,
}

impl CanonicalSchema {
    /// Creates an empty canonical schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduces a replayed schema to its canonical form, using the
    /// dialect's type names.
    ///
    /// Returns `None` if a table's shape is unknown.
    #[must_use]
    pub fn from_schema(schema: &DatabaseSchema, dialect: &dyn MigrationDialect) -> Option<Self> {
        let mut canonical = Self::new();
        for table in &schema.tables {
            if is_internal_table(&table.name) {
                continue;
            }
            if table.opaque {
                return None;
            }

            let mut out = CanonicalTable::default();
            for column in &table.columns {
                let primary_key = column.primary_key || table.primary_key.contains(&column.name);
                out.columns.insert(
                    column.name.clone(),
                    CanonicalColumn {
                        sql_type: normalize_type(&dialect.type_name(&column.sql_type)),
                        not_null: !column.nullable || primary_key,
                        primary_key,
                    },
                );
            }
            for index in &table.indexes {
                out.indexes.insert(
                    index.name.clone(),
                    CanonicalIndex {
                        unique: index.unique,
                        columns: index.columns.clone(),
                    },
                );
            }
            for unique in &table.unique_constraints {
                out.indexes.insert(
                    unique.name.clone(),
                    CanonicalIndex {
                        unique: true,
                        columns: unique.columns.clone(),
                    },
                );
            }
            for fk in &table.foreign_keys {
                out.foreign_keys.insert(CanonicalForeignKey {
                    columns: fk.columns.clone(),
                    references_table: fk.references_table.clone(),
                    references_columns: fk.references_columns.clone(),
                });
            }
            canonical.tables.insert(table.name.clone(), out);
        }
        Some(canonical)
    }

    /// Renders one line per table, column, index and foreign key.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (name, table) in &self.tables {
            lines.push(format!("table {name}"));
            for (column, c) in &table.columns {
                lines.push(format!(
                    "column {name}.{column} {}{}{}",
                    c.sql_type,
                    if c.not_null { " NOT NULL" } else { "" },
                    if c.primary_key { " PRIMARY KEY" } else { "" },
                ));
            }
            for (index, i) in &table.indexes {
                lines.push(format!(
                    "index {name}.{index}{} ({})",
                    if i.unique { " UNIQUE" } else { "" },
                    i.columns.join(", ")
                ));
            }
            for fk in &table.foreign_keys {
                lines.push(format!(
                    "foreign_key {name} ({}) -> {} ({})",
                    fk.columns.join(", "),
                    fk.references_table,
                    fk.references_columns.join(", ")
                ));
            }
        }
        lines
    }

    /// Returns the fingerprint of this schema.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for line in self.lines() {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Lists differences from `expected`: `-` lines are expected but
    /// missing, `+` lines are present but unexpected.
    #[must_use]
    pub fn diff(&self, expected: &Self) -> Vec<String> {
        diff_lines(&self.lines(), &expected.lines())
    }
}

/// Line diff of one canonical rendering against another.
#[must_use]
pub fn diff_lines(actual: &[String], expected: &[String]) -> Vec<String> {
    let actual_set: BTreeSet<&String> = actual.iter().collect();
    let expected_set: BTreeSet<&String> = expected.iter().collect();

    let mut out: Vec<String> = expected
        .iter()
        .filter(|l| !actual_set.contains(l))
        .map(|l| format!("- {l}"))
        .collect();
    out.extend(
        actual
            .iter()
            .filter(|l| !expected_set.contains(l))
            .map(|l| format!("+ {l}")),
    );
    out
}

/// SHA-256 hex digest of a canonical schema rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps a stored fingerprint.
    #[must_use]
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first 12 hex digits, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
