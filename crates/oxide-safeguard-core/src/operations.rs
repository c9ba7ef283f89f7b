//! Revision operations.
//!
//! This module defines the closed set of schema changes a revision can
//! declare, along with their reverse operations and risk classification.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::schema::{ColumnSchema, ForeignKeySchema};
use crate::sql_scan;

/// A table, or a column of a table, named by a revision.
///
/// Written as `"table"` or `"table.column"` in revision files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaTarget {
    /// Table name.
    pub table: String,
    /// Column name, when the target is a column.
    pub column: Option<String>,
}

impl SchemaTarget {
    /// Targets a whole table.
    #[must_use]
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: None,
        }
    }

    /// Targets a single column.
    #[must_use]
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: Some(column.into()),
        }
    }

    /// Returns whether a deprecation of `self` covers `other`: a deprecated
    /// table covers all of its columns.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.table == other.table && (self.column.is_none() || self.column == other.column)
    }
}

impl fmt::Display for SchemaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "{}.{}", self.table, column),
            None => f.write_str(&self.table),
        }
    }
}

impl FromStr for SchemaTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('.') {
            Some((table, column)) if !table.is_empty() && !column.is_empty() => {
                Ok(Self::column(table, column))
            }
            None if !s.is_empty() => Ok(Self::table(s)),
            _ => Err(format!("invalid schema target '{s}'")),
        }
    }
}

impl TryFrom<String> for SchemaTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchemaTarget> for String {
    fn from(value: SchemaTarget) -> Self {
        value.to_string()
    }
}

/// A constraint added to an existing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// UNIQUE over one or more columns.
    Unique {
        /// Constraint name.
        name: String,
        /// Constrained columns.
        columns: Vec<String>,
    },
    /// CHECK expression.
    Check {
        /// Constraint name.
        name: String,
        /// Boolean SQL expression.
        expression: String,
    },
    /// FOREIGN KEY reference.
    ForeignKey(ForeignKeySchema),
}

impl Constraint {
    /// Returns the constraint name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Unique { name, .. } | Self::Check { name, .. } => name,
            Self::ForeignKey(fk) => &fk.name,
        }
    }
}

/// How dangerous an operation is to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// Has an automatic or declared inverse.
    Reversible,
    /// Destroys structure or data that cannot be recomputed.
    Irreversible,
    /// May hold a table lock for an unbounded time.
    LockUnbounded,
}

/// A single schema change inside a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Create a new table.
    AddTable {
        /// Table name.
        name: String,
        /// Column definitions.
        columns: Vec<ColumnSchema>,
        /// Composite primary key column(s).
        #[serde(default)]
        primary_key: Vec<String>,
        /// Foreign keys declared with the table.
        #[serde(default)]
        foreign_keys: Vec<ForeignKeySchema>,
    },

    /// Drop a table.
    DropTable {
        /// Table name.
        name: String,
    },

    /// Add a column to a table.
    AddColumn {
        /// Table name.
        table: String,
        /// Column definition.
        column: ColumnSchema,
    },

    /// Drop a column from a table.
    DropColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Rename a table, or one of its columns when `column` is set.
    Rename {
        /// Table name.
        table: String,
        /// Column to rename.
        #[serde(default)]
        column: Option<String>,
        /// New name.
        to: String,
    },

    /// Create an index.
    AddIndex {
        /// Index name.
        name: String,
        /// Table name.
        table: String,
        /// Columns to index.
        columns: Vec<String>,
        /// Whether this is a unique index.
        #[serde(default)]
        unique: bool,
        /// Partial index condition.
        #[serde(default)]
        condition: Option<String>,
    },

    /// Drop an index.
    DropIndex {
        /// Index name.
        name: String,
        /// Owning table, if known.
        #[serde(default)]
        table: Option<String>,
    },

    /// Add a constraint to an existing table.
    AddConstraint {
        /// Table name.
        table: String,
        /// Constraint definition.
        constraint: Constraint,
    },

    /// Drop a named constraint.
    DropConstraint {
        /// Table name.
        table: String,
        /// Constraint name.
        name: String,
    },

    /// Run raw SQL.
    RawStatement {
        /// Statement(s) to run.
        sql: String,
        /// Statement(s) undoing `sql`.
        #[serde(default)]
        reverse: Option<String>,
        /// Tables the statement creates or alters.
        #[serde(default)]
        tables: Vec<String>,
        /// Statement timeout the author expects the statement to finish within.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Rewrite existing rows.
    DataBackfill {
        /// Table whose rows are rewritten.
        table: String,
        /// Data-mutating statement.
        sql: String,
        /// Row filter matching the rows `sql` touches, used for impact estimates.
        #[serde(default)]
        filter: Option<String>,
        /// Statement undoing `sql`.
        #[serde(default)]
        reverse: Option<String>,
    },
}

impl Operation {
    /// Creates an AddTable operation.
    #[must_use]
    pub fn add_table(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self::AddTable {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Creates a DropTable operation.
    #[must_use]
    pub fn drop_table(name: impl Into<String>) -> Self {
        Self::DropTable { name: name.into() }
    }

    /// Creates an AddColumn operation.
    #[must_use]
    pub fn add_column(table: impl Into<String>, column: ColumnSchema) -> Self {
        Self::AddColumn {
            table: table.into(),
            column,
        }
    }

    /// Creates a DropColumn operation.
    #[must_use]
    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::DropColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Creates a table Rename operation.
    #[must_use]
    pub fn rename_table(table: impl Into<String>, to: impl Into<String>) -> Self {
        Self::Rename {
            table: table.into(),
            column: None,
            to: to.into(),
        }
    }

    /// Creates a column Rename operation.
    #[must_use]
    pub fn rename_column(
        table: impl Into<String>,
        column: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::Rename {
            table: table.into(),
            column: Some(column.into()),
            to: to.into(),
        }
    }

    /// Creates an AddIndex operation.
    #[must_use]
    pub fn add_index(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        unique: bool,
    ) -> Self {
        Self::AddIndex {
            name: name.into(),
            table: table.into(),
            columns,
            unique,
            condition: None,
        }
    }

    /// Creates a RawStatement operation.
    #[must_use]
    pub fn raw(sql: impl Into<String>, reverse: Option<String>) -> Self {
        Self::RawStatement {
            sql: sql.into(),
            reverse,
            tables: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Creates a DataBackfill operation.
    #[must_use]
    pub fn backfill(table: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::DataBackfill {
            table: table.into(),
            sql: sql.into(),
            filter: None,
            reverse: None,
        }
    }

    /// Returns the reverse operation for rollback.
    ///
    /// Returns `None` if the operation is not reversible.
    #[must_use]
    pub fn reverse(&self) -> Option<Self> {
        match self {
            Self::AddTable { name, .. } => Some(Self::drop_table(name.clone())),

            // Cannot reverse without knowing the original definition
            Self::DropTable { .. }
            | Self::DropColumn { .. }
            | Self::DropIndex { .. }
            | Self::DropConstraint { .. } => None,

            Self::AddColumn { table, column } => {
                Some(Self::drop_column(table.clone(), column.name.clone()))
            }

            Self::Rename { table, column, to } => Some(match column {
                Some(column) => Self::rename_column(table.clone(), to.clone(), column.clone()),
                None => Self::rename_table(to.clone(), table.clone()),
            }),

            Self::AddIndex { name, table, .. } => Some(Self::DropIndex {
                name: name.clone(),
                table: Some(table.clone()),
            }),

            Self::AddConstraint { table, constraint } => match constraint {
                Constraint::Unique { name, .. } => Some(Self::DropConstraint {
                    table: table.clone(),
                    name: name.clone(),
                }),
                Constraint::Check { .. } | Constraint::ForeignKey(_) => None,
            },

            Self::RawStatement {
                sql,
                reverse,
                tables,
                timeout_ms,
            } => reverse.as_ref().map(|bwd| Self::RawStatement {
                sql: bwd.clone(),
                reverse: Some(sql.clone()),
                tables: tables.clone(),
                timeout_ms: *timeout_ms,
            }),

            Self::DataBackfill {
                table,
                sql,
                filter,
                reverse,
            } => reverse.as_ref().map(|bwd| Self::DataBackfill {
                table: table.clone(),
                sql: bwd.clone(),
                filter: filter.clone(),
                reverse: Some(sql.clone()),
            }),
        }
    }

    /// Returns true if this operation can be reversed automatically.
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        match self {
            Self::AddTable { .. }
            | Self::AddColumn { .. }
            | Self::Rename { .. }
            | Self::AddIndex { .. } => true,
            Self::DropTable { .. }
            | Self::DropColumn { .. }
            | Self::DropIndex { .. }
            | Self::DropConstraint { .. } => false,
            Self::AddConstraint { constraint, .. } => {
                matches!(constraint, Constraint::Unique { .. })
            }
            Self::RawStatement { reverse, .. } | Self::DataBackfill { reverse, .. } => {
                reverse.is_some()
            }
        }
    }

    /// Classifies the operation's risk.
    #[must_use]
    pub fn risk_class(&self) -> RiskClass {
        match self {
            Self::RawStatement {
                sql, timeout_ms, ..
            } if timeout_ms.is_none() && !sql_scan::lock_inducing_keywords(sql).is_empty() => {
                RiskClass::LockUnbounded
            }
            Self::DataBackfill { filter: None, .. } => RiskClass::LockUnbounded,
            _ if self.is_reversible() => RiskClass::Reversible,
            _ => RiskClass::Irreversible,
        }
    }

    /// Returns true if the operation changes structure rather than rows.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::DataBackfill { .. })
    }

    /// Returns true if the operation can run inside a transaction.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        match self {
            Self::RawStatement { sql, .. } | Self::DataBackfill { sql, .. } => {
                !sql_scan::is_non_transactional(sql)
            }
            _ => true,
        }
    }

    /// Returns true for raw SQL that changes the schema in ways replay
    /// cannot follow.
    #[must_use]
    pub fn is_schema_opaque(&self) -> bool {
        match self {
            Self::RawStatement { sql, tables, .. } => {
                !tables.is_empty() || sql_scan::is_schema_changing(sql)
            }
            _ => false,
        }
    }

    /// Returns the table or column this operation destroys, if any.
    #[must_use]
    pub fn drop_target(&self) -> Option<SchemaTarget> {
        match self {
            Self::DropTable { name } => Some(SchemaTarget::table(name.clone())),
            Self::DropColumn { table, column } => {
                Some(SchemaTarget::column(table.clone(), column.clone()))
            }
            _ => None,
        }
    }

    /// Returns the tables and columns that must exist before this operation runs.
    #[must_use]
    pub fn references(&self) -> Vec<SchemaTarget> {
        let columns_of = |table: &str, columns: &[String]| {
            columns
                .iter()
                .map(|c| SchemaTarget::column(table, c.clone()))
                .collect::<Vec<_>>()
        };
        let fk_targets = |fk: &ForeignKeySchema| {
            let mut targets = vec![SchemaTarget::table(fk.references_table.clone())];
            targets.extend(columns_of(&fk.references_table, &fk.references_columns));
            targets
        };

        match self {
            Self::AddTable { foreign_keys, .. } => {
                foreign_keys.iter().flat_map(fk_targets).collect()
            }
            Self::DropTable { name } => vec![SchemaTarget::table(name.clone())],
            Self::AddColumn { table, .. }
            | Self::DropConstraint { table, .. }
            | Self::DataBackfill { table, .. } => vec![SchemaTarget::table(table.clone())],
            Self::DropColumn { table, column } => vec![
                SchemaTarget::table(table.clone()),
                SchemaTarget::column(table.clone(), column.clone()),
            ],
            Self::Rename { table, column, .. } => {
                let mut targets = vec![SchemaTarget::table(table.clone())];
                if let Some(column) = column {
                    targets.push(SchemaTarget::column(table.clone(), column.clone()));
                }
                targets
            }
            Self::AddIndex { table, columns, .. } => {
                let mut targets = vec![SchemaTarget::table(table.clone())];
                targets.extend(columns_of(table, columns));
                targets
            }
            Self::DropIndex { table, .. } => table
                .iter()
                .map(|t| SchemaTarget::table(t.clone()))
                .collect(),
            Self::AddConstraint { table, constraint } => {
                let mut targets = vec![SchemaTarget::table(table.clone())];
                match constraint {
                    Constraint::Unique { columns, .. } => {
                        targets.extend(columns_of(table, columns));
                    }
                    Constraint::Check { .. } => {}
                    Constraint::ForeignKey(fk) => {
                        targets.extend(columns_of(table, &fk.columns));
                        targets.extend(fk_targets(fk));
                    }
                }
                targets
            }
            Self::RawStatement { .. } => Vec::new(),
        }
    }

    /// Returns every table name this operation touches.
    #[must_use]
    pub fn tables(&self) -> BTreeSet<String> {
        let mut tables: BTreeSet<String> =
            self.references().into_iter().map(|t| t.table).collect();
        match self {
            Self::AddTable { name, .. } => {
                tables.insert(name.clone());
            }
            Self::Rename {
                to, column: None, ..
            } => {
                tables.insert(to.clone());
            }
            Self::RawStatement {
                tables: declared, ..
            } => tables.extend(declared.iter().cloned()),
            _ => {}
        }
        tables
    }

    /// Returns a human-readable description of this operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::AddTable { name, .. } => format!("Add table '{}'", name),
            Self::DropTable { name } => format!("Drop table '{}'", name),
            Self::AddColumn { table, column } => {
                format!("Add column '{}' to table '{}'", column.name, table)
            }
            Self::DropColumn { table, column } => {
                format!("Drop column '{}' from table '{}'", column, table)
            }
            Self::Rename {
                table,
                column: Some(column),
                to,
            } => format!(
                "Rename column '{}' to '{}' in table '{}'",
                column, to, table
            ),
            Self::Rename {
                table,
                column: None,
                to,
            } => format!("Rename table '{}' to '{}'", table, to),
            Self::AddIndex { name, table, .. } => {
                format!("Add index '{}' on table '{}'", name, table)
            }
            Self::DropIndex { name, .. } => format!("Drop index '{}'", name),
            Self::AddConstraint { table, constraint } => format!(
                "Add constraint '{}' to table '{}'",
                constraint.name(),
                table
            ),
            Self::DropConstraint { table, name } => {
                format!("Drop constraint '{}' from table '{}'", name, table)
            }
            Self::RawStatement { .. } => "Run raw SQL".to_string(),
            Self::DataBackfill { table, .. } => format!("Backfill rows of table '{}'", table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SqlType;

    #[test]
    fn test_add_table_reverse() {
        let op = Operation::add_table(
            "users",
            vec![ColumnSchema::new("id", SqlType::BigInt).primary_key()],
        );

        match op.reverse().unwrap() {
            Operation::DropTable { name } => assert_eq!(name, "users"),
            other => panic!("Expected DropTable, got {other:?}"),
        }
    }

    #[test]
    fn test_rename_reverse() {
        let op = Operation::rename_table("old_name", "new_name");
        assert_eq!(
            op.reverse().unwrap(),
            Operation::rename_table("new_name", "old_name")
        );

        let op = Operation::rename_column("users", "name", "full_name");
        assert_eq!(
            op.reverse().unwrap(),
            Operation::rename_column("users", "full_name", "name")
        );
    }

    #[test]
    fn test_add_column_reverse() {
        let op = Operation::add_column("users", ColumnSchema::new("email", SqlType::Varchar(255)));
        assert_eq!(op.reverse().unwrap(), Operation::drop_column("users", "email"));
    }

    #[test]
    fn test_drop_operations_irreversible() {
        let op = Operation::drop_table("users");
        assert!(op.reverse().is_none());
        assert!(!op.is_reversible());
        assert_eq!(op.risk_class(), RiskClass::Irreversible);
        assert_eq!(op.drop_target(), Some(SchemaTarget::table("users")));
    }

    #[test]
    fn test_raw_statement_reversible() {
        let op = Operation::raw(
            "INSERT INTO config VALUES ('key', 'value')",
            Some("DELETE FROM config WHERE key = 'key'".to_string()),
        );

        assert!(op.is_reversible());
        match op.reverse().unwrap() {
            Operation::RawStatement { sql, reverse, .. } => {
                assert_eq!(sql, "DELETE FROM config WHERE key = 'key'");
                assert!(reverse.is_some());
            }
            other => panic!("Expected RawStatement, got {other:?}"),
        }
    }

    #[test]
    fn test_risk_classes() {
        assert_eq!(
            Operation::raw("ALTER TABLE users ADD COLUMN x INT", None).risk_class(),
            RiskClass::LockUnbounded
        );
        assert_eq!(
            Operation::backfill("users", "UPDATE users SET x = 1").risk_class(),
            RiskClass::LockUnbounded
        );
        assert_eq!(
            Operation::add_index("idx", "users", vec!["x".into()], false).risk_class(),
            RiskClass::Reversible
        );
    }

    #[test]
    fn test_references() {
        let op = Operation::add_index("idx", "users", vec!["email".into()], true);
        assert_eq!(
            op.references(),
            vec![
                SchemaTarget::table("users"),
                SchemaTarget::column("users", "email")
            ]
        );
        assert!(Operation::raw("SELECT 1", None).references().is_empty());
    }

    #[test]
    fn test_schema_target_parsing() {
        assert_eq!(
            "users.email".parse::<SchemaTarget>().unwrap(),
            SchemaTarget::column("users", "email")
        );
        assert_eq!(
            "users".parse::<SchemaTarget>().unwrap(),
            SchemaTarget::table("users")
        );
        assert!(".email".parse::<SchemaTarget>().is_err());
        assert!(SchemaTarget::table("users").covers(&SchemaTarget::column("users", "email")));
        assert!(!SchemaTarget::column("users", "name").covers(&SchemaTarget::table("users")));
    }

    #[test]
    fn test_operation_from_toml() {
        let op: Operation = toml::from_str(
            r#"
            kind = "add_constraint"
            table = "users"
            constraint = { type = "unique", name = "uq_users_email", columns = ["email"] }
            "#,
        )
        .unwrap();
        assert!(matches!(
            op,
            Operation::AddConstraint {
                constraint: Constraint::Unique { .. },
                ..
            }
        ));
        assert!(op.is_reversible());
    }
}
