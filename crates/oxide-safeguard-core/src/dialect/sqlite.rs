//! SQLite dialect for revisions.
//!
//! SQLite has limited ALTER TABLE support: CHECK and FOREIGN KEY
//! constraints can only be declared at table creation, and unique
//! constraints added later become unique indexes.

use crate::error::DialectError;
use crate::operations::{Constraint, Operation};
use crate::schema::{ColumnSchema, ForeignKeySchema, SqlType};

use super::MigrationDialect;

/// SQLite migration dialect.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn quote_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Generates SQL for creating a table.
    fn create_table_sql(
        &self,
        name: &str,
        columns: &[ColumnSchema],
        primary_key: &[String],
        foreign_keys: &[ForeignKeySchema],
    ) -> String {
        let mut sql = String::from("CREATE TABLE ");
        sql.push_str(&self.quote_identifier(name));
        sql.push_str(" (\n");

        let mut defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();

        // Composite primary key, or one not declared inline
        let inline_pk = columns.iter().any(|c| c.primary_key);
        if !primary_key.is_empty() && !inline_pk {
            defs.push(format!("PRIMARY KEY ({})", self.quote_list(primary_key)));
        }

        defs.extend(foreign_keys.iter().map(|fk| self.foreign_key_clause(fk)));

        sql.push_str("  ");
        sql.push_str(&defs.join(",\n  "));
        sql.push_str("\n)");
        sql
    }

    /// Generates SQL for creating an index.
    fn create_index_sql(
        &self,
        name: &str,
        table: &str,
        columns: &[String],
        unique: bool,
        condition: Option<&str>,
    ) -> String {
        let mut sql = String::from("CREATE ");
        if unique {
            sql.push_str("UNIQUE ");
        }
        sql.push_str("INDEX ");
        sql.push_str(&self.quote_identifier(name));
        sql.push_str(" ON ");
        sql.push_str(&self.quote_identifier(table));
        sql.push_str(" (");
        sql.push_str(&self.quote_list(columns));
        sql.push(')');

        if let Some(cond) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(cond);
        }

        sql
    }

    fn unsupported(&self, operation: &Operation, detail: &str) -> DialectError {
        DialectError::Unsupported {
            dialect: self.name(),
            operation: format!("{} ({detail})", operation.description()),
        }
    }
}

impl MigrationDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn generate_sql(&self, operation: &Operation) -> Result<Vec<String>, DialectError> {
        let sql = match operation {
            Operation::AddTable {
                name,
                columns,
                primary_key,
                foreign_keys,
            } => self.create_table_sql(name, columns, primary_key, foreign_keys),

            Operation::DropTable { name } => {
                format!("DROP TABLE {}", self.quote_identifier(name))
            }

            Operation::Rename {
                table,
                column: None,
                to,
            } => format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quote_identifier(table),
                self.quote_identifier(to)
            ),

            Operation::Rename {
                table,
                column: Some(column),
                to,
            } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                self.quote_identifier(table),
                self.quote_identifier(column),
                self.quote_identifier(to)
            ),

            Operation::AddColumn { table, column } => {
                if column.primary_key || column.unique {
                    return Err(self.unsupported(
                        operation,
                        "added columns cannot be PRIMARY KEY or UNIQUE",
                    ));
                }
                format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    self.quote_identifier(table),
                    self.column_definition(column)
                )
            }

            // SQLite 3.35.0+
            Operation::DropColumn { table, column } => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.quote_identifier(table),
                self.quote_identifier(column)
            ),

            Operation::AddIndex {
                name,
                table,
                columns,
                unique,
                condition,
            } => self.create_index_sql(name, table, columns, *unique, condition.as_deref()),

            Operation::DropIndex { name, .. } | Operation::DropConstraint { name, .. } => {
                format!("DROP INDEX {}", self.quote_identifier(name))
            }

            Operation::AddConstraint { table, constraint } => match constraint {
                // Unique constraints after creation are done via unique indexes
                Constraint::Unique { name, columns } => {
                    self.create_index_sql(name, table, columns, true, None)
                }
                Constraint::Check { .. } => {
                    return Err(self.unsupported(
                        operation,
                        "CHECK constraints require table recreation",
                    ));
                }
                Constraint::ForeignKey(_) => {
                    return Err(self.unsupported(
                        operation,
                        "foreign keys must be declared at table creation",
                    ));
                }
            },

            Operation::RawStatement { sql, .. } | Operation::DataBackfill { sql, .. } => {
                sql.clone()
            }
        };
        Ok(vec![sql])
    }

    fn type_name(&self, sql_type: &SqlType) -> String {
        match sql_type {
            SqlType::Integer | SqlType::SmallInt | SqlType::BigInt | SqlType::Boolean => {
                "INTEGER".to_string()
            }
            SqlType::Text
            | SqlType::Varchar(_)
            | SqlType::Char(_)
            | SqlType::DateTime
            | SqlType::Timestamp
            | SqlType::Date
            | SqlType::Time
            | SqlType::Json
            | SqlType::Uuid => "TEXT".to_string(),
            SqlType::Real | SqlType::Double => "REAL".to_string(),
            SqlType::Decimal(_, _) | SqlType::Numeric(_, _) => "NUMERIC".to_string(),
            SqlType::Blob | SqlType::Binary(_) | SqlType::VarBinary(_) => "BLOB".to_string(),
        }
    }

    fn supports_drop_column(&self) -> bool {
        true
    }

    fn supports_add_constraint(&self) -> bool {
        false
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn auto_increment_keyword(&self) -> &'static str {
        "AUTOINCREMENT"
    }
}
