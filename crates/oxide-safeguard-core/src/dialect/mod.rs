//! Database dialect implementations.
//!
//! Each dialect knows how to generate SQL for revision operations specific
//! to that database system, and reports the capabilities the linter checks
//! operations against.

mod sqlite;

pub use sqlite::SqliteDialect;

use crate::error::DialectError;
use crate::operations::Operation;
use crate::schema::{ColumnSchema, ForeignKeySchema, SqlType};

/// Trait for database-specific SQL generation.
pub trait MigrationDialect: Send + Sync {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Generates SQL for an operation.
    ///
    /// Fails when the dialect cannot express the operation.
    fn generate_sql(&self, operation: &Operation) -> Result<Vec<String>, DialectError>;

    /// Returns the SQL type name for the given type.
    fn type_name(&self, sql_type: &SqlType) -> String;

    /// Returns whether this dialect supports DROP COLUMN.
    fn supports_drop_column(&self) -> bool;

    /// Returns whether CHECK and FOREIGN KEY constraints can be added after
    /// table creation.
    fn supports_add_constraint(&self) -> bool;

    /// Returns whether DDL statements take part in transactions.
    fn supports_transactional_ddl(&self) -> bool;

    /// Generates column definition SQL.
    fn column_definition(&self, column: &ColumnSchema) -> String {
        let mut parts = vec![
            self.quote_identifier(&column.name),
            self.type_name(&column.sql_type),
        ];

        if column.primary_key {
            parts.push("PRIMARY KEY".to_string());
            if column.auto_increment {
                parts.push(self.auto_increment_keyword().to_string());
            }
        }

        if !column.nullable && !column.primary_key {
            parts.push("NOT NULL".to_string());
        }

        if column.unique && !column.primary_key {
            parts.push("UNIQUE".to_string());
        }

        if let Some(default_sql) = column.default.to_sql() {
            parts.push(format!("DEFAULT {}", default_sql));
        }

        if let Some(ref check) = column.check {
            parts.push(format!("CHECK ({})", check));
        }

        parts.join(" ")
    }

    /// Generates a table-level FOREIGN KEY clause.
    fn foreign_key_clause(&self, fk: &ForeignKeySchema) -> String {
        let quote_all = |cols: &[String]| {
            cols.iter()
                .map(|c| self.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            self.quote_identifier(&fk.name),
            quote_all(&fk.columns),
            self.quote_identifier(&fk.references_table),
            quote_all(&fk.references_columns),
            fk.on_delete.to_sql(),
            fk.on_update.to_sql()
        )
    }

    /// Returns the auto-increment keyword for this dialect.
    fn auto_increment_keyword(&self) -> &'static str;

    /// Quote an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}
