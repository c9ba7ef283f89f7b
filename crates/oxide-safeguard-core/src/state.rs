//! State reconstruction from revisions.
//!
//! This module reconstructs the expected database schema by replaying
//! revision operations. The linter uses it to resolve references and the
//! fingerprint model uses it to derive what a database at a given revision
//! should look like.

use crate::error::ReplayError;
use crate::operations::{Constraint, Operation};
use crate::revision::Revision;
use crate::schema::{DatabaseSchema, IndexSchema, TableSchema, UniqueConstraint};

type Result<T> = std::result::Result<T, ReplayError>;

fn missing_table(name: &str) -> ReplayError {
    ReplayError(format!("Table '{}' does not exist", name))
}

/// Reconstructs database schema from a sequence of revisions.
#[derive(Debug, Default, Clone)]
pub struct SchemaState {
    schema: DatabaseSchema,
}

impl SchemaState {
    /// Creates a new empty schema state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts replay from an existing schema, such as one read from a live
    /// database.
    #[must_use]
    pub fn from_schema(schema: DatabaseSchema) -> Self {
        Self { schema }
    }

    /// Returns the current schema.
    #[must_use]
    pub fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    /// Consumes and returns the schema.
    #[must_use]
    pub fn into_schema(self) -> DatabaseSchema {
        self.schema
    }

    /// Applies a revision's operations to the schema state.
    pub fn apply_revision(&mut self, revision: &Revision) -> Result<()> {
        for operation in &revision.operations {
            self.apply_operation(operation)?;
        }
        Ok(())
    }

    /// Applies a revision, skipping operations that do not fit the current
    /// state. Returns the errors that were skipped.
    pub fn apply_revision_lenient(&mut self, revision: &Revision) -> Vec<ReplayError> {
        revision
            .operations
            .iter()
            .filter_map(|op| self.apply_operation(op).err())
            .collect()
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableSchema> {
        self.schema
            .get_table_mut(name)
            .ok_or_else(|| missing_table(name))
    }

    /// Applies a single operation to the schema state.
    pub fn apply_operation(&mut self, operation: &Operation) -> Result<()> {
        match operation {
            Operation::AddTable {
                name,
                columns,
                primary_key,
                foreign_keys,
            } => {
                if self.schema.get_table(name).is_some() {
                    return Err(ReplayError(format!("Table '{}' already exists", name)));
                }

                let mut table = TableSchema::new(name.clone());
                for column in columns {
                    table = table.column(column.clone());
                }
                for pk in primary_key {
                    if !table.primary_key.contains(pk) {
                        table.primary_key.push(pk.clone());
                    }
                }
                table.foreign_keys.clone_from(foreign_keys);
                self.schema.tables.push(table);
            }

            Operation::DropTable { name } => {
                let idx = self
                    .schema
                    .tables
                    .iter()
                    .position(|t| t.name == *name)
                    .ok_or_else(|| missing_table(name))?;
                self.schema.tables.remove(idx);
            }

            Operation::Rename {
                table,
                column: None,
                to,
            } => {
                if self.schema.get_table(to).is_some() {
                    return Err(ReplayError(format!("Table '{}' already exists", to)));
                }
                self.table_mut(table)?.name.clone_from(to);
                // SQLite rewrites references held by other tables.
                for t in &mut self.schema.tables {
                    for fk in &mut t.foreign_keys {
                        if fk.references_table == *table {
                            fk.references_table.clone_from(to);
                        }
                    }
                }
            }

            Operation::Rename {
                table,
                column: Some(column),
                to,
            } => {
                let t = self.table_mut(table)?;
                if t.opaque {
                    return Ok(());
                }
                if t.get_column(to).is_some() {
                    return Err(ReplayError(format!(
                        "Column '{}' already exists in table '{}'",
                        to, table
                    )));
                }
                let col = t.get_column_mut(column).ok_or_else(|| {
                    ReplayError(format!(
                        "Column '{}' does not exist in table '{}'",
                        column, table
                    ))
                })?;
                col.name.clone_from(to);

                let rename = |cols: &mut Vec<String>| {
                    for c in cols.iter_mut().filter(|c| *c == column) {
                        c.clone_from(to);
                    }
                };
                rename(&mut t.primary_key);
                for index in &mut t.indexes {
                    rename(&mut index.columns);
                }
                for unique in &mut t.unique_constraints {
                    rename(&mut unique.columns);
                }
                for fk in &mut t.foreign_keys {
                    rename(&mut fk.columns);
                }
                for other in &mut self.schema.tables {
                    for fk in &mut other.foreign_keys {
                        if fk.references_table == *table {
                            rename(&mut fk.references_columns);
                        }
                    }
                }
            }

            Operation::AddColumn { table, column } => {
                let t = self.table_mut(table)?;

                if t.get_column(&column.name).is_some() {
                    return Err(ReplayError(format!(
                        "Column '{}' already exists in table '{}'",
                        column.name, table
                    )));
                }

                t.columns.push(column.clone());
            }

            Operation::DropColumn { table, column } => {
                let t = self.table_mut(table)?;

                match t.columns.iter().position(|c| c.name == *column) {
                    Some(idx) => {
                        t.columns.remove(idx);
                    }
                    None if t.opaque => {}
                    None => {
                        return Err(ReplayError(format!(
                            "Column '{}' does not exist in table '{}'",
                            column, table
                        )));
                    }
                }
            }

            Operation::AddIndex {
                name,
                table,
                columns,
                unique,
                condition,
            } => {
                if self.schema.index_owner(name).is_some() {
                    return Err(ReplayError(format!("Index '{}' already exists", name)));
                }
                self.table_mut(table)?.indexes.push(IndexSchema {
                    name: name.clone(),
                    columns: columns.clone(),
                    unique: *unique,
                    condition: condition.clone(),
                });
            }

            Operation::DropIndex { name, table } => {
                // Try to find the index in any table if table is not specified
                let mut found = false;
                for t in &mut self.schema.tables {
                    if table.as_ref().is_some_and(|tn| t.name != *tn) {
                        continue;
                    }
                    if let Some(idx) = t.indexes.iter().position(|i| i.name == *name) {
                        t.indexes.remove(idx);
                        found = true;
                        break;
                    }
                    if let Some(idx) = t.unique_constraints.iter().position(|u| u.name == *name) {
                        t.unique_constraints.remove(idx);
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(ReplayError(format!("Index '{}' does not exist", name)));
                }
            }

            Operation::AddConstraint { table, constraint } => {
                if self.schema.index_owner(constraint.name()).is_some() {
                    return Err(ReplayError(format!(
                        "Constraint '{}' already exists",
                        constraint.name()
                    )));
                }
                let t = self.table_mut(table)?;
                match constraint {
                    Constraint::Unique { name, columns } => {
                        t.unique_constraints.push(UniqueConstraint {
                            name: name.clone(),
                            columns: columns.clone(),
                        });
                    }
                    // CHECK constraints are not part of the tracked shape
                    Constraint::Check { .. } => {}
                    Constraint::ForeignKey(fk) => t.foreign_keys.push(fk.clone()),
                }
            }

            Operation::DropConstraint { table, name } => {
                let t = self.table_mut(table)?;
                if let Some(idx) = t.unique_constraints.iter().position(|u| u.name == *name) {
                    t.unique_constraints.remove(idx);
                } else if let Some(idx) = t.foreign_keys.iter().position(|fk| fk.name == *name) {
                    t.foreign_keys.remove(idx);
                } else if !t.opaque {
                    return Err(ReplayError(format!(
                        "Constraint '{}' does not exist in table '{}'",
                        name, table
                    )));
                }
            }

            Operation::RawStatement { tables, .. } => {
                // Declared tables become opaque: they exist, their shape is unknown
                for name in tables {
                    match self.schema.get_table_mut(name) {
                        Some(t) => t.opaque = true,
                        None => {
                            let mut t = TableSchema::new(name.clone());
                            t.opaque = true;
                            self.schema.tables.push(t);
                        }
                    }
                }
            }

            Operation::DataBackfill { .. } => {
                // Row changes don't affect the tracked schema state
            }
        }

        Ok(())
    }

    /// Applies multiple revisions in order.
    pub fn apply_revisions<'a>(
        &mut self,
        revisions: impl IntoIterator<Item = &'a Revision>,
    ) -> Result<()> {
        for revision in revisions {
            self.apply_revision(revision)?;
        }
        Ok(())
    }

    /// Reconstructs schema from a sequence of revisions.
    pub fn from_revisions<'a>(revisions: impl IntoIterator<Item = &'a Revision>) -> Result<Self> {
        let mut state = Self::new();
        state.apply_revisions(revisions)?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ForeignKeySchema, SqlType};

    fn create_users_revision() -> Revision {
        Revision::new("0001_initial").operation(Operation::add_table(
            "users",
            vec![
                ColumnSchema::new("id", SqlType::BigInt)
                    .primary_key()
                    .auto_increment(),
                ColumnSchema::new("username", SqlType::Varchar(255)).not_null(),
            ],
        ))
    }

    fn add_email_revision() -> Revision {
        Revision::new("0002_add_email")
            .parent("0001_initial")
            .operation(Operation::add_column(
                "users",
                ColumnSchema::new("email", SqlType::Varchar(255)),
            ))
    }

    #[test]
    fn test_add_table() {
        let mut state = SchemaState::new();
        state.apply_revision(&create_users_revision()).unwrap();

        let schema = state.schema();
        assert_eq!(schema.tables.len(), 1);

        let users = schema.get_table("users").unwrap();
        assert_eq!(users.columns.len(), 2);
        assert_eq!(users.primary_key, vec!["id"]);
    }

    #[test]
    fn test_add_column() {
        let state =
            SchemaState::from_revisions([&create_users_revision(), &add_email_revision()]).unwrap();

        let users = state.schema().get_table("users").unwrap();
        assert_eq!(users.columns.len(), 3);
        assert!(users.get_column("email").is_some());
    }

    #[test]
    fn test_drop_column() {
        let mut state =
            SchemaState::from_revisions([&create_users_revision(), &add_email_revision()]).unwrap();

        state
            .apply_operation(&Operation::drop_column("users", "email"))
            .unwrap();

        let users = state.schema().get_table("users").unwrap();
        assert_eq!(users.columns.len(), 2);
        assert!(users.get_column("email").is_none());
    }

    #[test]
    fn test_rename_table_updates_foreign_keys() {
        let mut state = SchemaState::from_revisions([&create_users_revision()]).unwrap();
        state
            .apply_operation(&Operation::AddTable {
                name: "posts".to_string(),
                columns: vec![
                    ColumnSchema::new("id", SqlType::Integer).primary_key(),
                    ColumnSchema::new("author_id", SqlType::BigInt),
                ],
                primary_key: Vec::new(),
                foreign_keys: vec![ForeignKeySchema {
                    name: "fk_posts_author".to_string(),
                    columns: vec!["author_id".to_string()],
                    references_table: "users".to_string(),
                    references_columns: vec!["id".to_string()],
                    on_delete: crate::schema::ForeignKeyAction::Cascade,
                    on_update: crate::schema::ForeignKeyAction::NoAction,
                }],
            })
            .unwrap();

        state
            .apply_operation(&Operation::rename_table("users", "accounts"))
            .unwrap();

        assert!(state.schema().get_table("users").is_none());
        assert!(state.schema().get_table("accounts").is_some());
        let posts = state.schema().get_table("posts").unwrap();
        assert_eq!(posts.foreign_keys[0].references_table, "accounts");
    }

    #[test]
    fn test_rename_column_updates_indexes() {
        let mut state = SchemaState::from_revisions([&create_users_revision()]).unwrap();
        state
            .apply_operation(&Operation::add_index(
                "idx_username",
                "users",
                vec!["username".to_string()],
                true,
            ))
            .unwrap();

        state
            .apply_operation(&Operation::rename_column("users", "username", "name"))
            .unwrap();

        let users = state.schema().get_table("users").unwrap();
        assert!(users.get_column("username").is_none());
        assert!(users.get_column("name").is_some());
        assert_eq!(users.indexes[0].columns, vec!["name"]);
    }

    #[test]
    fn test_drop_table() {
        let mut state = SchemaState::from_revisions([&create_users_revision()]).unwrap();
        state.apply_operation(&Operation::drop_table("users")).unwrap();
        assert!(state.schema().get_table("users").is_none());
    }

    #[test]
    fn test_unique_constraint_round_trip() {
        let mut state = SchemaState::from_revisions([&create_users_revision()]).unwrap();
        state
            .apply_operation(&Operation::AddConstraint {
                table: "users".to_string(),
                constraint: Constraint::Unique {
                    name: "uq_username".to_string(),
                    columns: vec!["username".to_string()],
                },
            })
            .unwrap();
        assert!(state.schema().get_table("users").unwrap().has_index("uq_username"));

        state
            .apply_operation(&Operation::DropConstraint {
                table: "users".to_string(),
                name: "uq_username".to_string(),
            })
            .unwrap();
        assert!(!state.schema().get_table("users").unwrap().has_index("uq_username"));
    }

    #[test]
    fn test_raw_statement_marks_tables_opaque() {
        let mut state = SchemaState::new();
        state
            .apply_operation(&Operation::RawStatement {
                sql: "CREATE TABLE legacy (a, b)".to_string(),
                reverse: None,
                tables: vec!["legacy".to_string()],
                timeout_ms: None,
            })
            .unwrap();

        let legacy = state.schema().get_table("legacy").unwrap();
        assert!(legacy.opaque);
        state
            .apply_operation(&Operation::drop_column("legacy", "a"))
            .unwrap();
    }

    #[test]
    fn test_lenient_replay_collects_errors() {
        let mut state = SchemaState::new();
        let rev = Revision::new("0001")
            .operation(Operation::drop_column("ghost", "x"))
            .operation(Operation::add_table(
                "users",
                vec![ColumnSchema::new("id", SqlType::Integer)],
            ));
        let errors = state.apply_revision_lenient(&rev);
        assert_eq!(errors.len(), 1);
        assert!(state.schema().get_table("users").is_some());
    }

    #[test]
    fn test_duplicate_table_error() {
        let mut state = SchemaState::new();
        state.apply_revision(&create_users_revision()).unwrap();

        let result = state.apply_revision(&create_users_revision());
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_table_error() {
        let mut state = SchemaState::new();

        let result = state.apply_operation(&Operation::add_column(
            "nonexistent",
            ColumnSchema::new("col", SqlType::Text),
        ));
        assert_eq!(
            result,
            Err(ReplayError("Table 'nonexistent' does not exist".to_string()))
        );
    }
}
