//! Built-in lint rules.

use std::sync::Arc;

use crate::dialect::MigrationDialect;
use crate::finding::Severity;
use crate::operations::{Operation, SchemaTarget};
use crate::revision::Revision;
use crate::sql_scan;

use super::{LintContext, LintRule};

/// Rule id: operation cannot be undone and no reverse list is declared.
pub const IRREVERSIBLE_WITHOUT_REVERSE: &str = "irreversible-without-reverse";
/// Rule id: table or column dropped without a prior deprecation.
pub const DESTRUCTIVE_WITHOUT_DEPRECATION: &str = "destructive-without-deprecation";
/// Rule id: raw SQL that locks tables without a bounded timeout.
pub const LOCK_INDUCING_RAW_STATEMENT: &str = "lock-inducing-raw-statement";
/// Rule id: reference to a table or column that does not exist.
pub const UNKNOWN_REFERENCE: &str = "unknown-reference";
/// Rule id: revision edited after its checksum was recorded.
pub const CHECKSUM_MISMATCH: &str = "checksum-mismatch";
/// Rule id: operation the target dialect cannot run.
pub const DIALECT_UNSUPPORTED: &str = "dialect-unsupported";
/// Rule id: revision that cannot run atomically.
pub const NON_TRANSACTIONAL: &str = "non-transactional";
/// Rule id: data backfill bundled with structural changes.
pub const MIXED_BACKFILL: &str = "mixed-backfill";
/// Rule id: object created twice.
pub const CONFLICTING_DEFINITION: &str = "conflicting-definition";

/// Flags operations without an inverse in revisions that declare no
/// `reverse` list.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrreversibleWithoutReverse;

impl LintRule for IrreversibleWithoutReverse {
    fn id(&self) -> &'static str {
        IRREVERSIBLE_WITHOUT_REVERSE
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check_operation(
        &self,
        revision: &Revision,
        op: &Operation,
        _ctx: &LintContext,
    ) -> Option<String> {
        (revision.reverse.is_none() && !op.is_reversible()).then(|| {
            format!(
                "{} cannot be reversed automatically and the revision declares no reverse operations",
                op.description()
            )
        })
    }
}

/// Blocks drops whose target was not deprecated by an earlier revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct DestructiveWithoutDeprecation;

impl LintRule for DestructiveWithoutDeprecation {
    fn id(&self) -> &'static str {
        DESTRUCTIVE_WITHOUT_DEPRECATION
    }

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    fn check_operation(
        &self,
        _revision: &Revision,
        op: &Operation,
        ctx: &LintContext,
    ) -> Option<String> {
        let target = op.drop_target()?;
        (!ctx.is_deprecated(&target)).then(|| {
            format!(
                "'{target}' is dropped without being deprecated by an earlier revision; \
                 add `deprecates = [\"{target}\"]` to a revision released first"
            )
        })
    }
}

/// Warns about raw SQL that takes table locks without a timeout bound.
#[derive(Debug, Clone, Copy)]
pub struct LockInducingRawStatement {
    /// Configured statement timeout.
    pub statement_timeout_ms: u64,
}

impl LintRule for LockInducingRawStatement {
    fn id(&self) -> &'static str {
        LOCK_INDUCING_RAW_STATEMENT
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check_operation(
        &self,
        _revision: &Revision,
        op: &Operation,
        _ctx: &LintContext,
    ) -> Option<String> {
        let Operation::RawStatement {
            sql, timeout_ms, ..
        } = op
        else {
            return None;
        };
        let keywords = sql_scan::lock_inducing_keywords(sql);
        if keywords.is_empty() {
            return None;
        }
        match timeout_ms {
            None => Some(format!(
                "raw statement takes table locks ({}) and declares no timeout_ms",
                keywords.join(", ")
            )),
            Some(ms) if *ms > self.statement_timeout_ms => Some(format!(
                "raw statement takes table locks ({}) and expects {ms} ms, above the {} ms statement timeout",
                keywords.join(", "),
                self.statement_timeout_ms
            )),
            Some(_) => None,
        }
    }
}

/// Blocks references to tables or columns that do not exist at that point.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownReference;

impl LintRule for UnknownReference {
    fn id(&self) -> &'static str {
        UNKNOWN_REFERENCE
    }

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    fn check_operation(
        &self,
        _revision: &Revision,
        op: &Operation,
        ctx: &LintContext,
    ) -> Option<String> {
        let schema = ctx.schema.schema();
        let mut missing: Vec<SchemaTarget> = Vec::new();
        for target in op.references() {
            let known = match (schema.get_table(&target.table), &target.column) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(table), Some(column)) => table.has_column(column),
            };
            let table_already_missing = missing
                .iter()
                .any(|m| m.table == target.table && m.column.is_none());
            if !known && !table_already_missing {
                missing.push(if schema.get_table(&target.table).is_none() {
                    SchemaTarget::table(target.table.clone())
                } else {
                    target
                });
            }
        }

        if let Operation::DropIndex { name, table: None } = op {
            if schema.index_owner(name).is_none() {
                return Some(format!("index '{name}' does not exist"));
            }
        }
        if let Operation::DropIndex {
            name,
            table: Some(table),
        } = op
        {
            if schema.get_table(table).is_some_and(|t| !t.opaque && !t.has_index(name)) {
                return Some(format!("index '{name}' does not exist on table '{table}'"));
            }
        }

        missing.dedup();
        (!missing.is_empty()).then(|| {
            format!(
                "{} references {} which do{} not exist",
                op.description(),
                missing
                    .iter()
                    .map(|m| format!("'{m}'"))
                    .collect::<Vec<_>>()
                    .join(", "),
                if missing.len() == 1 { "es" } else { "" }
            )
        })
    }
}

/// Blocks revisions whose checksum differs from the recorded one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumMismatch;

impl LintRule for ChecksumMismatch {
    fn id(&self) -> &'static str {
        CHECKSUM_MISMATCH
    }

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    fn check_revision(&self, revision: &Revision, ctx: &LintContext) -> Vec<String> {
        match ctx.recorded.get(&revision.id) {
            Some(recorded) if recorded != revision.checksum() => vec![format!(
                "revision was modified after it was applied: recorded checksum {recorded}, file checksum {}",
                revision.checksum()
            )],
            _ => Vec::new(),
        }
    }
}

/// Blocks operations the target dialect cannot express.
#[derive(Clone)]
pub struct DialectUnsupported {
    /// Target dialect.
    pub dialect: Arc<dyn MigrationDialect>,
}

impl std::fmt::Debug for DialectUnsupported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialectUnsupported")
            .field("dialect", &self.dialect.name())
            .finish()
    }
}

impl LintRule for DialectUnsupported {
    fn id(&self) -> &'static str {
        DIALECT_UNSUPPORTED
    }

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    fn check_operation(
        &self,
        _revision: &Revision,
        op: &Operation,
        _ctx: &LintContext,
    ) -> Option<String> {
        if matches!(op, Operation::DropColumn { .. }) && !self.dialect.supports_drop_column() {
            return Some(format!("{} cannot drop columns", self.dialect.name()));
        }
        self.dialect.generate_sql(op).err().map(|e| e.to_string())
    }
}

/// Warns about revisions that cannot be applied atomically.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonTransactional;

impl LintRule for NonTransactional {
    fn id(&self) -> &'static str {
        NON_TRANSACTIONAL
    }

    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check_revision(&self, revision: &Revision, _ctx: &LintContext) -> Vec<String> {
        if !revision.transactional {
            return vec![
                "revision is declared non-transactional; a failure midway requires a restore"
                    .to_string(),
            ];
        }
        revision
            .operations
            .iter()
            .enumerate()
            .filter(|(_, op)| !op.is_transactional())
            .map(|(i, _)| {
                format!(
                    "operation {i} cannot run inside a transaction; a failure midway requires a restore"
                )
            })
            .collect()
    }
}

/// Notes data backfills bundled with structural changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MixedBackfill;

impl LintRule for MixedBackfill {
    fn id(&self) -> &'static str {
        MIXED_BACKFILL
    }

    fn severity(&self) -> Severity {
        Severity::Info
    }

    fn check_revision(&self, revision: &Revision, _ctx: &LintContext) -> Vec<String> {
        let backfills = revision
            .operations
            .iter()
            .filter(|op| !op.is_structural())
            .count();
        if backfills > 0 && backfills < revision.operations.len() {
            vec![format!(
                "{backfills} data backfill(s) share a revision with structural changes; \
                 consider a separate revision so either can be retried alone"
            )]
        } else {
            Vec::new()
        }
    }
}

/// Blocks creating a table, column, index or constraint that already exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictingDefinition;

impl LintRule for ConflictingDefinition {
    fn id(&self) -> &'static str {
        CONFLICTING_DEFINITION
    }

    fn severity(&self) -> Severity {
        Severity::Blocking
    }

    fn check_operation(
        &self,
        _revision: &Revision,
        op: &Operation,
        ctx: &LintContext,
    ) -> Option<String> {
        let schema = ctx.schema.schema();
        match op {
            Operation::AddTable { name, .. } => schema
                .get_table(name)
                .map(|_| format!("table '{name}' already exists")),
            Operation::AddColumn { table, column } => schema
                .get_table(table)
                .and_then(|t| t.get_column(&column.name))
                .map(|_| format!("column '{table}.{}' already exists", column.name)),
            Operation::Rename {
                column: None, to, ..
            } => schema
                .get_table(to)
                .map(|_| format!("table '{to}' already exists")),
            Operation::Rename {
                table,
                column: Some(_),
                to,
            } => schema
                .get_table(table)
                .and_then(|t| t.get_column(to))
                .map(|_| format!("column '{table}.{to}' already exists")),
            Operation::AddIndex { name, .. } => schema
                .index_owner(name)
                .map(|t| format!("index '{name}' already exists on table '{}'", t.name)),
            Operation::AddConstraint { constraint, .. } => {
                let name = constraint.name();
                schema
                    .index_owner(name)
                    .map(|t| format!("constraint '{name}' already exists on table '{}'", t.name))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use crate::lint::{LintOptions, Linter};
    use crate::operations::Constraint;
    use crate::schema::{ColumnSchema, SqlType};
    use crate::state::SchemaState;

    fn users_ctx() -> LintContext {
        let mut schema = SchemaState::new();
        schema
            .apply_operation(&Operation::add_table(
                "users",
                vec![
                    ColumnSchema::new("id", SqlType::Integer).primary_key(),
                    ColumnSchema::new("email", SqlType::Text),
                ],
            ))
            .unwrap();
        LintContext::new(schema, Default::default())
    }

    fn check(rule: &dyn LintRule, op: Operation) -> Option<String> {
        let rev = Revision::new("0002").operation(op.clone());
        rule.check_operation(&rev, &op, &users_ctx())
    }

    #[test]
    fn test_irreversible_without_reverse() {
        let rule = IrreversibleWithoutReverse;
        assert!(check(&rule, Operation::drop_table("users")).is_some());
        assert!(check(&rule, Operation::rename_table("users", "accounts")).is_none());

        let op = Operation::drop_table("users");
        let rev = Revision::new("0002")
            .operation(op.clone())
            .reverse_with(Vec::new());
        assert!(rule.check_operation(&rev, &op, &users_ctx()).is_none());
    }

    #[test]
    fn test_destructive_without_deprecation() {
        let rule = DestructiveWithoutDeprecation;
        let op = Operation::drop_column("users", "email");
        assert!(check(&rule, op.clone()).is_some());

        let mut ctx = users_ctx();
        ctx.deprecated.insert(SchemaTarget::table("users"));
        let rev = Revision::new("0002").operation(op.clone());
        assert!(rule.check_operation(&rev, &op, &ctx).is_none());
    }

    #[test]
    fn test_lock_inducing_raw_statement() {
        let rule = LockInducingRawStatement {
            statement_timeout_ms: 1_000,
        };
        let raw = |timeout_ms| Operation::RawStatement {
            sql: "ALTER TABLE users ADD COLUMN x INTEGER".to_string(),
            reverse: None,
            tables: Vec::new(),
            timeout_ms,
        };
        assert!(check(&rule, raw(None)).is_some());
        assert!(check(&rule, raw(Some(60_000))).is_some());
        assert!(check(&rule, raw(Some(500))).is_none());
        assert!(check(&rule, Operation::raw("UPDATE users SET email = ''", None)).is_none());
    }

    #[test]
    fn test_unknown_reference() {
        let rule = UnknownReference;
        assert!(check(&rule, Operation::drop_column("users", "email")).is_none());

        let message = check(&rule, Operation::drop_column("users", "phone")).unwrap();
        assert!(message.contains("'users.phone'"), "{message}");

        let message = check(
            &rule,
            Operation::add_index("idx", "orders", vec!["total".to_string()], false),
        )
        .unwrap();
        assert!(message.contains("'orders' which does not exist"), "{message}");

        assert!(check(
            &rule,
            Operation::DropIndex {
                name: "idx_missing".to_string(),
                table: None
            }
        )
        .is_some());
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut rev = Revision::new("0001").operation(Operation::drop_table("t"));
        rev.seal().unwrap();
        let mut ctx = LintContext::default();
        assert!(ChecksumMismatch.check_revision(&rev, &ctx).is_empty());

        ctx.recorded
            .insert(rev.id.clone(), rev.checksum().to_string());
        assert!(ChecksumMismatch.check_revision(&rev, &ctx).is_empty());

        ctx.recorded.insert(rev.id.clone(), "deadbeef".to_string());
        assert_eq!(ChecksumMismatch.check_revision(&rev, &ctx).len(), 1);
    }

    #[test]
    fn test_dialect_unsupported() {
        let rule = DialectUnsupported {
            dialect: Arc::new(SqliteDialect::new()),
        };
        let check_constraint = Operation::AddConstraint {
            table: "users".to_string(),
            constraint: Constraint::Check {
                name: "ck_email".to_string(),
                expression: "email LIKE '%@%'".to_string(),
            },
        };
        assert!(check(&rule, check_constraint).is_some());
        assert!(check(&rule, Operation::drop_column("users", "email")).is_none());
    }

    #[test]
    fn test_non_transactional() {
        let rev = Revision::new("0003").operation(Operation::raw("VACUUM", None));
        assert_eq!(NonTransactional.check_revision(&rev, &users_ctx()).len(), 1);

        let mut rev = Revision::new("0003");
        rev.transactional = false;
        assert_eq!(NonTransactional.check_revision(&rev, &users_ctx()).len(), 1);
    }

    #[test]
    fn test_mixed_backfill() {
        let rev = Revision::new("0003")
            .operation(Operation::add_column(
                "users",
                ColumnSchema::new("active", SqlType::Boolean),
            ))
            .operation(Operation::backfill("users", "UPDATE users SET active = 1"));
        assert_eq!(MixedBackfill.check_revision(&rev, &users_ctx()).len(), 1);

        let rev =
            Revision::new("0004").operation(Operation::backfill("users", "UPDATE users SET active = 1"));
        assert!(MixedBackfill.check_revision(&rev, &users_ctx()).is_empty());
    }

    #[test]
    fn test_conflicting_definition() {
        let rule = ConflictingDefinition;
        assert!(check(
            &rule,
            Operation::add_table("users", vec![ColumnSchema::new("id", SqlType::Integer)])
        )
        .is_some());
        assert!(check(
            &rule,
            Operation::add_column("users", ColumnSchema::new("email", SqlType::Text))
        )
        .is_some());
        assert!(check(&rule, Operation::rename_column("users", "id", "email")).is_some());
        assert!(check(
            &rule,
            Operation::add_column("users", ColumnSchema::new("phone", SqlType::Text))
        )
        .is_none());
    }

    #[test]
    fn test_builtin_rule_ids() {
        let linter = Linter::new(LintOptions::default());
        assert_eq!(
            linter.rule_ids(),
            vec![
                IRREVERSIBLE_WITHOUT_REVERSE,
                DESTRUCTIVE_WITHOUT_DEPRECATION,
                LOCK_INDUCING_RAW_STATEMENT,
                UNKNOWN_REFERENCE,
                CHECKSUM_MISMATCH,
                DIALECT_UNSUPPORTED,
                NON_TRANSACTIONAL,
                MIXED_BACKFILL,
                CONFLICTING_DEFINITION,
            ]
        );
    }
}
