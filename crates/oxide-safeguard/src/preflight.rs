//! Pre-flight validation.
//!
//! Turns the pending part of the graph into a [`Plan`] after checking it
//! against the live database: revisions are re-linted on the live schema,
//! recorded checksums are compared, statements are simulated on a scratch
//! copy and the rows touched by expensive operations are counted.

use std::fmt::Write as _;
use std::sync::Arc;

use oxide_safeguard_core::dialect::{MigrationDialect, SqliteDialect};
use oxide_safeguard_core::finding::{self, Severity, ValidationFinding};
use oxide_safeguard_core::graph::{LoadTarget, RevisionGraph};
use oxide_safeguard_core::lint::{rules, LintContext, LintOptions, Linter};
use oxide_safeguard_core::operations::{Operation, RiskClass};
use oxide_safeguard_core::revision::{Revision, RevisionId};
use oxide_safeguard_core::sql_scan;
use oxide_safeguard_core::state::SchemaState;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::{LintConfig, PreflightConfig};
use crate::error::ValidationError;
use crate::history::{AppliedState, History};
use crate::inspector;
use crate::simulate::{self, SIMULATION_SKIPPED};

/// Rule id for backfills above the row threshold.
pub const LARGE_BACKFILL: &str = "large-backfill";

/// Rule id for operations expected to hold a lock too long.
pub const LONG_LOCK: &str = "long-lock";

/// Knobs for [`Preflight::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightOptions {
    /// Lint settings.
    pub lint: LintOptions,
    /// Skip the scratch simulation and lock estimates.
    pub skip_simulation: bool,
    /// Let backfills above `large_backfill_rows` through.
    pub allow_large_backfill: bool,
    /// Backfill row count above which a backfill blocks.
    pub large_backfill_rows: u64,
    /// Assumed throughput for lock duration estimates.
    pub rows_per_second: u64,
    /// Estimated lock duration above which a warning is raised.
    pub lock_warning_ms: u64,
}

impl Default for PreflightOptions {
    fn default() -> Self {
        Self::from_config(&LintConfig::default(), &PreflightConfig::default())
    }
}

impl PreflightOptions {
    /// Builds options from the config file sections.
    #[must_use]
    pub fn from_config(lint: &LintConfig, preflight: &PreflightConfig) -> Self {
        Self {
            lint: lint.options(),
            skip_simulation: false,
            allow_large_backfill: false,
            large_backfill_rows: preflight.large_backfill_rows,
            rows_per_second: preflight.rows_per_second,
            lock_warning_ms: preflight.lock_warning_ms,
        }
    }
}

/// Estimated cost of one operation on the live data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImpactEstimate {
    /// Affected table.
    pub table: String,
    /// Rows the operation touches.
    pub rows: u64,
    /// Whether rows are rewritten rather than only scanned.
    pub rewrites: bool,
    /// Estimated time the table stays locked.
    pub estimated_lock_ms: u64,
}

/// One operation of a planned revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedOperation {
    /// Human-readable description.
    pub description: String,
    /// Risk class.
    pub risk: RiskClass,
    /// Statements the executor runs.
    pub statements: Vec<String>,
    /// Cost estimate, if the operation touches existing rows.
    pub impact: Option<ImpactEstimate>,
}

/// A revision ready to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRevision {
    /// Revision id.
    pub id: RevisionId,
    /// Description from the revision file.
    pub description: String,
    /// Checksum of the operations as planned.
    pub checksum: String,
    /// Whether the revision runs in one transaction.
    pub transactional: bool,
    /// Whether the revision can be undone without a restore.
    pub reversible: bool,
    /// Operations in order.
    pub operations: Vec<PlannedOperation>,
}

impl PlannedRevision {
    /// Every statement of the revision, in order.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.operations
            .iter()
            .flat_map(|op| op.statements.iter().map(String::as_str))
    }
}

/// Ordered, validated list of revisions to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    /// Revision the database is at.
    pub from: Option<RevisionId>,
    /// Revision the plan ends at.
    pub target: Option<RevisionId>,
    /// Revisions in application order.
    pub revisions: Vec<PlannedRevision>,
    /// Non-halting findings.
    pub findings: Vec<ValidationFinding>,
    /// Whether the plan was simulated.
    pub simulated: bool,
}

impl Plan {
    /// Returns true if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Revision ids in order.
    #[must_use]
    pub fn path(&self) -> Vec<RevisionId> {
        self.revisions.iter().map(|r| r.id.clone()).collect()
    }

    /// Renders the plan as a commented SQL script.
    #[must_use]
    pub fn render_sql(&self) -> String {
        let mut out = String::new();
        for revision in &self.revisions {
            let _ = writeln!(out, "-- Revision {}: {}", revision.id, revision.description);
            if !revision.transactional {
                out.push_str("-- (runs outside a transaction)\n");
            }
            for operation in &revision.operations {
                let _ = writeln!(out, "-- {}", operation.description);
                for statement in &operation.statements {
                    let _ = writeln!(out, "{};", statement.trim_end().trim_end_matches(';'));
                }
            }
            out.push('\n');
        }
        out
    }
}

enum Cost {
    Scan,
    Rewrite,
}

fn cost_of(op: &Operation) -> Option<(&str, Option<&str>, Cost)> {
    match op {
        Operation::DataBackfill { table, filter, .. } => {
            Some((table, filter.as_deref(), Cost::Rewrite))
        }
        Operation::DropColumn { table, .. } => Some((table, None, Cost::Rewrite)),
        Operation::AddIndex { table, .. } | Operation::AddConstraint { table, .. } => {
            Some((table, None, Cost::Scan))
        }
        Operation::RawStatement { sql, tables, .. }
            if !sql_scan::lock_inducing_keywords(sql).is_empty() =>
        {
            tables.first().map(|t| (t.as_str(), None, Cost::Scan))
        }
        _ => None,
    }
}

async fn count_rows(
    conn: &mut SqliteConnection,
    table: &str,
    filter: Option<&str>,
) -> Result<Option<u64>, sqlx::Error> {
    let exists: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;
    if exists.is_none() {
        return Ok(Some(0));
    }

    let mut sql = format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\""));
    if let Some(filter) = filter {
        let _ = write!(sql, " WHERE {filter}");
    }
    match sqlx::query_as::<_, (i64,)>(&sql).fetch_one(&mut *conn).await {
        Ok((rows,)) => Ok(Some(u64::try_from(rows).unwrap_or(0))),
        Err(e) => {
            warn!(table = %table, error = %e, "Could not count affected rows");
            Ok(None)
        }
    }
}

/// Validates pending revisions against a live database.
pub struct Preflight {
    pool: SqlitePool,
    linter: Linter,
    dialect: Arc<dyn MigrationDialect>,
    options: PreflightOptions,
}

impl std::fmt::Debug for Preflight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preflight")
            .field("linter", &self.linter)
            .field("dialect", &self.dialect.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Preflight {
    /// Creates a validator for SQLite.
    #[must_use]
    pub fn new(pool: SqlitePool, options: PreflightOptions) -> Self {
        let dialect: Arc<dyn MigrationDialect> = Arc::new(SqliteDialect::new());
        Self {
            pool,
            linter: Linter::with_dialect(options.lint.clone(), Arc::clone(&dialect)),
            dialect,
            options,
        }
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &PreflightOptions {
        &self.options
    }

    /// Plans the move from `state` to `target`.
    ///
    /// Fails with [`ValidationError::Blocked`] if any finding halts; the
    /// returned plan carries the rest.
    pub async fn validate(
        &self,
        graph: &RevisionGraph,
        state: &AppliedState,
        target: &LoadTarget,
    ) -> Result<Plan, ValidationError> {
        let from = state.revision.clone();
        let target = graph.resolve(target)?;
        let pending: Vec<&Revision> = match &target {
            Some(target) if from.as_ref() != Some(target) => {
                graph.path(from.as_ref(), target)?
            }
            _ => Vec::new(),
        };
        let path: Vec<RevisionId> = pending.iter().map(|r| r.id.clone()).collect();

        let mut findings = self.check_recorded(graph, from.as_ref()).await?;

        let mut conn = self.pool.acquire().await?;
        let live = inspector::live_schema(&mut conn).await?;
        let deprecated = pending
            .first()
            .map(|first| graph.deprecations_before(&first.id))
            .unwrap_or_default();
        let mut ctx = LintContext::new(SchemaState::from_schema(live), deprecated);

        let mut revisions = Vec::with_capacity(pending.len());
        for revision in &pending {
            findings.extend(self.linter.lint_in_context(revision, &mut ctx));
            let (planned, render_findings) = self.render(revision);
            findings.extend(render_findings);
            revisions.push(planned);
        }

        let simulated = !self.options.skip_simulation && !revisions.is_empty();
        if simulated {
            let ddl = inspector::schema_ddl(&mut conn).await?;
            findings.extend(simulate::simulate(&ddl, &revisions).await?);
        } else if self.options.skip_simulation {
            if let Some(first) = path.first() {
                findings.push(ValidationFinding::new(
                    SIMULATION_SKIPPED,
                    Severity::Info,
                    first,
                    "Simulation and lock estimates skipped on request",
                ));
            }
        }

        for revision in &mut revisions {
            findings.extend(self.estimate(&mut conn, graph, revision).await?);
        }
        drop(conn);

        if finding::halts(&findings, self.options.lint.strict) {
            let halting: Vec<ValidationFinding> = findings
                .into_iter()
                .filter(|f| f.halts(self.options.lint.strict))
                .collect();
            warn!(
                findings = halting.len(),
                path = ?path.iter().map(RevisionId::as_str).collect::<Vec<_>>(),
                "Pre-flight validation blocked"
            );
            return Err(ValidationError::Blocked {
                findings: halting,
                path,
            });
        }

        info!(
            from = ?from.as_ref().map(RevisionId::as_str),
            target = ?target.as_ref().map(RevisionId::as_str),
            pending = revisions.len(),
            findings = findings.len(),
            simulated,
            "Plan validated"
        );
        Ok(Plan {
            from,
            target,
            revisions,
            findings,
            simulated,
        })
    }

    async fn check_recorded(
        &self,
        graph: &RevisionGraph,
        from: Option<&RevisionId>,
    ) -> Result<Vec<ValidationFinding>, ValidationError> {
        let Some(from) = from else {
            return Ok(Vec::new());
        };
        let recorded = History::new(self.pool.clone()).recorded_checksums().await?;
        let mut findings = Vec::new();
        for revision in graph.path(None, from)? {
            findings.extend(self.linter.verify_checksum(revision, &recorded));
        }
        for id in recorded.keys().filter(|id| !graph.contains(id)) {
            debug!(revision = %id, "Recorded revision is not part of the graph");
        }
        Ok(findings)
    }

    fn render(&self, revision: &Revision) -> (PlannedRevision, Vec<ValidationFinding>) {
        let mut findings = Vec::new();
        let operations = revision
            .operations
            .iter()
            .enumerate()
            .map(|(index, op)| {
                let statements = match self.dialect.generate_sql(op) {
                    Ok(statements) => statements,
                    Err(e) => {
                        findings.push(
                            ValidationFinding::new(
                                rules::DIALECT_UNSUPPORTED,
                                Severity::Blocking,
                                &revision.id,
                                e.to_string(),
                            )
                            .at(index),
                        );
                        Vec::new()
                    }
                };
                PlannedOperation {
                    description: op.description(),
                    risk: op.risk_class(),
                    statements,
                    impact: None,
                }
            })
            .collect();

        let planned = PlannedRevision {
            id: revision.id.clone(),
            description: revision.description.clone(),
            checksum: revision.checksum().to_string(),
            transactional: !revision.is_non_transactional(),
            reversible: revision.is_reversible(),
            operations,
        };
        (planned, findings)
    }

    async fn estimate(
        &self,
        conn: &mut SqliteConnection,
        graph: &RevisionGraph,
        planned: &mut PlannedRevision,
    ) -> Result<Vec<ValidationFinding>, sqlx::Error> {
        let Some(revision) = graph.get(&planned.id) else {
            return Ok(Vec::new());
        };
        let mut findings = Vec::new();

        for (index, (op, slot)) in revision
            .operations
            .iter()
            .zip(planned.operations.iter_mut())
            .enumerate()
        {
            let Some((table, filter, cost)) = cost_of(op) else {
                continue;
            };
            let is_backfill = matches!(op, Operation::DataBackfill { .. });
            if self.options.skip_simulation && !is_backfill {
                continue;
            }
            let Some(rows) = count_rows(conn, table, filter).await? else {
                continue;
            };

            if is_backfill && rows > self.options.large_backfill_rows {
                let (severity, note) = if self.options.allow_large_backfill {
                    (Severity::Info, " (allowed)")
                } else {
                    (Severity::Blocking, "")
                };
                findings.push(
                    ValidationFinding::new(
                        LARGE_BACKFILL,
                        severity,
                        &planned.id,
                        format!(
                            "Backfill of '{table}' touches {rows} rows, above the limit of {}{note}",
                            self.options.large_backfill_rows
                        ),
                    )
                    .at(index),
                );
            }
            if self.options.skip_simulation {
                continue;
            }

            let estimated_lock_ms = rows.saturating_mul(1000) / self.options.rows_per_second.max(1);
            if estimated_lock_ms > self.options.lock_warning_ms {
                findings.push(
                    ValidationFinding::new(
                        LONG_LOCK,
                        Severity::Warning,
                        &planned.id,
                        format!(
                            "{} may lock '{table}' for about {estimated_lock_ms} ms ({rows} rows)",
                            slot.description
                        ),
                    )
                    .at(index),
                );
            }
            slot.impact = Some(ImpactEstimate {
                table: table.to_string(),
                rows,
                rewrites: matches!(cost, Cost::Rewrite),
                estimated_lock_ms,
            });
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::Inspector;
    use oxide_safeguard_core::operations::SchemaTarget;
    use oxide_safeguard_core::schema::{ColumnSchema, SqlType};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    fn users() -> Revision {
        Revision::new("0001").operation(Operation::add_table(
            "users",
            vec![
                ColumnSchema::new("id", SqlType::Integer).primary_key(),
                ColumnSchema::new("email", SqlType::Text),
            ],
        ))
    }

    async fn bootstrapped() -> (SqlitePool, AppliedState) {
        let pool = create_test_pool().await;
        let state = Inspector::new(pool.clone()).bootstrap().await.unwrap();
        (pool, state)
    }

    #[tokio::test]
    async fn test_plan_from_empty_database() {
        let (pool, state) = bootstrapped().await;
        let graph = RevisionGraph::build(vec![
            users(),
            Revision::new("0002").parent("0001").operation(Operation::add_index(
                "idx_users_email",
                "users",
                vec!["email".to_string()],
                false,
            )),
        ])
        .unwrap();

        let plan = Preflight::new(pool, PreflightOptions::default())
            .validate(&graph, &state, &LoadTarget::Head)
            .await
            .unwrap();

        assert!(plan.simulated);
        assert_eq!(plan.from, None);
        assert_eq!(plan.target, Some(RevisionId::from("0002")));
        assert_eq!(
            plan.path(),
            vec![RevisionId::from("0001"), RevisionId::from("0002")]
        );
        assert!(plan.render_sql().contains("CREATE INDEX"));
        // The table does not exist yet, so the index scans nothing
        let impact = plan.revisions[1].operations[0].impact.clone().unwrap();
        assert_eq!(impact.rows, 0);
    }

    #[tokio::test]
    async fn test_plan_at_target_is_empty() {
        let (pool, _) = bootstrapped().await;
        let graph = RevisionGraph::build(vec![]).unwrap();
        let state = Inspector::new(pool.clone()).inspect().await.unwrap();
        let plan = Preflight::new(pool, PreflightOptions::default())
            .validate(&graph, &state, &LoadTarget::Head)
            .await
            .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.target, None);
    }

    #[tokio::test]
    async fn test_drop_without_deprecation_blocks() {
        let (pool, state) = bootstrapped().await;
        let graph = RevisionGraph::build(vec![
            users(),
            Revision::new("0002")
                .parent("0001")
                .operation(Operation::drop_column("users", "email")),
        ])
        .unwrap();

        let err = Preflight::new(pool, PreflightOptions::default())
            .validate(&graph, &state, &LoadTarget::Head)
            .await
            .unwrap_err();
        match err {
            ValidationError::Blocked { findings, path } => {
                assert!(findings
                    .iter()
                    .any(|f| f.rule == rules::DESTRUCTIVE_WITHOUT_DEPRECATION));
                assert_eq!(path.len(), 2);
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deprecated_drop_passes() {
        let (pool, state) = bootstrapped().await;
        let graph = RevisionGraph::build(vec![
            users().deprecate(SchemaTarget::column("users", "email")),
            Revision::new("0002")
                .parent("0001")
                .operation(Operation::drop_column("users", "email"))
                .reverse_with(vec![Operation::add_column(
                    "users",
                    ColumnSchema::new("email", SqlType::Text),
                )]),
        ])
        .unwrap();

        let plan = Preflight::new(pool, PreflightOptions::default())
            .validate(&graph, &state, &LoadTarget::Head)
            .await
            .unwrap();
        assert_eq!(plan.revisions.len(), 2);
    }

    #[tokio::test]
    async fn test_large_backfill_blocks_unless_allowed() {
        let pool = create_test_pool().await;
        sqlx::raw_sql(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);
             INSERT INTO users (email) VALUES ('a'), ('b'), ('c');",
        )
        .execute(&pool)
        .await
        .unwrap();
        let graph = RevisionGraph::build(vec![
            users(),
            Revision::new("0002").parent("0001").operation(Operation::DataBackfill {
                table: "users".to_string(),
                sql: "UPDATE users SET email = lower(email) WHERE email IS NOT NULL".to_string(),
                filter: Some("email IS NOT NULL".to_string()),
                reverse: Some("SELECT 1".to_string()),
            }),
        ])
        .unwrap();
        Inspector::new(pool.clone()).bootstrap().await.unwrap();
        // Pretend 0001 is applied: the table already exists
        sqlx::query("UPDATE safeguard_applied_state SET revision = '0001'")
            .execute(&pool)
            .await
            .unwrap();
        let state = Inspector::new(pool.clone()).inspect().await.unwrap();

        let options = PreflightOptions {
            large_backfill_rows: 2,
            ..PreflightOptions::default()
        };
        let err = Preflight::new(pool.clone(), options.clone())
            .validate(&graph, &state, &LoadTarget::Head)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Blocked { ref findings, .. }
                if findings.iter().any(|f| f.rule == LARGE_BACKFILL)
        ));

        let allowed = PreflightOptions {
            allow_large_backfill: true,
            ..options
        };
        let plan = Preflight::new(pool, allowed)
            .validate(&graph, &state, &LoadTarget::Head)
            .await
            .unwrap();
        let impact = plan.revisions[0].operations[0].impact.clone().unwrap();
        assert_eq!(impact.rows, 3);
        assert!(impact.rewrites);
        assert!(plan.findings.iter().any(|f| f.rule == LARGE_BACKFILL));
    }

    #[tokio::test]
    async fn test_skip_simulation_is_recorded() {
        let (pool, state) = bootstrapped().await;
        let graph = RevisionGraph::build(vec![users()]).unwrap();
        let options = PreflightOptions {
            skip_simulation: true,
            ..PreflightOptions::default()
        };
        let plan = Preflight::new(pool, options)
            .validate(&graph, &state, &LoadTarget::Head)
            .await
            .unwrap();
        assert!(!plan.simulated);
        assert!(plan.findings.iter().any(|f| f.rule == SIMULATION_SKIPPED));
    }

    #[tokio::test]
    async fn test_simulation_catches_conflict_with_live_schema() {
        let pool = create_test_pool().await;
        sqlx::query("CREATE TABLE users (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        let state = Inspector::new(pool.clone()).bootstrap().await.unwrap();
        let graph = RevisionGraph::build(vec![Revision::new("0001").operation(
            Operation::raw("CREATE TABLE users (id INTEGER)", Some("DROP TABLE users".to_string())),
        )])
        .unwrap();

        let err = Preflight::new(pool, PreflightOptions::default())
            .validate(&graph, &state, &LoadTarget::Head)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Blocked { ref findings, .. }
                if findings.iter().any(|f| f.rule == simulate::SIMULATION_FAILED)
        ));
    }
}
