//! Recovery after a failed or interrupted run.
//!
//! Recovery prefers undoing committed revisions with their reverse
//! operations and falls back to restoring the pre-run backup. Either way
//! the result is confirmed by comparing the live fingerprint with the one
//! the database had before the run.

use std::sync::Arc;

use oxide_safeguard_core::dialect::{MigrationDialect, SqliteDialect};
use oxide_safeguard_core::fingerprint::Fingerprint;
use oxide_safeguard_core::graph::RevisionGraph;
use oxide_safeguard_core::revision::RevisionId;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use tracing::{error, info, warn};

use crate::backup::{Backup, BackupCoordinator, RestoreConfirmation};
use crate::error::{BackupError, RollbackError, StateError};
use crate::executor::{ExecutionFailure, ExecutionReport};
use crate::history::{self, AppliedState, Direction, History};
use crate::inspector::{self, Inspector};
use crate::journal::{RunJournal, RunRecord, RunStatus};
use crate::retry::FailureClass;

/// How a failed run is undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Nothing was committed; only verify.
    NoOp,
    /// Revert the committed revisions, newest first.
    Reverse {
        /// Revisions to revert, in revert order.
        revisions: Vec<RevisionId>,
    },
    /// Restore the pre-run backup.
    Restore {
        /// Backup id.
        backup: String,
    },
}

/// A verified recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    /// Strategy that succeeded.
    pub strategy: RecoveryStrategy,
    /// Marker state after recovery.
    pub state: AppliedState,
}

/// Picks a strategy from what the run did.
///
/// A partially applied revision always needs a restore. Otherwise the
/// failed revision's transaction left no trace, so only committed
/// revisions need undoing.
#[must_use]
pub fn decide(
    graph: &RevisionGraph,
    report: &ExecutionReport,
    backup: Option<&Backup>,
) -> RecoveryStrategy {
    let restore = || RecoveryStrategy::Restore {
        backup: backup.map(|b| b.id.clone()).unwrap_or_default(),
    };
    if report.failure.as_ref().is_some_and(|f| f.partial) {
        return restore();
    }
    if report.committed.is_empty() {
        return RecoveryStrategy::NoOp;
    }
    let reversible = report
        .committed
        .iter()
        .all(|id| graph.get(id).is_some_and(|r| r.is_reversible()));
    if reversible {
        RecoveryStrategy::Reverse {
            revisions: report.committed.iter().rev().cloned().collect(),
        }
    } else {
        restore()
    }
}

/// Runs recovery strategies.
#[derive(Clone)]
pub struct RollbackManager {
    pool: SqlitePool,
    backups: BackupCoordinator,
    journal: RunJournal,
    dialect: Arc<dyn MigrationDialect>,
}

impl std::fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackManager")
            .field("backups", &self.backups)
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

impl RollbackManager {
    /// Creates a manager restoring through `backups`.
    #[must_use]
    pub fn new(pool: SqlitePool, backups: BackupCoordinator) -> Self {
        Self {
            journal: RunJournal::new(pool.clone()),
            pool,
            backups,
            dialect: Arc::new(SqliteDialect::new()),
        }
    }

    /// Undoes a failed run and verifies the database is back at `before`.
    ///
    /// Without a `backup` of its own, a restore falls back to the newest
    /// catalogued backup preceding the first revision the run touched.
    pub async fn recover(
        &self,
        graph: &RevisionGraph,
        before: &AppliedState,
        report: &ExecutionReport,
        backup: Option<&Backup>,
    ) -> Result<RecoveryOutcome, RollbackError> {
        let failed = report
            .failure
            .as_ref()
            .map(|f| f.revision.clone())
            .or_else(|| report.committed.last().cloned())
            .or_else(|| before.revision.clone())
            .unwrap_or_else(|| RevisionId::from("(empty)"));
        let first_touched = report.committed.first().unwrap_or(&failed);
        let strategy = decide(graph, report, backup);
        info!(revision = %failed, strategy = ?strategy, "Recovering failed run");

        match &strategy {
            RecoveryStrategy::NoOp => {
                let state = self
                    .confirm(before.revision.as_ref(), &before.fingerprint)
                    .await?;
                Ok(RecoveryOutcome { strategy, state })
            }
            RecoveryStrategy::Reverse { .. } => {
                match self.reverse(graph, before, report).await {
                    Ok(state) => Ok(RecoveryOutcome { strategy, state }),
                    Err(e) => {
                        warn!(error = %e, "Reverse path failed; falling back to restore");
                        let backup = self.backup_for(graph, backup, first_touched).await?;
                        self.restore(&backup).await
                    }
                }
            }
            RecoveryStrategy::Restore { .. } => {
                let backup = self.backup_for(graph, backup, first_touched).await?;
                self.restore(&backup).await
            }
        }
    }

    /// The run's own backup, or the newest one preceding `revision`.
    async fn backup_for(
        &self,
        graph: &RevisionGraph,
        backup: Option<&Backup>,
        revision: &RevisionId,
    ) -> Result<Backup, RollbackError> {
        if let Some(backup) = backup {
            return Ok(backup.clone());
        }
        match self.backups.catalog().latest_preceding(graph, revision).await? {
            Some(backup) => {
                info!(
                    backup = %backup.id,
                    revision = ?backup.revision().map(RevisionId::as_str),
                    "Restoring the latest backup preceding '{revision}'"
                );
                Ok(backup)
            }
            None => Err(RollbackError::NoBackup(revision.clone())),
        }
    }

    /// Reverts the committed revisions newest first and confirms the result.
    async fn reverse(
        &self,
        graph: &RevisionGraph,
        before: &AppliedState,
        report: &ExecutionReport,
    ) -> Result<AppliedState, RollbackError> {
        let committed = &report.committed;
        for (index, id) in committed.iter().enumerate().rev() {
            // The marker goes back to what this revision replaced in the run
            let to = index
                .checked_sub(1)
                .map_or(before.revision.as_ref(), |previous| committed.get(previous));
            self.revert(graph, id, to, Some(&report.run_id)).await?;
        }
        self.confirm(before.revision.as_ref(), &before.fingerprint)
            .await
    }

    /// Reverts one revision in its own transaction, moving the marker to
    /// `to`.
    pub async fn revert(
        &self,
        graph: &RevisionGraph,
        id: &RevisionId,
        to: Option<&RevisionId>,
        run_id: Option<&str>,
    ) -> Result<(), RollbackError> {
        let revision = graph.require(id)?;
        let revert_error = |message: String| RollbackError::Revert {
            revision: id.clone(),
            message,
        };
        let operations = revision
            .reverse_operations()
            .ok_or_else(|| revert_error("no reverse operations".to_string()))?;

        let mut statements = Vec::new();
        for op in &operations {
            statements.extend(
                self.dialect
                    .generate_sql(op)
                    .map_err(|e| revert_error(e.to_string()))?,
            );
        }

        info!(revision = %id, statements = statements.len(), "Reverting revision");
        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            sqlx::raw_sql(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| revert_error(e.to_string()))?;
        }
        let canonical = inspector::live_canonical(&mut tx).await?;
        let fingerprint = history::write_marker(&mut tx, to, &canonical).await?;
        history::record(
            &mut tx,
            id,
            revision.checksum(),
            Direction::Revert,
            &fingerprint,
            run_id,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn restore(&self, backup: &Backup) -> Result<RecoveryOutcome, RollbackError> {
        self.backups
            .restore(backup, &RestoreConfirmation::for_backup(backup))
            .await?;
        let state = self
            .confirm(backup.revision(), &backup.state.fingerprint)
            .await?;
        Ok(RecoveryOutcome {
            strategy: RecoveryStrategy::Restore {
                backup: backup.id.clone(),
            },
            state,
        })
    }

    /// Operator-requested restore of a named backup.
    pub async fn restore_backup(
        &self,
        backup_id: &str,
        confirmation: &RestoreConfirmation,
    ) -> Result<RecoveryOutcome, RollbackError> {
        let backup = self.backups.catalog().find(backup_id).await?;
        self.backups.restore(&backup, confirmation).await?;
        let state = self
            .confirm(backup.revision(), &backup.state.fingerprint)
            .await?;
        Ok(RecoveryOutcome {
            strategy: RecoveryStrategy::Restore { backup: backup.id },
            state,
        })
    }

    /// Checks the live schema and marker against the expected state.
    async fn confirm(
        &self,
        revision: Option<&RevisionId>,
        expected: &Fingerprint,
    ) -> Result<AppliedState, RollbackError> {
        let inspector = Inspector::new(self.pool.clone());
        let marker = inspector.marker().await?;
        let actual = inspector.live_canonical().await?.fingerprint();
        if &actual != expected || marker.revision.as_ref() != revision {
            error!(
                expected = %expected.short(),
                actual = %actual.short(),
                marker = ?marker.revision.as_ref().map(RevisionId::as_str),
                "Recovery could not be verified"
            );
            return Err(RollbackError::Unverified {
                revision: revision.cloned(),
                expected: expected.clone(),
                actual,
            });
        }
        info!(
            revision = ?revision.map(RevisionId::as_str),
            fingerprint = %actual.short(),
            "Recovery verified"
        );
        Ok(marker)
    }

    /// Settles a run a previous process left `running` or `cancelled`.
    ///
    /// A run that committed nothing and left the schema consistent is
    /// marked resolved. Anything else goes through [`Self::recover`] back
    /// to the state the run started from.
    pub async fn recover_interrupted(
        &self,
        graph: &RevisionGraph,
        run: &RunRecord,
    ) -> Result<RunStatus, RollbackError> {
        let committed = History::new(self.pool.clone())
            .committed_by(&run.id)
            .await?;
        let inspector = Inspector::new(self.pool.clone());
        let drifted = match inspector.inspect().await {
            Ok(_) => false,
            Err(StateError::Drift { .. }) => true,
            Err(e) => return Err(e.into()),
        };
        if committed.is_empty() && !drifted {
            info!(run = %run.id, "Interrupted run committed nothing");
            self.journal.finish(&run.id, RunStatus::Resolved).await?;
            return Ok(RunStatus::Resolved);
        }

        warn!(
            run = %run.id,
            committed = committed.len(),
            drifted,
            "Rolling back interrupted run"
        );
        let backup = match &run.backup_id {
            Some(id) => match self.backups.catalog().find(id).await {
                Ok(backup) => Some(backup),
                Err(BackupError::NotFound(_)) => {
                    warn!(run = %run.id, backup = %id, "Run backup is gone");
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let result = match interrupted_start(run, backup.as_ref()) {
            Some(fingerprint) => {
                let before = AppliedState {
                    revision: run.from_revision.clone(),
                    applied_at: run.started_at,
                    fingerprint,
                    environment: inspector.marker().await?.environment,
                };
                let failed = committed
                    .first()
                    .cloned()
                    .or_else(|| first_pending(graph, run))
                    .unwrap_or_else(|| no_backup_revision(run));
                let report = ExecutionReport {
                    run_id: run.id.clone(),
                    from: run.from_revision.clone(),
                    committed,
                    states: Vec::new(),
                    attempts: self.journal.attempts(&run.id).await?,
                    failure: Some(ExecutionFailure {
                        revision: failed,
                        class: FailureClass::Fatal,
                        attempts: 0,
                        message: format!("run {} was interrupted", run.status),
                        partial: drifted,
                        cancelled: true,
                    }),
                };
                self.recover(graph, &before, &report, backup.as_ref())
                    .await
                    .map(|_| ())
            }
            None => Err(RollbackError::NoBackup(no_backup_revision(run))),
        };

        match result {
            Ok(()) => {
                self.journal.finish(&run.id, RunStatus::RolledBack).await?;
                Ok(RunStatus::RolledBack)
            }
            Err(e) => {
                self.journal
                    .finish(&run.id, RunStatus::RecoveryFailed)
                    .await?;
                Err(e)
            }
        }
    }
}

/// Fingerprint an interrupted run started from.
fn interrupted_start(run: &RunRecord, backup: Option<&Backup>) -> Option<Fingerprint> {
    run.from_fingerprint.clone().or_else(|| {
        backup
            .filter(|b| b.revision() == run.from_revision.as_ref())
            .map(|b| b.state.fingerprint.clone())
    })
}

/// First revision the run would have applied.
fn first_pending(graph: &RevisionGraph, run: &RunRecord) -> Option<RevisionId> {
    let target = run.target.as_ref()?;
    let path = graph.path(run.from_revision.as_ref(), target).ok()?;
    path.first().map(|r| r.id.clone())
}

fn no_backup_revision(run: &RunRecord) -> RevisionId {
    run.target
        .clone()
        .or_else(|| run.from_revision.clone())
        .unwrap_or_else(|| RevisionId::from(run.id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::Retention;
    use crate::executor::{ExecutionHook, Executor};
    use crate::preflight::{PlannedRevision, Preflight, PreflightOptions};
    use crate::retry::FailureClass;
    use crate::storage::LocalObjectStore;
    use oxide_safeguard_core::graph::LoadTarget;
    use oxide_safeguard_core::operations::Operation;
    use oxide_safeguard_core::revision::Revision;
    use oxide_safeguard_core::schema::{ColumnSchema, SqlType};
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio_util::sync::CancellationToken;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    struct FailOn(&'static str);

    impl ExecutionHook for FailOn {
        fn before_commit(&self, revision: &PlannedRevision, _attempt: u32) -> Option<FailureClass> {
            (revision.id.as_str() == self.0).then_some(FailureClass::Fatal)
        }
    }

    fn users() -> Revision {
        Revision::new("0001").operation(Operation::add_table(
            "users",
            vec![ColumnSchema::new("id", SqlType::Integer).primary_key()],
        ))
    }

    struct Fixture {
        pool: SqlitePool,
        manager: RollbackManager,
        coordinator: BackupCoordinator,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_test_pool().await;
        Inspector::new(pool.clone()).bootstrap().await.unwrap();
        let coordinator = BackupCoordinator::new(
            pool.clone(),
            Arc::new(LocalObjectStore::new(dir.path().join("store"))),
            dir.path().join("backups"),
        );
        Fixture {
            manager: RollbackManager::new(pool.clone(), coordinator.clone()),
            pool,
            coordinator,
            _dir: dir,
        }
    }

    async fn run(
        pool: &SqlitePool,
        graph: &RevisionGraph,
        fail: &'static str,
    ) -> (AppliedState, ExecutionReport) {
        let before = Inspector::new(pool.clone()).inspect().await.unwrap();
        let plan = Preflight::new(pool.clone(), PreflightOptions::default())
            .validate(graph, &before, &LoadTarget::Head)
            .await
            .unwrap();
        let report = Executor::new(pool.clone())
            .hook(Arc::new(FailOn(fail)))
            .apply(&plan, &CancellationToken::new())
            .await
            .unwrap();
        (before, report)
    }

    #[tokio::test]
    async fn test_nothing_committed_is_noop() {
        let fx = fixture().await;
        let graph = RevisionGraph::build(vec![users()]).unwrap();
        let (before, report) = run(&fx.pool, &graph, "0001").await;

        let outcome = fx
            .manager
            .recover(&graph, &before, &report, None)
            .await
            .unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategy::NoOp);
        assert_eq!(outcome.state.fingerprint, before.fingerprint);
    }

    #[tokio::test]
    async fn test_committed_revisions_are_reversed() {
        let fx = fixture().await;
        let graph = RevisionGraph::build(vec![
            users(),
            Revision::new("0002").parent("0001").operation(Operation::add_column(
                "users",
                ColumnSchema::new("email", SqlType::Text),
            )),
            Revision::new("0003").parent("0002").operation(Operation::add_index(
                "idx_users_email",
                "users",
                vec!["email".to_string()],
                false,
            )),
        ])
        .unwrap();
        let (before, report) = run(&fx.pool, &graph, "0003").await;
        assert_eq!(report.committed.len(), 2);

        let outcome = fx
            .manager
            .recover(&graph, &before, &report, None)
            .await
            .unwrap();
        assert_eq!(
            outcome.strategy,
            RecoveryStrategy::Reverse {
                revisions: vec![RevisionId::from("0002"), RevisionId::from("0001")]
            }
        );
        assert!(outcome.state.revision.is_none());

        let history = Inspector::new(fx.pool.clone()).history().await.unwrap();
        let reverts = history
            .iter()
            .filter(|e| e.direction == Direction::Revert)
            .count();
        assert_eq!(reverts, 2);
    }

    fn irreversible_graph() -> RevisionGraph {
        RevisionGraph::build(vec![
            users(),
            Revision::new("0002").parent("0001").operation(Operation::raw(
                "INSERT INTO users (id) VALUES (1)",
                None,
            )),
            Revision::new("0003").parent("0002").operation(Operation::add_column(
                "users",
                ColumnSchema::new("email", SqlType::Text),
            )),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_irreversible_revision_needs_restore() {
        let fx = fixture().await;
        let graph = irreversible_graph();
        let state = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        let backup = fx
            .coordinator
            .snapshot(&state, Retention::Ephemeral)
            .await
            .unwrap();
        let (before, report) = run(&fx.pool, &graph, "0003").await;
        assert_eq!(
            decide(&graph, &report, Some(&backup)),
            RecoveryStrategy::Restore {
                backup: backup.id.clone()
            }
        );

        // Not handed a backup, recovery finds the catalogued one
        let outcome = fx
            .manager
            .recover(&graph, &before, &report, None)
            .await
            .unwrap();
        assert_eq!(
            outcome.strategy,
            RecoveryStrategy::Restore {
                backup: backup.id.clone()
            }
        );
        assert_eq!(outcome.state.fingerprint, before.fingerprint);
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE name = 'users'")
                .fetch_all(&fx.pool)
                .await
                .unwrap();
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn test_restore_without_any_backup_fails() {
        let fx = fixture().await;
        let graph = irreversible_graph();
        let (before, report) = run(&fx.pool, &graph, "0003").await;

        assert!(matches!(
            fx.manager.recover(&graph, &before, &report, None).await,
            Err(RollbackError::NoBackup(revision)) if revision.as_str() == "0001"
        ));
    }

    #[tokio::test]
    async fn test_unconfirmed_reverse_falls_back_to_backup() {
        let fx = fixture().await;
        let graph = RevisionGraph::build(vec![
            users(),
            Revision::new("0002").parent("0001").operation(Operation::add_column(
                "users",
                ColumnSchema::new("email", SqlType::Text),
            )),
        ])
        .unwrap();
        let state = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        let backup = fx
            .coordinator
            .snapshot(&state, Retention::Ephemeral)
            .await
            .unwrap();
        let (mut before, report) = run(&fx.pool, &graph, "0002").await;
        assert_eq!(report.committed, vec![RevisionId::from("0001")]);

        // The reverse path succeeds but cannot reach this fingerprint
        before.fingerprint = Fingerprint::new("unreachable");
        let outcome = fx
            .manager
            .recover(&graph, &before, &report, Some(&backup))
            .await
            .unwrap();
        assert_eq!(
            outcome.strategy,
            RecoveryStrategy::Restore {
                backup: backup.id.clone()
            }
        );
        assert_eq!(outcome.state.fingerprint, state.fingerprint);
    }

    #[tokio::test]
    async fn test_revert_on_merge_returns_marker_to_run_start() {
        let fx = fixture().await;
        fn table(id: &str, parents: &[&str], name: &str) -> Revision {
            parents.iter().fold(
                Revision::new(id).operation(Operation::add_table(
                    name,
                    vec![ColumnSchema::new("id", SqlType::Integer).primary_key()],
                )),
                |revision, parent| revision.parent(*parent),
            )
        }
        let graph = RevisionGraph::build(vec![
            table("a", &[], "users"),
            table("b", &["a"], "posts"),
            table("c", &["a"], "tags"),
            table("d", &["b", "c"], "links"),
        ])
        .unwrap();

        let state = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        let to_b = Preflight::new(fx.pool.clone(), PreflightOptions::default())
            .validate(&graph, &state, &LoadTarget::Named("b".into()))
            .await
            .unwrap();
        Executor::new(fx.pool.clone())
            .apply(&to_b, &CancellationToken::new())
            .await
            .unwrap();

        let (before, report) = run(&fx.pool, &graph, "d").await;
        assert_eq!(before.revision, Some(RevisionId::from("b")));
        assert_eq!(report.committed, vec![RevisionId::from("c")]);

        let outcome = fx
            .manager
            .recover(&graph, &before, &report, None)
            .await
            .unwrap();
        assert_eq!(outcome.state.revision, Some(RevisionId::from("b")));
        assert_eq!(outcome.state.fingerprint, before.fingerprint);
        let after = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        assert_eq!(after.revision, Some(RevisionId::from("b")));
    }

    #[tokio::test]
    async fn test_interrupted_run_on_consistent_database_is_resolved() {
        let fx = fixture().await;
        let graph = RevisionGraph::build(vec![users()]).unwrap();
        let journal = RunJournal::new(fx.pool.clone());
        let run = journal.start(None, None, None).await.unwrap();

        let status = fx.manager.recover_interrupted(&graph, &run).await.unwrap();
        assert_eq!(status, RunStatus::Resolved);
        assert!(journal.interrupted().await.unwrap().is_empty());
    }

    /// Cancels the run while the named revision is committing.
    struct CancelAt(&'static str, CancellationToken);

    impl ExecutionHook for CancelAt {
        fn before_commit(&self, revision: &PlannedRevision, _attempt: u32) -> Option<FailureClass> {
            if revision.id.as_str() == self.0 {
                self.1.cancel();
            }
            None
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_with_commits_is_reverted() {
        let fx = fixture().await;
        let graph = RevisionGraph::build(vec![
            users(),
            Revision::new("0002").parent("0001").operation(Operation::add_column(
                "users",
                ColumnSchema::new("email", SqlType::Text),
            )),
            Revision::new("0003").parent("0002").operation(Operation::add_index(
                "idx_users_email",
                "users",
                vec!["email".to_string()],
                false,
            )),
        ])
        .unwrap();
        let before = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        let plan = Preflight::new(fx.pool.clone(), PreflightOptions::default())
            .validate(&graph, &before, &LoadTarget::Head)
            .await
            .unwrap();
        let token = CancellationToken::new();
        let report = Executor::new(fx.pool.clone())
            .hook(Arc::new(CancelAt("0002", token.clone())))
            .apply(&plan, &token)
            .await
            .unwrap();
        assert_eq!(report.committed.len(), 2);
        assert!(report.failure.unwrap().cancelled);

        let journal = RunJournal::new(fx.pool.clone());
        let run = journal.get(&report.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.from_fingerprint.as_ref(), Some(&before.fingerprint));

        let status = fx.manager.recover_interrupted(&graph, &run).await.unwrap();
        assert_eq!(status, RunStatus::RolledBack);
        let after = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        assert_eq!(after.revision, None);
        assert_eq!(after.fingerprint, before.fingerprint);
        assert!(journal.interrupted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_run_with_drift_restores_latest_backup() {
        let fx = fixture().await;
        let graph = RevisionGraph::build(vec![users()]).unwrap();
        let state = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        fx.coordinator
            .snapshot(&state, Retention::Ephemeral)
            .await
            .unwrap();
        let journal = RunJournal::new(fx.pool.clone());
        // The run's own backup manifest is missing
        let run = journal
            .start(Some(&state), None, Some("gone"))
            .await
            .unwrap();
        // A half-applied statement outside any transaction
        sqlx::query("CREATE TABLE half_done (x INTEGER)")
            .execute(&fx.pool)
            .await
            .unwrap();

        let status = fx.manager.recover_interrupted(&graph, &run).await.unwrap();
        assert_eq!(status, RunStatus::RolledBack);
        Inspector::new(fx.pool.clone()).inspect().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_run_without_backup_needs_an_operator() {
        let fx = fixture().await;
        let graph = RevisionGraph::build(vec![users()]).unwrap();
        let state = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        let journal = RunJournal::new(fx.pool.clone());
        let run = journal.start(Some(&state), None, None).await.unwrap();
        sqlx::query("CREATE TABLE half_done (x INTEGER)")
            .execute(&fx.pool)
            .await
            .unwrap();

        assert!(matches!(
            fx.manager.recover_interrupted(&graph, &run).await,
            Err(RollbackError::NoBackup(_))
        ));
        let stored = journal.get(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::RecoveryFailed);
    }

    #[tokio::test]
    async fn test_operator_restore_requires_confirmation() {
        let fx = fixture().await;
        let state = Inspector::new(fx.pool.clone()).inspect().await.unwrap();
        let backup = fx
            .coordinator
            .snapshot(&state, Retention::Scheduled)
            .await
            .unwrap();

        let wrong = fx
            .manager
            .restore_backup(&backup.id, &RestoreConfirmation::new("nope"))
            .await;
        assert!(matches!(
            wrong,
            Err(RollbackError::Backup(BackupError::ConfirmationMismatch { .. }))
        ));

        let outcome = fx
            .manager
            .restore_backup(&backup.id, &RestoreConfirmation::new(backup.id.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.state.fingerprint, state.fingerprint);
    }
}
