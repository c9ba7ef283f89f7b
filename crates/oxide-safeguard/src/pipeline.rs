//! The safety pipeline.
//!
//! `apply` runs every stage in order and stops at the first that refuses:
//!
//! 1. Load the revision graph and lint it against the checksum ledger.
//!    Nothing has connected to the database yet.
//! 2. Connect, take the migration lock and settle interrupted runs.
//! 3. Inspect the applied state and pre-flight the plan.
//! 4. Snapshot a backup, execute, and recover on failure.
//! 5. Seal applied checksums, verify and prune old backups.
//!
//! The lock is released on every path out of stage 2.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use oxide_safeguard_core::graph::{LoadTarget, RevisionGraph};
use oxide_safeguard_core::ledger::ChecksumLedger;
use oxide_safeguard_core::lint::{LintReport, Linter};
use oxide_safeguard_core::loader;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::{Backup, BackupCoordinator, RestoreConfirmation, Retention};
use crate::config::SafeguardConfig;
use crate::error::{
    Disposition, ExecutionError, Result, SafeguardError, StateError, ValidationError,
};
use crate::executor::{ExecutionHook, ExecutionReport, Executor};
use crate::history::{AppliedState, HistoryEntry};
use crate::inspector::Inspector;
use crate::journal::{RunJournal, RunStatus};
use crate::lock::{AdvisoryLock, LockGuard};
use crate::notify::{self, Event, Notifier, TracingNotifier};
use crate::preflight::{Plan, Preflight, PreflightOptions};
use crate::rollback::{RecoveryOutcome, RecoveryStrategy, RollbackManager};
use crate::storage::{LocalObjectStore, ObjectStore};
use crate::verify::{VerificationReport, Verifier};

/// Per-invocation switches, usually from CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Revision to move to.
    pub target: LoadTarget,
    /// Skip the scratch simulation and lock estimates.
    pub skip_simulation: bool,
    /// Let backfills above the configured row threshold through.
    pub allow_large_backfill: bool,
    /// Print the plan's SQL instead of running it.
    pub dry_run: bool,
    /// Warnings halt too.
    pub strict: bool,
}

/// What a successful `apply` did.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The validated plan.
    pub plan: Plan,
    /// Execution report; `None` when there was nothing to do.
    pub report: Option<ExecutionReport>,
    /// Backup taken before execution.
    pub backup: Option<Backup>,
    /// Post-apply verification.
    pub verification: Option<VerificationReport>,
}

impl ApplyOutcome {
    fn unchanged(plan: Plan) -> Self {
        Self {
            plan,
            report: None,
            backup: None,
            verification: None,
        }
    }
}

/// Runs pipeline commands for one database.
#[derive(Clone)]
pub struct Pipeline {
    config: SafeguardConfig,
    options: RunOptions,
    pool: Option<SqlitePool>,
    store: Option<Arc<dyn ObjectStore>>,
    notifier: Arc<dyn Notifier>,
    hook: Option<Arc<dyn ExecutionHook>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("connected", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline that connects to `config.database.url` on demand.
    #[must_use]
    pub fn new(config: SafeguardConfig) -> Self {
        Self {
            config,
            options: RunOptions::default(),
            pool: None,
            store: None,
            notifier: Arc::new(TracingNotifier),
            hook: None,
        }
    }

    /// Sets the per-invocation options.
    #[must_use]
    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses an existing pool instead of connecting.
    #[must_use]
    pub fn with_pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Uploads backups to `store` instead of the configured directory.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sends events to `notifier`.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Installs an execution fault injection hook.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn ExecutionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SafeguardConfig {
        &self.config
    }

    fn strict(&self) -> bool {
        self.options.strict || self.config.lint.strict
    }

    fn revisions_dir(&self) -> &Path {
        &self.config.revisions.dir
    }

    fn load(&self) -> Result<(RevisionGraph, ChecksumLedger)> {
        let graph = loader::load(self.revisions_dir(), &self.options.target)?;
        let ledger = ChecksumLedger::load(self.revisions_dir())?;
        Ok((graph, ledger))
    }

    fn lint_loaded(&self, graph: &RevisionGraph, ledger: &ChecksumLedger) -> Result<LintReport> {
        let mut options = self.config.lint.options();
        options.strict = self.strict();
        let report = Linter::new(options).lint_graph(graph, ledger);
        if report.halts(self.strict()) {
            return Err(ValidationError::Blocked {
                findings: report.halting(self.strict()),
                path: graph.ordered().map(|r| r.id.clone()).collect(),
            }
            .into());
        }
        Ok(report)
    }

    /// Loads and statically lints the revision graph without connecting.
    pub fn lint(&self) -> Result<LintReport> {
        let (graph, ledger) = self.load()?;
        self.lint_loaded(&graph, &ledger)
    }

    /// Opens the pool, or returns the one given with [`Self::with_pool`].
    ///
    /// The pool holds a single connection: the pipeline is the only writer.
    pub async fn connect(&self) -> Result<SqlitePool> {
        if let Some(pool) = &self.pool {
            return Ok(pool.clone());
        }
        let options = SqliteConnectOptions::from_str(&self.config.database.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(self.config.database.busy_timeout_ms));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        debug!(url = %self.config.database.url, "Connected");
        Ok(pool)
    }

    fn inspector(&self, pool: &SqlitePool) -> Inspector {
        Inspector::new(pool.clone()).environment(self.config.database.environment.clone())
    }

    fn backups(&self, pool: &SqlitePool) -> BackupCoordinator {
        let store = self.store.clone().unwrap_or_else(|| {
            Arc::new(LocalObjectStore::new(self.config.backup.store_dir.clone()))
        });
        BackupCoordinator::new(pool.clone(), store, self.config.backup.dir.clone())
            .upload_policy(self.config.backup.upload_policy)
    }

    fn preflight(&self, pool: &SqlitePool) -> Preflight {
        let mut lint = self.config.lint.clone();
        lint.strict = self.strict();
        let mut options = PreflightOptions::from_config(&lint, &self.config.preflight);
        options.skip_simulation = self.options.skip_simulation;
        options.allow_large_backfill = self.options.allow_large_backfill;
        Preflight::new(pool.clone(), options)
    }

    fn executor(&self, pool: &SqlitePool) -> Executor {
        let executor = Executor::new(pool.clone())
            .retry(self.config.retry.policy())
            .dry_run(self.options.dry_run);
        match &self.hook {
            Some(hook) => executor.hook(Arc::clone(hook)),
            None => executor,
        }
    }

    fn verifier(&self, pool: &SqlitePool) -> Verifier {
        Verifier::new(pool.clone()).probes(self.config.verify.probes.iter().cloned())
    }

    /// Creates the bookkeeping tables and records the current schema.
    pub async fn init(&self) -> Result<AppliedState> {
        let pool = self.connect().await?;
        Ok(self.inspector(&pool).bootstrap().await?)
    }

    /// Lints, inspects and pre-flights without taking the lock.
    pub async fn plan(&self) -> Result<Plan> {
        let (graph, ledger) = self.load()?;
        self.lint_loaded(&graph, &ledger)?;
        let pool = self.connect().await?;
        let state = self.inspector(&pool).inspect_against(&graph).await?;
        Ok(self
            .preflight(&pool)
            .validate(&graph, &state, &self.options.target)
            .await?)
    }

    /// Runs the full pipeline. Every failure is also sent to the notifier.
    pub async fn apply(&self, token: &CancellationToken) -> Result<ApplyOutcome> {
        let result = self.run_apply(token).await;
        if let Err(e) = &result {
            self.notify_failure(e).await;
        }
        result
    }

    async fn notify_failure(&self, error: &SafeguardError) {
        let exit_code = error.exit_code();
        let event = match error {
            SafeguardError::Verification(_) => Event::VerificationFailed,
            _ if exit_code == 1 || exit_code == 3 => Event::ApplyBlocked,
            _ => Event::ApplyFailed,
        };
        let mut payload = json!({
            "error": error.to_string(),
            "exit_code": exit_code,
        });
        if let SafeguardError::Execution {
            source,
            disposition,
        } = error
        {
            payload["kind"] = json!(execution_kind(source));
            payload["disposition"] = json!(disposition.to_string());
        }
        notify::deliver(self.notifier.as_ref(), event, payload).await;
    }

    fn lock(&self, pool: &SqlitePool) -> AdvisoryLock {
        AdvisoryLock::new(pool.clone()).lease(self.config.lock.lease())
    }

    async fn run_apply(&self, token: &CancellationToken) -> Result<ApplyOutcome> {
        let (graph, mut ledger) = self.load()?;
        self.lint_loaded(&graph, &ledger)?;

        let pool = self.connect().await?;
        if self.options.dry_run {
            let plan = self.plan_against(&pool, &graph).await?;
            let report = self
                .executor(&pool)
                .apply(&plan, token)
                .await
                .map_err(unchanged)?;
            return Ok(ApplyOutcome {
                plan,
                report: Some(report),
                backup: None,
                verification: None,
            });
        }

        // Uninitialized databases have no lock table either.
        self.inspector(&pool).marker().await?;
        let guard = self.lock(&pool).acquire().await?;
        let result = self
            .apply_locked(&pool, &graph, &mut ledger, &guard, token)
            .await;
        let released = guard.release().await;
        let outcome = result?;
        released?;
        Ok(outcome)
    }

    async fn plan_against(&self, pool: &SqlitePool, graph: &RevisionGraph) -> Result<Plan> {
        let state = self.inspector(pool).inspect_against(graph).await?;
        Ok(self
            .preflight(pool)
            .validate(graph, &state, &self.options.target)
            .await?)
    }

    async fn recover_interrupted(&self, pool: &SqlitePool, graph: &RevisionGraph) -> Result<()> {
        let rollback = RollbackManager::new(pool.clone(), self.backups(pool));
        for run in RunJournal::new(pool.clone()).interrupted().await? {
            warn!(run = %run.id, status = %run.status, "Found interrupted run");
            let status = rollback.recover_interrupted(graph, &run).await?;
            notify::deliver(
                self.notifier.as_ref(),
                Event::InterruptedRunResolved,
                json!({ "run": run.id, "status": status.as_str() }),
            )
            .await;
        }
        Ok(())
    }

    async fn apply_locked(
        &self,
        pool: &SqlitePool,
        graph: &RevisionGraph,
        ledger: &mut ChecksumLedger,
        guard: &LockGuard,
        token: &CancellationToken,
    ) -> Result<ApplyOutcome> {
        self.recover_interrupted(pool, graph).await?;

        let state = self.inspector(pool).inspect_against(graph).await?;
        let plan = self
            .preflight(pool)
            .validate(graph, &state, &self.options.target)
            .await?;
        for finding in &plan.findings {
            warn!(finding = %finding, "Proceeding despite finding");
        }
        if plan.is_empty() {
            info!("Database is up to date");
            return Ok(ApplyOutcome::unchanged(plan));
        }

        let backups = self.backups(pool);
        let backup = backups.snapshot(&state, Retention::Ephemeral).await?;
        notify::deliver(
            self.notifier.as_ref(),
            Event::ApplyStarted,
            json!({
                "from": plan.from,
                "target": plan.target,
                "revisions": plan.path(),
                "backup": backup.id,
            }),
        )
        .await;

        // Errors here come before the run is journaled, so nothing committed.
        let report = self
            .executor(pool)
            .execute(&plan, guard, Some(&backup.id), token)
            .await
            .map_err(unchanged)?;

        if let Some(failure) = &report.failure {
            let source = failure.to_error();
            let disposition = self
                .dispose(pool, graph, &state, &report, &backup, &source)
                .await;
            if disposition == Disposition::RecoveryFailed {
                self.seal(graph, ledger, &report)?;
            }
            error!(
                run = %report.run_id,
                revision = %failure.revision,
                disposition = %disposition,
                "Apply failed"
            );
            return Err(SafeguardError::Execution {
                source,
                disposition,
            });
        }

        self.seal(graph, ledger, &report)?;

        let verification = self
            .verifier(pool)
            .verify(graph, plan.target.as_ref())
            .await?
            .into_result()
            .inspect_err(|e| error!(run = %report.run_id, error = %e, "Verification failed"))?;

        match backups
            .catalog()
            .prune(self.config.backup.keep, backups.store())
            .await
        {
            Ok(removed) if !removed.is_empty() => {
                debug!(removed = removed.len(), "Pruned ephemeral backups");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to prune backups"),
        }

        notify::deliver(
            self.notifier.as_ref(),
            Event::ApplySucceeded,
            json!({
                "run": report.run_id,
                "committed": report.committed,
                "fingerprint": verification.actual_fingerprint,
            }),
        )
        .await;
        info!(
            committed = report.committed.len(),
            target = ?plan.target.as_ref().map(|t| t.as_str()),
            "Apply complete"
        );

        Ok(ApplyOutcome {
            plan,
            report: Some(report),
            backup: Some(backup),
            verification: Some(verification),
        })
    }

    /// Runs recovery for a failed report and records the result.
    async fn dispose(
        &self,
        pool: &SqlitePool,
        graph: &RevisionGraph,
        before: &AppliedState,
        report: &ExecutionReport,
        backup: &Backup,
        source: &ExecutionError,
    ) -> Disposition {
        if matches!(source, ExecutionError::Cancelled { .. }) {
            return Disposition::Interrupted {
                at: report.last_committed().cloned(),
            };
        }

        let journal = RunJournal::new(pool.clone());
        let rollback = RollbackManager::new(pool.clone(), self.backups(pool));
        let (status, disposition) = match rollback.recover(graph, before, report, Some(backup)).await {
            Ok(RecoveryOutcome {
                strategy: RecoveryStrategy::NoOp,
                ..
            }) => (RunStatus::RolledBack, Disposition::Unchanged),
            Ok(outcome) => (
                RunStatus::RolledBack,
                Disposition::RolledBack {
                    to: outcome.state.revision,
                },
            ),
            Err(e) => {
                error!(run = %report.run_id, error = %e, "Recovery failed");
                notify::deliver(
                    self.notifier.as_ref(),
                    Event::RecoveryFailed,
                    json!({ "run": report.run_id, "error": e.to_string() }),
                )
                .await;
                (RunStatus::RecoveryFailed, Disposition::RecoveryFailed)
            }
        };
        if let Err(e) = journal.finish(&report.run_id, status).await {
            warn!(run = %report.run_id, error = %e, "Failed to update run journal");
        }
        disposition
    }

    /// Records the checksums of revisions that remain applied.
    fn seal(
        &self,
        graph: &RevisionGraph,
        ledger: &mut ChecksumLedger,
        report: &ExecutionReport,
    ) -> Result<()> {
        let mut changed = false;
        for id in &report.committed {
            if let Some(revision) = graph.get(id) {
                changed |= ledger.record(id, revision.checksum());
            }
        }
        if changed {
            ledger.save()?;
            debug!(revisions = report.committed.len(), "Sealed checksums");
        }
        Ok(())
    }

    /// Verifies the database against the target revision.
    pub async fn verify(&self) -> Result<VerificationReport> {
        let graph = loader::load(self.revisions_dir(), &self.options.target)?;
        let expected = graph.resolve(&self.options.target)?;
        let pool = self.connect().await?;
        Ok(self
            .verifier(&pool)
            .verify(&graph, expected.as_ref())
            .await?)
    }

    /// Restores a backup on operator request.
    ///
    /// `confirm` must repeat the backup id.
    pub async fn rollback(&self, backup_id: &str, confirm: &str) -> Result<RecoveryOutcome> {
        let pool = self.connect().await?;
        self.inspector(&pool).marker().await?;
        let guard = self.lock(&pool).acquire().await?;
        let rollback = RollbackManager::new(pool.clone(), self.backups(&pool));
        let result = rollback
            .restore_backup(backup_id, &RestoreConfirmation::new(confirm))
            .await;
        let released = guard.release().await;
        let outcome = result?;
        released?;

        notify::deliver(
            self.notifier.as_ref(),
            Event::BackupRestored,
            json!({ "backup": backup_id, "revision": outcome.state.revision }),
        )
        .await;
        Ok(outcome)
    }

    /// Lists applied and reverted revisions, oldest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        let pool = self.connect().await?;
        Ok(self.inspector(&pool).history().await?)
    }

    /// Lists backups in the catalog, oldest first.
    pub async fn backups_list(&self) -> Result<Vec<Backup>> {
        let pool = self.connect().await?;
        Ok(self.backups(&pool).catalog().list().await?)
    }

    /// Removes a stale lock. Returns true if one was held.
    pub async fn force_unlock(&self) -> Result<bool> {
        let pool = self.connect().await?;
        self.inspector(&pool).marker().await?;
        Ok(AdvisoryLock::new(pool).force_unlock().await?)
    }
}

fn execution_kind(source: &ExecutionError) -> &'static str {
    match source {
        ExecutionError::Transient { .. } => "transient",
        ExecutionError::Fatal { .. } => "fatal",
        ExecutionError::Cancelled { .. } => "cancelled",
        _ => "error",
    }
}

fn unchanged(source: ExecutionError) -> SafeguardError {
    match source {
        ExecutionError::Lock(e) => SafeguardError::Lock(e),
        ExecutionError::State(e @ StateError::MissingMarker) => SafeguardError::State(e),
        source => SafeguardError::Execution {
            source,
            disposition: Disposition::Unchanged,
        },
    }
}
