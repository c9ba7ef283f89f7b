//! Migration executor.
//!
//! Applies a validated [`Plan`] one revision at a time. Each revision runs
//! in its own transaction together with the marker update, so a revision is
//! either fully applied and recorded or not at all. Transient failures are
//! retried with backoff; fatal ones stop the run and are handed back to the
//! caller for recovery.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use oxide_safeguard_core::revision::RevisionId;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ExecutionError;
use crate::history::{self, Direction};
use crate::inspector::{self, Inspector};
use crate::journal::{AttemptOutcome, ExecutionAttempt, RunJournal, RunStatus};
use crate::lock::{AdvisoryLock, LockGuard};
use crate::preflight::{Plan, PlannedRevision};
use crate::retry::{classify, FailureClass, RetryPolicy};

/// Lifecycle of one revision within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionState {
    /// Not started.
    Pending,
    /// An attempt is in progress.
    Running,
    /// Committed with the marker.
    Committed,
    /// Last attempt failed transiently and retries ran out.
    TransientFailed,
    /// Failed in a way that must not be retried.
    FatalFailed,
}

/// Fault injection point, called after a revision's statements ran and
/// before its transaction commits.
pub trait ExecutionHook: Send + Sync {
    /// Returns a failure class to make the attempt fail with it.
    fn before_commit(&self, revision: &PlannedRevision, attempt: u32) -> Option<FailureClass>;
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionFailure {
    /// Revision that failed.
    pub revision: RevisionId,
    /// Failure class of the last attempt.
    pub class: FailureClass,
    /// Attempts made.
    pub attempts: u32,
    /// Error detail.
    pub message: String,
    /// Some statements of a non-transactional revision were applied.
    pub partial: bool,
    /// The run was cancelled.
    pub cancelled: bool,
}

impl ExecutionFailure {
    fn journal(revision: &RevisionId, attempts: u32, error: &sqlx::Error) -> Self {
        error!(revision = %revision, error = %error, "Run journal write failed");
        Self {
            revision: revision.clone(),
            class: FailureClass::Fatal,
            attempts,
            message: format!("Run journal write failed: {error}"),
            partial: false,
            cancelled: false,
        }
    }

    /// Converts the failure into the matching error.
    #[must_use]
    pub fn to_error(&self) -> ExecutionError {
        if self.cancelled {
            return ExecutionError::Cancelled {
                revision: self.revision.clone(),
            };
        }
        match self.class {
            FailureClass::Transient => ExecutionError::Transient {
                revision: self.revision.clone(),
                attempts: self.attempts,
                message: self.message.clone(),
            },
            FailureClass::Fatal => ExecutionError::Fatal {
                revision: self.revision.clone(),
                message: self.message.clone(),
            },
        }
    }
}

/// Outcome of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Run journal id.
    pub run_id: String,
    /// Marker revision before the run.
    pub from: Option<RevisionId>,
    /// Revisions committed, in order.
    pub committed: Vec<RevisionId>,
    /// Final state of every planned revision.
    pub states: Vec<(RevisionId, RevisionState)>,
    /// Every attempt made.
    pub attempts: Vec<ExecutionAttempt>,
    /// Set when the run stopped early.
    pub failure: Option<ExecutionFailure>,
}

impl ExecutionReport {
    /// Returns true if every planned revision committed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Revision the marker is at after the run.
    #[must_use]
    pub fn last_committed(&self) -> Option<&RevisionId> {
        self.committed.last().or(self.from.as_ref())
    }
}

struct StepFailure {
    class: FailureClass,
    message: String,
    partial: bool,
    cancelled: bool,
}

impl StepFailure {
    fn cancelled(partial: bool) -> Self {
        Self {
            class: FailureClass::Fatal,
            message: "cancelled".to_string(),
            partial,
            cancelled: true,
        }
    }

    fn escalate(mut self, partial: bool) -> Self {
        if partial {
            self.partial = true;
            self.class = FailureClass::Fatal;
        }
        self
    }
}

impl From<sqlx::Error> for StepFailure {
    fn from(e: sqlx::Error) -> Self {
        Self {
            class: classify(&e),
            message: e.to_string(),
            partial: false,
            cancelled: false,
        }
    }
}

/// Executes plans against a database.
#[derive(Clone)]
pub struct Executor {
    pool: SqlitePool,
    journal: RunJournal,
    retry: RetryPolicy,
    hook: Option<Arc<dyn ExecutionHook>>,
    dry_run: bool,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("retry", &self.retry)
            .field("hook", &self.hook.is_some())
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor with the default retry policy.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            journal: RunJournal::new(pool.clone()),
            pool,
            retry: RetryPolicy::default(),
            hook: None,
            dry_run: false,
        }
    }

    /// Sets the retry policy for transient failures.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Installs a fault injection hook.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn ExecutionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Enables dry-run mode (SQL is printed but not executed).
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Returns the run journal.
    #[must_use]
    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    /// Takes the lock, executes `plan` and releases the lock on every path.
    pub async fn apply(
        &self,
        plan: &Plan,
        token: &CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError> {
        if self.dry_run {
            return Ok(self.render(plan));
        }
        let guard = AdvisoryLock::new(self.pool.clone()).acquire().await?;
        let result = self.execute(plan, &guard, None, token).await;
        guard.release().await?;
        result
    }

    fn render(&self, plan: &Plan) -> ExecutionReport {
        println!("{}", plan.render_sql());
        ExecutionReport {
            run_id: String::new(),
            from: plan.from.clone(),
            committed: Vec::new(),
            states: plan
                .revisions
                .iter()
                .map(|r| (r.id.clone(), RevisionState::Pending))
                .collect(),
            attempts: Vec::new(),
            failure: None,
        }
    }

    /// Executes `plan` under a held lock.
    ///
    /// Fails with [`ExecutionError::StalePlan`] if the database moved since
    /// the plan was made. Errors are only returned before the run is
    /// journaled; after that a run that stops early, including on a journal
    /// write failure, is reported through the report's `failure` so the
    /// caller can recover.
    pub async fn execute(
        &self,
        plan: &Plan,
        guard: &LockGuard,
        backup_id: Option<&str>,
        token: &CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError> {
        if self.dry_run {
            return Ok(self.render(plan));
        }

        let marker = Inspector::new(self.pool.clone()).marker().await?;
        if marker.revision != plan.from {
            return Err(ExecutionError::StalePlan {
                planned: plan.from.clone(),
                actual: marker.revision,
            });
        }

        let run = self
            .journal
            .start(Some(&marker), plan.target.as_ref(), backup_id)
            .await?;
        info!(
            run = %run.id,
            holder = %guard.holder(),
            revisions = plan.revisions.len(),
            "Executing plan"
        );

        let mut report = ExecutionReport {
            run_id: run.id.clone(),
            from: plan.from.clone(),
            committed: Vec::new(),
            states: plan
                .revisions
                .iter()
                .map(|r| (r.id.clone(), RevisionState::Pending))
                .collect(),
            attempts: Vec::new(),
            failure: None,
        };

        'plan: for (index, planned) in plan.revisions.iter().enumerate() {
            if token.is_cancelled() {
                report.failure = Some(ExecutionFailure {
                    revision: planned.id.clone(),
                    class: FailureClass::Fatal,
                    attempts: 0,
                    message: "cancelled".to_string(),
                    partial: false,
                    cancelled: true,
                });
                break;
            }

            let mut attempt = 0;
            loop {
                attempt += 1;
                report.states[index].1 = RevisionState::Running;
                info!(revision = %planned.id, attempt, "Applying revision");

                let started_at = Utc::now();
                let result = if planned.transactional {
                    self.run_transactional(planned, attempt, &run.id, token)
                        .await
                } else {
                    self.run_autocommit(planned, attempt, &run.id, token).await
                };

                let (outcome, failure) = match result {
                    Ok(()) => (AttemptOutcome::Success, None),
                    Err(f) if f.class == FailureClass::Transient => {
                        (AttemptOutcome::TransientFailure, Some(f))
                    }
                    Err(f) => (AttemptOutcome::FatalFailure, Some(f)),
                };
                let record = ExecutionAttempt {
                    revision: planned.id.clone(),
                    attempt,
                    started_at,
                    finished_at: Utc::now(),
                    outcome,
                    error: failure.as_ref().map(|f| f.message.clone()),
                };
                let journaled = self.journal.record_attempt(&run.id, &record).await;
                report.attempts.push(record);

                let Some(failure) = failure else {
                    report.states[index].1 = RevisionState::Committed;
                    report.committed.push(planned.id.clone());
                    info!(revision = %planned.id, attempt, "Revision committed");
                    if let Err(e) = journaled {
                        report.failure = Some(ExecutionFailure::journal(&planned.id, attempt, &e));
                        break 'plan;
                    }
                    break;
                };
                if let Err(e) = journaled {
                    warn!(revision = %planned.id, attempt, error = %e, "Failed to journal attempt");
                }

                let retry = failure.class == FailureClass::Transient
                    && !failure.cancelled
                    && self.retry.allows_retry_after(attempt);
                if retry {
                    warn!(
                        revision = %planned.id,
                        attempt,
                        error = %failure.message,
                        delay_ms = self.retry.backoff(attempt).as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = self.retry.wait(attempt) => continue,
                    }
                    // Cancelled while backing off
                    report.states[index].1 = RevisionState::TransientFailed;
                    report.failure = Some(ExecutionFailure {
                        revision: planned.id.clone(),
                        class: FailureClass::Fatal,
                        attempts: attempt,
                        message: "cancelled".to_string(),
                        partial: false,
                        cancelled: true,
                    });
                    break 'plan;
                }

                report.states[index].1 = match failure.class {
                    FailureClass::Transient => RevisionState::TransientFailed,
                    FailureClass::Fatal => RevisionState::FatalFailed,
                };
                error!(
                    revision = %planned.id,
                    attempts = attempt,
                    class = ?failure.class,
                    partial = failure.partial,
                    error = %failure.message,
                    "Revision failed"
                );
                report.failure = Some(ExecutionFailure {
                    revision: planned.id.clone(),
                    class: failure.class,
                    attempts: attempt,
                    message: failure.message,
                    partial: failure.partial,
                    cancelled: failure.cancelled,
                });
                break 'plan;
            }
        }

        let status = match &report.failure {
            None => RunStatus::Succeeded,
            Some(f) if f.cancelled => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
        };
        if let Err(e) = self.journal.finish(&run.id, status).await {
            match (&report.failure, report.committed.last()) {
                (None, Some(last)) => {
                    report.failure = Some(ExecutionFailure::journal(last, 1, &e));
                }
                _ => warn!(run = %run.id, error = %e, "Failed to close run"),
            }
        }
        info!(
            run = %run.id,
            committed = report.committed.len(),
            status = %status,
            "Plan execution finished"
        );
        Ok(report)
    }

    fn inject(&self, planned: &PlannedRevision, attempt: u32) -> Result<(), StepFailure> {
        let Some(class) = self
            .hook
            .as_ref()
            .and_then(|hook| hook.before_commit(planned, attempt))
        else {
            return Ok(());
        };
        Err(StepFailure {
            class,
            message: format!("Injected {class:?} failure before commit"),
            partial: false,
            cancelled: false,
        })
    }

    async fn run_statement(
        conn: &mut SqliteConnection,
        statement: &str,
        token: &CancellationToken,
    ) -> Result<(), StepFailure> {
        debug!(sql = %statement, "Executing SQL");
        tokio::select! {
            biased;
            () = token.cancelled() => Err(StepFailure::cancelled(false)),
            result = sqlx::raw_sql(statement).execute(&mut *conn) => {
                result?;
                Ok(())
            }
        }
    }

    async fn advance_marker(
        conn: &mut SqliteConnection,
        planned: &PlannedRevision,
        run_id: &str,
    ) -> Result<(), sqlx::Error> {
        let canonical = inspector::live_canonical(&mut *conn).await?;
        let fingerprint = history::write_marker(&mut *conn, Some(&planned.id), &canonical).await?;
        history::record(
            &mut *conn,
            &planned.id,
            &planned.checksum,
            Direction::Apply,
            &fingerprint,
            Some(run_id),
        )
        .await
    }

    async fn run_transactional(
        &self,
        planned: &PlannedRevision,
        attempt: u32,
        run_id: &str,
        token: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let mut tx = self.pool.begin().await?;
        for statement in planned.statements() {
            Self::run_statement(&mut tx, statement, token).await?;
        }
        self.inject(planned, attempt)?;
        Self::advance_marker(&mut tx, planned, run_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn run_autocommit(
        &self,
        planned: &PlannedRevision,
        attempt: u32,
        run_id: &str,
        token: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let mut conn = self.pool.acquire().await?;
        let mut executed = 0usize;
        for statement in planned.statements() {
            Self::run_statement(&mut conn, statement, token)
                .await
                .map_err(|f| {
                    let partial = executed > 0;
                    if f.cancelled {
                        StepFailure::cancelled(partial)
                    } else {
                        f.escalate(partial)
                    }
                })?;
            executed += 1;
        }
        let partial = executed > 0;
        self.inject(planned, attempt).map_err(|f| f.escalate(partial))?;

        let result = async {
            let mut tx = conn.begin().await?;
            Self::advance_marker(&mut tx, planned, run_id).await?;
            tx.commit().await
        }
        .await;
        result.map_err(|e| StepFailure::from(e).escalate(partial))
    }
}
