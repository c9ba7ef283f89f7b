//! Run journal and execution attempts.
//!
//! Every pipeline run gets a `safeguard_runs` row before the first revision
//! executes. A row still `running` or `cancelled` when the next invocation
//! starts belongs to an interrupted run.

use std::fmt;

use chrono::{DateTime, Utc};
use oxide_safeguard_core::fingerprint::Fingerprint;
use oxide_safeguard_core::revision::RevisionId;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use crate::history::{parse_timestamp, AppliedState};

/// SQL to create the run journal.
pub const CREATE_RUNS_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS safeguard_runs (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    backup_id TEXT,
    from_revision TEXT,
    from_fingerprint TEXT,
    target TEXT
)
";

/// SQL to create the attempts audit table.
pub const CREATE_ATTEMPTS_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS safeguard_attempts (
    seq INTEGER PRIMARY KEY,
    run_id TEXT NOT NULL,
    revision TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    outcome TEXT NOT NULL,
    error TEXT
)
";

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Executing, or the process died while executing.
    Running,
    /// Every revision committed and verified.
    Succeeded,
    /// Failed before anything committed.
    Failed,
    /// Failed and recovered.
    RolledBack,
    /// Failed and recovery could not be verified.
    RecoveryFailed,
    /// Cancelled by the operator.
    Cancelled,
    /// Interrupted run evaluated by a later invocation.
    Resolved,
}

impl RunStatus {
    /// Stored spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::RecoveryFailed => "recovery_failed",
            Self::Cancelled => "cancelled",
            Self::Resolved => "resolved",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "rolled_back" => Self::RolledBack,
            "recovery_failed" => Self::RecoveryFailed,
            "cancelled" => Self::Cancelled,
            "resolved" => Self::Resolved,
            _ => Self::Running,
        }
    }

    /// Returns true for runs a later invocation must evaluate.
    #[must_use]
    pub fn is_interrupted(self) -> bool {
        matches!(self, Self::Running | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    /// Run id.
    pub id: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, once finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: RunStatus,
    /// Backup taken before the run.
    pub backup_id: Option<String>,
    /// Marker revision when the run started.
    pub from_revision: Option<RevisionId>,
    /// Schema fingerprint when the run started.
    pub from_fingerprint: Option<Fingerprint>,
    /// Revision the run was heading for.
    pub target: Option<RevisionId>,
}

/// Result of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Committed.
    Success,
    /// Failed and may be retried.
    TransientFailure,
    /// Failed and must not be retried.
    FatalFailure,
}

impl AttemptOutcome {
    /// Stored spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure => "transient_failure",
            Self::FatalFailure => "fatal_failure",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "success" => Self::Success,
            "transient_failure" => Self::TransientFailure,
            _ => Self::FatalFailure,
        }
    }
}

/// One attempt at applying one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionAttempt {
    /// Revision attempted.
    pub revision: RevisionId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Outcome.
    pub outcome: AttemptOutcome,
    /// Error detail for failures.
    pub error: Option<String>,
}

/// Access to the run journal and attempts tables.
#[derive(Debug, Clone)]
pub struct RunJournal {
    pool: SqlitePool,
}

type RunRow = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn run_from_row(row: RunRow) -> RunRecord {
    let (id, started_at, finished_at, status, backup_id, from_revision, from_fingerprint, target) =
        row;
    RunRecord {
        id,
        started_at: parse_timestamp(&started_at),
        finished_at: finished_at.as_deref().map(parse_timestamp),
        status: RunStatus::parse(&status),
        backup_id,
        from_revision: from_revision.map(RevisionId::from),
        from_fingerprint: from_fingerprint.map(Fingerprint::new),
        target: target.map(RevisionId::from),
    }
}

const RUN_COLUMNS: &str =
    "id, started_at, finished_at, status, backup_id, from_revision, from_fingerprint, target";

impl RunJournal {
    /// Creates a journal.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensures the journal tables exist.
    pub async fn ensure_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(CREATE_RUNS_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_ATTEMPTS_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Opens a run in `running` state. `from` is the applied state the run
    /// starts from.
    pub async fn start(
        &self,
        from: Option<&AppliedState>,
        target: Option<&RevisionId>,
        backup_id: Option<&str>,
    ) -> Result<RunRecord, sqlx::Error> {
        let record = RunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            backup_id: backup_id.map(str::to_string),
            from_revision: from.and_then(|s| s.revision.clone()),
            from_fingerprint: from.map(|s| s.fingerprint.clone()),
            target: target.cloned(),
        };
        sqlx::query(
            "INSERT INTO safeguard_runs \
             (id, started_at, status, backup_id, from_revision, from_fingerprint, target) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.started_at.to_rfc3339())
        .bind(record.status.as_str())
        .bind(record.backup_id.as_deref())
        .bind(record.from_revision.as_ref().map(RevisionId::as_str))
        .bind(record.from_fingerprint.as_ref().map(Fingerprint::as_str))
        .bind(target.map(RevisionId::as_str))
        .execute(&self.pool)
        .await?;
        debug!(run = %record.id, "Opened run");
        Ok(record)
    }

    /// Sets a run's status, stamping the finish time for terminal states.
    pub async fn finish(&self, run_id: &str, status: RunStatus) -> Result<(), sqlx::Error> {
        let finished_at = (status != RunStatus::Running).then(|| Utc::now().to_rfc3339());
        sqlx::query("UPDATE safeguard_runs SET status = ?, finished_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(finished_at)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        debug!(run = %run_id, status = %status, "Updated run");
        Ok(())
    }

    /// Fetches a run.
    pub async fn get(&self, run_id: &str) -> Result<Option<RunRecord>, sqlx::Error> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM safeguard_runs WHERE id = ?"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(run_from_row))
    }

    /// Runs left `running` or `cancelled`, oldest first.
    pub async fn interrupted(&self) -> Result<Vec<RunRecord>, sqlx::Error> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM safeguard_runs \
             WHERE status IN ('running', 'cancelled') ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(run_from_row).collect())
    }

    /// Records an attempt.
    pub async fn record_attempt(
        &self,
        run_id: &str,
        attempt: &ExecutionAttempt,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO safeguard_attempts \
             (run_id, revision, attempt, started_at, finished_at, outcome, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(attempt.revision.as_str())
        .bind(i64::from(attempt.attempt))
        .bind(attempt.started_at.to_rfc3339())
        .bind(attempt.finished_at.to_rfc3339())
        .bind(attempt.outcome.as_str())
        .bind(attempt.error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attempts of a run in order.
    pub async fn attempts(&self, run_id: &str) -> Result<Vec<ExecutionAttempt>, sqlx::Error> {
        let rows: Vec<(String, i64, String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT revision, attempt, started_at, finished_at, outcome, error \
             FROM safeguard_attempts WHERE run_id = ? ORDER BY seq",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(revision, attempt, started_at, finished_at, outcome, error)| ExecutionAttempt {
                    revision: RevisionId::from(revision),
                    attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
                    started_at: parse_timestamp(&started_at),
                    finished_at: parse_timestamp(&finished_at),
                    outcome: AttemptOutcome::parse(&outcome),
                    error,
                },
            )
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_journal() -> RunJournal {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        let journal = RunJournal::new(pool);
        journal.ensure_tables().await.unwrap();
        journal
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let journal = create_journal().await;
        let target = RevisionId::from("0002_b");
        let run = journal
            .start(None, Some(&target), Some("backup-1"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let interrupted = journal.interrupted().await.unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].target, Some(target));
        assert_eq!(interrupted[0].backup_id.as_deref(), Some("backup-1"));

        journal.finish(&run.id, RunStatus::Succeeded).await.unwrap();
        assert!(journal.interrupted().await.unwrap().is_empty());

        let stored = journal.get(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_runs_are_interrupted() {
        let journal = create_journal().await;
        let run = journal.start(None, None, None).await.unwrap();
        journal.finish(&run.id, RunStatus::Cancelled).await.unwrap();
        assert_eq!(journal.interrupted().await.unwrap().len(), 1);
        assert!(RunStatus::Cancelled.is_interrupted());
        assert!(!RunStatus::Resolved.is_interrupted());
    }

    #[tokio::test]
    async fn test_attempts_round_trip() {
        let journal = create_journal().await;
        let run = journal.start(None, None, None).await.unwrap();
        let now = Utc::now();
        for (n, outcome) in [AttemptOutcome::TransientFailure, AttemptOutcome::Success]
            .into_iter()
            .enumerate()
        {
            journal
                .record_attempt(
                    &run.id,
                    &ExecutionAttempt {
                        revision: RevisionId::from("0001_a"),
                        attempt: u32::try_from(n).unwrap() + 1,
                        started_at: now,
                        finished_at: now,
                        outcome,
                        error: (outcome != AttemptOutcome::Success)
                            .then(|| "database is locked".to_string()),
                    },
                )
                .await
                .unwrap();
        }

        let attempts = journal.attempts(&run.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::TransientFailure);
        assert_eq!(attempts[1].attempt, 2);
        assert_eq!(attempts[1].error, None);
    }
}
