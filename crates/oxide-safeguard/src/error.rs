//! Error types for the safety pipeline.

use std::path::PathBuf;

use oxide_safeguard_core::error::{DialectError, GraphError};
use oxide_safeguard_core::finding::ValidationFinding;
use oxide_safeguard_core::fingerprint::Fingerprint;
use oxide_safeguard_core::revision::RevisionId;

fn join_ids(ids: &[RevisionId]) -> String {
    if ids.is_empty() {
        return "(empty)".to_string();
    }
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn show_revision(revision: Option<&RevisionId>) -> String {
    revision.map_or_else(|| "(empty)".to_string(), ToString::to_string)
}

/// Errors reading the applied-state marker.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The database was never bootstrapped.
    #[error("Database has no applied-state marker; run `oxide-safeguard init` first")]
    MissingMarker,

    /// `bootstrap` was called on an initialized database.
    #[error("Database is already initialized at revision {}", show_revision(.revision.as_ref()))]
    AlreadyInitialized {
        /// Revision the marker points at.
        revision: Option<RevisionId>,
    },

    /// The live schema no longer matches the recorded fingerprint.
    #[error(
        "Schema drift: live fingerprint {} does not match recorded {}\n{}",
        .actual.short(),
        .recorded.short(),
        .diff.join("\n")
    )]
    Drift {
        /// Fingerprint recorded with the marker.
        recorded: Fingerprint,
        /// Fingerprint of the live schema.
        actual: Fingerprint,
        /// `-` lines recorded but missing, `+` lines live but unrecorded.
        diff: Vec<String>,
    },

    /// The marker names a revision the graph does not know.
    #[error("Database is at revision '{0}' which is not part of the revision graph")]
    UnknownRevision(RevisionId),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Blocking outcome of static linting or pre-flight validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Blocking findings halted the pipeline.
    #[error(
        "{} blocking finding(s) on path {}:\n{}",
        .findings.len(),
        join_ids(.path),
        .findings.iter().map(|f| format!("  {f}")).collect::<Vec<_>>().join("\n")
    )]
    Blocked {
        /// The findings that halted.
        findings: Vec<ValidationFinding>,
        /// Revision path that was attempted.
        path: Vec<RevisionId>,
    },

    /// The graph could not produce a path.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The database state is unusable.
    #[error(transparent)]
    State(#[from] StateError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from the object store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading or writing an object failed.
    #[error("IO error at '{location}': {source}")]
    Io {
        /// Object location.
        location: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The object does not exist.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The store refused the request.
    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// Errors taking or restoring a backup.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Local backup file or manifest IO failed.
    #[error("IO error at '{path}': {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Upload failed and the policy does not tolerate it.
    #[error("Upload of backup '{backup}' failed: {source}")]
    Upload {
        /// Backup id.
        backup: String,
        /// Underlying error.
        #[source]
        source: StorageError,
    },

    /// Neither the object store nor the local copy could be read.
    #[error("Backup '{backup}' could not be fetched: {source}")]
    Fetch {
        /// Backup id.
        backup: String,
        /// Underlying error.
        #[source]
        source: StorageError,
    },

    /// The fetched dump does not hash to the recorded checksum.
    #[error("Backup '{backup}' failed integrity check: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Backup id.
        backup: String,
        /// Checksum recorded at snapshot time.
        expected: String,
        /// Checksum of the fetched bytes.
        actual: String,
    },

    /// The restore confirmation names a different backup.
    #[error("Restore confirmation '{confirmation}' does not match backup '{backup}'")]
    ConfirmationMismatch {
        /// Backup id.
        backup: String,
        /// Confirmation given.
        confirmation: String,
    },

    /// No backup with this id in the catalog.
    #[error("Backup not found: {0}")]
    NotFound(String),

    /// A manifest could not be encoded or decoded.
    #[error("Invalid backup manifest '{path}': {source}")]
    Manifest {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors acquiring the cross-process lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another invocation holds the lock.
    #[error(
        "Migration lock is held by {holder}{}{}",
        .pid.map(|p| format!(" (pid {p})")).unwrap_or_default(),
        .since.as_ref().map(|s| format!(" since {s}")).unwrap_or_default()
    )]
    Held {
        /// Holder id, or `unknown` when the database itself was busy.
        holder: String,
        /// Holder process id.
        pid: Option<i64>,
        /// Acquisition timestamp.
        since: Option<String>,
    },

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors applying a plan.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Retries were exhausted on a transient failure.
    #[error("Transient failure applying '{revision}' after {attempts} attempt(s): {message}")]
    Transient {
        /// Revision being applied.
        revision: RevisionId,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        message: String,
    },

    /// A failure that is never retried.
    #[error("Fatal failure applying '{revision}': {message}")]
    Fatal {
        /// Revision being applied.
        revision: RevisionId,
        /// Error detail.
        message: String,
    },

    /// The run was cancelled.
    #[error("Run cancelled while applying '{revision}'")]
    Cancelled {
        /// Revision that was running or next.
        revision: RevisionId,
    },

    /// The marker moved between planning and execution.
    #[error(
        "Database moved from {} to {} since the plan was made",
        show_revision(.planned.as_ref()),
        show_revision(.actual.as_ref())
    )]
    StalePlan {
        /// Revision the plan starts from.
        planned: Option<RevisionId>,
        /// Revision the marker is at.
        actual: Option<RevisionId>,
    },

    /// SQL could not be generated for an operation.
    #[error("Cannot render revision '{revision}': {source}")]
    Dialect {
        /// Revision being rendered.
        revision: RevisionId,
        /// Underlying error.
        #[source]
        source: DialectError,
    },

    /// Lock error.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// State error.
    #[error(transparent)]
    State(#[from] StateError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors recovering from a failed run.
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    /// Recovery ran but the schema does not match the expected state.
    #[error(
        "Rollback could not be verified: expected fingerprint {} at {}, found {}",
        .expected.short(),
        show_revision(.revision.as_ref()),
        .actual.short()
    )]
    Unverified {
        /// Revision the database should be at.
        revision: Option<RevisionId>,
        /// Expected fingerprint.
        expected: Fingerprint,
        /// Live fingerprint.
        actual: Fingerprint,
    },

    /// Reverse operations of a revision failed.
    #[error("Reverting '{revision}' failed: {message}")]
    Revert {
        /// Revision being reverted.
        revision: RevisionId,
        /// Error detail.
        message: String,
    },

    /// A full restore was needed but no backup precedes the failed revision.
    #[error("No backup available to restore before '{0}'")]
    NoBackup(RevisionId),

    /// The backup restore failed.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// The graph walk failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Re-inspection failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from post-apply verification.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// One or more checks failed.
    #[error("Verification failed:\n{}", .failures.iter().map(|f| format!("  - {f}")).collect::<Vec<_>>().join("\n"))]
    Failed {
        /// Failed check descriptions.
        failures: Vec<String>,
    },

    /// The graph walk failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Re-inspection failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("IO error reading '{path}': {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration.
    #[error("Failed to parse '{path}': {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
}

/// What a failed run left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing was committed.
    Unchanged,
    /// Recovery ran and was verified at this revision.
    RolledBack {
        /// Revision the database is at.
        to: Option<RevisionId>,
    },
    /// The run was cancelled; the next invocation recovers it.
    Interrupted {
        /// Last revision committed before the cancellation.
        at: Option<RevisionId>,
    },
    /// Recovery could not be verified; manual reconciliation needed.
    RecoveryFailed,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unchanged => f.write_str("database unchanged"),
            Self::RolledBack { to } => {
                write!(f, "database rolled back to {}", show_revision(to.as_ref()))
            }
            Self::Interrupted { at } => write!(
                f,
                "run interrupted at {}, recovery runs on the next invocation",
                show_revision(at.as_ref())
            ),
            Self::RecoveryFailed => {
                f.write_str("recovery failed, manual reconciliation required")
            }
        }
    }
}

/// Top-level error of a pipeline command.
#[derive(Debug, thiserror::Error)]
pub enum SafeguardError {
    /// Graph loading failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Blocking findings.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Marker problems.
    #[error(transparent)]
    State(#[from] StateError),

    /// Backup failure.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Lock contention.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Execution failed; the disposition says what was left behind.
    #[error("{source} ({disposition})")]
    Execution {
        /// The failure.
        #[source]
        source: ExecutionError,
        /// Database disposition after recovery.
        disposition: Disposition,
    },

    /// Recovery failed.
    #[error(transparent)]
    Rollback(#[from] RollbackError),

    /// Verification failed.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Bad configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SafeguardError {
    /// Process exit code for this error: 1 for blocking validation, 3 for
    /// lock contention, 2 for everything needing operator attention.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::Graph(_) | Self::Config(_) => 1,
            Self::State(StateError::MissingMarker | StateError::Drift { .. }) => 1,
            Self::Lock(LockError::Held { .. })
            | Self::Execution {
                source: ExecutionError::Lock(LockError::Held { .. }),
                ..
            } => 3,
            _ => 2,
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, SafeguardError>;
