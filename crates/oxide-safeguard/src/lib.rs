//! Safety envelope for applying schema revisions to SQLite.
//!
//! `oxide-safeguard` wraps every schema change in a fixed sequence of
//! checks so that a migration either lands completely and verifiably, or
//! leaves the database where it was:
//!
//! - **Inspector** - Reads the applied-state marker and detects schema drift
//! - **Pre-flight** - Re-lints against the live schema, estimates impact and
//!   simulates the plan on a scratch copy
//! - **Backup** - Logical dump uploaded through an [`ObjectStore`]
//! - **Executor** - Per-revision transactions under a cross-process lock,
//!   with retry on transient failures
//! - **Rollback** - Reverse operations or a full restore, verified against
//!   the pre-run fingerprint
//! - **Verify** - Fingerprint and invariant probes after every apply
//!
//! Static concerns (the revision graph, linting, fingerprints) live in
//! `oxide-safeguard-core`.
//!
//! # Example
//!
//! ```rust,no_run
//! use oxide_safeguard::config::SafeguardConfig;
//! use oxide_safeguard::pipeline::Pipeline;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> oxide_safeguard::error::Result<()> {
//! let config = SafeguardConfig::load("safeguard.toml".as_ref())?;
//! let outcome = Pipeline::new(config).apply(&CancellationToken::new()).await?;
//! println!("{} revision(s) applied", outcome.plan.revisions.len());
//! # Ok(())
//! # }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Record the current schema as the starting point
//! oxide-safeguard init
//!
//! # Show what would run
//! oxide-safeguard plan
//!
//! # Apply up to the head
//! oxide-safeguard apply
//!
//! # Restore a backup
//! oxide-safeguard rollback --backup <id> --confirm <id>
//! ```
//!
//! [`ObjectStore`]: storage::ObjectStore

pub mod backup;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod inspector;
pub mod journal;
pub mod lock;
pub mod notify;
pub mod pipeline;
pub mod preflight;
pub mod retry;
pub mod rollback;
pub mod simulate;
pub mod storage;
pub mod verify;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backup::{Backup, BackupCoordinator, RestoreConfirmation, UploadPolicy};
    pub use crate::config::SafeguardConfig;
    pub use crate::error::{Disposition, Result, SafeguardError};
    pub use crate::executor::{ExecutionHook, ExecutionReport, Executor};
    pub use crate::history::AppliedState;
    pub use crate::inspector::Inspector;
    pub use crate::lock::AdvisoryLock;
    pub use crate::notify::{Event, MemoryNotifier, Notifier, TracingNotifier};
    pub use crate::pipeline::{ApplyOutcome, Pipeline, RunOptions};
    pub use crate::preflight::{Plan, Preflight, PreflightOptions};
    pub use crate::retry::{FailureClass, RetryPolicy};
    pub use crate::rollback::RollbackManager;
    pub use crate::storage::{LocalObjectStore, ObjectStore};
    pub use crate::verify::{VerificationReport, Verifier};
}
