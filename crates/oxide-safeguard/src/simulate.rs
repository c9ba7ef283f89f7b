//! Dry run of a plan against a scratch database.
//!
//! The scratch database is an in-memory SQLite that receives the live
//! schema's DDL, so pending statements are checked against the real shape
//! of the target without touching it.

use oxide_safeguard_core::finding::{Severity, ValidationFinding};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{debug, warn};

use crate::preflight::PlannedRevision;

/// Rule id of findings produced by a failed simulation.
pub const SIMULATION_FAILED: &str = "simulation-failed";

/// Rule id of the note left when simulation was skipped.
pub const SIMULATION_SKIPPED: &str = "simulation-skipped";

/// Runs `revisions` in order on a copy of the schema described by `ddl`.
///
/// Stops at the first failing statement, since later revisions build on
/// it, and returns it as a blocking finding.
pub async fn simulate(
    ddl: &[String],
    revisions: &[PlannedRevision],
) -> Result<Vec<ValidationFinding>, sqlx::Error> {
    let scratch = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    for statement in ddl {
        if let Err(e) = sqlx::raw_sql(statement).execute(&scratch).await {
            warn!(statement = %statement, error = %e, "Could not copy object into simulation");
        }
    }

    let mut findings = Vec::new();
    'revisions: for revision in revisions {
        for (index, operation) in revision.operations.iter().enumerate() {
            for statement in &operation.statements {
                debug!(revision = %revision.id, sql = %statement, "Simulating statement");
                if let Err(e) = sqlx::raw_sql(statement).execute(&scratch).await {
                    findings.push(
                        ValidationFinding::new(
                            SIMULATION_FAILED,
                            Severity::Blocking,
                            &revision.id,
                            format!("{} fails on the live schema: {e}", operation.description),
                        )
                        .at(index),
                    );
                    break 'revisions;
                }
            }
        }
    }

    scratch.close().await;
    Ok(findings)
}
