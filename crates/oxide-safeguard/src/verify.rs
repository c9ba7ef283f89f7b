//! Post-apply verification.

use std::sync::Arc;

use oxide_safeguard_core::dialect::{MigrationDialect, SqliteDialect};
use oxide_safeguard_core::fingerprint::{diff_lines, Fingerprint};
use oxide_safeguard_core::graph::RevisionGraph;
use oxide_safeguard_core::revision::{Probe, RevisionId};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::VerificationError;
use crate::history;
use crate::inspector;

/// Where the expected fingerprint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintSource {
    /// Derived by replaying the graph.
    Replayed,
    /// A raw statement on the path hides the schema from replay, so the
    /// fingerprint recorded with the marker was used.
    Recorded,
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// The probe, rendered.
    pub probe: String,
    /// Whether it held.
    pub passed: bool,
    /// Failure detail.
    pub detail: Option<String>,
}

/// Result of verifying a database against an expected head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// Revision the database should be at.
    pub expected_revision: Option<RevisionId>,
    /// Revision the marker is at.
    pub marker_revision: Option<RevisionId>,
    /// Fingerprint the schema should have.
    pub expected_fingerprint: Fingerprint,
    /// Fingerprint of the live schema.
    pub actual_fingerprint: Fingerprint,
    /// Origin of `expected_fingerprint`.
    pub source: FingerprintSource,
    /// Probe outcomes.
    pub probes: Vec<ProbeResult>,
    /// Everything that did not hold.
    pub failures: Vec<String>,
}

impl VerificationReport {
    /// Returns true if nothing failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turns a failed report into [`VerificationError::Failed`].
    pub fn into_result(self) -> Result<Self, VerificationError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(VerificationError::Failed {
                failures: self.failures,
            })
        }
    }
}

async fn run_probe(conn: &mut SqliteConnection, probe: &Probe) -> Result<(), String> {
    let found = |name: &str, kind: &str| format!("{kind} '{name}' does not exist");
    match probe {
        Probe::TableExists { table } => {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(|e| e.to_string())?;
            row.map(|_| ()).ok_or_else(|| found(table, "table"))
        }
        Probe::ColumnExists { table, column } => {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT name FROM pragma_table_info(?) WHERE name = ?")
                    .bind(table)
                    .bind(column)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(|e| e.to_string())?;
            row.map(|_| ())
                .ok_or_else(|| found(&format!("{table}.{column}"), "column"))
        }
        Probe::IndexExists { name } => {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?")
                    .bind(name)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(|e| e.to_string())?;
            row.map(|_| ()).ok_or_else(|| found(name, "index"))
        }
        Probe::RowCount { table, min, max } => {
            let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\""));
            let (count,): (i64,) = sqlx::query_as(&sql)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| e.to_string())?;
            let count = u64::try_from(count).unwrap_or(0);
            if min.is_some_and(|min| count < min) || max.is_some_and(|max| count > max) {
                return Err(format!("'{table}' has {count} rows"));
            }
            Ok(())
        }
        Probe::Query { sql, .. } => {
            let row = sqlx::query(sql)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| e.to_string())?;
            row.map(|_| ())
                .ok_or_else(|| "query returned no rows".to_string())
        }
    }
}

/// Checks a database against the graph.
#[derive(Clone)]
pub struct Verifier {
    pool: SqlitePool,
    probes: Vec<Probe>,
    dialect: Arc<dyn MigrationDialect>,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("probes", &self.probes)
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

impl Verifier {
    /// Creates a verifier with no configured probes.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            probes: Vec::new(),
            dialect: Arc::new(SqliteDialect::new()),
        }
    }

    /// Adds probes that run on every verification.
    #[must_use]
    pub fn probes(mut self, probes: impl IntoIterator<Item = Probe>) -> Self {
        self.probes.extend(probes);
        self
    }

    /// Verifies the database is at `expected` with the schema replay
    /// predicts, and that every probe holds.
    ///
    /// Failures are collected in the report rather than returned; see
    /// [`VerificationReport::into_result`].
    pub async fn verify(
        &self,
        graph: &RevisionGraph,
        expected: Option<&RevisionId>,
    ) -> Result<VerificationReport, VerificationError> {
        let mut conn = self.pool.acquire().await?;
        let marker = history::read_marker(&mut conn)
            .await?
            .ok_or(crate::error::StateError::MissingMarker)?;
        let live = inspector::live_canonical(&mut conn).await?;
        let actual = live.fingerprint();
        let mut failures = Vec::new();

        let (expected_fingerprint, source) =
            match graph.expected_schema(expected, self.dialect.as_ref())? {
                Some(schema) => {
                    let fingerprint = schema.fingerprint();
                    if fingerprint != actual {
                        failures.push(format!(
                            "Live fingerprint {} does not match expected {}",
                            actual.short(),
                            fingerprint.short()
                        ));
                        failures.extend(diff_lines(&live.lines(), &schema.lines()));
                    }
                    (fingerprint, FingerprintSource::Replayed)
                }
                None => {
                    info!(
                        recorded = %marker.state.fingerprint.short(),
                        "Expected schema is opaque to replay; using recorded fingerprint"
                    );
                    if marker.state.fingerprint != actual {
                        failures.push(format!(
                            "Live fingerprint {} does not match recorded {}",
                            actual.short(),
                            marker.state.fingerprint.short()
                        ));
                        failures.extend(diff_lines(&live.lines(), &marker.canonical));
                    }
                    (marker.state.fingerprint.clone(), FingerprintSource::Recorded)
                }
            };

        if marker.state.revision.as_ref() != expected {
            failures.push(format!(
                "Marker is at {} but {} was expected",
                marker
                    .state
                    .revision
                    .as_ref()
                    .map_or("(empty)", RevisionId::as_str),
                expected.map_or("(empty)", RevisionId::as_str)
            ));
        }

        let mut probes: Vec<&Probe> = self.probes.iter().collect();
        if let Some(expected) = expected {
            for revision in graph.path(None, expected)? {
                probes.extend(revision.expect.iter());
            }
        }

        let mut results = Vec::with_capacity(probes.len());
        for probe in probes {
            let outcome = run_probe(&mut conn, probe).await;
            debug!(probe = %probe, passed = outcome.is_ok(), "Ran probe");
            if let Err(detail) = &outcome {
                failures.push(format!("Probe {probe} failed: {detail}"));
            }
            results.push(ProbeResult {
                probe: probe.to_string(),
                passed: outcome.is_ok(),
                detail: outcome.err(),
            });
        }

        if failures.is_empty() {
            info!(
                revision = ?expected.map(RevisionId::as_str),
                fingerprint = %actual.short(),
                probes = results.len(),
                "Verification passed"
            );
        } else {
            warn!(failures = failures.len(), "Verification failed");
        }

        Ok(VerificationReport {
            expected_revision: expected.cloned(),
            marker_revision: marker.state.revision,
            expected_fingerprint,
            actual_fingerprint: actual,
            source,
            probes: results,
            failures,
        })
    }
}
