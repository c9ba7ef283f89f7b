//! Applied-state marker and revision history.
//!
//! This module manages the `safeguard_applied_state` marker row and the
//! `safeguard_history` audit table. Writes take a connection so they can run
//! inside the revision's transaction.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use oxide_safeguard_core::fingerprint::{CanonicalSchema, Fingerprint};
use oxide_safeguard_core::revision::RevisionId;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool};

/// SQL to create the marker table. The check keeps it to a single row.
pub const CREATE_APPLIED_STATE_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS safeguard_applied_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    revision TEXT,
    applied_at TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    canonical TEXT NOT NULL,
    environment TEXT NOT NULL
)
";

/// SQL to create the history table.
pub const CREATE_HISTORY_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS safeguard_history (
    seq INTEGER PRIMARY KEY,
    revision TEXT NOT NULL,
    checksum TEXT NOT NULL,
    direction TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    run_id TEXT
)
";

/// Parses a stored timestamp, accepting SQLite's `datetime('now')` format.
pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // SQLite datetime format fallback
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}

/// Per-environment record of the last applied revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    /// Last committed revision; `None` after bootstrap.
    pub revision: Option<RevisionId>,
    /// When the marker last moved.
    pub applied_at: DateTime<Utc>,
    /// Schema fingerprint at that point.
    pub fingerprint: Fingerprint,
    /// Environment label.
    pub environment: String,
}

/// The marker row together with the canonical rendering it was taken from.
#[derive(Debug, Clone)]
pub struct Marker {
    /// The applied state.
    pub state: AppliedState,
    /// Canonical schema lines at the marker.
    pub canonical: Vec<String>,
}

/// Which way a history entry moved the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Revision applied.
    Apply,
    /// Revision reversed by its reverse operations.
    Revert,
}

impl Direction {
    /// Stored spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Revert => "revert",
        }
    }

    fn parse(value: &str) -> Self {
        if value == "revert" {
            Self::Revert
        } else {
            Self::Apply
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed marker move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// Insertion order.
    pub seq: i64,
    /// Revision applied or reverted.
    pub revision: RevisionId,
    /// Revision checksum at the time.
    pub checksum: String,
    /// Apply or revert.
    pub direction: Direction,
    /// Commit time.
    pub applied_at: DateTime<Utc>,
    /// Fingerprint after the move.
    pub fingerprint: Fingerprint,
    /// Run that made the move.
    pub run_id: Option<String>,
}

/// Creates the marker and history tables.
pub async fn ensure_tables(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_APPLIED_STATE_TABLE_SQL)
        .execute(&mut *conn)
        .await?;
    sqlx::query(CREATE_HISTORY_TABLE_SQL)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Reads the marker row, or `None` if the database was never bootstrapped.
pub async fn read_marker(conn: &mut SqliteConnection) -> Result<Option<Marker>, sqlx::Error> {
    let exists: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'safeguard_applied_state'",
    )
    .fetch_optional(&mut *conn)
    .await?;
    if exists.is_none() {
        return Ok(None);
    }

    let row: Option<(Option<String>, String, String, String, String)> = sqlx::query_as(
        "SELECT revision, applied_at, fingerprint, canonical, environment \
         FROM safeguard_applied_state WHERE id = 1",
    )
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(
        |(revision, applied_at, fingerprint, canonical, environment)| Marker {
            state: AppliedState {
                revision: revision.map(RevisionId::from),
                applied_at: parse_timestamp(&applied_at),
                fingerprint: Fingerprint::new(fingerprint),
                environment,
            },
            canonical: canonical.lines().map(str::to_string).collect(),
        },
    ))
}

/// Inserts the marker row for a freshly bootstrapped database.
pub async fn insert_marker(
    conn: &mut SqliteConnection,
    canonical: &CanonicalSchema,
    environment: &str,
) -> Result<AppliedState, sqlx::Error> {
    let now = Utc::now();
    let fingerprint = canonical.fingerprint();
    sqlx::query(
        "INSERT INTO safeguard_applied_state \
         (id, revision, applied_at, fingerprint, canonical, environment) \
         VALUES (1, NULL, ?, ?, ?, ?)",
    )
    .bind(now.to_rfc3339())
    .bind(fingerprint.as_str())
    .bind(canonical.lines().join("\n"))
    .bind(environment)
    .execute(&mut *conn)
    .await?;

    Ok(AppliedState {
        revision: None,
        applied_at: now,
        fingerprint,
        environment: environment.to_string(),
    })
}

/// Moves the marker to `revision` with the schema it now has.
pub async fn write_marker(
    conn: &mut SqliteConnection,
    revision: Option<&RevisionId>,
    canonical: &CanonicalSchema,
) -> Result<Fingerprint, sqlx::Error> {
    let fingerprint = canonical.fingerprint();
    sqlx::query(
        "UPDATE safeguard_applied_state \
         SET revision = ?, applied_at = ?, fingerprint = ?, canonical = ? WHERE id = 1",
    )
    .bind(revision.map(RevisionId::as_str))
    .bind(Utc::now().to_rfc3339())
    .bind(fingerprint.as_str())
    .bind(canonical.lines().join("\n"))
    .execute(&mut *conn)
    .await?;
    Ok(fingerprint)
}

/// Appends a history entry.
pub async fn record(
    conn: &mut SqliteConnection,
    revision: &RevisionId,
    checksum: &str,
    direction: Direction,
    fingerprint: &Fingerprint,
    run_id: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO safeguard_history \
         (revision, checksum, direction, applied_at, fingerprint, run_id) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(revision.as_str())
    .bind(checksum)
    .bind(direction.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(fingerprint.as_str())
    .bind(run_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Read access to the history table.
#[derive(Debug, Clone)]
pub struct History {
    pool: SqlitePool,
}

impl History {
    /// Creates a history reader.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Lists every entry in commit order.
    pub async fn entries(&self) -> Result<Vec<HistoryEntry>, sqlx::Error> {
        let rows: Vec<(i64, String, String, String, String, String, Option<String>)> =
            sqlx::query_as(
                "SELECT seq, revision, checksum, direction, applied_at, fingerprint, run_id \
                 FROM safeguard_history ORDER BY seq",
            )
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(seq, revision, checksum, direction, applied_at, fingerprint, run_id)| {
                    HistoryEntry {
                        seq,
                        revision: RevisionId::from(revision),
                        checksum,
                        direction: Direction::parse(&direction),
                        applied_at: parse_timestamp(&applied_at),
                        fingerprint: Fingerprint::new(fingerprint),
                        run_id,
                    }
                },
            )
            .collect())
    }

    /// Revisions a run left applied, in commit order.
    ///
    /// History rows commit with the marker, so this is exact even for a run
    /// whose process died before journaling its attempts.
    pub async fn committed_by(&self, run_id: &str) -> Result<Vec<RevisionId>, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT revision, direction FROM safeguard_history WHERE run_id = ? ORDER BY seq",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut committed: Vec<RevisionId> = Vec::new();
        for (revision, direction) in rows {
            let revision = RevisionId::from(revision);
            match Direction::parse(&direction) {
                Direction::Apply => committed.push(revision),
                Direction::Revert => {
                    if committed.last() == Some(&revision) {
                        committed.pop();
                    }
                }
            }
        }
        Ok(committed)
    }

    /// Checksums recorded when each revision was last applied.
    pub async fn recorded_checksums(&self) -> Result<BTreeMap<RevisionId, String>, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT revision, checksum FROM safeguard_history \
             WHERE direction = 'apply' ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(revision, checksum)| (RevisionId::from(revision), checksum))
            .collect())
    }
}
