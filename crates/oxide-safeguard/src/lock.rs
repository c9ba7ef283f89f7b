//! Cross-process migration lock.
//!
//! SQLite has no advisory locks, so the lock is the single row of
//! `safeguard_lock`. Acquisition is an insert guarded by the primary key and
//! never waits: a present row or a busy database both mean someone else is
//! migrating.
//!
//! The row outlives a killed process. A row whose holder process is gone
//! from this host, or whose lease ran out, is stale and gets taken over.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::LockError;
use crate::retry::is_busy;

/// SQL to create the lock table.
pub const CREATE_LOCK_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS safeguard_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    host TEXT NOT NULL DEFAULT '',
    pid INTEGER NOT NULL,
    acquired_at TEXT NOT NULL
)
";

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || matches!(db.code().as_deref(), Some("1555" | "2067"))
        }
        _ => false,
    }
}

/// Name of this host as written to the lock row.
#[must_use]
pub fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: i64) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: i64) -> bool {
    true
}

fn unknown_holder() -> LockError {
    LockError::Held {
        holder: "unknown".to_string(),
        pid: None,
        since: None,
    }
}

/// The lock row.
#[derive(Debug, Clone)]
struct LockRow {
    holder: String,
    host: String,
    pid: i64,
    acquired_at: String,
}

impl LockRow {
    fn into_error(self) -> LockError {
        LockError::Held {
            holder: self.holder,
            pid: Some(self.pid),
            since: Some(self.acquired_at),
        }
    }
}

/// Entry point for acquiring and breaking the lock.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    pool: SqlitePool,
    lease: Option<Duration>,
}

impl AdvisoryLock {
    /// Creates a lock handle for the database behind `pool`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, lease: None }
    }

    /// Treats a lock held longer than `lease` as stale.
    #[must_use]
    pub fn lease(mut self, lease: Option<Duration>) -> Self {
        self.lease = lease;
        self
    }

    /// Takes the lock or fails immediately with [`LockError::Held`].
    ///
    /// A stale lock is removed and the insert tried once more.
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        match self.try_insert().await {
            Err(LockError::Held { .. }) => {}
            result => return result,
        }
        let Some(row) = self.current().await else {
            return Err(unknown_holder());
        };
        let Some(reason) = self.staleness(&row) else {
            return Err(row.into_error());
        };
        warn!(
            holder = %row.holder,
            host = %row.host,
            pid = row.pid,
            since = %row.acquired_at,
            reason,
            "Taking over stale migration lock"
        );
        delete_lock(&self.pool, &row.holder).await?;
        self.try_insert().await
    }

    async fn try_insert(&self) -> Result<LockGuard, LockError> {
        let holder = uuid::Uuid::new_v4().to_string();
        let result = async {
            sqlx::query(CREATE_LOCK_TABLE_SQL)
                .execute(&self.pool)
                .await?;
            sqlx::query(
                "INSERT INTO safeguard_lock (id, holder, host, pid, acquired_at) \
                 VALUES (1, ?, ?, ?, ?)",
            )
            .bind(&holder)
            .bind(current_host())
            .bind(i64::from(std::process::id()))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
        }
        .await;

        match result {
            Ok(_) => {
                info!(holder = %holder, "Acquired migration lock");
                Ok(LockGuard {
                    pool: self.pool.clone(),
                    holder,
                    released: false,
                })
            }
            Err(e) if is_unique_violation(&e) || is_busy(&e) => Err(unknown_holder()),
            Err(e) => Err(LockError::Database(e)),
        }
    }

    async fn current(&self) -> Option<LockRow> {
        let row: Result<Option<(String, String, i64, String)>, _> =
            sqlx::query_as("SELECT holder, host, pid, acquired_at FROM safeguard_lock WHERE id = 1")
                .fetch_optional(&self.pool)
                .await;
        match row {
            Ok(row) => row.map(|(holder, host, pid, acquired_at)| LockRow {
                holder,
                host,
                pid,
                acquired_at,
            }),
            Err(e) => {
                warn!(error = %e, "Failed to read migration lock holder");
                None
            }
        }
    }

    /// Why `row` no longer protects a live run, if it doesn't.
    fn staleness(&self, row: &LockRow) -> Option<&'static str> {
        let own_pid = i64::from(std::process::id());
        if row.host == current_host() && row.pid != own_pid && !process_alive(row.pid) {
            return Some("holder process is gone");
        }
        let lease = self.lease?;
        let acquired = DateTime::parse_from_rfc3339(&row.acquired_at).ok()?;
        let age = Utc::now().signed_duration_since(acquired);
        let expired = age.to_std().is_ok_and(|age| age > lease);
        expired.then_some("lease expired")
    }

    /// Returns the current holder id, if any.
    pub async fn holder(&self) -> Result<Option<String>, LockError> {
        sqlx::query(CREATE_LOCK_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT holder FROM safeguard_lock WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(holder,)| holder))
    }

    /// Removes the lock regardless of holder. Returns true if one was held.
    pub async fn force_unlock(&self) -> Result<bool, LockError> {
        sqlx::query(CREATE_LOCK_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM safeguard_lock WHERE id = 1")
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            warn!("Migration lock forcibly removed");
        }
        Ok(removed)
    }
}

/// A held lock.
///
/// Call [`LockGuard::release`] on every exit path. A guard dropped without
/// release (a cancelled future) schedules the release on the current runtime.
#[derive(Debug)]
pub struct LockGuard {
    pool: SqlitePool,
    holder: String,
    released: bool,
}

impl LockGuard {
    /// Holder id written to the lock row.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Releases the lock.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        delete_lock(&self.pool, &self.holder).await?;
        info!(holder = %self.holder, "Released migration lock");
        Ok(())
    }
}

async fn delete_lock(pool: &SqlitePool, holder: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM safeguard_lock WHERE id = 1 AND holder = ?")
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(holder = %self.holder, "Lock guard dropped outside a runtime; lock left held");
            return;
        };
        let pool = self.pool.clone();
        let holder = std::mem::take(&mut self.holder);
        debug!(holder = %holder, "Releasing dropped lock guard");
        handle.spawn(async move {
            if let Err(e) = delete_lock(&pool, &holder).await {
                warn!(holder = %holder, error = %e, "Failed to release dropped lock guard");
            }
        });
    }
}
