//! Backup and restore.
//!
//! A backup is a logical SQL dump of the target database keyed to the
//! applied state it was taken at. The dump is uploaded through an
//! [`ObjectStore`]; a local copy and a JSON manifest stay in the backup
//! directory and form the catalog.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use oxide_safeguard_core::graph::RevisionGraph;
use oxide_safeguard_core::revision::RevisionId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{BackupError, StorageError};
use crate::history::AppliedState;
use crate::storage::ObjectStore;

/// Bookkeeping tables left out of dumps, so a restore keeps the lock held
/// by the running process and the audit trail of the run.
pub const EXCLUDED_TABLES: &[&str] = &["safeguard_lock", "safeguard_runs", "safeguard_attempts"];

fn is_dumped(table: &str) -> bool {
    !table.starts_with("sqlite_") && !EXCLUDED_TABLES.contains(&table)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// What to do when uploading a dump fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPolicy {
    /// Abort the pipeline.
    Fail,
    /// Continue with the local copy only.
    KeepLocal,
}

/// Retention class of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Taken before a migration; pruned after later successful runs.
    Ephemeral,
    /// Taken on a schedule; never pruned here.
    Scheduled,
}

/// A backup manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    /// Backup id.
    pub id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Applied state the dump was taken at.
    pub state: AppliedState,
    /// Object store location, if the upload succeeded.
    pub location: Option<String>,
    /// Local copy, if retained.
    pub local_path: Option<PathBuf>,
    /// SHA-256 hex of the dump bytes.
    pub checksum: String,
    /// Dump size in bytes.
    pub size: u64,
    /// Retention class.
    pub retention: Retention,
}

impl Backup {
    /// Revision the backup was taken at.
    #[must_use]
    pub fn revision(&self) -> Option<&RevisionId> {
        self.state.revision.as_ref()
    }
}

/// Operator acknowledgement that a restore overwrites the database.
///
/// Must name the backup being restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreConfirmation(String);

impl RestoreConfirmation {
    /// Confirms restoring the backup with this id.
    #[must_use]
    pub fn new(backup_id: impl Into<String>) -> Self {
        Self(backup_id.into())
    }

    /// Confirmation for an automated recovery of `backup`.
    #[must_use]
    pub fn for_backup(backup: &Backup) -> Self {
        Self(backup.id.clone())
    }

    fn check(&self, backup: &Backup) -> Result<(), BackupError> {
        if self.0 == backup.id {
            Ok(())
        } else {
            Err(BackupError::ConfirmationMismatch {
                backup: backup.id.clone(),
                confirmation: self.0.clone(),
            })
        }
    }
}

impl fmt::Display for RestoreConfirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Renders a dump of every user and marker table.
///
/// Tables come first, then all rows, then indexes, views and triggers.
pub async fn dump(conn: &mut SqliteConnection, header: &str) -> Result<String, sqlx::Error> {
    let objects: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT type, tbl_name, sql FROM sqlite_master WHERE sql IS NOT NULL \
         ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END, rowid",
    )
    .fetch_all(&mut *conn)
    .await?;
    let objects: Vec<(String, String, String)> = objects
        .into_iter()
        .filter(|(_, table, _)| is_dumped(table))
        .collect();

    let mut out = String::from(header);
    for (_, _, sql) in objects.iter().filter(|(kind, _, _)| kind == "table") {
        out.push_str(sql);
        out.push_str(";\n");
    }

    for (_, table, _) in objects.iter().filter(|(kind, _, _)| kind == "table") {
        let columns: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info(?) ORDER BY cid")
                .bind(table)
                .fetch_all(&mut *conn)
                .await?;
        let names: Vec<String> = columns.iter().map(|(c,)| quote_ident(c)).collect();
        let select = format!(
            "SELECT {} FROM {}",
            names
                .iter()
                .map(|c| format!("quote({c})"))
                .collect::<Vec<_>>()
                .join(" || ',' || "),
            quote_ident(table)
        );
        let insert = format!("INSERT INTO {} ({}) VALUES", quote_ident(table), names.join(", "));

        let mut rows = sqlx::query_as::<_, (String,)>(&select).fetch(&mut *conn);
        while let Some((values,)) = rows.try_next().await? {
            out.push_str(&insert);
            out.push_str(" (");
            out.push_str(&values);
            out.push_str(");\n");
        }
    }

    for (_, _, sql) in objects.iter().filter(|(kind, _, _)| kind != "table") {
        out.push_str(sql);
        out.push_str(";\n");
    }
    Ok(out)
}

/// Replaces the dumped tables with the contents of `script` in one
/// transaction, with foreign key checks deferred to commit.
pub async fn load_dump(pool: &SqlitePool, script: &str) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("PRAGMA defer_foreign_keys = ON")
        .execute(&mut *tx)
        .await?;

    let objects: Vec<(String, String)> = sqlx::query_as(
        "SELECT type, name FROM sqlite_master WHERE type IN ('view', 'table') \
         ORDER BY CASE type WHEN 'view' THEN 0 ELSE 1 END",
    )
    .fetch_all(&mut *tx)
    .await?;
    for (kind, name) in objects {
        if !is_dumped(&name) {
            continue;
        }
        let keyword = if kind == "view" { "VIEW" } else { "TABLE" };
        sqlx::query(&format!("DROP {keyword} IF EXISTS {}", quote_ident(&name)))
            .execute(&mut *tx)
            .await?;
    }

    sqlx::raw_sql(script).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

/// Backup manifests kept in the local backup directory.
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    dir: PathBuf,
}

impl BackupCatalog {
    /// Opens the catalog in `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the backup directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn io(path: &Path, source: std::io::Error) -> BackupError {
        BackupError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    async fn write(&self, backup: &Backup) -> Result<(), BackupError> {
        let path = self.manifest_path(&backup.id);
        let json = serde_json::to_vec_pretty(backup).map_err(|source| BackupError::Manifest {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| Self::io(&path, e))
    }

    /// Lists backups, oldest first.
    pub async fn list(&self) -> Result<Vec<Backup>, BackupError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io(&self.dir, e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path)
                .await
                .map_err(|e| Self::io(&path, e))?;
            let backup: Backup =
                serde_json::from_slice(&content).map_err(|source| BackupError::Manifest {
                    path: path.clone(),
                    source,
                })?;
            backups.push(backup);
        }
        backups.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(backups)
    }

    /// Finds a backup by id.
    pub async fn find(&self, id: &str) -> Result<Backup, BackupError> {
        self.list()
            .await?
            .into_iter()
            .find(|b| b.id == id)
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    /// Newest backup taken at a strict ancestor of `revision`, or at the
    /// empty database.
    pub async fn latest_preceding(
        &self,
        graph: &RevisionGraph,
        revision: &RevisionId,
    ) -> Result<Option<Backup>, BackupError> {
        Ok(self.list().await?.into_iter().rev().find(|b| {
            b.revision()
                .is_none_or(|taken_at| graph.is_ancestor(taken_at, revision))
        }))
    }

    /// Deletes ephemeral backups beyond the newest `keep`, along with their
    /// local copies and uploaded objects. Returns the removed ids.
    pub async fn prune(
        &self,
        keep: usize,
        store: &dyn ObjectStore,
    ) -> Result<Vec<String>, BackupError> {
        let ephemeral: Vec<Backup> = self
            .list()
            .await?
            .into_iter()
            .filter(|b| b.retention == Retention::Ephemeral)
            .collect();
        let excess = ephemeral.len().saturating_sub(keep);

        let mut removed = Vec::new();
        for backup in ephemeral.into_iter().take(excess) {
            if let Some(location) = &backup.location {
                if let Err(e) = store.delete(location).await {
                    warn!(backup = %backup.id, error = %e, "Failed to delete uploaded backup");
                }
            }
            if let Some(local) = &backup.local_path {
                match tokio::fs::remove_file(local).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Self::io(local, e)),
                }
            }
            let manifest = self.manifest_path(&backup.id);
            tokio::fs::remove_file(&manifest)
                .await
                .map_err(|e| Self::io(&manifest, e))?;
            debug!(backup = %backup.id, "Pruned backup");
            removed.push(backup.id);
        }
        Ok(removed)
    }
}

/// Takes and restores backups of one database.
#[derive(Clone)]
pub struct BackupCoordinator {
    pool: SqlitePool,
    store: Arc<dyn ObjectStore>,
    catalog: BackupCatalog,
    policy: UploadPolicy,
}

impl fmt::Debug for BackupCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupCoordinator")
            .field("catalog", &self.catalog)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl BackupCoordinator {
    /// Creates a coordinator writing local copies and manifests to `dir`.
    #[must_use]
    pub fn new(pool: SqlitePool, store: Arc<dyn ObjectStore>, dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            store,
            catalog: BackupCatalog::new(dir),
            policy: UploadPolicy::Fail,
        }
    }

    /// Sets the upload failure policy.
    #[must_use]
    pub fn upload_policy(mut self, policy: UploadPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    /// Returns the object store.
    #[must_use]
    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Dumps the database at `state`, uploads the dump and records it.
    pub async fn snapshot(
        &self,
        state: &AppliedState,
        retention: Retention,
    ) -> Result<Backup, BackupError> {
        let created_at = Utc::now();
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%SZ"),
            uuid.get(..8).unwrap_or(&uuid)
        );
        let header = format!(
            "-- oxide-safeguard backup {id}\n-- revision: {}\n-- fingerprint: {}\n-- created: {}\n",
            state
                .revision
                .as_ref()
                .map_or("(empty)", RevisionId::as_str),
            state.fingerprint,
            created_at.to_rfc3339()
        );

        let script = {
            let mut conn = self.pool.acquire().await?;
            dump(&mut conn, &header).await?
        };
        let bytes = script.into_bytes();
        let checksum = sha256_hex(&bytes);
        let size = bytes.len() as u64;

        tokio::fs::create_dir_all(self.catalog.dir())
            .await
            .map_err(|e| BackupCatalog::io(self.catalog.dir(), e))?;
        let local_path = self.catalog.dir().join(format!("{id}.sql"));
        tokio::fs::write(&local_path, &bytes)
            .await
            .map_err(|e| BackupCatalog::io(&local_path, e))?;

        let location = match self.store.put(&format!("{id}.sql"), bytes).await {
            Ok(location) => Some(location),
            Err(source) => match self.policy {
                UploadPolicy::Fail => {
                    if let Err(e) = tokio::fs::remove_file(&local_path).await {
                        debug!(error = %e, "Failed to remove local copy of failed backup");
                    }
                    return Err(BackupError::Upload { backup: id, source });
                }
                UploadPolicy::KeepLocal => {
                    warn!(
                        backup = %id,
                        error = %source,
                        local = %local_path.display(),
                        "Upload failed; keeping local copy only"
                    );
                    None
                }
            },
        };

        let backup = Backup {
            id,
            created_at,
            state: state.clone(),
            location,
            local_path: Some(local_path),
            checksum,
            size,
            retention,
        };
        self.catalog.write(&backup).await?;

        info!(
            backup = %backup.id,
            revision = %backup.revision().map_or("(empty)", RevisionId::as_str),
            size = backup.size,
            uploaded = backup.location.is_some(),
            "Backup taken"
        );
        Ok(backup)
    }

    async fn fetch(&self, backup: &Backup) -> Result<Vec<u8>, BackupError> {
        if let Some(location) = &backup.location {
            match self.store.get(location).await {
                Ok(bytes) => return Ok(bytes),
                Err(source) if backup.local_path.is_none() => {
                    return Err(BackupError::Fetch {
                        backup: backup.id.clone(),
                        source,
                    });
                }
                Err(e) => {
                    warn!(backup = %backup.id, error = %e, "Object store fetch failed; using local copy");
                }
            }
        }
        let Some(local) = &backup.local_path else {
            return Err(BackupError::Fetch {
                backup: backup.id.clone(),
                source: StorageError::NotFound(backup.id.clone()),
            });
        };
        tokio::fs::read(local)
            .await
            .map_err(|e| BackupCatalog::io(local, e))
    }

    /// Overwrites the database with `backup`.
    ///
    /// Destructive: `confirmation` must name the backup.
    pub async fn restore(
        &self,
        backup: &Backup,
        confirmation: &RestoreConfirmation,
    ) -> Result<(), BackupError> {
        confirmation.check(backup)?;

        let bytes = self.fetch(backup).await?;
        let actual = sha256_hex(&bytes);
        if actual != backup.checksum {
            return Err(BackupError::IntegrityMismatch {
                backup: backup.id.clone(),
                expected: backup.checksum.clone(),
                actual,
            });
        }
        let script = String::from_utf8_lossy(&bytes);

        warn!(
            backup = %backup.id,
            revision = %backup.revision().map_or("(empty)", RevisionId::as_str),
            "Restoring database from backup"
        );
        load_dump(&self.pool, &script).await?;
        info!(backup = %backup.id, "Restore complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::Inspector;
    use crate::lock::AdvisoryLock;
    use crate::storage::LocalObjectStore;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<String, StorageError> {
            Err(StorageError::Unavailable("bucket offline".to_string()))
        }

        async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(location.to_string()))
        }

        async fn delete(&self, _location: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    async fn seeded() -> (SqlitePool, AppliedState) {
        let pool = create_test_pool().await;
        sqlx::raw_sql(
            "CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE books (id INTEGER PRIMARY KEY, author_id INTEGER REFERENCES authors (id), title TEXT, cover BLOB);
             CREATE INDEX idx_books_title ON books (title);
             CREATE VIEW book_titles AS SELECT title FROM books;
             INSERT INTO authors (id, name) VALUES (1, 'O''Brien'), (2, 'Le Guin');
             INSERT INTO books (id, author_id, title, cover) VALUES (1, 1, 'Line;\nbreak', X'00FF'), (2, 2, NULL, NULL);",
        )
        .execute(&pool)
        .await
        .unwrap();
        let state = Inspector::new(pool.clone()).bootstrap().await.unwrap();
        (pool, state)
    }

    fn coordinator(pool: &SqlitePool, dir: &Path) -> BackupCoordinator {
        BackupCoordinator::new(
            pool.clone(),
            Arc::new(LocalObjectStore::new(dir.join("store"))),
            dir.join("backups"),
        )
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn test_dump_contents() {
        let (pool, _) = seeded().await;
        let mut conn = pool.acquire().await.unwrap();
        let script = dump(&mut conn, "-- header\n").await.unwrap();

        assert!(script.starts_with("-- header\n"));
        assert!(script.contains("CREATE TABLE authors"));
        assert!(script.contains(r#"INSERT INTO "authors" ("id", "name") VALUES (1,'O''Brien');"#));
        assert!(script.contains("X'00FF'"));
        assert!(script.contains("safeguard_applied_state"));
        assert!(!script.contains("safeguard_lock"));
        let create_index = script.find("CREATE INDEX").unwrap();
        let last_insert = script.rfind("INSERT INTO").unwrap();
        assert!(create_index > last_insert);
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, state) = seeded().await;
        let coordinator = coordinator(&pool, dir.path());

        let backup = coordinator
            .snapshot(&state, Retention::Ephemeral)
            .await
            .unwrap();
        assert!(backup.location.is_some());
        assert_eq!(backup.checksum.len(), 64);

        // Damage the database, holding the lock across the restore
        let guard = AdvisoryLock::new(pool.clone()).acquire().await.unwrap();
        sqlx::raw_sql("DELETE FROM books; DROP VIEW book_titles; CREATE TABLE extra (x INTEGER);")
            .execute(&pool)
            .await
            .unwrap();

        coordinator
            .restore(&backup, &RestoreConfirmation::new(backup.id.clone()))
            .await
            .unwrap();

        assert_eq!(count(&pool, "books").await, 2);
        assert_eq!(count(&pool, "book_titles").await, 2);
        assert_eq!(count(&pool, "safeguard_lock").await, 1);
        let extra: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE name = 'extra'")
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert!(extra.is_none());
        let (title,): (String,) = sqlx::query_as("SELECT title FROM books WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(title, "Line;\nbreak");
        guard.release().await.unwrap();

        // The marker matches the restored schema again
        let restored = Inspector::new(pool.clone()).inspect().await.unwrap();
        assert_eq!(restored.fingerprint, state.fingerprint);
    }

    #[tokio::test]
    async fn test_restore_requires_matching_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, state) = seeded().await;
        let coordinator = coordinator(&pool, dir.path());
        let backup = coordinator
            .snapshot(&state, Retention::Ephemeral)
            .await
            .unwrap();

        let result = coordinator
            .restore(&backup, &RestoreConfirmation::new("some-other-backup"))
            .await;
        assert!(matches!(
            result,
            Err(BackupError::ConfirmationMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_backup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, state) = seeded().await;
        let coordinator = coordinator(&pool, dir.path());
        let backup = coordinator
            .snapshot(&state, Retention::Ephemeral)
            .await
            .unwrap();

        let location = backup.location.clone().unwrap();
        std::fs::write(&location, "DROP TABLE authors;").unwrap();

        let result = coordinator
            .restore(&backup, &RestoreConfirmation::for_backup(&backup))
            .await;
        assert!(matches!(
            result,
            Err(BackupError::IntegrityMismatch { .. })
        ));
        assert_eq!(count(&pool, "authors").await, 2);
    }

    #[tokio::test]
    async fn test_upload_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, state) = seeded().await;

        let strict = BackupCoordinator::new(pool.clone(), Arc::new(BrokenStore), dir.path());
        assert!(matches!(
            strict.snapshot(&state, Retention::Ephemeral).await,
            Err(BackupError::Upload { .. })
        ));
        assert!(strict.catalog().list().await.unwrap().is_empty());

        let tolerant = strict.upload_policy(UploadPolicy::KeepLocal);
        let backup = tolerant
            .snapshot(&state, Retention::Ephemeral)
            .await
            .unwrap();
        assert!(backup.location.is_none());
        assert!(backup.local_path.as_ref().unwrap().exists());
        tolerant
            .restore(&backup, &RestoreConfirmation::for_backup(&backup))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_catalog_prune_keeps_newest_and_scheduled() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, state) = seeded().await;
        let coordinator = coordinator(&pool, dir.path());

        let mut ids = Vec::new();
        for retention in [
            Retention::Ephemeral,
            Retention::Scheduled,
            Retention::Ephemeral,
            Retention::Ephemeral,
        ] {
            ids.push(coordinator.snapshot(&state, retention).await.unwrap().id);
        }

        let removed = coordinator
            .catalog()
            .prune(1, coordinator.store())
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);

        let left: Vec<String> = coordinator
            .catalog()
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&ids[1]));
        assert!(left.contains(&ids[3]));
    }
}
