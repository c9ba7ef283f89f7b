//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use oxide_safeguard::config::SafeguardConfig;
use oxide_safeguard::executor::ExecutionHook;
use oxide_safeguard::notify::MemoryNotifier;
use oxide_safeguard::pipeline::{Pipeline, RunOptions};
use oxide_safeguard::preflight::PlannedRevision;
use oxide_safeguard::retry::FailureClass;
use oxide_safeguard_core::graph::{LoadTarget, RevisionGraph};
use oxide_safeguard_core::loader;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const USERS: &str = r#"
id = "0001"
description = "Create users"

[[operation]]
kind = "add_table"
name = "users"
columns = [
    { name = "id", type = "integer", primary_key = true },
    { name = "email", type = "text", nullable = false },
]
"#;

pub const NICKNAME: &str = r#"
id = "0002"
description = "Add nickname"
parents = ["0001"]

[[operation]]
kind = "add_column"
table = "users"
column = { name = "nickname", type = "text" }
"#;

pub const LOWERCASE_EMAILS: &str = r#"
id = "0002"
description = "Normalize emails"
parents = ["0001"]

[[operation]]
kind = "data_backfill"
table = "users"
sql = "UPDATE users SET email = lower(email)"
"#;

pub const EMAIL_INDEX: &str = r#"
id = "0003"
description = "Index emails"
parents = ["0002"]

[[operation]]
kind = "add_index"
name = "idx_users_email"
table = "users"
columns = ["email"]

[[expect]]
kind = "index_exists"
name = "idx_users_email"
"#;

/// A temporary project: revisions directory, database and backup store.
pub struct Project {
    pub root: TempDir,
    pub config: SafeguardConfig,
    pub notifier: Arc<MemoryNotifier>,
}

impl Project {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = SafeguardConfig::default();
        config.database.url = format!("sqlite:{}", root.path().join("app.db").display());
        config.revisions.dir = root.path().join("revisions");
        config.backup.dir = root.path().join("backups");
        config.backup.store_dir = root.path().join("store");
        config.retry.initial_backoff_ms = 1;
        fs::create_dir_all(&config.revisions.dir).expect("Failed to create revisions dir");
        Self {
            root,
            config,
            notifier: Arc::new(MemoryNotifier::new()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.path().join("app.db")
    }

    pub fn revisions_dir(&self) -> &Path {
        &self.config.revisions.dir
    }

    pub fn write(&self, file: &str, body: &str) {
        fs::write(self.revisions_dir().join(file), body).expect("Failed to write revision");
    }

    pub fn graph(&self) -> RevisionGraph {
        loader::load(self.revisions_dir(), &LoadTarget::Head).expect("Failed to load graph")
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.config.clone()).notifier(self.notifier.clone())
    }

    pub fn pipeline_to(&self, target: &str) -> Pipeline {
        self.pipeline().options(RunOptions {
            target: LoadTarget::from_option(Some(target)),
            ..RunOptions::default()
        })
    }

    /// Opens a separate pool on the project database.
    pub async fn pool(&self) -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().filename(self.db_path()))
            .await
            .expect("Failed to open project database")
    }
}

/// Fails one revision with a class on the listed attempts.
pub struct FailOn {
    pub revision: &'static str,
    pub attempts: Vec<u32>,
    pub class: FailureClass,
    pub calls: Mutex<u32>,
}

impl FailOn {
    pub fn new(revision: &'static str, attempts: Vec<u32>, class: FailureClass) -> Arc<Self> {
        Arc::new(Self {
            revision,
            attempts,
            class,
            calls: Mutex::new(0),
        })
    }
}

impl ExecutionHook for FailOn {
    fn before_commit(&self, revision: &PlannedRevision, attempt: u32) -> Option<FailureClass> {
        if revision.id.as_str() != self.revision {
            return None;
        }
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        self.attempts.contains(&attempt).then_some(self.class)
    }
}

/// Cancels the run's token while a revision is committing.
pub struct CancelOn {
    pub revision: &'static str,
    pub token: CancellationToken,
}

impl CancelOn {
    pub fn new(revision: &'static str, token: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            revision,
            token: token.clone(),
        })
    }
}

impl ExecutionHook for CancelOn {
    fn before_commit(&self, revision: &PlannedRevision, _attempt: u32) -> Option<FailureClass> {
        if revision.id.as_str() == self.revision {
            self.token.cancel();
        }
        None
    }
}
