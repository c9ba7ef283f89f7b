//! `safeguard.toml` configuration.
//!
//! Every section is optional; an absent file yields the defaults. CLI flags
//! override file values after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use oxide_safeguard_core::lint::LintOptions;
use oxide_safeguard_core::revision::Probe;
use serde::{Deserialize, Serialize};

use crate::backup::UploadPolicy;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "safeguard.toml";

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafeguardConfig {
    /// Target database.
    pub database: DatabaseConfig,
    /// Revision source.
    pub revisions: RevisionsConfig,
    /// Static lint settings.
    pub lint: LintConfig,
    /// Pre-flight thresholds.
    pub preflight: PreflightConfig,
    /// Transient failure retries.
    pub retry: RetryConfig,
    /// Backups.
    pub backup: BackupConfig,
    /// Migration lock.
    pub lock: LockConfig,
    /// Post-apply verification.
    pub verify: VerifyConfig,
}

impl SafeguardConfig {
    /// Loads configuration from `path`, or defaults if the file is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parses configuration text; `path` is only used in errors.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `[database]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection URL.
    pub url: String,
    /// Environment name recorded with the marker.
    pub environment: String,
    /// How long SQLite waits on a locked database before reporting busy.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:db.sqlite3".to_string(),
            environment: "default".to_string(),
            busy_timeout_ms: 5000,
        }
    }
}

/// `[revisions]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RevisionsConfig {
    /// Directory of revision files.
    pub dir: PathBuf,
}

impl Default for RevisionsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("revisions"),
        }
    }
}

/// `[lint]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LintConfig {
    /// Warnings halt too.
    pub strict: bool,
    /// Longest acceptable raw statement timeout hint.
    pub statement_timeout_ms: u64,
}

impl Default for LintConfig {
    fn default() -> Self {
        let options = LintOptions::default();
        Self {
            strict: options.strict,
            statement_timeout_ms: options.statement_timeout_ms,
        }
    }
}

impl LintConfig {
    /// Converts to linter options.
    #[must_use]
    pub fn options(&self) -> LintOptions {
        LintOptions {
            strict: self.strict,
            statement_timeout_ms: self.statement_timeout_ms,
        }
    }
}

/// `[preflight]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreflightConfig {
    /// Backfills touching more rows than this are blocking.
    pub large_backfill_rows: u64,
    /// Assumed rewrite throughput for lock estimates.
    pub rows_per_second: u64,
    /// Estimated lock durations above this produce a warning.
    pub lock_warning_ms: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            large_backfill_rows: 100_000,
            rows_per_second: 50_000,
            lock_warning_ms: 2_000,
        }
    }
}

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per revision, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on any delay.
    pub max_backoff_ms: u64,
    /// Growth factor between delays.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Converts to a retry policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .initial_backoff(Duration::from_millis(self.initial_backoff_ms))
            .max_backoff(Duration::from_millis(self.max_backoff_ms))
            .multiplier(self.multiplier)
    }
}

/// `[backup]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// Local directory for dumps and manifests.
    pub dir: PathBuf,
    /// Directory the local object store writes to.
    pub store_dir: PathBuf,
    /// What to do when the upload fails.
    pub upload_policy: UploadPolicy,
    /// Ephemeral backups kept after a successful run.
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".safeguard/backups"),
            store_dir: PathBuf::from(".safeguard/store"),
            upload_policy: UploadPolicy::Fail,
            keep: 5,
        }
    }
}

/// `[lock]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    /// A lock older than this is taken over; 0 disables the lease.
    pub lease_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { lease_secs: 3600 }
    }
}

impl LockConfig {
    /// Lease after which a held lock counts as stale.
    #[must_use]
    pub fn lease(&self) -> Option<Duration> {
        (self.lease_secs > 0).then(|| Duration::from_secs(self.lease_secs))
    }
}

/// `[verify]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    /// Probes run after every apply.
    #[serde(rename = "probe")]
    pub probes: Vec<Probe>,
}
