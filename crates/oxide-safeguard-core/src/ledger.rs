//! The checksum ledger, `revisions.lock`.
//!
//! Records the checksum of every revision the first time it is applied.
//! A revision whose file no longer matches its recorded checksum was edited
//! after the fact and must not be trusted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{GraphError, Result};
use crate::revision::RevisionId;

/// File name of the ledger inside the revisions directory.
pub const LEDGER_FILE: &str = "revisions.lock";

/// Recorded checksums, keyed by revision id.
#[derive(Debug, Clone, Default)]
pub struct ChecksumLedger {
    path: PathBuf,
    entries: BTreeMap<RevisionId, String>,
}

impl ChecksumLedger {
    /// Reads the ledger from a revisions directory. A missing file is an
    /// empty ledger.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(LEDGER_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|e| GraphError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(GraphError::Io { path, source }),
        };
        Ok(Self { path, entries })
    }

    /// Returns the recorded checksum of a revision.
    #[must_use]
    pub fn get(&self, id: &RevisionId) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    /// Returns true if the revision has a recorded checksum.
    #[must_use]
    pub fn is_sealed(&self, id: &RevisionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns every recorded checksum.
    #[must_use]
    pub fn entries(&self) -> &BTreeMap<RevisionId, String> {
        &self.entries
    }

    /// Records a checksum unless one is already recorded. Returns true if
    /// the entry is new.
    pub fn record(&mut self, id: &RevisionId, checksum: &str) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.clone(), checksum.to_string());
        true
    }

    /// Writes the ledger back to disk.
    pub fn save(&self) -> Result<()> {
        let text = toml::to_string(&self.entries).map_err(|e| GraphError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        let header = "# Checksums of applied revisions. Do not edit.\n";
        fs::write(&self.path, format!("{header}{text}")).map_err(|source| GraphError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), entries = self.entries.len(), "Saved checksum ledger");
        Ok(())
    }
}
