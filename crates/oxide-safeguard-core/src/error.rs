//! Error types for the revision model.

use std::path::PathBuf;

use crate::revision::RevisionId;

fn join_ids(ids: &[RevisionId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while loading or walking the revision graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The revision source could not be read.
    #[error("IO error reading '{path}': {source}")]
    Io {
        /// File or directory being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A revision file or the checksum ledger could not be parsed.
    #[error("Failed to parse '{path}': {message}")]
    Parse {
        /// Path to the offending file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Two revisions share an id.
    #[error("Duplicate revision id '{0}'")]
    DuplicateRevision(RevisionId),

    /// A revision names a parent that does not exist.
    #[error("Revision '{revision}' depends on '{parent}' which doesn't exist")]
    MissingParent {
        /// The revision with the missing parent.
        revision: RevisionId,
        /// The parent that's missing.
        parent: RevisionId,
    },

    /// The parent relation is not acyclic.
    #[error("Circular dependency detected between revisions: {}", join_ids(.0))]
    Cycle(Vec<RevisionId>),

    /// More than one revision has no parents.
    #[error("Multiple root revisions: {}", join_ids(.0))]
    MultipleRoots(Vec<RevisionId>),

    /// Branches were never merged and no target was named.
    #[error("Multiple unmerged heads: {}; add a merge revision or name a target", join_ids(.0))]
    MultipleHeads(Vec<RevisionId>),

    /// A named revision is not part of the graph.
    #[error("Unknown revision '{0}'")]
    UnknownRevision(String),

    /// `to` cannot be reached by applying revisions on top of `from`.
    #[error("Revision '{to}' is not reachable forward from '{from}'")]
    Unreachable {
        /// Current revision.
        from: RevisionId,
        /// Requested revision.
        to: RevisionId,
    },

    /// The operation list could not be encoded for checksumming.
    #[error("Failed to encode revision '{revision}': {source}")]
    Encode {
        /// Revision being sealed.
        revision: RevisionId,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Structured operations do not replay cleanly.
    #[error("Revision '{revision}' does not replay: {source}")]
    Replay {
        /// Revision whose operation failed.
        revision: RevisionId,
        /// Underlying error.
        #[source]
        source: ReplayError,
    },
}

/// An operation could not be applied to the replayed schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid schema state: {0}")]
pub struct ReplayError(pub String);

/// SQL generation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialectError {
    /// The dialect has no way to express the operation.
    #[error("{dialect} cannot {operation}")]
    Unsupported {
        /// Dialect name.
        dialect: &'static str,
        /// Description of the operation.
        operation: String,
    },
}

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;
