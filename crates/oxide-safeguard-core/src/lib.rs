//! Revision model for `oxide-safeguard`.
//!
//! This crate holds everything that can be decided without a database
//! connection:
//!
//! - **Operations** - Closed set of schema changes a revision declares, with
//!   their reverse operations and risk classes
//! - **Revisions and the graph** - Revision files, the DAG they form, paths
//!   between revisions and the checksum ledger
//! - **State replay** - The schema a revision path produces
//! - **Fingerprints** - Canonical schema shape comparable with a live database
//! - **Linter** - Static safety rules run before any connection is opened
//! - **Dialect** - Database-specific SQL generation and capabilities
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use oxide_safeguard_core::prelude::*;
//!
//! let dir = Path::new("revisions");
//! let graph = load(dir, &LoadTarget::Head)?;
//! let ledger = ChecksumLedger::load(dir)?;
//! let report = Linter::new(LintOptions::default()).lint_graph(&graph, &ledger);
//! for finding in &report.findings {
//!     println!("{finding}");
//! }
//! # Ok::<(), GraphError>(())
//! ```

pub mod dialect;
pub mod error;
pub mod finding;
pub mod fingerprint;
pub mod graph;
pub mod ledger;
pub mod lint;
pub mod loader;
pub mod operations;
pub mod revision;
pub mod schema;
pub mod sql_scan;
pub mod state;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::dialect::{MigrationDialect, SqliteDialect};
    pub use crate::error::{DialectError, GraphError, ReplayError};
    pub use crate::finding::{Severity, ValidationFinding};
    pub use crate::fingerprint::{CanonicalSchema, Fingerprint};
    pub use crate::graph::{LoadTarget, RevisionGraph};
    pub use crate::ledger::ChecksumLedger;
    pub use crate::lint::{LintContext, LintOptions, LintReport, LintRule, Linter};
    pub use crate::loader::load;
    pub use crate::operations::{Constraint, Operation, RiskClass, SchemaTarget};
    pub use crate::revision::{Probe, Revision, RevisionId};
    pub use crate::schema::{
        ColumnSchema, DatabaseSchema, DefaultValue, ForeignKeyAction, ForeignKeySchema,
        IndexSchema, SqlType, TableSchema, UniqueConstraint,
    };
    pub use crate::state::SchemaState;
}
