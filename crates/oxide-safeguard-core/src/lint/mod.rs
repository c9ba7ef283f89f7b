//! Static safety linting of revisions.
//!
//! A [`Linter`] runs a set of [`LintRule`]s over each operation of a
//! revision, in the context of the schema its ancestors produce and the
//! deprecations they declared. Rules are plain values; [`Linter::with_rule`]
//! adds custom ones next to the built-in set in [`rules`].

pub mod rules;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dialect::{MigrationDialect, SqliteDialect};
use crate::finding::{Severity, ValidationFinding};
use crate::graph::RevisionGraph;
use crate::ledger::ChecksumLedger;
use crate::operations::{Operation, SchemaTarget};
use crate::revision::{Revision, RevisionId};
use crate::state::SchemaState;

/// Linter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LintOptions {
    /// Treat warnings as blocking.
    pub strict: bool,
    /// Longest a lock-inducing raw statement may be expected to run.
    pub statement_timeout_ms: u64,
}

impl Default for LintOptions {
    fn default() -> Self {
        Self {
            strict: false,
            statement_timeout_ms: 5_000,
        }
    }
}

/// What a rule can see while checking a revision.
#[derive(Debug, Clone, Default)]
pub struct LintContext {
    /// Schema produced by everything applied before the current operation.
    pub schema: SchemaState,
    /// Targets marked for removal by earlier revisions.
    pub deprecated: BTreeSet<SchemaTarget>,
    /// Checksums recorded when revisions were first applied.
    pub recorded: BTreeMap<RevisionId, String>,
}

impl LintContext {
    /// Creates a context over an existing schema.
    #[must_use]
    pub fn new(schema: SchemaState, deprecated: BTreeSet<SchemaTarget>) -> Self {
        Self {
            schema,
            deprecated,
            recorded: BTreeMap::new(),
        }
    }

    /// Sets the recorded checksums.
    #[must_use]
    pub fn with_recorded(mut self, recorded: BTreeMap<RevisionId, String>) -> Self {
        self.recorded = recorded;
        self
    }

    /// Builds the context a revision sees from its ancestors in the graph.
    #[must_use]
    pub fn before(graph: &RevisionGraph, id: &RevisionId) -> Self {
        Self::new(graph.schema_before(id), graph.deprecations_before(id))
    }

    /// Returns true if a deprecation covers `target`.
    #[must_use]
    pub fn is_deprecated(&self, target: &SchemaTarget) -> bool {
        self.deprecated.iter().any(|d| d.covers(target))
    }
}

/// A single safety rule.
pub trait LintRule: Send + Sync {
    /// Stable rule id, used in findings and `allow` lists.
    fn id(&self) -> &'static str;

    /// Severity of the findings this rule produces.
    fn severity(&self) -> Severity;

    /// Checks one operation against the state before it. Returns the
    /// finding message on violation.
    fn check_operation(
        &self,
        _revision: &Revision,
        _op: &Operation,
        _ctx: &LintContext,
    ) -> Option<String> {
        None
    }

    /// Checks the revision as a whole.
    fn check_revision(&self, _revision: &Revision, _ctx: &LintContext) -> Vec<String> {
        Vec::new()
    }
}

/// Result of linting a whole graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LintReport {
    /// All findings, in revision order.
    pub findings: Vec<ValidationFinding>,
    /// Revisions that got the full rule set.
    pub linted: usize,
    /// Sealed revisions that only had their checksum verified.
    pub sealed: usize,
}

impl LintReport {
    /// Returns true if any finding halts the pipeline.
    #[must_use]
    pub fn halts(&self, strict: bool) -> bool {
        crate::finding::halts(&self.findings, strict)
    }

    /// Returns the findings that halt the pipeline.
    #[must_use]
    pub fn halting(&self, strict: bool) -> Vec<ValidationFinding> {
        self.findings
            .iter()
            .filter(|f| f.halts(strict))
            .cloned()
            .collect()
    }
}

/// Runs lint rules over revisions.
pub struct Linter {
    rules: Vec<Box<dyn LintRule>>,
    options: LintOptions,
}

impl std::fmt::Debug for Linter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linter")
            .field("rules", &self.rule_ids())
            .field("options", &self.options)
            .finish()
    }
}

impl Linter {
    /// Creates a linter with the built-in rules for SQLite.
    #[must_use]
    pub fn new(options: LintOptions) -> Self {
        Self::with_dialect(options, Arc::new(SqliteDialect::new()))
    }

    /// Creates a linter with the built-in rules for a dialect.
    #[must_use]
    pub fn with_dialect(options: LintOptions, dialect: Arc<dyn MigrationDialect>) -> Self {
        let statement_timeout_ms = options.statement_timeout_ms;
        Self::empty(options)
            .with_rule(rules::IrreversibleWithoutReverse)
            .with_rule(rules::DestructiveWithoutDeprecation)
            .with_rule(rules::LockInducingRawStatement {
                statement_timeout_ms,
            })
            .with_rule(rules::UnknownReference)
            .with_rule(rules::ChecksumMismatch)
            .with_rule(rules::DialectUnsupported { dialect })
            .with_rule(rules::NonTransactional)
            .with_rule(rules::MixedBackfill)
            .with_rule(rules::ConflictingDefinition)
    }

    /// Creates a linter without any rules.
    #[must_use]
    pub fn empty(options: LintOptions) -> Self {
        Self {
            rules: Vec::new(),
            options,
        }
    }

    /// Adds a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: impl LintRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Returns the ids of all rules.
    #[must_use]
    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &LintOptions {
        &self.options
    }

    /// Lints a revision and advances the context past it.
    ///
    /// Operations are checked against the state left by the previous
    /// ones. Deprecations the revision declares only count for later
    /// revisions.
    pub fn lint_in_context(
        &self,
        revision: &Revision,
        ctx: &mut LintContext,
    ) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();

        for (index, op) in revision.operations.iter().enumerate() {
            for rule in &self.rules {
                if let Some(message) = rule.check_operation(revision, op, ctx) {
                    findings.push(
                        ValidationFinding::new(rule.id(), rule.severity(), &revision.id, message)
                            .at(index),
                    );
                }
            }
            if let Err(err) = ctx.schema.apply_operation(op) {
                debug!(revision = %revision.id, operation = index, error = %err, "Operation does not replay");
            }
        }

        for rule in &self.rules {
            for message in rule.check_revision(revision, ctx) {
                findings.push(ValidationFinding::new(
                    rule.id(),
                    rule.severity(),
                    &revision.id,
                    message,
                ));
            }
        }

        ctx.deprecated.extend(revision.deprecates.iter().cloned());
        self.apply_allow_list(revision, findings)
    }

    fn apply_allow_list(
        &self,
        revision: &Revision,
        findings: Vec<ValidationFinding>,
    ) -> Vec<ValidationFinding> {
        for allowed in &revision.allow {
            if !self.rules.iter().any(|r| r.id() == allowed.as_str()) {
                warn!(revision = %revision.id, rule = %allowed, "Allow list names an unknown rule");
            }
        }

        findings
            .into_iter()
            .filter(|f| {
                let suppressed =
                    f.severity != Severity::Blocking && revision.allow.contains(&f.rule);
                if suppressed {
                    info!(
                        revision = %f.revision,
                        rule = %f.rule,
                        message = %f.message,
                        "Finding acknowledged by allow list"
                    );
                }
                !suppressed
            })
            .collect()
    }

    /// Lints a revision of the graph against its ancestors.
    #[must_use]
    pub fn lint(
        &self,
        revision: &Revision,
        graph: &RevisionGraph,
        ledger: &ChecksumLedger,
    ) -> Vec<ValidationFinding> {
        let mut ctx = LintContext::before(graph, &revision.id).with_recorded(ledger.entries().clone());
        self.lint_in_context(revision, &mut ctx)
    }

    /// Checks only the recorded checksum of a revision.
    #[must_use]
    pub fn verify_checksum(
        &self,
        revision: &Revision,
        recorded: &BTreeMap<RevisionId, String>,
    ) -> Vec<ValidationFinding> {
        let ctx = LintContext::default().with_recorded(recorded.clone());
        self.rules
            .iter()
            .filter(|r| r.id() == rules::CHECKSUM_MISMATCH)
            .flat_map(|rule| {
                rule.check_revision(revision, &ctx)
                    .into_iter()
                    .map(|message| {
                        ValidationFinding::new(rule.id(), rule.severity(), &revision.id, message)
                    })
            })
            .collect()
    }

    /// Lints every revision in the graph before any connection is opened.
    ///
    /// Revisions sealed in the ledger were linted when first applied and
    /// only have their checksum verified.
    #[must_use]
    pub fn lint_graph(&self, graph: &RevisionGraph, ledger: &ChecksumLedger) -> LintReport {
        let mut report = LintReport::default();
        for revision in graph.ordered() {
            if ledger.is_sealed(&revision.id) {
                report.sealed += 1;
                report
                    .findings
                    .extend(self.verify_checksum(revision, ledger.entries()));
            } else {
                report.linted += 1;
                report.findings.extend(self.lint(revision, graph, ledger));
            }
        }
        info!(
            linted = report.linted,
            sealed = report.sealed,
            findings = report.findings.len(),
            "Lint complete"
        );
        report
    }
}
