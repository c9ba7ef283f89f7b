//! Linting revision directories end to end.

use std::fs;
use std::path::Path;

use oxide_safeguard_core::lint::rules;
use oxide_safeguard_core::prelude::*;

const INITIAL: &str = r#"
id = "0001_initial"
description = "Create users"

[[operation]]
kind = "add_table"
name = "users"
columns = [
    { name = "id", type = "integer", primary_key = true },
    { name = "email", type = "varchar(255)", nullable = false },
    { name = "nickname", type = "text" },
]
"#;

const DROP_NICKNAME: &str = r#"
id = "0002_drop_nickname"
parents = ["0001_initial"]

[[operation]]
kind = "drop_column"
table = "users"
column = "nickname"
"#;

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn lint_dir(dir: &Path) -> LintReport {
    let graph = load(dir, &LoadTarget::Head).unwrap();
    let ledger = ChecksumLedger::load(dir).unwrap();
    Linter::new(LintOptions::default()).lint_graph(&graph, &ledger)
}

#[test]
fn drop_without_deprecation_blocks() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "0001_initial.toml", INITIAL);
    write(dir.path(), "0002_drop_nickname.toml", DROP_NICKNAME);

    let report = lint_dir(dir.path());
    let blocking = report.halting(false);
    assert_eq!(blocking.len(), 1, "{:?}", report.findings);
    assert_eq!(blocking[0].rule, rules::DESTRUCTIVE_WITHOUT_DEPRECATION);
    assert_eq!(blocking[0].revision.as_str(), "0002_drop_nickname");
    assert_eq!(blocking[0].operation, Some(0));
}

#[test]
fn two_phase_delete_passes() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "0001_initial.toml", INITIAL);
    write(
        dir.path(),
        "0002_deprecate_nickname.toml",
        r#"
id = "0002_deprecate_nickname"
parents = ["0001_initial"]
deprecates = ["users.nickname"]
"#,
    );
    write(
        dir.path(),
        "0003_drop_nickname.toml",
        r#"
id = "0003_drop_nickname"
parents = ["0002_deprecate_nickname"]
allow = ["irreversible-without-reverse"]

[[operation]]
kind = "drop_column"
table = "users"
column = "nickname"
"#,
    );

    let report = lint_dir(dir.path());
    assert!(report.findings.is_empty(), "{:?}", report.findings);
}

#[test]
fn edited_revision_fails_checksum() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "0001_initial.toml", INITIAL);

    let graph = load(dir.path(), &LoadTarget::Head).unwrap();
    let mut ledger = ChecksumLedger::load(dir.path()).unwrap();
    let id = RevisionId::from("0001_initial");
    ledger.record(&id, graph.get(&id).unwrap().checksum());
    ledger.save().unwrap();
    assert!(lint_dir(dir.path()).findings.is_empty());

    // Someone edits the applied revision in place
    write(
        dir.path(),
        "0001_initial.toml",
        &INITIAL.replace("varchar(255)", "varchar(320)"),
    );
    let report = lint_dir(dir.path());
    assert_eq!(report.halting(false).len(), 1);
    assert_eq!(report.findings[0].rule, rules::CHECKSUM_MISMATCH);
}

#[test]
fn unknown_reference_and_lock_warning() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "0001_initial.toml", INITIAL);
    write(
        dir.path(),
        "0002_orders.toml",
        r#"
id = "0002_orders"
parents = ["0001_initial"]

[[operation]]
kind = "add_index"
name = "idx_orders_total"
table = "orders"
columns = ["total"]

[[operation]]
kind = "raw_statement"
sql = "ALTER TABLE users ADD COLUMN score INTEGER"
reverse = "ALTER TABLE users DROP COLUMN score"
"#,
    );

    let report = lint_dir(dir.path());
    let found: Vec<(&str, Severity)> = report
        .findings
        .iter()
        .map(|f| (f.rule.as_str(), f.severity))
        .collect();
    assert!(found.contains(&(rules::UNKNOWN_REFERENCE, Severity::Blocking)));
    assert!(found.contains(&(rules::LOCK_INDUCING_RAW_STATEMENT, Severity::Warning)));
}

#[test]
fn multiple_heads_block_loading() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "0001_initial.toml", INITIAL);
    write(
        dir.path(),
        "0002_a.toml",
        "id = \"0002_a\"\nparents = [\"0001_initial\"]\n",
    );
    write(
        dir.path(),
        "0002_b.toml",
        "id = \"0002_b\"\nparents = [\"0001_initial\"]\n",
    );

    assert!(matches!(
        load(dir.path(), &LoadTarget::Head),
        Err(GraphError::MultipleHeads(_))
    ));
    assert!(load(dir.path(), &LoadTarget::Named("0002_a".into())).is_ok());
}
