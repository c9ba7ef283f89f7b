//! Keyword scanning for raw SQL.
//!
//! Raw statements are opaque to the replay engine, so the linter and the
//! executor classify them by text: which table-lock-inducing constructs they
//! contain and whether they can run inside a transaction at all.

use std::sync::LazyLock;

use regex::Regex;

/// Constructs that take a table-level lock for the duration of the statement.
static RE_LOCK_INDUCING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ALTER\s+TABLE|LOCK\s+TABLE|VACUUM|REINDEX|CREATE\s+(?:UNIQUE\s+)?INDEX|DROP\s+TABLE|TRUNCATE|CLUSTER)\b",
    )
    .expect("lock keyword pattern is valid")
});

/// Statements that cannot be executed inside a transaction block.
static RE_NON_TRANSACTIONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(VACUUM|CONCURRENTLY|PRAGMA\s+journal_mode|ATTACH\s+DATABASE|DETACH\s+DATABASE)\b")
        .expect("non-transactional pattern is valid")
});

/// `UPDATE` / `DELETE` statements, for detecting unfiltered data changes.
static RE_DATA_CHANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(UPDATE|DELETE)\b").expect("data change pattern is valid"));

static RE_WHERE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("where pattern is valid"));

/// DDL that changes the catalog.
static RE_DDL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(CREATE|ALTER|DROP)\s+(?:UNIQUE\s+|TEMP\s+|TEMPORARY\s+|VIRTUAL\s+)?(TABLE|INDEX|VIEW|TRIGGER)\b")
        .expect("ddl pattern is valid")
});

/// Removes `--` line comments and `/* */` block comments.
#[must_use]
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\'' {
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Strips comments and blanks out the contents of string literals, leaving
/// only the statement keywords and identifiers.
#[must_use]
pub fn code_only(sql: &str) -> String {
    let mut out = String::new();
    let mut in_string = false;
    for c in strip_comments(sql).chars() {
        if c == '\'' {
            in_string = !in_string;
            out.push(c);
        } else if !in_string {
            out.push(c);
        }
    }
    out
}

/// Returns the lock-inducing constructs found in `sql`, normalized to
/// upper case with single spaces, in order of appearance.
#[must_use]
pub fn lock_inducing_keywords(sql: &str) -> Vec<String> {
    let cleaned = code_only(sql);
    let mut found: Vec<String> = Vec::new();
    for m in RE_LOCK_INDUCING.find_iter(&cleaned) {
        let keyword = m
            .as_str()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        if !found.contains(&keyword) {
            found.push(keyword);
        }
    }
    found
}

/// Returns whether `sql` contains a statement that cannot run in a
/// transaction.
#[must_use]
pub fn is_non_transactional(sql: &str) -> bool {
    RE_NON_TRANSACTIONAL.is_match(&code_only(sql))
}

/// Returns whether `sql` changes tables, indexes, views or triggers.
#[must_use]
pub fn is_schema_changing(sql: &str) -> bool {
    RE_DDL.is_match(&code_only(sql))
}

/// Returns whether `sql` updates or deletes rows without any `WHERE` clause.
#[must_use]
pub fn is_unfiltered_data_change(sql: &str) -> bool {
    let cleaned = code_only(sql);
    RE_DATA_CHANGE.is_match(&cleaned) && !RE_WHERE.is_match(&cleaned)
}
