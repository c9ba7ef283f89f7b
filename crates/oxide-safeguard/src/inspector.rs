//! Live database inspection.
//!
//! Reads the applied-state marker and introspects the live schema through
//! `sqlite_master` and the `pragma_*` table-valued functions. The live
//! schema reduces to the same [`CanonicalSchema`] a replayed revision path
//! does, so drift is a fingerprint comparison.

use std::collections::BTreeMap;

use oxide_safeguard_core::fingerprint::{
    diff_lines, is_internal_table, normalize_type, CanonicalColumn, CanonicalForeignKey,
    CanonicalIndex, CanonicalSchema, CanonicalTable,
};
use oxide_safeguard_core::graph::RevisionGraph;
use oxide_safeguard_core::revision::RevisionId;
use oxide_safeguard_core::schema::{
    ColumnSchema, DatabaseSchema, ForeignKeyAction, ForeignKeySchema, IndexSchema, SqlType,
    TableSchema,
};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::history::{self, AppliedState, History, HistoryEntry};
use crate::journal::RunJournal;
use crate::lock::CREATE_LOCK_TABLE_SQL;

#[derive(Debug)]
struct LiveColumn {
    name: String,
    declared: String,
    not_null: bool,
    primary_key: bool,
}

#[derive(Debug)]
struct LiveIndex {
    name: String,
    unique: bool,
    columns: Vec<String>,
}

#[derive(Debug)]
struct LiveForeignKey {
    id: i64,
    columns: Vec<String>,
    references_table: String,
    references_columns: Vec<String>,
}

#[derive(Debug)]
struct LiveTable {
    name: String,
    columns: Vec<LiveColumn>,
    indexes: Vec<LiveIndex>,
    foreign_keys: Vec<LiveForeignKey>,
}

async fn primary_key_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk")
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Reads user tables. Only explicitly created indexes are kept; the
/// automatic ones behind inline UNIQUE and PRIMARY KEY are part of the
/// column definition.
async fn read_tables(conn: &mut SqliteConnection) -> Result<Vec<LiveTable>, sqlx::Error> {
    let names: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await?;

    let mut tables = Vec::new();
    for (name,) in names {
        if is_internal_table(&name) {
            continue;
        }

        let columns: Vec<(String, String, i64, i64)> = sqlx::query_as(
            r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?) ORDER BY cid"#,
        )
        .bind(&name)
        .fetch_all(&mut *conn)
        .await?;

        let index_rows: Vec<(String, i64, String)> =
            sqlx::query_as(r#"SELECT name, "unique", origin FROM pragma_index_list(?)"#)
                .bind(&name)
                .fetch_all(&mut *conn)
                .await?;
        let mut indexes = Vec::new();
        for (index, unique, origin) in index_rows {
            if origin != "c" {
                continue;
            }
            let cols: Vec<(Option<String>,)> =
                sqlx::query_as("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
                    .bind(&index)
                    .fetch_all(&mut *conn)
                    .await?;
            indexes.push(LiveIndex {
                name: index,
                unique: unique != 0,
                columns: cols
                    .into_iter()
                    .map(|(c,)| c.unwrap_or_else(|| "<expr>".to_string()))
                    .collect(),
            });
        }

        let fk_rows: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
            r#"SELECT id, "table", "from", "to" FROM pragma_foreign_key_list(?) ORDER BY id, seq"#,
        )
        .bind(&name)
        .fetch_all(&mut *conn)
        .await?;
        let mut foreign_keys: Vec<LiveForeignKey> = Vec::new();
        for (id, references_table, from, to) in fk_rows {
            let to = match to {
                Some(to) => to,
                // Implicit reference to the parent's primary key
                None => primary_key_columns(conn, &references_table)
                    .await?
                    .into_iter()
                    .nth(
                        foreign_keys
                            .iter()
                            .find(|fk| fk.id == id)
                            .map_or(0, |fk| fk.columns.len()),
                    )
                    .unwrap_or_default(),
            };
            match foreign_keys.iter_mut().find(|fk| fk.id == id) {
                Some(fk) => {
                    fk.columns.push(from);
                    fk.references_columns.push(to);
                }
                None => foreign_keys.push(LiveForeignKey {
                    id,
                    columns: vec![from],
                    references_table,
                    references_columns: vec![to],
                }),
            }
        }

        tables.push(LiveTable {
            name,
            columns: columns
                .into_iter()
                .map(|(name, declared, not_null, pk)| LiveColumn {
                    name,
                    declared,
                    not_null: not_null != 0,
                    primary_key: pk > 0,
                })
                .collect(),
            indexes,
            foreign_keys,
        });
    }
    Ok(tables)
}

/// Maps a declared type to a model type by SQLite's affinity rules.
fn affinity_type(declared: &str) -> SqlType {
    let upper = declared.to_ascii_uppercase();
    if let Ok(ty) = declared.parse::<SqlType>() {
        ty
    } else if upper.contains("INT") {
        SqlType::Integer
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        SqlType::Text
    } else if upper.is_empty() || upper.contains("BLOB") {
        SqlType::Blob
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        SqlType::Real
    } else {
        SqlType::Numeric(10, 0)
    }
}

/// Canonical shape of the live schema.
pub async fn live_canonical(conn: &mut SqliteConnection) -> Result<CanonicalSchema, sqlx::Error> {
    let mut canonical = CanonicalSchema::new();
    for table in read_tables(conn).await? {
        let mut out = CanonicalTable::default();
        for column in table.columns {
            out.columns.insert(
                column.name,
                CanonicalColumn {
                    sql_type: normalize_type(&column.declared),
                    not_null: column.not_null || column.primary_key,
                    primary_key: column.primary_key,
                },
            );
        }
        for index in table.indexes {
            out.indexes.insert(
                index.name,
                CanonicalIndex {
                    unique: index.unique,
                    columns: index.columns,
                },
            );
        }
        for fk in table.foreign_keys {
            out.foreign_keys.insert(CanonicalForeignKey {
                columns: fk.columns,
                references_table: fk.references_table,
                references_columns: fk.references_columns,
            });
        }
        canonical.tables.insert(table.name, out);
    }
    Ok(canonical)
}

/// The live schema as a model, for linting and replay.
pub async fn live_schema(conn: &mut SqliteConnection) -> Result<DatabaseSchema, sqlx::Error> {
    let mut schema = DatabaseSchema::new();
    for table in read_tables(conn).await? {
        let mut out = TableSchema::new(&table.name);
        for column in table.columns {
            let mut c = ColumnSchema::new(column.name, affinity_type(&column.declared));
            c.nullable = !column.not_null && !column.primary_key;
            c.primary_key = column.primary_key;
            out = out.column(c);
        }
        for index in table.indexes {
            out = out.index(IndexSchema {
                name: index.name,
                columns: index.columns,
                unique: index.unique,
                condition: None,
            });
        }
        for fk in table.foreign_keys {
            out = out.foreign_key(ForeignKeySchema {
                name: format!("fk_{}_{}", table.name, fk.id),
                columns: fk.columns,
                references_table: fk.references_table,
                references_columns: fk.references_columns,
                on_delete: ForeignKeyAction::NoAction,
                on_update: ForeignKeyAction::NoAction,
            });
        }
        schema = schema.table(out);
    }
    Ok(schema)
}

/// DDL recreating the user schema: tables first, then indexes, views and
/// triggers, skipping orchestrator and engine tables.
pub async fn schema_ddl(conn: &mut SqliteConnection) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT type, tbl_name, sql FROM sqlite_master WHERE sql IS NOT NULL \
         ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END, rowid",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .filter(|(_, table, _)| !is_internal_table(table))
        .map(|(_, _, sql)| sql)
        .collect())
}

/// Reads and checks the applied state of one database.
#[derive(Debug, Clone)]
pub struct Inspector {
    pool: SqlitePool,
    environment: String,
}

impl Inspector {
    /// Creates an inspector.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            environment: "default".to_string(),
        }
    }

    /// Sets the environment label written at bootstrap.
    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Returns the pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the orchestrator tables and the marker row at the current
    /// schema with no revision applied.
    pub async fn bootstrap(&self) -> Result<AppliedState, StateError> {
        RunJournal::new(self.pool.clone()).ensure_tables().await?;
        sqlx::query(CREATE_LOCK_TABLE_SQL)
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;
        history::ensure_tables(&mut tx).await?;
        if let Some(marker) = history::read_marker(&mut tx).await? {
            return Err(StateError::AlreadyInitialized {
                revision: marker.state.revision,
            });
        }
        let canonical = live_canonical(&mut tx).await?;
        let state = history::insert_marker(&mut tx, &canonical, &self.environment).await?;
        tx.commit().await?;

        info!(
            environment = %state.environment,
            fingerprint = %state.fingerprint.short(),
            "Bootstrapped database"
        );
        Ok(state)
    }

    /// Reads the marker and checks the live schema against it.
    pub async fn inspect(&self) -> Result<AppliedState, StateError> {
        let mut conn = self.pool.acquire().await?;
        let marker = history::read_marker(&mut conn)
            .await?
            .ok_or(StateError::MissingMarker)?;
        let live = live_canonical(&mut conn).await?;
        let actual = live.fingerprint();

        if actual != marker.state.fingerprint {
            let diff = diff_lines(&live.lines(), &marker.canonical);
            warn!(
                recorded = %marker.state.fingerprint.short(),
                actual = %actual.short(),
                changes = diff.len(),
                "Schema drift detected"
            );
            return Err(StateError::Drift {
                recorded: marker.state.fingerprint,
                actual,
                diff,
            });
        }

        debug!(
            revision = ?marker.state.revision.as_ref().map(RevisionId::as_str),
            fingerprint = %actual.short(),
            "Inspected database"
        );
        Ok(marker.state)
    }

    /// Like [`Inspector::inspect`], also requiring the marker revision to
    /// be part of `graph`.
    pub async fn inspect_against(&self, graph: &RevisionGraph) -> Result<AppliedState, StateError> {
        let state = self.inspect().await?;
        if let Some(revision) = &state.revision {
            if !graph.contains(revision) {
                return Err(StateError::UnknownRevision(revision.clone()));
            }
        }
        Ok(state)
    }

    /// Reads the marker without checking for drift.
    pub async fn marker(&self) -> Result<AppliedState, StateError> {
        let mut conn = self.pool.acquire().await?;
        history::read_marker(&mut conn)
            .await?
            .map(|m| m.state)
            .ok_or(StateError::MissingMarker)
    }

    /// Canonical shape of the live schema.
    pub async fn live_canonical(&self) -> Result<CanonicalSchema, StateError> {
        let mut conn = self.pool.acquire().await?;
        Ok(live_canonical(&mut conn).await?)
    }

    /// The live schema as a model.
    pub async fn live_schema(&self) -> Result<DatabaseSchema, StateError> {
        let mut conn = self.pool.acquire().await?;
        Ok(live_schema(&mut conn).await?)
    }

    /// Committed marker moves, oldest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, StateError> {
        Ok(History::new(self.pool.clone()).entries().await?)
    }

    /// Checksums recorded in the database for applied revisions.
    pub async fn recorded_checksums(&self) -> Result<BTreeMap<RevisionId, String>, StateError> {
        Ok(History::new(self.pool.clone()).recorded_checksums().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxide_safeguard_core::dialect::{MigrationDialect, SqliteDialect};
    use oxide_safeguard_core::operations::Operation;
    use oxide_safeguard_core::revision::Revision;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    fn graph() -> RevisionGraph {
        RevisionGraph::build(vec![
            Revision::new("0001_users").operation(Operation::add_table(
                "users",
                vec![
                    ColumnSchema::new("id", SqlType::BigInt).primary_key(),
                    ColumnSchema::new("email", SqlType::Varchar(255)).not_null(),
                ],
            )),
            Revision::new("0002_posts")
                .parent("0001_users")
                .operation(Operation::AddTable {
                    name: "posts".to_string(),
                    columns: vec![
                        ColumnSchema::new("id", SqlType::Integer).primary_key(),
                        ColumnSchema::new("author_id", SqlType::BigInt).not_null(),
                        ColumnSchema::new("title", SqlType::Text),
                    ],
                    primary_key: Vec::new(),
                    foreign_keys: vec![ForeignKeySchema {
                        name: "fk_posts_author".to_string(),
                        columns: vec!["author_id".to_string()],
                        references_table: "users".to_string(),
                        references_columns: vec!["id".to_string()],
                        on_delete: ForeignKeyAction::Cascade,
                        on_update: ForeignKeyAction::NoAction,
                    }],
                })
                .operation(Operation::add_index(
                    "idx_posts_title",
                    "posts",
                    vec!["title".to_string()],
                    false,
                )),
        ])
        .unwrap()
    }

    async fn apply_all(pool: &SqlitePool, graph: &RevisionGraph) {
        let dialect = SqliteDialect::new();
        for revision in graph.ordered() {
            for op in &revision.operations {
                for sql in dialect.generate_sql(op).unwrap() {
                    sqlx::query(&sql).execute(pool).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_live_canonical_matches_replay() {
        let pool = create_test_pool().await;
        let graph = graph();
        apply_all(&pool, &graph).await;

        let mut conn = pool.acquire().await.unwrap();
        let live = live_canonical(&mut conn).await.unwrap();
        let head = RevisionId::from("0002_posts");
        let expected = graph
            .expected_schema(Some(&head), &SqliteDialect::new())
            .unwrap()
            .unwrap();
        assert_eq!(live.diff(&expected), Vec::<String>::new());
        assert_eq!(live.fingerprint(), expected.fingerprint());
    }

    #[tokio::test]
    async fn test_live_schema_model() {
        let pool = create_test_pool().await;
        apply_all(&pool, &graph()).await;

        let mut conn = pool.acquire().await.unwrap();
        let schema = live_schema(&mut conn).await.unwrap();
        let posts = schema.get_table("posts").unwrap();
        assert_eq!(posts.primary_key, vec!["id"]);
        assert!(posts.has_index("idx_posts_title"));
        assert_eq!(posts.foreign_keys[0].references_table, "users");
        assert!(!posts.get_column("author_id").unwrap().nullable);
        assert_eq!(posts.get_column("title").unwrap().sql_type, SqlType::Text);

        let ddl = schema_ddl(&mut conn).await.unwrap();
        assert_eq!(ddl.len(), 3);
        assert!(ddl[2].starts_with("CREATE INDEX"));
    }

    #[tokio::test]
    async fn test_inspect_requires_bootstrap() {
        let inspector = Inspector::new(create_test_pool().await);
        assert!(matches!(
            inspector.inspect().await,
            Err(StateError::MissingMarker)
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_once() {
        let inspector = Inspector::new(create_test_pool().await).environment("ci");
        let state = inspector.bootstrap().await.unwrap();
        assert_eq!(state.revision, None);
        assert_eq!(state.fingerprint, CanonicalSchema::new().fingerprint());

        assert_eq!(inspector.inspect().await.unwrap(), state);
        assert!(matches!(
            inspector.bootstrap().await,
            Err(StateError::AlreadyInitialized { revision: None })
        ));
    }

    #[tokio::test]
    async fn test_drift_reports_diff() {
        let pool = create_test_pool().await;
        let inspector = Inspector::new(pool.clone());
        inspector.bootstrap().await.unwrap();

        sqlx::query("CREATE TABLE rogue (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();

        match inspector.inspect().await {
            Err(StateError::Drift { diff, .. }) => {
                assert_eq!(
                    diff,
                    vec![
                        "+ table rogue",
                        "+ column rogue.id INTEGER NOT NULL PRIMARY KEY"
                    ]
                );
            }
            other => panic!("expected drift, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_marker_revision() {
        let pool = create_test_pool().await;
        let inspector = Inspector::new(pool.clone());
        inspector.bootstrap().await.unwrap();
        sqlx::query("UPDATE safeguard_applied_state SET revision = '9999_gone'")
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(
            inspector.inspect_against(&graph()).await,
            Err(StateError::UnknownRevision(id)) if id.as_str() == "9999_gone"
        ));
    }

    #[test]
    fn test_affinity_type() {
        assert_eq!(affinity_type("INTEGER"), SqlType::Integer);
        assert_eq!(affinity_type("UNSIGNED BIG INT"), SqlType::Integer);
        assert_eq!(affinity_type("NVARCHAR(100)"), SqlType::Text);
        assert_eq!(affinity_type(""), SqlType::Blob);
        assert_eq!(affinity_type("DOUBLE PRECISION"), SqlType::Real);
        assert_eq!(affinity_type("NUMERIC"), SqlType::Numeric(10, 0));
    }
}
