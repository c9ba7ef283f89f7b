//! Schema representation types.
//!
//! These types describe the structure of database tables. Revisions describe
//! their changes in terms of them, the replay engine in [`crate::state`]
//! folds them into a [`DatabaseSchema`], and the fingerprint model compares
//! that against what a live database reports.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a type name in a revision file cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown SQL type '{0}'")]
pub struct ParseSqlTypeError(pub String);

/// SQL data types supported by revision definitions.
///
/// Serialized as the lowercase SQL spelling (`"varchar(255)"`,
/// `"decimal(10, 2)"`) so revision files read like DDL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SqlType {
    /// Integer (32-bit).
    Integer,
    /// Big integer (64-bit).
    BigInt,
    /// Small integer (16-bit).
    SmallInt,
    /// Unbounded text.
    Text,
    /// Variable-length character string.
    Varchar(usize),
    /// Fixed-length character string.
    Char(usize),
    /// Boolean.
    Boolean,
    /// Date and time.
    DateTime,
    /// Date only.
    Date,
    /// Time only.
    Time,
    /// Timestamp.
    Timestamp,
    /// Floating point (single precision).
    Real,
    /// Floating point (double precision).
    Double,
    /// Decimal with precision and scale.
    Decimal(u8, u8),
    /// Numeric (alias for Decimal).
    Numeric(u8, u8),
    /// Binary large object.
    Blob,
    /// Binary data with max length.
    Binary(usize),
    /// Variable-length binary data.
    VarBinary(usize),
    /// JSON data.
    Json,
    /// UUID.
    Uuid,
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => f.write_str("integer"),
            Self::BigInt => f.write_str("bigint"),
            Self::SmallInt => f.write_str("smallint"),
            Self::Text => f.write_str("text"),
            Self::Varchar(len) => write!(f, "varchar({len})"),
            Self::Char(len) => write!(f, "char({len})"),
            Self::Boolean => f.write_str("boolean"),
            Self::DateTime => f.write_str("datetime"),
            Self::Date => f.write_str("date"),
            Self::Time => f.write_str("time"),
            Self::Timestamp => f.write_str("timestamp"),
            Self::Real => f.write_str("real"),
            Self::Double => f.write_str("double"),
            Self::Decimal(p, s) => write!(f, "decimal({p}, {s})"),
            Self::Numeric(p, s) => write!(f, "numeric({p}, {s})"),
            Self::Blob => f.write_str("blob"),
            Self::Binary(len) => write!(f, "binary({len})"),
            Self::VarBinary(len) => write!(f, "varbinary({len})"),
            Self::Json => f.write_str("json"),
            Self::Uuid => f.write_str("uuid"),
        }
    }
}

impl FromStr for SqlType {
    type Err = ParseSqlTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let err = || ParseSqlTypeError(s.to_string());

        let (base, args) = match normalized.split_once('(') {
            Some((base, rest)) => {
                let inner = rest.strip_suffix(')').ok_or_else(err)?;
                let args: Vec<&str> = inner.split(',').map(str::trim).collect();
                (base.trim().to_string(), args)
            }
            None => (normalized.clone(), Vec::new()),
        };

        let size = |args: &[&str]| -> Result<usize, ParseSqlTypeError> {
            match args {
                [n] => n.parse().map_err(|_| err()),
                _ => Err(err()),
            }
        };
        let precision = |args: &[&str]| -> Result<(u8, u8), ParseSqlTypeError> {
            match args {
                [p, s] => Ok((p.parse().map_err(|_| err())?, s.parse().map_err(|_| err())?)),
                [p] => Ok((p.parse().map_err(|_| err())?, 0)),
                _ => Err(err()),
            }
        };

        let ty = match (base.as_str(), args.is_empty()) {
            ("integer" | "int", true) => Self::Integer,
            ("bigint", true) => Self::BigInt,
            ("smallint", true) => Self::SmallInt,
            ("text", true) => Self::Text,
            ("varchar", false) => Self::Varchar(size(&args)?),
            ("char", false) => Self::Char(size(&args)?),
            ("boolean" | "bool", true) => Self::Boolean,
            ("datetime", true) => Self::DateTime,
            ("date", true) => Self::Date,
            ("time", true) => Self::Time,
            ("timestamp", true) => Self::Timestamp,
            ("real" | "float", true) => Self::Real,
            ("double", true) => Self::Double,
            ("decimal", false) => {
                let (p, s) = precision(&args)?;
                Self::Decimal(p, s)
            }
            ("numeric", false) => {
                let (p, s) = precision(&args)?;
                Self::Numeric(p, s)
            }
            ("blob", true) => Self::Blob,
            ("binary", false) => Self::Binary(size(&args)?),
            ("varbinary", false) => Self::VarBinary(size(&args)?),
            ("json", true) => Self::Json,
            ("uuid", true) => Self::Uuid,
            _ => return Err(err()),
        };
        Ok(ty)
    }
}

impl TryFrom<String> for SqlType {
    type Error = ParseSqlTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SqlType> for String {
    fn from(value: SqlType) -> Self {
        value.to_string()
    }
}

/// Default value for a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    /// No default value.
    #[default]
    None,
    /// NULL default.
    Null,
    /// Boolean default.
    Bool(bool),
    /// Integer default.
    Integer(i64),
    /// Float default.
    Float(f64),
    /// String default.
    String(String),
    /// SQL expression (e.g., "CURRENT_TIMESTAMP").
    Expression(String),
}

impl DefaultValue {
    /// Returns the SQL representation of this default value.
    #[must_use]
    pub fn to_sql(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Null => Some("NULL".to_string()),
            Self::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::String(s) => Some(format!("'{}'", s.replace('\'', "''"))),
            Self::Expression(expr) => Some(format!("({expr})")),
        }
    }
}

/// Foreign key action (ON DELETE, ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    /// No action (error if referenced row is deleted/updated).
    #[default]
    NoAction,
    /// Restrict (same as NoAction but checked immediately).
    Restrict,
    /// Cascade the delete/update to referencing rows.
    Cascade,
    /// Set the foreign key column to NULL.
    SetNull,
    /// Set the foreign key column to its default value.
    SetDefault,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Schema definition for a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// SQL data type.
    #[serde(rename = "type")]
    pub sql_type: SqlType,
    /// Whether the column allows NULL values.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Default value.
    #[serde(default)]
    pub default: DefaultValue,
    /// Whether this column is part of the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Whether this column auto-increments.
    #[serde(default)]
    pub auto_increment: bool,
    /// Whether this column has a UNIQUE constraint.
    #[serde(default)]
    pub unique: bool,
    /// Check constraint expression (if any).
    #[serde(default)]
    pub check: Option<String>,
}

impl ColumnSchema {
    /// Creates a new column schema.
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
            default: DefaultValue::None,
            primary_key: false,
            auto_increment: false,
            unique: false,
            check: None,
        }
    }

    /// Sets the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default(mut self, value: DefaultValue) -> Self {
        self.default = value;
        self
    }

    /// Sets the column as the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false; // Primary keys are always NOT NULL
        self
    }

    /// Sets the column to auto-increment.
    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Sets the column as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets a check constraint.
    #[must_use]
    pub fn check(mut self, expr: impl Into<String>) -> Self {
        self.check = Some(expr.into());
        self
    }
}

/// Schema definition for a foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKeySchema {
    /// Constraint name.
    pub name: String,
    /// Column(s) in the referencing table.
    pub columns: Vec<String>,
    /// Referenced table name.
    pub references_table: String,
    /// Referenced column(s).
    pub references_columns: Vec<String>,
    /// Action on delete.
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    /// Action on update.
    #[serde(default)]
    pub on_update: ForeignKeyAction,
}

/// Schema definition for an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Index name.
    pub name: String,
    /// Columns included in the index.
    pub columns: Vec<String>,
    /// Whether this is a unique index.
    pub unique: bool,
    /// Partial index condition (WHERE clause).
    pub condition: Option<String>,
}

/// Schema definition for a unique constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueConstraint {
    /// Constraint name.
    pub name: String,
    /// Columns that form the unique constraint.
    pub columns: Vec<String>,
}

/// Complete schema definition for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Column definitions.
    pub columns: Vec<ColumnSchema>,
    /// Primary key column(s).
    pub primary_key: Vec<String>,
    /// Index definitions.
    pub indexes: Vec<IndexSchema>,
    /// Foreign key definitions.
    pub foreign_keys: Vec<ForeignKeySchema>,
    /// Unique constraint definitions.
    pub unique_constraints: Vec<UniqueConstraint>,
    /// Set when the table was created or altered by raw SQL, so its
    /// columns are not known to the replay engine.
    #[serde(default)]
    pub opaque: bool,
}

impl TableSchema {
    /// Creates a new table schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
            opaque: false,
        }
    }

    /// Adds a column to the table.
    #[must_use]
    pub fn column(mut self, column: ColumnSchema) -> Self {
        if column.primary_key && !self.primary_key.contains(&column.name) {
            self.primary_key.push(column.name.clone());
        }
        self.columns.push(column);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKeySchema) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Gets a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Gets a mutable column by name.
    #[must_use]
    pub fn get_column_mut(&mut self, name: &str) -> Option<&mut ColumnSchema> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Returns whether a column is known, treating opaque tables as
    /// containing every column.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.opaque || self.get_column(name).is_some()
    }

    /// Returns whether an index or unique constraint with this name exists.
    #[must_use]
    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.name == name)
            || self.unique_constraints.iter().any(|u| u.name == name)
    }
}

/// The complete database schema (all tables).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// All tables in the database.
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    /// Creates a new empty database schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table to the schema.
    #[must_use]
    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    /// Gets a table by name.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Gets a mutable table by name.
    #[must_use]
    pub fn get_table_mut(&mut self, name: &str) -> Option<&mut TableSchema> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    /// Returns table names.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Finds the table owning an index or unique constraint.
    #[must_use]
    pub fn index_owner(&self, index: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.has_index(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_schema_builder() {
        let col = ColumnSchema::new("id", SqlType::BigInt)
            .primary_key()
            .auto_increment();

        assert_eq!(col.name, "id");
        assert!(col.primary_key);
        assert!(col.auto_increment);
        assert!(!col.nullable); // Primary keys are NOT NULL
    }

    #[test]
    fn test_table_schema_builder() {
        let table = TableSchema::new("users")
            .column(ColumnSchema::new("id", SqlType::BigInt).primary_key())
            .column(ColumnSchema::new("name", SqlType::Varchar(255)).not_null())
            .column(ColumnSchema::new("email", SqlType::Varchar(255)));

        assert_eq!(table.name, "users");
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.primary_key, vec!["id"]);
        assert!(table.has_column("email"));
        assert!(!table.has_column("phone"));
    }

    #[test]
    fn test_opaque_table_accepts_any_column() {
        let mut table = TableSchema::new("legacy");
        table.opaque = true;
        assert!(table.has_column("whatever"));
    }

    #[test]
    fn test_default_value_to_sql() {
        assert_eq!(DefaultValue::None.to_sql(), None);
        assert_eq!(DefaultValue::Null.to_sql(), Some("NULL".to_string()));
        assert_eq!(DefaultValue::Bool(true).to_sql(), Some("1".to_string()));
        assert_eq!(DefaultValue::Integer(42).to_sql(), Some("42".to_string()));
        assert_eq!(
            DefaultValue::String("it's".to_string()).to_sql(),
            Some("'it''s'".to_string())
        );
        assert_eq!(
            DefaultValue::Expression("CURRENT_TIMESTAMP".to_string()).to_sql(),
            Some("(CURRENT_TIMESTAMP)".to_string())
        );
    }

    #[test]
    fn test_sql_type_parsing() {
        assert_eq!("INTEGER".parse::<SqlType>().unwrap(), SqlType::Integer);
        assert_eq!("varchar(255)".parse::<SqlType>().unwrap(), SqlType::Varchar(255));
        assert_eq!(
            "Decimal(10, 2)".parse::<SqlType>().unwrap(),
            SqlType::Decimal(10, 2)
        );
        assert_eq!("numeric(8)".parse::<SqlType>().unwrap(), SqlType::Numeric(8, 0));
        assert!("varchar".parse::<SqlType>().is_err());
        assert!("geometry".parse::<SqlType>().is_err());
        assert!("varchar(abc)".parse::<SqlType>().is_err());
    }

    #[test]
    fn test_sql_type_display_parses_back() {
        for ty in [
            SqlType::BigInt,
            SqlType::Varchar(64),
            SqlType::Decimal(12, 4),
            SqlType::VarBinary(16),
        ] {
            assert_eq!(ty.to_string().parse::<SqlType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_column_from_toml() {
        let col: ColumnSchema = toml::from_str(
            r#"
            name = "email"
            type = "varchar(255)"
            nullable = false
            default = { string = "" }
            "#,
        )
        .unwrap();
        assert_eq!(col.sql_type, SqlType::Varchar(255));
        assert!(!col.nullable);
        assert_eq!(col.default, DefaultValue::String(String::new()));
    }
}
