//! Structural description of tables as read from the catalog.

use crate::error::AppError;
use serde::Serialize;

/// The core's classification of a column, independent of the native type name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    /// JSON document; only well-formedness is checked, never inner shape.
    Document,
    /// Integer filled by a sequence or identity.
    Serial,
}

impl LogicalType {
    /// Classify a catalog column. `udt_name` is the underlying type name
    /// (`int4`, `timestamptz`, `jsonb`, ...).
    pub fn from_catalog(udt_name: &str, default: Option<&str>, is_identity: bool) -> Self {
        let sequence_backed =
            is_identity || default.map(|d| d.starts_with("nextval(")).unwrap_or(false);
        match udt_name {
            "int2" | "int4" | "int8" if sequence_backed => LogicalType::Serial,
            "int2" | "int4" | "int8" => LogicalType::Integer,
            "float4" | "float8" | "numeric" => LogicalType::Float,
            "bool" => LogicalType::Boolean,
            "timestamptz" | "timestamp" | "date" => LogicalType::Timestamp,
            "json" | "jsonb" => LogicalType::Document,
            _ => LogicalType::Text,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LogicalType::Text => "text",
            LogicalType::Integer => "integer",
            LogicalType::Float => "float",
            LogicalType::Boolean => "boolean",
            LogicalType::Timestamp => "timestamp",
            LogicalType::Document => "document",
            LogicalType::Serial => "serial",
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(self, LogicalType::Integer | LogicalType::Serial)
    }
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub logical_type: LogicalType,
    /// Catalog type name used when casting bound parameters.
    pub native_type: String,
    /// Schema of a user-defined native type (enums, domains); `None` for built-ins.
    pub native_schema: Option<String>,
    pub nullable: bool,
    pub has_default: bool,
}

impl ColumnDescriptor {
    /// Cast target for a placeholder, e.g. `"int4"` or `"public"."mood"`.
    pub fn cast_target(&self) -> String {
        match &self.native_schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.native_type)),
            None => quote_ident(&self.native_type),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForeignKeyDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

/// Immutable for a given ledger version; the cache replaces it wholesale.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
}

/// Column stamped with `NOW()` on every update when a table defines it.
pub const TOUCH_COLUMN: &str = "updated_at";

impl TableDescriptor {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn require_column(&self, name: &str) -> Result<&ColumnDescriptor, AppError> {
        self.column(name).ok_or_else(|| AppError::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }

    /// The primary key column for id-keyed operations; composite and missing keys are rejected.
    pub fn single_primary_key(&self) -> Result<&ColumnDescriptor, AppError> {
        match self.primary_key.as_slice() {
            [pk] => self.require_column(pk),
            [] => Err(AppError::InvalidQuery(format!(
                "table '{}' has no primary key",
                self.name
            ))),
            _ => Err(AppError::InvalidQuery(format!(
                "table '{}' has a composite primary key; id lookups need a single column",
                self.name
            ))),
        }
    }

    pub fn touch_column(&self) -> Option<&ColumnDescriptor> {
        self.column(TOUCH_COLUMN)
            .filter(|c| c.logical_type == LogicalType::Timestamp)
    }
}

/// Quote an identifier for PostgreSQL. Identifiers only ever come from the catalog.
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_types_classify() {
        assert_eq!(LogicalType::from_catalog("int4", Some("nextval('users_id_seq'::regclass)"), false), LogicalType::Serial);
        assert_eq!(LogicalType::from_catalog("int8", None, true), LogicalType::Serial);
        assert_eq!(LogicalType::from_catalog("int8", Some("0"), false), LogicalType::Integer);
        assert_eq!(LogicalType::from_catalog("numeric", None, false), LogicalType::Float);
        assert_eq!(LogicalType::from_catalog("timestamptz", Some("now()"), false), LogicalType::Timestamp);
        assert_eq!(LogicalType::from_catalog("jsonb", None, false), LogicalType::Document);
        assert_eq!(LogicalType::from_catalog("uuid", None, false), LogicalType::Text);
        assert_eq!(LogicalType::from_catalog("varchar", None, false), LogicalType::Text);
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn user_defined_cast_is_schema_qualified() {
        let col = ColumnDescriptor {
            name: "mood".into(),
            logical_type: LogicalType::Text,
            native_type: "mood".into(),
            native_schema: Some("app".into()),
            nullable: true,
            has_default: false,
        };
        assert_eq!(col.cast_target(), "\"app\".\"mood\"");
    }
}
