//! Catalog queries that build `TableDescriptor`s. Runs inside one read-only transaction
//! so the ledger version and the descriptions form a consistent snapshot.

use super::types::{
    quote_ident, ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, LogicalType,
    TableDescriptor,
};
use crate::error::AppError;
use crate::migration::LEDGER_TABLE;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;

/// Identity of the ledger contents. Two reads with equal stamps saw the same applied
/// migrations; rolling back and re-applying a version changes the fingerprint even
/// though `version` ends where it started.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerStamp {
    /// Highest applied version, 0 when nothing is applied.
    pub version: i64,
    /// md5 over every `(version, checksum, applied_at)` row; empty without a ledger.
    pub fingerprint: String,
}

/// Descriptions of every managed table together with the ledger state they were read at.
#[derive(Clone, Debug, Default)]
pub struct SchemaSnapshot {
    pub stamp: LedgerStamp,
    pub tables: HashMap<String, TableDescriptor>,
}

#[derive(Clone, Debug)]
pub struct Introspector {
    schema: String,
}

type ColumnRow = (String, String, String, Option<String>, bool, Option<String>, bool);
type FkRow = (String, String, String, String, String);
type IndexRow = (String, String, bool, bool, String);

impl Introspector {
    pub fn new(schema: impl Into<String>) -> Self {
        Introspector {
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Describe one table. Fails with `UnknownTable` if it does not exist (or is the ledger).
    pub async fn describe(&self, pool: &PgPool, table: &str) -> Result<TableDescriptor, AppError> {
        let mut snapshot = self.load(pool, Some(table)).await?;
        snapshot
            .tables
            .remove(table)
            .ok_or_else(|| AppError::UnknownTable(table.to_string()))
    }

    /// Describe every base table in the schema except the migration ledger.
    pub async fn describe_all(&self, pool: &PgPool) -> Result<SchemaSnapshot, AppError> {
        self.load(pool, None).await
    }

    /// Highest applied migration version; 0 when nothing has been applied or the ledger is absent.
    pub async fn ledger_version(&self, conn: &mut PgConnection) -> Result<i64, AppError> {
        ledger_version(conn, &self.schema).await
    }

    async fn load(&self, pool: &PgPool, only: Option<&str>) -> Result<SchemaSnapshot, AppError> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        let stamp = ledger_stamp(&mut *tx, &self.schema).await?;

        let columns: Vec<ColumnRow> = sqlx::query_as(
            r#"
            SELECT c.table_name::text,
                   c.column_name::text,
                   c.udt_name::text,
                   CASE WHEN c.data_type = 'USER-DEFINED' THEN c.udt_schema::text END,
                   c.is_nullable = 'YES',
                   c.column_default::text,
                   c.is_identity = 'YES'
            FROM information_schema.columns c
            JOIN information_schema.tables t
              ON t.table_schema = c.table_schema AND t.table_name = c.table_name
            WHERE c.table_schema = $1
              AND t.table_type = 'BASE TABLE'
              AND c.table_name <> $2
              AND ($3::text IS NULL OR c.table_name = $3)
            ORDER BY c.table_name, c.ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(LEDGER_TABLE)
        .bind(only)
        .fetch_all(&mut *tx)
        .await?;

        let primary_keys: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT tc.table_name::text, kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_schema = tc.constraint_schema
             AND kcu.constraint_name = tc.constraint_name
             AND kcu.table_name = tc.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
              AND tc.table_schema = $1
              AND ($2::text IS NULL OR tc.table_name = $2)
            ORDER BY tc.table_name, kcu.ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(only)
        .fetch_all(&mut *tx)
        .await?;

        let foreign_keys: Vec<FkRow> = sqlx::query_as(
            r#"
            SELECT cl.relname::text, con.conname::text, att.attname::text,
                   fcl.relname::text, fatt.attname::text
            FROM pg_constraint con
            JOIN pg_class cl ON cl.oid = con.conrelid
            JOIN pg_namespace ns ON ns.oid = cl.relnamespace
            JOIN pg_class fcl ON fcl.oid = con.confrelid
            CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(attnum, fattnum, ord)
            JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.attnum
            JOIN pg_attribute fatt ON fatt.attrelid = con.confrelid AND fatt.attnum = k.fattnum
            WHERE con.contype = 'f'
              AND ns.nspname = $1
              AND ($2::text IS NULL OR cl.relname = $2)
            ORDER BY cl.relname, con.conname, k.ord
            "#,
        )
        .bind(&self.schema)
        .bind(only)
        .fetch_all(&mut *tx)
        .await?;

        let indexes: Vec<IndexRow> = sqlx::query_as(
            r#"
            SELECT t.relname::text, i.relname::text, ix.indisunique, ix.indisprimary, a.attname::text
            FROM pg_index ix
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            CROSS JOIN LATERAL unnest(ix.indkey::smallint[]) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            WHERE n.nspname = $1
              AND ($2::text IS NULL OR t.relname = $2)
            ORDER BY t.relname, i.relname, k.ord
            "#,
        )
        .bind(&self.schema)
        .bind(only)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let tables = assemble(&self.schema, columns, primary_keys, foreign_keys, indexes);
        tracing::debug!(
            schema = %self.schema,
            version = stamp.version,
            tables = tables.len(),
            "introspected schema"
        );
        Ok(SchemaSnapshot { stamp, tables })
    }
}

pub(crate) async fn ledger_version(conn: &mut PgConnection, schema: &str) -> Result<i64, AppError> {
    Ok(ledger_stamp(conn, schema).await?.version)
}

/// Read the ledger's `LedgerStamp`; the default stamp when the ledger table is absent.
pub(crate) async fn ledger_stamp(conn: &mut PgConnection, schema: &str) -> Result<LedgerStamp, AppError> {
    let ledger = format!("{}.{}", quote_ident(schema), quote_ident(LEDGER_TABLE));
    let (exists,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
        .bind(&ledger)
        .fetch_one(&mut *conn)
        .await?;
    if !exists {
        return Ok(LedgerStamp::default());
    }
    let (version, fingerprint): (i64, String) = sqlx::query_as(&format!(
        "SELECT COALESCE(MAX(version), 0)::bigint, \
                COALESCE(md5(string_agg(version::text || ':' || checksum || ':' || \
                    extract(epoch FROM applied_at)::text, ',' ORDER BY version)), '') \
         FROM {}",
        ledger
    ))
    .fetch_one(&mut *conn)
    .await?;
    Ok(LedgerStamp { version, fingerprint })
}

/// Group flat catalog rows into descriptors. Tables only exist if they have columns.
fn assemble(
    schema: &str,
    columns: Vec<ColumnRow>,
    primary_keys: Vec<(String, String)>,
    foreign_keys: Vec<FkRow>,
    indexes: Vec<IndexRow>,
) -> HashMap<String, TableDescriptor> {
    let mut tables: HashMap<String, TableDescriptor> = HashMap::new();

    for (table, name, udt_name, udt_schema, nullable, default, is_identity) in columns {
        let logical_type = LogicalType::from_catalog(&udt_name, default.as_deref(), is_identity);
        let entry = tables.entry(table.clone()).or_insert_with(|| TableDescriptor {
            schema: schema.to_string(),
            name: table,
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        });
        entry.columns.push(ColumnDescriptor {
            name,
            logical_type,
            native_type: udt_name,
            native_schema: udt_schema,
            nullable,
            has_default: default.is_some() || is_identity,
        });
    }

    for (table, column) in primary_keys {
        if let Some(t) = tables.get_mut(&table) {
            t.primary_key.push(column);
        }
    }

    for (table, constraint, column, ref_table, ref_column) in foreign_keys {
        let Some(t) = tables.get_mut(&table) else { continue };
        match t.foreign_keys.iter_mut().find(|fk| fk.name == constraint) {
            Some(fk) => {
                fk.columns.push(column);
                fk.referenced_columns.push(ref_column);
            }
            None => t.foreign_keys.push(ForeignKeyDescriptor {
                name: constraint,
                columns: vec![column],
                referenced_table: ref_table,
                referenced_columns: vec![ref_column],
            }),
        }
    }

    for (table, index, unique, primary, column) in indexes {
        let Some(t) = tables.get_mut(&table) else { continue };
        match t.indexes.iter_mut().find(|i| i.name == index) {
            Some(i) => i.columns.push(column),
            None => t.indexes.push(IndexDescriptor {
                name: index,
                columns: vec![column],
                unique,
                primary,
            }),
        }
    }

    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_rows_into_descriptors() {
        let columns = vec![
            ("sessions".to_string(), "session_id".to_string(), "int4".to_string(), None, false, Some("nextval('s_seq'::regclass)".to_string()), false),
            ("sessions".to_string(), "user_id".to_string(), "text".to_string(), None, false, None, false),
            ("sessions".to_string(), "updated_at".to_string(), "timestamptz".to_string(), None, true, Some("now()".to_string()), false),
            ("users".to_string(), "user_id".to_string(), "text".to_string(), None, false, None, false),
        ];
        let pks = vec![
            ("sessions".to_string(), "session_id".to_string()),
            ("users".to_string(), "user_id".to_string()),
        ];
        let fks = vec![(
            "sessions".to_string(),
            "sessions_user_id_fkey".to_string(),
            "user_id".to_string(),
            "users".to_string(),
            "user_id".to_string(),
        )];
        let idx = vec![
            ("sessions".to_string(), "sessions_pkey".to_string(), true, true, "session_id".to_string()),
            ("sessions".to_string(), "sessions_user_ts".to_string(), false, false, "user_id".to_string()),
            ("sessions".to_string(), "sessions_user_ts".to_string(), false, false, "updated_at".to_string()),
        ];

        let tables = assemble("public", columns, pks, fks, idx);
        let sessions = &tables["sessions"];
        assert_eq!(sessions.columns.len(), 3);
        assert_eq!(sessions.columns[0].logical_type, LogicalType::Serial);
        assert!(sessions.columns[0].has_default);
        assert_eq!(sessions.primary_key, vec!["session_id"]);
        assert_eq!(sessions.foreign_keys[0].referenced_table, "users");
        assert_eq!(sessions.indexes.len(), 2);
        assert_eq!(sessions.indexes[1].columns, vec!["user_id", "updated_at"]);
        assert!(sessions.touch_column().is_some());
        assert!(tables["users"].touch_column().is_none());
    }
}
