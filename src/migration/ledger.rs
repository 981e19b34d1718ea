//! The `schema_migrations` ledger: one row per applied script.

use super::script::MigrationScript;
use super::LEDGER_TABLE;
use crate::error::AppError;
use crate::schema::quote_ident;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub description: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

fn ledger(schema: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(LEDGER_TABLE))
}

/// Create the schema and ledger table if missing.
pub async fn ensure(conn: &mut PgConnection, schema: &str) -> Result<(), AppError> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  \
           version BIGINT PRIMARY KEY,\n  \
           description TEXT NOT NULL,\n  \
           checksum TEXT NOT NULL,\n  \
           applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\n)",
        ledger(schema)
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Applied migrations, ascending by version.
pub async fn load(conn: &mut PgConnection, schema: &str) -> Result<Vec<MigrationRecord>, AppError> {
    let rows: Vec<(i64, String, String, DateTime<Utc>)> = sqlx::query_as(&format!(
        "SELECT version, description, checksum, applied_at FROM {} ORDER BY version",
        ledger(schema)
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(version, description, checksum, applied_at)| MigrationRecord {
            version,
            description,
            checksum,
            applied_at,
        })
        .collect())
}

pub async fn insert(conn: &mut PgConnection, schema: &str, script: &MigrationScript) -> Result<(), AppError> {
    sqlx::query(&format!(
        "INSERT INTO {} (version, description, checksum) VALUES ($1, $2, $3)",
        ledger(schema)
    ))
    .bind(script.version)
    .bind(&script.name)
    .bind(&script.checksum)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete(conn: &mut PgConnection, schema: &str, version: i64) -> Result<(), AppError> {
    sqlx::query(&format!("DELETE FROM {} WHERE version = $1", ledger(schema)))
        .bind(version)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Remove every record; returns how many were removed.
pub async fn clear(conn: &mut PgConnection, schema: &str) -> Result<u64, AppError> {
    let done = sqlx::query(&format!("DELETE FROM {}", ledger(schema)))
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected())
}

/// Whether the ledger table exists yet; read-only callers check this instead of creating it.
pub async fn exists(conn: &mut PgConnection, schema: &str) -> Result<bool, AppError> {
    let (exists,): (bool,) = sqlx::query_as("SELECT to_regclass($1) IS NOT NULL")
        .bind(ledger(schema))
        .fetch_one(&mut *conn)
        .await?;
    Ok(exists)
}
