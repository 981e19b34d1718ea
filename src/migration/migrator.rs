//! Applies, verifies and rolls back migration scripts against one schema.

use super::ledger::{self, MigrationRecord};
use super::lock::MigrationLock;
use super::script::{self, MigrationScript};
use super::LEDGER_TABLE;
use crate::error::AppError;
use crate::schema::{ledger_version, quote_ident, SchemaCache};
use crate::settings::Settings;
use serde::Serialize;
use sqlx::{Connection, PgConnection, PgPool};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of an apply pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    /// Versions applied by this pass, ascending. Empty when already up to date.
    pub applied: Vec<i64>,
    pub current_version: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PendingMigration {
    pub version: i64,
    pub name: String,
}

/// Ledger compared against the scripts on disk.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub current_version: i64,
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<PendingMigration>,
    /// Applied versions whose script changed since.
    pub drifted: Vec<i64>,
    /// Applied versions with no script on disk.
    pub missing: Vec<i64>,
}

impl MigrationStatus {
    fn compute(scripts: &[MigrationScript], applied: Vec<MigrationRecord>) -> Self {
        let by_version: HashMap<i64, &MigrationScript> = scripts.iter().map(|s| (s.version, s)).collect();
        let applied_versions: HashSet<i64> = applied.iter().map(|r| r.version).collect();
        let mut status = MigrationStatus {
            current_version: applied.iter().map(|r| r.version).max().unwrap_or(0),
            ..MigrationStatus::default()
        };
        for record in &applied {
            match by_version.get(&record.version) {
                Some(s) if s.checksum != record.checksum => status.drifted.push(record.version),
                Some(_) => {}
                None => status.missing.push(record.version),
            }
        }
        status.pending = scripts
            .iter()
            .filter(|s| !applied_versions.contains(&s.version))
            .map(|s| PendingMigration {
                version: s.version,
                name: s.name.clone(),
            })
            .collect();
        status.applied = applied;
        status
    }

    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.drifted.is_empty() && self.missing.is_empty()
    }
}

pub struct Migrator {
    pool: PgPool,
    schema: String,
    dir: PathBuf,
    allow_destructive: bool,
    cache: Option<Arc<SchemaCache>>,
}

impl Migrator {
    pub fn new(pool: PgPool, schema: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Migrator {
            pool,
            schema: schema.into(),
            dir: dir.into(),
            allow_destructive: false,
            cache: None,
        }
    }

    pub fn from_settings(pool: PgPool, settings: &Settings) -> Self {
        Migrator::new(pool, &settings.schema, &settings.migrations_dir)
            .allow_destructive(settings.allow_destructive)
    }

    /// Permit `clear` and `reset`.
    pub fn allow_destructive(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }

    /// Invalidate `cache` whenever the ledger changes.
    pub fn with_cache(mut self, cache: Arc<SchemaCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn lock_key(&self) -> String {
        format!("pgcrud:migrate:{}", self.schema)
    }

    pub fn discover(&self) -> Result<Vec<MigrationScript>, AppError> {
        script::discover(&self.dir)
    }

    /// Highest applied version, 0 before the first migration.
    pub async fn current_version(&self) -> Result<i64, AppError> {
        let mut conn = self.pool.acquire().await?;
        ledger_version(&mut conn, &self.schema).await
    }

    /// Read-only comparison of ledger and scripts. Drift is reported, not raised.
    pub async fn status(&self) -> Result<MigrationStatus, AppError> {
        let scripts = self.discover()?;
        let mut conn = self.pool.acquire().await?;
        let applied = if ledger::exists(&mut conn, &self.schema).await? {
            ledger::load(&mut conn, &self.schema).await?
        } else {
            Vec::new()
        };
        Ok(MigrationStatus::compute(&scripts, applied))
    }

    /// Apply every pending script in ascending order, each in its own transaction.
    /// Fails before applying anything if an applied script drifted or disappeared.
    pub async fn apply(&self) -> Result<ApplyReport, AppError> {
        let scripts = self.discover()?;
        let mut lock = self.lock().await?;
        let result = self.apply_locked(lock.conn(), &scripts).await;
        self.finish(lock, result).await
    }

    /// Run the rollback of the most recently applied script and drop its ledger row.
    /// Returns the rolled back version, or `None` when nothing is applied.
    pub async fn rollback_last(&self) -> Result<Option<i64>, AppError> {
        let scripts = self.discover()?;
        let mut lock = self.lock().await?;
        let result = self.rollback_locked(lock.conn(), &scripts).await;
        self.finish(lock, result).await
    }

    /// Forget every ledger row, keep the schema, and apply all scripts again.
    /// Only safe when scripts are idempotent (`IF NOT EXISTS` style).
    pub async fn clear(&self) -> Result<ApplyReport, AppError> {
        self.require_destructive("clear")?;
        let scripts = self.discover()?;
        let mut lock = self.lock().await?;
        let result: Result<ApplyReport, AppError> = async {
            let conn = lock.conn();
            ledger::ensure(conn, &self.schema).await?;
            let removed = ledger::clear(conn, &self.schema).await?;
            self.invalidate_cache();
            tracing::warn!(schema = %self.schema, removed, "migration ledger cleared");
            self.apply_locked(conn, &scripts).await
        }
        .await;
        self.finish(lock, result).await
    }

    /// Drop every table of the schema except the ledger, empty the ledger in the same
    /// transaction, then apply all scripts from the lowest version.
    pub async fn reset(&self) -> Result<ApplyReport, AppError> {
        self.require_destructive("reset")?;
        let scripts = self.discover()?;
        let mut lock = self.lock().await?;
        let result: Result<ApplyReport, AppError> = async {
            let conn = lock.conn();
            ledger::ensure(conn, &self.schema).await?;
            let dropped = self.drop_managed_tables(conn).await?;
            self.invalidate_cache();
            tracing::warn!(schema = %self.schema, dropped, "schema reset");
            self.apply_locked(conn, &scripts).await
        }
        .await;
        self.finish(lock, result).await
    }

    async fn lock(&self) -> Result<MigrationLock, AppError> {
        MigrationLock::try_acquire(&self.pool, &self.lock_key()).await
    }

    async fn finish<T>(&self, lock: MigrationLock, result: Result<T, AppError>) -> Result<T, AppError> {
        let released = lock.release().await;
        if let (Err(e), Err(_)) = (&released, &result) {
            tracing::warn!(error = %e, "releasing migration lock failed");
        }
        let value = result?;
        released?;
        Ok(value)
    }

    fn require_destructive(&self, operation: &str) -> Result<(), AppError> {
        if self.allow_destructive {
            Ok(())
        } else {
            Err(AppError::Migration(format!(
                "'{}' is destructive and disabled; set MIGRATIONS_ALLOW_DESTRUCTIVE=true to allow it",
                operation
            )))
        }
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate();
        }
    }

    async fn apply_locked(
        &self,
        conn: &mut PgConnection,
        scripts: &[MigrationScript],
    ) -> Result<ApplyReport, AppError> {
        ledger::ensure(conn, &self.schema).await?;
        let records = ledger::load(conn, &self.schema).await?;
        verify(scripts, &records)?;

        let done: HashSet<i64> = records.iter().map(|r| r.version).collect();
        let mut applied = Vec::new();
        for script in scripts.iter().filter(|s| !done.contains(&s.version)) {
            if let Err(e) = self.apply_one(conn, script).await {
                if !applied.is_empty() {
                    self.invalidate_cache();
                }
                return Err(e);
            }
            applied.push(script.version);
        }

        let current_version = done.iter().chain(applied.iter()).copied().max().unwrap_or(0);
        if applied.is_empty() {
            tracing::info!(schema = %self.schema, version = current_version, "migrations up to date");
        } else {
            self.invalidate_cache();
            tracing::info!(
                schema = %self.schema,
                count = applied.len(),
                version = current_version,
                "migrations applied"
            );
        }
        Ok(ApplyReport {
            applied,
            current_version,
        })
    }

    async fn apply_one(&self, conn: &mut PgConnection, script: &MigrationScript) -> Result<(), AppError> {
        let started = Instant::now();
        let mut tx = conn.begin().await?;
        let outcome: Result<(), AppError> = async {
            self.set_search_path(&mut tx).await?;
            sqlx::raw_sql(&script.forward).execute(&mut *tx).await?;
            ledger::insert(&mut tx, &self.schema, script).await
        }
        .await;
        match outcome {
            Ok(()) => {
                tx.commit().await?;
                tracing::info!(
                    version = script.version,
                    name = %script.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "applied migration"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(version = script.version, error = %rb, "rollback failed");
                }
                tracing::error!(version = script.version, name = %script.name, error = %e, "migration failed");
                Err(AppError::MigrationFailed {
                    version: script.version,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn rollback_locked(
        &self,
        conn: &mut PgConnection,
        scripts: &[MigrationScript],
    ) -> Result<Option<i64>, AppError> {
        ledger::ensure(conn, &self.schema).await?;
        let records = ledger::load(conn, &self.schema).await?;
        verify(scripts, &records)?;
        let Some(last) = records.last() else {
            tracing::info!(schema = %self.schema, "nothing to roll back");
            return Ok(None);
        };
        let script = scripts
            .iter()
            .find(|s| s.version == last.version)
            .ok_or_else(|| missing_script(last.version))?;

        let mut tx = conn.begin().await?;
        let outcome: Result<(), AppError> = async {
            self.set_search_path(&mut tx).await?;
            sqlx::raw_sql(&script.rollback).execute(&mut *tx).await?;
            ledger::delete(&mut tx, &self.schema, script.version).await
        }
        .await;
        if let Err(e) = outcome {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(version = script.version, error = %rb, "rollback failed");
            }
            tracing::error!(version = script.version, error = %e, "migration rollback failed");
            return Err(AppError::MigrationFailed {
                version: script.version,
                message: e.to_string(),
            });
        }
        tx.commit().await?;
        self.invalidate_cache();
        tracing::info!(version = script.version, name = %script.name, "rolled back migration");
        Ok(Some(script.version))
    }

    async fn set_search_path(&self, conn: &mut PgConnection) -> Result<(), AppError> {
        sqlx::query(&format!("SET LOCAL search_path TO {}, public", quote_ident(&self.schema)))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Drop all base tables except the ledger and empty the ledger, atomically.
    async fn drop_managed_tables(&self, conn: &mut PgConnection) -> Result<usize, AppError> {
        let mut tx = conn.begin().await?;
        let tables: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT c.relname::text
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relkind IN ('r', 'p') AND c.relname <> $2
            ORDER BY c.relname
            "#,
        )
        .bind(&self.schema)
        .bind(LEDGER_TABLE)
        .fetch_all(&mut *tx)
        .await?;
        let references: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT cl.relname::text, fcl.relname::text
            FROM pg_constraint con
            JOIN pg_class cl ON cl.oid = con.conrelid
            JOIN pg_namespace ns ON ns.oid = cl.relnamespace
            JOIN pg_class fcl ON fcl.oid = con.confrelid
            JOIN pg_namespace fns ON fns.oid = fcl.relnamespace
            WHERE con.contype = 'f' AND ns.nspname = $1 AND fns.nspname = $1
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&mut *tx)
        .await?;

        let tables: Vec<String> = tables.into_iter().map(|(t,)| t).collect();
        let order = drop_order(&tables, &references);
        for (table, cascade) in &order {
            tracing::info!(schema = %self.schema, table = %table, cascade, "dropping table");
            sqlx::query(&format!(
                "DROP TABLE IF EXISTS {}.{}{}",
                quote_ident(&self.schema),
                quote_ident(table),
                if *cascade { " CASCADE" } else { "" }
            ))
            .execute(&mut *tx)
            .await?;
        }
        ledger::clear(&mut tx, &self.schema).await?;
        tx.commit().await?;
        Ok(order.len())
    }
}

fn missing_script(version: i64) -> AppError {
    AppError::Migration(format!(
        "migration {} is recorded as applied but its script is missing",
        version
    ))
}

/// Every applied version must still have its script, byte-for-byte.
fn verify(scripts: &[MigrationScript], records: &[MigrationRecord]) -> Result<(), AppError> {
    let by_version: HashMap<i64, &MigrationScript> = scripts.iter().map(|s| (s.version, s)).collect();
    for record in records {
        let script = by_version
            .get(&record.version)
            .ok_or_else(|| missing_script(record.version))?;
        if script.checksum != record.checksum {
            tracing::error!(
                version = record.version,
                stored = %record.checksum,
                current = %script.checksum,
                "migration drift detected"
            );
            return Err(AppError::MigrationDrift {
                version: record.version,
                stored: record.checksum.clone(),
                current: script.checksum.clone(),
            });
        }
    }
    Ok(())
}

/// Children before parents. `references` holds (referencing, referenced) pairs.
/// Tables left in a reference cycle come last and are flagged for CASCADE.
fn drop_order(tables: &[String], references: &[(String, String)]) -> Vec<(String, bool)> {
    let mut remaining: BTreeSet<&str> = tables.iter().map(String::as_str).collect();
    let mut order = Vec::with_capacity(tables.len());
    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|t| {
                !references.iter().any(|(child, parent)| {
                    parent.as_str() == *t && child != parent && remaining.contains(child.as_str())
                })
            })
            .collect();
        if ready.is_empty() {
            break;
        }
        for t in ready {
            remaining.remove(t);
            order.push((t.to_string(), false));
        }
    }
    order.extend(remaining.into_iter().map(|t| (t.to_string(), true)));
    order
}
