//! Process-wide table descriptions keyed by the migration ledger stamp.
//! Any ledger change (including a rollback followed by re-applying the same version)
//! throws the whole map away; there is no per-table invalidation.

use super::introspect::{ledger_stamp, Introspector, LedgerStamp};
use super::types::TableDescriptor;
use crate::error::AppError;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type TableMap = HashMap<String, Arc<TableDescriptor>>;

#[derive(Default)]
struct Cached {
    stamp: Option<LedgerStamp>,
    tables: Arc<TableMap>,
}

pub struct SchemaCache {
    introspector: Introspector,
    state: RwLock<Cached>,
}

impl SchemaCache {
    pub fn new(introspector: Introspector) -> Self {
        SchemaCache {
            introspector,
            state: RwLock::new(Cached::default()),
        }
    }

    pub fn introspector(&self) -> &Introspector {
        &self.introspector
    }

    /// Description of `table` valid for the current ledger version.
    pub async fn describe(&self, pool: &PgPool, table: &str) -> Result<Arc<TableDescriptor>, AppError> {
        let tables = self.describe_all(pool).await?;
        tables
            .get(table)
            .cloned()
            .ok_or_else(|| AppError::UnknownTable(table.to_string()))
    }

    /// All managed tables, rebuilt when the ledger stamp differs from the cached one.
    pub async fn describe_all(&self, pool: &PgPool) -> Result<Arc<TableMap>, AppError> {
        let current = {
            let mut conn = pool.acquire().await?;
            ledger_stamp(&mut conn, self.introspector.schema()).await?
        };
        if let Some(tables) = self.fresh(&current) {
            return Ok(tables);
        }

        let snapshot = self.introspector.describe_all(pool).await?;
        let tables: Arc<TableMap> = Arc::new(
            snapshot
                .tables
                .into_iter()
                .map(|(name, t)| (name, Arc::new(t)))
                .collect(),
        );
        tracing::info!(
            schema = %self.introspector.schema(),
            version = snapshot.stamp.version,
            tables = tables.len(),
            "schema cache rebuilt"
        );
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.stamp = Some(snapshot.stamp);
        state.tables = Arc::clone(&tables);
        Ok(tables)
    }

    /// Version the cached descriptions were read at, if any.
    pub fn cached_version(&self) -> Option<i64> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .stamp
            .as_ref()
            .map(|s| s.version)
    }

    /// Drop everything; the next lookup re-introspects.
    pub fn invalidate(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = Cached::default();
    }

    fn fresh(&self, stamp: &LedgerStamp) -> Option<Arc<TableMap>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        (state.stamp.as_ref() == Some(stamp)).then(|| Arc::clone(&state.tables))
    }
}
