//! Generic CRUD over any described table: builder + executor, no per-table code.

use super::executor::{QueryExecutor, Row};
use crate::error::AppError;
use crate::schema::{SchemaCache, TableDescriptor};
use crate::sql::{
    build_count, build_delete, build_get_by_id, build_insert, build_select, build_update,
    FilterExpression, OrderBy, Page,
};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Upper bound on rows accepted by one `create_many` call.
pub const BULK_LIMIT: usize = 100;

/// One page of rows plus the total matching the filters, independent of paging.
#[derive(Clone, Debug, PartialEq)]
pub struct Listing {
    pub items: Vec<Row>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

/// CRUD operations bound to one table description.
#[derive(Clone)]
pub struct CrudEndpoint {
    table: Arc<TableDescriptor>,
    executor: QueryExecutor,
}

impl CrudEndpoint {
    pub fn new(table: Arc<TableDescriptor>, executor: QueryExecutor) -> Self {
        CrudEndpoint { table, executor }
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    pub async fn get(&self, id: &Value) -> Result<Row, AppError> {
        let q = build_get_by_id(&self.table, id)?;
        let row = self.executor.fetch_optional(&q).await?;
        row.ok_or_else(|| self.not_found(id))
    }

    /// Page of rows plus the total count; both queries run concurrently with the same predicate.
    pub async fn list(
        &self,
        filters: &[FilterExpression],
        ordering: &[OrderBy],
        page: Page,
    ) -> Result<Listing, AppError> {
        let select = build_select(&self.table, filters, ordering, page)?;
        let count = build_count(&self.table, filters)?;
        let (items, total) = tokio::try_join!(
            self.executor.execute(&select),
            self.executor.fetch_count(&count)
        )?;
        Ok(Listing {
            items,
            total,
            page: page.page(),
            size: page.size(),
        })
    }

    /// Insert one row and return it with server-computed defaults filled in.
    pub async fn create(&self, payload: &Map<String, Value>) -> Result<Row, AppError> {
        let q = build_insert(&self.table, payload)?;
        let row = self.executor.fetch_optional(&q).await?;
        row.ok_or_else(|| AppError::Db(sqlx::Error::RowNotFound))
    }

    /// Insert several rows atomically: all are persisted or none.
    pub async fn create_many(&self, payloads: &[Map<String, Value>]) -> Result<Vec<Row>, AppError> {
        if payloads.len() > BULK_LIMIT {
            return Err(AppError::InvalidQuery(format!(
                "bulk create limited to {} items",
                BULK_LIMIT
            )));
        }
        let statements = payloads
            .iter()
            .map(|p| build_insert(&self.table, p))
            .collect::<Result<Vec<_>, _>>()?;
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        let results = self.executor.execute_in_transaction(&statements).await?;
        Ok(results.into_iter().flatten().collect())
    }

    pub async fn update(&self, id: &Value, payload: &Map<String, Value>) -> Result<Row, AppError> {
        let q = build_update(&self.table, id, payload)?;
        let row = self.executor.fetch_optional(&q).await?;
        row.ok_or_else(|| self.not_found(id))
    }

    /// Delete by id and return the removed row.
    pub async fn delete(&self, id: &Value) -> Result<Row, AppError> {
        let q = build_delete(&self.table, id)?;
        let row = self.executor.fetch_optional(&q).await?;
        row.ok_or_else(|| self.not_found(id))
    }

    fn not_found(&self, id: &Value) -> AppError {
        AppError::NotFound {
            table: self.table.name.clone(),
            id: match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// Hands out endpoints for any table in the current schema description.
#[derive(Clone)]
pub struct EndpointFactory {
    schema: Arc<SchemaCache>,
    executor: QueryExecutor,
}

impl EndpointFactory {
    pub fn new(schema: Arc<SchemaCache>, executor: QueryExecutor) -> Self {
        EndpointFactory { schema, executor }
    }

    pub fn schema(&self) -> &Arc<SchemaCache> {
        &self.schema
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Endpoint for `table`; `UnknownTable` if the schema has no such table.
    pub async fn endpoint(&self, table: &str) -> Result<CrudEndpoint, AppError> {
        let descriptor = self.schema.describe(self.executor.pool(), table).await?;
        Ok(CrudEndpoint::new(descriptor, self.executor.clone()))
    }
}
