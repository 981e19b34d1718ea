//! Runs built statements on pooled connections and decodes rows into JSON maps.

use crate::error::AppError;
use crate::sql::QueryBuf;
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, PgConnection, PgPool, Postgres, Row as _, TypeInfo};
use std::time::Duration;

/// One result row, keyed by column name in select order.
pub type Row = Map<String, Value>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct QueryExecutor {
    pool: PgPool,
    retries: u32,
}

impl QueryExecutor {
    /// `retries` bounds how often a failed connection acquisition is retried.
    pub fn new(pool: PgPool, retries: u32) -> Self {
        QueryExecutor { pool, retries }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one statement and return every row it produced.
    pub async fn execute(&self, q: &QueryBuf) -> Result<Vec<Row>, AppError> {
        let mut conn = self.acquire().await?;
        run(&mut conn, q).await
    }

    pub async fn fetch_optional(&self, q: &QueryBuf) -> Result<Option<Row>, AppError> {
        let mut conn = self.acquire().await?;
        tracing::debug!(table = %q.table, sql = %q.sql, args = q.params.len(), "query");
        let row = bound(q)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| AppError::from_db(e, &q.table))?;
        row.as_ref().map(decode_row).transpose()
    }

    /// Run a `SELECT COUNT(*)` statement.
    pub async fn fetch_count(&self, q: &QueryBuf) -> Result<i64, AppError> {
        let mut conn = self.acquire().await?;
        tracing::debug!(table = %q.table, sql = %q.sql, args = q.params.len(), "count");
        let row = bound(q)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| AppError::from_db(e, &q.table))?;
        row.try_get::<i64, _>(0).map_err(AppError::from)
    }

    /// Run `statements` in order inside one transaction. Any failure rolls the whole
    /// transaction back before the error is returned.
    pub async fn execute_in_transaction(&self, statements: &[QueryBuf]) -> Result<Vec<Vec<Row>>, AppError> {
        let mut conn = self.acquire().await?;
        let mut tx = conn.begin().await?;
        let mut results = Vec::with_capacity(statements.len());
        for q in statements {
            match run(&mut tx, q).await {
                Ok(rows) => results.push(rows),
                Err(err) => {
                    if let Err(e) = tx.rollback().await {
                        tracing::warn!(error = %e, "rollback failed");
                    }
                    return Err(err);
                }
            }
        }
        tx.commit().await?;
        Ok(results)
    }

    /// Acquire a connection, retrying transport failures with doubling backoff.
    /// The connection returns to the pool when dropped, including on cancellation.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, AppError> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match self.pool.acquire().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    let err = AppError::from(e);
                    if !err.is_retryable() || attempt >= self.retries {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        retries = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "acquire failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

fn bound(q: &QueryBuf) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(p.clone());
    }
    query
}

async fn run(conn: &mut PgConnection, q: &QueryBuf) -> Result<Vec<Row>, AppError> {
    tracing::debug!(table = %q.table, sql = %q.sql, args = q.params.len(), "query");
    let rows = bound(q)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| AppError::from_db(e, &q.table))?;
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &PgRow) -> Result<Row, AppError> {
    let mut map = Map::with_capacity(row.columns().len());
    for col in row.columns() {
        let value = decode_cell(row, col.ordinal(), col.type_info().name())?;
        map.insert(col.name().to_string(), value);
    }
    Ok(map)
}

/// Decode by the driver's type name. Types the builder does not select natively arrive as text.
fn decode_cell(row: &PgRow, i: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

    let value = match type_name {
        "INT2" => row.try_get::<Option<i16>, _>(i)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(i)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(i)?.map(Value::from),
        "FLOAT4" => row.try_get::<Option<f32>, _>(i)?.map(float4_value),
        "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.map(Value::from),
        "BOOL" => row.try_get::<Option<bool>, _>(i)?.map(Value::Bool),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(i)?
            .map(|u| Value::String(u.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i)?,
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(i)?
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(i)?
            .map(|t| Value::String(t.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(i)?
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        _ => row.try_get::<Option<String>, _>(i)?.map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Widen through the shortest decimal form so a stored `0.1` reads back as `0.1`.
fn float4_value(f: f32) -> Value {
    f.to_string().parse::<f64>().map(Value::from).unwrap_or(Value::Null)
}
