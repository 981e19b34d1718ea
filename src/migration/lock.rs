//! Session-level advisory lock serializing migration runs per schema.

use crate::error::AppError;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};

/// Holds `pg_try_advisory_lock` on a dedicated connection. The connection is closed
/// rather than pooled, so the lock never outlives this value.
pub struct MigrationLock {
    conn: PoolConnection<Postgres>,
    key: String,
}

impl MigrationLock {
    /// Take the lock or fail immediately with `MigrationLocked`.
    pub async fn try_acquire(pool: &PgPool, key: &str) -> Result<Self, AppError> {
        let mut conn = pool.acquire().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !locked {
            tracing::warn!(key, "migration lock held elsewhere");
            return Err(AppError::MigrationLocked);
        }
        conn.close_on_drop();
        tracing::debug!(key, "migration lock acquired");
        Ok(MigrationLock {
            conn,
            key: key.to_string(),
        })
    }

    /// The locked session; all migration statements run on it.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub async fn release(mut self) -> Result<(), AppError> {
        let (released,): (bool,) = sqlx::query_as("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.key)
            .fetch_one(&mut *self.conn)
            .await?;
        if !released {
            tracing::warn!(key = %self.key, "migration lock was not held at release");
        }
        Ok(())
    }
}
