//! Connection pool construction. The pool is the only long-lived shared resource.

use crate::error::AppError;
use crate::settings::Settings;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Build a pool bounded by the configured size. Acquisition waits at most
/// `acquire_timeout`, after which callers see `AppError::PoolExhausted`.
pub async fn connect_pool(settings: &Settings) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .min_connections(settings.pool_min_size)
        .max_connections(settings.pool_max_size)
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(settings.connect_options.clone())
        .await
        .map_err(|e| AppError::from_db(e, "?"))?;
    tracing::info!(
        schema = %settings.schema,
        max_connections = settings.pool_max_size,
        "database pool ready"
    );
    Ok(pool)
}
