//! Shared application state for all routes.

use crate::schema::{Introspector, SchemaCache};
use crate::service::{EndpointFactory, QueryExecutor};
use crate::settings::Settings;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Rebuilt on its own whenever the migration ledger version moves.
    pub schema: Arc<SchemaCache>,
    pub endpoints: EndpointFactory,
}

impl AppState {
    pub fn new(pool: PgPool, settings: &Settings) -> Self {
        let schema = Arc::new(SchemaCache::new(Introspector::new(&settings.schema)));
        let executor = QueryExecutor::new(pool.clone(), settings.connect_retries);
        AppState {
            endpoints: EndpointFactory::new(Arc::clone(&schema), executor),
            schema,
            pool,
        }
    }
}
