//! pgcrud: schema-driven CRUD over PostgreSQL with versioned migrations.
//!
//! Tables are described from the live catalog, every statement is built with bound
//! parameters only, and a thin axum adapter exposes one generic endpoint per table.

pub mod error;
pub mod handlers;
pub mod migration;
pub mod pool;
pub mod response;
pub mod routes;
pub mod schema;
pub mod service;
pub mod settings;
pub mod sql;
pub mod state;
pub mod telemetry;

pub use error::{AppError, ConfigError, ConstraintKind};
pub use migration::{ApplyReport, MigrationStatus, Migrator};
pub use pool::connect_pool;
pub use response::{success_created, success_one, success_page};
pub use routes::{app, common_routes, common_routes_with_ready, entity_routes};
pub use schema::{Introspector, LogicalType, SchemaCache, TableDescriptor};
pub use service::{CrudEndpoint, EndpointFactory, Listing, QueryExecutor, Row};
pub use settings::Settings;
pub use sql::{FilterExpression, OrderBy, Page, Predicate, SortDirection};
pub use state::AppState;
pub use telemetry::init_tracing;
