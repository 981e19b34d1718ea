//! CRUD endpoints over described tables, and the executor that runs their statements.

mod crud;
mod executor;
pub use crud::{CrudEndpoint, EndpointFactory, Listing, BULK_LIMIT};
pub use executor::{QueryExecutor, Row};
