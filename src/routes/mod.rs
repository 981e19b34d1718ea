//! Router assembly.

mod common;
mod entity;

pub use common::{common_routes, common_routes_with_ready};
pub use entity::entity_routes;

use crate::state::AppState;
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Health, readiness, version and CRUD routes with a body size cap.
pub fn app(state: AppState) -> Router {
    common_routes_with_ready(state.clone())
        .merge(entity_routes(state))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}
