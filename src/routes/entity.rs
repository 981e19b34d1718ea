//! Table CRUD routes. Handlers resolve the table from the first path segment against the
//! live schema, so tables added by a migration are served without a restart.

use crate::handlers::entity::{create, delete as delete_handler, list, read, update};
use crate::state::AppState;
use axum::{routing::get, Router};

pub fn entity_routes(state: AppState) -> Router {
    Router::new()
        .route("/:table", get(list).post(create))
        .route(
            "/:table/:id",
            get(read).patch(update).put(update).delete(delete_handler),
        )
        .with_state(state)
}
