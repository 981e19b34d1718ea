//! Liveness, readiness and build info.

use crate::error::AppError;
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    database: &'static str,
    schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema_version: Option<i64>,
}

#[derive(Serialize)]
struct VersionBody {
    name: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

/// 200 once the database answers and the ledger can be read; 503 otherwise.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyBody>) {
    let introspector = state.schema.introspector();
    let check = async {
        let mut conn = state.pool.acquire().await?;
        Ok::<i64, AppError>(introspector.ledger_version(&mut conn).await?)
    };
    match check.await {
        Ok(version) => (
            StatusCode::OK,
            Json(ReadyBody {
                status: "ok",
                database: "ok",
                schema: introspector.schema().to_string(),
                schema_version: Some(version),
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyBody {
                    status: "degraded",
                    database: "unavailable",
                    schema: introspector.schema().to_string(),
                    schema_version: None,
                }),
            )
        }
    }
}

async fn version() -> Json<VersionBody> {
    Json(VersionBody {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn stateless<S: Clone + Send + Sync + 'static>() -> Router<S> {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
}

/// GET /health and GET /version; no database needed.
pub fn common_routes() -> Router {
    stateless()
}

/// `common_routes` plus GET /ready, which checks the database and reports the schema version.
pub fn common_routes_with_ready(state: AppState) -> Router {
    stateless().route("/ready", get(ready)).with_state(state)
}
