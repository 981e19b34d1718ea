//! Typed errors, database error translation, and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which kind of integrity constraint the database rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::NotNull => "not null",
            ConstraintKind::Check => "check",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("unknown field '{field}' for table '{table}'")]
    InvalidField { table: String, field: String },
    #[error("value for '{table}.{column}' is not a valid {expected}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
    },
    #[error("{table} '{id}' not found")]
    NotFound { table: String, id: String },
    #[error("{kind} constraint violated on '{table}'{}", constraint_suffix(.constraint))]
    ConstraintViolation {
        table: String,
        constraint: Option<String>,
        kind: ConstraintKind,
    },
    #[error("migration {version} was modified after being applied (recorded {stored}, on disk {current})")]
    MigrationDrift {
        version: i64,
        stored: String,
        current: String,
    },
    #[error("another process is applying migrations")]
    MigrationLocked,
    #[error("migration {version} failed: {message}")]
    MigrationFailed { version: i64, message: String },
    #[error("migration: {0}")]
    Migration(String),
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("connection: {0}")]
    Connection(String),
    #[error("database: {0}")]
    Db(sqlx::Error),
}

impl AppError {
    /// Translate a driver error raised while operating on `table`.
    pub fn from_db(err: sqlx::Error, table: &str) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => AppError::PoolExhausted,
            sqlx::Error::PoolClosed => AppError::Connection("pool closed".into()),
            sqlx::Error::Io(e) => AppError::Connection(e.to_string()),
            sqlx::Error::Tls(e) => AppError::Connection(e.to_string()),
            sqlx::Error::Database(db) => {
                let table = db.table().unwrap_or(table).to_string();
                match db.code().as_deref().and_then(classify_sqlstate) {
                    Some(DbFailure::Constraint(kind)) => AppError::ConstraintViolation {
                        table,
                        constraint: db.constraint().map(str::to_string),
                        kind,
                    },
                    Some(DbFailure::TypeMismatch) => AppError::TypeMismatch {
                        table,
                        column: db
                            .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                            .and_then(|e| e.column())
                            .unwrap_or("?")
                            .to_string(),
                        expected: "value for the column's type".into(),
                    },
                    None => AppError::Db(sqlx::Error::Database(db)),
                }
            }
            other => AppError::Db(other),
        }
    }

    /// Only transport failures may be retried; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Connection(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::from_db(err, "?")
    }
}

fn constraint_suffix(constraint: &Option<String>) -> String {
    constraint
        .as_deref()
        .map(|c| format!(" ({c})"))
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DbFailure {
    Constraint(ConstraintKind),
    TypeMismatch,
}

/// Map a PostgreSQL SQLSTATE to the failures the core distinguishes.
pub(crate) fn classify_sqlstate(code: &str) -> Option<DbFailure> {
    Some(match code {
        "23505" => DbFailure::Constraint(ConstraintKind::Unique),
        "23503" => DbFailure::Constraint(ConstraintKind::ForeignKey),
        "23502" => DbFailure::Constraint(ConstraintKind::NotNull),
        "23514" => DbFailure::Constraint(ConstraintKind::Check),
        "42804" => DbFailure::TypeMismatch,
        // Class 22: data exceptions (bad literal, too long, out of range, division by zero, ...).
        _ if code.starts_with("22") => DbFailure::TypeMismatch,
        _ => return None,
    })
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::UnknownTable(_) | AppError::UnknownColumn { .. } => {
                (StatusCode::NOT_FOUND, "schema_error")
            }
            AppError::InvalidQuery(_) => (StatusCode::BAD_REQUEST, "invalid_query"),
            AppError::InvalidField { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_field"),
            AppError::TypeMismatch { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "type_mismatch"),
            AppError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            AppError::ConstraintViolation { .. } => (StatusCode::CONFLICT, "constraint_violation"),
            AppError::MigrationDrift { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "migration_drift"),
            AppError::MigrationLocked => (StatusCode::CONFLICT, "migration_locked"),
            AppError::MigrationFailed { .. } | AppError::Migration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "migration_error")
            }
            AppError::PoolExhausted => (StatusCode::SERVICE_UNAVAILABLE, "pool_exhausted"),
            AppError::Connection(_) => (StatusCode::SERVICE_UNAVAILABLE, "connection_error"),
            AppError::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        };
        let details = match &self {
            AppError::ConstraintViolation {
                table,
                constraint,
                kind,
            } => Some(serde_json::json!({ "table": table, "constraint": constraint, "kind": kind })),
            AppError::UnknownColumn { table, column } | AppError::TypeMismatch { table, column, .. } => {
                Some(serde_json::json!({ "table": table, "column": column }))
            }
            AppError::InvalidField { table, field } => {
                Some(serde_json::json!({ "table": table, "field": field }))
            }
            _ => None,
        };
        let message = match &self {
            AppError::Db(e) => {
                tracing::error!(error = %e, "unclassified database error");
                "internal database error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_constraint_classes() {
        assert_eq!(
            classify_sqlstate("23505"),
            Some(DbFailure::Constraint(ConstraintKind::Unique))
        );
        assert_eq!(
            classify_sqlstate("23503"),
            Some(DbFailure::Constraint(ConstraintKind::ForeignKey))
        );
        for code in ["22P02", "22001", "22003", "22012", "22023", "42804"] {
            assert_eq!(classify_sqlstate(code), Some(DbFailure::TypeMismatch), "{code}");
        }
        assert_eq!(classify_sqlstate("42P01"), None);
        assert_eq!(classify_sqlstate("40001"), None);
    }

    #[test]
    fn pool_timeout_is_exhaustion_and_not_retryable() {
        let err = AppError::from_db(sqlx::Error::PoolTimedOut, "users");
        assert!(matches!(err, AppError::PoolExhausted));
        assert!(!err.is_retryable());
    }

    #[test]
    fn io_failure_is_retryable_connection_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = AppError::from_db(sqlx::Error::Io(io), "users");
        assert!(matches!(err, AppError::Connection(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn constraint_message_names_table_and_constraint() {
        let err = AppError::ConstraintViolation {
            table: "sessions".into(),
            constraint: Some("sessions_user_id_fkey".into()),
            kind: ConstraintKind::ForeignKey,
        };
        assert_eq!(
            err.to_string(),
            "foreign key constraint violated on 'sessions' (sessions_user_id_fkey)"
        );
    }

    #[test]
    fn not_found_maps_to_404() {
        let resp = AppError::NotFound {
            table: "users".into(),
            id: "u1".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
