use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ApiError::Authorization(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }
}

/// Map a SQLite unique-constraint violation onto a domain conflict,
/// leaving every other database error untouched.
pub fn conflict_on_unique(err: rusqlite::Error, msg: &str) -> ApiError {
    if matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    ) {
        ApiError::Conflict(msg.into())
    } else {
        err.into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Authorization(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Database(_) | ApiError::Pool(_) | ApiError::Internal(_) => {
                tracing::error!("internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_becomes_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT UNIQUE); INSERT INTO t VALUES ('x');")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES ('x')", [])
            .unwrap_err();
        match conflict_on_unique(err, "duplicate") {
            ApiError::Conflict(msg) => assert_eq!(msg, "duplicate"),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn other_errors_pass_through() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn.execute("INSERT INTO missing VALUES (1)", []).unwrap_err();
        assert!(matches!(
            conflict_on_unique(err, "duplicate"),
            ApiError::Database(_)
        ));
    }
}
