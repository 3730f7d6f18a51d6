use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use troupe_core::error::TroupeError;

/// The single place exceptions become status codes. Internal failures
/// are logged with detail and leave the boundary as an opaque 500.
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<TroupeError> for ApiError {
    fn from(err: TroupeError) -> Self {
        match err {
            TroupeError::TopologyInvalid(report) => Self {
                status: StatusCode::BAD_REQUEST,
                body: serde_json::json!({
                    "error_code": "VALIDATION_FAILED",
                    "errors": report.errors,
                }),
            },
            TroupeError::InvalidInput(message) => Self {
                status: StatusCode::BAD_REQUEST,
                body: serde_json::json!({
                    "error_code": "INVALID_INPUT",
                    "message": message,
                }),
            },
            TroupeError::NotFound { resource, id } => Self {
                status: StatusCode::NOT_FOUND,
                body: serde_json::json!({
                    "error_code": "NOT_FOUND",
                    "message": format!("{resource} not found: {id}"),
                }),
            },
            TroupeError::Conflict(message) => Self {
                status: StatusCode::CONFLICT,
                body: serde_json::json!({
                    "error_code": "CONFLICT",
                    "message": message,
                }),
            },
            TroupeError::ExecutionNotRunning(id) => Self {
                status: StatusCode::CONFLICT,
                body: serde_json::json!({
                    "error_code": "EXECUTION_NOT_RUNNING",
                    "message": format!("execution {id} is not running"),
                }),
            },
            TroupeError::ConcurrencyLimitExceeded { limit } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                body: serde_json::json!({
                    "error_code": "CONCURRENCY_LIMIT",
                    "message": format!("concurrency limit of {limit} executions reached"),
                }),
            },
            other => {
                error!(error = %other, "internal error at API boundary");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: serde_json::json!({
                        "error_code": "INTERNAL",
                        "message": "internal server error",
                    }),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::topology::ValidationReport;

    #[test]
    fn status_mapping() {
        let cases: Vec<(TroupeError, StatusCode)> = vec![
            (
                TroupeError::TopologyInvalid(ValidationReport::default()),
                StatusCode::BAD_REQUEST,
            ),
            (
                TroupeError::InvalidInput("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                TroupeError::NotFound {
                    resource: "team",
                    id: "t1".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                TroupeError::Conflict("clash".into()),
                StatusCode::CONFLICT,
            ),
            (
                TroupeError::ExecutionNotRunning("e1".into()),
                StatusCode::CONFLICT,
            ),
            (
                TroupeError::ConcurrencyLimitExceeded { limit: 2 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                TroupeError::Database("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn internal_errors_are_opaque() {
        let api: ApiError = TroupeError::Database("secret table detail".into()).into();
        assert!(!api.body.to_string().contains("secret table detail"));
    }

    #[test]
    fn concurrency_error_code_matches_contract() {
        let api: ApiError = TroupeError::ConcurrencyLimitExceeded { limit: 100 }.into();
        assert_eq!(api.body["error_code"], "CONCURRENCY_LIMIT");
    }
}
