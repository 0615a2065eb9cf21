use axum::http::StatusCode;

/// ApiError is the fundamental error type returned by the API. The boundary
/// maps each kind onto an HTTP status code and a uniform `{error, message}`
/// JSON envelope; the core never sees HTTP concerns.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Invalid API token")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("Consistent hashing is not active")]
    StrategyMismatch,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<storage::Error> for ApiError {
    fn from(error: storage::Error) -> Self {
        Self::Internal(error.into())
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, error) = match &self {
            Self::InvalidInput(_) => (StatusCode::BAD_REQUEST, "Invalid input"),
            Self::Unauthorized => (StatusCode::FORBIDDEN, "Unauthorized"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "Measurement not found"),
            Self::StrategyMismatch => (StatusCode::BAD_REQUEST, "Strategy error"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let message = match &self {
            Self::Internal(source) => {
                tracing::error!(error = ?source, "API responding with internal error");
                format!("{source:#}")
            }
            other => other.to_string(),
        };

        (
            status,
            axum::Json(serde_json::json!({ "error": error, "message": message })),
        )
            .into_response()
    }
}
