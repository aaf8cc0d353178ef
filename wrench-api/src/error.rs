use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use wrench_booking::TransitionError;
use wrench_core::{CoreError, StoreError};
use wrench_referral::ReferralError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    NotFoundError(String),
    /// Retryable; the payment gateway redelivers on any non-2xx
    #[error("{0}")]
    ConflictError(String),
    #[error("{0}")]
    UnavailableError(String),
    #[error("{0}")]
    InternalServerError(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::UnavailableError(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "success": false,
            "message": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ValidationError(msg) => AppError::ValidationError(msg),
            CoreError::NotFound(msg) => AppError::NotFoundError(msg),
            CoreError::Conflict(msg) | CoreError::Duplicate(msg) => AppError::ConflictError(msg),
            CoreError::TransientStorage(msg) | CoreError::GatewayError(msg) => AppError::UnavailableError(msg),
            CoreError::LedgerInvariantViolation(msg) => AppError::ConflictError(msg),
            CoreError::InternalError(msg) => AppError::InternalServerError(msg),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<ReferralError> for AppError {
    fn from(err: ReferralError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        CoreError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors_are_not_2xx() {
        let conflict = AppError::from(CoreError::Conflict("retry shortly".into())).into_response();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let storage = AppError::from(CoreError::TransientStorage("db down".into())).into_response();
        assert_eq!(storage.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let response = AppError::from(CoreError::InternalError("password=hunter2".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
