use actix_web::{error::ResponseError, http::header, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Seconds a client should wait after a 503
const RETRY_AFTER_SECS: &str = "5";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] loyalty_core::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unprocessable request: {0}")]
    Unprocessable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let error_message = self.to_string();

        if status_code.is_server_error() && status_code != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %error_message, "Request failed");
        }

        let mut response = HttpResponse::build(status_code);
        if status_code == StatusCode::SERVICE_UNAVAILABLE {
            response.insert_header((header::RETRY_AFTER, RETRY_AFTER_SECS));
        }

        response.json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        use loyalty_core::Error as Core;

        match self {
            ApiError::Core(err) => match err {
                Core::InvalidOrderFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
                Core::OrderConflict(_) => StatusCode::CONFLICT,
                Core::OrderNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
                Core::InvalidAmount(_) => StatusCode::UNPROCESSABLE_ENTITY,
                Core::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                Core::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
                Core::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
                Core::RetryBudgetExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                Core::FatalConfiguration(_) => StatusCode::INTERNAL_SERVER_ERROR,
                Core::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                Core::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
                Core::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError {
    fn error_type(&self) -> &str {
        use loyalty_core::Error as Core;

        match self {
            ApiError::Core(err) => match err {
                Core::InvalidOrderFormat(_) => "invalid_order_format",
                Core::OrderConflict(_) => "order_conflict",
                Core::OrderNotFound(_) => "order_not_found",
                Core::InvalidAmount(_) => "invalid_amount",
                Core::InsufficientFunds { .. } => "insufficient_funds",
                Core::QueueFull(_) => "queue_full",
                Core::QueueClosed => "service_unavailable",
                Core::RetryBudgetExhausted { .. } => "service_unavailable",
                Core::FatalConfiguration(_) => "configuration_error",
                Core::Storage(_) => "database_error",
                Core::Config(_) => "configuration_error",
                Core::Internal(_) => "internal_error",
            },
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::BadRequest(_) => "validation_error",
            ApiError::Unprocessable(_) => "validation_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}
