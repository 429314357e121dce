use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::{ConfirmationError, OrderError, RefundError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payment required: {0}")]
    PaymentRequired(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ConfirmationError> for AppError {
    fn from(err: ConfirmationError) -> Self {
        match err {
            ConfirmationError::Validation(_) | ConfirmationError::AmountMismatch { .. } => {
                AppError::BadRequest(err.to_string())
            }
            ConfirmationError::NotFound => AppError::NotFound,
            ConfirmationError::PaymentDeclined { .. } => AppError::PaymentRequired(err.to_string()),
            ConfirmationError::GatewayUnavailable(_) => AppError::BadGateway(err.to_string()),
            ConfirmationError::Configuration(_) => AppError::ServiceUnavailable(err.to_string()),
            ConfirmationError::OrderClosed(_) => AppError::Conflict(err.to_string()),
            ConfirmationError::Internal(inner) => AppError::Internal(inner),
        }
    }
}

impl From<RefundError> for AppError {
    fn from(err: RefundError) -> Self {
        match err {
            RefundError::Validation(_)
            | RefundError::NotRefundable(_)
            | RefundError::Declined { .. } => AppError::BadRequest(err.to_string()),
            RefundError::NotFound => AppError::NotFound,
            RefundError::GatewayUnavailable(_) => AppError::BadGateway(err.to_string()),
            RefundError::Configuration(_) => AppError::ServiceUnavailable(err.to_string()),
            RefundError::Internal(inner) => AppError::Internal(inner),
        }
    }
}

impl From<OrderError> for AppError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Validation(_) | OrderError::Unavailable(_) => {
                AppError::BadRequest(err.to_string())
            }
            OrderError::NotFound => AppError::NotFound,
            OrderError::Internal(inner) => AppError::Internal(inner),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Db(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::warn!(?self);
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
