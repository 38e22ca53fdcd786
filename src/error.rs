use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    payments::{GatewayError, SignatureError},
    response::{ApiResponse, Meta},
    services::pricing::PricingError,
    store::StoreError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not Found")]
    NotFound,

    #[error("Bad Request {0}")]
    BadRequest(String),

    #[error("Unauthorized {0}")]
    Unauthorized(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Conflict {0}")]
    Conflict(String),

    #[error("Invalid product {0}")]
    InvalidProduct(Uuid),

    #[error("Failed to persist order")]
    OrderPersistence(#[source] StoreError),

    #[error("Payment provider unavailable, retry with the same Idempotency-Key")]
    PaymentGateway {
        order_id: Uuid,
        #[source]
        source: GatewayError,
    },

    #[error("Webhook error: {0}")]
    WebhookAuthenticity(#[from] SignatureError),

    #[error("Database error")]
    Store(#[from] StoreError),

    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl From<PricingError> for AppError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::UnknownProduct(id) => AppError::InvalidProduct(id),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorData {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<Uuid>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InvalidProduct(_) => StatusCode::BAD_REQUEST,
            AppError::WebhookAuthenticity(_) => StatusCode::BAD_REQUEST,
            AppError::PaymentGateway { .. } => StatusCode::BAD_GATEWAY,
            AppError::OrderPersistence(_) | AppError::Store(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }

        let order_id = match &self {
            AppError::PaymentGateway { order_id, .. } => Some(*order_id),
            _ => None,
        };

        let body = ApiResponse {
            message: self.to_string(),
            data: Some(ErrorData {
                error: self.to_string(),
                order_id,
            }),
            meta: Meta::default(),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
