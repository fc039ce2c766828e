//! Errors raised at the checkout and reconciliation boundary.

use service_core::error::AppError;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::models::ReferenceError;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("order does not belong to the requesting user")]
    OrderNotOwned,

    #[error("order has already been paid")]
    OrderAlreadyCompleted,

    #[error("user already has an active subscription")]
    AlreadySubscribed,

    #[error("a payment for this order is already in progress")]
    DuplicateCheckout { retry_after_secs: u64 },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("no transaction for gateway order {gateway_order_id}")]
    UnknownTransaction { gateway_order_id: String },

    #[error("validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<ReferenceError> for PaymentError {
    fn from(err: ReferenceError) -> Self {
        PaymentError::InvalidOrder(err.to_string())
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidOrder(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            PaymentError::OrderNotOwned => AppError::Forbidden(anyhow::anyhow!(
                "Order does not belong to the requesting user"
            )),
            PaymentError::OrderAlreadyCompleted => {
                AppError::Conflict(anyhow::anyhow!("Order has already been paid"))
            }
            PaymentError::AlreadySubscribed => {
                AppError::Conflict(anyhow::anyhow!("User already has an active subscription"))
            }
            PaymentError::DuplicateCheckout { retry_after_secs } => AppError::TooManyRequests(
                "Payment already initiated for this order".to_string(),
                Some(retry_after_secs),
            ),
            PaymentError::Gateway(err) => {
                tracing::error!(error = %err, "Payment gateway error");
                AppError::BadGateway("Payment gateway unavailable, please retry".to_string())
            }
            PaymentError::UnknownTransaction { gateway_order_id } => AppError::NotFound(
                anyhow::anyhow!("No transaction for gateway order {}", gateway_order_id),
            ),
            PaymentError::Validation(err) => AppError::ValidationError(err),
            PaymentError::Store(err) => AppError::DatabaseError(err),
        }
    }
}
