use axum::{extract::State, Json};
use service_core::error::AppError;

use crate::dtos::{OrderResponse, SubscriptionResponse, TransactionResponse};
use crate::middleware::UserContext;
use crate::AppState;

pub async fn current_subscription(
    State(state): State<AppState>,
    user: UserContext,
) -> Result<Json<SubscriptionResponse>, AppError> {
    let current = state.ledger.current_subscription(user.user_id).await?;
    Ok(Json(SubscriptionResponse {
        active: current.is_some(),
        subscription: current.as_ref().map(OrderResponse::from),
    }))
}

pub async fn transaction_history(
    State(state): State<AppState>,
    user: UserContext,
) -> Result<Json<Vec<TransactionResponse>>, AppError> {
    let transactions = state.ledger.transaction_history(user.user_id).await?;
    Ok(Json(transactions.iter().map(TransactionResponse::from).collect()))
}
