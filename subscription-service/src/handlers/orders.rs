use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;

use crate::dtos::CreateOrderResponse;
use crate::middleware::UserContext;
use crate::services::CreateOrderRequest;
use crate::AppState;

/// Record a purchase intent and hand back where to pay for it.
pub async fn create_order(
    State(state): State<AppState>,
    user: UserContext,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), AppError> {
    let created = state.ledger.create_order(user.user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(CreateOrderResponse::from(&created))))
}
