use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::{OrderResponse, ReconcileResponse};
use crate::middleware::AdminContext;
use crate::services::GrantRequest;
use crate::AppState;

pub async fn reconcile_stale(
    State(state): State<AppState>,
    _admin: AdminContext,
) -> Result<Json<ReconcileResponse>, AppError> {
    let changed = state
        .reconciler
        .reconcile_stale(state.config.reconciliation.stale_after())
        .await?;
    Ok(Json(ReconcileResponse { changed }))
}

pub async fn grant_subscription(
    State(state): State<AppState>,
    _admin: AdminContext,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<GrantRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), AppError> {
    let order = state.ledger.grant(user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(OrderResponse::from(&order))))
}

pub async fn deactivate_subscription(
    State(state): State<AppState>,
    _admin: AdminContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state.ledger.deactivate(user_id).await?;
    Ok(Json(OrderResponse::from(&order)))
}
