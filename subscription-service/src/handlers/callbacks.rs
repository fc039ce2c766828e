//! Gateway redirects and webhooks.
//!
//! Both end in `handle_callback`. Callers are acknowledged with 200 even when
//! the gateway order is unknown to us, so the gateway stops retrying. A
//! failed gateway lookup answers 502 and the callback is redelivered.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Form, Json,
};
use service_core::error::AppError;
use std::collections::HashMap;

use crate::dtos::CallbackResponse;
use crate::error::PaymentError;
use crate::gateway::{CallbackPayload, GatewayError};
use crate::AppState;

fn rejected(err: GatewayError) -> AppError {
    match err {
        GatewayError::InvalidSignature => {
            AppError::Unauthorized(anyhow::anyhow!("Invalid callback signature"))
        }
        other => AppError::BadRequest(anyhow::anyhow!("Invalid callback: {}", other)),
    }
}

async fn reconcile(
    state: &AppState,
    payload: CallbackPayload,
) -> Result<Json<CallbackResponse>, AppError> {
    match state.reconciler.handle_callback(payload).await {
        Ok(outcome) => Ok(Json(CallbackResponse::from(&outcome))),
        Err(PaymentError::UnknownTransaction { gateway_order_id }) => {
            Ok(Json(CallbackResponse::unknown(gateway_order_id)))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn payment_response_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<CallbackResponse>, AppError> {
    let payload = state.gateway.parse_redirect(&params).map_err(rejected)?;
    reconcile(&state, payload).await
}

pub async fn payment_response_post(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> Result<Json<CallbackResponse>, AppError> {
    let payload = state.gateway.parse_redirect(&params).map_err(rejected)?;
    reconcile(&state, payload).await
}

pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, AppError> {
    match state.gateway.parse_webhook(&headers, &body).map_err(rejected)? {
        Some(payload) => reconcile(&state, payload).await,
        None => Ok(Json(CallbackResponse::ignored())),
    }
}
