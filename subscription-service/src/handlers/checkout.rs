use axum::{
    extract::{Path, State},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use service_core::error::AppError;

use crate::middleware::UserContext;
use crate::AppState;

/// Hosted-page gateways get a redirect; everything else gets the payload
/// the client-side checkout needs.
pub async fn initiate_checkout(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    user: Option<UserContext>,
) -> Result<Response, AppError> {
    let handle = state
        .checkout
        .initiate_checkout(&reference, user.map(|u| u.user_id))
        .await?;

    match &handle.redirect_url {
        Some(url) => Ok(Redirect::to(url).into_response()),
        None => Ok(Json(handle).into_response()),
    }
}
