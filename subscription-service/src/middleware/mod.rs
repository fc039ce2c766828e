//! Caller identity extracted from request headers.
//!
//! `X-User-ID` is set by the authenticating proxy in front of this service.
//! Admin routes additionally require `X-Admin-Token`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::AppState;

pub const USER_ID_HEADER: &str = "X-User-ID";
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

#[derive(Debug, Clone, Copy)]
pub struct UserContext {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header")))?;

        let user_id = Uuid::parse_str(raw.trim())
            .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid X-User-ID header")))?;

        tracing::Span::current().record("user_id", raw);

        Ok(UserContext { user_id })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdminContext;

#[async_trait]
impl FromRequestParts<AppState> for AdminContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing admin token")))?;

        let expected = state.config.admin.token.expose_secret();
        let matches: bool = provided.as_bytes().ct_eq(expected.as_bytes()).into();
        if expected.is_empty() || !matches {
            tracing::warn!("Rejected admin request with invalid token");
            return Err(AppError::Forbidden(anyhow::anyhow!("Invalid admin token")));
        }

        Ok(AdminContext)
    }
}
