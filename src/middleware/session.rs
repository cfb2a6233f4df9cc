//! Bind-session middleware.
//!
//! Every end-user route passes through here before its handler runs. The
//! request identifies itself with:
//!
//! ```text
//! X-Account-Id: 550e8400-e29b-41d4-a716-446655440000
//! X-Device-Id: 3f2a9c-android
//! Authorization: Bearer <identity provider token>
//! ```
//!
//! The token has already been verified upstream by the identity provider;
//! this layer only decides whether the presenting device is the account's
//! authoritative one. Only requests to [`LOGIN_PATH`] may take an account
//! over from another device.

use crate::{
    app::AppState,
    error::AppError,
    middleware::auth::bearer_token,
    models::session::SessionContext,
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const ACCOUNT_HEADER: &str = "X-Account-Id";
pub const DEVICE_HEADER: &str = "X-Device-Id";

/// The one route that binds with the login flag set.
pub const LOGIN_PATH: &str = "/api/v1/sessions/login";

fn header_value<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Session binding middleware function.
///
/// # Returns
///
/// - `Ok(Response)` with a [`SessionContext`] extension for the handler
/// - `Err(AppError::Unauthenticated)` for missing or malformed headers
/// - `Err(AppError::SessionSuperseded)` (401, `Location: /login/expired`)
///   when another device holds the account
pub async fn bind_session_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let account_id: Uuid = header_value(&request, ACCOUNT_HEADER)
        .and_then(|v| v.parse().ok())
        .ok_or(AppError::Unauthenticated)?;
    let device_id = header_value(&request, DEVICE_HEADER)
        .ok_or(AppError::Unauthenticated)?
        .to_string();
    let token = bearer_token(&request).ok_or(AppError::Unauthenticated)?;
    let is_login_flow = request.uri().path() == LOGIN_PATH;

    let outcome = state
        .sessions
        .bind(account_id, &device_id, token, is_login_flow)
        .await?;

    request.extensions_mut().insert(SessionContext {
        account_id,
        device_id,
        outcome,
    });

    Ok(next.run(request).await)
}
