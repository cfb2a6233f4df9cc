//! Key redemption and license status handlers.
//!
//! This module implements the end-user license endpoints:
//! - POST /api/v1/keys/redeem - Redeem an access key
//! - POST /api/v1/boosts/redeem - Redeem a boost key
//! - GET /api/v1/license - Current membership status
//!
//! All three sit behind the bind-session middleware.

use crate::{
    app::AppState,
    error::AppError,
    models::{
        account::LicenseStatus,
        key::{AccessGrant, BoostGrant, RedeemKeyRequest},
        session::SessionContext,
    },
};
use axum::{Extension, Json, extract::State};
use uuid::Uuid;

/// A session may only redeem for its own account.
fn owned_account(session: &SessionContext, requested: Uuid) -> Result<Uuid, AppError> {
    if session.account_id != requested {
        tracing::warn!(
            session_account = %session.account_id,
            requested_account = %requested,
            "redemption for a different account refused"
        );
        return Err(AppError::AccountNotFound);
    }
    Ok(requested)
}

/// Redeem an access key.
///
/// # Endpoint
///
/// `POST /api/v1/keys/redeem`
///
/// # Request Body
///
/// ```json
/// {
///   "account_id": "550e8400-e29b-41d4-a716-446655440000",
///   "code": "xy-30-abcd1234"
/// }
/// ```
///
/// # Response
///
/// - **Success (200 OK)**: `{"new_expires_at": "...", "operation": "signup"}`
/// - **Error (400)**: Malformed code
/// - **Error (404)**: `key_not_found` / `account_not_found`
/// - **Error (409)**: `key_disabled`, `key_exhausted`,
///   `key_expired_for_activation`, `key_already_used`
/// - **Error (503)**: `persistence_conflict`, safe to retry
pub async fn redeem_access_key(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<RedeemKeyRequest>,
) -> Result<Json<AccessGrant>, AppError> {
    let account_id = owned_account(&session, request.account_id)?;
    let grant = state.license.redeem(account_id, &request.code).await?;
    Ok(Json(grant))
}

/// Redeem a boost key.
///
/// # Endpoint
///
/// `POST /api/v1/boosts/redeem`
///
/// # Response
///
/// ```json
/// {
///   "scope": "daily",
///   "amount": 5,
///   "temporary": true,
///   "valid_to": "2025-12-27T10:00:00Z",
///   "new_limits": { "daily": 15, "cycle": 120 }
/// }
/// ```
pub async fn redeem_boost_key(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<RedeemKeyRequest>,
) -> Result<Json<BoostGrant>, AppError> {
    let account_id = owned_account(&session, request.account_id)?;
    let grant = state.license.redeem_boost(account_id, &request.code).await?;
    Ok(Json(grant))
}

/// Membership status of the session's account.
///
/// # Endpoint
///
/// `GET /api/v1/license`
pub async fn license_status(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<LicenseStatus>, AppError> {
    Ok(Json(state.license.status(session.account_id).await?))
}
