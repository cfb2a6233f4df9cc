//! Account administration HTTP handlers.
//!
//! This module implements the admin account endpoints:
//! - POST /api/v1/admin/accounts - Provision an account record
//! - GET /api/v1/admin/accounts/{id} - Get account by ID
//! - PUT /api/v1/admin/accounts/{id}/expiry - Override membership expiration
//! - PUT /api/v1/admin/accounts/{id}/limits - Per-account quota overrides
//! - GET /api/v1/admin/accounts/{id}/redemptions - Redemption audit trail
//! - GET /api/v1/admin/accounts/{id}/quota - Quota status as the user sees it

use crate::{
    app::AppState,
    error::AppError,
    middleware::auth::AdminContext,
    models::{
        account::{AccountResponse, CreateAccountRequest, OverrideExpiryRequest, SetBaseLimitsRequest},
        key::KeyRedemption,
        quota::{QuotaQuery, QuotaStatusResponse},
    },
};
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use uuid::Uuid;

/// Provision an account record.
///
/// # Endpoint
///
/// `POST /api/v1/admin/accounts`
///
/// # Request Body
///
/// ```json
/// {
///   "display_name": "player-one"
/// }
/// ```
///
/// # Response
///
/// - **Success (201 Created)**: Returns the created account (inactive until
///   a key is redeemed)
/// - **Error (400)**: Display name too long
/// - **Error (401)**: Invalid API key
pub async fn create_account(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let account = state.accounts.create(request.display_name).await?;
    tracing::info!(admin = %admin.label, account_id = %account.id, "admin created account");
    Ok((
        StatusCode::CREATED,
        Json(AccountResponse::from_account(account, state.clock.now_utc())),
    ))
}

/// Get a specific account by ID, bypassing the cache.
///
/// # Response
///
/// - **Success (200 OK)**: Returns account details
/// - **Error (404)**: Account not found
pub async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state.accounts.fresh(account_id).await?;
    Ok(Json(AccountResponse::from_account(
        account,
        state.clock.now_utc(),
    )))
}

/// Set or clear the membership expiration.
///
/// # Request Body
///
/// ```json
/// { "expires_at": "2026-01-01T00:00:00Z" }
/// ```
///
/// The only path that can shorten an account's validity.
pub async fn override_expiry(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<OverrideExpiryRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    tracing::info!(admin = %admin.label, %account_id, "admin expiry override requested");
    let account = state
        .accounts
        .override_expiry(account_id, request.expires_at)
        .await?;
    Ok(Json(AccountResponse::from_account(
        account,
        state.clock.now_utc(),
    )))
}

/// Set per-account base limits.
///
/// # Request Body
///
/// ```json
/// { "daily_limit": 25, "cycle_limit": null }
/// ```
pub async fn set_base_limits(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<SetBaseLimitsRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    tracing::info!(admin = %admin.label, %account_id, "admin base limit change requested");
    let account = state
        .accounts
        .set_base_limits(account_id, request.daily_limit, request.cycle_limit)
        .await?;
    Ok(Json(AccountResponse::from_account(
        account,
        state.clock.now_utc(),
    )))
}

/// Redemption audit trail, newest first.
pub async fn list_redemptions(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<Vec<KeyRedemption>>, AppError> {
    state.accounts.get(account_id).await?;
    Ok(Json(state.keys.redemptions(account_id).await?))
}

/// Quota status for any account.
pub async fn account_quota(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<QuotaQuery>,
) -> Result<Json<QuotaStatusResponse>, AppError> {
    let status = state
        .quota
        .status(account_id, query.feature.as_deref())
        .await?;
    Ok(Json(status))
}
