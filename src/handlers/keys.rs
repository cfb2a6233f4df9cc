//! Key administration HTTP handlers.
//!
//! - POST /api/v1/admin/keys/access - Generate a batch of access keys
//! - POST /api/v1/admin/keys/boost - Generate a batch of boost keys
//! - PUT /api/v1/admin/keys/{kind}/{id}/active - Enable or disable a key
//! - DELETE /api/v1/admin/keys/{kind}/{id} - Delete a never-redeemed key
//! - POST /api/v1/admin/boosts/{id}/disable - Force-disable a temporary boost
//! - POST /api/v1/admin/settings/reload - Drop cached quota settings

use crate::{
    app::AppState,
    error::AppError,
    middleware::auth::AdminContext,
    models::{
        key::{
            AccessKey, BoostKey, GenerateAccessKeysRequest, GenerateBoostKeysRequest, KeyKind,
            SetKeyActiveRequest,
        },
        quota::QuotaSettings,
    },
};
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

/// Generate access keys.
///
/// # Request Body
///
/// ```json
/// {
///   "count": 10,
///   "grant_duration_hours": 720,
///   "max_uses": 1,
///   "activation_deadline": "2026-03-01T00:00:00Z",
///   "prefix": "XY"
/// }
/// ```
///
/// `max_uses` defaults to 1; `null` creates unlimited keys.
///
/// # Response
///
/// - **Success (201 Created)**: The created keys, codes of the form `XY-30-ABCD2345`
/// - **Error (400)**: Parameters out of range
pub async fn generate_access_keys(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Json(request): Json<GenerateAccessKeysRequest>,
) -> Result<(StatusCode, Json<Vec<AccessKey>>), AppError> {
    let keys = state.keys.generate_access_keys(request).await?;
    tracing::info!(admin = %admin.label, count = keys.len(), "admin generated access keys");
    Ok((StatusCode::CREATED, Json(keys)))
}

/// Generate boost keys.
///
/// # Request Body
///
/// ```json
/// {
///   "count": 5,
///   "scope": "daily",
///   "amount": 5,
///   "temporary": true,
///   "temporary_duration_days": 7
/// }
/// ```
pub async fn generate_boost_keys(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Json(request): Json<GenerateBoostKeysRequest>,
) -> Result<(StatusCode, Json<Vec<BoostKey>>), AppError> {
    let keys = state.keys.generate_boost_keys(request).await?;
    tracing::info!(admin = %admin.label, count = keys.len(), "admin generated boost keys");
    Ok((StatusCode::CREATED, Json(keys)))
}

/// Administrative kill switch.
pub async fn set_key_active(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path((kind, key_id)): Path<(KeyKind, Uuid)>,
    Json(request): Json<SetKeyActiveRequest>,
) -> Result<StatusCode, AppError> {
    state.keys.set_active(kind, key_id, request.active).await?;
    tracing::info!(admin = %admin.label, %kind, %key_id, active = request.active, "admin toggled key");
    Ok(StatusCode::NO_CONTENT)
}

/// Delete a key that was never redeemed.
///
/// # Response
///
/// - **204 No Content** on success
/// - **404** `key_not_found`
/// - **409** `key_in_use`: the key was redeemed; disable it instead
pub async fn delete_key(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path((kind, key_id)): Path<(KeyKind, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.keys.delete(kind, key_id).await?;
    tracing::info!(admin = %admin.label, %kind, %key_id, "admin deleted key");
    Ok(StatusCode::NO_CONTENT)
}

/// Force-disable a temporary boost.
pub async fn disable_temporary_boost(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
    Path(boost_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.keys.disable_temporary_boost(boost_id).await?;
    tracing::info!(admin = %admin.label, %boost_id, "admin disabled temporary boost");
    Ok(StatusCode::NO_CONTENT)
}

/// Drop the cached quota settings and return the freshly loaded values.
pub async fn reload_settings(
    State(state): State<AppState>,
    Extension(admin): Extension<AdminContext>,
) -> Result<Json<QuotaSettings>, AppError> {
    state.settings.invalidate();
    let settings = state.settings.current().await?;
    tracing::info!(admin = %admin.label, ?settings, "quota settings reloaded");
    Ok(Json(settings))
}
