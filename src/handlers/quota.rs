//! Quota HTTP handlers.
//!
//! - GET /api/v1/quota?feature= - Both windows plus active temporary boosts
//! - POST /api/v1/quota/check - Decision without side effects
//! - POST /api/v1/quota/record - Append a ledger entry
//!
//! A denial from `check` is a normal 200 response with `allowed: false`;
//! only [`QuotaEngine::check_and_record`](crate::services::quota_service::QuotaEngine::check_and_record)
//! turns it into a 429.

use crate::{
    app::AppState,
    error::AppError,
    models::{
        quota::{QuotaCheckRequest, QuotaDecision, QuotaQuery, QuotaRecordRequest, QuotaStatusResponse},
        session::SessionContext,
    },
};
use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
};

/// Quota status for the session's account.
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "feature": "ai",
///   "allowed": true,
///   "daily": { "used": 9, "remaining": 1, "limit": 10, "allowed": true },
///   "cycle": { "used": 40, "remaining": 80, "limit": 120, "allowed": true },
///   "active_boosts": []
/// }
/// ```
pub async fn quota_status(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<QuotaQuery>,
) -> Result<Json<QuotaStatusResponse>, AppError> {
    let status = state
        .quota
        .status(session.account_id, query.feature.as_deref())
        .await?;
    Ok(Json(status))
}

/// Evaluate both windows without recording anything.
pub async fn quota_check(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<QuotaCheckRequest>,
) -> Result<Json<QuotaDecision>, AppError> {
    let decision = state
        .quota
        .check(session.account_id, request.feature.as_deref())
        .await?;
    Ok(Json(decision))
}

/// Record the outcome of a privileged action.
///
/// # Request Body
///
/// ```json
/// { "feature": "ai", "outcome": "success" }
/// ```
///
/// # Response
///
/// - **201 Created** with an empty body
pub async fn quota_record(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<QuotaRecordRequest>,
) -> Result<StatusCode, AppError> {
    state
        .quota
        .record(session.account_id, request.feature.as_deref(), request.outcome)
        .await?;
    Ok(StatusCode::CREATED)
}
