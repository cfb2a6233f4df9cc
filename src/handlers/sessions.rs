//! Device session handlers.
//!
//! The binding itself happens in the bind-session middleware; these handlers
//! only report what it decided.

use crate::{
    app::AppState,
    error::AppError,
    models::session::{SessionContext, SessionResponse},
};
use axum::{Extension, Json, extract::State};

async fn describe(state: &AppState, session: SessionContext) -> Result<SessionResponse, AppError> {
    let bound = state.sessions.current(session.account_id).await?;
    Ok(SessionResponse {
        account_id: session.account_id,
        device_id: session.device_id,
        outcome: session.outcome,
        last_active_at: bound.last_active_at,
    })
}

/// Log in from this device, superseding any other device.
///
/// # Endpoint
///
/// `POST /api/v1/sessions/login`
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "account_id": "550e8400-e29b-41d4-a716-446655440000",
///   "device_id": "3f2a9c-android",
///   "outcome": "superseded",
///   "last_active_at": "2025-12-20T10:00:00Z"
/// }
/// ```
pub async fn login(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<SessionResponse>, AppError> {
    Ok(Json(describe(&state, session).await?))
}

/// The session this request was bound to.
///
/// # Endpoint
///
/// `GET /api/v1/sessions/current`
pub async fn current_session(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<SessionResponse>, AppError> {
    Ok(Json(describe(&state, session).await?))
}
