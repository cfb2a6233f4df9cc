//! Admin API key authentication middleware.
//!
//! This middleware intercepts every admin request to:
//! 1. Extract the API key from the Authorization header
//! 2. Hash it and verify it exists in the store
//! 3. Inject the admin context into the request
//! 4. Reject unauthorized requests with HTTP 401

use crate::{app::AppState, error::AppError};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Context attached to authenticated admin requests.
///
/// Extracted by admin handlers with `Extension<AdminContext>` so every
/// mutation can be attributed in the logs.
#[derive(Debug, Clone)]
pub struct AdminContext {
    /// ID of the authenticated API key
    pub api_key_id: Uuid,

    /// Human-readable label of the key (who or what holds it)
    pub label: String,
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// SHA-256 hex digest under which admin keys are stored.
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Admin API key authentication middleware function.
///
/// # Flow
///
/// 1. Extract `Authorization: Bearer <key>` header from request
/// 2. Hash the `<key>` using SHA-256
/// 3. Look up the active admin key with that hash
/// 4. If found: inject `AdminContext` into request, call next handler
/// 5. If not found: return 401 Unauthorized error
///
/// # Returns
///
/// - `Ok(Response)` if authenticated successfully (calls next handler)
/// - `Err(AppError::InvalidApiKey)` if authentication fails (returns 401)
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key_hash = bearer_token(&request)
        .map(hash_api_key)
        .ok_or(AppError::InvalidApiKey)?;

    let admin_key = state
        .store
        .find_admin_key(&key_hash)
        .await?
        .filter(|key| key.is_active)
        .ok_or(AppError::InvalidApiKey)?;

    request.extensions_mut().insert(AdminContext {
        api_key_id: admin_key.id,
        label: admin_key.label,
    });

    Ok(next.run(request).await)
}
