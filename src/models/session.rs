//! Device-session models.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Outcome of binding a request to the account's authoritative session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindOutcome {
    /// No previous session; this device became authoritative.
    FirstLogin,
    /// Request from the authoritative device.
    Continued,
    /// Login from a new device superseded the previous one.
    Superseded,
}

/// Which device currently holds the account, as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSession {
    /// `None` before the first login
    pub device_id: Option<String>,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Authenticated session attached to every session-bound request.
///
/// Inserted into the request extensions by the bind-session middleware and
/// extracted by handlers with `Extension<SessionContext>`.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub account_id: Uuid,
    pub device_id: String,
    pub outcome: BindOutcome,
}

/// Response body for `GET /api/v1/sessions/current` and the login endpoint.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub account_id: Uuid,
    pub device_id: String,
    pub outcome: BindOutcome,
    pub last_active_at: Option<DateTime<Utc>>,
}
