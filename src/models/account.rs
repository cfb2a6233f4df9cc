//! Account data models and API request/response types.
//!
//! This module defines:
//! - `Account`: Database entity carrying the membership and quota fields
//! - Admin request bodies that mutate an account
//! - `AccountResponse`: Response body returned to clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::quota::QuotaScope;

/// Represents an account record from the database.
///
/// # Database Table
///
/// Maps to the `accounts` table. The identity itself is owned by the external
/// identity provider; this row only carries what the engines need:
/// - membership expiration (`expires_at`)
/// - per-account quota overrides (`base_daily_limit`, `base_cycle_limit`)
/// - the single authoritative device session (`current_session_id`)
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct Account {
    /// Unique identifier for this account
    pub id: Uuid,

    /// Optional human-readable name, for admin screens only
    pub display_name: Option<String>,

    /// Membership expiration
    ///
    /// `None` or a past instant means the account is inactive. Only moves
    /// forward through key redemption; an admin override is the single path
    /// that may move it backwards.
    pub expires_at: Option<DateTime<Utc>>,

    /// Per-account daily limit override (`None` = system default)
    pub base_daily_limit: Option<i32>,

    /// Per-account cycle limit override (`None` = system default)
    pub base_cycle_limit: Option<i32>,

    /// Encoded `(account, device, token fingerprint)` of the authoritative session
    pub current_session_id: Option<String>,

    /// Last request seen from the authoritative session
    pub last_active_at: Option<DateTime<Utc>>,

    /// Timestamp when account was created
    pub created_at: DateTime<Utc>,

    /// Timestamp of last update to any of the fields above
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Whether the membership is valid at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now < expires_at)
    }

    /// The stored override for a quota scope, if any.
    pub fn base_limit(&self, scope: QuotaScope) -> Option<i32> {
        match scope {
            QuotaScope::Daily => self.base_daily_limit,
            QuotaScope::Cycle => self.base_cycle_limit,
        }
    }
}

/// Request body for provisioning an account record.
///
/// # JSON Example
///
/// ```json
/// {
///   "display_name": "player-one"
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct CreateAccountRequest {
    /// Optional display name
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Request body for the administrative expiry override.
///
/// `expires_at: null` revokes the membership outright.
#[derive(Debug, Deserialize)]
pub struct OverrideExpiryRequest {
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request body for per-account quota overrides.
///
/// A `null` value restores the system default for that scope.
#[derive(Debug, Deserialize)]
pub struct SetBaseLimitsRequest {
    #[serde(default)]
    pub daily_limit: Option<i32>,

    #[serde(default)]
    pub cycle_limit: Option<i32>,
}

/// Response body for account endpoints.
///
/// # JSON Example
///
/// ```json
/// {
///   "id": "550e8400-e29b-41d4-a716-446655440000",
///   "display_name": "player-one",
///   "expires_at": "2025-12-20T10:00:00Z",
///   "active": true,
///   "base_daily_limit": null,
///   "base_cycle_limit": 200,
///   "created_at": "2025-11-20T10:00:00Z",
///   "updated_at": "2025-11-20T10:00:00Z"
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub base_daily_limit: Option<i32>,
    pub base_cycle_limit: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountResponse {
    /// Build the response, evaluating `active` at `now`.
    ///
    /// The session id is never exposed.
    pub fn from_account(account: Account, now: DateTime<Utc>) -> Self {
        Self {
            active: account.is_active(now),
            id: account.id,
            display_name: account.display_name,
            expires_at: account.expires_at,
            base_daily_limit: account.base_daily_limit,
            base_cycle_limit: account.base_cycle_limit,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

/// Membership status for `GET /api/v1/license`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LicenseStatus {
    pub account_id: Uuid,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// Whole hours of validity left, zero when inactive
    pub remaining_hours: i64,
}

impl LicenseStatus {
    pub fn evaluate(account: &Account, now: DateTime<Utc>) -> Self {
        let remaining_hours = account
            .expires_at
            .map_or(0, |expires_at| (expires_at - now).num_hours().max(0));
        Self {
            account_id: account.id,
            active: account.is_active(now),
            expires_at: account.expires_at,
            remaining_hours,
        }
    }
}
