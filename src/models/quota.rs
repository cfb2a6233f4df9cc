//! Quota data models: scopes, ledger entries, temporary boosts and the
//! system-wide limit settings.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Feature tag used when the caller does not name one.
pub const DEFAULT_FEATURE: &str = "ai";

/// Maximum length of a feature tag.
pub const MAX_FEATURE_LEN: usize = 64;

/// Unknown enum text read from the database or a request.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// One of the two independent rolling windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaScope {
    /// Trailing 24 hours
    Daily,
    /// Trailing 30 days
    Cycle,
}

impl QuotaScope {
    pub const ALL: [QuotaScope; 2] = [QuotaScope::Daily, QuotaScope::Cycle];

    /// Length of the rolling window `[now - window, now)`.
    pub fn window(self) -> Duration {
        match self {
            QuotaScope::Daily => Duration::hours(24),
            QuotaScope::Cycle => Duration::days(30),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuotaScope::Daily => "daily",
            QuotaScope::Cycle => "cycle",
        }
    }
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaScope {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(QuotaScope::Daily),
            "cycle" => Ok(QuotaScope::Cycle),
            other => Err(UnknownVariant {
                kind: "quota scope",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for QuotaScope {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Result of a privileged action. Only successes consume quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerOutcome {
    Success,
    Failure,
}

impl LedgerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerOutcome::Success => "success",
            LedgerOutcome::Failure => "failure",
        }
    }
}

impl FromStr for LedgerOutcome {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(LedgerOutcome::Success),
            "failure" => Ok(LedgerOutcome::Failure),
            other => Err(UnknownVariant {
                kind: "ledger outcome",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for LedgerOutcome {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Append-only record of one privileged-action attempt.
///
/// Maps to the `quota_ledger` table. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct QuotaLedgerEntry {
    pub id: i64,
    pub account_id: Uuid,
    pub feature: String,
    #[sqlx(try_from = "String")]
    pub outcome: LedgerOutcome,
    pub created_at: DateTime<Utc>,
}

/// Ledger entry about to be appended.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub account_id: Uuid,
    pub feature: String,
    pub outcome: LedgerOutcome,
    pub created_at: DateTime<Utc>,
}

/// Time-boxed additive limit increase created by a temporary boost key.
///
/// Expiry is evaluated lazily: the row simply stops contributing once
/// `now >= valid_to`. Nothing sweeps it.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct TemporaryBoost {
    pub id: Uuid,
    pub account_id: Uuid,
    #[sqlx(try_from = "String")]
    pub scope: QuotaScope,
    pub amount: i32,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    /// Administrative force-disable
    pub active: bool,
    /// Boost key that produced this row
    pub source_key_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl TemporaryBoost {
    /// Whether the boost contributes to its scope at `now`.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.active && self.valid_from <= now && now < self.valid_to
    }
}

/// System-wide defaults and clamping bounds for effective limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSettings {
    pub default_daily_limit: i64,
    pub default_cycle_limit: i64,
    /// Lower clamp applied to both scopes
    pub min_limit: i64,
    pub max_daily_limit: i64,
    pub max_cycle_limit: i64,
}

impl QuotaSettings {
    /// Reject impossible bounds. Callers treat a failure as a fatal
    /// configuration error rather than guessing a limit.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_limit < 1 {
            return Err(format!("min_limit must be >= 1, got {}", self.min_limit));
        }
        if self.max_daily_limit < self.min_limit {
            return Err(format!(
                "max_daily_limit ({}) is below min_limit ({})",
                self.max_daily_limit, self.min_limit
            ));
        }
        if self.max_cycle_limit < self.min_limit {
            return Err(format!(
                "max_cycle_limit ({}) is below min_limit ({})",
                self.max_cycle_limit, self.min_limit
            ));
        }
        Ok(())
    }

    pub fn default_limit(&self, scope: QuotaScope) -> i64 {
        match scope {
            QuotaScope::Daily => self.default_daily_limit,
            QuotaScope::Cycle => self.default_cycle_limit,
        }
    }

    pub fn max_limit(&self, scope: QuotaScope) -> i64 {
        match scope {
            QuotaScope::Daily => self.max_daily_limit,
            QuotaScope::Cycle => self.max_cycle_limit,
        }
    }

    /// Base limit for a scope: the account override or the system default,
    /// clamped into `[min_limit, max_limit(scope)]`.
    ///
    /// A zero or negative configured value degrades to `min_limit` instead of
    /// locking every account out.
    pub fn clamp_base(&self, scope: QuotaScope, configured: Option<i32>) -> i64 {
        let raw = configured
            .map(i64::from)
            .unwrap_or_else(|| self.default_limit(scope));
        raw.clamp(self.min_limit, self.max_limit(scope))
    }
}

/// Row of the optional `system_settings` override table.
///
/// Each `None` falls back to the environment-provided value.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct QuotaSettingsOverride {
    pub default_daily_limit: Option<i32>,
    pub default_cycle_limit: Option<i32>,
    pub min_limit: Option<i32>,
    pub max_daily_limit: Option<i32>,
    pub max_cycle_limit: Option<i32>,
}

impl QuotaSettingsOverride {
    pub fn apply(&self, base: QuotaSettings) -> QuotaSettings {
        QuotaSettings {
            default_daily_limit: self
                .default_daily_limit
                .map_or(base.default_daily_limit, i64::from),
            default_cycle_limit: self
                .default_cycle_limit
                .map_or(base.default_cycle_limit, i64::from),
            min_limit: self.min_limit.map_or(base.min_limit, i64::from),
            max_daily_limit: self.max_daily_limit.map_or(base.max_daily_limit, i64::from),
            max_cycle_limit: self.max_cycle_limit.map_or(base.max_cycle_limit, i64::from),
        }
    }
}

/// Used/remaining/limit for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub used: i64,
    pub remaining: i64,
    pub limit: i64,
    pub allowed: bool,
}

impl WindowUsage {
    pub fn new(used: i64, limit: i64) -> Self {
        let remaining = (limit - used).max(0);
        Self {
            used,
            remaining,
            limit,
            allowed: remaining > 0,
        }
    }
}

/// Combined decision for both windows.
///
/// Reported in full even when denied so the UI can show "daily: 0/10,
/// cycle: 5/120".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub feature: String,
    pub allowed: bool,
    pub daily: WindowUsage,
    pub cycle: WindowUsage,
}

impl QuotaDecision {
    pub fn new(feature: String, daily: WindowUsage, cycle: WindowUsage) -> Self {
        Self {
            allowed: daily.allowed && cycle.allowed,
            feature,
            daily,
            cycle,
        }
    }
}

/// Query string for `GET /api/v1/quota`.
#[derive(Debug, Default, Deserialize)]
pub struct QuotaQuery {
    #[serde(default)]
    pub feature: Option<String>,
}

/// Request body for `POST /api/v1/quota/check`.
#[derive(Debug, Default, Deserialize)]
pub struct QuotaCheckRequest {
    #[serde(default)]
    pub feature: Option<String>,
}

/// Request body for `POST /api/v1/quota/record`.
#[derive(Debug, Deserialize)]
pub struct QuotaRecordRequest {
    #[serde(default)]
    pub feature: Option<String>,
    pub outcome: LedgerOutcome,
}

/// Response body for `GET /api/v1/quota`.
#[derive(Debug, Serialize)]
pub struct QuotaStatusResponse {
    #[serde(flatten)]
    pub decision: QuotaDecision,
    /// Temporary boosts currently contributing to a limit
    pub active_boosts: Vec<TemporaryBoost>,
}
