//! Redeemable key models: access keys, boost keys and the redemption audit.
//!
//! Both key kinds share the same consumption fields (`is_active`, `max_uses`,
//! `used_count`, `activation_deadline`, `redeemed_by_account_id`); the
//! redemption gate only looks at those through [`KeyGate`]. What a key does
//! once redeemed is a closed variant: an access key extends membership, a
//! boost key yields a [`BoostEffect`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::quota::{QuotaScope, UnknownVariant};

/// Longest code accepted from user input.
pub const MAX_CODE_LEN: usize = 64;

/// Which table a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Access,
    Boost,
}

impl KeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::Access => "access",
            KeyKind::Boost => "boost",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(KeyKind::Access),
            "boost" => Ok(KeyKind::Boost),
            other => Err(UnknownVariant {
                kind: "key kind",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for KeyKind {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Normalize a human-entered code: trim and uppercase.
///
/// Rejects empty, oversized or non `[A-Z0-9-]` input before any store access.
pub fn normalize_code(raw: &str) -> Result<String, String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err("Key code is required".to_string());
    }
    if code.len() > MAX_CODE_LEN {
        return Err(format!("Key code exceeds {MAX_CODE_LEN} characters"));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("Key code may only contain letters, digits and '-'".to_string());
    }
    Ok(code)
}

/// The consumption fields shared by every key kind.
#[derive(Debug, Clone, Copy)]
pub struct KeyGate {
    pub is_active: bool,
    /// `None` = unlimited
    pub max_uses: Option<i32>,
    pub used_count: i32,
    pub activation_deadline: Option<DateTime<Utc>>,
    /// The key carries a redeemer that permanently blocks further use
    pub consumed: bool,
}

impl KeyGate {
    pub fn is_single_use(&self) -> bool {
        self.max_uses == Some(1)
    }
}

/// Represents an access key record from the database.
///
/// # Database Table
///
/// Maps to the `access_keys` table. `code` is stored normalized and carries a
/// unique index, which is what makes lookups case-insensitive.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct AccessKey {
    pub id: Uuid,
    pub code: String,

    /// Administrative kill switch
    pub is_active: bool,

    /// `None` = unlimited
    pub max_uses: Option<i32>,

    /// Monotonic; never exceeds `max_uses`
    pub used_count: i32,

    /// The key must be redeemed before this instant
    pub activation_deadline: Option<DateTime<Utc>>,

    /// How far a redemption extends the account's expiration
    pub grant_duration_hours: f64,

    /// First redeemer, kept for single-use auditing
    pub redeemed_by_account_id: Option<Uuid>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AccessKey {
    pub fn gate(&self) -> KeyGate {
        KeyGate {
            is_active: self.is_active,
            max_uses: self.max_uses,
            used_count: self.used_count,
            activation_deadline: self.activation_deadline,
            consumed: self.max_uses == Some(1) && self.redeemed_by_account_id.is_some(),
        }
    }

    /// The grant as a chrono duration, millisecond precision.
    pub fn grant_duration(&self) -> Duration {
        grant_hours_to_duration(self.grant_duration_hours)
    }
}

/// Convert a (possibly fractional) hour count into a duration. Values chrono
/// cannot represent come back as zero.
pub fn grant_hours_to_duration(hours: f64) -> Duration {
    Duration::try_milliseconds((hours * 3_600_000.0).round() as i64).unwrap_or_else(Duration::zero)
}

/// Represents a boost key record from the database.
///
/// Maps to the `boost_keys` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct BoostKey {
    pub id: Uuid,
    pub code: String,
    pub is_active: bool,
    pub max_uses: Option<i32>,
    pub used_count: i32,
    pub activation_deadline: Option<DateTime<Utc>>,

    /// Limit the boost applies to
    #[sqlx(try_from = "String")]
    pub scope: QuotaScope,

    /// Additive limit increase
    pub amount: i32,

    pub is_temporary: bool,

    /// Lifetime of the temporary boost window, required when `is_temporary`
    pub temporary_duration_days: Option<i32>,

    /// Set only for single-use keys; once set the key is spent
    pub redeemed_by_account_id: Option<Uuid>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// What redeeming a boost key does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostEffect {
    /// Raise the account's base limit for `scope` forever.
    Permanent { scope: QuotaScope, amount: i32 },
    /// Add `amount` to `scope` over `[now, now + duration)`.
    Temporary {
        scope: QuotaScope,
        amount: i32,
        duration: Duration,
    },
}

impl BoostEffect {
    pub fn scope(&self) -> QuotaScope {
        match *self {
            BoostEffect::Permanent { scope, .. } | BoostEffect::Temporary { scope, .. } => scope,
        }
    }

    pub fn amount(&self) -> i32 {
        match *self {
            BoostEffect::Permanent { amount, .. } | BoostEffect::Temporary { amount, .. } => amount,
        }
    }
}

impl BoostKey {
    pub fn gate(&self) -> KeyGate {
        KeyGate {
            is_active: self.is_active,
            max_uses: self.max_uses,
            used_count: self.used_count,
            activation_deadline: self.activation_deadline,
            consumed: self.redeemed_by_account_id.is_some(),
        }
    }

    /// Decode the stored columns into an effect.
    ///
    /// Returns the offending detail when the row is malformed (a temporary
    /// key without a positive duration).
    pub fn effect(&self) -> Result<BoostEffect, String> {
        if !self.is_temporary {
            return Ok(BoostEffect::Permanent {
                scope: self.scope,
                amount: self.amount,
            });
        }
        match self.temporary_duration_days {
            Some(days) if days > 0 => Ok(BoostEffect::Temporary {
                scope: self.scope,
                amount: self.amount,
                duration: Duration::days(i64::from(days)),
            }),
            other => Err(format!(
                "boost key {} is temporary with invalid duration {:?}",
                self.id, other
            )),
        }
    }
}

/// Audit kind of a successful redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedemptionOperation {
    /// First membership grant for the account
    Signup,
    /// Extension of an existing (possibly lapsed) membership
    Renew,
    /// Quota boost
    Boost,
}

impl RedemptionOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            RedemptionOperation::Signup => "signup",
            RedemptionOperation::Renew => "renew",
            RedemptionOperation::Boost => "boost",
        }
    }
}

impl FromStr for RedemptionOperation {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signup" => Ok(RedemptionOperation::Signup),
            "renew" => Ok(RedemptionOperation::Renew),
            "boost" => Ok(RedemptionOperation::Boost),
            other => Err(UnknownVariant {
                kind: "redemption operation",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for RedemptionOperation {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Audit row linking account, key and operation.
///
/// Maps to the `key_redemptions` table; written in the same transaction as
/// the key consumption.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct KeyRedemption {
    pub id: Uuid,
    pub account_id: Uuid,
    pub key_id: Uuid,
    #[sqlx(try_from = "String")]
    pub key_kind: KeyKind,
    #[sqlx(try_from = "String")]
    pub operation: RedemptionOperation,
    pub created_at: DateTime<Utc>,
}

/// Request body for both redemption endpoints.
///
/// # JSON Example
///
/// ```json
/// {
///   "account_id": "550e8400-e29b-41d4-a716-446655440000",
///   "code": "xy-30-abcd1234"
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct RedeemKeyRequest {
    pub account_id: Uuid,
    pub code: String,
}

/// Result of a successful access-key redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    pub new_expires_at: DateTime<Utc>,
    pub operation: RedemptionOperation,
}

/// Effective limits after a boost, evaluated at redemption time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveLimits {
    pub daily: i64,
    pub cycle: i64,
}

/// Result of a successful boost-key redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoostGrant {
    pub scope: QuotaScope,
    pub amount: i32,
    pub temporary: bool,
    /// End of the temporary window, when `temporary`
    pub valid_to: Option<DateTime<Utc>>,
    pub new_limits: EffectiveLimits,
}

fn default_max_uses() -> Option<i32> {
    Some(1)
}

/// Request body for generating a batch of access keys.
///
/// `max_uses` defaults to 1 when omitted; an explicit `null` means unlimited.
#[derive(Debug, Deserialize)]
pub struct GenerateAccessKeysRequest {
    pub count: u32,
    pub grant_duration_hours: f64,

    #[serde(default = "default_max_uses")]
    pub max_uses: Option<i32>,

    #[serde(default)]
    pub activation_deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub prefix: Option<String>,
}

/// Request body for generating a batch of boost keys.
#[derive(Debug, Deserialize)]
pub struct GenerateBoostKeysRequest {
    pub count: u32,
    pub scope: QuotaScope,
    pub amount: i32,

    #[serde(default)]
    pub temporary: bool,

    #[serde(default)]
    pub temporary_duration_days: Option<i32>,

    #[serde(default = "default_max_uses")]
    pub max_uses: Option<i32>,

    #[serde(default)]
    pub activation_deadline: Option<DateTime<Utc>>,

    #[serde(default)]
    pub prefix: Option<String>,
}

/// Request body for enabling or disabling a key.
#[derive(Debug, Deserialize)]
pub struct SetKeyActiveRequest {
    pub active: bool,
}
