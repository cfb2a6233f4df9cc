//! Record store boundary.
//!
//! The engines never issue read-modify-write sequences across separate round
//! trips. Every mutation is one [`Store`] call that carries the values it
//! read (`expected_*`) and applies all of its writes conditionally and
//! atomically; a lost race comes back as [`StoreError::Conflict`] and nothing
//! is written.
//!
//! Two implementations exist: [`postgres::PgStore`] (one SQL transaction per
//! mutation) and [`memory::MemoryStore`] (one lock per mutation).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    account::Account,
    api_key::AdminApiKey,
    key::{AccessKey, BoostKey, KeyKind, KeyRedemption, RedemptionOperation},
    quota::{NewLedgerEntry, QuotaScope, QuotaSettingsOverride, TemporaryBoost},
};

/// Store-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A conditional write found the row changed (or a unique code taken).
    #[error("conditional update lost a race")]
    Conflict,

    /// The call did not finish within its deadline.
    #[error("store call timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bound a store call by `limit`; an elapsed deadline is [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

/// Everything an access-key redemption writes.
///
/// Applied all-or-nothing: consume the key if `used_count` is still
/// `expected_used_count`, move the account's expiration from
/// `expected_expires_at` to `new_expires_at`, append the audit row.
#[derive(Debug, Clone)]
pub struct AccessRedemption {
    pub key_id: Uuid,
    pub expected_used_count: i32,
    pub account_id: Uuid,
    pub expected_expires_at: Option<DateTime<Utc>>,
    pub new_expires_at: DateTime<Utc>,
    pub operation: RedemptionOperation,
    pub redeemed_at: DateTime<Utc>,
}

/// The limit-side write of a boost redemption.
#[derive(Debug, Clone)]
pub enum BoostWrite {
    /// Compare-and-swap the account's base limit for `scope`.
    RaiseBaseLimit {
        scope: QuotaScope,
        expected: Option<i32>,
        new_limit: i32,
    },
    /// Insert a temporary boost row.
    Temporary(TemporaryBoost),
}

/// Everything a boost-key redemption writes.
#[derive(Debug, Clone)]
pub struct BoostRedemption {
    pub key_id: Uuid,
    pub expected_used_count: i32,
    pub account_id: Uuid,
    /// Stamp `redeemed_by_account_id` (single-use keys only)
    pub record_redeemer: bool,
    pub write: BoostWrite,
    pub redeemed_at: DateTime<Utc>,
}

/// Result of an administrative delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDeletion {
    Deleted,
    NotFound,
    /// `used_count > 0`; the key must be soft-disabled instead
    InUse,
}

/// Durable state reachable by the engines.
#[async_trait]
pub trait Store: Send + Sync {
    /// Connectivity probe for health checks.
    async fn ping(&self) -> StoreResult<()>;

    // ---- accounts ----------------------------------------------------------

    async fn find_account(&self, id: Uuid) -> StoreResult<Option<Account>>;

    async fn create_account(
        &self,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Account>;

    /// Administrative override; the only write allowed to shorten validity.
    async fn override_expiry(
        &self,
        account_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>>;

    async fn set_base_limits(
        &self,
        account_id: Uuid,
        daily: Option<i32>,
        cycle: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>>;

    // ---- keys ----------------------------------------------------------------

    /// Point lookup by normalized code.
    async fn find_access_key(&self, code: &str) -> StoreResult<Option<AccessKey>>;

    async fn find_boost_key(&self, code: &str) -> StoreResult<Option<BoostKey>>;

    /// Insert a batch atomically; a taken code fails the whole batch with
    /// [`StoreError::Conflict`].
    async fn insert_access_keys(&self, keys: &[AccessKey]) -> StoreResult<()>;

    async fn insert_boost_keys(&self, keys: &[BoostKey]) -> StoreResult<()>;

    /// Returns `false` when no key has that id.
    async fn set_key_active(&self, kind: KeyKind, key_id: Uuid, active: bool)
    -> StoreResult<bool>;

    /// Physical delete, refused for keys that were ever redeemed.
    async fn delete_unused_key(&self, kind: KeyKind, key_id: Uuid) -> StoreResult<KeyDeletion>;

    async fn commit_access_redemption(&self, plan: &AccessRedemption) -> StoreResult<()>;

    async fn commit_boost_redemption(&self, plan: &BoostRedemption) -> StoreResult<()>;

    async fn list_redemptions(&self, account_id: Uuid) -> StoreResult<Vec<KeyRedemption>>;

    // ---- quota ---------------------------------------------------------------

    /// Successful ledger entries for `(account, feature)` with
    /// `from <= created_at < to`.
    async fn count_successes(
        &self,
        account_id: Uuid,
        feature: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<i64>;

    async fn append_ledger(&self, entry: &NewLedgerEntry) -> StoreResult<()>;

    /// Temporary boosts contributing to any scope at `at`.
    async fn effective_temporary_boosts(
        &self,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<TemporaryBoost>>;

    async fn set_temporary_boost_active(&self, boost_id: Uuid, active: bool) -> StoreResult<bool>;

    /// Optional runtime overrides of the quota settings.
    async fn load_quota_settings(&self) -> StoreResult<Option<QuotaSettingsOverride>>;

    // ---- sessions ------------------------------------------------------------

    /// Compare-and-swap `current_session_id` from `expected` to `new`.
    ///
    /// Returns `false` when the stored value is no longer `expected` (or the
    /// account does not exist).
    async fn swap_session(
        &self,
        account_id: Uuid,
        expected: Option<&str>,
        new: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Stamp activity if `session_id` is still authoritative.
    async fn touch_session(
        &self,
        account_id: Uuid,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // ---- admin auth ----------------------------------------------------------

    async fn find_admin_key(&self, key_hash: &str) -> StoreResult<Option<AdminApiKey>>;
}
