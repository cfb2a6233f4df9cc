//! Quota engine.
//!
//! Usage is never stored as a counter. Every check recounts successful ledger
//! entries in the trailing window `[now - window, now)` for both scopes, and
//! the effective limit is rebuilt from the account override (or system
//! default), clamped, plus any temporary boosts live at `now`.
//!
//! Check and record are separate round trips, so concurrent requests from one
//! account can each pass the check before either records; overshoot is
//! bounded by the number of such in-flight requests. Setting
//! `QUOTA_SERIALIZE_PER_ACCOUNT` wraps check+action+record in a per-account
//! lock, which removes overshoot within a single process.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::account::Account;
use crate::models::key::EffectiveLimits;
use crate::models::quota::{
    DEFAULT_FEATURE, LedgerOutcome, MAX_FEATURE_LEN, NewLedgerEntry, QuotaDecision, QuotaScope,
    QuotaSettings, QuotaStatusResponse, TemporaryBoost, WindowUsage,
};
use crate::services::account_service::AccountDirectory;
use crate::services::retry::RetryPolicy;
use crate::services::settings::QuotaSettingsProvider;
use crate::store::Store;

/// Validate a feature tag, falling back to [`DEFAULT_FEATURE`] when absent.
///
/// # Errors
///
/// `InvalidRequest` for empty, oversized or non `[a-z0-9_.-]` tags.
pub fn validate_feature(raw: Option<&str>) -> Result<String, AppError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_FEATURE.to_string());
    };
    let feature = raw.trim();
    if feature.is_empty() {
        return Err(AppError::InvalidRequest("feature cannot be empty".to_string()));
    }
    if feature.len() > MAX_FEATURE_LEN {
        return Err(AppError::InvalidRequest(format!(
            "feature exceeds {MAX_FEATURE_LEN} characters"
        )));
    }
    if !feature
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
    {
        return Err(AppError::InvalidRequest(
            "feature may only contain a-z, 0-9, '_', '.' and '-'".to_string(),
        ));
    }
    Ok(feature.to_string())
}

/// Effective limit for one scope at `now`.
pub fn effective_limit(
    settings: &QuotaSettings,
    account: &Account,
    boosts: &[TemporaryBoost],
    scope: QuotaScope,
    now: DateTime<Utc>,
) -> i64 {
    let base = settings.clamp_base(scope, account.base_limit(scope));
    boosts
        .iter()
        .filter(|boost| boost.scope == scope && boost.is_effective(now))
        .fold(base, |limit, boost| limit.saturating_add(i64::from(boost.amount)))
}

/// Effective limits for both scopes at `now`.
pub fn effective_limits(
    settings: &QuotaSettings,
    account: &Account,
    boosts: &[TemporaryBoost],
    now: DateTime<Utc>,
) -> EffectiveLimits {
    EffectiveLimits {
        daily: effective_limit(settings, account, boosts, QuotaScope::Daily, now),
        cycle: effective_limit(settings, account, boosts, QuotaScope::Cycle, now),
    }
}

/// In-process advisory locks, one per account with work in flight.
///
/// An entry lives only while someone holds or waits for it; releasing the
/// last reference removes it from the map.
#[derive(Default)]
struct AccountLocks {
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountLocks {
    async fn acquire(&self, account_id: Uuid) -> AccountLockGuard<'_> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(account_id).or_default().clone()
        };
        AccountLockGuard {
            locks: self,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Drop every entry nobody holds or waits for. Waiters abandoned
    /// mid-acquire leave such entries behind too.
    fn release_idle(&self) {
        let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

struct AccountLockGuard<'a> {
    locks: &'a AccountLocks,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for AccountLockGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so our own reference no longer counts
        drop(self.guard.take());
        self.locks.release_idle();
    }
}

pub struct QuotaEngine {
    store: Arc<dyn Store>,
    accounts: Arc<AccountDirectory>,
    settings: Arc<QuotaSettingsProvider>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    locks: Option<AccountLocks>,
}

impl QuotaEngine {
    pub fn new(
        store: Arc<dyn Store>,
        accounts: Arc<AccountDirectory>,
        settings: Arc<QuotaSettingsProvider>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        serialize_per_account: bool,
    ) -> Self {
        Self {
            store,
            accounts,
            settings,
            clock,
            retry,
            locks: serialize_per_account.then(AccountLocks::default),
        }
    }

    /// Temporary boosts contributing to any scope at `now`.
    async fn live_boosts(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<TemporaryBoost>, AppError> {
        let boosts = self
            .retry
            .read("effective_temporary_boosts", || {
                self.store.effective_temporary_boosts(account_id, now)
            })
            .await?;
        Ok(boosts
            .into_iter()
            .filter(|boost| boost.is_effective(now))
            .collect())
    }

    /// Successful actions for `feature` in the trailing window of `scope`.
    async fn used(
        &self,
        account_id: Uuid,
        feature: &str,
        scope: QuotaScope,
        now: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let from = now - scope.window();
        let used = self
            .retry
            .read("count_successes", || {
                self.store.count_successes(account_id, feature, from, now)
            })
            .await?;
        Ok(used)
    }

    async fn usage(
        &self,
        account: &Account,
        settings: &QuotaSettings,
        boosts: &[TemporaryBoost],
        feature: &str,
        scope: QuotaScope,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage, AppError> {
        let limit = effective_limit(settings, account, boosts, scope, now);
        let used = self.used(account.id, feature, scope, now).await?;
        Ok(WindowUsage::new(used, limit))
    }

    async fn evaluate(
        &self,
        account_id: Uuid,
        feature: &str,
        now: DateTime<Utc>,
    ) -> Result<(QuotaDecision, Vec<TemporaryBoost>), AppError> {
        let account = self.accounts.get(account_id).await?;
        let settings = self.settings.current().await?;
        let boosts = self.live_boosts(account_id, now).await?;

        let daily = self
            .usage(&account, &settings, &boosts, feature, QuotaScope::Daily, now)
            .await?;
        let cycle = self
            .usage(&account, &settings, &boosts, feature, QuotaScope::Cycle, now)
            .await?;
        Ok((QuotaDecision::new(feature.to_string(), daily, cycle), boosts))
    }

    /// One window in isolation.
    pub async fn check_scope(
        &self,
        account_id: Uuid,
        feature: Option<&str>,
        scope: QuotaScope,
    ) -> Result<WindowUsage, AppError> {
        let feature = validate_feature(feature)?;
        let now = self.clock.now_utc();
        let account = self.accounts.get(account_id).await?;
        let settings = self.settings.current().await?;
        let boosts = self.live_boosts(account_id, now).await?;
        self.usage(&account, &settings, &boosts, &feature, scope, now)
            .await
    }

    /// Both windows, without side effects. A denial is a normal result here,
    /// not an error.
    pub async fn check(
        &self,
        account_id: Uuid,
        feature: Option<&str>,
    ) -> Result<QuotaDecision, AppError> {
        let feature = validate_feature(feature)?;
        let (decision, _) = self
            .evaluate(account_id, &feature, self.clock.now_utc())
            .await?;
        Ok(decision)
    }

    /// Both windows plus the temporary boosts currently applied.
    pub async fn status(
        &self,
        account_id: Uuid,
        feature: Option<&str>,
    ) -> Result<QuotaStatusResponse, AppError> {
        let feature = validate_feature(feature)?;
        let (decision, active_boosts) = self
            .evaluate(account_id, &feature, self.clock.now_utc())
            .await?;
        Ok(QuotaStatusResponse {
            decision,
            active_boosts,
        })
    }

    /// Effective limits for an account snapshot at the current instant.
    pub async fn limits_for(&self, account: &Account) -> Result<EffectiveLimits, AppError> {
        let now = self.clock.now_utc();
        let settings = self.settings.current().await?;
        let boosts = self.live_boosts(account.id, now).await?;
        Ok(effective_limits(&settings, account, &boosts, now))
    }

    /// Append a ledger entry. Not retried: an append is not idempotent.
    pub async fn record(
        &self,
        account_id: Uuid,
        feature: Option<&str>,
        outcome: LedgerOutcome,
    ) -> Result<(), AppError> {
        let feature = validate_feature(feature)?;
        self.accounts.get(account_id).await?;
        self.append(account_id, feature, outcome).await
    }

    async fn append(
        &self,
        account_id: Uuid,
        feature: String,
        outcome: LedgerOutcome,
    ) -> Result<(), AppError> {
        let entry = NewLedgerEntry {
            account_id,
            feature,
            outcome,
            created_at: self.clock.now_utc(),
        };
        self.store.append_ledger(&entry).await?;
        tracing::debug!(
            %account_id,
            feature = %entry.feature,
            outcome = outcome.as_str(),
            "quota ledger entry appended"
        );
        Ok(())
    }

    /// Run `action` only if both windows allow it, then record its outcome.
    ///
    /// # Errors
    ///
    /// - `QuotaExceeded` carrying both windows when either is exhausted; the
    ///   action does not run.
    /// - The action's own error, after a `failure` entry has been recorded.
    /// - A store error if the ledger append fails.
    pub async fn check_and_record<T, F, Fut>(
        &self,
        account_id: Uuid,
        feature: Option<&str>,
        action: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let feature = validate_feature(feature)?;

        let _guard = match &self.locks {
            Some(locks) => Some(locks.acquire(account_id).await),
            None => None,
        };

        let (decision, _) = self
            .evaluate(account_id, &feature, self.clock.now_utc())
            .await?;
        if !decision.allowed {
            tracing::info!(
                %account_id,
                %feature,
                daily_used = decision.daily.used,
                daily_limit = decision.daily.limit,
                cycle_used = decision.cycle.used,
                cycle_limit = decision.cycle.limit,
                "quota exceeded"
            );
            return Err(AppError::QuotaExceeded(Box::new(decision)));
        }

        let result = action().await;
        let outcome = if result.is_ok() {
            LedgerOutcome::Success
        } else {
            LedgerOutcome::Failure
        };
        if let Err(e) = self.append(account_id, feature.clone(), outcome).await {
            tracing::error!(
                %account_id,
                %feature,
                outcome = outcome.as_str(),
                error = %e,
                "action completed but its ledger entry was not written"
            );
            return Err(e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn held(locks: &AccountLocks) -> usize {
        locks.inner.lock().unwrap().len()
    }

    fn references(locks: &AccountLocks, account: Uuid) -> usize {
        locks
            .inner
            .lock()
            .unwrap()
            .get(&account)
            .map_or(0, Arc::strong_count)
    }

    #[tokio::test]
    async fn account_locks_are_released_when_idle() {
        let locks = AccountLocks::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = locks.acquire(a).await;
        let second = locks.acquire(b).await;
        assert_eq!(held(&locks), 2);

        drop(first);
        assert_eq!(held(&locks), 1);
        drop(second);
        assert_eq!(held(&locks), 0);
    }

    #[tokio::test]
    async fn waiting_caller_keeps_the_lock_entry() {
        let locks = Arc::new(AccountLocks::default());
        let account = Uuid::new_v4();

        let guard = locks.acquire(account).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire(account).await;
            })
        };
        // map + holder + waiter
        while references(&locks, account) < 3 {
            tokio::task::yield_now().await;
        }

        drop(guard);
        assert_eq!(held(&locks), 1);
        waiter.await.unwrap();
        assert_eq!(held(&locks), 0);
    }

    fn settings() -> QuotaSettings {
        QuotaSettings {
            default_daily_limit: 10,
            default_cycle_limit: 120,
            min_limit: 1,
            max_daily_limit: 10_000,
            max_cycle_limit: 300_000,
        }
    }

    fn account(daily: Option<i32>) -> Account {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Account {
            id: Uuid::new_v4(),
            display_name: None,
            expires_at: None,
            base_daily_limit: daily,
            base_cycle_limit: None,
            current_session_id: None,
            last_active_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn boost(scope: QuotaScope, amount: i32, from: DateTime<Utc>, days: i64) -> TemporaryBoost {
        TemporaryBoost {
            id: Uuid::new_v4(),
            account_id: Uuid::nil(),
            scope,
            amount,
            valid_from: from,
            valid_to: from + Duration::days(days),
            active: true,
            source_key_id: Uuid::new_v4(),
            created_at: from,
        }
    }

    #[test]
    fn feature_defaults_and_validation() {
        assert_eq!(validate_feature(None).unwrap(), "ai");
        assert_eq!(validate_feature(Some(" image.gen ")).unwrap(), "image.gen");
        assert!(validate_feature(Some("")).is_err());
        assert!(validate_feature(Some("Chat")).is_err());
        assert!(validate_feature(Some(&"a".repeat(65))).is_err());
    }

    #[test]
    fn misconfigured_base_is_clamped() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let settings = settings();
        assert_eq!(
            effective_limit(&settings, &account(Some(0)), &[], QuotaScope::Daily, now),
            1
        );
        assert_eq!(
            effective_limit(&settings, &account(Some(-5)), &[], QuotaScope::Daily, now),
            1
        );
        assert_eq!(
            effective_limit(&settings, &account(Some(50_000)), &[], QuotaScope::Daily, now),
            10_000
        );
        assert_eq!(
            effective_limit(&settings, &account(None), &[], QuotaScope::Cycle, now),
            120
        );
    }

    #[test]
    fn boosts_apply_only_inside_their_window_and_scope() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let settings = settings();
        let account = account(None);

        let live = boost(QuotaScope::Daily, 5, now - Duration::days(1), 7);
        let expired = boost(QuotaScope::Daily, 100, now - Duration::days(10), 3);
        let other_scope = boost(QuotaScope::Cycle, 40, now - Duration::days(1), 7);
        let mut disabled = boost(QuotaScope::Daily, 7, now - Duration::days(1), 7);
        disabled.active = false;

        let boosts = [live, expired, other_scope, disabled];
        let limits = effective_limits(&settings, &account, &boosts, now);
        assert_eq!(limits.daily, 15);
        assert_eq!(limits.cycle, 160);
    }

    #[test]
    fn boost_stops_at_valid_to() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let settings = settings();
        let account = account(None);
        let boosts = [boost(QuotaScope::Daily, 5, start, 1)];

        let inside = start + Duration::hours(23);
        let at_end = start + Duration::days(1);
        assert_eq!(
            effective_limit(&settings, &account, &boosts, QuotaScope::Daily, inside),
            15
        );
        assert_eq!(
            effective_limit(&settings, &account, &boosts, QuotaScope::Daily, at_end),
            10
        );
    }
}
