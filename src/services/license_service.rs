//! License lifecycle: access-key and boost-key redemption.
//!
//! A redemption reads the key and the account, decides, and then hands the
//! store one conditional write that carries the values it read. If anything
//! changed in between, the write is refused and the whole redemption re-runs
//! from the key lookup. A second redemption of a consumed single-use key
//! therefore always ends in `KeyAlreadyUsed`, never in a second grant.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::account::{Account, LicenseStatus};
use crate::models::key::{
    AccessGrant, BoostEffect, BoostGrant, EffectiveLimits, KeyGate, RedemptionOperation,
    normalize_code,
};
use crate::models::quota::{QuotaScope, TemporaryBoost};
use crate::services::account_service::AccountDirectory;
use crate::services::quota_service::{QuotaEngine, effective_limits};
use crate::services::retry::RetryPolicy;
use crate::services::settings::QuotaSettingsProvider;
use crate::store::{AccessRedemption, BoostRedemption, BoostWrite, Store, StoreError};

/// Terminal-unredeemable checks, in fixed order.
///
/// 1. disabled → `KeyDisabled`
/// 2. `used_count > max_uses` → `Internal` (impossible state)
/// 3. uses exhausted → `KeyAlreadyUsed` for single-use keys, `KeyExhausted`
///    otherwise
/// 4. `now > activation_deadline` → `KeyExpiredForActivation`
/// 5. redeemer already recorded → `KeyAlreadyUsed`
pub fn check_redeemable(gate: &KeyGate, now: DateTime<Utc>) -> Result<(), AppError> {
    if !gate.is_active {
        return Err(AppError::KeyDisabled);
    }
    if let Some(max_uses) = gate.max_uses {
        if gate.used_count > max_uses {
            tracing::error!(
                used_count = gate.used_count,
                max_uses,
                "data integrity: key used more often than allowed"
            );
            return Err(AppError::Internal(format!(
                "key used_count {} exceeds max_uses {}",
                gate.used_count, max_uses
            )));
        }
        if gate.used_count >= max_uses {
            return Err(if gate.is_single_use() {
                AppError::KeyAlreadyUsed
            } else {
                AppError::KeyExhausted
            });
        }
    }
    if gate.activation_deadline.is_some_and(|deadline| now > deadline) {
        return Err(AppError::KeyExpiredForActivation);
    }
    if gate.consumed {
        return Err(AppError::KeyAlreadyUsed);
    }
    Ok(())
}

/// New expiration after granting `grant`: remaining validity is kept and
/// the grant is appended to it; a lapsed or missing expiration restarts from
/// `now`.
///
/// An expiration pushed past the representable range is `Internal`.
pub fn extend_expiration(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grant: Duration,
) -> Result<DateTime<Utc>, AppError> {
    let base = current.map_or(now, |expires_at| expires_at.max(now));
    base.checked_add_signed(grant).ok_or_else(|| {
        AppError::Internal(format!("expiration {base} plus {grant} is out of range"))
    })
}

/// Outcome of one redemption attempt.
enum Attempt<T> {
    Done(T),
    /// The conditional write lost a race; re-read and try again
    Lost,
}

pub struct LicenseManager {
    store: Arc<dyn Store>,
    accounts: Arc<AccountDirectory>,
    settings: Arc<QuotaSettingsProvider>,
    quota: Arc<QuotaEngine>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl LicenseManager {
    pub fn new(
        store: Arc<dyn Store>,
        accounts: Arc<AccountDirectory>,
        settings: Arc<QuotaSettingsProvider>,
        quota: Arc<QuotaEngine>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            accounts,
            settings,
            quota,
            clock,
            retry,
        }
    }

    /// Redeem an access key, extending the account's membership.
    ///
    /// # Arguments
    ///
    /// * `account_id` - Account receiving the grant
    /// * `raw_code` - Code as typed by the user (trimmed and uppercased here)
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a malformed code (before any store access),
    /// `KeyNotFound`, `KeyDisabled`, `KeyExhausted`,
    /// `KeyExpiredForActivation`, `KeyAlreadyUsed`, `AccountNotFound`, and
    /// `PersistenceConflict` when every attempt lost its race or timed out.
    pub async fn redeem(&self, account_id: Uuid, raw_code: &str) -> Result<AccessGrant, AppError> {
        let code = normalize_code(raw_code).map_err(AppError::InvalidRequest)?;

        let mut attempt = 0;
        loop {
            match self.try_redeem(account_id, &code).await? {
                Attempt::Done(grant) => return Ok(grant),
                Attempt::Lost => {
                    tracing::warn!(%account_id, %code, attempt, "access key redemption lost a race");
                    if !self.retry.pause(attempt).await {
                        return Err(AppError::PersistenceConflict);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn try_redeem(
        &self,
        account_id: Uuid,
        code: &str,
    ) -> Result<Attempt<AccessGrant>, AppError> {
        let now = self.clock.now_utc();

        let key = self
            .retry
            .read("find_access_key", || self.store.find_access_key(code))
            .await?
            .ok_or(AppError::KeyNotFound)?;
        check_redeemable(&key.gate(), now)?;

        let grant = key.grant_duration();
        if grant <= Duration::zero() {
            return Err(AppError::Internal(format!(
                "access key {} grants a non-positive duration",
                key.id
            )));
        }

        // The conditional write compares against this read, so it must not
        // come from the cache.
        let account = self.accounts.fresh(account_id).await?;
        let new_expires_at = extend_expiration(account.expires_at, now, grant)?;
        let operation = if account.expires_at.is_none() {
            RedemptionOperation::Signup
        } else {
            RedemptionOperation::Renew
        };

        let plan = AccessRedemption {
            key_id: key.id,
            expected_used_count: key.used_count,
            account_id,
            expected_expires_at: account.expires_at,
            new_expires_at,
            operation,
            redeemed_at: now,
        };
        let result = self.store.commit_access_redemption(&plan).await;
        self.accounts.invalidate(account_id);

        match result {
            Ok(()) => {
                tracing::info!(
                    %account_id,
                    key_id = %key.id,
                    operation = operation.as_str(),
                    %new_expires_at,
                    "access key redeemed"
                );
                Ok(Attempt::Done(AccessGrant {
                    new_expires_at,
                    operation,
                }))
            }
            Err(StoreError::Conflict) => Ok(Attempt::Lost),
            Err(e) => Err(e.into()),
        }
    }

    /// Redeem a boost key, raising a quota limit permanently or temporarily.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`LicenseManager::redeem`].
    pub async fn redeem_boost(
        &self,
        account_id: Uuid,
        raw_code: &str,
    ) -> Result<BoostGrant, AppError> {
        let code = normalize_code(raw_code).map_err(AppError::InvalidRequest)?;

        let mut attempt = 0;
        loop {
            match self.try_redeem_boost(account_id, &code).await? {
                Attempt::Done(grant) => return Ok(grant),
                Attempt::Lost => {
                    tracing::warn!(%account_id, %code, attempt, "boost key redemption lost a race");
                    if !self.retry.pause(attempt).await {
                        return Err(AppError::PersistenceConflict);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn try_redeem_boost(
        &self,
        account_id: Uuid,
        code: &str,
    ) -> Result<Attempt<BoostGrant>, AppError> {
        let now = self.clock.now_utc();

        let key = self
            .retry
            .read("find_boost_key", || self.store.find_boost_key(code))
            .await?
            .ok_or(AppError::KeyNotFound)?;
        let gate = key.gate();
        check_redeemable(&gate, now)?;
        let effect = key.effect().map_err(AppError::Internal)?;
        if effect.amount() <= 0 {
            return Err(AppError::Internal(format!(
                "boost key {} has non-positive amount {}",
                key.id,
                effect.amount()
            )));
        }

        let account = self.accounts.fresh(account_id).await?;

        let (write, valid_to) = match effect {
            BoostEffect::Permanent { scope, amount } => {
                let settings = self.settings.current().await?;
                let current = account.base_limit(scope);
                let base = current.map_or_else(|| settings.default_limit(scope), i64::from);
                let new_limit = i32::try_from(base.saturating_add(i64::from(amount)))
                    .map_err(|_| {
                        AppError::Internal(format!("base {} limit overflow", scope.as_str()))
                    })?;
                (
                    BoostWrite::RaiseBaseLimit {
                        scope,
                        expected: current,
                        new_limit,
                    },
                    None,
                )
            }
            BoostEffect::Temporary {
                scope,
                amount,
                duration,
            } => {
                let valid_to = now.checked_add_signed(duration).ok_or_else(|| {
                    AppError::Internal(format!(
                        "boost key {} lasts beyond the representable range",
                        key.id
                    ))
                })?;
                let boost = TemporaryBoost {
                    id: Uuid::new_v4(),
                    account_id,
                    scope,
                    amount,
                    valid_from: now,
                    valid_to,
                    active: true,
                    source_key_id: key.id,
                    created_at: now,
                };
                (BoostWrite::Temporary(boost), Some(valid_to))
            }
        };

        let plan = BoostRedemption {
            key_id: key.id,
            expected_used_count: key.used_count,
            account_id,
            record_redeemer: gate.is_single_use(),
            write,
            redeemed_at: now,
        };
        let result = self.store.commit_boost_redemption(&plan).await;
        self.accounts.invalidate(account_id);

        match result {
            Ok(()) => {}
            Err(StoreError::Conflict) => return Ok(Attempt::Lost),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            %account_id,
            key_id = %key.id,
            scope = effect.scope().as_str(),
            amount = effect.amount(),
            temporary = valid_to.is_some(),
            "boost key redeemed"
        );

        let new_limits = self.limits_after(&account, &plan.write).await;
        Ok(Attempt::Done(BoostGrant {
            scope: effect.scope(),
            amount: effect.amount(),
            temporary: valid_to.is_some(),
            valid_to,
            new_limits,
        }))
    }

    /// Limits after a committed boost.
    ///
    /// The boost is already durable at this point, so a failed read is not
    /// reported as a failed redemption; the limits are then computed from
    /// what was just written.
    async fn limits_after(&self, before: &Account, write: &BoostWrite) -> EffectiveLimits {
        let mut account = before.clone();
        if let BoostWrite::RaiseBaseLimit {
            scope, new_limit, ..
        } = write
        {
            match scope {
                QuotaScope::Daily => account.base_daily_limit = Some(*new_limit),
                QuotaScope::Cycle => account.base_cycle_limit = Some(*new_limit),
            }
        }

        match self.quota.limits_for(&account).await {
            Ok(limits) => limits,
            Err(e) => {
                tracing::warn!(
                    account_id = %account.id,
                    error = %e,
                    "could not read limits after boost; reporting an estimate"
                );
                let now = self.clock.now_utc();
                let settings = match self.settings.current().await {
                    Ok(settings) => settings,
                    Err(_) => self.settings.base(),
                };
                let boosts: Vec<TemporaryBoost> = match write {
                    BoostWrite::Temporary(boost) => vec![boost.clone()],
                    BoostWrite::RaiseBaseLimit { .. } => Vec::new(),
                };
                effective_limits(&settings, &account, &boosts, now)
            }
        }
    }

    /// Membership status at the current instant.
    pub async fn status(&self, account_id: Uuid) -> Result<LicenseStatus, AppError> {
        let account = self.accounts.get(account_id).await?;
        Ok(LicenseStatus::evaluate(&account, self.clock.now_utc()))
    }
}
