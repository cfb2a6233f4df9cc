//! In-process store.
//!
//! Used for local development (`STORE_BACKEND=memory`) and tests. Each trait
//! call takes the single state lock for its whole duration and validates every
//! condition before writing anything, so multi-write operations are
//! all-or-nothing in the same way a SQL transaction is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    AccessRedemption, BoostRedemption, BoostWrite, KeyDeletion, Store, StoreError, StoreResult,
};
use crate::middleware::auth::hash_api_key;
use crate::models::{
    account::Account,
    api_key::AdminApiKey,
    key::{AccessKey, BoostKey, KeyKind, KeyRedemption, RedemptionOperation},
    quota::{
        LedgerOutcome, NewLedgerEntry, QuotaLedgerEntry, QuotaScope, QuotaSettingsOverride,
        TemporaryBoost,
    },
};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    access_keys: HashMap<Uuid, AccessKey>,
    access_codes: HashMap<String, Uuid>,
    boost_keys: HashMap<Uuid, BoostKey>,
    boost_codes: HashMap<String, Uuid>,
    temporary_boosts: HashMap<Uuid, TemporaryBoost>,
    ledger: Vec<QuotaLedgerEntry>,
    redemptions: Vec<KeyRedemption>,
    settings: Option<QuotaSettingsOverride>,
    admin_keys: HashMap<String, AdminApiKey>,
}

/// Mutex-guarded maps implementing [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed or replace an account row.
    pub fn put_account(&self, account: Account) {
        self.state().accounts.insert(account.id, account);
    }

    /// Seed an admin key by its SHA-256 hex hash.
    pub fn put_admin_key(&self, key: AdminApiKey) {
        self.state().admin_keys.insert(key.key_hash.clone(), key);
    }

    /// Register a raw admin key, stored by its hash like the postgres
    /// `admin_api_keys` rows.
    pub fn seed_admin_key(&self, raw_key: &str, label: &str, now: DateTime<Utc>) -> AdminApiKey {
        let key = AdminApiKey {
            id: Uuid::new_v4(),
            key_hash: hash_api_key(raw_key),
            label: label.to_string(),
            created_at: now,
            is_active: true,
        };
        self.put_admin_key(key.clone());
        key
    }

    /// Replace the runtime settings override row.
    pub fn put_quota_settings(&self, settings: Option<QuotaSettingsOverride>) {
        self.state().settings = settings;
    }

    pub fn access_key(&self, key_id: Uuid) -> Option<AccessKey> {
        self.state().access_keys.get(&key_id).cloned()
    }

    pub fn boost_key(&self, key_id: Uuid) -> Option<BoostKey> {
        self.state().boost_keys.get(&key_id).cloned()
    }

    pub fn ledger(&self) -> Vec<QuotaLedgerEntry> {
        self.state().ledger.clone()
    }

    pub fn temporary_boosts(&self, account_id: Uuid) -> Vec<TemporaryBoost> {
        self.state()
            .temporary_boosts
            .values()
            .filter(|b| b.account_id == account_id)
            .cloned()
            .collect()
    }
}

fn new_redemption(
    account_id: Uuid,
    key_id: Uuid,
    key_kind: KeyKind,
    operation: RedemptionOperation,
    at: DateTime<Utc>,
) -> KeyRedemption {
    KeyRedemption {
        id: Uuid::new_v4(),
        account_id,
        key_id,
        key_kind,
        operation,
        created_at: at,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn find_account(&self, id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.state().accounts.get(&id).cloned())
    }

    async fn create_account(
        &self,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Account> {
        let account = Account {
            id: Uuid::new_v4(),
            display_name,
            expires_at: None,
            base_daily_limit: None,
            base_cycle_limit: None,
            current_session_id: None,
            last_active_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state().accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn override_expiry(
        &self,
        account_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let mut state = self.state();
        Ok(state.accounts.get_mut(&account_id).map(|account| {
            account.expires_at = expires_at;
            account.updated_at = now;
            account.clone()
        }))
    }

    async fn set_base_limits(
        &self,
        account_id: Uuid,
        daily: Option<i32>,
        cycle: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let mut state = self.state();
        Ok(state.accounts.get_mut(&account_id).map(|account| {
            account.base_daily_limit = daily;
            account.base_cycle_limit = cycle;
            account.updated_at = now;
            account.clone()
        }))
    }

    async fn find_access_key(&self, code: &str) -> StoreResult<Option<AccessKey>> {
        let state = self.state();
        Ok(state
            .access_codes
            .get(code)
            .and_then(|id| state.access_keys.get(id))
            .cloned())
    }

    async fn find_boost_key(&self, code: &str) -> StoreResult<Option<BoostKey>> {
        let state = self.state();
        Ok(state
            .boost_codes
            .get(code)
            .and_then(|id| state.boost_keys.get(id))
            .cloned())
    }

    async fn insert_access_keys(&self, keys: &[AccessKey]) -> StoreResult<()> {
        let mut state = self.state();
        let mut batch_codes = std::collections::HashSet::new();
        for key in keys {
            if state.access_codes.contains_key(&key.code) || !batch_codes.insert(&key.code) {
                return Err(StoreError::Conflict);
            }
        }
        for key in keys {
            state.access_codes.insert(key.code.clone(), key.id);
            state.access_keys.insert(key.id, key.clone());
        }
        Ok(())
    }

    async fn insert_boost_keys(&self, keys: &[BoostKey]) -> StoreResult<()> {
        let mut state = self.state();
        let mut batch_codes = std::collections::HashSet::new();
        for key in keys {
            if state.boost_codes.contains_key(&key.code) || !batch_codes.insert(&key.code) {
                return Err(StoreError::Conflict);
            }
        }
        for key in keys {
            state.boost_codes.insert(key.code.clone(), key.id);
            state.boost_keys.insert(key.id, key.clone());
        }
        Ok(())
    }

    async fn set_key_active(
        &self,
        kind: KeyKind,
        key_id: Uuid,
        active: bool,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let found = match kind {
            KeyKind::Access => state
                .access_keys
                .get_mut(&key_id)
                .map(|key| key.is_active = active),
            KeyKind::Boost => state
                .boost_keys
                .get_mut(&key_id)
                .map(|key| key.is_active = active),
        };
        Ok(found.is_some())
    }

    async fn delete_unused_key(&self, kind: KeyKind, key_id: Uuid) -> StoreResult<KeyDeletion> {
        let mut state = self.state();
        match kind {
            KeyKind::Access => {
                let Some(key) = state.access_keys.get(&key_id) else {
                    return Ok(KeyDeletion::NotFound);
                };
                if key.used_count > 0 {
                    return Ok(KeyDeletion::InUse);
                }
                let code = key.code.clone();
                state.access_keys.remove(&key_id);
                state.access_codes.remove(&code);
            }
            KeyKind::Boost => {
                let Some(key) = state.boost_keys.get(&key_id) else {
                    return Ok(KeyDeletion::NotFound);
                };
                if key.used_count > 0 {
                    return Ok(KeyDeletion::InUse);
                }
                let code = key.code.clone();
                state.boost_keys.remove(&key_id);
                state.boost_codes.remove(&code);
            }
        }
        Ok(KeyDeletion::Deleted)
    }

    async fn commit_access_redemption(&self, plan: &AccessRedemption) -> StoreResult<()> {
        let mut state = self.state();

        let key_ok = state.access_keys.get(&plan.key_id).is_some_and(|key| {
            key.is_active && key.used_count == plan.expected_used_count
        });
        let account_ok = state
            .accounts
            .get(&plan.account_id)
            .is_some_and(|account| account.expires_at == plan.expected_expires_at);
        if !key_ok || !account_ok {
            return Err(StoreError::Conflict);
        }

        if let Some(key) = state.access_keys.get_mut(&plan.key_id) {
            key.used_count += 1;
            if key.redeemed_by_account_id.is_none() {
                key.redeemed_by_account_id = Some(plan.account_id);
            }
            key.redeemed_at = Some(plan.redeemed_at);
        }
        if let Some(account) = state.accounts.get_mut(&plan.account_id) {
            account.expires_at = Some(plan.new_expires_at);
            account.updated_at = plan.redeemed_at;
        }
        state.redemptions.push(new_redemption(
            plan.account_id,
            plan.key_id,
            KeyKind::Access,
            plan.operation,
            plan.redeemed_at,
        ));
        Ok(())
    }

    async fn commit_boost_redemption(&self, plan: &BoostRedemption) -> StoreResult<()> {
        let mut state = self.state();

        let key_ok = state.boost_keys.get(&plan.key_id).is_some_and(|key| {
            key.is_active
                && key.used_count == plan.expected_used_count
                && key.redeemed_by_account_id.is_none()
        });
        let account_ok = match (&plan.write, state.accounts.get(&plan.account_id)) {
            (_, None) => false,
            (
                BoostWrite::RaiseBaseLimit {
                    scope, expected, ..
                },
                Some(account),
            ) => account.base_limit(*scope) == *expected,
            (BoostWrite::Temporary(_), Some(_)) => true,
        };
        if !key_ok || !account_ok {
            return Err(StoreError::Conflict);
        }

        if let Some(key) = state.boost_keys.get_mut(&plan.key_id) {
            key.used_count += 1;
            if plan.record_redeemer {
                key.redeemed_by_account_id = Some(plan.account_id);
            }
            key.redeemed_at = Some(plan.redeemed_at);
        }
        match &plan.write {
            BoostWrite::RaiseBaseLimit {
                scope, new_limit, ..
            } => {
                if let Some(account) = state.accounts.get_mut(&plan.account_id) {
                    match scope {
                        QuotaScope::Daily => account.base_daily_limit = Some(*new_limit),
                        QuotaScope::Cycle => account.base_cycle_limit = Some(*new_limit),
                    }
                    account.updated_at = plan.redeemed_at;
                }
            }
            BoostWrite::Temporary(boost) => {
                state.temporary_boosts.insert(boost.id, boost.clone());
            }
        }
        state.redemptions.push(new_redemption(
            plan.account_id,
            plan.key_id,
            KeyKind::Boost,
            RedemptionOperation::Boost,
            plan.redeemed_at,
        ));
        Ok(())
    }

    async fn list_redemptions(&self, account_id: Uuid) -> StoreResult<Vec<KeyRedemption>> {
        let mut rows: Vec<KeyRedemption> = self
            .state()
            .redemptions
            .iter()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn count_successes(
        &self,
        account_id: Uuid,
        feature: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let count = self
            .state()
            .ledger
            .iter()
            .filter(|e| {
                e.account_id == account_id
                    && e.feature == feature
                    && e.outcome == LedgerOutcome::Success
                    && from <= e.created_at
                    && e.created_at < to
            })
            .count();
        Ok(count as i64)
    }

    async fn append_ledger(&self, entry: &NewLedgerEntry) -> StoreResult<()> {
        let mut state = self.state();
        let id = state.ledger.len() as i64 + 1;
        state.ledger.push(QuotaLedgerEntry {
            id,
            account_id: entry.account_id,
            feature: entry.feature.clone(),
            outcome: entry.outcome,
            created_at: entry.created_at,
        });
        Ok(())
    }

    async fn effective_temporary_boosts(
        &self,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<TemporaryBoost>> {
        let mut boosts: Vec<TemporaryBoost> = self
            .state()
            .temporary_boosts
            .values()
            .filter(|b| b.account_id == account_id && b.is_effective(at))
            .cloned()
            .collect();
        boosts.sort_by(|a, b| a.valid_to.cmp(&b.valid_to));
        Ok(boosts)
    }

    async fn set_temporary_boost_active(&self, boost_id: Uuid, active: bool) -> StoreResult<bool> {
        Ok(self
            .state()
            .temporary_boosts
            .get_mut(&boost_id)
            .map(|boost| boost.active = active)
            .is_some())
    }

    async fn load_quota_settings(&self) -> StoreResult<Option<QuotaSettingsOverride>> {
        Ok(self.state().settings.clone())
    }

    async fn swap_session(
        &self,
        account_id: Uuid,
        expected: Option<&str>,
        new: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let Some(account) = state.accounts.get_mut(&account_id) else {
            return Ok(false);
        };
        if account.current_session_id.as_deref() != expected {
            return Ok(false);
        }
        account.current_session_id = Some(new.to_string());
        account.last_active_at = Some(now);
        account.updated_at = now;
        Ok(true)
    }

    async fn touch_session(
        &self,
        account_id: Uuid,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        match state.accounts.get_mut(&account_id) {
            Some(account) if account.current_session_id.as_deref() == Some(session_id) => {
                account.last_active_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_admin_key(&self, key_hash: &str) -> StoreResult<Option<AdminApiKey>> {
        Ok(self
            .state()
            .admin_keys
            .get(key_hash)
            .filter(|key| key.is_active)
            .cloned())
    }
}
