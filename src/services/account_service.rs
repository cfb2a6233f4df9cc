//! Account reads and administrative account mutations.
//!
//! All engines read accounts through [`AccountDirectory`], which fronts the
//! store with the short-TTL account cache. Any code that writes an account
//! row must call [`AccountDirectory::invalidate`] before returning.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::error::AppError;
use crate::models::account::Account;
use crate::services::retry::RetryPolicy;
use crate::store::Store;

pub struct AccountDirectory {
    store: Arc<dyn Store>,
    cache: TtlCache<Uuid, Account>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl AccountDirectory {
    pub fn new(
        store: Arc<dyn Store>,
        cache: TtlCache<Uuid, Account>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            retry,
        }
    }

    /// Read-through lookup.
    pub async fn get(&self, account_id: Uuid) -> Result<Account, AppError> {
        if let Some(account) = self.cache.get(&account_id) {
            return Ok(account);
        }
        self.fresh(account_id).await
    }

    /// Bypass the cache and repopulate it.
    pub async fn fresh(&self, account_id: Uuid) -> Result<Account, AppError> {
        let account = self
            .retry
            .read("find_account", || self.store.find_account(account_id))
            .await?
            .ok_or(AppError::AccountNotFound)?;
        self.cache.put(account_id, account.clone());
        Ok(account)
    }

    /// Drop the cached copy. Called synchronously by every account mutator.
    pub fn invalidate(&self, account_id: Uuid) {
        self.cache.invalidate(&account_id);
    }

    /// Provision an account record.
    pub async fn create(&self, display_name: Option<String>) -> Result<Account, AppError> {
        let display_name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        if display_name.as_ref().is_some_and(|name| name.len() > 128) {
            return Err(AppError::InvalidRequest(
                "display_name exceeds 128 characters".to_string(),
            ));
        }

        let account = self
            .store
            .create_account(display_name, self.clock.now_utc())
            .await?;
        tracing::info!(account_id = %account.id, "account created");
        Ok(account)
    }

    /// Administrative expiry override. The one path that may shorten
    /// validity.
    pub async fn override_expiry(
        &self,
        account_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Account, AppError> {
        let result = self
            .store
            .override_expiry(account_id, expires_at, self.clock.now_utc())
            .await;
        self.invalidate(account_id);

        let account = result?.ok_or(AppError::AccountNotFound)?;
        tracing::info!(%account_id, ?expires_at, "account expiry overridden by admin");
        Ok(account)
    }

    /// Per-account quota overrides; `None` restores the system default.
    pub async fn set_base_limits(
        &self,
        account_id: Uuid,
        daily: Option<i32>,
        cycle: Option<i32>,
    ) -> Result<Account, AppError> {
        for (name, value) in [("daily_limit", daily), ("cycle_limit", cycle)] {
            if value.is_some_and(|v| v < 0) {
                return Err(AppError::InvalidRequest(format!(
                    "{name} cannot be negative"
                )));
            }
        }

        let result = self
            .store
            .set_base_limits(account_id, daily, cycle, self.clock.now_utc())
            .await;
        self.invalidate(account_id);

        let account = result?.ok_or(AppError::AccountNotFound)?;
        tracing::info!(%account_id, ?daily, ?cycle, "account base limits set by admin");
        Ok(account)
    }
}
