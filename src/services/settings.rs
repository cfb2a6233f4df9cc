//! Effective system-wide quota settings.
//!
//! Environment values form the base; the optional `system_settings` row
//! overrides individual fields. The merged result is cached for minutes at a
//! time since it changes rarely and is read on every quota check.

use std::sync::Arc;

use crate::cache::TtlCache;
use crate::error::AppError;
use crate::models::quota::QuotaSettings;
use crate::services::retry::RetryPolicy;
use crate::store::Store;

pub struct QuotaSettingsProvider {
    store: Arc<dyn Store>,
    base: QuotaSettings,
    cache: TtlCache<(), QuotaSettings>,
    retry: RetryPolicy,
}

impl QuotaSettingsProvider {
    pub fn new(
        store: Arc<dyn Store>,
        base: QuotaSettings,
        cache: TtlCache<(), QuotaSettings>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            base,
            cache,
            retry,
        }
    }

    /// Current settings. Inconsistent stored bounds are a fatal error.
    pub async fn current(&self) -> Result<QuotaSettings, AppError> {
        if let Some(settings) = self.cache.get(&()) {
            return Ok(settings);
        }

        let row = self
            .retry
            .read("load_quota_settings", || self.store.load_quota_settings())
            .await?;
        let settings = row.map_or(self.base, |row| row.apply(self.base));

        if let Err(detail) = settings.validate() {
            tracing::error!(%detail, "stored quota settings are inconsistent");
            return Err(AppError::Internal(format!("quota settings: {detail}")));
        }

        self.cache.put((), settings);
        Ok(settings)
    }

    /// Environment-level settings, without the stored override.
    pub fn base(&self) -> QuotaSettings {
        self.base
    }

    /// Forget the cached settings so the next read goes to the store.
    pub fn invalidate(&self) {
        self.cache.invalidate(&());
    }
}
