//! Administrative key management.
//!
//! Keys are created in batches with random codes of the form
//! `PREFIX-<tag>-XXXXXXXX`. The random part uses an alphabet without the
//! easily confused `0 O 1 I`, so codes survive being read aloud or retyped.
//! A batch is inserted atomically; if any code is already taken the whole
//! batch is regenerated.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::key::{
    AccessKey, BoostKey, GenerateAccessKeysRequest, GenerateBoostKeysRequest, KeyKind,
    KeyRedemption,
};
use crate::services::retry::RetryPolicy;
use crate::store::{KeyDeletion, Store, StoreError};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const RANDOM_PART_LEN: usize = 8;

/// Largest batch accepted in one request.
pub const MAX_BATCH: u32 = 500;

/// Longest grant an access key may carry (ten years).
const MAX_GRANT_HOURS: f64 = 24.0 * 3650.0;

/// Longest window a temporary boost may cover (ten years).
pub const MAX_TEMPORARY_DAYS: i32 = 3650;

const DEFAULT_ACCESS_PREFIX: &str = "AK";
const DEFAULT_BOOST_PREFIX: &str = "BK";

/// Regeneration rounds before a batch gives up on collisions.
const MAX_GENERATION_ROUNDS: u32 = 5;

fn random_part(rng: &mut impl Rng) -> String {
    (0..RANDOM_PART_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Build `count` distinct codes sharing `prefix` and `tag`.
fn generate_codes(prefix: &str, tag: &str, count: usize) -> Vec<String> {
    let mut rng = rand::rng();
    let mut codes = Vec::with_capacity(count);
    while codes.len() < count {
        let code = format!("{prefix}-{tag}-{}", random_part(&mut rng));
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

fn validate_prefix(prefix: Option<&str>, default: &str) -> Result<String, AppError> {
    let prefix = prefix.map_or(default.to_string(), |p| p.trim().to_ascii_uppercase());
    if prefix.is_empty()
        || prefix.len() > 8
        || !prefix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(AppError::InvalidRequest(
            "prefix must be 1-8 letters or digits".to_string(),
        ));
    }
    Ok(prefix)
}

fn validate_count(count: u32) -> Result<usize, AppError> {
    if count == 0 || count > MAX_BATCH {
        return Err(AppError::InvalidRequest(format!(
            "count must be between 1 and {MAX_BATCH}"
        )));
    }
    Ok(count as usize)
}

fn validate_max_uses(max_uses: Option<i32>) -> Result<(), AppError> {
    if max_uses.is_some_and(|n| n < 1) {
        return Err(AppError::InvalidRequest(
            "max_uses must be at least 1 (or null for unlimited)".to_string(),
        ));
    }
    Ok(())
}

fn validate_deadline(
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if deadline.is_some_and(|d| d <= now) {
        return Err(AppError::InvalidRequest(
            "activation_deadline must be in the future".to_string(),
        ));
    }
    Ok(())
}

/// Code tag for a grant: whole days when the grant is a multiple of 24h,
/// hours otherwise (`30`, `12H`).
fn grant_tag(hours: f64) -> String {
    if hours >= 24.0 && (hours % 24.0).abs() < f64::EPSILON {
        format!("{}", (hours / 24.0) as i64)
    } else {
        format!("{}H", hours.ceil() as i64)
    }
}

pub struct KeyAdmin {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl KeyAdmin {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Create a batch of access keys.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for out-of-range parameters; `PersistenceConflict`
    /// if every regeneration round collided with existing codes.
    pub async fn generate_access_keys(
        &self,
        req: GenerateAccessKeysRequest,
    ) -> Result<Vec<AccessKey>, AppError> {
        let count = validate_count(req.count)?;
        let now = self.clock.now_utc();
        let hours = req.grant_duration_hours;
        if !hours.is_finite() || hours <= 0.0 || hours > MAX_GRANT_HOURS {
            return Err(AppError::InvalidRequest(format!(
                "grant_duration_hours must be in (0, {MAX_GRANT_HOURS}]"
            )));
        }
        validate_max_uses(req.max_uses)?;
        validate_deadline(req.activation_deadline, now)?;
        let prefix = validate_prefix(req.prefix.as_deref(), DEFAULT_ACCESS_PREFIX)?;
        let tag = grant_tag(hours);

        for round in 0..MAX_GENERATION_ROUNDS {
            let keys: Vec<AccessKey> = generate_codes(&prefix, &tag, count)
                .into_iter()
                .map(|code| AccessKey {
                    id: Uuid::new_v4(),
                    code,
                    is_active: true,
                    max_uses: req.max_uses,
                    used_count: 0,
                    activation_deadline: req.activation_deadline,
                    grant_duration_hours: hours,
                    redeemed_by_account_id: None,
                    redeemed_at: None,
                    created_at: now,
                })
                .collect();

            match self.store.insert_access_keys(&keys).await {
                Ok(()) => {
                    tracing::info!(count, %prefix, grant_hours = hours, "access keys generated");
                    return Ok(keys);
                }
                Err(StoreError::Conflict) => {
                    tracing::warn!(round, "generated access key code collided; regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::PersistenceConflict)
    }

    /// Create a batch of boost keys.
    pub async fn generate_boost_keys(
        &self,
        req: GenerateBoostKeysRequest,
    ) -> Result<Vec<BoostKey>, AppError> {
        let count = validate_count(req.count)?;
        let now = self.clock.now_utc();
        if req.amount <= 0 {
            return Err(AppError::InvalidRequest(
                "amount must be positive".to_string(),
            ));
        }
        let duration_days = if req.temporary {
            match req.temporary_duration_days {
                Some(days) if days > 0 && days <= MAX_TEMPORARY_DAYS => Some(days),
                _ => {
                    return Err(AppError::InvalidRequest(format!(
                        "temporary boosts need temporary_duration_days in 1..={MAX_TEMPORARY_DAYS}"
                    )));
                }
            }
        } else {
            None
        };
        validate_max_uses(req.max_uses)?;
        validate_deadline(req.activation_deadline, now)?;
        let prefix = validate_prefix(req.prefix.as_deref(), DEFAULT_BOOST_PREFIX)?;
        let tag = duration_days.map_or_else(|| "P".to_string(), |days| days.to_string());

        for round in 0..MAX_GENERATION_ROUNDS {
            let keys: Vec<BoostKey> = generate_codes(&prefix, &tag, count)
                .into_iter()
                .map(|code| BoostKey {
                    id: Uuid::new_v4(),
                    code,
                    is_active: true,
                    max_uses: req.max_uses,
                    used_count: 0,
                    activation_deadline: req.activation_deadline,
                    scope: req.scope,
                    amount: req.amount,
                    is_temporary: req.temporary,
                    temporary_duration_days: duration_days,
                    redeemed_by_account_id: None,
                    redeemed_at: None,
                    created_at: now,
                })
                .collect();

            match self.store.insert_boost_keys(&keys).await {
                Ok(()) => {
                    tracing::info!(
                        count,
                        %prefix,
                        scope = req.scope.as_str(),
                        amount = req.amount,
                        temporary = req.temporary,
                        "boost keys generated"
                    );
                    return Ok(keys);
                }
                Err(StoreError::Conflict) => {
                    tracing::warn!(round, "generated boost key code collided; regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::PersistenceConflict)
    }

    /// Administrative enable/disable.
    pub async fn set_active(&self, kind: KeyKind, key_id: Uuid, active: bool) -> Result<(), AppError> {
        if !self.store.set_key_active(kind, key_id, active).await? {
            return Err(AppError::KeyNotFound);
        }
        tracing::info!(%kind, %key_id, active, "key active flag set by admin");
        Ok(())
    }

    /// Physical delete of a never-redeemed key.
    ///
    /// # Errors
    ///
    /// `KeyInUse` once the key has been redeemed at least once; such keys can
    /// only be disabled.
    pub async fn delete(&self, kind: KeyKind, key_id: Uuid) -> Result<(), AppError> {
        match self.store.delete_unused_key(kind, key_id).await? {
            KeyDeletion::Deleted => {
                tracing::info!(%kind, %key_id, "key deleted by admin");
                Ok(())
            }
            KeyDeletion::NotFound => Err(AppError::KeyNotFound),
            KeyDeletion::InUse => {
                tracing::warn!(%kind, %key_id, "refused to delete a redeemed key");
                Err(AppError::KeyInUse)
            }
        }
    }

    /// Force-disable a temporary boost before its window ends.
    pub async fn disable_temporary_boost(&self, boost_id: Uuid) -> Result<(), AppError> {
        if !self.store.set_temporary_boost_active(boost_id, false).await? {
            return Err(AppError::BoostNotFound);
        }
        tracing::info!(%boost_id, "temporary boost disabled by admin");
        Ok(())
    }

    /// Redemption audit trail for one account, newest first.
    pub async fn redemptions(&self, account_id: Uuid) -> Result<Vec<KeyRedemption>, AppError> {
        Ok(self
            .retry
            .read("list_redemptions", || self.store.list_redemptions(account_id))
            .await?)
    }
}
