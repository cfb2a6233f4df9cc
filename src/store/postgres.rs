//! PostgreSQL store.
//!
//! Every mutation runs inside one database transaction whose `UPDATE`s carry
//! the expected prior values in their `WHERE` clause. Zero affected rows means
//! a concurrent writer got there first: the transaction is rolled back and the
//! caller gets [`StoreError::Conflict`]. Each call is bounded by the store
//! timeout; dropping a timed-out transaction rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::{
    AccessRedemption, BoostRedemption, BoostWrite, KeyDeletion, Store, StoreError, StoreResult,
    with_deadline,
};
use crate::db::DbPool;
use crate::models::{
    account::Account,
    api_key::AdminApiKey,
    key::{AccessKey, BoostKey, KeyKind, KeyRedemption, RedemptionOperation},
    quota::{NewLedgerEntry, QuotaScope, QuotaSettingsOverride, TemporaryBoost},
};

const ACCOUNT_COLUMNS: &str = "id, display_name, expires_at, base_daily_limit, base_cycle_limit, \
     current_session_id, last_active_at, created_at, updated_at";

const ACCESS_KEY_COLUMNS: &str = "id, code, is_active, max_uses, used_count, activation_deadline, \
     grant_duration_hours, redeemed_by_account_id, redeemed_at, created_at";

const BOOST_KEY_COLUMNS: &str = "id, code, is_active, max_uses, used_count, activation_deadline, \
     scope, amount, is_temporary, temporary_duration_days, redeemed_by_account_id, redeemed_at, \
     created_at";

const TEMPORARY_BOOST_COLUMNS: &str =
    "id, account_id, scope, amount, valid_from, valid_to, active, source_key_id, created_at";

/// [`Store`] backed by a sqlx PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    timeout: Duration,
}

impl PgStore {
    pub fn new(pool: DbPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

/// A taken unique code is a conflict, anything else a database error.
fn map_unique_violation(err: sqlx::Error) -> StoreError {
    let unique = err
        .as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation());
    if unique {
        StoreError::Conflict
    } else {
        StoreError::Database(err)
    }
}

/// Roll back after a lost conditional write.
///
/// A failed rollback is logged as a data-integrity incident: the connection
/// is discarded (which aborts the transaction server-side), but an operator
/// should confirm no half-applied redemption remains.
async fn abandon(tx: Transaction<'_, Postgres>, operation: &str, key_id: Uuid) -> StoreError {
    if let Err(e) = tx.rollback().await {
        tracing::error!(
            %operation,
            %key_id,
            error = %e,
            "data integrity: rollback failed, manual reconciliation required"
        );
    }
    StoreError::Conflict
}

async fn insert_redemption(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    key_id: Uuid,
    key_kind: KeyKind,
    operation: RedemptionOperation,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO key_redemptions (id, account_id, key_id, key_kind, operation, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(key_id)
    .bind(key_kind.as_str())
    .bind(operation.as_str())
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        with_deadline(self.timeout, async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn find_account(&self, id: Uuid) -> StoreResult<Option<Account>> {
        with_deadline(self.timeout, async {
            let account = sqlx::query_as::<_, Account>(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(account)
        })
        .await
    }

    async fn create_account(
        &self,
        display_name: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Account> {
        with_deadline(self.timeout, async {
            let account = sqlx::query_as::<_, Account>(&format!(
                r#"
                INSERT INTO accounts (id, display_name, created_at, updated_at)
                VALUES ($1, $2, $3, $3)
                RETURNING {ACCOUNT_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(display_name)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            Ok(account)
        })
        .await
    }

    async fn override_expiry(
        &self,
        account_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        with_deadline(self.timeout, async {
            let account = sqlx::query_as::<_, Account>(&format!(
                r#"
                UPDATE accounts
                SET expires_at = $1, updated_at = $2
                WHERE id = $3
                RETURNING {ACCOUNT_COLUMNS}
                "#
            ))
            .bind(expires_at)
            .bind(now)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(account)
        })
        .await
    }

    async fn set_base_limits(
        &self,
        account_id: Uuid,
        daily: Option<i32>,
        cycle: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        with_deadline(self.timeout, async {
            let account = sqlx::query_as::<_, Account>(&format!(
                r#"
                UPDATE accounts
                SET base_daily_limit = $1, base_cycle_limit = $2, updated_at = $3
                WHERE id = $4
                RETURNING {ACCOUNT_COLUMNS}
                "#
            ))
            .bind(daily)
            .bind(cycle)
            .bind(now)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(account)
        })
        .await
    }

    async fn find_access_key(&self, code: &str) -> StoreResult<Option<AccessKey>> {
        with_deadline(self.timeout, async {
            let key = sqlx::query_as::<_, AccessKey>(&format!(
                "SELECT {ACCESS_KEY_COLUMNS} FROM access_keys WHERE code = $1"
            ))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
            Ok(key)
        })
        .await
    }

    async fn find_boost_key(&self, code: &str) -> StoreResult<Option<BoostKey>> {
        with_deadline(self.timeout, async {
            let key = sqlx::query_as::<_, BoostKey>(&format!(
                "SELECT {BOOST_KEY_COLUMNS} FROM boost_keys WHERE code = $1"
            ))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
            Ok(key)
        })
        .await
    }

    async fn insert_access_keys(&self, keys: &[AccessKey]) -> StoreResult<()> {
        with_deadline(self.timeout, async {
            let mut tx = self.pool.begin().await?;
            for key in keys {
                sqlx::query(
                    r#"
                    INSERT INTO access_keys (
                        id, code, is_active, max_uses, used_count, activation_deadline,
                        grant_duration_hours, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(key.id)
                .bind(&key.code)
                .bind(key.is_active)
                .bind(key.max_uses)
                .bind(key.used_count)
                .bind(key.activation_deadline)
                .bind(key.grant_duration_hours)
                .bind(key.created_at)
                .execute(&mut *tx)
                .await
                .map_err(map_unique_violation)?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn insert_boost_keys(&self, keys: &[BoostKey]) -> StoreResult<()> {
        with_deadline(self.timeout, async {
            let mut tx = self.pool.begin().await?;
            for key in keys {
                sqlx::query(
                    r#"
                    INSERT INTO boost_keys (
                        id, code, is_active, max_uses, used_count, activation_deadline,
                        scope, amount, is_temporary, temporary_duration_days, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    "#,
                )
                .bind(key.id)
                .bind(&key.code)
                .bind(key.is_active)
                .bind(key.max_uses)
                .bind(key.used_count)
                .bind(key.activation_deadline)
                .bind(key.scope.as_str())
                .bind(key.amount)
                .bind(key.is_temporary)
                .bind(key.temporary_duration_days)
                .bind(key.created_at)
                .execute(&mut *tx)
                .await
                .map_err(map_unique_violation)?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn set_key_active(
        &self,
        kind: KeyKind,
        key_id: Uuid,
        active: bool,
    ) -> StoreResult<bool> {
        let sql = match kind {
            KeyKind::Access => "UPDATE access_keys SET is_active = $1 WHERE id = $2",
            KeyKind::Boost => "UPDATE boost_keys SET is_active = $1 WHERE id = $2",
        };
        with_deadline(self.timeout, async {
            let updated = sqlx::query(sql)
                .bind(active)
                .bind(key_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(updated > 0)
        })
        .await
    }

    async fn delete_unused_key(&self, kind: KeyKind, key_id: Uuid) -> StoreResult<KeyDeletion> {
        let (delete_sql, probe_sql) = match kind {
            KeyKind::Access => (
                "DELETE FROM access_keys WHERE id = $1 AND used_count = 0",
                "SELECT EXISTS(SELECT 1 FROM access_keys WHERE id = $1)",
            ),
            KeyKind::Boost => (
                "DELETE FROM boost_keys WHERE id = $1 AND used_count = 0",
                "SELECT EXISTS(SELECT 1 FROM boost_keys WHERE id = $1)",
            ),
        };
        with_deadline(self.timeout, async {
            let deleted = sqlx::query(delete_sql)
                .bind(key_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
            if deleted > 0 {
                return Ok(KeyDeletion::Deleted);
            }

            // Nothing deleted: either the key is gone or it was redeemed.
            let exists: bool = sqlx::query_scalar(probe_sql)
                .bind(key_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(if exists {
                KeyDeletion::InUse
            } else {
                KeyDeletion::NotFound
            })
        })
        .await
    }

    async fn commit_access_redemption(&self, plan: &AccessRedemption) -> StoreResult<()> {
        with_deadline(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            // Consume the key only if nobody else did since we read it
            let consumed = sqlx::query(
                r#"
                UPDATE access_keys
                SET used_count = used_count + 1,
                    redeemed_by_account_id = COALESCE(redeemed_by_account_id, $2),
                    redeemed_at = $3
                WHERE id = $1 AND used_count = $4 AND is_active = TRUE
                "#,
            )
            .bind(plan.key_id)
            .bind(plan.account_id)
            .bind(plan.redeemed_at)
            .bind(plan.expected_used_count)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if consumed == 0 {
                return Err(abandon(tx, "redeem_access_key", plan.key_id).await);
            }

            // Extend from the expiration we computed against
            let extended = sqlx::query(
                r#"
                UPDATE accounts
                SET expires_at = $1, updated_at = $2
                WHERE id = $3 AND expires_at IS NOT DISTINCT FROM $4
                "#,
            )
            .bind(plan.new_expires_at)
            .bind(plan.redeemed_at)
            .bind(plan.account_id)
            .bind(plan.expected_expires_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if extended == 0 {
                return Err(abandon(tx, "redeem_access_key", plan.key_id).await);
            }

            insert_redemption(
                &mut tx,
                plan.account_id,
                plan.key_id,
                KeyKind::Access,
                plan.operation,
                plan.redeemed_at,
            )
            .await?;

            // Commit all changes atomically
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn commit_boost_redemption(&self, plan: &BoostRedemption) -> StoreResult<()> {
        with_deadline(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            let consumed = sqlx::query(
                r#"
                UPDATE boost_keys
                SET used_count = used_count + 1,
                    redeemed_by_account_id = CASE WHEN $2 THEN $3 ELSE redeemed_by_account_id END,
                    redeemed_at = $4
                WHERE id = $1
                  AND used_count = $5
                  AND is_active = TRUE
                  AND redeemed_by_account_id IS NULL
                "#,
            )
            .bind(plan.key_id)
            .bind(plan.record_redeemer)
            .bind(plan.account_id)
            .bind(plan.redeemed_at)
            .bind(plan.expected_used_count)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if consumed == 0 {
                return Err(abandon(tx, "redeem_boost_key", plan.key_id).await);
            }

            match &plan.write {
                BoostWrite::RaiseBaseLimit {
                    scope,
                    expected,
                    new_limit,
                } => {
                    let sql = match scope {
                        QuotaScope::Daily => {
                            r#"
                            UPDATE accounts SET base_daily_limit = $1, updated_at = $2
                            WHERE id = $3 AND base_daily_limit IS NOT DISTINCT FROM $4
                            "#
                        }
                        QuotaScope::Cycle => {
                            r#"
                            UPDATE accounts SET base_cycle_limit = $1, updated_at = $2
                            WHERE id = $3 AND base_cycle_limit IS NOT DISTINCT FROM $4
                            "#
                        }
                    };
                    let raised = sqlx::query(sql)
                        .bind(*new_limit)
                        .bind(plan.redeemed_at)
                        .bind(plan.account_id)
                        .bind(*expected)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();

                    if raised == 0 {
                        return Err(abandon(tx, "redeem_boost_key", plan.key_id).await);
                    }
                }
                BoostWrite::Temporary(boost) => {
                    sqlx::query(&format!(
                        r#"
                        INSERT INTO temporary_boosts ({TEMPORARY_BOOST_COLUMNS})
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#
                    ))
                    .bind(boost.id)
                    .bind(boost.account_id)
                    .bind(boost.scope.as_str())
                    .bind(boost.amount)
                    .bind(boost.valid_from)
                    .bind(boost.valid_to)
                    .bind(boost.active)
                    .bind(boost.source_key_id)
                    .bind(boost.created_at)
                    .execute(&mut *tx)
                    .await?;
                }
            }

            insert_redemption(
                &mut tx,
                plan.account_id,
                plan.key_id,
                KeyKind::Boost,
                RedemptionOperation::Boost,
                plan.redeemed_at,
            )
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn list_redemptions(&self, account_id: Uuid) -> StoreResult<Vec<KeyRedemption>> {
        with_deadline(self.timeout, async {
            let rows = sqlx::query_as::<_, KeyRedemption>(
                r#"
                SELECT id, account_id, key_id, key_kind, operation, created_at
                FROM key_redemptions
                WHERE account_id = $1
                ORDER BY created_at DESC
                "#,
            )
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await
    }

    async fn count_successes(
        &self,
        account_id: Uuid,
        feature: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<i64> {
        with_deadline(self.timeout, async {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM quota_ledger
                WHERE account_id = $1
                  AND feature = $2
                  AND outcome = 'success'
                  AND created_at >= $3
                  AND created_at < $4
                "#,
            )
            .bind(account_id)
            .bind(feature)
            .bind(from)
            .bind(to)
            .fetch_one(&self.pool)
            .await?;
            Ok(count)
        })
        .await
    }

    async fn append_ledger(&self, entry: &NewLedgerEntry) -> StoreResult<()> {
        with_deadline(self.timeout, async {
            sqlx::query(
                r#"
                INSERT INTO quota_ledger (account_id, feature, outcome, created_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(entry.account_id)
            .bind(&entry.feature)
            .bind(entry.outcome.as_str())
            .bind(entry.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn effective_temporary_boosts(
        &self,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<TemporaryBoost>> {
        with_deadline(self.timeout, async {
            let boosts = sqlx::query_as::<_, TemporaryBoost>(&format!(
                r#"
                SELECT {TEMPORARY_BOOST_COLUMNS}
                FROM temporary_boosts
                WHERE account_id = $1
                  AND active = TRUE
                  AND valid_from <= $2
                  AND valid_to > $2
                ORDER BY valid_to
                "#
            ))
            .bind(account_id)
            .bind(at)
            .fetch_all(&self.pool)
            .await?;
            Ok(boosts)
        })
        .await
    }

    async fn set_temporary_boost_active(&self, boost_id: Uuid, active: bool) -> StoreResult<bool> {
        with_deadline(self.timeout, async {
            let updated = sqlx::query("UPDATE temporary_boosts SET active = $1 WHERE id = $2")
                .bind(active)
                .bind(boost_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(updated > 0)
        })
        .await
    }

    async fn load_quota_settings(&self) -> StoreResult<Option<QuotaSettingsOverride>> {
        with_deadline(self.timeout, async {
            let row = sqlx::query_as::<_, QuotaSettingsOverride>(
                r#"
                SELECT default_daily_limit, default_cycle_limit, min_limit,
                       max_daily_limit, max_cycle_limit
                FROM system_settings
                WHERE id = 1
                "#,
            )
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    async fn swap_session(
        &self,
        account_id: Uuid,
        expected: Option<&str>,
        new: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        with_deadline(self.timeout, async {
            let swapped = sqlx::query(
                r#"
                UPDATE accounts
                SET current_session_id = $1, last_active_at = $2, updated_at = $2
                WHERE id = $3 AND current_session_id IS NOT DISTINCT FROM $4
                "#,
            )
            .bind(new)
            .bind(now)
            .bind(account_id)
            .bind(expected)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(swapped > 0)
        })
        .await
    }

    async fn touch_session(
        &self,
        account_id: Uuid,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        with_deadline(self.timeout, async {
            let touched = sqlx::query(
                "UPDATE accounts SET last_active_at = $1 WHERE id = $2 AND current_session_id = $3",
            )
            .bind(now)
            .bind(account_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(touched > 0)
        })
        .await
    }

    async fn find_admin_key(&self, key_hash: &str) -> StoreResult<Option<AdminApiKey>> {
        with_deadline(self.timeout, async {
            let key = sqlx::query_as::<_, AdminApiKey>(
                "SELECT id, key_hash, label, created_at, is_active
                 FROM admin_api_keys
                 WHERE key_hash = $1 AND is_active = true",
            )
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(key)
        })
        .await
    }
}
