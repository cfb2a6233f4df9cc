#![allow(dead_code)]

use std::sync::Arc;

use access_gate_server::{
    app::AppState,
    clock::{Clock, ManualClock},
    config::Config,
    models::{
        account::Account,
        api_key::AdminApiKey,
        key::{AccessKey, BoostKey},
        quota::QuotaScope,
    },
    store::{Store, memory::MemoryStore},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

pub const SECRET: &str = "test-session-secret-0123456789";
pub const ADMIN_KEY: &str = "admin-key-for-tests";

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub state: AppState,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::for_memory(SECRET))
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let dyn_store: Arc<dyn Store> = store.clone();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let state = AppState::build(&config, dyn_store, dyn_clock);
        Self {
            store,
            clock,
            state,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    pub fn account(&self, expires_at: Option<DateTime<Utc>>) -> Uuid {
        let account = Account {
            id: Uuid::new_v4(),
            display_name: None,
            expires_at,
            base_daily_limit: None,
            base_cycle_limit: None,
            current_session_id: None,
            last_active_at: None,
            created_at: self.now(),
            updated_at: self.now(),
        };
        let id = account.id;
        self.store.put_account(account);
        id
    }

    pub async fn insert_access_key(&self, key: AccessKey) -> AccessKey {
        self.store
            .insert_access_keys(std::slice::from_ref(&key))
            .await
            .unwrap();
        key
    }

    pub async fn insert_boost_key(&self, key: BoostKey) -> BoostKey {
        self.store
            .insert_boost_keys(std::slice::from_ref(&key))
            .await
            .unwrap();
        key
    }

    pub fn admin_key(&self) {
        self.store.put_admin_key(AdminApiKey {
            id: Uuid::new_v4(),
            key_hash: access_gate_server::middleware::auth::hash_api_key(ADMIN_KEY),
            label: "ops".to_string(),
            created_at: self.now(),
            is_active: true,
        });
    }
}

pub fn access_key(code: &str, hours: f64, max_uses: Option<i32>) -> AccessKey {
    AccessKey {
        id: Uuid::new_v4(),
        code: code.to_string(),
        is_active: true,
        max_uses,
        used_count: 0,
        activation_deadline: None,
        grant_duration_hours: hours,
        redeemed_by_account_id: None,
        redeemed_at: None,
        created_at: start() - Duration::days(1),
    }
}

pub fn boost_key(
    code: &str,
    scope: QuotaScope,
    amount: i32,
    temporary_days: Option<i32>,
    max_uses: Option<i32>,
) -> BoostKey {
    BoostKey {
        id: Uuid::new_v4(),
        code: code.to_string(),
        is_active: true,
        max_uses,
        used_count: 0,
        activation_deadline: None,
        scope,
        amount,
        is_temporary: temporary_days.is_some(),
        temporary_duration_days: temporary_days,
        redeemed_by_account_id: None,
        redeemed_at: None,
        created_at: start() - Duration::days(1),
    }
}
