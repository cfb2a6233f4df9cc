mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use access_gate_server::{
    app::AppState,
    clock::Clock,
    config::Config,
    error::AppError,
    models::quota::{LedgerOutcome, NewLedgerEntry, QuotaScope, QuotaSettingsOverride},
    store::{Store, memory::MemoryStore},
};
use chrono::{DateTime, Duration, Utc};
use common::{Harness, SECRET, boost_key, start};
use uuid::Uuid;

async fn ledger_at(h: &Harness, account: Uuid, feature: &str, outcome: LedgerOutcome, at: DateTime<Utc>) {
    h.store
        .append_ledger(&NewLedgerEntry {
            account_id: account,
            feature: feature.to_string(),
            outcome,
            created_at: at,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn failures_do_not_consume_quota() {
    let h = Harness::new();
    let account = h.account(None);
    for minutes in 1..=9 {
        ledger_at(&h, account, "ai", LedgerOutcome::Success, h.now() - Duration::minutes(minutes)).await;
    }
    ledger_at(&h, account, "ai", LedgerOutcome::Failure, h.now() - Duration::minutes(30)).await;

    let decision = h.state.quota.check(account, Some("ai")).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.daily.limit, 10);
    assert_eq!(decision.daily.used, 9);
    assert_eq!(decision.daily.remaining, 1);
    assert!(decision.daily.allowed);
    assert_eq!(decision.cycle.used, 9);
}

#[tokio::test]
async fn old_success_counts_for_cycle_only() {
    let h = Harness::new();
    let account = h.account(None);
    ledger_at(&h, account, "ai", LedgerOutcome::Success, h.now() - Duration::hours(25)).await;

    let daily = h
        .state
        .quota
        .check_scope(account, None, QuotaScope::Daily)
        .await
        .unwrap();
    let cycle = h
        .state
        .quota
        .check_scope(account, None, QuotaScope::Cycle)
        .await
        .unwrap();
    assert_eq!(daily.used, 0);
    assert_eq!(cycle.used, 1);
}

#[tokio::test]
async fn window_start_is_inclusive() {
    let h = Harness::new();
    let account = h.account(None);
    ledger_at(&h, account, "ai", LedgerOutcome::Success, h.now() - Duration::hours(24)).await;
    ledger_at(&h, account, "ai", LedgerOutcome::Success, h.now() - Duration::days(30)).await;
    ledger_at(
        &h,
        account,
        "ai",
        LedgerOutcome::Success,
        h.now() - Duration::days(30) - Duration::seconds(1),
    )
    .await;

    let decision = h.state.quota.check(account, None).await.unwrap();
    assert_eq!(decision.daily.used, 1);
    assert_eq!(decision.cycle.used, 2);
}

#[tokio::test]
async fn features_are_counted_separately() {
    let h = Harness::new();
    let account = h.account(None);
    ledger_at(&h, account, "image", LedgerOutcome::Success, h.now() - Duration::minutes(1)).await;

    let ai = h.state.quota.check(account, Some("ai")).await.unwrap();
    let image = h.state.quota.check(account, Some("image")).await.unwrap();
    assert_eq!(ai.daily.used, 0);
    assert_eq!(image.daily.used, 1);
}

#[tokio::test]
async fn denial_reports_both_windows() {
    let h = Harness::new();
    let account = h.account(None);
    for minutes in 1..=10 {
        ledger_at(&h, account, "ai", LedgerOutcome::Success, h.now() - Duration::minutes(minutes)).await;
    }

    let decision = h.state.quota.check(account, None).await.unwrap();
    assert!(!decision.allowed);
    assert!(!decision.daily.allowed);
    assert_eq!(decision.daily.remaining, 0);
    assert!(decision.cycle.allowed);
    assert_eq!(decision.cycle.used, 10);
    assert_eq!(decision.cycle.remaining, 110);

    h.clock.advance(Duration::hours(24));
    let decision = h.state.quota.check(account, None).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.daily.used, 0);
    assert_eq!(decision.cycle.used, 10);
}

#[tokio::test]
async fn check_and_record_runs_action_and_records_outcome() {
    let h = Harness::new();
    let account = h.account(None);

    let value = h
        .state
        .quota
        .check_and_record(account, Some("ai"), || async { Ok(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);

    let failed: Result<(), AppError> = h
        .state
        .quota
        .check_and_record(account, Some("ai"), || async {
            Err(AppError::Internal("generator crashed".to_string()))
        })
        .await;
    assert!(matches!(failed, Err(AppError::Internal(_))));

    let ledger = h.store.ledger();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].outcome, LedgerOutcome::Success);
    assert_eq!(ledger[1].outcome, LedgerOutcome::Failure);

    h.clock.advance(Duration::seconds(1));
    let decision = h.state.quota.check(account, Some("ai")).await.unwrap();
    assert_eq!(decision.daily.used, 1);
}

#[tokio::test]
async fn exhausted_quota_skips_the_action() {
    let h = Harness::new();
    let account = h.account(None);
    h.state
        .accounts
        .set_base_limits(account, Some(2), None)
        .await
        .unwrap();
    for minutes in 1..=2 {
        ledger_at(&h, account, "ai", LedgerOutcome::Success, h.now() - Duration::minutes(minutes)).await;
    }

    let ran = AtomicUsize::new(0);
    let result = h
        .state
        .quota
        .check_and_record(account, None, || async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    match result {
        Err(AppError::QuotaExceeded(decision)) => {
            assert_eq!(decision.daily.limit, 2);
            assert_eq!(decision.daily.used, 2);
            assert_eq!(decision.cycle.limit, 120);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.ledger().len(), 2);
}

#[tokio::test]
async fn misconfigured_default_degrades_to_minimum() {
    let h = Harness::new();
    let account = h.account(None);
    h.store.put_quota_settings(Some(QuotaSettingsOverride {
        default_daily_limit: Some(0),
        default_cycle_limit: Some(-3),
        ..Default::default()
    }));

    let decision = h.state.quota.check(account, None).await.unwrap();
    assert_eq!(decision.daily.limit, 1);
    assert_eq!(decision.cycle.limit, 1);
    assert!(decision.allowed);
}

#[tokio::test]
async fn oversized_override_is_clamped_to_maximum() {
    let h = Harness::new();
    let account = h.account(None);
    h.state
        .accounts
        .set_base_limits(account, Some(50_000), Some(1_000_000))
        .await
        .unwrap();

    let decision = h.state.quota.check(account, None).await.unwrap();
    assert_eq!(decision.daily.limit, 10_000);
    assert_eq!(decision.cycle.limit, 300_000);
}

#[tokio::test]
async fn inconsistent_stored_settings_are_fatal() {
    let h = Harness::new();
    let account = h.account(None);
    h.store.put_quota_settings(Some(QuotaSettingsOverride {
        min_limit: Some(50),
        max_daily_limit: Some(10),
        ..Default::default()
    }));

    let result = h.state.quota.check(account, None).await;
    assert!(matches!(result, Err(AppError::Internal(_))));
}

#[tokio::test]
async fn settings_are_cached_until_invalidated() {
    let h = Harness::new();
    let account = h.account(None);
    assert_eq!(h.state.quota.check(account, None).await.unwrap().daily.limit, 10);

    h.store.put_quota_settings(Some(QuotaSettingsOverride {
        default_daily_limit: Some(20),
        ..Default::default()
    }));
    assert_eq!(h.state.quota.check(account, None).await.unwrap().daily.limit, 10);

    h.state.settings.invalidate();
    assert_eq!(h.state.quota.check(account, None).await.unwrap().daily.limit, 20);
}

#[tokio::test]
async fn temporary_boosts_are_listed_while_live() {
    let h = Harness::new();
    let account = h.account(None);
    h.insert_boost_key(boost_key("TB-2-AAAA2345", QuotaScope::Cycle, 40, Some(2), Some(1)))
        .await;
    h.state
        .license
        .redeem_boost(account, "TB-2-AAAA2345")
        .await
        .unwrap();

    let status = h.state.quota.status(account, None).await.unwrap();
    assert_eq!(status.decision.cycle.limit, 160);
    assert_eq!(status.active_boosts.len(), 1);

    h.clock.advance(Duration::days(2));
    let status = h.state.quota.status(account, None).await.unwrap();
    assert_eq!(status.decision.cycle.limit, 120);
    assert!(status.active_boosts.is_empty());
}

#[tokio::test]
async fn disabled_temporary_boost_stops_contributing() {
    let h = Harness::new();
    let account = h.account(None);
    h.insert_boost_key(boost_key("TD-7-BBBB2345", QuotaScope::Daily, 5, Some(7), Some(1)))
        .await;
    h.state
        .license
        .redeem_boost(account, "TD-7-BBBB2345")
        .await
        .unwrap();
    let boost_id = h.store.temporary_boosts(account)[0].id;

    h.state.keys.disable_temporary_boost(boost_id).await.unwrap();
    let decision = h.state.quota.check(account, None).await.unwrap();
    assert_eq!(decision.daily.limit, 10);

    assert!(matches!(
        h.state.keys.disable_temporary_boost(Uuid::new_v4()).await,
        Err(AppError::BoostNotFound)
    ));
}

#[tokio::test]
async fn invalid_feature_is_rejected_before_store_access() {
    let h = Harness::new();
    let account = h.account(None);
    assert!(matches!(
        h.state.quota.check(account, Some("Bad Feature")).await,
        Err(AppError::InvalidRequest(_))
    ));
    assert!(matches!(
        h.state
            .quota
            .record(account, Some(""), LedgerOutcome::Success)
            .await,
        Err(AppError::InvalidRequest(_))
    ));
    assert!(h.store.ledger().is_empty());
}

#[tokio::test]
async fn unknown_account_is_reported() {
    let h = Harness::new();
    assert!(matches!(
        h.state.quota.check(Uuid::new_v4(), None).await,
        Err(AppError::AccountNotFound)
    ));
}

/// Clock that moves forward a millisecond on every read, so consecutive
/// ledger writes never share an instant.
struct TickingClock {
    millis: AtomicI64,
}

impl Clock for TickingClock {
    fn now_utc(&self) -> DateTime<Utc> {
        start() + Duration::milliseconds(self.millis.fetch_add(1, Ordering::SeqCst))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_account_serialization_prevents_overshoot() {
    let config = Config {
        quota_serialize_per_account: true,
        default_daily_limit: 3,
        ..Config::for_memory(SECRET)
    };
    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(TickingClock {
        millis: AtomicI64::new(0),
    });
    let dyn_store: Arc<dyn Store> = store.clone();
    let state = AppState::build(&config, dyn_store, clock.clone());
    let account = state.accounts.create(None).await.unwrap().id;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let quota = state.quota.clone();
        tasks.push(tokio::spawn(async move {
            quota
                .check_and_record(account, None, || async {
                    tokio::task::yield_now().await;
                    Ok(())
                })
                .await
        }));
    }

    let mut allowed = 0;
    let mut denied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => allowed += 1,
            Err(AppError::QuotaExceeded(_)) => denied += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(allowed, 3);
    assert_eq!(denied, 7);
    assert_eq!(store.ledger().len(), 3);
}
