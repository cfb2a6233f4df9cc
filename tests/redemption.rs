mod common;

use access_gate_server::{
    error::AppError,
    models::{
        key::{GenerateBoostKeysRequest, KeyKind, RedemptionOperation},
        quota::{QuotaScope, QuotaSettingsOverride},
    },
    services::key_admin_service::MAX_TEMPORARY_DAYS,
    store::Store,
};
use chrono::Duration;
use common::{Harness, access_key, boost_key};

#[tokio::test]
async fn single_use_key_end_to_end() {
    let h = Harness::new();
    let account = h.account(None);
    let key = h
        .insert_access_key(access_key("XY-30-ABCD1234", 720.0, Some(1)))
        .await;

    let grant = h
        .state
        .license
        .redeem(account, "  xy-30-abcd1234 ")
        .await
        .unwrap();
    assert_eq!(grant.new_expires_at, h.now() + Duration::days(30));
    assert_eq!(grant.operation, RedemptionOperation::Signup);

    let again = h.state.license.redeem(account, "XY-30-ABCD1234").await;
    assert!(matches!(again, Err(AppError::KeyAlreadyUsed)));

    let stored = h.store.access_key(key.id).unwrap();
    assert_eq!(stored.used_count, 1);
    assert_eq!(stored.redeemed_by_account_id, Some(account));
    assert_eq!(stored.redeemed_at, Some(h.now()));

    let status = h.state.license.status(account).await.unwrap();
    assert!(status.active);
    assert_eq!(status.remaining_hours, 720);
}

#[tokio::test]
async fn renewal_appends_to_remaining_validity() {
    let h = Harness::new();
    let previous = h.now() + Duration::days(10);
    let account = h.account(Some(previous));
    h.insert_access_key(access_key("RN-30-AAAA2222", 720.0, Some(1)))
        .await;

    let grant = h
        .state
        .license
        .redeem(account, "RN-30-AAAA2222")
        .await
        .unwrap();
    assert_eq!(grant.new_expires_at, previous + Duration::hours(720));
    assert_eq!(grant.operation, RedemptionOperation::Renew);
}

#[tokio::test]
async fn lapsed_membership_restarts_from_now() {
    let h = Harness::new();
    let account = h.account(Some(h.now() - Duration::days(5)));
    h.insert_access_key(access_key("LP-1-BBBB3333", 24.0, Some(1)))
        .await;

    let grant = h
        .state
        .license
        .redeem(account, "LP-1-BBBB3333")
        .await
        .unwrap();
    assert_eq!(grant.new_expires_at, h.now() + Duration::hours(24));
    assert_eq!(grant.operation, RedemptionOperation::Renew);
}

#[tokio::test]
async fn past_activation_deadline_wins_over_remaining_uses() {
    let h = Harness::new();
    let account = h.account(None);
    let mut key = access_key("DL-30-CCCC4444", 720.0, Some(10));
    key.used_count = 3;
    key.activation_deadline = Some(h.now() - Duration::seconds(1));
    h.insert_access_key(key).await;

    let result = h.state.license.redeem(account, "DL-30-CCCC4444").await;
    assert!(matches!(result, Err(AppError::KeyExpiredForActivation)));
}

#[tokio::test]
async fn failures_are_distinguishable() {
    let h = Harness::new();
    let account = h.account(None);

    let mut disabled = access_key("DS-30-DDDD5555", 720.0, Some(1));
    disabled.is_active = false;
    h.insert_access_key(disabled).await;

    let mut exhausted = access_key("EX-30-EEEE6666", 720.0, Some(2));
    exhausted.used_count = 2;
    h.insert_access_key(exhausted).await;

    h.insert_access_key(access_key("OK-30-FFFF7777", 720.0, Some(1)))
        .await;

    let license = &h.state.license;
    assert!(matches!(
        license.redeem(account, "NO-SUCH-KEY").await,
        Err(AppError::KeyNotFound)
    ));
    assert!(matches!(
        license.redeem(account, "DS-30-DDDD5555").await,
        Err(AppError::KeyDisabled)
    ));
    assert!(matches!(
        license.redeem(account, "EX-30-EEEE6666").await,
        Err(AppError::KeyExhausted)
    ));
    assert!(matches!(
        license.redeem(account, "bad code!").await,
        Err(AppError::InvalidRequest(_))
    ));
    assert!(matches!(
        license.redeem(uuid::Uuid::new_v4(), "OK-30-FFFF7777").await,
        Err(AppError::AccountNotFound)
    ));
}

#[tokio::test]
async fn unknown_account_does_not_consume_the_key() {
    let h = Harness::new();
    let key = h
        .insert_access_key(access_key("UA-30-GGGG8888", 720.0, Some(1)))
        .await;

    let result = h
        .state
        .license
        .redeem(uuid::Uuid::new_v4(), "UA-30-GGGG8888")
        .await;
    assert!(matches!(result, Err(AppError::AccountNotFound)));
    assert_eq!(h.store.access_key(key.id).unwrap().used_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_of_a_single_use_key_grant_once() {
    let h = Harness::new();
    let key = h
        .insert_access_key(access_key("RC-30-HHHH9999", 720.0, Some(1)))
        .await;
    let accounts: Vec<_> = (0..8).map(|_| h.account(None)).collect();

    let mut tasks = Vec::new();
    for account in accounts {
        let license = h.state.license.clone();
        tasks.push(tokio::spawn(async move {
            license.redeem(account, "RC-30-HHHH9999").await
        }));
    }

    let mut granted = 0;
    let mut already_used = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => granted += 1,
            Err(AppError::KeyAlreadyUsed) => already_used += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(already_used, 7);
    assert_eq!(h.store.access_key(key.id).unwrap().used_count, 1);
}

#[tokio::test]
async fn same_account_racing_itself_is_granted_once() {
    let h = Harness::new();
    let account = h.account(None);
    h.insert_access_key(access_key("SA-30-JJJJ2345", 720.0, Some(1)))
        .await;

    let license = &h.state.license;
    let (a, b) = tokio::join!(
        license.redeem(account, "SA-30-JJJJ2345"),
        license.redeem(account, "SA-30-JJJJ2345"),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(AppError::KeyAlreadyUsed)))
    );

    let account = h.store.find_account(account).await.unwrap().unwrap();
    assert_eq!(account.expires_at, Some(h.now() + Duration::days(30)));
}

#[tokio::test]
async fn multi_use_key_serves_several_accounts() {
    let h = Harness::new();
    let key = h
        .insert_access_key(access_key("MU-7-KKKK3456", 168.0, Some(2)))
        .await;
    let first = h.account(None);
    let second = h.account(None);
    let third = h.account(None);

    h.state.license.redeem(first, "MU-7-KKKK3456").await.unwrap();
    h.state.license.redeem(second, "MU-7-KKKK3456").await.unwrap();
    assert!(matches!(
        h.state.license.redeem(third, "MU-7-KKKK3456").await,
        Err(AppError::KeyExhausted)
    ));
    assert_eq!(h.store.access_key(key.id).unwrap().used_count, 2);
}

#[tokio::test]
async fn redemptions_are_audited() {
    let h = Harness::new();
    let account = h.account(None);
    let signup = h
        .insert_access_key(access_key("AU-1-LLLL4567", 24.0, Some(1)))
        .await;
    let renew = h
        .insert_access_key(access_key("AU-1-MMMM5678", 24.0, Some(1)))
        .await;

    h.state.license.redeem(account, "AU-1-LLLL4567").await.unwrap();
    h.clock.advance(Duration::minutes(1));
    h.state.license.redeem(account, "AU-1-MMMM5678").await.unwrap();

    let trail = h.state.keys.redemptions(account).await.unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].key_id, renew.id);
    assert_eq!(trail[0].operation, RedemptionOperation::Renew);
    assert_eq!(trail[1].key_id, signup.id);
    assert_eq!(trail[1].operation, RedemptionOperation::Signup);
    assert!(trail.iter().all(|r| r.key_kind == KeyKind::Access));
}

#[tokio::test]
async fn cached_account_sees_new_expiration() {
    let h = Harness::new();
    let account = h.account(None);
    h.insert_access_key(access_key("CA-30-NNNN6789", 720.0, Some(1)))
        .await;

    assert!(!h.state.license.status(account).await.unwrap().active);
    h.state
        .license
        .redeem(account, "CA-30-NNNN6789")
        .await
        .unwrap();
    assert!(h.state.license.status(account).await.unwrap().active);
}

#[tokio::test]
async fn admin_override_can_shorten_validity() {
    let h = Harness::new();
    let account = h.account(Some(h.now() + Duration::days(60)));
    assert!(h.state.license.status(account).await.unwrap().active);

    h.state
        .accounts
        .override_expiry(account, Some(h.now() - Duration::hours(1)))
        .await
        .unwrap();
    let status = h.state.license.status(account).await.unwrap();
    assert!(!status.active);
    assert_eq!(status.remaining_hours, 0);
}

#[tokio::test]
async fn temporary_boost_raises_limit_for_its_window() {
    let h = Harness::new();
    let account = h.account(None);
    let key = h
        .insert_boost_key(boost_key("BT-7-PPPP2345", QuotaScope::Daily, 5, Some(7), Some(1)))
        .await;

    let grant = h
        .state
        .license
        .redeem_boost(account, "bt-7-pppp2345")
        .await
        .unwrap();
    assert!(grant.temporary);
    assert_eq!(grant.scope, QuotaScope::Daily);
    assert_eq!(grant.valid_to, Some(h.now() + Duration::days(7)));
    assert_eq!(grant.new_limits.daily, 15);
    assert_eq!(grant.new_limits.cycle, 120);

    let stored = h.store.boost_key(key.id).unwrap();
    assert_eq!(stored.redeemed_by_account_id, Some(account));
    let boosts = h.store.temporary_boosts(account);
    assert_eq!(boosts.len(), 1);
    assert_eq!(boosts[0].source_key_id, key.id);

    let account_row = h.store.find_account(account).await.unwrap().unwrap();
    assert_eq!(account_row.base_daily_limit, None);

    let decision = h.state.quota.check(account, None).await.unwrap();
    assert_eq!(decision.daily.limit, 15);

    h.clock.advance(Duration::days(7));
    let decision = h.state.quota.check(account, None).await.unwrap();
    assert_eq!(decision.daily.limit, 10);
}

#[tokio::test]
async fn permanent_boost_raises_base_limit() {
    let h = Harness::new();
    let account = h.account(None);
    h.insert_boost_key(boost_key("BP-P-QQQQ3456", QuotaScope::Cycle, 30, None, Some(1)))
        .await;

    let grant = h
        .state
        .license
        .redeem_boost(account, "BP-P-QQQQ3456")
        .await
        .unwrap();
    assert!(!grant.temporary);
    assert_eq!(grant.valid_to, None);
    assert_eq!(grant.new_limits.cycle, 150);

    let account_row = h.store.find_account(account).await.unwrap().unwrap();
    assert_eq!(account_row.base_cycle_limit, Some(150));

    assert!(matches!(
        h.state.license.redeem_boost(account, "BP-P-QQQQ3456").await,
        Err(AppError::KeyAlreadyUsed)
    ));
}

#[tokio::test]
async fn permanent_boosts_stack_on_existing_override() {
    let h = Harness::new();
    let account = h.account(None);
    h.state
        .accounts
        .set_base_limits(account, Some(25), None)
        .await
        .unwrap();
    h.insert_boost_key(boost_key("BS-P-RRRR4567", QuotaScope::Daily, 5, None, Some(1)))
        .await;

    let grant = h
        .state
        .license
        .redeem_boost(account, "BS-P-RRRR4567")
        .await
        .unwrap();
    assert_eq!(grant.new_limits.daily, 30);
}

#[tokio::test]
async fn multi_use_boost_key_does_not_record_a_redeemer() {
    let h = Harness::new();
    let key = h
        .insert_boost_key(boost_key("BM-3-SSSS5678", QuotaScope::Daily, 2, Some(3), Some(3)))
        .await;
    let first = h.account(None);
    let second = h.account(None);

    h.state
        .license
        .redeem_boost(first, "BM-3-SSSS5678")
        .await
        .unwrap();
    h.state
        .license
        .redeem_boost(second, "BM-3-SSSS5678")
        .await
        .unwrap();

    let stored = h.store.boost_key(key.id).unwrap();
    assert_eq!(stored.used_count, 2);
    assert_eq!(stored.redeemed_by_account_id, None);
}

#[tokio::test]
async fn boost_key_not_found_in_access_table() {
    let h = Harness::new();
    let account = h.account(None);
    h.insert_access_key(access_key("XK-30-TTTT6789", 720.0, Some(1)))
        .await;
    assert!(matches!(
        h.state.license.redeem_boost(account, "XK-30-TTTT6789").await,
        Err(AppError::KeyNotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_of_a_temporary_boost_key_grant_once() {
    let h = Harness::new();
    let key = h
        .insert_boost_key(boost_key("CT-7-UUUU2345", QuotaScope::Daily, 5, Some(7), Some(1)))
        .await;
    let accounts: Vec<_> = (0..8).map(|_| h.account(None)).collect();

    let mut tasks = Vec::new();
    for account in accounts.iter().copied() {
        let license = h.state.license.clone();
        tasks.push(tokio::spawn(async move {
            license.redeem_boost(account, "CT-7-UUUU2345").await
        }));
    }

    let mut granted = 0;
    let mut already_used = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => granted += 1,
            Err(AppError::KeyAlreadyUsed) => already_used += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(already_used, 7);

    let rows: usize = accounts
        .iter()
        .map(|account| h.store.temporary_boosts(*account).len())
        .sum();
    assert_eq!(rows, 1);
    assert_eq!(h.store.boost_key(key.id).unwrap().used_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_of_a_permanent_boost_key_raise_once() {
    let h = Harness::new();
    let account = h.account(None);
    let key = h
        .insert_boost_key(boost_key("CP-P-VVVV3456", QuotaScope::Cycle, 30, None, Some(1)))
        .await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let license = h.state.license.clone();
        tasks.push(tokio::spawn(async move {
            license.redeem_boost(account, "CP-P-VVVV3456").await
        }));
    }

    let mut granted = 0;
    let mut already_used = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(grant) => {
                assert_eq!(grant.new_limits.cycle, 150);
                granted += 1;
            }
            Err(AppError::KeyAlreadyUsed) => already_used += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(already_used, 7);

    let row = h.store.find_account(account).await.unwrap().unwrap();
    assert_eq!(row.base_cycle_limit, Some(150));
    assert_eq!(h.store.boost_key(key.id).unwrap().used_count, 1);
    assert_eq!(h.store.list_redemptions(account).await.unwrap().len(), 1);
}

#[tokio::test]
async fn boost_lasting_past_the_calendar_is_refused_without_consuming() {
    let h = Harness::new();
    let account = h.account(None);
    let key = h
        .insert_boost_key(boost_key(
            "CL-100000000-WWWW4567",
            QuotaScope::Daily,
            5,
            Some(100_000_000),
            Some(1),
        ))
        .await;

    assert!(matches!(
        h.state
            .license
            .redeem_boost(account, "CL-100000000-WWWW4567")
            .await,
        Err(AppError::Internal(_))
    ));
    assert_eq!(h.store.boost_key(key.id).unwrap().used_count, 0);
    assert!(h.store.temporary_boosts(account).is_empty());
}

#[tokio::test]
async fn expiration_at_the_end_of_the_calendar_is_refused_without_consuming() {
    let h = Harness::new();
    let account = h.account(None);
    let far = chrono::DateTime::<chrono::Utc>::MAX_UTC - Duration::hours(1);
    h.state
        .accounts
        .override_expiry(account, Some(far))
        .await
        .unwrap();
    let key = h
        .insert_access_key(access_key("CE-30-XXXX5678", 720.0, Some(1)))
        .await;

    assert!(matches!(
        h.state.license.redeem(account, "CE-30-XXXX5678").await,
        Err(AppError::Internal(_))
    ));
    assert_eq!(h.store.access_key(key.id).unwrap().used_count, 0);
    let row = h.store.find_account(account).await.unwrap().unwrap();
    assert_eq!(row.expires_at, Some(far));
}

#[tokio::test]
async fn overlong_temporary_boost_is_rejected_at_generation() {
    let h = Harness::new();
    let request = |days: i32| GenerateBoostKeysRequest {
        count: 1,
        scope: QuotaScope::Daily,
        amount: 5,
        temporary: true,
        temporary_duration_days: Some(days),
        max_uses: Some(1),
        activation_deadline: None,
        prefix: None,
    };

    assert!(matches!(
        h.state.keys.generate_boost_keys(request(100_000_000)).await,
        Err(AppError::InvalidRequest(_))
    ));
    assert!(matches!(
        h.state.keys.generate_boost_keys(request(MAX_TEMPORARY_DAYS + 1)).await,
        Err(AppError::InvalidRequest(_))
    ));

    let keys = h
        .state
        .keys
        .generate_boost_keys(request(MAX_TEMPORARY_DAYS))
        .await
        .unwrap();
    let account = h.account(None);
    let grant = h
        .state
        .license
        .redeem_boost(account, &keys[0].code)
        .await
        .unwrap();
    assert_eq!(
        grant.valid_to,
        Some(h.now() + Duration::days(i64::from(MAX_TEMPORARY_DAYS)))
    );
}

#[tokio::test]
async fn unreadable_settings_after_boost_report_environment_limits() {
    let h = Harness::new();
    let account = h.account(None);
    h.insert_boost_key(boost_key("US-7-YYYY6789", QuotaScope::Daily, 5, Some(7), Some(1)))
        .await;
    h.store.put_quota_settings(Some(QuotaSettingsOverride {
        min_limit: Some(50),
        max_daily_limit: Some(10),
        ..Default::default()
    }));

    let grant = h
        .state
        .license
        .redeem_boost(account, "US-7-YYYY6789")
        .await
        .unwrap();
    assert_eq!(grant.new_limits.daily, 15);
    assert_eq!(grant.new_limits.cycle, 120);
    assert_eq!(h.store.temporary_boosts(account).len(), 1);
}
