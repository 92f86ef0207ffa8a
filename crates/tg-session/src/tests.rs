use crate::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tg_core::{
    GovernError, ManualClock, Operation, QuotaPolicy, QuotaWindow, RateCeiling, ResourceDimension, Tier, TierPolicy,
    TollgateConfig,
};
use tg_memory::MemoryRecord;
use tg_stream::{ChunkSink, StreamStatus, Transcript};

fn config_with(tier: Tier, edit: impl FnOnce(&mut TierPolicy)) -> TollgateConfig {
    let mut config = TollgateConfig::default();
    config.memory.dimension = 3;
    let mut policy = TierPolicy::for_tier(tier);
    edit(&mut policy);
    config.tiers.insert(tier, policy);
    config
}

fn registry(config: TollgateConfig) -> (SessionRegistry, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    (SessionRegistry::new(config, clock.clone()), clock)
}

fn ledger(limit: u64, window: QuotaWindow) -> (Arc<QuotaLedger>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let quotas = BTreeMap::from([(ResourceDimension::Tokens, QuotaPolicy { limit, window })]);
    (Arc::new(QuotaLedger::new(&quotas, clock.clone())), clock)
}

const TOKENS: ResourceDimension = ResourceDimension::Tokens;

// ========== Quota ledger ==========

#[test]
fn test_free_tier_101st_call_rejected() {
    let (reg, _) = registry(TollgateConfig::default());
    let session = reg.create("alice", Tier::Free, HashMap::new()).unwrap();
    for _ in 0..100 {
        reg.track_usage(&session.id, ResourceDimension::ApiCalls, 1).unwrap();
    }
    let err = reg.track_usage(&session.id, ResourceDimension::ApiCalls, 1).unwrap_err();
    assert!(matches!(
        err,
        GovernError::QuotaExceeded {
            dimension: ResourceDimension::ApiCalls,
            used: 100,
            limit: 100
        }
    ));
    assert!(err.is_retryable());
}

#[test]
fn test_rejected_reserve_charges_nothing() {
    let (ledger, _) = ledger(10, QuotaWindow::Lifetime);
    ledger.reserve(TOKENS, 8).unwrap();
    assert!(ledger.reserve(TOKENS, 5).is_err());
    assert!(ledger.reserve(TOKENS, u64::MAX).is_err());
    assert_eq!(ledger.usage(TOKENS).unwrap().used, 8);
    ledger.reserve(TOKENS, 2).unwrap();
    assert_eq!(ledger.usage(TOKENS).unwrap().remaining, 0);
}

#[test]
fn test_release_and_release_unused() {
    let (ledger, _) = ledger(100, QuotaWindow::Lifetime);
    let a = ledger.reserve(TOKENS, 10).unwrap();
    let b = ledger.reserve(TOKENS, 20).unwrap();
    assert_eq!(ledger.release_unused(a, 3), 7);
    assert_eq!(ledger.release(b), 20);
    assert_eq!(ledger.usage(TOKENS).unwrap().used, 3);
}

#[test]
fn test_refund_clamps_at_zero() {
    let (ledger, _) = ledger(100, QuotaWindow::Lifetime);
    ledger.reserve(TOKENS, 5).unwrap();
    assert_eq!(ledger.refund(TOKENS, 50).unwrap(), 5);
    assert_eq!(ledger.usage(TOKENS).unwrap().used, 0);
}

#[test]
fn test_window_resets_lazily() {
    let (ledger, clock) = ledger(10, QuotaWindow::DAILY);
    let old = ledger.reserve(TOKENS, 10).unwrap();
    assert!(ledger.reserve(TOKENS, 1).is_err());

    clock.advance(Duration::from_secs(86_400));
    let fresh = ledger.reserve(TOKENS, 4).unwrap();
    // a refund from the previous window must not touch the new one
    assert_eq!(ledger.release(old), 0);
    assert_eq!(ledger.usage(TOKENS).unwrap().used, 4);
    assert_eq!(ledger.release(fresh), 4);
}

#[test]
fn test_reset_expired_and_resets_in() {
    let (ledger, clock) = ledger(10, QuotaWindow::Period { secs: 60 });
    ledger.reserve(TOKENS, 3).unwrap();
    clock.advance(Duration::from_secs(20));
    assert_eq!(ledger.usage(TOKENS).unwrap().resets_in_secs, Some(40));
    assert_eq!(ledger.reset_expired(), 0);
    clock.advance(Duration::from_secs(50));
    assert_eq!(ledger.reset_expired(), 1);
    let usage = ledger.usage(TOKENS).unwrap();
    assert_eq!(usage.used, 0);
    // aligned to the first window start: 70s in, next boundary at 120s
    assert_eq!(usage.resets_in_secs, Some(50));
}

#[test]
fn test_scoped_reservation() {
    let (ledger, _) = ledger(100, QuotaWindow::Lifetime);
    {
        let _r = ledger.reserve_scoped(TOKENS, 40).unwrap();
        assert_eq!(ledger.usage(TOKENS).unwrap().used, 40);
    }
    assert_eq!(ledger.usage(TOKENS).unwrap().used, 0);

    let r = ledger.reserve_scoped(TOKENS, 40).unwrap();
    assert_eq!(r.commit(), 40);
    let r = ledger.reserve_scoped(TOKENS, 40).unwrap();
    assert_eq!(r.commit_partial(15), 25);
    assert_eq!(ledger.usage(TOKENS).unwrap().used, 55);
}

#[test]
fn test_unmetered_dimension() {
    let (ledger, _) = ledger(10, QuotaWindow::Lifetime);
    let err = ledger.reserve(ResourceDimension::StorageBytes, 1).unwrap_err();
    assert!(matches!(err, GovernError::DimensionNotMetered { .. }));
    assert!(!ledger.is_metered(ResourceDimension::ConcurrentOperations));
}

#[test]
fn test_snapshot_reports_every_dimension() {
    let (reg, _) = registry(TollgateConfig::default());
    let session = reg.create("u", Tier::Basic, HashMap::new()).unwrap();
    reg.track_usage(&session.id, TOKENS, 25_000).unwrap();
    let _permit = reg.manage_concurrency(&session.id, Operation::Chat).unwrap();

    let quota = reg.get_quota(&session.id).unwrap();
    assert_eq!(quota.len(), ResourceDimension::ALL.len());
    let tokens = &quota[&TOKENS];
    assert_eq!(tokens.limit, 100_000);
    assert_eq!(tokens.remaining, 75_000);
    assert!((tokens.pct - 25.0).abs() < 1e-9);
    let concurrent = &quota[&ResourceDimension::ConcurrentOperations];
    assert_eq!((concurrent.used, concurrent.limit), (1, 4));
}

// ========== Rate limiter ==========

fn limiter(ceilings: Vec<RateCeiling>) -> (RateLimiter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let mut policy = TierPolicy::for_tier(Tier::Free);
    policy.rate = ceilings;
    (RateLimiter::new(&policy, clock.clone()).unwrap(), clock)
}

#[test]
fn test_sixth_call_in_ten_seconds_rejected() {
    let (rate, clock) = limiter(vec![RateCeiling::new(Duration::from_secs(10), 5)]);
    for _ in 0..5 {
        rate.check(Operation::Chat).unwrap();
        clock.advance(Duration::from_millis(500));
    }
    clock.advance(Duration::from_secs(1));
    let err = rate.check(Operation::Chat).unwrap_err();
    let retry_after = err.retry_after().unwrap();
    assert!(retry_after <= Duration::from_secs(10));
    assert_eq!(retry_after, Duration::from_millis(6_500));
}

#[test]
fn test_rejected_calls_are_not_recorded() {
    let (rate, clock) = limiter(vec![RateCeiling::new(Duration::from_secs(10), 1)]);
    rate.check(Operation::Chat).unwrap();
    for _ in 0..5 {
        assert!(rate.check(Operation::Chat).is_err());
    }
    assert_eq!(rate.usage(Operation::Chat)[0].used, 1);
    clock.advance(Duration::from_secs(10));
    rate.check(Operation::Chat).unwrap();
}

#[test]
fn test_tightest_window_sets_retry_after() {
    let (rate, clock) = limiter(vec![RateCeiling::per_second(2), RateCeiling::per_minute(3)]);
    rate.check(Operation::Chat).unwrap();
    rate.check(Operation::Chat).unwrap();
    let err = rate.check(Operation::Chat).unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

    clock.advance(Duration::from_secs(1));
    rate.check(Operation::Chat).unwrap();
    let err = rate.check(Operation::Chat).unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(59)));
}

#[test]
fn test_subsecond_window_is_enforced() {
    let (rate, clock) = limiter(vec![RateCeiling::new(Duration::from_millis(500), 1)]);
    rate.check(Operation::Chat).unwrap();
    for _ in 0..9 {
        assert!(rate.check(Operation::Chat).is_err());
    }
    clock.advance(Duration::from_millis(200));
    let err = rate.check(Operation::Chat).unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_millis(300)));
    clock.advance(Duration::from_millis(300));
    rate.check(Operation::Chat).unwrap();
    assert_eq!(rate.usage(Operation::Chat)[0].window_ms, 500);
}

#[test]
fn test_zero_window_rejected_at_construction() {
    let mut policy = TierPolicy::for_tier(Tier::Free);
    policy.rate = vec![RateCeiling::new(Duration::from_micros(10), 1)];
    let err = RateLimiter::new(&policy, Arc::new(ManualClock::new())).unwrap_err();
    assert!(matches!(err, GovernError::Config(_)));
}

#[test]
fn test_operations_are_limited_independently() {
    let (rate, _) = limiter(vec![RateCeiling::per_minute(1)]);
    rate.check(Operation::Chat).unwrap();
    rate.check(Operation::MemorySearch).unwrap();
    assert!(rate.check(Operation::Chat).is_err());
}

#[test]
fn test_rate_override_per_operation() {
    let clock = Arc::new(ManualClock::new());
    let mut policy = TierPolicy::for_tier(Tier::Pro);
    policy
        .rate_overrides
        .insert(Operation::WebSearch, vec![RateCeiling::per_hour(1)]);
    let rate = RateLimiter::new(&policy, clock).unwrap();
    rate.check(Operation::WebSearch).unwrap();
    assert!(rate.check(Operation::WebSearch).is_err());
    rate.check(Operation::Chat).unwrap();
    rate.check(Operation::Chat).unwrap();
    let usage = rate.usage(Operation::WebSearch);
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].window_ms, 3_600_000);
    assert_eq!(usage[0].remaining, 0);
}

// ========== Concurrency guard ==========

#[test]
fn test_per_operation_and_total_ceilings() {
    let guard = Arc::new(ConcurrencyGuard::new(2, 3));
    let a = guard.enter(Operation::Chat).unwrap();
    let _b = guard.enter(Operation::Chat).unwrap();
    let err = guard.enter(Operation::Chat).unwrap_err();
    assert!(matches!(err, GovernError::ConcurrencyExceeded { in_flight: 2, limit: 2, .. }));

    let _c = guard.enter(Operation::MemorySearch).unwrap();
    let err = guard.enter(Operation::MemoryWrite).unwrap_err();
    assert!(matches!(err, GovernError::ConcurrencyExceeded { in_flight: 3, limit: 3, .. }));
    // the per-operation slot taken before the session ceiling refused is handed back
    assert_eq!(guard.in_flight(Operation::MemoryWrite), 0);

    drop(a);
    assert_eq!(guard.in_flight(Operation::Chat), 1);
    guard.enter(Operation::MemoryWrite).unwrap();
}

#[test]
fn test_permit_released_on_panic() {
    let guard = Arc::new(ConcurrencyGuard::new(1, 1));
    let g = guard.clone();
    let result = std::thread::spawn(move || {
        let _permit = g.enter(Operation::Chat).unwrap();
        panic!("operation blew up");
    })
    .join();
    assert!(result.is_err());
    assert_eq!(guard.in_flight_total(), 0);
}

#[tokio::test]
async fn test_permit_released_on_cancellation() {
    let guard = Arc::new(ConcurrencyGuard::new(4, 4));
    let g = guard.clone();
    let task = tokio::spawn(async move {
        let _permit = g.enter(Operation::ChatStream).unwrap();
        tokio::time::sleep(Duration::from_secs(3_600)).await;
    });
    tokio::task::yield_now().await;
    while guard.in_flight_total() == 0 {
        tokio::task::yield_now().await;
    }
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(guard.in_flight_total(), 0);
}

// ========== Session lifecycle ==========

#[test]
fn test_status_transitions() {
    let (reg, clock) = registry(TollgateConfig::default());
    let session = reg.create("u", Tier::Free, HashMap::new()).unwrap();
    assert_eq!(session.status(), SessionStatus::Active);

    clock.advance(Duration::from_secs(300));
    assert_eq!(session.status(), SessionStatus::Idle);
    reg.touch(&session.id).unwrap();
    assert_eq!(session.status(), SessionStatus::Active);

    clock.advance(Duration::from_secs(1_800));
    assert_eq!(session.status(), SessionStatus::Expired);
    assert!(matches!(reg.touch(&session.id), Err(GovernError::SessionExpired { .. })));
    assert!(matches!(
        reg.track_usage(&session.id, ResourceDimension::ApiCalls, 1),
        Err(GovernError::SessionExpired { .. })
    ));
}

#[test]
fn test_sweep_reclaims_expired_sessions() {
    let (reg, clock) = registry(TollgateConfig::default());
    let stale = reg.create("u1", Tier::Free, HashMap::new()).unwrap();
    clock.advance(Duration::from_secs(1_000));
    let fresh = reg.create("u2", Tier::Free, HashMap::new()).unwrap();
    clock.advance(Duration::from_secs(900));

    let report = reg.sweep();
    assert_eq!(report.expired, 1);
    assert_eq!(report.idle, 1);
    assert!(reg.get(&stale.id).is_none());
    assert!(reg.get(&fresh.id).is_some());
    assert_eq!(stale.status(), SessionStatus::Terminated);
}

#[test]
fn test_terminate_frees_everything() {
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    reg.track_usage(&session.id, TOKENS, 500).unwrap();
    reg.remember(&session.id, MemoryRecord::new("fact").with_key("k")).unwrap();
    let stream = reg.stream_open(&session.id, Operation::ChatStream).unwrap();
    let sub = stream.subscribe();
    stream.emit("partial").unwrap();

    reg.terminate(&session.id).unwrap();

    assert!(reg.get(&session.id).is_none());
    assert_eq!(session.status(), SessionStatus::Terminated);
    assert!(session.memory().is_empty());
    assert_eq!(session.quota().usage(TOKENS).unwrap().used, 0);
    assert_eq!(stream.status(), StreamStatus::Cancelled);
    assert_eq!(session.concurrency().in_flight_total(), 0);
    let last = std::iter::from_fn(|| sub.try_next()).last().unwrap();
    assert!(last.is_failure());
    assert!(matches!(reg.terminate(&session.id), Err(GovernError::SessionNotFound { .. })));
    assert!(matches!(session.touch(), Err(GovernError::SessionNotFound { .. })));
}

#[test]
fn test_list_by_user_and_metadata() {
    let (reg, _) = registry(TollgateConfig::default());
    let meta = HashMap::from([("client".to_string(), serde_json::json!("cli"))]);
    let s = reg.create("alice", Tier::Free, meta).unwrap();
    reg.create("alice", Tier::Basic, HashMap::new()).unwrap();
    reg.create("bob", Tier::Free, HashMap::new()).unwrap();

    assert_eq!(reg.count(), 3);
    assert_eq!(reg.list().len(), 3);
    assert_eq!(reg.list_by_user("alice").len(), 2);
    assert_eq!(s.metadata("client"), Some(serde_json::json!("cli")));
    s.set_metadata("client", serde_json::json!("web"));
    assert_eq!(s.info().metadata["client"], serde_json::json!("web"));
}

#[test]
fn test_unknown_session() {
    let (reg, _) = registry(TollgateConfig::default());
    assert!(reg.get("missing").is_none());
    assert!(matches!(reg.touch("missing"), Err(GovernError::SessionNotFound { .. })));
    assert!(matches!(reg.get_quota("missing"), Err(GovernError::SessionNotFound { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_background_sweeper() {
    let mut config = TollgateConfig::default();
    config.sessions.sweep_interval_secs = 5;
    let clock = Arc::new(ManualClock::new());
    let reg = Arc::new(SessionRegistry::new(config, clock.clone()));
    let session = reg.create("u", Tier::Free, HashMap::new()).unwrap();
    let sweeper = reg.spawn_sweeper();

    clock.advance(Duration::from_secs(1_800));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(reg.get(&session.id).is_none());
    sweeper.shutdown().await;
}

// ========== Operation admission ==========

#[test]
fn test_feature_gate_rejects_before_charging() {
    let (reg, _) = registry(TollgateConfig::default());
    let session = reg.create("u", Tier::Free, HashMap::new()).unwrap();
    let err = reg
        .begin(&session.id, Operation::WebSearch, &[(TOKENS, 100)])
        .err()
        .unwrap();
    assert!(matches!(err, GovernError::FeatureDisabled { .. }));
    assert_eq!(session.quota().usage(TOKENS).unwrap().used, 0);
    assert_eq!(session.concurrency().in_flight_total(), 0);
}

#[test]
fn test_complete_refunds_unconsumed() {
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let op = reg
        .begin(&session.id, Operation::Chat, &[(TOKENS, 1_000), (ResourceDimension::ApiCalls, 1)])
        .unwrap();
    assert_eq!(op.reserved(TOKENS), 1_000);
    assert_eq!(session.concurrency().in_flight(Operation::Chat), 1);

    assert_eq!(op.complete(&[(TOKENS, 240)]), 760);
    let quota = session.quota().snapshot();
    assert_eq!(quota[&TOKENS].used, 240);
    assert_eq!(quota[&ResourceDimension::ApiCalls].used, 1);
    assert_eq!(session.concurrency().in_flight_total(), 0);
}

#[test]
fn test_dropped_operation_rolls_back() {
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    {
        let _op = reg.begin(&session.id, Operation::Chat, &[(TOKENS, 500)]).unwrap();
        assert_eq!(session.quota().usage(TOKENS).unwrap().used, 500);
    }
    assert_eq!(session.quota().usage(TOKENS).unwrap().used, 0);
    assert_eq!(session.concurrency().in_flight_total(), 0);
}

#[test]
fn test_rate_rejection_rolls_back_quota_and_permit() {
    let config = config_with(Tier::Pro, |p| p.rate = vec![RateCeiling::per_minute(1)]);
    let (reg, _) = registry(config);
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();

    reg.begin(&session.id, Operation::Chat, &[(TOKENS, 10)])
        .unwrap()
        .complete(&[]);
    let err = reg
        .begin(&session.id, Operation::Chat, &[(TOKENS, 10)])
        .err()
        .unwrap();
    assert!(matches!(err, GovernError::RateLimited { .. }));
    assert_eq!(session.quota().usage(TOKENS).unwrap().used, 10);
    assert_eq!(session.concurrency().in_flight_total(), 0);
}

#[test]
fn test_quota_rejection_releases_permit() {
    let config = config_with(Tier::Pro, |p| {
        p.quotas.insert(TOKENS, QuotaPolicy { limit: 50, window: QuotaWindow::Lifetime });
    });
    let (reg, _) = registry(config);
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let err = reg
        .begin(&session.id, Operation::Chat, &[(ResourceDimension::ApiCalls, 1), (TOKENS, 51)])
        .err()
        .unwrap();
    assert!(matches!(err, GovernError::QuotaExceeded { limit: 50, .. }));
    let quota = session.quota().snapshot();
    assert_eq!(quota[&ResourceDimension::ApiCalls].used, 0);
    assert_eq!(session.concurrency().in_flight_total(), 0);
}

#[test]
fn test_concurrent_begin_over_ceiling() {
    let (reg, _) = registry(config_with(Tier::Pro, |p| p.max_concurrent_per_operation = 1));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let _first = reg.begin(&session.id, Operation::Chat, &[]).unwrap();
    let err = reg.begin(&session.id, Operation::Chat, &[]).err().unwrap();
    assert!(matches!(err, GovernError::ConcurrencyExceeded { .. }));
}

// ========== Memory context ==========

#[test]
fn test_remember_charges_and_refunds_storage() {
    let config = config_with(Tier::Pro, |p| p.memory_capacity = 2);
    let (reg, _) = registry(config);
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let storage = ResourceDimension::StorageBytes;

    reg.remember(&session.id, MemoryRecord::new(vec![0u8; 100]).with_key("a")).unwrap();
    reg.remember(&session.id, MemoryRecord::new(vec![0u8; 50]).with_key("b")).unwrap();
    assert_eq!(session.quota().usage(storage).unwrap().used, 150);

    // overwrite refunds the old payload
    reg.remember(&session.id, MemoryRecord::new(vec![0u8; 10]).with_key("a")).unwrap();
    assert_eq!(session.quota().usage(storage).unwrap().used, 60);

    // a third record evicts one of the two
    reg.remember(&session.id, MemoryRecord::new(vec![0u8; 5]).with_key("c")).unwrap();
    assert_eq!(session.memory().len(), 2);
    assert_eq!(session.quota().usage(storage).unwrap().used, session.memory().total_bytes());

    assert!(reg.forget(&session.id, "c").unwrap());
    assert!(!reg.forget(&session.id, "c").unwrap());
    assert_eq!(session.quota().usage(storage).unwrap().used, session.memory().total_bytes());
}

#[test]
fn test_remember_over_storage_quota() {
    let config = config_with(Tier::Pro, |p| {
        p.quotas
            .insert(ResourceDimension::StorageBytes, QuotaPolicy { limit: 64, window: QuotaWindow::Lifetime });
    });
    let (reg, _) = registry(config);
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let err = reg
        .remember(&session.id, MemoryRecord::new(vec![0u8; 65]).with_key("big"))
        .unwrap_err();
    assert!(matches!(err, GovernError::QuotaExceeded { .. }));
    assert!(session.memory().is_empty());
}

#[test]
fn test_recall_returns_nearest() {
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    reg.remember(&session.id, MemoryRecord::new("east").with_embedding(vec![1.0, 0.0, 0.0])).unwrap();
    reg.remember(&session.id, MemoryRecord::new("north").with_embedding(vec![0.0, 1.0, 0.0])).unwrap();
    let hits = reg.recall(&session.id, &[0.9, 0.1, 0.0], 1).unwrap();
    assert_eq!(hits[0].0.payload_text(), Some("east"));
    assert!(matches!(reg.recall(&session.id, &[1.0], 1), Err(GovernError::Memory(_))));
}

// ========== Persistence ==========

#[tokio::test]
async fn test_close_saves_memory_for_next_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with(Tier::Pro, |_| {});
    config.memory.persist_dir = Some(dir.path().to_path_buf());
    let (reg, _) = registry(config);
    assert!(reg.has_persistence());

    let first = reg.create("alice", Tier::Pro, HashMap::new()).unwrap();
    reg.remember(&first.id, MemoryRecord::new("likes tea").with_key("drink")).unwrap();
    reg.remember(&first.id, MemoryRecord::new("east").with_embedding(vec![1.0, 0.0, 0.0])).unwrap();
    assert_eq!(reg.close(&first.id).await.unwrap(), 2);
    assert!(reg.get(&first.id).is_none());
    assert!(dir.path().join("alice.jsonl").exists());

    let second = reg.create("alice", Tier::Pro, HashMap::new()).unwrap();
    assert_eq!(reg.restore(&second.id).await.unwrap(), 2);
    assert_eq!(reg.lookup(&second.id, "drink").unwrap().unwrap().payload_text(), Some("likes tea"));
    assert_eq!(reg.recall(&second.id, &[1.0, 0.0, 0.0], 1).unwrap()[0].0.payload_text(), Some("east"));
    let storage = second.quota().usage(ResourceDimension::StorageBytes).unwrap();
    assert_eq!(storage.used, "likes tea".len() as u64 + "east".len() as u64);

    // another user starts empty
    let other = reg.create("bob", Tier::Pro, HashMap::new()).unwrap();
    assert_eq!(reg.restore(&other.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_close_without_persistence_only_terminates() {
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    assert!(!reg.has_persistence());
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    reg.remember(&session.id, MemoryRecord::new("fact")).unwrap();
    assert_eq!(reg.close(&session.id).await.unwrap(), 0);
    assert_eq!(reg.count(), 0);
    assert!(matches!(reg.close(&session.id).await, Err(GovernError::SessionNotFound { .. })));
}

#[tokio::test]
async fn test_failed_save_still_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    let reg = reg.with_persistence(Arc::new(tg_memory::JsonlPersistence::new(dir.path())));
    let session = reg.create("not a scope", Tier::Pro, HashMap::new()).unwrap();
    reg.remember(&session.id, MemoryRecord::new("fact")).unwrap();
    assert!(matches!(reg.close(&session.id).await, Err(GovernError::Memory(_))));
    assert!(reg.get(&session.id).is_none());
}

#[tokio::test]
async fn test_restore_stops_at_storage_quota() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with(Tier::Pro, |p| {
        p.quotas
            .insert(ResourceDimension::StorageBytes, QuotaPolicy { limit: 10, window: QuotaWindow::Lifetime });
    });
    config.memory.persist_dir = Some(dir.path().to_path_buf());
    let (reg, _) = registry(config);
    let persistence = tg_memory::JsonlPersistence::new(dir.path());
    let saved = vec![
        MemoryRecord::new(vec![0u8; 6]).with_key("a"),
        MemoryRecord::new(vec![0u8; 6]).with_key("b"),
    ];
    tg_memory::MemoryPersistence::save(&persistence, "carol", &saved).await.unwrap();

    let session = reg.create("carol", Tier::Pro, HashMap::new()).unwrap();
    let err = reg.restore(&session.id).await.unwrap_err();
    assert!(matches!(err, GovernError::QuotaExceeded { .. }));
    assert_eq!(session.memory().len(), 1);
    assert_eq!(session.quota().usage(ResourceDimension::StorageBytes).unwrap().used, 6);
}

// ========== Streaming ==========

#[test]
fn test_stream_through_registry() {
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let stream = reg.stream_open(&session.id, Operation::ChatStream).unwrap();
    let early = reg.stream_subscribe(&session.id, stream.id()).unwrap();

    reg.stream_emit(&session.id, stream.id(), "Hel", false).unwrap();
    reg.stream_emit(&session.id, stream.id(), "lo", false).unwrap();
    reg.stream_emit(&session.id, stream.id(), "Hello!", true).unwrap();
    let late = reg.stream_subscribe(&session.id, stream.id()).unwrap();
    reg.stream_complete(&session.id, stream.id()).unwrap();

    let mut seen = Vec::new();
    let mut transcript = Transcript::new();
    while let Some(event) = early.try_next() {
        transcript.apply(&event);
        seen.push(transcript.text().to_string());
    }
    assert!(seen.contains(&"Hello".to_string()));
    assert_eq!(transcript.text(), "Hello!");

    let first = late.try_next().unwrap();
    assert!(first.replace);
    assert_eq!(first.payload, "Hello!");

    let bandwidth = session.quota().usage(ResourceDimension::BandwidthBytes).unwrap();
    assert_eq!(bandwidth.used, 11);
    let info = reg.stream_status(&session.id, stream.id()).unwrap();
    assert_eq!(info.status, StreamStatus::Completed);
}

#[test]
fn test_stream_emit_over_bandwidth_rejected() {
    let config = config_with(Tier::Pro, |p| {
        p.quotas
            .insert(ResourceDimension::BandwidthBytes, QuotaPolicy { limit: 4, window: QuotaWindow::DAILY });
    });
    let (reg, _) = registry(config);
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let stream = reg.stream_open(&session.id, Operation::ChatStream).unwrap();
    let sub = stream.subscribe();
    reg.stream_emit(&session.id, stream.id(), "abcd", false).unwrap();
    assert!(reg.stream_emit(&session.id, stream.id(), "e", false).is_err());
    assert_eq!(stream.info().sequence, 1);
    assert_eq!(sub.try_next().unwrap().payload, "abcd");
}

#[test]
fn test_emit_to_finished_stream_refunds_bandwidth() {
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let stream = reg.stream_open(&session.id, Operation::ChatStream).unwrap();
    reg.stream_fail(&session.id, stream.id(), "upstream error").unwrap();
    let err = reg.stream_emit(&session.id, stream.id(), "late", false).unwrap_err();
    assert!(matches!(err, GovernError::StreamTerminated { .. }));
    assert_eq!(session.quota().usage(ResourceDimension::BandwidthBytes).unwrap().used, 0);
}

#[test]
fn test_open_streams_bounded_by_concurrency() {
    let (reg, clock) = registry(TollgateConfig::default());
    let session = reg.create("u", Tier::Free, HashMap::new()).unwrap();
    let api_calls = || session.quota().usage(ResourceDimension::ApiCalls).unwrap().used;

    let first = reg.stream_open(&session.id, Operation::ChatStream).unwrap();
    for _ in 0..50 {
        let err = reg.stream_open(&session.id, Operation::ChatStream).err().unwrap();
        assert!(matches!(err, GovernError::ConcurrencyExceeded { limit: 1, .. }));
    }
    assert_eq!(session.concurrency().in_flight(Operation::ChatStream), 1);
    assert_eq!(api_calls(), 1);
    assert_eq!(session.rate().usage(Operation::ChatStream)[0].used, 1);
    assert_eq!(reg.active_streams(&session.id).unwrap().len(), 1);

    reg.stream_complete(&session.id, first.id()).unwrap();
    assert_eq!(session.concurrency().in_flight_total(), 0);
    assert_eq!(api_calls(), 1);
    assert!(reg.active_streams(&session.id).unwrap().is_empty());

    clock.advance(Duration::from_secs(1));
    let second = reg.stream_open(&session.id, Operation::ChatStream).unwrap();
    reg.stream_cancel(&session.id, second.id()).unwrap();
    assert_eq!(session.concurrency().in_flight_total(), 0);
    assert_eq!(api_calls(), 2);
}

#[test]
fn test_rate_limited_stream_open_charges_nothing() {
    let (reg, _) = registry(config_with(Tier::Pro, |p| p.rate = vec![RateCeiling::per_minute(1)]));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let stream = reg.stream_open(&session.id, Operation::ChatStream).unwrap();
    reg.stream_complete(&session.id, stream.id()).unwrap();

    let err = reg.stream_open(&session.id, Operation::ChatStream).err().unwrap();
    assert!(matches!(err, GovernError::RateLimited { .. }));
    assert_eq!(session.quota().usage(ResourceDimension::ApiCalls).unwrap().used, 1);
    assert_eq!(session.concurrency().in_flight_total(), 0);
}

#[test]
fn test_pause_and_resume_through_registry() {
    let (reg, _) = registry(config_with(Tier::Pro, |_| {}));
    let session = reg.create("u", Tier::Pro, HashMap::new()).unwrap();
    let stream = reg.stream_open(&session.id, Operation::ChatStream).unwrap();
    let sub = reg.stream_subscribe(&session.id, stream.id()).unwrap();

    assert!(reg.stream_pause(&session.id, stream.id()).unwrap());
    reg.stream_emit(&session.id, stream.id(), "held", false).unwrap();
    assert!(sub.try_next().is_none());
    let active = reg.active_streams(&session.id).unwrap();
    assert_eq!(active[0].status, StreamStatus::Paused);

    assert!(reg.stream_resume(&session.id, stream.id()).unwrap());
    let event = sub.try_next().unwrap();
    assert!(event.replace);
    assert_eq!(event.payload, "held");
    assert_eq!(session.concurrency().in_flight(Operation::ChatStream), 1);
}

#[test]
fn test_stream_open_requires_feature() {
    let config = config_with(Tier::Free, |p| p.features.clear());
    let (reg, _) = registry(config);
    let session = reg.create("u", Tier::Free, HashMap::new()).unwrap();
    let err = reg.stream_open(&session.id, Operation::ChatStream).err().unwrap();
    assert!(matches!(err, GovernError::FeatureDisabled { .. }));
}
