#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for the query cache, mutation-driven invalidation and
//! their interaction with the session, through the full coordinator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{coordinator, drain, quiet_config, session, settle, MockBackend};
use heist_sync::{
    CacheKey, CacheState, ErrorCode, EventKind, MemoryStorage, MutationKind, SessionCoordinator,
    SyncError, SyncEvent,
};
use serde_json::json;

async fn signed_in(backend: &Arc<MockBackend>) -> SessionCoordinator {
    signed_in_with(backend, quiet_config()).await
}

async fn signed_in_with(
    backend: &Arc<MockBackend>,
    config: heist_sync::SyncConfig,
) -> SessionCoordinator {
    let (coordinator, _platform) = coordinator(backend, Arc::new(MemoryStorage::new()), config);
    coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    settle().await;
    coordinator
}

// ── Mutations ───────────────────────────────────────────────────────

#[tokio::test]
async fn attack_refetches_ap_and_leaderboard_once_each() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let cache = coordinator.cache();

    let ap = CacheKey::from("ap-status");
    let board = CacheKey::with_arg("leaderboard", "8A");
    let profile = CacheKey::from("profile");
    for key in [&ap, &board, &profile] {
        assert_eq!(cache.fetch(key).await.unwrap().state, CacheState::Fresh);
    }

    let (_, keys) = coordinator
        .executor()
        .execute_reporting(MutationKind::Attack, json!({ "p_target": "u-7" }))
        .await
        .unwrap();
    assert_eq!(keys, vec![ap.clone(), board.clone()]);
    assert_eq!(cache.peek(&ap).unwrap().state, CacheState::Stale);
    assert_eq!(cache.peek(&board).unwrap().state, CacheState::Stale);
    assert_eq!(cache.peek(&profile).unwrap().state, CacheState::Fresh);

    // The next reads serve the old value while one fetch per key runs.
    for _ in 0..3 {
        let entry = cache.read(&ap);
        assert_eq!(entry.state, CacheState::Fetching);
        assert!(entry.value.is_some());
        cache.read(&board);
        cache.read(&profile);
    }
    settle().await;

    assert_eq!(backend.calls_to("ap_status"), 2);
    assert_eq!(backend.calls_to("leaderboard_rows"), 2);
    assert_eq!(backend.calls_to("who_am_i"), 1);
    assert_eq!(
        cache.peek(&ap).unwrap().value,
        Some(json!({ "procedure": "ap_status", "n": 2 }))
    );
}

#[tokio::test]
async fn profile_update_invalidates_only_its_batch() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let cache = coordinator.cache();

    let own = CacheKey::with_arg("leaderboard", "8A");
    let other = CacheKey::with_arg("leaderboard", "8B");
    cache.fetch(&own).await.unwrap();
    cache.fetch(&other).await.unwrap();
    cache.fetch(&CacheKey::from("profile")).await.unwrap();

    let (_, keys) = coordinator
        .executor()
        .execute_reporting(MutationKind::ProfileUpdate, json!({ "p_batch": "8A" }))
        .await
        .unwrap();

    assert_eq!(keys, vec![own.clone(), CacheKey::from("profile")]);
    assert_eq!(cache.peek(&other).unwrap().state, CacheState::Fresh);
}

#[tokio::test]
async fn failed_mutation_invalidates_nothing() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let ap = CacheKey::from("ap-status");
    coordinator.cache().fetch(&ap).await.unwrap();
    let mut events = coordinator.subscribe_events();

    backend.respond(
        "raid_attack",
        Err(SyncError::backend(ErrorCode::InsufficientAp, "not enough AP")),
    );
    let err = coordinator
        .executor()
        .execute(MutationKind::Attack, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::Backend {
            code: ErrorCode::InsufficientAp,
            ..
        }
    ));
    assert_eq!(
        coordinator.cache().peek(&ap).unwrap().state,
        CacheState::Fresh
    );
    assert!(drain(&mut events).is_empty());
    assert!(coordinator.store().current().is_some());
}

#[tokio::test(start_paused = true)]
async fn timed_out_mutation_invalidates_nothing() {
    let backend = MockBackend::new();
    let coordinator = signed_in_with(
        &backend,
        quiet_config().with_fetch_timeout(Duration::from_secs(2)),
    )
    .await;
    let ap = CacheKey::from("ap-status");
    coordinator.cache().fetch(&ap).await.unwrap();

    let _held = backend.gate("raid_attack");
    let err = coordinator
        .executor()
        .execute(MutationKind::Attack, json!({}))
        .await
        .unwrap_err();

    assert_eq!(err, SyncError::Timeout);
    assert_eq!(
        coordinator.cache().peek(&ap).unwrap().state,
        CacheState::Fresh
    );
}

#[tokio::test]
async fn mutation_while_signed_out_makes_no_call() {
    let backend = MockBackend::new();
    let (coordinator, _platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());
    coordinator.install().await.unwrap();

    let err = coordinator
        .executor()
        .execute(MutationKind::JobStart, json!({}))
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::NoSession);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn mutation_success_reports_invalidation_event() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let jobs = CacheKey::from("jobs");
    coordinator.cache().fetch(&jobs).await.unwrap();
    let mut events = coordinator.subscribe_events();

    coordinator
        .executor()
        .execute(MutationKind::JobClaim, json!({}))
        .await
        .unwrap();

    assert_eq!(
        drain(&mut events),
        vec![SyncEvent::Invalidated {
            event: EventKind::MutationSucceeded(MutationKind::JobClaim),
            keys: vec![jobs],
        }]
    );
}

// ── Reads ───────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_fetches_of_one_key_share_a_call() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let cache = coordinator.cache();
    let inventory = CacheKey::from("inventory");
    let gate = backend.gate("inventory");

    let (a, b, c, ()) = tokio::join!(
        cache.fetch(&inventory),
        cache.fetch(&inventory),
        cache.fetch(&inventory),
        async {
            settle().await;
            gate.notify_one();
        }
    );

    assert_eq!(backend.calls_to("inventory"), 1);
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(a.state, CacheState::Fresh);
}

#[tokio::test]
async fn failed_refetch_keeps_serving_last_value() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let cache = coordinator.cache();
    let clan = CacheKey::from("clan");
    cache.fetch(&clan).await.unwrap();

    coordinator.request_manual_refresh();
    backend.respond("clan_info", Err(SyncError::Transport("reset by peer".into())));
    let entry = cache.fetch(&clan).await.unwrap();

    assert_eq!(entry.state, CacheState::Error);
    assert_eq!(
        entry.value,
        Some(json!({ "procedure": "clan_info", "n": 1 }))
    );
    assert_eq!(
        entry.error,
        Some(SyncError::Transport("reset by peer".into()))
    );
    assert!(!entry.is_signed_out());

    // A transient error retries on the next read.
    let entry = cache.fetch(&clan).await.unwrap();
    assert_eq!(entry.state, CacheState::Fresh);
    assert_eq!(backend.calls_to("clan_info"), 3);
}

#[tokio::test]
async fn subscribed_key_refetches_on_invalidation() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let ap = CacheKey::from("ap-status");

    let mut sub = coordinator.cache().subscribe(&ap);
    sub.wait_for(|e| e.state == CacheState::Fresh).await.unwrap();
    assert!(coordinator.cache().is_subscribed(&ap));

    coordinator
        .executor()
        .execute(MutationKind::Attack, json!({}))
        .await
        .unwrap();

    let entry = sub
        .wait_for(|e| e.state == CacheState::Fresh && e.value.as_ref().is_some_and(|v| v["n"] == 2))
        .await
        .unwrap();
    assert_eq!(entry.key, ap);
    assert_eq!(backend.calls_to("ap_status"), 2);

    drop(sub);
    assert!(!coordinator.cache().is_subscribed(&ap));
}

#[tokio::test]
async fn invalidation_during_fetch_lands_stale_then_refetches() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let ap = CacheKey::from("ap-status");
    let gate = backend.gate("ap_status");

    let mut sub = coordinator.cache().subscribe(&ap);
    settle().await;
    assert_eq!(sub.current().state, CacheState::Fetching);

    coordinator
        .executor()
        .execute(MutationKind::JobStart, json!({}))
        .await
        .unwrap();

    gate.notify_one();
    settle().await;
    assert_eq!(backend.calls_to("ap_status"), 2, "refetched after landing");

    gate.notify_one();
    let entry = sub
        .wait_for(|e| e.state == CacheState::Fresh)
        .await
        .unwrap();
    assert_eq!(entry.value, Some(json!({ "procedure": "ap_status", "n": 2 })));
}

// ── Session interaction ─────────────────────────────────────────────

#[tokio::test]
async fn sign_out_purges_values_and_reads_do_not_retry() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let cache = coordinator.cache();
    let profile = CacheKey::from("profile");
    cache.fetch(&profile).await.unwrap();

    coordinator.sign_out().await.unwrap();
    settle().await;
    let purged = cache.peek(&profile).unwrap();
    assert_eq!(purged.value, None);
    assert_eq!(purged.fetched_at, None);

    let entry = cache.fetch(&profile).await.unwrap();
    assert!(entry.is_signed_out());
    assert_eq!(entry.error, Some(SyncError::NoSession));

    cache.read(&profile);
    settle().await;
    assert_eq!(backend.calls_to("who_am_i"), 1);
    assert!(cache.peek(&profile).unwrap().is_signed_out());
}

#[tokio::test]
async fn rejected_read_clears_value_but_keeps_session() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let news = CacheKey::from("news");
    coordinator.cache().fetch(&news).await.unwrap();

    coordinator.request_manual_refresh();
    backend.respond(
        "news_feed",
        Err(SyncError::backend(ErrorCode::InvalidToken, "jwt expired")),
    );
    let entry = coordinator.cache().fetch(&news).await.unwrap();

    assert!(entry.is_signed_out());
    assert_eq!(entry.value, None);
    assert!(
        coordinator.store().current().is_some(),
        "only the refresh path signs out"
    );
}

#[tokio::test]
async fn signing_in_again_refreshes_stale_reads_with_new_token() {
    let backend = MockBackend::new();
    let coordinator = signed_in(&backend).await;
    let raid = CacheKey::from("raid-targets");
    coordinator.cache().fetch(&raid).await.unwrap();

    coordinator.sign_in(session("b")).await.unwrap();
    settle().await;
    coordinator.cache().fetch(&raid).await.unwrap();

    let tokens: Vec<String> = backend
        .calls()
        .into_iter()
        .filter(|(procedure, _, _)| procedure == "raid_targets")
        .map(|(_, token, _)| token)
        .collect();
    assert_eq!(tokens, vec!["access-a".to_string(), "access-b".to_string()]);
}
