#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for the coordinator lifecycle and the refresh policy,
//! driven through [`common::MockBackend`] and a host [`Platform`].

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    coordinator, drain, persisted_storage, quiet_config, session, settle, wait_for_event,
    MockBackend,
};
use heist_sync::storage::DEFAULT_NAMESPACE;
use heist_sync::{
    CacheKey, CacheState, ErrorClass, ErrorCode, EventKind, MemoryStorage, PlatformTrigger,
    SyncError, SyncEvent,
};

fn count(events: &[SyncEvent], predicate: impl Fn(&SyncEvent) -> bool) -> usize {
    events.iter().filter(|e| predicate(e)).count()
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_installs_collapse_onto_one_installation() {
    let backend = MockBackend::new();
    let (coordinator, platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());
    let mut events = coordinator.subscribe_events();

    let (a, b, c) = tokio::join!(
        coordinator.install(),
        coordinator.install(),
        coordinator.install()
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    settle().await;

    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(platform.listener_count(), 5);

    let events = drain(&mut events);
    assert_eq!(
        events,
        vec![SyncEvent::Installed { restored: false }],
        "one install, one Installed event"
    );
}

#[tokio::test]
async fn teardown_is_idempotent_and_reinstall_gets_new_handle() {
    let backend = MockBackend::new();
    let (coordinator, platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());

    let first = coordinator.install().await.unwrap();
    coordinator.teardown(&first).await;
    coordinator.teardown(&first).await;
    assert_eq!(platform.listener_count(), 0);
    assert!(!coordinator.is_installed());

    let second = coordinator.install().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(platform.listener_count(), 5);

    // A handle from an earlier installation releases nothing.
    coordinator.teardown(&first).await;
    assert!(second.is_active());
    assert_eq!(platform.listener_count(), 5);
    assert_eq!(coordinator.current_handle(), Some(second.clone()));

    coordinator.teardown(&second).await;
    assert_eq!(platform.listener_count(), 0);
}

#[tokio::test]
async fn teardown_keeps_persisted_session_but_drops_memory() {
    let backend = MockBackend::new();
    let storage = Arc::new(MemoryStorage::new());
    let (coordinator, _platform) =
        coordinator(&backend, Arc::clone(&storage), quiet_config());

    let handle = coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    coordinator
        .cache()
        .fetch(&CacheKey::from("profile"))
        .await
        .unwrap();
    settle().await;

    coordinator.teardown(&handle).await;
    assert!(coordinator.store().current().is_none());
    assert!(coordinator.cache().is_empty());
    assert!(storage.snapshot(DEFAULT_NAMESPACE).is_some());

    // Reinstalling restores it.
    let mut events = coordinator.subscribe_events();
    coordinator.install().await.unwrap();
    assert_eq!(
        wait_for_event(&mut events, |e| matches!(e, SyncEvent::Installed { .. })).await,
        SyncEvent::Installed { restored: true }
    );
    assert_eq!(
        coordinator.store().current().unwrap().access_token,
        "access-a"
    );
}

#[tokio::test]
async fn shutdown_during_install_tears_it_down() {
    let backend = MockBackend::new();
    let (coordinator, platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());

    let (handle, ()) = tokio::join!(coordinator.install(), coordinator.shutdown());
    let handle = handle.unwrap();

    assert!(!handle.is_active());
    assert!(!coordinator.is_installed());
    assert_eq!(platform.listener_count(), 0);
}

// ── Credential changes ──────────────────────────────────────────────

#[tokio::test]
async fn credential_change_is_handled_after_the_caller_returns() {
    let backend = MockBackend::new();
    let (coordinator, _platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());
    coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    settle().await;

    let profile = CacheKey::from("profile");
    let entry = coordinator.cache().fetch(&profile).await.unwrap();
    assert_eq!(entry.state, CacheState::Fresh);

    let mut events = coordinator.subscribe_events();
    coordinator.sign_in(session("b")).await.unwrap();
    assert_eq!(
        coordinator.cache().peek(&profile).unwrap().state,
        CacheState::Fresh,
        "invalidation must not run on the sign-in caller's stack"
    );

    settle().await;
    assert_eq!(
        coordinator.cache().peek(&profile).unwrap().state,
        CacheState::Stale
    );
    let events = drain(&mut events);
    assert!(matches!(events[0], SyncEvent::SignedIn { .. }));
    assert_eq!(
        events[1],
        SyncEvent::Invalidated {
            event: EventKind::AuthChanged,
            keys: vec![profile],
        }
    );
}

#[tokio::test]
async fn sign_out_purges_cache_and_announces_once() {
    let backend = MockBackend::new();
    let (coordinator, _platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());
    coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    settle().await;

    let ap = CacheKey::from("ap-status");
    coordinator.cache().fetch(&ap).await.unwrap();
    let mut events = coordinator.subscribe_events();

    coordinator.sign_out().await.unwrap();
    coordinator.sign_out().await.unwrap();
    settle().await;

    assert_eq!(backend.sign_outs(), 1);
    assert!(coordinator.store().current().is_none());
    assert_eq!(coordinator.cache().peek(&ap).unwrap().value, None);

    let events = drain(&mut events);
    assert_eq!(count(&events, SyncEvent::requires_sign_in), 1);
}

// ── Refresh policy ──────────────────────────────────────────────────

#[tokio::test]
async fn restored_session_refreshes_on_process_start() {
    let backend = MockBackend::new();
    let (coordinator, _platform) =
        coordinator(&backend, persisted_storage(session("a")), quiet_config());
    let mut events = coordinator.subscribe_events();

    coordinator.install().await.unwrap();
    let first = wait_for_event(&mut events, |_| true).await;
    assert_eq!(first, SyncEvent::Installed { restored: true });
    wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::SessionRefreshed { .. })
    })
    .await;

    assert_eq!(backend.refreshes(), 1);
    assert_eq!(
        coordinator.store().current().unwrap().access_token,
        "access-refreshed-1"
    );
}

#[tokio::test]
async fn focus_burst_coalesces_into_one_refresh() {
    let backend = MockBackend::new();
    let (coordinator, platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());
    coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    settle().await;

    let gate = backend.gate_refresh();
    for _ in 0..5 {
        platform.emit(PlatformTrigger::WindowFocused);
    }
    settle().await;
    assert_eq!(backend.refreshes(), 1);
    assert!(coordinator.scheduler().is_refreshing());

    gate.notify_one();
    settle().await;
    assert_eq!(backend.refreshes(), 1);
    assert!(!coordinator.scheduler().is_refreshing());
    assert_eq!(
        coordinator.store().current().unwrap().access_token,
        "access-refreshed-1"
    );
}

#[tokio::test]
async fn rejected_refresh_signs_out_exactly_once() {
    let backend = MockBackend::new();
    let storage = persisted_storage(session("a"));
    let (coordinator, platform) = coordinator(&backend, Arc::clone(&storage), quiet_config());
    let mut events = coordinator.subscribe_events();

    let gate = backend.gate_refresh();
    backend.script_refresh(Err(SyncError::backend(
        ErrorCode::InvalidRefreshToken,
        "refresh token revoked",
    )));

    // Process start begins the refresh; three more triggers join it.
    coordinator.install().await.unwrap();
    settle().await;
    platform.emit(PlatformTrigger::WindowFocused);
    platform.emit(PlatformTrigger::NetworkOnline);
    platform.emit(PlatformTrigger::BecameVisible);
    settle().await;
    assert_eq!(backend.refreshes(), 1);

    gate.notify_one();
    settle().await;

    assert_eq!(backend.refreshes(), 1);
    assert!(coordinator.store().current().is_none());
    assert!(storage.snapshot(DEFAULT_NAMESPACE).is_none());

    let events = drain(&mut events);
    assert_eq!(count(&events, |e| *e == SyncEvent::SignedOut), 1);
    assert_eq!(
        count(&events, |e| matches!(e, SyncEvent::RefreshFailed { .. })),
        0,
        "a rejected refresh is reported as a sign-out only"
    );
}

#[tokio::test]
async fn transient_refresh_failure_keeps_session() {
    let backend = MockBackend::new();
    let (coordinator, platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());
    coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    settle().await;
    let mut events = coordinator.subscribe_events();

    backend.script_refresh(Err(SyncError::Transport("offline".into())));
    platform.emit(PlatformTrigger::WindowFocused);

    let failed =
        wait_for_event(&mut events, |e| matches!(e, SyncEvent::RefreshFailed { .. })).await;
    assert!(matches!(
        failed,
        SyncEvent::RefreshFailed {
            class: ErrorClass::Transient,
            ..
        }
    ));
    assert!(!failed.requires_sign_in());
    assert_eq!(
        coordinator.store().current().unwrap().access_token,
        "access-a"
    );

    // The next trigger retries.
    platform.emit(PlatformTrigger::WindowFocused);
    wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::SessionRefreshed { .. })
    })
    .await;
    assert_eq!(backend.refreshes(), 2);
}

#[tokio::test]
async fn triggers_while_signed_out_make_no_network_call() {
    let backend = MockBackend::new();
    let (coordinator, platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());
    let mut events = coordinator.subscribe_events();
    coordinator.install().await.unwrap();

    platform.emit(PlatformTrigger::WindowFocused);
    platform.emit(PlatformTrigger::BecameVisible);
    settle().await;

    assert_eq!(backend.refreshes(), 0);
    let events = drain(&mut events);
    assert_eq!(events, vec![SyncEvent::Installed { restored: false }]);
}

#[tokio::test]
async fn manual_refresh_invalidates_every_key() {
    let backend = MockBackend::new();
    let (coordinator, _platform) =
        coordinator(&backend, Arc::new(MemoryStorage::new()), quiet_config());
    coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    settle().await;

    let profile = CacheKey::from("profile");
    let ap = CacheKey::from("ap-status");
    coordinator.cache().fetch(&profile).await.unwrap();
    coordinator.cache().fetch(&ap).await.unwrap();

    let keys = coordinator.request_manual_refresh();
    assert_eq!(keys, vec![ap.clone(), profile.clone()]);
    assert_eq!(coordinator.cache().peek(&ap).unwrap().state, CacheState::Stale);
    assert_eq!(
        coordinator.cache().peek(&profile).unwrap().state,
        CacheState::Stale
    );
}

// ── Timers ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn interval_refresh_is_not_shifted_by_triggers() {
    let backend = MockBackend::new();
    let config = quiet_config().with_refresh_interval(Duration::from_secs(9 * 60));
    let (coordinator, platform) = coordinator(&backend, Arc::new(MemoryStorage::new()), config);
    coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    settle().await;

    let mut refreshes_at = Vec::new();
    for minute in 1..=27 {
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        match minute {
            2 => platform.emit(PlatformTrigger::BecameHidden),
            22 => platform.emit(PlatformTrigger::BecameVisible),
            _ => {}
        }
        settle().await;
        refreshes_at.push((minute, backend.refreshes()));
    }

    let at = |minute: usize| refreshes_at[minute - 1].1;
    assert_eq!(at(8), 0);
    assert_eq!(at(9), 1, "first refresh one interval after install");
    assert_eq!(at(18), 2, "hidden does not pause the interval");
    assert_eq!(at(21), 2);
    assert_eq!(at(22), 3, "becoming visible refreshes immediately");
    assert_eq!(at(26), 3, "the trigger did not reset the timer");
    assert_eq!(at(27), 4);
}

#[tokio::test(start_paused = true)]
async fn presence_pings_only_while_visible() {
    let backend = MockBackend::new();
    let config = quiet_config()
        .with_refresh_interval(Duration::from_secs(3600))
        .with_presence_interval(Some(Duration::from_secs(60)));
    let (coordinator, platform) = coordinator(&backend, Arc::new(MemoryStorage::new()), config);
    coordinator.install().await.unwrap();
    coordinator.sign_in(session("a")).await.unwrap();
    settle().await;

    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
    }
    assert_eq!(backend.calls_to("touch_presence"), 3);

    platform.emit(PlatformTrigger::BecameHidden);
    settle().await;
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
    }
    assert_eq!(backend.calls_to("touch_presence"), 3);

    platform.emit(PlatformTrigger::BecameVisible);
    settle().await;
    assert_eq!(backend.calls_to("session_start"), 1);
    assert_eq!(backend.calls_to("touch_presence"), 4);
}
