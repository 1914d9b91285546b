#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for heist-sync integration tests.
//!
//! Provides a scriptable [`MockBackend`], session and storage helpers, and
//! functions for driving the coordinator's background tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use heist_sync::protocol::PersistedSession;
use heist_sync::storage::DEFAULT_NAMESPACE;
use heist_sync::{
    MemoryStorage, Platform, Session, SessionCoordinator, SyncConfig, SyncError, SyncEvent,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};

// ── Sessions ────────────────────────────────────────────────────────

/// A session whose tokens carry `tag`.
pub fn session(tag: &str) -> Session {
    Session {
        access_token: format!("access-{tag}"),
        refresh_token: format!("refresh-{tag}"),
        expires_at: 4_000_000_000,
        user_id: uuid::Uuid::from_u128(42),
    }
}

/// Storage that already holds `session`, as if persisted by a previous run.
pub fn persisted_storage(session: Session) -> Arc<MemoryStorage> {
    let blob = serde_json::to_string(&PersistedSession::new(session)).unwrap();
    Arc::new(MemoryStorage::with_blob(DEFAULT_NAMESPACE, blob))
}

// ── MockBackend ─────────────────────────────────────────────────────

/// A scriptable backend for integration testing.
///
/// Refreshes succeed with a new numbered session unless scripted otherwise.
/// Procedure calls answer with scripted results, falling back to
/// `{"procedure": name, "n": call_number}` so successive fetches differ.
/// Gates hold a refresh or a procedure until the test releases them.
#[derive(Default)]
pub struct MockBackend {
    refreshes: AtomicUsize,
    refresh_script: StdMutex<VecDeque<Result<Session, SyncError>>>,
    refresh_gate: StdMutex<Option<Arc<Notify>>>,
    calls: StdMutex<Vec<(String, String, Value)>>,
    responses: StdMutex<HashMap<String, VecDeque<Result<Value, SyncError>>>>,
    gates: StdMutex<HashMap<String, Arc<Notify>>>,
    sign_outs: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the outcome of the next refresh.
    pub fn script_refresh(&self, result: Result<Session, SyncError>) {
        self.refresh_script.lock().unwrap().push_back(result);
    }

    /// Hold every refresh until the returned gate is notified.
    pub fn gate_refresh(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.refresh_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Queue the answer to the next call of `procedure`.
    pub fn respond(&self, procedure: &str, result: Result<Value, SyncError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(procedure.to_string())
            .or_default()
            .push_back(result);
    }

    /// Hold calls of `procedure` until the returned gate is notified.
    pub fn gate(&self, procedure: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(procedure.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn sign_outs(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }

    /// Number of calls made to `procedure`.
    pub fn calls_to(&self, procedure: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, _)| p == procedure)
            .count()
    }

    /// Every call made, in order: `(procedure, access_token, params)`.
    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl heist_sync::Backend for MockBackend {
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, SyncError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.refresh_script.lock().unwrap().pop_front();
        let gate = self.refresh_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        scripted.unwrap_or_else(|| {
            Ok(Session {
                access_token: format!("access-refreshed-{n}"),
                refresh_token: refresh_token.to_string(),
                expires_at: 4_000_000_000,
                user_id: uuid::Uuid::from_u128(42),
            })
        })
    }

    async fn call(
        &self,
        procedure: &str,
        access_token: &str,
        params: Value,
    ) -> Result<Value, SyncError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((procedure.to_string(), access_token.to_string(), params));
            calls.iter().filter(|(p, _, _)| p == procedure).count()
        };
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .get_mut(procedure)
            .and_then(VecDeque::pop_front);
        let gate = self.gates.lock().unwrap().get(procedure).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        scripted.unwrap_or_else(|| Ok(json!({ "procedure": procedure, "n": n })))
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), SyncError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Coordinator helpers ─────────────────────────────────────────────

/// Config used by most tests: presence disabled so it does not add calls.
pub fn quiet_config() -> SyncConfig {
    SyncConfig::new().with_presence_interval(None)
}

/// Build a coordinator over `backend` and `storage`.
pub fn coordinator(
    backend: &Arc<MockBackend>,
    storage: Arc<MemoryStorage>,
    config: SyncConfig,
) -> (SessionCoordinator, Arc<Platform>) {
    let platform = Arc::new(Platform::new());
    let coordinator = SessionCoordinator::new(
        Arc::clone(backend) as Arc<dyn heist_sync::Backend>,
        storage,
        Arc::clone(&platform),
        config,
    );
    (coordinator, platform)
}

/// Let spawned tasks run without advancing time.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Drain every event currently queued.
pub fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait for the first event matching `predicate`.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<SyncEvent>,
    mut predicate: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
