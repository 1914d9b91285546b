//! # Offline Session Example
//!
//! Runs the coordinator against an in-process backend that keeps a tiny bit
//! of game state, so the whole install → sign in → read → mutate → teardown
//! cycle can be watched without a server. Useful for:
//!
//! - **Testing** UI code against the cache without network access
//! - **Custom backends**: the same [`Backend`] trait fronts any RPC layer
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=heist_sync=debug cargo run --example offline_session
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use heist_sync::protocol::ApStatus;
use heist_sync::{
    Backend, CacheKey, CacheState, ErrorCode, MemoryStorage, MutationKind, Platform,
    PlatformTrigger, Session, SessionCoordinator, SyncConfig, SyncError, SyncEvent,
};
use serde_json::{json, Value};

// ─────────────────────────────────────────────────────────────────────
// Step 1: An in-process backend
// ─────────────────────────────────────────────────────────────────────

const AP_MAX: u32 = 5;

/// Answers reads from memory. Attacks cost one action point.
struct OfflineBackend {
    ap: AtomicU32,
    refreshes: AtomicU32,
}

impl OfflineBackend {
    fn new() -> Self {
        Self {
            ap: AtomicU32::new(AP_MAX),
            refreshes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Backend for OfflineBackend {
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, SyncError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(demo_session(&format!("access-{n}"), refresh_token))
    }

    async fn call(
        &self,
        procedure: &str,
        _access_token: &str,
        params: Value,
    ) -> Result<Value, SyncError> {
        match procedure {
            "ap_status" => Ok(json!({
                "apNow": self.ap.load(Ordering::SeqCst),
                "apMax": AP_MAX,
            })),
            "leaderboard_rows" => Ok(json!([
                { "userId": uuid::Uuid::nil(), "username": "demo", "rank": 1, "score": 100,
                  "batch": params.get("p_batch") }
            ])),
            "raid_attack" => {
                let spent = self
                    .ap
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ap| ap.checked_sub(1));
                match spent {
                    Ok(_) => Ok(json!({ "won": true })),
                    Err(_) => Err(SyncError::backend(
                        ErrorCode::InsufficientAp,
                        "no action points left",
                    )),
                }
            }
            "touch_presence" | "session_start" => Ok(Value::Null),
            other => Err(SyncError::backend(
                ErrorCode::InvalidInput,
                format!("offline backend has no procedure '{other}'"),
            )),
        }
    }
}

fn demo_session(access: &str, refresh: &str) -> Session {
    Session {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        expires_at: 4_000_000_000,
        user_id: uuid::Uuid::nil(),
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Drive the coordinator
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let platform = Arc::new(Platform::new());
    let coordinator = SessionCoordinator::new(
        Arc::new(OfflineBackend::new()),
        Arc::new(MemoryStorage::new()),
        Arc::clone(&platform),
        SyncConfig::new(),
    );
    let mut events = coordinator.subscribe_events();

    // Mounting twice yields the same installation.
    let handle = coordinator.install().await?;
    let again = coordinator.install().await?;
    tracing::info!(same = handle == again, "installed");

    coordinator
        .sign_in(demo_session("access-0", "refresh-demo"))
        .await?;

    let ap_key = CacheKey::from("ap-status");
    let mut ap = coordinator.cache().subscribe(&ap_key);
    let entry = ap.wait_for(|e| e.state == CacheState::Fresh).await?;
    if let Some(status) = entry.decode::<ApStatus>()? {
        tracing::info!(ap = status.ap_now, max = status.ap_max, "action points");
    }

    // Spend every point, and one more.
    for _ in 0..=AP_MAX {
        match coordinator
            .executor()
            .execute(MutationKind::Attack, json!({ "p_target": "rival" }))
            .await
        {
            Ok(result) => tracing::info!(%result, "attack resolved"),
            Err(err) => tracing::warn!(class = ?err.class(), %err, "attack refused"),
        }
    }

    let entry = ap
        .wait_for(|e| e.state == CacheState::Fresh)
        .await?
        .decode::<ApStatus>()?;
    tracing::info!(ap = ?entry.map(|s| s.ap_now), "action points after raiding");

    // The host reports a focus change; the coordinator refreshes the session.
    platform.emit(PlatformTrigger::WindowFocused);

    while let Ok(event) = events.try_recv() {
        tracing::info!(?event, "event");
        if matches!(event, SyncEvent::SignedOut) {
            break;
        }
    }
    let session = coordinator.refresh_now().await?;
    tracing::info!(expires_in = session.expires_in(), "session current");

    coordinator.teardown(&handle).await;
    tracing::info!(installed = coordinator.is_installed(), "done");
    Ok(())
}
