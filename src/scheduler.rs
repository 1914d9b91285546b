//! Session renewal with at most one refresh in flight.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::credentials::CredentialStore;
use crate::error::{Result, SyncError};
use crate::protocol::Session;
use crate::single_flight::SingleFlight;

/// Renews the session held by a [`CredentialStore`].
///
/// Every caller that arrives while a refresh is running shares that refresh's
/// outcome. Outcomes are applied to the store before any caller sees them:
///
/// - success replaces the session if nothing changed since the attempt
///   started;
/// - an `Unauthenticated` failure clears the session (once, however many
///   attempts fail that way);
/// - any other failure leaves the session alone. There is no retry; the next
///   trigger is the retry.
pub struct RefreshScheduler {
    store: Arc<CredentialStore>,
    backend: Arc<dyn Backend>,
    flight: SingleFlight<Session>,
}

impl RefreshScheduler {
    /// Each attempt's waiters give up after `timeout`.
    pub fn new(store: Arc<CredentialStore>, backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            store,
            backend,
            flight: SingleFlight::with_timeout(timeout),
        }
    }

    /// Refresh the session, or join the refresh already running.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NoSession`] when signed out; no network call is made.
    /// - [`SyncError::Timeout`] when the attempt outlives the timeout. The
    ///   attempt keeps running and is applied late unless superseded.
    /// - [`SyncError::Superseded`] when the session changed under the attempt.
    /// - The backend's error otherwise.
    pub async fn request_refresh(&self) -> Result<Session> {
        let (session, generation) = self.store.snapshot();
        let Some(session) = session else {
            debug!("refresh requested while signed out");
            return Err(SyncError::NoSession);
        };

        let store = Arc::clone(&self.store);
        let backend = Arc::clone(&self.backend);
        let (outcome, started) = self.flight.run(move |ticket| async move {
            debug!(attempt = ticket.seq(), generation, "refreshing session");
            match backend.refresh_session(&session.refresh_token).await {
                Ok(renewed) => {
                    if !ticket.is_current() {
                        debug!(attempt = ticket.seq(), "discarding late refresh result");
                        return Err(SyncError::Superseded);
                    }
                    match store.apply_refresh(generation, renewed.clone()).await {
                        Ok(true) => Ok(renewed),
                        Ok(false) => Err(SyncError::Superseded),
                        // Applied in memory; the next persist catches up.
                        Err(err) => {
                            warn!(error = %err, "refreshed session not persisted");
                            Ok(renewed)
                        }
                    }
                }
                Err(err) if err.is_unauthenticated() => {
                    if !ticket.is_current() {
                        debug!(attempt = ticket.seq(), "discarding late refresh rejection");
                        return Err(SyncError::Superseded);
                    }
                    info!(error = %err, "refresh token rejected, signing out");
                    if let Err(clear_err) = store.clear_if_current(generation).await {
                        warn!(error = %clear_err, "failed to clear persisted session");
                    }
                    Err(err)
                }
                Err(err) => {
                    debug!(error = %err, "refresh failed transiently");
                    Err(err)
                }
            }
        });
        if !started {
            debug!("joined refresh in flight");
        }
        outcome.await
    }

    /// `true` while a refresh is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.flight.in_flight()
    }

    /// Forget the refresh in flight; its result will be discarded.
    pub(crate) fn cancel(&self) {
        self.flight.reset();
    }
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("refreshing", &self.is_refreshing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::credentials::ChangeKind;
    use crate::error_codes::ErrorCode;
    use crate::storage::{MemoryStorage, DEFAULT_NAMESPACE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn session(tag: &str) -> Session {
        Session {
            access_token: format!("access-{tag}"),
            refresh_token: format!("refresh-{tag}"),
            expires_at: 4_000_000_000,
            user_id: uuid::Uuid::from_u128(9),
        }
    }

    /// Answers refreshes with a scripted result after an optional gate.
    struct ScriptedBackend {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        delay: Option<Duration>,
        result: Mutex<Result<Session>>,
    }

    impl ScriptedBackend {
        fn new(result: Result<Session>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                delay: None,
                result: Mutex::new(result),
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn refresh_session(&self, _refresh_token: &str) -> Result<Session> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self.result.lock().unwrap().clone();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            result
        }

        async fn call(&self, _: &str, _: &str, _: serde_json::Value) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    async fn signed_in_store() -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            DEFAULT_NAMESPACE,
        ));
        store.sign_in(session("a")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn concurrent_requests_make_one_network_call() {
        let store = signed_in_store().await;
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend {
            gate: Some(Arc::clone(&gate)),
            ..ScriptedBackend::new(Ok(session("b")))
        });
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&store),
            backend.clone(),
            Duration::from_secs(10),
        ));

        let mut waiters = tokio::task::JoinSet::new();
        for _ in 0..5 {
            let scheduler = Arc::clone(&scheduler);
            waiters.spawn(async move { scheduler.request_refresh().await });
        }
        while !scheduler.is_refreshing() || backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // Let every waiter join before releasing the call.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        while let Some(result) = waiters.join_next().await {
            assert_eq!(result.unwrap().unwrap(), session("b"));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token().unwrap(), "access-b");
    }

    #[tokio::test]
    async fn no_session_makes_no_call() {
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            DEFAULT_NAMESPACE,
        ));
        let backend = Arc::new(ScriptedBackend::new(Ok(session("b"))));
        let scheduler = RefreshScheduler::new(store, backend.clone(), Duration::from_secs(10));

        assert_eq!(scheduler.request_refresh().await, Err(SyncError::NoSession));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_signs_out_once() {
        let store = signed_in_store().await;
        let mut changes = store.subscribe();
        let rejected = SyncError::backend(ErrorCode::InvalidRefreshToken, "revoked");
        let backend = Arc::new(ScriptedBackend::new(Err(rejected.clone())));
        let scheduler = RefreshScheduler::new(Arc::clone(&store), backend, Duration::from_secs(10));

        assert_eq!(scheduler.request_refresh().await, Err(rejected));
        assert!(store.current().is_none());
        assert_eq!(scheduler.request_refresh().await, Err(SyncError::NoSession));

        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::SignedOut);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn transient_failure_keeps_session() {
        let store = signed_in_store().await;
        let backend = Arc::new(ScriptedBackend::new(Err(SyncError::Transport(
            "offline".into(),
        ))));
        let scheduler = RefreshScheduler::new(Arc::clone(&store), backend, Duration::from_secs(10));

        assert!(matches!(
            scheduler.request_refresh().await,
            Err(SyncError::Transport(_))
        ));
        assert_eq!(store.current(), Some(session("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_is_discarded_once_superseded() {
        let store = signed_in_store().await;
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedBackend::new(Ok(session("late")))
        });
        let scheduler =
            RefreshScheduler::new(Arc::clone(&store), backend.clone(), Duration::from_secs(10));

        assert_eq!(scheduler.request_refresh().await, Err(SyncError::Timeout));
        assert_eq!(store.current(), Some(session("a")));

        // A second attempt starts while the first is still out.
        *backend.result.lock().unwrap() = Ok(session("fresh"));
        let second = scheduler.request_refresh().await;
        assert_eq!(second, Err(SyncError::Timeout));

        tokio::time::sleep(Duration::from_secs(60)).await;
        // Only the newest attempt's result was applied.
        assert_eq!(store.access_token().unwrap(), "access-fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn late_rejection_does_not_sign_out_once_superseded() {
        let store = signed_in_store().await;
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedBackend::new(Err(SyncError::backend(
                ErrorCode::InvalidRefreshToken,
                "rotated",
            )))
        });
        let scheduler =
            RefreshScheduler::new(Arc::clone(&store), backend.clone(), Duration::from_secs(10));

        assert_eq!(scheduler.request_refresh().await, Err(SyncError::Timeout));

        *backend.result.lock().unwrap() = Ok(session("fresh"));
        assert_eq!(scheduler.request_refresh().await, Err(SyncError::Timeout));

        // The first attempt is rejected while the second is still out.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(store.current(), Some(session("a")));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.access_token().unwrap(), "access-fresh");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sign_in_during_refresh_wins() {
        let store = signed_in_store().await;
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend {
            gate: Some(Arc::clone(&gate)),
            ..ScriptedBackend::new(Ok(session("refreshed")))
        });
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&store),
            backend.clone(),
            Duration::from_secs(10),
        ));

        let pending = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.request_refresh().await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        store.sign_in(session("other")).await.unwrap();
        gate.notify_one();

        assert_eq!(pending.await.unwrap(), Err(SyncError::Superseded));
        assert_eq!(store.access_token().unwrap(), "access-other");
    }
}
