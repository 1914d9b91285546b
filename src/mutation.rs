//! State-changing calls.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::cache::CacheKey;
use crate::credentials::CredentialStore;
use crate::error::{Result, SyncError};
use crate::invalidation::{DispatchContext, EventKind, InvalidationRouter};
use crate::protocol::MutationKind;

/// Runs mutations and reports their effect through the router.
///
/// A success dispatches `"<kind>.success"` after the response arrives. A
/// failure dispatches nothing and is returned as is. There is no
/// deduplication and no retry: every call reaches the backend once.
pub struct MutationExecutor {
    store: Arc<CredentialStore>,
    backend: Arc<dyn Backend>,
    router: Arc<InvalidationRouter>,
    timeout: Duration,
}

impl MutationExecutor {
    pub fn new(
        store: Arc<CredentialStore>,
        backend: Arc<dyn Backend>,
        router: Arc<InvalidationRouter>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            router,
            timeout,
        }
    }

    /// Call the procedure for `kind` with `payload`.
    ///
    /// A `batch` or `p_batch` field in the payload narrows batch-scoped
    /// invalidation to that batch.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NoSession`] when signed out.
    /// - [`SyncError::Timeout`] when the call outlives the timeout. The
    ///   outcome is unknown and nothing is invalidated.
    /// - The backend's error otherwise.
    pub async fn execute(
        &self,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Ok(self.execute_reporting(kind, payload).await?.0)
    }

    /// Like [`execute`](Self::execute), also returning the invalidated keys.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn execute_reporting(
        &self,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<(serde_json::Value, Vec<CacheKey>)> {
        let token = self.store.access_token()?;
        let ctx = DispatchContext::from_payload(&payload);
        debug!(%kind, procedure = kind.procedure(), "executing mutation");

        let call = self.backend.call(kind.procedure(), &token, payload);
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout),
        };

        match result {
            Ok(value) => {
                let keys = self
                    .router
                    .dispatch(EventKind::MutationSucceeded(kind), &ctx);
                debug!(%kind, invalidated = keys.len(), "mutation succeeded");
                Ok((value, keys))
            }
            Err(err) => {
                info!(%kind, class = ?err.class(), error = %err, "mutation failed");
                Err(err)
            }
        }
    }

    /// Like [`execute`](Self::execute), decoding the result.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute), plus
    /// [`SyncError::Serialization`] if the result has the wrong shape. The
    /// mutation has already taken effect in that case.
    pub async fn execute_as<T: DeserializeOwned>(
        &self,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<T> {
        let value = self.execute(kind, payload).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl std::fmt::Debug for MutationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationExecutor")
            .field("timeout", &self.timeout)
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
    use crate::cache::{CacheState, QueryCache, QueryFetcher};
    use crate::error_codes::ErrorCode;
    use crate::protocol::Session;
    use crate::storage::{MemoryStorage, DEFAULT_NAMESPACE};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Echo;

    #[async_trait]
    impl QueryFetcher for Echo {
        async fn fetch(&self, key: &CacheKey) -> Result<serde_json::Value> {
            Ok(json!(key.as_str()))
        }
    }

    /// Records procedure calls and answers with a fixed result.
    struct RecordingBackend {
        calls: Mutex<Vec<(String, String, serde_json::Value)>>,
        answer: Result<serde_json::Value>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn refresh_session(&self, _refresh_token: &str) -> Result<Session> {
            Err(SyncError::Transport("unused".into()))
        }

        async fn call(
            &self,
            procedure: &str,
            access_token: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push((
                procedure.to_string(),
                access_token.to_string(),
                params,
            ));
            self.answer.clone()
        }
    }

    async fn fixture(
        answer: Result<serde_json::Value>,
    ) -> (MutationExecutor, QueryCache, Arc<RecordingBackend>) {
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            DEFAULT_NAMESPACE,
        ));
        store
            .sign_in(Session {
                access_token: "tok".into(),
                refresh_token: "ref".into(),
                expires_at: 4_000_000_000,
                user_id: uuid::Uuid::from_u128(3),
            })
            .await
            .unwrap();
        let cache = QueryCache::new(Arc::new(Echo), Duration::from_secs(10));
        for key in ["ap-status", "leaderboard:8A", "profile"] {
            cache.fetch(&CacheKey::from(key)).await.unwrap();
        }
        let router = Arc::new(InvalidationRouter::new(cache.clone()));
        let backend = Arc::new(RecordingBackend {
            calls: Mutex::new(Vec::new()),
            answer,
            count: AtomicUsize::new(0),
        });
        let executor =
            MutationExecutor::new(store, backend.clone(), router, Duration::from_secs(10));
        (executor, cache, backend)
    }

    #[tokio::test]
    async fn success_calls_procedure_and_invalidates() {
        let (executor, cache, backend) = fixture(Ok(json!({ "won": true }))).await;

        let (value, keys) = executor
            .execute_reporting(MutationKind::Attack, json!({ "p_target": "x" }))
            .await
            .unwrap();

        assert_eq!(value, json!({ "won": true }));
        assert_eq!(
            keys,
            vec![CacheKey::from("ap-status"), CacheKey::from("leaderboard:8A")]
        );
        assert_eq!(
            cache.peek(&CacheKey::from("profile")).unwrap().state,
            CacheState::Fresh
        );

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "raid_attack");
        assert_eq!(calls[0].1, "tok");
    }

    #[tokio::test]
    async fn failure_invalidates_nothing() {
        let rejected = SyncError::backend(ErrorCode::InsufficientAp, "0 AP");
        let (executor, cache, backend) = fixture(Err(rejected.clone())).await;

        let result = executor.execute(MutationKind::Attack, json!({})).await;
        assert_eq!(result, Err(rejected));
        for key in cache.keys() {
            assert_eq!(cache.peek(&key).unwrap().state, CacheState::Fresh);
        }
        assert_eq!(backend.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn typed_result() {
        let (executor, _cache, _backend) =
            fixture(Ok(json!({ "apNow": 3, "apMax": 10 }))).await;
        let ap: crate::protocol::ApStatus = executor
            .execute_as(MutationKind::PveRun, json!({}))
            .await
            .unwrap();
        assert_eq!(ap.ap_now, 3);
    }

    #[tokio::test]
    async fn signed_out_makes_no_call() {
        let (executor, _cache, backend) = fixture(Ok(json!(null))).await;
        executor.store.sign_out().await.unwrap();

        assert_eq!(
            executor.execute(MutationKind::Upgrade, json!({})).await,
            Err(SyncError::NoSession)
        );
        assert_eq!(backend.count.load(Ordering::SeqCst), 0);
    }
}
