//! Keyed cache of server-derived reads.
//!
//! Each key holds the last good value, when it was fetched, and where it is
//! in its lifecycle ([`CacheState`]). Reads never block: they return the
//! current snapshot and, when the entry is missing, stale or failed, start a
//! background fetch. At most one fetch per key is in flight; concurrent reads
//! of the same key share it.
//!
//! Only the [`InvalidationRouter`](crate::invalidation::InvalidationRouter)
//! marks entries stale.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Result, SyncError};
use crate::invalidation::KeyPattern;
use crate::single_flight::{Flight, FlightTicket, SingleFlight};

// ── Keys ────────────────────────────────────────────────────────────

/// A cache key: `resource` or `resource:arg` (e.g. `ap-status`,
/// `leaderboard:8A`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a resource parameterized by `arg`.
    pub fn with_arg(resource: &str, arg: &str) -> Self {
        Self(format!("{resource}:{arg}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `:`.
    pub fn resource(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(r, _)| r)
    }

    /// The part after the first `:`, if any.
    pub fn arg(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, a)| a)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// ── Entries ─────────────────────────────────────────────────────────

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// The value reflects the server as of `fetched_at`.
    Fresh,
    /// The value may be outdated; the next read refetches.
    Stale,
    /// A fetch is in flight. The previous value, if any, is still served.
    Fetching,
    /// The last fetch failed; `error` says why.
    Error,
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Last good value. Kept through transient errors.
    pub value: Option<serde_json::Value>,
    pub fetched_at: Option<Instant>,
    pub state: CacheState,
    pub error: Option<SyncError>,
}

impl CacheEntry {
    fn empty(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            fetched_at: None,
            state: CacheState::Stale,
            error: None,
        }
    }

    /// Decode the value into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Serialization`] if the value has the wrong shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.value
            .clone()
            .map(serde_json::from_value::<T>)
            .transpose()
            .map_err(SyncError::from)
    }

    /// `true` when the entry failed because there is no usable session.
    pub fn is_signed_out(&self) -> bool {
        self.state == CacheState::Error
            && self.error.as_ref().is_some_and(SyncError::is_unauthenticated)
    }

    /// Time since the value was fetched.
    pub fn age(&self) -> Option<Duration> {
        self.fetched_at.map(|at| at.elapsed())
    }

    fn needs_fetch(&self) -> bool {
        match self.state {
            CacheState::Stale => true,
            CacheState::Error => !self.is_signed_out(),
            CacheState::Fresh | CacheState::Fetching => false,
        }
    }
}

// ── Fetcher seam ────────────────────────────────────────────────────

/// Produces the value for a cache key.
#[async_trait]
pub trait QueryFetcher: Send + Sync + 'static {
    /// Fetch the current server value for `key`.
    ///
    /// # Errors
    ///
    /// Returns the classified backend error.
    async fn fetch(&self, key: &CacheKey) -> Result<serde_json::Value>;
}

// ── Subscriptions ───────────────────────────────────────────────────

/// Live view of one cache entry.
///
/// The key counts as subscribed while any subscription for it is alive:
/// invalidating it refetches immediately instead of waiting for a read.
#[derive(Debug)]
pub struct Subscription {
    key: CacheKey,
    rx: watch::Receiver<CacheEntry>,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The latest snapshot.
    pub fn current(&self) -> CacheEntry {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TornDown`] once the cache drops the entry.
    pub async fn changed(&mut self) -> Result<CacheEntry> {
        self.rx.changed().await.map_err(|_| SyncError::TornDown)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until the entry satisfies `predicate`, checking the current
    /// snapshot first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TornDown`] once the cache drops the entry.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&CacheEntry) -> bool,
    ) -> Result<CacheEntry> {
        let entry = self
            .rx
            .wait_for(|entry| predicate(entry))
            .await
            .map_err(|_| SyncError::TornDown)?;
        Ok(entry.clone())
    }
}

// ── Cache ───────────────────────────────────────────────────────────

struct Slot {
    /// Distinguishes this slot from one created for the same key after a
    /// teardown.
    id: u64,
    tx: watch::Sender<CacheEntry>,
    flight: SingleFlight<CacheEntry>,
    /// Invalidated while fetching; the in-flight result lands as stale.
    refetch_pending: bool,
    /// Invalidated while fetching and that fetch failed; a watched entry
    /// fetches once more.
    retry_invalidated: bool,
}

impl Slot {
    fn subscribed(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    /// Mark the entry as fetching and hand back what is needed to start it.
    fn begin_fetch(&self, key: &CacheKey) -> PendingFetch {
        self.tx.send_if_modified(|entry| {
            let changed = entry.state != CacheState::Fetching;
            entry.state = CacheState::Fetching;
            changed
        });
        PendingFetch {
            key: key.clone(),
            id: self.id,
            flight: self.flight.clone(),
        }
    }
}

struct PendingFetch {
    key: CacheKey,
    id: u64,
    flight: SingleFlight<CacheEntry>,
}

struct CacheInner {
    fetcher: Arc<dyn QueryFetcher>,
    fetch_timeout: Duration,
    entries: Mutex<HashMap<CacheKey, Slot>>,
    next_id: AtomicU64,
}

/// The query cache. Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    /// Each fetch is abandoned with [`SyncError::Timeout`] after `fetch_timeout`.
    pub fn new(fetcher: Arc<dyn QueryFetcher>, fetch_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                fetcher,
                fetch_timeout,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current snapshot of `key`, starting a background fetch if the entry is
    /// missing, stale, or failed for a reason other than a missing session.
    ///
    /// Never waits. Must be called from within a Tokio runtime.
    pub fn read(&self, key: &CacheKey) -> CacheEntry {
        let (snapshot, pending) = {
            let mut entries = self.inner.lock();
            let slot = self.inner.slot(&mut entries, key);
            let needs_fetch = slot.tx.borrow().needs_fetch();
            let pending = needs_fetch.then(|| slot.begin_fetch(key));
            let snapshot = slot.tx.borrow().clone();
            (snapshot, pending)
        };
        if let Some(pending) = pending {
            trace!(%key, "read scheduled fetch");
            self.inner.start(pending);
        }
        snapshot
    }

    /// Like [`read`](Self::read), but wait for the fetch in flight (starting
    /// one if the entry is not fresh) and return the settled snapshot.
    ///
    /// A failed fetch is reported in the returned entry's `state` and
    /// `error`, not as an `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TornDown`] if the cache was torn down, or
    /// [`SyncError::Superseded`] if the entry was purged, while waiting.
    pub async fn fetch(&self, key: &CacheKey) -> Result<CacheEntry> {
        let pending = {
            let mut entries = self.inner.lock();
            let slot = self.inner.slot(&mut entries, key);
            if slot.tx.borrow().state == CacheState::Fresh {
                return Ok(slot.tx.borrow().clone());
            }
            slot.begin_fetch(key)
        };
        self.inner.start(pending).await
    }

    /// Subscribe to `key`, starting a fetch if the entry needs one.
    pub fn subscribe(&self, key: &CacheKey) -> Subscription {
        let rx = {
            let mut entries = self.inner.lock();
            self.inner.slot(&mut entries, key).tx.subscribe()
        };
        let _ = self.read(key);
        Subscription {
            key: key.clone(),
            rx,
        }
    }

    /// Snapshot of `key` without scheduling anything.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().get(key).map(|slot| slot.tx.borrow().clone())
    }

    /// `true` while any [`Subscription`] for `key` is alive.
    pub fn is_subscribed(&self, key: &CacheKey) -> bool {
        self.inner.lock().get(key).is_some_and(Slot::subscribed)
    }

    /// Keys currently held, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.inner.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark matching entries stale and return their keys.
    ///
    /// Subscribed keys refetch now; the rest wait for their next read. An
    /// entry that is fetching keeps fetching and lands as stale.
    pub(crate) fn invalidate(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
        let mut affected = Vec::new();
        let mut refetch = Vec::new();
        {
            let mut entries = self.inner.lock();
            for (key, slot) in entries.iter_mut().filter(|(k, _)| pattern.matches(k)) {
                affected.push(key.clone());
                if slot.tx.borrow().state == CacheState::Fetching {
                    slot.refetch_pending = true;
                    continue;
                }
                slot.tx.send_modify(|entry| entry.state = CacheState::Stale);
                if slot.subscribed() {
                    refetch.push(slot.begin_fetch(key));
                }
            }
        }
        for pending in refetch {
            let _ = self.inner.start(pending);
        }
        affected.sort();
        affected
    }

    /// Drop matching entries' values and return their keys.
    ///
    /// Fetches in flight for them are abandoned and their results discarded.
    /// Nothing is refetched until the next read.
    pub(crate) fn purge(&self, pattern: &KeyPattern) -> Vec<CacheKey> {
        let mut affected = Vec::new();
        let mut entries = self.inner.lock();
        for (key, slot) in entries.iter_mut().filter(|(k, _)| pattern.matches(k)) {
            slot.flight.reset();
            slot.refetch_pending = false;
            slot.retry_invalidated = false;
            slot.tx.send_replace(CacheEntry::empty(key.clone()));
            affected.push(key.clone());
        }
        affected.sort();
        affected
    }

    /// Drop every entry. Subscriptions end and late fetch results are
    /// discarded.
    pub fn teardown(&self) {
        let dropped: Vec<Slot> = self.inner.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &dropped {
            slot.flight.reset();
        }
        debug!(entries = dropped.len(), "query cache torn down");
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("fetch_timeout", &self.inner.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl CacheInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot<'a>(&self, entries: &'a mut HashMap<CacheKey, Slot>, key: &CacheKey) -> &'a mut Slot {
        entries.entry(key.clone()).or_insert_with(|| {
            let (tx, _) = watch::channel(CacheEntry::empty(key.clone()));
            Slot {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                tx,
                flight: SingleFlight::new(),
                refetch_pending: false,
                retry_invalidated: false,
            }
        })
    }

    /// Start (or join) the fetch for a slot that was marked fetching.
    fn start(self: &Arc<Self>, pending: PendingFetch) -> Flight<CacheEntry> {
        let PendingFetch { key, id, flight } = pending;
        let inner = Arc::clone(self);
        let fetch_key = key.clone();
        let (outcome, started) = flight.run(move |ticket| async move {
            trace!(key = %fetch_key, attempt = ticket.seq(), "fetching");
            let result =
                match tokio::time::timeout(inner.fetch_timeout, inner.fetcher.fetch(&fetch_key))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout),
                };
            inner.settle(&fetch_key, id, &ticket, result)
        });

        if started {
            // Once the flight is released, refetch if it was invalidated
            // mid-flight and someone is watching.
            let inner = Arc::clone(self);
            let settled = outcome.clone();
            tokio::spawn(async move {
                if settled.await.is_ok() {
                    inner.refetch_if_stale(&key, id);
                }
            });
        }
        outcome
    }

    fn settle(
        &self,
        key: &CacheKey,
        id: u64,
        ticket: &FlightTicket,
        result: Result<serde_json::Value>,
    ) -> Result<CacheEntry> {
        let mut entries = self.lock();
        let Some(slot) = entries.get_mut(key).filter(|slot| slot.id == id) else {
            trace!(%key, "discarding fetch result for a dropped entry");
            return Err(SyncError::TornDown);
        };
        if !ticket.is_current() {
            trace!(%key, "discarding fetch result for a purged entry");
            return Err(SyncError::Superseded);
        }

        let landed_stale = std::mem::take(&mut slot.refetch_pending);
        slot.retry_invalidated =
            landed_stale && result.as_ref().is_err_and(|err| !err.is_unauthenticated());
        slot.tx.send_modify(|entry| match result {
            Ok(value) => {
                entry.value = Some(value);
                entry.fetched_at = Some(Instant::now());
                entry.error = None;
                entry.state = if landed_stale {
                    CacheState::Stale
                } else {
                    CacheState::Fresh
                };
            }
            Err(err) => {
                if err.is_unauthenticated() {
                    entry.value = None;
                    entry.fetched_at = None;
                } else {
                    warn!(%key, error = %err, "fetch failed, keeping last value");
                }
                entry.state = CacheState::Error;
                entry.error = Some(err);
            }
        });
        let snapshot = slot.tx.borrow().clone();
        Ok(snapshot)
    }

    fn refetch_if_stale(self: &Arc<Self>, key: &CacheKey, id: u64) {
        let pending = {
            let mut entries = self.lock();
            entries
                .get_mut(key)
                .filter(|slot| slot.id == id)
                .and_then(|slot| {
                    let retry = std::mem::take(&mut slot.retry_invalidated);
                    let state = slot.tx.borrow().state;
                    let wanted =
                        state == CacheState::Stale || (retry && state == CacheState::Error);
                    (wanted && slot.subscribed()).then(|| slot.begin_fetch(key))
                })
        };
        if let Some(pending) = pending {
            debug!(%key, "refetching entry invalidated mid-flight");
            let _ = self.start(pending);
        }
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
    use crate::error_codes::ErrorCode;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Replays scripted results per call; counts calls.
    #[derive(Default)]
    struct ScriptedFetcher {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<serde_json::Value>>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<serde_json::Value>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn gated(script: Vec<Result<serde_json::Value>>, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                gate: Some(gate),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryFetcher for ScriptedFetcher {
        async fn fetch(&self, _key: &CacheKey) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(serde_json::Value::Null))
        }
    }

    fn cache(fetcher: Arc<ScriptedFetcher>) -> QueryCache {
        QueryCache::new(fetcher, Duration::from_secs(10))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn key_parts() {
        let key = CacheKey::with_arg("leaderboard", "8A");
        assert_eq!(key.as_str(), "leaderboard:8A");
        assert_eq!(key.resource(), "leaderboard");
        assert_eq!(key.arg(), Some("8A"));

        let key = CacheKey::from("profile");
        assert_eq!(key.resource(), "profile");
        assert_eq!(key.arg(), None);
    }

    #[tokio::test]
    async fn first_read_schedules_fetch() {
        let fetcher = ScriptedFetcher::new(vec![Ok(json!({ "apNow": 8 }))]);
        let cache = cache(fetcher.clone());
        let key = CacheKey::from("ap-status");

        let first = cache.read(&key);
        assert_eq!(first.state, CacheState::Fetching);
        assert_eq!(first.value, None);

        settle().await;
        let entry = cache.read(&key);
        assert_eq!(entry.state, CacheState::Fresh);
        assert_eq!(entry.value, Some(json!({ "apNow": 8 })));
        assert!(entry.fetched_at.is_some());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_fetch() {
        let gate = Arc::new(Notify::new());
        let fetcher = ScriptedFetcher::gated(vec![Ok(json!(1))], Arc::clone(&gate));
        let cache = cache(fetcher.clone());
        let key = CacheKey::from("profile");

        for _ in 0..5 {
            cache.read(&key);
        }
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move { cache.fetch(&key).await })
            })
            .collect();
        settle().await;
        gate.notify_one();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().value, Some(json!(1)));
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn transient_error_keeps_last_value() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(json!({ "rank": 3 })),
            Err(SyncError::Transport("offline".into())),
        ]);
        let cache = cache(fetcher);
        let key = CacheKey::from("leaderboard:8A");

        cache.fetch(&key).await.unwrap();
        cache.invalidate(&KeyPattern::Exact(key.clone()));
        let entry = cache.fetch(&key).await.unwrap();

        assert_eq!(entry.state, CacheState::Error);
        assert_eq!(entry.value, Some(json!({ "rank": 3 })));
        assert_eq!(entry.error, Some(SyncError::Transport("offline".into())));
    }

    #[tokio::test]
    async fn error_entry_retries_on_read() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(SyncError::Transport("offline".into())),
            Ok(json!(2)),
        ]);
        let cache = cache(fetcher.clone());
        let key = CacheKey::from("jobs");

        assert_eq!(cache.fetch(&key).await.unwrap().state, CacheState::Error);
        assert_eq!(cache.read(&key).state, CacheState::Fetching);
        settle().await;
        assert_eq!(cache.read(&key).value, Some(json!(2)));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn unauthenticated_error_drops_value_and_does_not_retry() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(json!("mine")),
            Err(SyncError::backend(ErrorCode::InvalidToken, "expired")),
        ]);
        let cache = cache(fetcher.clone());
        let key = CacheKey::from("inventory");

        cache.fetch(&key).await.unwrap();
        cache.invalidate(&KeyPattern::All);
        let entry = cache.fetch(&key).await.unwrap();
        assert!(entry.is_signed_out());
        assert_eq!(entry.value, None);

        let again = cache.read(&key);
        assert_eq!(again.state, CacheState::Error);
        settle().await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_defers_unsubscribed_and_refetches_subscribed() {
        let fetcher = ScriptedFetcher::new(vec![Ok(json!(1)), Ok(json!(1)), Ok(json!(2))]);
        let cache = cache(fetcher.clone());
        let watched = CacheKey::from("ap-status");
        let idle = CacheKey::from("profile");

        let mut sub = cache.subscribe(&watched);
        cache.fetch(&idle).await.unwrap();
        sub.wait_for(|e| e.state == CacheState::Fresh).await.unwrap();
        assert_eq!(fetcher.calls(), 2);

        let keys = cache.invalidate(&KeyPattern::All);
        assert_eq!(keys, vec![watched.clone(), idle.clone()]);
        assert_eq!(cache.peek(&idle).unwrap().state, CacheState::Stale);

        let refreshed = sub
            .wait_for(|e| e.state == CacheState::Fresh)
            .await
            .unwrap();
        assert_eq!(refreshed.value, Some(json!(2)));
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(cache.peek(&idle).unwrap().state, CacheState::Stale);
    }

    #[tokio::test]
    async fn invalidation_during_fetch_lands_stale_and_refetches_when_watched() {
        let gate = Arc::new(Notify::new());
        let fetcher =
            ScriptedFetcher::gated(vec![Ok(json!("old")), Ok(json!("new"))], Arc::clone(&gate));
        let cache = cache(fetcher.clone());
        let key = CacheKey::from("clan");

        let mut sub = cache.subscribe(&key);
        settle().await;
        assert_eq!(cache.invalidate(&KeyPattern::All), vec![key.clone()]);
        gate.notify_one();

        let stale = sub.wait_for(|e| e.value.is_some()).await.unwrap();
        assert_eq!(stale.value, Some(json!("old")));
        assert_ne!(stale.state, CacheState::Fresh);

        gate.notify_one();
        let fresh = sub
            .wait_for(|e| e.state == CacheState::Fresh)
            .await
            .unwrap();
        assert_eq!(fresh.value, Some(json!("new")));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_after_invalidation_retries_when_watched() {
        let gate = Arc::new(Notify::new());
        let fetcher = ScriptedFetcher::gated(
            vec![Err(SyncError::Transport("offline".into())), Ok(json!("new"))],
            Arc::clone(&gate),
        );
        let cache = cache(fetcher.clone());
        let key = CacheKey::from("clan");

        let mut sub = cache.subscribe(&key);
        settle().await;
        assert_eq!(cache.invalidate(&KeyPattern::All), vec![key.clone()]);
        gate.notify_one();
        settle().await;

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.peek(&key).unwrap().state, CacheState::Fetching);

        gate.notify_one();
        let fresh = sub
            .wait_for(|e| e.state == CacheState::Fresh)
            .await
            .unwrap();
        assert_eq!(fresh.value, Some(json!("new")));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn plain_fetch_failure_does_not_loop_when_watched() {
        let fetcher = ScriptedFetcher::new(vec![Err(SyncError::Transport("offline".into()))]);
        let cache = cache(fetcher.clone());
        let key = CacheKey::from("jobs");

        let mut sub = cache.subscribe(&key);
        let entry = sub
            .wait_for(|e| e.state == CacheState::Error)
            .await
            .unwrap();
        assert_eq!(entry.error, Some(SyncError::Transport("offline".into())));
        settle().await;
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn purge_discards_in_flight_result() {
        let gate = Arc::new(Notify::new());
        let fetcher = ScriptedFetcher::gated(vec![Ok(json!("other user"))], Arc::clone(&gate));
        let cache = cache(fetcher);
        let key = CacheKey::from("profile");

        let pending = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.fetch(&key).await })
        };
        settle().await;
        cache.purge(&KeyPattern::All);
        gate.notify_one();

        assert_eq!(pending.await.unwrap(), Err(SyncError::Superseded));
        let entry = cache.peek(&key).unwrap();
        assert_eq!(entry.value, None);
        assert_eq!(entry.state, CacheState::Stale);
    }

    #[tokio::test]
    async fn teardown_drops_entries_and_late_results() {
        let gate = Arc::new(Notify::new());
        let fetcher = ScriptedFetcher::gated(vec![Ok(json!(1))], Arc::clone(&gate));
        let cache = cache(fetcher);
        let key = CacheKey::from("news");

        let mut sub = cache.subscribe(&key);
        settle().await;
        cache.teardown();
        gate.notify_one();
        settle().await;

        assert!(cache.is_empty());
        assert_eq!(sub.wait_for(|_| false).await, Err(SyncError::TornDown));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out() {
        struct Hanging;

        #[async_trait]
        impl QueryFetcher for Hanging {
            async fn fetch(&self, _key: &CacheKey) -> Result<serde_json::Value> {
                std::future::pending().await
            }
        }

        let cache = QueryCache::new(Arc::new(Hanging), Duration::from_secs(10));
        let entry = cache.fetch(&CacheKey::from("raid-targets")).await.unwrap();
        assert_eq!(entry.state, CacheState::Error);
        assert_eq!(entry.error, Some(SyncError::Timeout));
    }

    #[test]
    fn decode_typed_payload() {
        let entry = CacheEntry {
            value: Some(json!({ "apNow": 8, "apMax": 10 })),
            ..CacheEntry::empty(CacheKey::from("ap-status"))
        };
        let ap: crate::protocol::ApStatus = entry.decode().unwrap().unwrap();
        assert_eq!(ap.ap_now, 8);
    }
}
