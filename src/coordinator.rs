//! The session lifecycle coordinator.
//!
//! [`SessionCoordinator`] owns the credential store, the refresh scheduler,
//! the query cache, the invalidation router and the mutation executor, and
//! wires them to the host [`Platform`]. [`install`](SessionCoordinator::install)
//! starts a background sync loop that multiplexes platform triggers, the
//! refresh and presence timers, and credential changes via `tokio::select!`.
//!
//! # Example
//!
//! ```rust,ignore
//! let coordinator = SessionCoordinator::new(backend, storage, platform, SyncConfig::new());
//! let mut events = coordinator.subscribe_events();
//! let handle = coordinator.install().await?;
//!
//! let ap = coordinator.cache().subscribe(&"ap-status".into());
//! coordinator
//!     .executor()
//!     .execute(MutationKind::Attack, json!({ "p_target": target }))
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if event.requires_sign_in() {
//!         break;
//!     }
//! }
//! coordinator.teardown(&handle).await;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::cache::{CacheKey, QueryCache};
use crate::credentials::{ChangeKind, CredentialChange, CredentialStore};
use crate::error::{Result, SyncError};
use crate::event::SyncEvent;
use crate::invalidation::{DispatchContext, EventKind, InvalidationRouter};
use crate::mutation::MutationExecutor;
use crate::platform::{ListenerId, Platform, PlatformTrigger};
use crate::presence::PresenceHeartbeat;
use crate::protocol::Session;
use crate::resources::RpcFetcher;
use crate::scheduler::RefreshScheduler;
use crate::storage::{SessionStorage, DEFAULT_NAMESPACE};

/// Default interval between background session refreshes.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(9 * 60);

/// Default bound on one refresh attempt.
const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on one cache fetch or mutation.
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between presence pings.
const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_secs(60);

/// Default capacity of the event broadcast channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown of the sync loop.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the trigger channel from platform listeners to the loop.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Smallest timer period accepted; tokio rejects a zero period.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Platform signals the loop listens for.
const LISTENED_TRIGGERS: [PlatformTrigger; 5] = [
    PlatformTrigger::BecameVisible,
    PlatformTrigger::BecameHidden,
    PlatformTrigger::WindowFocused,
    PlatformTrigger::NetworkOnline,
    PlatformTrigger::NetworkOffline,
];

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SessionCoordinator`].
///
/// # Example
///
/// ```
/// use heist_sync::coordinator::SyncConfig;
/// use std::time::Duration;
///
/// let config = SyncConfig::new()
///     .with_refresh_interval(Duration::from_secs(5 * 60))
///     .with_presence_interval(None)
///     .with_event_channel_capacity(64);
/// assert_eq!(config.refresh_interval, Duration::from_secs(300));
/// assert!(config.presence_interval.is_none());
/// assert_eq!(config.storage_namespace, "brain-heist-auth");
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between background session refreshes. The first refresh
    /// happens one interval after install; triggers never shift the timer.
    ///
    /// Defaults to **9 minutes**.
    pub refresh_interval: Duration,
    /// Bound on one refresh attempt. Waiters get a timeout error after this;
    /// the attempt itself keeps running.
    ///
    /// Defaults to **10 seconds**.
    pub refresh_timeout: Duration,
    /// Bound on one cache fetch or mutation call.
    ///
    /// Defaults to **10 seconds**.
    pub fetch_timeout: Duration,
    /// Interval between presence pings; `None` disables presence.
    ///
    /// Defaults to **60 seconds**.
    pub presence_interval: Option<Duration>,
    /// Capacity of the event broadcast channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown of the sync loop. When it expires
    /// the loop task is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Namespace the session is persisted under.
    ///
    /// Defaults to **`"brain-heist-auth"`**.
    pub storage_namespace: String,
}

impl SyncConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            presence_interval: Some(DEFAULT_PRESENCE_INTERVAL),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            storage_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    /// Set the background refresh interval. Zero is clamped to 1 ms.
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval.max(MIN_TIMER_PERIOD);
        self
    }

    /// Set the bound on one refresh attempt.
    #[must_use]
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Set the bound on one cache fetch or mutation call.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the presence interval, or disable presence with `None`. Zero is
    /// clamped to 1 ms.
    #[must_use]
    pub fn with_presence_interval(mut self, interval: Option<Duration>) -> Self {
        self.presence_interval = interval.map(|i| i.max(MIN_TIMER_PERIOD));
        self
    }

    /// Set the capacity of the event broadcast channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown of the sync loop.
    ///
    /// A zero timeout aborts the loop immediately.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the namespace the session is persisted under.
    #[must_use]
    pub fn with_storage_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.storage_namespace = namespace.into();
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Lifecycle handle ────────────────────────────────────────────────

struct HandleParts {
    listeners: Vec<ListenerId>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct HandleInner {
    id: u64,
    parts: Mutex<Option<HandleParts>>,
}

/// Token for one installation, returned by
/// [`SessionCoordinator::install`].
///
/// Owns the installation's platform listeners and sync loop. Clones refer to
/// the same installation; two handles are equal when they do.
#[derive(Clone)]
pub struct LifecycleHandle {
    inner: Arc<HandleInner>,
}

impl LifecycleHandle {
    /// Installation id, unique per coordinator.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// `false` once torn down.
    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    fn take_parts(&self) -> Option<HandleParts> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<HandleParts>> {
        self.inner
            .parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for LifecycleHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LifecycleHandle {}

impl std::fmt::Debug for LifecycleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHandle")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}

// ── Shared state ────────────────────────────────────────────────────

type PendingInstall = Shared<BoxFuture<'static, Result<LifecycleHandle>>>;

enum Lifecycle {
    Uninstalled,
    Installing(PendingInstall),
    Installed(LifecycleHandle),
    TornDown,
}

/// Services the sync loop works with.
#[derive(Clone)]
struct Services {
    store: Arc<CredentialStore>,
    scheduler: Arc<RefreshScheduler>,
    router: Arc<InvalidationRouter>,
    presence: Arc<PresenceHeartbeat>,
    events: broadcast::Sender<SyncEvent>,
    presence_enabled: bool,
}

struct Inner {
    config: SyncConfig,
    backend: Arc<dyn Backend>,
    platform: Arc<Platform>,
    cache: QueryCache,
    executor: Arc<MutationExecutor>,
    services: Services,
    lifecycle: Mutex<Lifecycle>,
    next_handle_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // `Drop` cannot await a graceful shutdown; abort the loop so it does
        // not outlive the coordinator.
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Installed(handle) = lifecycle {
            if let Some(parts) = handle.take_parts() {
                for id in parts.listeners {
                    self.platform.unregister(id);
                }
                if let Some(task) = parts.task {
                    task.abort();
                }
            }
        }
    }
}

// ── Coordinator ─────────────────────────────────────────────────────

/// Single entry point for installing and tearing down session sync.
///
/// Cloning yields another handle to the same coordinator. Construct one per
/// client and pass it to every UI mount; [`install`](Self::install) may be
/// called from each of them.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Build the coordinator and its services. Nothing runs until
    /// [`install`](Self::install).
    pub fn new(
        backend: Arc<dyn Backend>,
        storage: Arc<dyn SessionStorage>,
        platform: Arc<Platform>,
        config: SyncConfig,
    ) -> Self {
        let capacity = config.event_channel_capacity.max(1);
        let (events, _) = broadcast::channel(capacity);

        let store = Arc::new(CredentialStore::new(
            storage,
            config.storage_namespace.clone(),
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            config.refresh_timeout,
        ));
        let fetcher = Arc::new(RpcFetcher::new(Arc::clone(&store), Arc::clone(&backend)));
        let cache = QueryCache::new(fetcher, config.fetch_timeout);
        let router =
            Arc::new(InvalidationRouter::new(cache.clone()).with_events(events.clone()));
        let executor = Arc::new(MutationExecutor::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            Arc::clone(&router),
            config.fetch_timeout,
        ));
        let presence = Arc::new(PresenceHeartbeat::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            Arc::clone(&platform),
        ));

        Self {
            inner: Arc::new(Inner {
                services: Services {
                    store,
                    scheduler,
                    router,
                    presence,
                    events,
                    presence_enabled: config.presence_interval.is_some(),
                },
                config,
                backend,
                platform,
                cache,
                executor,
                lifecycle: Mutex::new(Lifecycle::Uninstalled),
                next_handle_id: AtomicU64::new(1),
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Install session sync, or return the current installation.
    ///
    /// Concurrent and repeated calls collapse onto one installation: one set
    /// of platform listeners, one sync loop, one handle. After a teardown the
    /// next call installs afresh with a new handle.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the persisted session cannot be
    /// read; the coordinator stays uninstalled.
    pub async fn install(&self) -> Result<LifecycleHandle> {
        let pending = {
            let mut lifecycle = self.inner.lock_lifecycle();
            match &*lifecycle {
                Lifecycle::Installed(handle) => return Ok(handle.clone()),
                Lifecycle::Installing(pending) => pending.clone(),
                Lifecycle::Uninstalled | Lifecycle::TornDown => {
                    let pending = Inner::setup(Arc::downgrade(&self.inner))
                        .boxed()
                        .shared();
                    *lifecycle = Lifecycle::Installing(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Tear down the installation `handle` belongs to.
    ///
    /// Removes its platform listeners and stops its sync loop (gracefully,
    /// then by abort after the shutdown timeout). If it is the current
    /// installation, also abandons any refresh in flight, empties the cache
    /// and drops the in-memory session; the persisted session stays. Calling
    /// this again, or with a handle from an earlier installation, releases
    /// nothing more.
    pub async fn teardown(&self, handle: &LifecycleHandle) {
        let Some(parts) = handle.take_parts() else {
            debug!(handle = handle.id(), "teardown: handle already torn down");
            return;
        };
        debug!(handle = handle.id(), "teardown requested");

        // Leave `Installed` before the first await so a concurrent install
        // never hands out this handle.
        let current = {
            let mut lifecycle = self.inner.lock_lifecycle();
            let current = matches!(&*lifecycle, Lifecycle::Installed(h) if h == handle);
            if current {
                *lifecycle = Lifecycle::TornDown;
            }
            current
        };

        for id in parts.listeners {
            self.inner.platform.unregister(id);
        }
        if let Some(tx) = parts.shutdown_tx {
            let _ = tx.send(());
        }
        if current {
            let services = &self.inner.services;
            services.scheduler.cancel();
            self.inner.cache.teardown();
            services.store.teardown();
            services.emit(SyncEvent::TornDown);
        }

        // Await the loop with a timeout. If it doesn't exit in time, abort it
        // so the task cannot detach and run indefinitely.
        if let Some(mut task) = parts.task {
            match tokio::time::timeout(self.inner.config.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    if !join_err.is_cancelled() {
                        warn!("sync loop terminated with join error: {join_err}");
                    }
                }
                Err(_) => {
                    warn!("sync loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("sync loop aborted: {join_err}");
                    }
                }
            }
        }
        if current {
            info!(handle = handle.id(), "session sync torn down");
        }
    }

    /// Tear down whatever is installed, waiting for an install in flight
    /// first. Does nothing when nothing is installed.
    pub async fn shutdown(&self) {
        let pending: PendingInstall = {
            let lifecycle = self.inner.lock_lifecycle();
            match &*lifecycle {
                Lifecycle::Installed(handle) => {
                    let handle = handle.clone();
                    async move { Ok(handle) }.boxed().shared()
                }
                Lifecycle::Installing(pending) => pending.clone(),
                Lifecycle::Uninstalled | Lifecycle::TornDown => return,
            }
        };
        match pending.await {
            Ok(handle) => self.teardown(&handle).await,
            Err(err) => debug!(error = %err, "shutdown: install had failed"),
        }
    }

    /// The current installation, if any.
    pub fn current_handle(&self) -> Option<LifecycleHandle> {
        match &*self.inner.lock_lifecycle() {
            Lifecycle::Installed(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// `true` while installed.
    pub fn is_installed(&self) -> bool {
        self.current_handle().is_some()
    }

    // ── Session ─────────────────────────────────────────────────────

    /// Install a session obtained from the sign-in flow.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the session cannot be persisted; it
    /// is in effect for this run regardless.
    pub async fn sign_in(&self, session: Session) -> Result<()> {
        self.inner.services.store.sign_in(session).await
    }

    /// End the session, server side on a best-effort basis and locally
    /// always.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the persisted session cannot be
    /// cleared.
    pub async fn sign_out(&self) -> Result<()> {
        if let Ok(token) = self.inner.services.store.access_token() {
            if let Err(err) = self.inner.backend.sign_out(&token).await {
                debug!(error = %err, "server-side sign-out failed");
            }
        }
        self.inner.services.store.sign_out().await.map(|_| ())
    }

    /// Refresh the session now, joining any refresh in flight.
    ///
    /// # Errors
    ///
    /// See [`RefreshScheduler::request_refresh`].
    pub async fn refresh_now(&self) -> Result<Session> {
        self.inner.services.scheduler.request_refresh().await
    }

    /// The player asked to reload everything. Returns the keys invalidated.
    pub fn request_manual_refresh(&self) -> Vec<CacheKey> {
        self.inner
            .services
            .router
            .dispatch(EventKind::ManualRefresh, &DispatchContext::default())
    }

    /// Receive [`SyncEvent`]s. Every receiver sees every event sent after it
    /// subscribed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.services.events.subscribe()
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.services.store
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.inner.services.scheduler
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn router(&self) -> &Arc<InvalidationRouter> {
        &self.inner.services.router
    }

    pub fn executor(&self) -> &Arc<MutationExecutor> {
        &self.inner.executor
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.inner.platform
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("installed", &self.current_handle())
            .field("signed_in", &self.inner.services.store.current().is_some())
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored in the lifecycle while it runs, so it holds the coordinator
    /// only weakly across the storage read.
    async fn setup(weak: Weak<Self>) -> Result<LifecycleHandle> {
        let store = match weak.upgrade() {
            Some(inner) => Arc::clone(&inner.services.store),
            None => return Err(SyncError::TornDown),
        };
        let init = store.init().await;
        match weak.upgrade() {
            Some(inner) => inner.start(init),
            None => Err(SyncError::TornDown),
        }
    }

    fn start(&self, init: Result<Option<Session>>) -> Result<LifecycleHandle> {
        let restored = match init {
            Ok(restored) => restored,
            Err(err) => {
                warn!(error = %err, "install failed reading persisted session");
                *self.lock_lifecycle() = Lifecycle::Uninstalled;
                return Err(err);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel::<PlatformTrigger>(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        // Subscribe before anything can change credentials.
        let changes = self.services.store.subscribe();

        let listeners: Vec<ListenerId> = LISTENED_TRIGGERS
            .iter()
            .map(|&kind| {
                let tx = cmd_tx.clone();
                self.platform
                    .register(kind, Arc::new(move |signal| forward_trigger(&tx, signal)))
            })
            .collect();

        if restored.is_some() {
            forward_trigger(&cmd_tx, PlatformTrigger::ProcessStart);
        }
        drop(cmd_tx);

        let task = tokio::spawn(sync_loop(
            self.services.clone(),
            LoopTimers {
                refresh_interval: self.config.refresh_interval,
                presence_interval: self.config.presence_interval,
            },
            cmd_rx,
            changes,
            shutdown_rx,
        ));

        let handle = LifecycleHandle {
            inner: Arc::new(HandleInner {
                id: self.next_handle_id.fetch_add(1, Ordering::Relaxed),
                parts: Mutex::new(Some(HandleParts {
                    listeners,
                    shutdown_tx: Some(shutdown_tx),
                    task: Some(task),
                })),
            }),
        };
        *self.lock_lifecycle() = Lifecycle::Installed(handle.clone());

        info!(
            handle = handle.id(),
            restored = restored.is_some(),
            "session sync installed"
        );
        self.services.emit(SyncEvent::Installed {
            restored: restored.is_some(),
        });
        Ok(handle)
    }
}

/// Hand a platform signal to the sync loop without blocking the host.
fn forward_trigger(tx: &mpsc::Sender<PlatformTrigger>, trigger: PlatformTrigger) {
    match tx.try_send(trigger) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(trigger = ?dropped, "trigger channel full, dropping trigger");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("trigger channel closed, sync loop stopped");
        }
    }
}

// ── Sync loop ───────────────────────────────────────────────────────

struct LoopTimers {
    refresh_interval: Duration,
    presence_interval: Option<Duration>,
}

fn interval_from_now(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Background loop that multiplexes triggers, timers and credential changes
/// via `tokio::select!`.
///
/// Refreshes and presence pings run as tasks in a `JoinSet` so a slow backend
/// never delays the loop. Exits on the shutdown signal or once every trigger
/// sender is gone; in-flight tasks are aborted on exit.
async fn sync_loop(
    services: Services,
    timers: LoopTimers,
    mut cmd_rx: mpsc::Receiver<PlatformTrigger>,
    mut changes: broadcast::Receiver<CredentialChange>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("sync loop started");

    let mut refresh_tick = interval_from_now(timers.refresh_interval);
    let mut presence_tick = timers.presence_interval.map(interval_from_now);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            // Branch 1: shutdown signal
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break;
            }

            // Branch 2: platform trigger
            trigger = cmd_rx.recv() => {
                match trigger {
                    Some(trigger) => services.on_trigger(trigger, &mut tasks),
                    None => {
                        debug!("trigger channel closed, stopping sync loop");
                        break;
                    }
                }
            }

            // Branch 3: credential change, handled here and never on the
            // stack that raised it
            change = changes.recv() => {
                match change {
                    Ok(change) => services.on_credential_change(&change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed credential changes, resynchronizing");
                        services.resynchronize();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("credential store dropped, stopping sync loop");
                        break;
                    }
                }
            }

            // Branch 4: refresh interval
            _ = refresh_tick.tick() => {
                services.spawn_refresh("interval", &mut tasks);
            }

            // Branch 5: presence interval
            _ = tick_optional(presence_tick.as_mut()) => {
                services.spawn_heartbeat(&mut tasks);
            }

            // Branch 6: reap finished tasks
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(join_err) = joined {
                    if !join_err.is_cancelled() {
                        warn!("sync task failed: {join_err}");
                    }
                }
            }
        }
    }

    tasks.abort_all();
    debug!("sync loop exited");
}

async fn tick_optional(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Services {
    fn on_trigger(&self, trigger: PlatformTrigger, tasks: &mut JoinSet<()>) {
        debug!(?trigger, "platform trigger received");
        if trigger.requests_refresh() {
            self.spawn_refresh(trigger_reason(trigger), tasks);
        }
        if trigger == PlatformTrigger::BecameVisible && self.presence_enabled {
            let presence = Arc::clone(&self.presence);
            tasks.spawn(async move {
                presence.session_started().await;
            });
        }
    }

    fn spawn_refresh(&self, reason: &'static str, tasks: &mut JoinSet<()>) {
        let scheduler = Arc::clone(&self.scheduler);
        let events = self.events.clone();
        tasks.spawn(async move {
            match scheduler.request_refresh().await {
                Ok(session) => {
                    debug!(reason, expires_in = session.expires_in(), "refresh succeeded");
                }
                Err(SyncError::NoSession) => debug!(reason, "refresh skipped, signed out"),
                Err(SyncError::Superseded) => debug!(reason, "refresh superseded"),
                // The store announces the sign-out.
                Err(err) if err.is_unauthenticated() => {
                    info!(reason, error = %err, "refresh rejected");
                }
                Err(err) => {
                    warn!(reason, error = %err, "refresh failed");
                    let _ = events.send(SyncEvent::RefreshFailed {
                        class: err.class(),
                        message: err.to_string(),
                    });
                }
            }
        });
    }

    fn spawn_heartbeat(&self, tasks: &mut JoinSet<()>) {
        let presence = Arc::clone(&self.presence);
        tasks.spawn(async move {
            presence.heartbeat().await;
        });
    }

    fn on_credential_change(&self, change: &CredentialChange) {
        debug!(kind = ?change.kind, generation = change.generation, "credential change");
        let (event, kind) = match (change.kind, change.user_id) {
            (ChangeKind::SignedIn, Some(user_id)) => {
                (SyncEvent::SignedIn { user_id }, EventKind::AuthChanged)
            }
            (ChangeKind::Refreshed, Some(user_id)) => {
                (SyncEvent::SessionRefreshed { user_id }, EventKind::AuthRefreshed)
            }
            (ChangeKind::SignedOut, _) => (SyncEvent::SignedOut, EventKind::AuthSignedOut),
            (_, None) => {
                self.resynchronize();
                return;
            }
        };
        self.emit(event);
        self.router.dispatch(kind, &DispatchContext::default());
    }

    /// Treat an unknown sequence of changes as a full credential change.
    fn resynchronize(&self) {
        match self.store.current() {
            Some(session) => {
                self.emit(SyncEvent::SignedIn {
                    user_id: session.user_id,
                });
                self.router
                    .dispatch(EventKind::AuthChanged, &DispatchContext::default());
            }
            None => {
                self.emit(SyncEvent::SignedOut);
                self.router
                    .dispatch(EventKind::AuthSignedOut, &DispatchContext::default());
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            debug!("no event subscribers");
        }
    }
}

fn trigger_reason(trigger: PlatformTrigger) -> &'static str {
    match trigger {
        PlatformTrigger::BecameVisible => "visible",
        PlatformTrigger::BecameHidden => "hidden",
        PlatformTrigger::WindowFocused => "focus",
        PlatformTrigger::NetworkOnline => "online",
        PlatformTrigger::NetworkOffline => "offline",
        PlatformTrigger::ProcessStart => "process-start",
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Counts calls; refresh always succeeds with a new token.
    #[derive(Default)]
    struct CountingBackend {
        refreshes: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Session {
                access_token: format!("access-{n}"),
                refresh_token: refresh_token.to_string(),
                expires_at: 4_000_000_000,
                user_id: uuid::Uuid::from_u128(1),
            })
        }

        async fn call(&self, _: &str, _: &str, _: serde_json::Value) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    }

    fn coordinator() -> (SessionCoordinator, Arc<Platform>) {
        let platform = Arc::new(Platform::new());
        let coordinator = SessionCoordinator::new(
            Arc::new(CountingBackend::default()),
            Arc::new(MemoryStorage::new()),
            Arc::clone(&platform),
            SyncConfig::new(),
        );
        (coordinator, platform)
    }

    #[test]
    fn config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.refresh_interval, Duration::from_secs(540));
        assert_eq!(config.refresh_timeout, Duration::from_secs(10));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.presence_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.storage_namespace, "brain-heist-auth");
    }

    #[test]
    fn config_clamps() {
        let config = SyncConfig::new()
            .with_event_channel_capacity(0)
            .with_refresh_interval(Duration::ZERO)
            .with_presence_interval(Some(Duration::ZERO));
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.refresh_interval, MIN_TIMER_PERIOD);
        assert_eq!(config.presence_interval, Some(MIN_TIMER_PERIOD));
    }

    #[tokio::test]
    async fn install_registers_listeners_once() {
        let (coordinator, platform) = coordinator();
        let a = coordinator.install().await.unwrap();
        let b = coordinator.install().await.unwrap();

        assert_eq!(a, b);
        assert_eq!(platform.listener_count(), LISTENED_TRIGGERS.len());
        assert!(coordinator.is_installed());

        coordinator.teardown(&a).await;
        assert_eq!(platform.listener_count(), 0);
        assert!(!a.is_active());
        assert!(!coordinator.is_installed());
    }

    #[tokio::test]
    async fn install_during_teardown_gets_a_new_handle() {
        let (coordinator, platform) = coordinator();
        let old = coordinator.install().await.unwrap();

        let mut teardown = tokio_test::task::spawn(coordinator.teardown(&old));
        // Parked on the sync loop's exit.
        tokio_test::assert_pending!(teardown.poll());
        assert!(!coordinator.is_installed());

        let new = coordinator.install().await.unwrap();
        assert_ne!(new, old);
        assert!(new.is_active());

        teardown.await;
        assert!(coordinator.is_installed());
        assert_eq!(platform.listener_count(), LISTENED_TRIGGERS.len());
        coordinator.teardown(&new).await;
    }

    /// Storage whose reads never finish.
    struct StalledStorage;

    #[async_trait]
    impl SessionStorage for StalledStorage {
        async fn load(&self, _: &str) -> Result<Option<String>> {
            std::future::pending().await
        }

        async fn save(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn clear(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn abandoned_install_does_not_keep_coordinator_alive() {
        let coordinator = SessionCoordinator::new(
            Arc::new(CountingBackend::default()),
            Arc::new(StalledStorage),
            Arc::new(Platform::new()),
            SyncConfig::new(),
        );
        let weak = Arc::downgrade(&coordinator.inner);

        let mut install = tokio_test::task::spawn(coordinator.install());
        tokio_test::assert_pending!(install.poll());
        drop(install);
        assert!(!coordinator.is_installed());

        drop(coordinator);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn shutdown_without_install_is_noop() {
        let (coordinator, platform) = coordinator();
        coordinator.shutdown().await;
        assert_eq!(platform.listener_count(), 0);
        assert!(coordinator.current_handle().is_none());
    }

    #[tokio::test]
    async fn dropping_coordinator_stops_loop() {
        let (coordinator, platform) = coordinator();
        coordinator.install().await.unwrap();
        assert!(Arc::strong_count(&platform) > 1);

        drop(coordinator);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(platform.listener_count(), 0);
        assert_eq!(Arc::strong_count(&platform), 1);
    }

    #[test]
    fn reasons_are_distinct() {
        let reasons: std::collections::HashSet<_> = [
            PlatformTrigger::BecameVisible,
            PlatformTrigger::BecameHidden,
            PlatformTrigger::WindowFocused,
            PlatformTrigger::NetworkOnline,
            PlatformTrigger::NetworkOffline,
            PlatformTrigger::ProcessStart,
        ]
        .into_iter()
        .map(trigger_reason)
        .collect();
        assert_eq!(reasons.len(), 6);
    }
}
