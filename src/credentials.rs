//! The credential store: the single authoritative [`Session`].
//!
//! Every replacement or removal of the session bumps a generation counter.
//! Writers that raced with a newer change (a refresh that resolved after the
//! player signed in again, two refresh failures that both want to sign out)
//! pass the generation they started from and lose cleanly instead of
//! overwriting newer state.
//!
//! Changes are announced on a [`broadcast`] channel. Sending never runs
//! subscriber code, so a change raised from inside a network call can never
//! re-enter that call; subscribers handle it on their own task.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::protocol::{PersistedSession, Session, UserId, PERSISTED_SESSION_VERSION};
use crate::storage::SessionStorage;

/// Capacity of the credential-change channel. Changes are rare; a lagging
/// subscriber treats the gap as a full credential change.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// What happened to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new session was installed by sign-in.
    SignedIn,
    /// The existing session was renewed.
    Refreshed,
    /// The session was removed.
    SignedOut,
}

/// A credential change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialChange {
    pub kind: ChangeKind,
    /// Generation after the change.
    pub generation: u64,
    /// Player the change concerns.
    pub user_id: Option<UserId>,
}

#[derive(Debug, Default)]
struct StoreState {
    session: Option<Session>,
    generation: u64,
}

/// Holds the current session, persists it, and announces changes.
pub struct CredentialStore {
    storage: Arc<dyn SessionStorage>,
    namespace: String,
    state: Mutex<StoreState>,
    /// Serializes write-through so storage sees changes in generation order.
    write_lock: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<CredentialChange>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn SessionStorage>, namespace: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            storage,
            namespace: namespace.into(),
            state: Mutex::new(StoreState::default()),
            write_lock: tokio::sync::Mutex::new(()),
            changes,
        }
    }

    /// Load the persisted session into memory.
    ///
    /// An undecodable or unknown-version blob is discarded and cleared from
    /// storage. Loading does not announce a change.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if storage cannot be read.
    pub async fn init(&self) -> Result<Option<Session>> {
        let _write = self.write_lock.lock().await;
        let Some(blob) = self.storage.load(&self.namespace).await? else {
            debug!(namespace = %self.namespace, "no persisted session");
            return Ok(None);
        };

        let session = match serde_json::from_str::<PersistedSession>(&blob) {
            Ok(persisted) if persisted.version == PERSISTED_SESSION_VERSION => persisted.session,
            Ok(persisted) => {
                warn!(
                    version = persisted.version,
                    "discarding persisted session with unknown version"
                );
                self.storage.clear(&self.namespace).await?;
                return Ok(None);
            }
            Err(err) => {
                warn!(error = %err, "discarding undecodable persisted session");
                self.storage.clear(&self.namespace).await?;
                return Ok(None);
            }
        };

        let mut state = self.lock_state();
        state.session = Some(session.clone());
        state.generation += 1;
        info!(user_id = %session.user_id, expires_in = session.expires_in(), "restored persisted session");
        Ok(Some(session))
    }

    /// Drop the in-memory session without touching storage. The next
    /// [`init`](Self::init) restores it.
    pub fn teardown(&self) {
        let mut state = self.lock_state();
        if state.session.take().is_some() {
            state.generation += 1;
        }
    }

    /// The current session, if signed in.
    pub fn current(&self) -> Option<Session> {
        self.lock_state().session.clone()
    }

    /// The current generation.
    pub fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    /// The current session together with the generation it belongs to.
    pub fn snapshot(&self) -> (Option<Session>, u64) {
        let state = self.lock_state();
        (state.session.clone(), state.generation)
    }

    /// Bearer token for a procedure call.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NoSession`] when signed out.
    pub fn access_token(&self) -> Result<String> {
        self.lock_state()
            .session
            .as_ref()
            .map(|s| s.access_token.clone())
            .ok_or(SyncError::NoSession)
    }

    /// Subscribe to credential changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CredentialChange> {
        self.changes.subscribe()
    }

    /// Install a session from sign-in, replacing any current one.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the session cannot be persisted. The
    /// in-memory session is installed regardless.
    pub async fn sign_in(&self, session: Session) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let generation = {
            let mut state = self.lock_state();
            state.session = Some(session.clone());
            state.generation += 1;
            state.generation
        };
        info!(user_id = %session.user_id, generation, "signed in");
        let persisted = self.persist(&session).await;
        self.announce(ChangeKind::SignedIn, generation, Some(session.user_id));
        persisted
    }

    /// Install a refreshed session if nothing changed since `expected_generation`.
    ///
    /// Returns `false` when a newer change won; the refreshed session is
    /// dropped in that case.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the session cannot be persisted.
    pub async fn apply_refresh(&self, expected_generation: u64, session: Session) -> Result<bool> {
        let _write = self.write_lock.lock().await;
        let generation = {
            let mut state = self.lock_state();
            if state.generation != expected_generation || state.session.is_none() {
                debug!(
                    expected_generation,
                    current_generation = state.generation,
                    "dropping refresh result for a superseded session"
                );
                return Ok(false);
            }
            state.session = Some(session.clone());
            state.generation += 1;
            state.generation
        };
        debug!(user_id = %session.user_id, generation, "session refreshed");
        let persisted = self.persist(&session).await;
        self.announce(ChangeKind::Refreshed, generation, Some(session.user_id));
        persisted.map(|()| true)
    }

    /// Remove the session unconditionally.
    ///
    /// Returns `true` if a session was removed. Signing out while signed out
    /// announces nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if storage cannot be cleared.
    pub async fn sign_out(&self) -> Result<bool> {
        self.clear(None).await
    }

    /// Remove the session if nothing changed since `expected_generation`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if storage cannot be cleared.
    pub async fn clear_if_current(&self, expected_generation: u64) -> Result<bool> {
        self.clear(Some(expected_generation)).await
    }

    async fn clear(&self, expected_generation: Option<u64>) -> Result<bool> {
        let _write = self.write_lock.lock().await;
        let (generation, user_id) = {
            let mut state = self.lock_state();
            if expected_generation.is_some_and(|g| g != state.generation) {
                return Ok(false);
            }
            let Some(old) = state.session.take() else {
                return Ok(false);
            };
            state.generation += 1;
            (state.generation, old.user_id)
        };
        info!(%user_id, generation, "signed out");
        let cleared = self.storage.clear(&self.namespace).await;
        self.announce(ChangeKind::SignedOut, generation, Some(user_id));
        cleared.map(|()| true)
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        let blob = serde_json::to_string(&PersistedSession::new(session.clone()))?;
        self.storage.save(&self.namespace, &blob).await.map_err(|err| {
            warn!(error = %err, "failed to persist session");
            err
        })
    }

    fn announce(&self, kind: ChangeKind, generation: u64, user_id: Option<UserId>) {
        // No receivers is fine: nothing is installed yet.
        let _ = self.changes.send(CredentialChange {
            kind,
            generation,
            user_id,
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CredentialStore")
            .field("namespace", &self.namespace)
            .field("signed_in", &state.session.is_some())
            .field("generation", &state.generation)
            .finish()
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
    use crate::storage::{MemoryStorage, DEFAULT_NAMESPACE};

    fn session(tag: &str) -> Session {
        Session {
            access_token: format!("access-{tag}"),
            refresh_token: format!("refresh-{tag}"),
            expires_at: 4_000_000_000,
            user_id: uuid::Uuid::from_u128(1),
        }
    }

    fn store() -> (CredentialStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let store = CredentialStore::new(storage.clone(), DEFAULT_NAMESPACE);
        (store, storage)
    }

    #[tokio::test]
    async fn sign_in_persists_and_announces() {
        let (store, storage) = store();
        let mut changes = store.subscribe();

        store.sign_in(session("a")).await.unwrap();

        assert_eq!(store.access_token().unwrap(), "access-a");
        let blob = storage.snapshot(DEFAULT_NAMESPACE).unwrap();
        let persisted: PersistedSession = serde_json::from_str(&blob).unwrap();
        assert_eq!(persisted.session, session("a"));

        let change = changes.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::SignedIn);
        assert_eq!(change.generation, store.generation());
    }

    #[tokio::test]
    async fn init_restores_persisted_session() {
        let blob = serde_json::to_string(&PersistedSession::new(session("p"))).unwrap();
        let storage = Arc::new(MemoryStorage::with_blob(DEFAULT_NAMESPACE, blob));
        let store = CredentialStore::new(storage, DEFAULT_NAMESPACE);

        let restored = store.init().await.unwrap();
        assert_eq!(restored, Some(session("p")));
        assert_eq!(store.current(), Some(session("p")));
    }

    #[tokio::test]
    async fn init_discards_garbage_blob() {
        let storage = Arc::new(MemoryStorage::with_blob(DEFAULT_NAMESPACE, "not json"));
        let store = CredentialStore::new(storage.clone(), DEFAULT_NAMESPACE);

        assert_eq!(store.init().await.unwrap(), None);
        assert_eq!(storage.snapshot(DEFAULT_NAMESPACE), None);
    }

    #[tokio::test]
    async fn init_discards_unknown_version() {
        let blob = serde_json::json!({ "version": 99, "session": session("v") }).to_string();
        let storage = Arc::new(MemoryStorage::with_blob(DEFAULT_NAMESPACE, blob));
        let store = CredentialStore::new(storage.clone(), DEFAULT_NAMESPACE);

        assert_eq!(store.init().await.unwrap(), None);
        assert_eq!(storage.snapshot(DEFAULT_NAMESPACE), None);
    }

    #[tokio::test]
    async fn refresh_from_stale_generation_is_dropped() {
        let (store, _storage) = store();
        store.sign_in(session("old")).await.unwrap();
        let started_at = store.generation();

        // Player signs in again while the refresh is in flight.
        store.sign_in(session("new")).await.unwrap();

        let applied = store
            .apply_refresh(started_at, session("refreshed-old"))
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.access_token().unwrap(), "access-new");
    }

    #[tokio::test]
    async fn clear_if_current_only_clears_once() {
        let (store, storage) = store();
        store.sign_in(session("a")).await.unwrap();
        let generation = store.generation();
        let mut changes = store.subscribe();

        assert!(store.clear_if_current(generation).await.unwrap());
        assert!(!store.clear_if_current(generation).await.unwrap());
        assert!(!store.sign_out().await.unwrap());

        assert_eq!(storage.snapshot(DEFAULT_NAMESPACE), None);
        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::SignedOut);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn teardown_keeps_persisted_blob() {
        let (store, storage) = store();
        store.sign_in(session("a")).await.unwrap();

        store.teardown();
        assert!(store.current().is_none());
        assert!(storage.snapshot(DEFAULT_NAMESPACE).is_some());

        assert_eq!(store.init().await.unwrap(), Some(session("a")));
    }

    #[test]
    fn access_token_without_session_is_no_session() {
        let (store, _storage) = store();
        assert_eq!(store.access_token(), Err(SyncError::NoSession));
    }
}
