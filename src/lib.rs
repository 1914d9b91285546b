//! # Heist Sync
//!
//! Client-side session and reactive-cache synchronization for Brain Heist.
//!
//! Gameplay rules run on the backend behind remote procedures. This crate
//! keeps the client's view of them consistent: it silently refreshes the
//! session, caches server reads with staleness metadata, and invalidates the
//! right reads when the session changes or a mutation succeeds.
//!
//! ## Features
//!
//! - **Idempotent lifecycle**: [`SessionCoordinator::install`] may be called
//!   from every UI mount; one installation results
//! - **Single-flight**: one session refresh and one fetch per cache key in
//!   flight, shared by every concurrent caller
//! - **Rule-driven invalidation**: a static table maps events to the cache
//!   keys they make outdated
//! - **REST backend built-in**: default `backend-rest` feature provides
//!   [`RestBackend`](backends::RestBackend)
//! - **Event-driven**: receive [`SyncEvent`]s via a broadcast channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use heist_sync::{MemoryStorage, Platform, SessionCoordinator, SyncConfig};
//! use heist_sync::backends::{RestBackend, RestConfig};
//!
//! let backend = Arc::new(RestBackend::new(RestConfig::new(url, anon_key))?);
//! let platform = Arc::new(Platform::new());
//! let coordinator = SessionCoordinator::new(
//!     backend,
//!     Arc::new(MemoryStorage::new()),
//!     Arc::clone(&platform),
//!     SyncConfig::new(),
//! );
//! let handle = coordinator.install().await?;
//!
//! // Host glue: forward window events.
//! platform.emit(heist_sync::PlatformTrigger::WindowFocused);
//!
//! let profile = coordinator.cache().read(&"profile".into());
//! ```

pub mod backend;
pub mod backends;
pub mod cache;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod invalidation;
pub mod mutation;
pub mod platform;
pub mod presence;
pub mod protocol;
pub mod resources;
pub mod scheduler;
mod single_flight;
pub mod storage;

// Re-export primary types for ergonomic imports.
pub use backend::Backend;
pub use cache::{CacheEntry, CacheKey, CacheState, QueryCache, QueryFetcher, Subscription};
pub use coordinator::{LifecycleHandle, SessionCoordinator, SyncConfig};
pub use credentials::{ChangeKind, CredentialChange, CredentialStore};
pub use error::{ErrorClass, SyncError};
pub use error_codes::ErrorCode;
pub use event::SyncEvent;
pub use invalidation::{
    DispatchContext, EventKind, InvalidationAction, InvalidationRouter, InvalidationRule,
    KeyPattern,
};
pub use mutation::MutationExecutor;
pub use platform::{ListenerId, Platform, PlatformTrigger};
pub use protocol::{MutationKind, Session};
pub use scheduler::RefreshScheduler;
#[cfg(feature = "file-storage")]
pub use storage::FileStorage;
pub use storage::{MemoryStorage, SessionStorage};
