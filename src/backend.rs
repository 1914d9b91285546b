//! Backend abstraction for the remote game procedures.
//!
//! The [`Backend`] trait is the only way the coordinator talks to the game
//! server. Game rules (combat, AP regeneration, economy, rankings) live
//! entirely behind it; the coordinator only needs to renew the session, call
//! named procedures with a JSON payload, and end the session.
//!
//! # Implementing a Custom Backend
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use heist_sync::backend::Backend;
//! use heist_sync::error::SyncError;
//! use heist_sync::protocol::Session;
//!
//! struct MyBackend { /* ... */ }
//!
//! #[async_trait]
//! impl Backend for MyBackend {
//!     async fn refresh_session(&self, refresh_token: &str) -> Result<Session, SyncError> {
//!         // Exchange the refresh token for a new session
//!         Err(SyncError::Transport("not wired up".into()))
//!     }
//!
//!     async fn call(
//!         &self,
//!         procedure: &str,
//!         access_token: &str,
//!         params: serde_json::Value,
//!     ) -> Result<serde_json::Value, SyncError> {
//!         // Invoke the named procedure and return its JSON result
//!         Err(SyncError::Transport("not wired up".into()))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SyncError;
use crate::protocol::Session;

/// Remote procedure surface of the game backend.
///
/// Implementations must map every failure to a [`SyncError`] whose
/// [`class()`](SyncError::class) is meaningful: rejected credentials as
/// `Unauthenticated`, business-rule refusals as `DomainRejected`, and
/// everything network-shaped as `Transient`.
///
/// # Object Safety
///
/// This trait is object-safe; the coordinator stores it as
/// `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Exchange a refresh token for a new session.
    ///
    /// # Errors
    ///
    /// An `Unauthenticated`-class error means the refresh token is no longer
    /// usable and the client must sign in again.
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, SyncError>;

    /// Invoke a named procedure on behalf of the holder of `access_token`.
    ///
    /// # Errors
    ///
    /// Returns the backend's classified error.
    async fn call(
        &self,
        procedure: &str,
        access_token: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SyncError>;

    /// End the session on the server side.
    ///
    /// The default implementation does nothing, for backends whose sessions
    /// simply expire.
    ///
    /// # Errors
    ///
    /// Returns the backend's classified error. Callers treat sign-out as
    /// best effort and clear local state regardless.
    async fn sign_out(&self, _access_token: &str) -> Result<(), SyncError> {
        Ok(())
    }
}
