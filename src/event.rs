//! Events delivered to the UI by the coordinator.

use crate::cache::CacheKey;
use crate::error::ErrorClass;
use crate::invalidation::EventKind;
use crate::protocol::UserId;

/// Something the UI may want to react to.
///
/// Delivered on a broadcast channel from
/// [`SessionCoordinator::subscribe_events`](crate::coordinator::SessionCoordinator::subscribe_events);
/// every subscriber sees every event. A subscriber that falls behind loses
/// the oldest events and should re-read the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The coordinator finished installing.
    Installed {
        /// Whether a persisted session was restored.
        restored: bool,
    },
    /// A session was installed by sign-in.
    SignedIn { user_id: UserId },
    /// The session was renewed.
    SessionRefreshed { user_id: UserId },
    /// The session is gone. The only event that should force navigation to
    /// the sign-in screen.
    SignedOut,
    /// A background refresh failed without signing out.
    RefreshFailed { class: ErrorClass, message: String },
    /// Cache keys were invalidated or purged.
    Invalidated { event: EventKind, keys: Vec<CacheKey> },
    /// The coordinator was torn down.
    TornDown,
}

impl SyncEvent {
    /// Returns `true` for events after which the UI must show sign-in.
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, Self::SignedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sign_out_forces_navigation() {
        assert!(SyncEvent::SignedOut.requires_sign_in());
        assert!(!SyncEvent::TornDown.requires_sign_in());
        assert!(!SyncEvent::RefreshFailed {
            class: ErrorClass::Transient,
            message: "offline".into(),
        }
        .requires_sign_in());
    }
}
