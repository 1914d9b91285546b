//! Best-effort presence pings.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::backend::Backend;
use crate::credentials::CredentialStore;
use crate::platform::Platform;
use crate::protocol::{PROC_SESSION_START, PROC_TOUCH_PRESENCE};

/// Tells the backend the player is around.
///
/// Pings only go out with a session, while the host reports the page visible
/// and the network online. Failures are logged and dropped.
pub struct PresenceHeartbeat {
    store: Arc<CredentialStore>,
    backend: Arc<dyn Backend>,
    platform: Arc<Platform>,
}

impl PresenceHeartbeat {
    pub fn new(
        store: Arc<CredentialStore>,
        backend: Arc<dyn Backend>,
        platform: Arc<Platform>,
    ) -> Self {
        Self {
            store,
            backend,
            platform,
        }
    }

    /// Send `touch_presence`. Returns whether a ping was sent.
    pub async fn heartbeat(&self) -> bool {
        let Some(token) = self.token() else {
            return false;
        };
        self.ping(PROC_TOUCH_PRESENCE, &token).await;
        true
    }

    /// Send `session_start` then `touch_presence`, for a page that just
    /// became visible. Returns whether pings were sent.
    pub async fn session_started(&self) -> bool {
        let Some(token) = self.token() else {
            return false;
        };
        self.ping(PROC_SESSION_START, &token).await;
        self.ping(PROC_TOUCH_PRESENCE, &token).await;
        true
    }

    fn token(&self) -> Option<String> {
        if !self.platform.is_visible() || !self.platform.is_online() {
            return None;
        }
        self.store.access_token().ok()
    }

    async fn ping(&self, procedure: &str, token: &str) {
        if let Err(err) = self.backend.call(procedure, token, json!({})).await {
            debug!(procedure, error = %err, "presence ping failed");
        }
    }
}

impl std::fmt::Debug for PresenceHeartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceHeartbeat").finish_non_exhaustive()
    }
}
