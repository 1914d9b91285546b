//! Host platform signals: visibility, focus, connectivity, process start.
//!
//! The host (a webview shell, a desktop window, a test) calls
//! [`Platform::emit`] when something happens; the coordinator registers
//! listeners for the signals it cares about. Listeners are plain synchronous
//! callbacks and must not block; the coordinator's only forward the signal
//! to its loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

/// A signal from the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformTrigger {
    /// The page or window became visible.
    BecameVisible,
    /// The page or window was hidden.
    BecameHidden,
    /// The window regained focus.
    WindowFocused,
    /// Network connectivity returned.
    NetworkOnline,
    /// Network connectivity was lost.
    NetworkOffline,
    /// The process started with a persisted session.
    ProcessStart,
}

impl PlatformTrigger {
    /// Triggers that ask for an immediate session refresh.
    pub fn requests_refresh(self) -> bool {
        matches!(
            self,
            Self::BecameVisible | Self::WindowFocused | Self::NetworkOnline | Self::ProcessStart
        )
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A platform listener callback.
pub type Listener = Arc<dyn Fn(PlatformTrigger) + Send + Sync>;

struct Registration {
    id: ListenerId,
    trigger: PlatformTrigger,
    listener: Listener,
}

/// Listener registry plus the host's last reported visibility and
/// connectivity.
pub struct Platform {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Registration>>,
    visible: AtomicBool,
    online: AtomicBool,
}

impl Platform {
    /// A platform that starts out visible and online.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            visible: AtomicBool::new(true),
            online: AtomicBool::new(true),
        }
    }

    /// Register `listener` for one kind of trigger.
    pub fn register(&self, trigger: PlatformTrigger, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Registration {
            id,
            trigger,
            listener,
        });
        trace!(?id, ?trigger, "platform listener registered");
        id
    }

    /// Remove a listener. Returns `false` if it was already removed.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Record a host signal and notify its listeners.
    ///
    /// Listeners run on the caller's stack, outside the registry lock, so a
    /// listener may register or unregister without deadlocking.
    pub fn emit(&self, trigger: PlatformTrigger) {
        match trigger {
            PlatformTrigger::BecameVisible => self.visible.store(true, Ordering::Release),
            PlatformTrigger::BecameHidden => self.visible.store(false, Ordering::Release),
            PlatformTrigger::NetworkOnline => self.online.store(true, Ordering::Release),
            PlatformTrigger::NetworkOffline => self.online.store(false, Ordering::Release),
            PlatformTrigger::WindowFocused | PlatformTrigger::ProcessStart => {}
        }

        let targets: Vec<Listener> = self
            .lock()
            .iter()
            .filter(|r| r.trigger == trigger)
            .map(|r| Arc::clone(&r.listener))
            .collect();
        debug!(?trigger, listeners = targets.len(), "platform trigger");
        for listener in targets {
            listener(trigger);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Last reported visibility.
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// Last reported connectivity.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("listeners", &self.listener_count())
            .field("visible", &self.is_visible())
            .field("online", &self.is_online())
            .finish()
    }
}
