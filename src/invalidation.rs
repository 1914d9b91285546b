//! Event-driven cache invalidation.
//!
//! Every change the client learns about is an [`EventKind`]. A static rule
//! table maps each kind to the cache keys it makes outdated; the
//! [`InvalidationRouter`] applies the matching rules to the
//! [`QueryCache`]. Nothing else invalidates.

use std::fmt;
use std::str::FromStr;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::cache::{CacheKey, QueryCache};
use crate::event::SyncEvent;
use crate::protocol::{Batch, MutationKind};

// ── Events ──────────────────────────────────────────────────────────

/// A change that may make cached reads outdated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A different session was installed (`auth.changed`).
    AuthChanged,
    /// The current session was renewed (`auth.refreshed`).
    AuthRefreshed,
    /// The session was removed (`auth.signedOut`).
    AuthSignedOut,
    /// The player asked for everything to be reloaded (`manual.refresh`).
    ManualRefresh,
    /// A mutation succeeded (`<kind>.success`).
    MutationSucceeded(MutationKind),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthChanged => f.write_str("auth.changed"),
            Self::AuthRefreshed => f.write_str("auth.refreshed"),
            Self::AuthSignedOut => f.write_str("auth.signedOut"),
            Self::ManualRefresh => f.write_str("manual.refresh"),
            Self::MutationSucceeded(kind) => write!(f, "{kind}.success"),
        }
    }
}

/// Error returned when parsing an unknown event name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth.changed" => Ok(Self::AuthChanged),
            "auth.refreshed" => Ok(Self::AuthRefreshed),
            "auth.signedOut" => Ok(Self::AuthSignedOut),
            "manual.refresh" => Ok(Self::ManualRefresh),
            other => other
                .strip_suffix(".success")
                .and_then(|name| MutationKind::ALL.into_iter().find(|k| k.as_str() == name))
                .map(Self::MutationSucceeded)
                .ok_or_else(|| UnknownEventKind(other.to_string())),
        }
    }
}

// ── Rules ───────────────────────────────────────────────────────────

/// What a rule does to the entries it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationAction {
    /// Mark stale; the value keeps being served until refetched.
    Invalidate,
    /// Drop the value.
    Purge,
}

/// Maps one event kind to the key patterns it affects.
///
/// Patterns are `"*"` (every key), `"resource:*"` (every argument of a
/// resource), an exact key, or a key with a `{batch}` placeholder filled from
/// the [`DispatchContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationRule {
    pub event: EventKind,
    pub action: InvalidationAction,
    pub patterns: &'static [&'static str],
}

const fn invalidate(event: EventKind, patterns: &'static [&'static str]) -> InvalidationRule {
    InvalidationRule {
        event,
        action: InvalidationAction::Invalidate,
        patterns,
    }
}

const fn on_success(kind: MutationKind, patterns: &'static [&'static str]) -> InvalidationRule {
    invalidate(EventKind::MutationSucceeded(kind), patterns)
}

/// The rule table.
pub static INVALIDATION_RULES: &[InvalidationRule] = &[
    invalidate(EventKind::AuthChanged, &["*"]),
    invalidate(EventKind::AuthRefreshed, &["profile"]),
    InvalidationRule {
        event: EventKind::AuthSignedOut,
        action: InvalidationAction::Purge,
        patterns: &["*"],
    },
    invalidate(EventKind::ManualRefresh, &["*"]),
    on_success(MutationKind::Attack, &["ap-status", "leaderboard:*"]),
    on_success(MutationKind::JobStart, &["jobs", "ap-status"]),
    on_success(MutationKind::JobClaim, &["jobs", "profile", "leaderboard:*"]),
    on_success(MutationKind::Upgrade, &["profile", "raid-targets"]),
    on_success(MutationKind::Purchase, &["inventory", "profile"]),
    on_success(MutationKind::ProfileUpdate, &["profile", "leaderboard:{batch}"]),
    on_success(MutationKind::PveRun, &["ap-status", "profile"]),
    on_success(MutationKind::QuizAnswer, &["profile", "news"]),
    on_success(MutationKind::ClanJoin, &["clan", "profile"]),
];

// ── Patterns ────────────────────────────────────────────────────────

/// Details of the event being dispatched that patterns may refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchContext {
    /// Fills `{batch}` placeholders.
    pub batch: Option<Batch>,
}

impl DispatchContext {
    #[must_use]
    pub fn with_batch(mut self, batch: impl Into<Batch>) -> Self {
        self.batch = Some(batch.into());
        self
    }

    /// Context from a mutation payload's `batch` or `p_batch` field.
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let batch = ["batch", "p_batch"]
            .iter()
            .find_map(|field| payload.get(field).and_then(serde_json::Value::as_str))
            .map(str::to_string);
        Self { batch }
    }
}

/// A resolved rule pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Exactly this key.
    Exact(CacheKey),
    /// Every key starting with this prefix.
    Prefix(String),
    /// Every key.
    All,
}

impl KeyPattern {
    /// Resolve a rule pattern against `ctx`.
    ///
    /// A `{batch}` placeholder without a batch in the context widens to every
    /// argument of the resource.
    pub fn resolve(raw: &str, ctx: &DispatchContext) -> Self {
        if raw == "*" {
            return Self::All;
        }
        if raw.contains("{batch}") {
            return match &ctx.batch {
                // The batch comes from a payload; it is never a pattern.
                Some(batch) => Self::Exact(CacheKey::new(raw.replace("{batch}", batch))),
                None => {
                    let resource = raw.split_once(':').map_or(raw, |(r, _)| r);
                    Self::Prefix(format!("{resource}:"))
                }
            };
        }
        match raw.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(CacheKey::new(raw)),
        }
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => key.as_str().starts_with(prefix.as_str()),
            Self::All => true,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => write!(f, "{key}"),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::All => f.write_str("*"),
        }
    }
}

// ── Router ──────────────────────────────────────────────────────────

/// Applies the rule table to a [`QueryCache`].
pub struct InvalidationRouter {
    cache: QueryCache,
    rules: &'static [InvalidationRule],
    events: Option<broadcast::Sender<SyncEvent>>,
}

impl InvalidationRouter {
    pub fn new(cache: QueryCache) -> Self {
        Self {
            cache,
            rules: INVALIDATION_RULES,
            events: None,
        }
    }

    /// Announce every non-empty dispatch as [`SyncEvent::Invalidated`].
    #[must_use]
    pub fn with_events(mut self, events: broadcast::Sender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn rules(&self) -> &'static [InvalidationRule] {
        self.rules
    }

    /// The actions and resolved patterns `event` maps to, without touching
    /// the cache.
    pub fn targets(
        &self,
        event: EventKind,
        ctx: &DispatchContext,
    ) -> Vec<(InvalidationAction, KeyPattern)> {
        self.rules
            .iter()
            .filter(|rule| rule.event == event)
            .flat_map(|rule| {
                rule.patterns
                    .iter()
                    .map(move |raw| (rule.action, KeyPattern::resolve(raw, ctx)))
            })
            .collect()
    }

    /// Apply the rules for `event` and return the keys affected, sorted and
    /// without duplicates.
    pub fn dispatch(&self, event: EventKind, ctx: &DispatchContext) -> Vec<CacheKey> {
        let mut keys = Vec::new();
        for (action, pattern) in self.targets(event, ctx) {
            trace!(%event, ?action, %pattern, "applying invalidation rule");
            keys.extend(match action {
                InvalidationAction::Invalidate => self.cache.invalidate(&pattern),
                InvalidationAction::Purge => self.cache.purge(&pattern),
            });
        }
        keys.sort();
        keys.dedup();

        debug!(%event, keys = keys.len(), "dispatched");
        if let Some(events) = &self.events {
            if !keys.is_empty() {
                let _ = events.send(SyncEvent::Invalidated {
                    event,
                    keys: keys.clone(),
                });
            }
        }
        keys
    }
}

impl fmt::Debug for InvalidationRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRouter")
            .field("rules", &self.rules.len())
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
    use crate::cache::{CacheState, QueryFetcher};
    use crate::error::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl QueryFetcher for Echo {
        async fn fetch(&self, key: &CacheKey) -> Result<serde_json::Value> {
            Ok(json!(key.as_str()))
        }
    }

    async fn warm_cache(keys: &[&str]) -> QueryCache {
        let cache = QueryCache::new(Arc::new(Echo), Duration::from_secs(10));
        for key in keys {
            cache.fetch(&CacheKey::from(*key)).await.unwrap();
        }
        cache
    }

    const ALL_KEYS: &[&str] = &[
        "profile",
        "ap-status",
        "leaderboard:8A",
        "leaderboard:8B",
        "clan",
        "jobs",
        "raid-targets",
        "inventory",
        "news",
    ];

    #[test]
    fn event_names_round_trip() {
        let mut kinds = vec![
            EventKind::AuthChanged,
            EventKind::AuthRefreshed,
            EventKind::AuthSignedOut,
            EventKind::ManualRefresh,
        ];
        kinds.extend(MutationKind::ALL.map(EventKind::MutationSucceeded));
        for kind in kinds {
            assert_eq!(kind.to_string().parse::<EventKind>().unwrap(), kind);
        }
        assert_eq!(
            EventKind::MutationSucceeded(MutationKind::JobClaim).to_string(),
            "job-claim.success"
        );
        assert!("attack.failure".parse::<EventKind>().is_err());
    }

    #[test]
    fn every_mutation_has_exactly_one_rule() {
        for kind in MutationKind::ALL {
            let event = EventKind::MutationSucceeded(kind);
            let count = INVALIDATION_RULES.iter().filter(|r| r.event == event).count();
            assert_eq!(count, 1, "{event}");
        }
    }

    #[test]
    fn pattern_resolution() {
        let none = DispatchContext::default();
        let batch = DispatchContext::default().with_batch("8A");

        assert_eq!(KeyPattern::resolve("*", &none), KeyPattern::All);
        assert_eq!(
            KeyPattern::resolve("leaderboard:*", &none),
            KeyPattern::Prefix("leaderboard:".into())
        );
        assert_eq!(
            KeyPattern::resolve("leaderboard:{batch}", &batch),
            KeyPattern::Exact(CacheKey::from("leaderboard:8A"))
        );
        assert_eq!(
            KeyPattern::resolve("leaderboard:{batch}", &none),
            KeyPattern::Prefix("leaderboard:".into())
        );
        // Batch values are taken literally.
        let odd = DispatchContext::default().with_batch("{batch}*");
        assert_eq!(
            KeyPattern::resolve("leaderboard:{batch}", &odd),
            KeyPattern::Exact(CacheKey::from("leaderboard:{batch}*"))
        );
        assert!(KeyPattern::Prefix("leaderboard:".into()).matches(&"leaderboard:8C".into()));
        assert!(!KeyPattern::Prefix("leaderboard:".into()).matches(&"profile".into()));
    }

    #[test]
    fn context_from_payload() {
        assert_eq!(
            DispatchContext::from_payload(&json!({ "p_batch": "8B" })).batch,
            Some("8B".to_string())
        );
        assert_eq!(
            DispatchContext::from_payload(&json!({ "batch": "8C", "p_batch": "8B" })).batch,
            Some("8C".to_string())
        );
        assert_eq!(DispatchContext::from_payload(&json!(null)).batch, None);
    }

    #[tokio::test]
    async fn attack_invalidates_exactly_ap_and_leaderboards() {
        let cache = warm_cache(ALL_KEYS).await;
        let router = InvalidationRouter::new(cache.clone());

        let keys = router.dispatch(
            EventKind::MutationSucceeded(MutationKind::Attack),
            &DispatchContext::default(),
        );
        assert_eq!(
            keys,
            vec![
                CacheKey::from("ap-status"),
                CacheKey::from("leaderboard:8A"),
                CacheKey::from("leaderboard:8B"),
            ]
        );

        let touched: HashSet<CacheKey> = keys.into_iter().collect();
        for key in cache.keys() {
            let state = cache.peek(&key).unwrap().state;
            if touched.contains(&key) {
                assert_eq!(state, CacheState::Stale, "{key}");
            } else {
                assert_eq!(state, CacheState::Fresh, "{key}");
            }
        }
    }

    #[tokio::test]
    async fn profile_update_targets_own_batch() {
        let cache = warm_cache(ALL_KEYS).await;
        let router = InvalidationRouter::new(cache);

        let keys = router.dispatch(
            EventKind::MutationSucceeded(MutationKind::ProfileUpdate),
            &DispatchContext::default().with_batch("8B"),
        );
        assert_eq!(
            keys,
            vec![CacheKey::from("leaderboard:8B"), CacheKey::from("profile")]
        );
    }

    #[tokio::test]
    async fn sign_out_purges_everything() {
        let cache = warm_cache(ALL_KEYS).await;
        let (tx, mut rx) = broadcast::channel(8);
        let router = InvalidationRouter::new(cache.clone()).with_events(tx);

        let keys = router.dispatch(EventKind::AuthSignedOut, &DispatchContext::default());
        assert_eq!(keys.len(), ALL_KEYS.len());
        for key in cache.keys() {
            assert_eq!(cache.peek(&key).unwrap().value, None);
        }

        match rx.recv().await.unwrap() {
            SyncEvent::Invalidated { event, keys } => {
                assert_eq!(event, EventKind::AuthSignedOut);
                assert_eq!(keys.len(), ALL_KEYS.len());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_on_empty_cache_affects_nothing() {
        let cache = warm_cache(&[]).await;
        let (tx, mut rx) = broadcast::channel(8);
        let router = InvalidationRouter::new(cache).with_events(tx);

        assert!(router
            .dispatch(EventKind::ManualRefresh, &DispatchContext::default())
            .is_empty());
        assert!(rx.try_recv().is_err());
    }
}
