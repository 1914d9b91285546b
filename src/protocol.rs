//! Payload types and procedure names used against the game backend.
//!
//! The coordinator treats read results as opaque JSON in the cache; the typed
//! payloads below are what the UI decodes them into with
//! [`CacheEntry::decode`](crate::cache::CacheEntry::decode).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for players.
pub type UserId = Uuid;

// ── Procedure names ─────────────────────────────────────────────────

/// Presence ping, called on the heartbeat interval.
pub const PROC_TOUCH_PRESENCE: &str = "touch_presence";

/// Marks the start of a play session, called when the tab becomes visible.
pub const PROC_SESSION_START: &str = "session_start";

// ── Session ─────────────────────────────────────────────────────────

/// The authenticated credential held by the client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token attached to every procedure call.
    pub access_token: String,
    /// Token exchanged for a new session on refresh.
    pub refresh_token: String,
    /// Expiry of `access_token`, in unix seconds.
    pub expires_at: i64,
    /// The signed-in player.
    pub user_id: UserId,
}

impl Session {
    /// Seconds until the access token expires (negative once expired).
    pub fn expires_in(&self) -> i64 {
        self.expires_at - unix_now()
    }

    /// Returns `true` once the access token's validity window has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_in() <= 0
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Current schema version of [`PersistedSession`].
pub const PERSISTED_SESSION_VERSION: u32 = 1;

/// The blob written to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub version: u32,
    pub session: Session,
}

impl PersistedSession {
    pub fn new(session: Session) -> Self {
        Self {
            version: PERSISTED_SESSION_VERSION,
            session,
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

// ── Read payloads ───────────────────────────────────────────────────

/// Class batch a player belongs to; leaderboards are partitioned by it.
pub type Batch = String;

/// Action-point status (`ap_status`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApStatus {
    pub ap_now: u32,
    pub ap_max: u32,
    /// Milliseconds per regenerated point.
    #[serde(default)]
    pub regen_ms: u64,
    /// Milliseconds until the next point.
    #[serde(default)]
    pub next_in_ms: u64,
}

/// The signed-in player's profile (`who_am_i`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub batch: Option<Batch>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub coins: u64,
    #[serde(default)]
    pub xp: u64,
}

/// One row of `leaderboard_rows`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub user_id: UserId,
    pub username: String,
    pub rank: u32,
    pub score: u64,
    #[serde(default)]
    pub batch: Option<Batch>,
}

/// The player's clan (`clan_info`); `null` when not in a clan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClanInfo {
    pub id: Uuid,
    pub name: String,
    pub members: u32,
    #[serde(default)]
    pub score: u64,
}

/// Running job state (`job_state`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub ends_at: Option<String>,
    #[serde(default)]
    pub claimable: bool,
    #[serde(default)]
    pub autoqueue: bool,
}

// ── Mutations ───────────────────────────────────────────────────────

/// State-changing procedures the client can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    Attack,
    JobStart,
    JobClaim,
    Upgrade,
    Purchase,
    ProfileUpdate,
    PveRun,
    QuizAnswer,
    ClanJoin,
}

impl MutationKind {
    /// Every mutation kind, in declaration order.
    pub const ALL: [MutationKind; 9] = [
        Self::Attack,
        Self::JobStart,
        Self::JobClaim,
        Self::Upgrade,
        Self::Purchase,
        Self::ProfileUpdate,
        Self::PveRun,
        Self::QuizAnswer,
        Self::ClanJoin,
    ];

    /// Kebab-case name used in event kinds (`"<name>.success"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attack => "attack",
            Self::JobStart => "job-start",
            Self::JobClaim => "job-claim",
            Self::Upgrade => "upgrade",
            Self::Purchase => "purchase",
            Self::ProfileUpdate => "profile-update",
            Self::PveRun => "pve-run",
            Self::QuizAnswer => "quiz-answer",
            Self::ClanJoin => "clan-join",
        }
    }

    /// Backend procedure performing this mutation.
    pub fn procedure(&self) -> &'static str {
        match self {
            Self::Attack => "raid_attack",
            Self::JobStart => "job_start",
            Self::JobClaim => "job_claim",
            Self::Upgrade => "upgrade",
            Self::Purchase => "shop_buy",
            Self::ProfileUpdate => "profile_update",
            Self::PveRun => "pve_run",
            Self::QuizAnswer => "mcq_submit",
            Self::ClanJoin => "clan_join",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn session(expires_at: i64) -> Session {
        Session {
            access_token: "secret-access".into(),
            refresh_token: "secret-refresh".into(),
            expires_at,
            user_id: Uuid::from_u128(7),
        }
    }

    #[test]
    fn debug_output_hides_tokens() {
        let rendered = format!("{:?}", session(0));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("user_id"));
    }

    #[test]
    fn expiry_is_measured_against_wall_clock() {
        assert!(session(0).is_expired());
        assert!(!session(unix_now() + 3600).is_expired());
    }

    #[test]
    fn ap_status_uses_camel_case() {
        let ap: ApStatus = serde_json::from_value(serde_json::json!({
            "apNow": 8,
            "apMax": 10,
            "regenMs": 600000,
            "nextInMs": 1200
        }))
        .unwrap();
        assert_eq!(ap.ap_now, 8);
        assert_eq!(ap.ap_max, 10);
    }

    #[test]
    fn mutation_kind_serializes_as_event_name() {
        for kind in MutationKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
