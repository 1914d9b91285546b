//! The cached resources and the read procedures that fill them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::backend::Backend;
use crate::cache::{CacheKey, QueryFetcher};
use crate::credentials::CredentialStore;
use crate::error::{Result, SyncError};
use crate::error_codes::ErrorCode;

/// A cacheable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    /// Cache key, or key prefix when parameterized.
    pub name: &'static str,
    /// Read procedure.
    pub procedure: &'static str,
    /// Parameter the key's argument is passed as, for parameterized resources.
    pub arg_param: Option<&'static str>,
}

impl Resource {
    /// Cache key for this resource. `arg` is ignored for unparameterized
    /// resources.
    pub fn key(&self, arg: Option<&str>) -> CacheKey {
        match (self.arg_param, arg) {
            (Some(_), Some(arg)) => CacheKey::with_arg(self.name, arg),
            _ => CacheKey::new(self.name),
        }
    }
}

pub const PROFILE: Resource = Resource {
    name: "profile",
    procedure: "who_am_i",
    arg_param: None,
};
pub const AP_STATUS: Resource = Resource {
    name: "ap-status",
    procedure: "ap_status",
    arg_param: None,
};
pub const LEADERBOARD: Resource = Resource {
    name: "leaderboard",
    procedure: "leaderboard_rows",
    arg_param: Some("p_batch"),
};
pub const CLAN: Resource = Resource {
    name: "clan",
    procedure: "clan_info",
    arg_param: None,
};
pub const JOBS: Resource = Resource {
    name: "jobs",
    procedure: "job_state",
    arg_param: None,
};
pub const RAID_TARGETS: Resource = Resource {
    name: "raid-targets",
    procedure: "raid_targets",
    arg_param: None,
};
pub const INVENTORY: Resource = Resource {
    name: "inventory",
    procedure: "inventory",
    arg_param: None,
};
pub const NEWS: Resource = Resource {
    name: "news",
    procedure: "news_feed",
    arg_param: None,
};

/// Every cacheable resource.
pub static RESOURCES: [Resource; 8] = [
    PROFILE,
    AP_STATUS,
    LEADERBOARD,
    CLAN,
    JOBS,
    RAID_TARGETS,
    INVENTORY,
    NEWS,
];

/// Look up the resource a key belongs to.
pub fn resource_for(key: &CacheKey) -> Option<&'static Resource> {
    RESOURCES.iter().find(|r| r.name == key.resource())
}

/// Fills cache keys by calling their read procedure with the current
/// session's access token.
pub struct RpcFetcher {
    store: Arc<CredentialStore>,
    backend: Arc<dyn Backend>,
}

impl RpcFetcher {
    pub fn new(store: Arc<CredentialStore>, backend: Arc<dyn Backend>) -> Self {
        Self { store, backend }
    }

    fn params(resource: &Resource, key: &CacheKey) -> Value {
        match (resource.arg_param, key.arg()) {
            (Some(param), Some(arg)) => {
                let mut params = Map::new();
                params.insert(param.to_string(), Value::String(arg.to_string()));
                Value::Object(params)
            }
            _ => json!({}),
        }
    }
}

#[async_trait]
impl QueryFetcher for RpcFetcher {
    async fn fetch(&self, key: &CacheKey) -> Result<Value> {
        let resource = resource_for(key).ok_or_else(|| {
            SyncError::backend(ErrorCode::InvalidInput, format!("unknown resource: {key}"))
        })?;
        let token = self.store.access_token()?;
        self.backend
            .call(resource.procedure, &token, Self::params(resource, key))
            .await
    }
}

impl std::fmt::Debug for RpcFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFetcher").finish_non_exhaustive()
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
    use crate::protocol::Session;
    use crate::storage::{MemoryStorage, DEFAULT_NAMESPACE};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Backend for Recorder {
        async fn refresh_session(&self, _refresh_token: &str) -> Result<Session> {
            Err(SyncError::Transport("unused".into()))
        }

        async fn call(&self, procedure: &str, _token: &str, params: Value) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((procedure.to_string(), params));
            Ok(json!([]))
        }
    }

    async fn fetcher() -> (RpcFetcher, Arc<Recorder>) {
        let store = Arc::new(CredentialStore::new(
            Arc::new(MemoryStorage::new()),
            DEFAULT_NAMESPACE,
        ));
        store
            .sign_in(Session {
                access_token: "tok".into(),
                refresh_token: "ref".into(),
                expires_at: 4_000_000_000,
                user_id: uuid::Uuid::from_u128(5),
            })
            .await
            .unwrap();
        let backend = Arc::new(Recorder::default());
        (RpcFetcher::new(store, backend.clone()), backend)
    }

    #[test]
    fn keys_for_resources() {
        assert_eq!(LEADERBOARD.key(Some("8A")).as_str(), "leaderboard:8A");
        assert_eq!(PROFILE.key(Some("ignored")).as_str(), "profile");
        assert_eq!(
            resource_for(&CacheKey::from("leaderboard:8C")),
            Some(&LEADERBOARD)
        );
        assert_eq!(resource_for(&CacheKey::from("weather")), None);
    }

    #[tokio::test]
    async fn leaderboard_passes_batch() {
        let (fetcher, backend) = fetcher().await;
        fetcher.fetch(&CacheKey::from("leaderboard:8B")).await.unwrap();
        fetcher.fetch(&CacheKey::from("ap-status")).await.unwrap();

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls[0], ("leaderboard_rows".to_string(), json!({ "p_batch": "8B" })));
        assert_eq!(calls[1], ("ap_status".to_string(), json!({})));
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected_without_call() {
        let (fetcher, backend) = fetcher().await;
        let err = fetcher.fetch(&CacheKey::from("weather")).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Backend {
                code: ErrorCode::InvalidInput,
                ..
            }
        ));
        assert!(backend.calls.lock().unwrap().is_empty());
    }
}
