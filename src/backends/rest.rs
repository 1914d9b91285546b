//! REST backend implementation using `reqwest`.
//!
//! This module provides [`RestBackend`], a [`Backend`] implementation for the
//! hosted backend-as-a-service the game runs on. It follows the service's REST
//! conventions:
//!
//! | Operation         | Request                                              |
//! |-------------------|------------------------------------------------------|
//! | refresh session   | `POST {base}/auth/v1/token?grant_type=refresh_token` |
//! | call a procedure  | `POST {base}/rest/v1/rpc/{procedure}`                |
//! | sign out          | `POST {base}/auth/v1/logout`                         |
//!
//! Every request carries the public `apikey` header; procedure calls and
//! sign-out additionally carry `Authorization: Bearer <access token>`.
//!
//! # Feature gate
//!
//! This module is only available when the `backend-rest` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), heist_sync::SyncError> {
//! use heist_sync::backend::Backend;
//! use heist_sync::backends::{RestBackend, RestConfig};
//!
//! let backend = RestBackend::new(RestConfig::new("https://game.example.com", "public-anon-key"))?;
//! let session = backend.refresh_session("stored-refresh-token").await?;
//! let ap = backend
//!     .call("ap_status", &session.access_token, serde_json::json!({}))
//!     .await?;
//! println!("ap: {ap}");
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::SyncError;
use crate::error_codes::ErrorCode;
use crate::protocol::{unix_now, Session, UserId};

/// Default bound on a single HTTP request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Connection settings for a [`RestBackend`].
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL of the project, without a trailing slash.
    pub base_url: String,
    /// Public (anonymous) API key sent as the `apikey` header.
    pub api_key: String,
    /// Bound on each HTTP request, enforced by the HTTP client.
    ///
    /// Defaults to **15 seconds**.
    pub request_timeout: Duration,
}

impl RestConfig {
    /// Create a configuration with the default request timeout.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A [`Backend`] implementation that speaks the hosted service's REST API.
#[derive(Debug, Clone)]
pub struct RestBackend {
    http: reqwest::Client,
    config: RestConfig,
}

impl RestBackend {
    /// Build a backend with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] if the HTTP client cannot be built
    /// (e.g. the TLS backend fails to initialize).
    pub fn new(config: RestConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }

    /// Build a backend around an existing HTTP client (shared pools, proxies,
    /// custom TLS).
    pub fn with_client(http: reqwest::Client, config: RestConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn post(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<String, SyncError> {
        let mut request = self
            .http
            .post(self.url(path))
            .header("apikey", &self.config.api_key)
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_reqwest_error)?;

        if (200..300).contains(&status) {
            Ok(text)
        } else {
            let err = error_from_response(status, &text);
            debug!(path, status, error = %err, "backend request failed");
            Err(err)
        }
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, SyncError> {
        let body = serde_json::json!({ "refresh_token": refresh_token });
        let text = self
            .post("/auth/v1/token?grant_type=refresh_token", None, &body)
            .await
            .map_err(|err| match err {
                // The token endpoint reports a dead refresh token as a plain 400.
                SyncError::Backend {
                    code: ErrorCode::InvalidInput,
                    message,
                } => SyncError::backend(ErrorCode::InvalidRefreshToken, message),
                other => other,
            })?;
        let grant: TokenGrant = serde_json::from_str(&text)?;
        Ok(grant.into_session())
    }

    async fn call(
        &self,
        procedure: &str,
        access_token: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SyncError> {
        let path = format!("/rest/v1/rpc/{procedure}");
        let text = self.post(&path, Some(access_token), &params).await?;
        if text.trim().is_empty() {
            // Procedures returning `void` answer 204 with no body.
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), SyncError> {
        match self
            .post(
                "/auth/v1/logout",
                Some(access_token),
                &serde_json::Value::Null,
            )
            .await
        {
            Ok(_) => Ok(()),
            // Already gone server-side; nothing left to end.
            Err(err) if err.is_unauthenticated() => {
                warn!(error = %err, "sign-out rejected, session already ended");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

// ── Response mapping ────────────────────────────────────────────────

/// Body of a successful token grant.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: GrantUser,
}

#[derive(Debug, Deserialize)]
struct GrantUser {
    id: UserId,
}

impl TokenGrant {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|secs| unix_now() + secs))
            .unwrap_or_else(unix_now);
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user_id: self.user.id,
        }
    }
}

/// Error body shapes used by the service: procedure errors carry
/// `code`/`message`, auth errors carry `error`/`error_description`.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Map a non-2xx response to a classified [`SyncError`].
///
/// Game procedures raise errors whose `code` (or message prefix, as in
/// `"INSUFFICIENT_AP: need 1 AP"`) is an [`ErrorCode`] wire name; anything
/// else falls back to the HTTP status.
fn error_from_response(status: u16, text: &str) -> SyncError {
    let body: ErrorBody = serde_json::from_str(text).unwrap_or_default();
    let message = body
        .message
        .or(body.error_description)
        .or(body.error)
        .unwrap_or_else(|| text.trim().to_string());

    let declared = body
        .code
        .as_deref()
        .and_then(parse_code)
        .or_else(|| message.split(':').next().and_then(parse_code));

    let code = declared.unwrap_or(match status {
        401 | 403 => ErrorCode::Unauthorized,
        429 => ErrorCode::RateLimitExceeded,
        400..=499 => ErrorCode::InvalidInput,
        502..=504 => ErrorCode::ServiceUnavailable,
        _ => ErrorCode::InternalError,
    });
    SyncError::backend(code, message)
}

fn parse_code(raw: &str) -> Option<ErrorCode> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        return None;
    }
    match serde_json::from_value::<ErrorCode>(serde_json::Value::String(raw.to_string())) {
        Ok(ErrorCode::Unknown) | Err(_) => None,
        Ok(code) => Some(code),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Transport(err.to_string())
    }
}

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
    use crate::error::ErrorClass;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn rest_backend_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RestBackend>();
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let config = RestConfig::new("https://game.example.com/", "key");
        assert_eq!(config.base_url, "https://game.example.com");
    }

    #[test]
    fn declared_code_wins_over_status() {
        let err = error_from_response(400, r#"{"code":"INSUFFICIENT_AP","message":"need 1 AP"}"#);
        assert_eq!(err, SyncError::backend(ErrorCode::InsufficientAp, "need 1 AP"));
    }

    #[test]
    fn code_prefix_in_message_is_recognized() {
        let err = error_from_response(
            400,
            r#"{"code":"P0001","message":"RAID_CAP_REACHED: 3/3 today"}"#,
        );
        assert_eq!(err.class(), ErrorClass::DomainRejected);
        assert!(matches!(
            err,
            SyncError::Backend {
                code: ErrorCode::RaidCapReached,
                ..
            }
        ));
    }

    #[test]
    fn status_fallbacks_classify_correctly() {
        assert!(error_from_response(401, r#"{"message":"JWT expired"}"#).is_unauthenticated());
        assert_eq!(
            error_from_response(503, "upstream down").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            error_from_response(429, "").class(),
            ErrorClass::Transient
        );
    }

    // ── Mock-server helpers ─────────────────────────────────────────────

    /// Start a one-shot HTTP server that answers the first request with the
    /// given status and body, and returns the base URL plus the raw request.
    async fn start_mock_server(
        status: u16,
        body: &'static str,
    ) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let request = read_request(&mut tcp).await;
            let _ = seen_tx.send(request);
            let response = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            tcp.write_all(response.as_bytes()).await.unwrap();
            tcp.shutdown().await.unwrap();
        });

        (format!("http://{addr}"), seen_rx)
    }

    /// Read one request, headers and body, so the socket is drained before
    /// the response is written.
    async fn read_request(tcp: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let n = tcp.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let body_len = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + body_len {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    #[tokio::test]
    async fn refresh_parses_token_grant() {
        let (url, seen) = start_mock_server(
            200,
            r#"{"access_token":"a2","refresh_token":"r2","expires_at":1900000000,"user":{"id":"00000000-0000-0000-0000-000000000007"}}"#,
        )
        .await;
        let backend = RestBackend::new(RestConfig::new(url, "anon")).unwrap();

        let session = backend.refresh_session("r1").await.unwrap();
        assert_eq!(session.access_token, "a2");
        assert_eq!(session.refresh_token, "r2");
        assert_eq!(session.expires_at, 1_900_000_000);
        assert_eq!(session.user_id, uuid::Uuid::from_u128(7));

        let request = seen.await.unwrap();
        assert!(request.starts_with("POST /auth/v1/token?grant_type=refresh_token"));
        assert!(request.to_ascii_lowercase().contains("apikey: anon"));
    }

    #[tokio::test]
    async fn refresh_rejection_is_unauthenticated() {
        let (url, _seen) = start_mock_server(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid Refresh Token: Already Used"}"#,
        )
        .await;
        let backend = RestBackend::new(RestConfig::new(url, "anon")).unwrap();

        let err = backend.refresh_session("used").await.unwrap_err();
        assert!(err.is_unauthenticated(), "got {err:?}");
    }

    #[tokio::test]
    async fn call_posts_to_rpc_with_bearer() {
        let (url, seen) = start_mock_server(200, r#"{"apNow":8,"apMax":10}"#).await;
        let backend = RestBackend::new(RestConfig::new(url, "anon")).unwrap();

        let value = backend
            .call("ap_status", "tok", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(value["apNow"], 8);

        let request = seen.await.unwrap();
        assert!(request.starts_with("POST /rest/v1/rpc/ap_status"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok"));
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let (url, _seen) = start_mock_server(200, "").await;
        let backend = RestBackend::new(RestConfig::new(url, "anon")).unwrap();

        let value = backend
            .call("touch_presence", "tok", serde_json::json!({}))
            .await
            .unwrap();
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let backend = RestBackend::new(
            RestConfig::new("http://127.0.0.1:1", "anon")
                .with_request_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let err = backend
            .call("ap_status", "tok", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
