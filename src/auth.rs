//! Token lifecycle management
//!
//! Holds the credential triple, serves consistent snapshots, and refreshes
//! the access token against the cloud HTTP endpoint. At most one refresh is
//! in flight; concurrent callers coalesce onto its result.

use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::config::CredentialsConfig;
use crate::{Error, Result};

/// Hard deadline for one refresh attempt.
const REFRESH_DEADLINE: Duration = Duration::from_secs(30);

/// Immutable view of the credential state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSnapshot {
    /// Opaque access token
    pub access_token: String,
    /// Opaque refresh token
    pub refresh_token: String,
    /// Absolute expiry, unix seconds; 0 means unknown
    pub expires_at: i64,
    /// Device identity, when this installation is registered as a device
    pub device_id: Option<String>,
}

impl From<CredentialsConfig> for TokenSnapshot {
    fn from(auth: CredentialsConfig) -> Self {
        Self {
            access_token: auth.access_token,
            refresh_token: auth.refresh_token,
            expires_at: auth.expires_at,
            device_id: auth.device_id,
        }
    }
}

impl From<&TokenSnapshot> for CredentialsConfig {
    fn from(snapshot: &TokenSnapshot) -> Self {
        Self {
            access_token: snapshot.access_token.clone(),
            refresh_token: snapshot.refresh_token.clone(),
            expires_at: snapshot.expires_at,
            device_id: snapshot.device_id.clone(),
        }
    }
}

/// Refresh failure classification. Only `Expired` is terminal.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The refresh credential was rejected; re-login is required
    #[error("refresh rejected: {0}")]
    Expired(String),
    /// The endpoint was unreachable or answered with a server fault
    #[error("refresh transport failure: {0}")]
    Transport(String),
    /// A positive response without a usable token
    #[error("refresh response malformed: {0}")]
    Malformed(String),
}

impl RefreshError {
    /// Terminal failures disable the reconnect loop.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired(_))
    }
}

impl From<RefreshError> for Error {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::Expired(msg) => Self::Auth(msg),
            RefreshError::Transport(msg) | RefreshError::Malformed(msg) => Self::Transport(msg),
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: i64,
}

/// Callback invoked synchronously after each successful rotation.
pub type PersistFn = Box<dyn Fn(&TokenSnapshot) + Send + Sync>;

/// Token manager (C1)
pub struct TokenManager {
    http: reqwest::Client,
    api_base: String,
    state: RwLock<TokenSnapshot>,
    refresh_gate: Mutex<()>,
    rotations: watch::Sender<u64>,
    persist: PersistFn,
}

impl TokenManager {
    /// Create a manager from persisted credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_base: &str, initial: TokenSnapshot, persist: PersistFn) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REFRESH_DEADLINE)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {e}")))?;
        let (rotations, _) = watch::channel(0);
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            state: RwLock::new(initial),
            refresh_gate: Mutex::new(()),
            rotations,
            persist,
        })
    }

    /// Current snapshot. Never blocks on a refresh in flight; callers see the
    /// pre-rotation triple until the new one is installed atomically.
    #[must_use]
    pub fn current(&self) -> TokenSnapshot {
        self.state.read().clone()
    }

    /// True when expiry falls within `window` from now, or is unknown.
    #[must_use]
    pub fn expiring_within(&self, window: Duration) -> bool {
        let expires_at = self.state.read().expires_at;
        if expires_at == 0 {
            return true;
        }
        #[allow(clippy::cast_possible_wrap)]
        let horizon = Utc::now().timestamp() + window.as_secs() as i64;
        expires_at <= horizon
    }

    /// Observe rotations; the value is a monotonic rotation counter.
    #[must_use]
    pub fn on_rotation(&self) -> watch::Receiver<u64> {
        self.rotations.subscribe()
    }

    /// Refresh the access token.
    ///
    /// Single-flight: a caller that arrives while another refresh is running
    /// waits for it and, if the triple rotated meanwhile, returns the rotated
    /// snapshot without issuing a second request.
    ///
    /// # Errors
    ///
    /// `RefreshError::Expired` means the refresh credential is dead and the
    /// user must log in again; the other kinds are retryable.
    pub async fn refresh(&self) -> std::result::Result<TokenSnapshot, RefreshError> {
        let before = self.current();
        let _gate = self.refresh_gate.lock().await;

        let latest = self.current();
        if latest.access_token != before.access_token {
            debug!("refresh coalesced onto a concurrent rotation");
            return Ok(latest);
        }
        if latest.refresh_token.is_empty() {
            return Err(RefreshError::Expired("no refresh token".into()));
        }

        let rotated = tokio::time::timeout(REFRESH_DEADLINE, self.request_refresh(&latest))
            .await
            .map_err(|_| RefreshError::Transport("refresh deadline elapsed".into()))??;

        {
            let mut state = self.state.write();
            *state = rotated.clone();
        }
        (self.persist)(&rotated);
        self.rotations.send_modify(|n| *n += 1);
        info!(expires_at = rotated.expires_at, "access token rotated");
        Ok(rotated)
    }

    async fn request_refresh(
        &self,
        current: &TokenSnapshot,
    ) -> std::result::Result<TokenSnapshot, RefreshError> {
        // Device-registered installations use the device variant, which also
        // rotates the refresh token.
        let path = if current.device_id.is_some() {
            "/api/auth/device/refresh"
        } else {
            "/api/auth/refresh"
        };
        let url = format!("{}{path}", self.api_base);

        let request = RefreshRequest {
            refresh_token: &current.refresh_token,
            device_id: current.device_id.as_deref(),
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(status = %status, "token refresh rejected");
            return Err(classify_rejection(status.as_u16(), &body));
        }

        let parsed: RefreshResponse = serde_json::from_str(&body)
            .map_err(|e| RefreshError::Malformed(format!("bad refresh body: {e}")))?;
        if parsed.access_token.is_empty() {
            return Err(RefreshError::Malformed("empty access token".into()));
        }

        Ok(TokenSnapshot {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expires_at: Utc::now().timestamp() + parsed.expires_in.max(0),
            device_id: current.device_id.clone(),
        })
    }
}

/// Classify a non-2xx refresh response.
fn classify_rejection(status: u16, body: &str) -> RefreshError {
    let lowered = body.to_lowercase();
    let auth_shaped = status == 401
        || status == 403
        || lowered.contains("unauthorized")
        || lowered.contains("401")
        || lowered.contains("403")
        || lowered.contains("token");
    if auth_shaped {
        RefreshError::Expired(format!("HTTP {status}: {body}"))
    } else {
        RefreshError::Transport(format!("HTTP {status}: {body}"))
    }
}
