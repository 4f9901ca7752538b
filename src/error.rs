//! Error types for the companion bridge

use std::io;

use thiserror::Error;

/// Result type alias for the companion bridge
pub type Result<T> = std::result::Result<T, Error>;

/// Companion bridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing or unparseable persisted state)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication error (no credentials, refresh failed, cloud rejection)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transport error (network failure, premature close, read/write errors)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error (malformed or unexpected frame)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Provider is already running
    #[error("Provider already running: {0}")]
    AlreadyRunning(String),

    /// Provider is not running
    #[error("Provider not running: {0}")]
    NotRunning(String),

    /// Provider launch spec is invalid
    #[error("Invalid provider spec: {0}")]
    BadSpec(String),

    /// Provider process could not be spawned
    #[error("Failed to spawn provider: {0}")]
    Spawn(String),

    /// Provider handshake failed or produced nothing
    #[error("Provider handshake failed: {0}")]
    Handshake(String),

    /// Provider has no live instance
    #[error("provider-unavailable: {0}")]
    ProviderUnavailable(String),

    /// Tool name not present in the catalogue
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Provider answered an invocation with an error
    #[error("{0}")]
    Tool(String),

    /// Bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    /// Bridge shutdown in progress
    #[error("Bridge shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for the CLI surface.
    ///
    /// 0 success, 1 general error, 2 misuse (clap handles its own), 3 bridge
    /// not running, 4 auth failed.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Auth(_) => 4,
            Self::NotRunning(_) => 3,
            _ => 1,
        }
    }

    /// Whether this error ends the reconnect loop (re-login required).
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_to_cli_contract() {
        assert_eq!(Error::Auth("expired".into()).exit_code(), 4);
        assert_eq!(Error::NotRunning("bridge".into()).exit_code(), 3);
        assert_eq!(Error::Transport("refused".into()).exit_code(), 1);
        assert_eq!(Error::Config("missing".into()).exit_code(), 1);
    }

    #[test]
    fn auth_errors_are_terminal() {
        assert!(Error::Auth("rejected".into()).is_auth());
        assert!(!Error::Transport("reset".into()).is_auth());
    }
}
