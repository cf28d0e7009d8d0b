use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("wake failed: {0}")]
    Wake(String),

    #[error("start failed: {0}")]
    Start(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("client write failed: {0}")]
    ClientWrite(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("resource still starting: {0}")]
    Starting(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("tab not found: {0}")]
    TabNotFound(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("hub closed")]
    HubClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Client-facing classification of a [`RelayError`].
///
/// Attach and start failures are reported with one of these so a client can
/// tell "ask for a password" apart from "try again later".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NeedsCredential,
    UpstreamUnavailable,
    Starting,
    NotFound,
    BadRequest,
    RateLimited,
    Internal,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Auth(_) => ErrorKind::NeedsCredential,
            RelayError::Connect(_)
            | RelayError::Wake(_)
            | RelayError::Start(_)
            | RelayError::UpstreamUnavailable(_)
            | RelayError::HubClosed
            | RelayError::Timeout => ErrorKind::UpstreamUnavailable,
            RelayError::Starting(_) => ErrorKind::Starting,
            RelayError::SessionNotFound(_) | RelayError::TabNotFound(_) => ErrorKind::NotFound,
            RelayError::InvalidFrame(_) | RelayError::InvalidId(_) | RelayError::Json(_) => {
                ErrorKind::BadRequest
            }
            RelayError::RateLimited(_) => ErrorKind::RateLimited,
            RelayError::ClientWrite(_)
            | RelayError::Config(_)
            | RelayError::Io(_)
            | RelayError::Other(_) => ErrorKind::Internal,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
