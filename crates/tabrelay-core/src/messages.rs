//! JSON messages exchanged outside the terminal frame stream.
//!
//! Control notifications travel to clients as WebSocket text messages; the
//! descriptors are the bodies of the session HTTP endpoints.

use crate::error::{ErrorKind, RelayError};
use serde::{Deserialize, Serialize};

/// Why a client connection was closed by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// The upstream could not be reached after wake + retry.
    UpstreamUnavailable { message: String },
    /// The remote terminal process closed its channel.
    UpstreamExited,
    /// The client fell too far behind or its channel went away.
    SlowClient,
    /// The tab or its session was deleted, or the server is stopping.
    TornDown,
    /// The hub closed after its last client left.
    Idle,
}

/// Server-to-client control notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    Error { error: ErrorKind, message: String },
    Closed { detail: CloseReason },
}

impl Control {
    pub fn from_error(err: &RelayError) -> Self {
        Control::Error {
            error: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Structured HTTP error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
}

impl From<&RelayError> for ErrorBody {
    fn from(err: &RelayError) -> Self {
        Self {
            error: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A tab as listed in session info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabDescriptor {
    pub id: String,
    pub name: String,
}

/// Public view of a session. Never carries the password or its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub tabs: Vec<TabDescriptor>,
    pub has_password: bool,
    /// Seconds since the last recorded activity.
    pub idle_secs: u64,
    /// Seconds left before the session expires for inactivity.
    pub idle_expires_in: u64,
    pub capabilities: Vec<String>,
}

/// Body of `POST /sessions/{id}/tabs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTabRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of `POST /sessions/{id}/password`. `None` clears the password.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetPasswordRequest {
    #[serde(default)]
    pub password: Option<String>,
}

/// Body returned by a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: String,
    pub tab_id: String,
    pub state: String,
}
