//! Per-tab relay: hubs, their registry, and the replay buffer.

pub mod hub;
pub mod registry;
pub mod replay;

pub use hub::{ClientEvent, ClientHandle, ClientId, HubState, RelayHub};
pub use registry::HubRegistry;
pub use replay::ReplayBuffer;

use crate::provision::ProvisioningCoordinator;
use crate::upstream::TerminalResource;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tabrelay_core::{RelayError, RelayResult};
use tokio::sync::mpsc;

/// Identifies one tab, and therefore one hub and one terminal resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabKey {
    pub session_id: String,
    pub tab_id: String,
}

impl TabKey {
    /// Build a key, rejecting ids that are unsafe to embed in resource names
    /// and URLs.
    pub fn new(session_id: impl Into<String>, tab_id: impl Into<String>) -> RelayResult<Self> {
        let key = Self {
            session_id: session_id.into(),
            tab_id: tab_id.into(),
        };
        validate_id("session id", &key.session_id)?;
        validate_id("tab id", &key.tab_id)?;
        Ok(key)
    }

    /// Name of the terminal resource backing this tab.
    pub fn resource_id(&self) -> String {
        format!("{}.{}", self.session_id, self.tab_id)
    }
}

impl fmt::Display for TabKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.tab_id)
    }
}

/// Ids are 1-64 chars of ASCII alphanumerics, `-` or `_`.
pub fn validate_id(what: &str, id: &str) -> RelayResult<()> {
    if id.is_empty() {
        return Err(RelayError::InvalidId(format!("{what} must not be empty")));
    }
    if id.len() > 64 {
        return Err(RelayError::InvalidId(format!(
            "{what} too long ({} chars, max 64)",
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RelayError::InvalidId(format!(
            "{what} contains invalid characters"
        )));
    }
    Ok(())
}

/// Tunables shared by every hub.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub replay_capacity: usize,
    /// Events buffered per client before it is dropped as too slow.
    pub client_buffer: usize,
    /// How long a hub keeps its upstream after the last client leaves.
    pub idle_grace: Duration,
    /// Cap on provisioning + connect + wake + retry.
    pub attach_timeout: Duration,
    pub wake_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            replay_capacity: replay::DEFAULT_REPLAY_CAPACITY,
            client_buffer: 256,
            idle_grace: Duration::from_secs(30),
            attach_timeout: Duration::from_secs(90),
            wake_timeout: Duration::from_secs(60),
        }
    }
}

/// What a hub reports to the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Attach,
    Frame,
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub session_id: String,
    pub tab_id: String,
    pub kind: ActivityKind,
}

/// Collaborators shared by every hub.
pub struct HubContext {
    pub resource: Arc<dyn TerminalResource>,
    pub coordinator: ProvisioningCoordinator,
    pub settings: HubSettings,
    pub activity: Option<mpsc::UnboundedSender<ActivityEvent>>,
}

impl HubContext {
    pub fn new(resource: Arc<dyn TerminalResource>, settings: HubSettings) -> Self {
        Self {
            resource,
            coordinator: ProvisioningCoordinator::new(),
            settings,
            activity: None,
        }
    }

    /// Report hub activity on `tx`.
    pub fn with_activity(mut self, tx: mpsc::UnboundedSender<ActivityEvent>) -> Self {
        self.activity = Some(tx);
        self
    }

    pub(crate) fn notify(&self, key: &TabKey, kind: ActivityKind) {
        if let Some(tx) = &self.activity {
            let _ = tx.send(ActivityEvent {
                session_id: key.session_id.clone(),
                tab_id: key.tab_id.clone(),
                kind,
            });
        }
    }
}
