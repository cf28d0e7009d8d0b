//! Terminal resource clients: the upstream side of a relay hub.
//!
//! A terminal resource is the compute unit running the interactive process for
//! one tab. The hub only needs three things from it: provision it, open a
//! duplex frame channel to it, and wake it when it has gone dormant.

pub mod pty;
pub mod websocket;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tabrelay_core::{RelayError, RelayResult};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use pty::PtyResource;
pub use websocket::WebSocketResource;

/// Frames buffered in each direction of an upstream channel.
pub const UPSTREAM_CHANNEL_CAPACITY: usize = 256;

/// Access to remote terminal resources.
///
/// Implementations must be cheap to share: the hub registry holds one
/// instance for every tab.
pub trait TerminalResource: Send + Sync {
    /// Provision the resource (create it, install tooling). Called through the
    /// provisioning coordinator, so concurrent callers are already collapsed.
    fn start<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>>;

    /// Open a duplex frame channel to the resource's terminal process.
    fn connect<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<UpstreamConnection>> + Send + 'a>>;

    /// Bring a dormant resource back. Resolves once it is ready to accept a
    /// connection.
    fn wake<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>>;

    /// Let go of the resource once its tab is destroyed.
    fn release<'a>(
        &'a self,
        _resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// The relay's side of one upstream channel.
///
/// Dropping `tx` closes the channel towards the resource; `rx` yields `None`
/// once the resource side has gone away.
#[derive(Debug)]
pub struct UpstreamConnection {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// The resource's side of one upstream channel.
#[derive(Debug)]
pub struct UpstreamEndpoint {
    /// Frames sent by the relay.
    pub from_relay: mpsc::Receiver<Vec<u8>>,
    /// Frames for the relay.
    pub to_relay: mpsc::Sender<Vec<u8>>,
}

impl UpstreamConnection {
    /// Create a connected channel pair.
    pub fn pair(capacity: usize) -> (UpstreamConnection, UpstreamEndpoint) {
        let (relay_tx, from_relay) = mpsc::channel(capacity);
        let (to_relay, relay_rx) = mpsc::channel(capacity);
        (
            UpstreamConnection {
                tx: relay_tx,
                rx: relay_rx,
            },
            UpstreamEndpoint {
                from_relay,
                to_relay,
            },
        )
    }
}

/// Connect to a resource, waking it and retrying once if the first attempt
/// fails.
///
/// The wake is bounded by `wake_timeout`. A failed wake or a failed second
/// connect is terminal for this attempt.
pub async fn connect_with_wake(
    resource: &dyn TerminalResource,
    resource_id: &str,
    wake_timeout: Duration,
) -> RelayResult<UpstreamConnection> {
    let first = match resource.connect(resource_id).await {
        Ok(conn) => return Ok(conn),
        Err(e) => e,
    };

    warn!(resource_id, error = %first, "upstream connect failed, waking resource");

    match tokio::time::timeout(wake_timeout, resource.wake(resource_id)).await {
        Ok(Ok(())) => info!(resource_id, "resource awake, reconnecting"),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(RelayError::Wake(format!(
                "{resource_id} not ready after {}s",
                wake_timeout.as_secs()
            )))
        }
    }

    resource.connect(resource_id).await
}
