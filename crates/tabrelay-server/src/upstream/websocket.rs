//! Remote terminal resources reached over WebSocket.
//!
//! The resource's terminal process listens on a fixed logical port behind a
//! per-resource URL. Provisioning and waking are HTTP calls against the
//! resource's control endpoints.

use super::{TerminalResource, UpstreamConnection, UpstreamEndpoint, UPSTREAM_CHANNEL_CAPACITY};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tabrelay_core::{RelayError, RelayResult};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Interval between readiness probes while waking.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Endpoint templates for remote resources.
///
/// Templates may contain `{resource}` and `{port}` placeholders.
#[derive(Debug, Clone)]
pub struct RemoteEndpoints {
    /// WebSocket URL of the terminal channel.
    pub url: String,
    /// Logical port the terminal process listens on.
    pub port: u16,
    /// POSTed to provision the resource; provisioning is a no-op when unset.
    pub start_url: Option<String>,
    /// POSTed to wake a dormant resource.
    pub wake_url: Option<String>,
    /// Polled with GET after a wake until it answers 2xx.
    pub ready_url: Option<String>,
    pub connect_timeout: Duration,
}

impl RemoteEndpoints {
    fn render(&self, template: &str, resource_id: &str) -> String {
        template
            .replace("{resource}", resource_id)
            .replace("{port}", &self.port.to_string())
    }
}

/// Terminal resources behind a WebSocket endpoint.
pub struct WebSocketResource {
    endpoints: RemoteEndpoints,
    http: reqwest::Client,
}

impl WebSocketResource {
    pub fn new(endpoints: RemoteEndpoints) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(endpoints.connect_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("http client: {e}")))?;
        Ok(Self { endpoints, http })
    }

    async fn post(&self, url: &str) -> Result<(), String> {
        let resp = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("{url} answered {}", resp.status()))
        }
    }

    async fn wait_ready(&self, url: &str) {
        loop {
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => debug!(status = %resp.status(), "resource not ready yet"),
                Err(e) => debug!(error = %e, "readiness probe failed"),
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

impl TerminalResource for WebSocketResource {
    fn start<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(template) = &self.endpoints.start_url else {
                return Ok(());
            };
            let url = self.endpoints.render(template, resource_id);
            self.post(&url).await.map_err(RelayError::Start)?;
            info!(resource_id, "remote resource provisioned");
            Ok(())
        })
    }

    fn connect<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<UpstreamConnection>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.endpoints.render(&self.endpoints.url, resource_id);
            let (ws, _) = tokio::time::timeout(
                self.endpoints.connect_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            )
            .await
            .map_err(|_| RelayError::Connect(format!("{url}: connect timed out")))?
            .map_err(|e| RelayError::Connect(format!("{url}: {e}")))?;

            debug!(resource_id, url = %url, "upstream WebSocket connected");

            let (conn, endpoint) = UpstreamConnection::pair(UPSTREAM_CHANNEL_CAPACITY);
            let UpstreamEndpoint {
                mut from_relay,
                to_relay,
            } = endpoint;
            let (mut sink, mut stream) = ws.split();

            // relay -> resource; ends when the hub drops its sender.
            tokio::spawn(async move {
                while let Some(frame) = from_relay.recv().await {
                    if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                        warn!(error = %e, "upstream WebSocket send failed");
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            // resource -> relay
            let id = resource_id.to_string();
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let frame = match msg {
                        Ok(Message::Binary(data)) => data.to_vec(),
                        Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(resource_id = %id, error = %e, "upstream WebSocket ended");
                            break;
                        }
                    };
                    if to_relay.send(frame).await.is_err() {
                        break;
                    }
                }
            });

            Ok(conn)
        })
    }

    fn wake<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(template) = &self.endpoints.wake_url else {
                return Err(RelayError::Wake(format!(
                    "{resource_id}: no wake endpoint configured"
                )));
            };
            let url = self.endpoints.render(template, resource_id);
            self.post(&url).await.map_err(RelayError::Wake)?;

            if let Some(template) = &self.endpoints.ready_url {
                self.wait_ready(&self.endpoints.render(template, resource_id))
                    .await;
            }
            info!(resource_id, "remote resource awake");
            Ok(())
        })
    }
}
