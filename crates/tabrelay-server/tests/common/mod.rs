//! In-memory terminal resource shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabrelay_core::frame::{self, FrameTag};
use tabrelay_core::{RelayError, RelayResult};
use tabrelay_server::relay::{
    ClientEvent, HubContext, HubRegistry, HubSettings, HubState, RelayHub,
};
use tabrelay_server::upstream::{TerminalResource, UpstreamConnection, UpstreamEndpoint};
use tokio::sync::{mpsc, Semaphore};

/// Frames each fake upstream channel buffers per direction.
pub const UPSTREAM_TEST_CAPACITY: usize = 64;

/// Counts calls and hands every opened channel's far end to the test.
pub struct FakeResource {
    pub starts: AtomicUsize,
    pub connects: AtomicUsize,
    pub wakes: AtomicUsize,
    pub releases: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_connect: AtomicBool,
    /// Each connect takes one permit.
    gate: Semaphore,
    endpoints: mpsc::UnboundedSender<UpstreamEndpoint>,
}

impl FakeResource {
    /// `gated` resources block every connect until [`FakeResource::open_gate`].
    pub fn new(gated: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamEndpoint>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = if gated { 0 } else { 1 << 20 };
        let resource = Arc::new(Self {
            starts: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            wakes: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            gate: Semaphore::new(permits),
            endpoints: tx,
        });
        (resource, rx)
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(1);
    }
}

impl TerminalResource for FakeResource {
    fn start<'a>(
        &'a self,
        _resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_start.load(Ordering::SeqCst) {
                Err(RelayError::Start("image build failed".into()))
            } else {
                Ok(())
            }
        })
    }

    fn connect<'a>(
        &'a self,
        _resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<UpstreamConnection>> + Send + 'a>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| RelayError::Connect("gate closed".into()))?;
            permit.forget();
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(RelayError::Connect("connection refused".into()));
            }
            let (conn, endpoint) = UpstreamConnection::pair(UPSTREAM_TEST_CAPACITY);
            let _ = self.endpoints.send(endpoint);
            Ok(conn)
        })
    }

    fn wake<'a>(
        &'a self,
        _resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            // A failing resource stays failing; let the retry see it.
            self.gate.add_permits(1);
            Ok(())
        })
    }

    fn release<'a>(
        &'a self,
        _resource_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

pub fn settings() -> HubSettings {
    HubSettings {
        idle_grace: Duration::from_millis(200),
        attach_timeout: Duration::from_secs(5),
        wake_timeout: Duration::from_secs(2),
        ..HubSettings::default()
    }
}

pub fn registry(resource: Arc<FakeResource>, settings: HubSettings) -> Arc<HubRegistry> {
    HubRegistry::new(HubContext::new(resource, settings))
}

pub fn data(payload: &str) -> Vec<u8> {
    frame::encode_data(payload.as_bytes())
}

/// Next event, failing the test after two seconds.
pub async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client channel closed")
}

/// Next frame sent upstream by the hub.
pub async fn next_upstream(endpoint: &mut UpstreamEndpoint) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(2), endpoint.from_relay.recv())
        .await
        .expect("timed out waiting for upstream frame")
        .expect("upstream channel closed")
}

pub async fn next_endpoint(rx: &mut mpsc::UnboundedReceiver<UpstreamEndpoint>) -> UpstreamEndpoint {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for upstream connect")
        .expect("resource dropped")
}

pub async fn wait_state(hub: &RelayHub, pred: impl FnMut(&HubState) -> bool) -> HubState {
    let mut rx = hub.subscribe_state();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for hub state")
        .expect("hub state channel closed")
        .clone();
    state
}

pub fn is_data(frame: &[u8], payload: &str) -> bool {
    frame::parse(frame)
        .map(|f| f.tag == FrameTag::Data && f.payload == payload.as_bytes())
        .unwrap_or(false)
}
