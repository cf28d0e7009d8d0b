//! Relay hub: one upstream terminal channel fanned out to many clients.
//!
//! Every mutation of a hub happens under its own mutex, so a hub behaves as a
//! single-threaded unit while different hubs run fully in parallel. The same
//! lock serializes "send replay to a new client" against "broadcast live
//! output", which is what keeps each client's stream gap-free and in order.
//!
//! Client input is written upstream outside that lock. A second lock orders
//! upstream writes (queued frames first, then live ones); it is always taken
//! before the state lock, never while holding it, so an upstream that stops
//! reading only stalls its writers.

use super::registry::HubRegistry;
use super::replay::ReplayBuffer;
use super::{ActivityKind, HubContext, TabKey};
use crate::upstream::{connect_with_wake, UpstreamConnection};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tabrelay_core::frame::{self, FrameTag};
use tabrelay_core::{CloseReason, RelayError, RelayResult};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hub-local client identifier.
pub type ClientId = u64;

/// Upstream connection state of a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubState {
    NoUpstream,
    Connecting,
    Connected,
    Closed(CloseReason),
}

impl HubState {
    pub fn is_closed(&self) -> bool {
        matches!(self, HubState::Closed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            HubState::NoUpstream => "no_upstream",
            HubState::Connecting => "connecting",
            HubState::Connected => "connected",
            HubState::Closed(_) => "closed",
        }
    }
}

/// Delivered to one attached client, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Retained output as data frames, oldest first. Always the first event.
    Replay(Vec<Vec<u8>>),
    /// One live upstream frame.
    Frame(Vec<u8>),
    /// The hub closed; no further events follow.
    Closed(CloseReason),
}

/// Returned by [`RelayHub::attach`]. The channel ending without a
/// [`ClientEvent::Closed`] means the client was dropped for falling behind.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub events: mpsc::Receiver<ClientEvent>,
}

struct HubInner {
    state: HubState,
    clients: HashMap<ClientId, mpsc::Sender<ClientEvent>>,
    replay: ReplayBuffer,
    /// Client frames that arrived before the upstream was connected.
    outbound: VecDeque<Vec<u8>>,
    upstream: Option<mpsc::Sender<Vec<u8>>>,
    /// Connect and upstream pump tasks.
    tasks: Vec<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

/// Bridges the clients of one tab to its single upstream connection.
pub struct RelayHub {
    key: TabKey,
    ctx: Arc<HubContext>,
    inner: Mutex<HubInner>,
    /// Held for the duration of every write to the upstream.
    upstream_order: Mutex<()>,
    state_tx: watch::Sender<HubState>,
    next_client_id: AtomicU64,
    registry: Weak<HubRegistry>,
    me: Weak<RelayHub>,
}

impl RelayHub {
    pub fn new(key: TabKey, ctx: Arc<HubContext>, registry: Weak<HubRegistry>) -> Arc<Self> {
        let replay = ReplayBuffer::new(ctx.settings.replay_capacity);
        let (state_tx, _) = watch::channel(HubState::NoUpstream);
        Arc::new_cyclic(|me| RelayHub {
            key,
            ctx,
            inner: Mutex::new(HubInner {
                state: HubState::NoUpstream,
                clients: HashMap::new(),
                replay,
                outbound: VecDeque::new(),
                upstream: None,
                tasks: Vec::new(),
                idle_timer: None,
            }),
            upstream_order: Mutex::new(()),
            state_tx,
            next_client_id: AtomicU64::new(1),
            registry,
            me: me.clone(),
        })
    }

    pub fn key(&self) -> &TabKey {
        &self.key
    }

    pub fn state(&self) -> HubState {
        self.state_tx.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<HubState> {
        self.state_tx.subscribe()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Copy of the replay buffer, oldest chunk first.
    pub async fn replay_snapshot(&self) -> Vec<Vec<u8>> {
        self.inner.lock().await.replay.snapshot()
    }

    /// Register a client.
    ///
    /// The client's first event is the replay snapshot; live frames follow.
    /// The first attach to a fresh hub starts connecting the upstream.
    pub async fn attach(&self) -> RelayResult<ClientHandle> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_closed() {
            return Err(RelayError::HubClosed);
        }
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
            debug!(tab = %self.key, "idle timer cancelled");
        }

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.ctx.settings.client_buffer.max(1));
        let replayed = inner.replay.len();
        let replay: Vec<Vec<u8>> = inner
            .replay
            .snapshot()
            .iter()
            .map(|chunk| frame::encode_data(chunk))
            .collect();
        // A fresh channel always has room for its first event.
        let _ = tx.try_send(ClientEvent::Replay(replay));
        inner.clients.insert(id, tx);

        if inner.state == HubState::NoUpstream {
            self.begin_connect(&mut inner);
        }

        info!(
            tab = %self.key,
            client_id = id,
            clients = inner.clients.len(),
            replayed,
            state = inner.state.name(),
            "client attached"
        );
        drop(inner);

        self.ctx.notify(&self.key, ActivityKind::Attach);
        Ok(ClientHandle { id, events: rx })
    }

    /// Ensure the upstream is provisioned and connected.
    ///
    /// Resolves once the hub is `Connected`, or with the failure that closed
    /// it.
    pub async fn start(&self) -> RelayResult<()> {
        let mut state_rx = {
            let mut inner = self.inner.lock().await;
            if inner.state == HubState::NoUpstream {
                self.begin_connect(&mut inner);
            }
            self.state_tx.subscribe()
        };

        let state = state_rx
            .wait_for(|s| matches!(s, HubState::Connected | HubState::Closed(_)))
            .await
            .map_err(|_| RelayError::HubClosed)?
            .clone();

        match state {
            HubState::Connected => Ok(()),
            HubState::Closed(CloseReason::UpstreamUnavailable { message }) => {
                Err(RelayError::UpstreamUnavailable(message))
            }
            _ => Err(RelayError::HubClosed),
        }
    }

    /// Forward a client frame upstream, or queue it until the upstream is
    /// connected.
    pub async fn send(&self, client_id: ClientId, frame: Vec<u8>) -> RelayResult<()> {
        let parsed = frame::parse(&frame)?;
        if let FrameTag::Other(tag) = parsed.tag {
            return Err(RelayError::InvalidFrame(format!(
                "unsupported client frame tag {:?}",
                tag as char
            )));
        }

        let _order = self.upstream_order.lock().await;
        let upstream = {
            let mut inner = self.inner.lock().await;
            if !inner.clients.contains_key(&client_id) {
                return Err(RelayError::ClientWrite(format!(
                    "client {client_id} is not attached to {}",
                    self.key
                )));
            }

            match inner.state.clone() {
                HubState::NoUpstream | HubState::Connecting => {
                    inner.outbound.push_back(frame);
                    debug!(tab = %self.key, queued = inner.outbound.len(), "client frame queued");
                    drop(inner);
                    self.ctx.notify(&self.key, ActivityKind::Frame);
                    return Ok(());
                }
                HubState::Connected => inner.upstream.clone().ok_or_else(|| {
                    RelayError::UpstreamUnavailable(format!("{} has no upstream", self.key))
                })?,
                HubState::Closed(_) => return Err(RelayError::HubClosed),
            }
        };

        // A full upstream blocks only this writer; closing the hub releases it.
        let mut state_rx = self.state_tx.subscribe();
        tokio::select! {
            sent = upstream.send(frame) => sent.map_err(|_| {
                RelayError::UpstreamUnavailable(format!("{} upstream closed", self.key))
            })?,
            _ = state_rx.wait_for(HubState::is_closed) => return Err(RelayError::HubClosed),
        }

        self.ctx.notify(&self.key, ActivityKind::Frame);
        Ok(())
    }

    /// Remove a client. The last one leaving arms the idle timer.
    pub async fn detach(&self, client_id: ClientId) {
        let mut inner = self.inner.lock().await;
        if inner.clients.remove(&client_id).is_none() {
            return;
        }
        info!(
            tab = %self.key,
            client_id,
            clients = inner.clients.len(),
            "client detached"
        );
        if inner.clients.is_empty() && !inner.state.is_closed() {
            self.arm_idle_timer(&mut inner);
        }
        drop(inner);

        self.ctx.notify(&self.key, ActivityKind::Detach);
    }

    /// Close the hub: notify and drop every client, close the upstream.
    pub async fn close(&self, reason: CloseReason) {
        let mut inner = self.inner.lock().await;
        self.close_locked(&mut inner, reason);
    }

    fn publish(&self, state: &HubState) {
        self.state_tx.send_replace(state.clone());
    }

    fn begin_connect(&self, inner: &mut HubInner) {
        let Some(hub) = self.me.upgrade() else {
            return;
        };
        inner.state = HubState::Connecting;
        self.publish(&inner.state);
        debug!(tab = %self.key, "connecting upstream");
        inner.tasks.push(tokio::spawn(hub.run_connect()));
    }

    async fn run_connect(self: Arc<Self>) {
        let attach_timeout = self.ctx.settings.attach_timeout;
        let result = match tokio::time::timeout(attach_timeout, self.open_upstream()).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout),
        };
        match result {
            Ok(conn) => self.on_connected(conn).await,
            Err(e) => self.on_connect_failed(e).await,
        }
    }

    /// Provision (deduplicated), then connect with the wake-and-retry policy.
    async fn open_upstream(&self) -> RelayResult<UpstreamConnection> {
        let resource_id = self.key.resource_id();
        let resource = self.ctx.resource.clone();
        let id = resource_id.clone();
        self.ctx
            .coordinator
            .ensure_started(&resource_id, move || async move { resource.start(&id).await })
            .await?;

        connect_with_wake(
            self.ctx.resource.as_ref(),
            &resource_id,
            self.ctx.settings.wake_timeout,
        )
        .await
    }

    /// Publish `Connected`, then flush the frames queued while connecting.
    /// Live sends wait on the upstream order lock until the flush is done.
    async fn on_connected(self: Arc<Self>, conn: UpstreamConnection) {
        let UpstreamConnection { tx, rx } = conn;
        let _order = self.upstream_order.lock().await;
        let queued: Vec<Vec<u8>> = {
            let mut inner = self.inner.lock().await;
            if inner.state != HubState::Connecting {
                debug!(tab = %self.key, "upstream connected after hub closed, dropping it");
                return;
            }

            let queued: Vec<Vec<u8>> = inner.outbound.drain(..).collect();
            inner.upstream = Some(tx.clone());
            inner.state = HubState::Connected;
            self.publish(&inner.state);
            inner.tasks.push(tokio::spawn(self.clone().pump_upstream(rx)));
            info!(
                tab = %self.key,
                queued = queued.len(),
                clients = inner.clients.len(),
                "upstream connected"
            );

            if inner.clients.is_empty() {
                self.arm_idle_timer(&mut inner);
            }
            queued
        };

        let flushed = queued.len();
        for frame in queued {
            if tx.send(frame).await.is_err() {
                warn!(tab = %self.key, "upstream closed while flushing queued frames");
                let mut inner = self.inner.lock().await;
                if inner.state == HubState::Connected {
                    self.close_locked(&mut inner, CloseReason::UpstreamExited);
                }
                return;
            }
        }
        if flushed > 0 {
            debug!(tab = %self.key, flushed, "queued client frames flushed");
        }
    }

    async fn on_connect_failed(&self, err: RelayError) {
        let mut inner = self.inner.lock().await;
        if inner.state != HubState::Connecting {
            return;
        }
        warn!(
            tab = %self.key,
            error = %err,
            clients = inner.clients.len(),
            "upstream unavailable"
        );
        self.close_locked(
            &mut inner,
            CloseReason::UpstreamUnavailable {
                message: err.to_string(),
            },
        );
    }

    async fn pump_upstream(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(raw) = rx.recv().await {
            self.on_upstream_frame(raw).await;
        }

        let mut inner = self.inner.lock().await;
        if inner.state == HubState::Connected {
            info!(tab = %self.key, "upstream closed by remote");
            self.close_locked(&mut inner, CloseReason::UpstreamExited);
        }
    }

    async fn on_upstream_frame(&self, raw: Vec<u8>) {
        let tag = match frame::parse(&raw) {
            Ok(parsed) => parsed.tag,
            Err(_) => return,
        };
        if tag == FrameTag::Resize {
            debug!(tab = %self.key, "dropping resize frame from upstream");
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.state != HubState::Connected {
            return;
        }
        self.broadcast(&mut inner, &raw);
        if tag == FrameTag::Data {
            inner.replay.append(raw[1..].to_vec());
        }
    }

    /// Best-effort delivery to every client. A client whose buffer is full or
    /// whose channel is gone is removed; the others are unaffected.
    fn broadcast(&self, inner: &mut HubInner, frame: &[u8]) {
        let mut dropped = Vec::new();
        for (&id, tx) in &inner.clients {
            match tx.try_send(ClientEvent::Frame(frame.to_vec())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(tab = %self.key, client_id = id, "client fell behind, dropping it");
                    dropped.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(tab = %self.key, client_id = id, "client channel closed");
                    dropped.push(id);
                }
            }
        }

        if dropped.is_empty() {
            return;
        }
        for id in &dropped {
            inner.clients.remove(id);
            self.ctx.notify(&self.key, ActivityKind::Detach);
        }
        if inner.clients.is_empty() {
            self.arm_idle_timer(inner);
        }
    }

    fn arm_idle_timer(&self, inner: &mut HubInner) {
        if inner.idle_timer.is_some() {
            return;
        }
        let Some(hub) = self.me.upgrade() else {
            return;
        };
        let grace = self.ctx.settings.idle_grace;
        debug!(tab = %self.key, grace_secs = grace.as_secs(), "idle timer armed");
        inner.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.close_if_idle().await;
        }));
    }

    async fn close_if_idle(&self) {
        let mut inner = self.inner.lock().await;
        // Called from the timer task itself: detach its handle instead of aborting it.
        inner.idle_timer = None;
        if !inner.clients.is_empty() || inner.state.is_closed() {
            return;
        }
        info!(tab = %self.key, "idle grace period elapsed");
        self.close_locked(&mut inner, CloseReason::Idle);
    }

    /// Transition to `Closed`. Must not await: it may run on one of the tasks
    /// it aborts.
    fn close_locked(&self, inner: &mut HubInner, reason: CloseReason) {
        if inner.state.is_closed() {
            return;
        }
        info!(
            tab = %self.key,
            reason = ?reason,
            clients = inner.clients.len(),
            "hub closed"
        );

        for (_, tx) in inner.clients.drain() {
            let _ = tx.try_send(ClientEvent::Closed(reason.clone()));
        }
        inner.upstream = None;
        inner.outbound.clear();
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        for task in inner.tasks.drain(..) {
            task.abort();
        }

        inner.state = HubState::Closed(reason);
        self.publish(&inner.state);

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_same(&self.key, self);
        }
    }
}
