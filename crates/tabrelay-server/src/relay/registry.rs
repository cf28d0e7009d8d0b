//! Hub registry: exactly one live hub per tab.
//!
//! The map lock is a plain `std` lock and is never held across an await, so a
//! closing hub can remove itself synchronously while holding its own lock.

use super::hub::{ClientHandle, RelayHub};
use super::{HubContext, TabKey};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tabrelay_core::{CloseReason, RelayError, RelayResult};
use tracing::{debug, info, warn};

type HubMap = HashMap<TabKey, Arc<RelayHub>>;

/// Registry of live relay hubs indexed by tab.
pub struct HubRegistry {
    hubs: RwLock<HubMap>,
    ctx: Arc<HubContext>,
}

impl HubRegistry {
    pub fn new(ctx: HubContext) -> Arc<Self> {
        Arc::new(Self {
            hubs: RwLock::new(HashMap::new()),
            ctx: Arc::new(ctx),
        })
    }

    pub fn context(&self) -> &Arc<HubContext> {
        &self.ctx
    }

    fn read(&self) -> RwLockReadGuard<'_, HubMap> {
        self.hubs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HubMap> {
        self.hubs.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &TabKey) -> Option<Arc<RelayHub>> {
        self.read().get(key).cloned()
    }

    /// Return the live hub for `key`, creating one if there is none.
    pub fn get_or_create(self: &Arc<Self>, key: &TabKey) -> Arc<RelayHub> {
        if let Some(hub) = self.read().get(key) {
            if !hub.state().is_closed() {
                return hub.clone();
            }
        }

        let mut hubs = self.write();
        match hubs.get(key) {
            Some(hub) if !hub.state().is_closed() => hub.clone(),
            _ => {
                let hub = RelayHub::new(key.clone(), self.ctx.clone(), Arc::downgrade(self));
                hubs.insert(key.clone(), hub.clone());
                debug!(tab = %key, hubs = hubs.len(), "hub created");
                hub
            }
        }
    }

    /// Attach a client to the tab's hub.
    ///
    /// A hub can close between lookup and attach (idle timer, teardown); that
    /// race is retried once against a fresh hub.
    pub async fn attach(self: &Arc<Self>, key: &TabKey) -> RelayResult<(Arc<RelayHub>, ClientHandle)> {
        for _ in 0..2 {
            let hub = self.get_or_create(key);
            match hub.attach().await {
                Ok(handle) => return Ok((hub, handle)),
                Err(RelayError::HubClosed) => {
                    debug!(tab = %key, "hub closed during attach, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(RelayError::HubClosed)
    }

    /// Provision and connect the tab's upstream without attaching a client.
    pub async fn start(self: &Arc<Self>, key: &TabKey) -> RelayResult<()> {
        for _ in 0..2 {
            let hub = self.get_or_create(key);
            match hub.start().await {
                Err(RelayError::HubClosed) => {
                    debug!(tab = %key, "hub closed during start, retrying");
                }
                other => return other,
            }
        }
        Err(RelayError::HubClosed)
    }

    /// Drop `key` if it still maps to `hub`. A replacement hub is left alone.
    pub(crate) fn remove_if_same(&self, key: &TabKey, hub: &RelayHub) {
        let mut hubs = self.write();
        let same = hubs
            .get(key)
            .is_some_and(|h| std::ptr::eq(Arc::as_ptr(h), hub));
        if same {
            hubs.remove(key);
            debug!(tab = %key, hubs = hubs.len(), "hub unregistered");
        }
    }

    /// Destroy a tab: close its hub, forget its provisioning state and release
    /// its resource. Returns whether a live hub existed.
    pub async fn teardown_tab(&self, key: &TabKey) -> bool {
        let hub = self.write().remove(key);
        let existed = hub.is_some();
        if let Some(hub) = hub {
            hub.close(CloseReason::TornDown).await;
        }
        self.release(key).await;
        if existed {
            info!(tab = %key, "tab torn down");
        }
        existed
    }

    /// Tear down every hub of a session. Returns the number of hubs closed.
    pub async fn teardown_session(&self, session_id: &str) -> usize {
        let hubs: Vec<(TabKey, Arc<RelayHub>)> = {
            let mut map = self.write();
            let keys: Vec<TabKey> = map
                .keys()
                .filter(|k| k.session_id == session_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| map.remove(&k).map(|hub| (k, hub)))
                .collect()
        };

        for (key, hub) in &hubs {
            hub.close(CloseReason::TornDown).await;
            self.release(key).await;
        }
        if !hubs.is_empty() {
            info!(session_id, hubs = hubs.len(), "session hubs torn down");
        }
        hubs.len()
    }

    /// Close every hub. Used on shutdown.
    pub async fn teardown_all(&self) {
        let hubs: Vec<(TabKey, Arc<RelayHub>)> = self.write().drain().collect();
        for (key, hub) in &hubs {
            hub.close(CloseReason::TornDown).await;
            self.release(key).await;
        }
        info!(hubs = hubs.len(), "all hubs closed");
    }

    async fn release(&self, key: &TabKey) {
        let resource_id = key.resource_id();
        self.ctx.coordinator.forget(&resource_id);
        if let Err(e) = self.ctx.resource.release(&resource_id).await {
            warn!(tab = %key, error = %e, "failed to release terminal resource");
        }
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn keys(&self) -> Vec<TabKey> {
        self.read().keys().cloned().collect()
    }
}
