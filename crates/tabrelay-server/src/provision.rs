//! Provisioning coordinator: collapses concurrent "ensure started" calls.
//!
//! Each resource key moves through `NotStarted -> Starting -> Started`. The
//! check-and-insert on the key map happens under one lock, so only the caller
//! that flips a key to `Starting` runs the start procedure. Everyone else
//! subscribes to that attempt's outcome.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tabrelay_core::{RelayError, RelayResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome slot shared by every caller waiting on one attempt.
/// `None` while the attempt is in flight.
type Outcome = Option<Result<(), String>>;

enum Slot {
    Starting(watch::Receiver<Outcome>),
    Started,
}

/// Observable provisioning state of one resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    NotStarted,
    Starting,
    Started,
}

type SlotMap = Arc<Mutex<HashMap<String, Slot>>>;

fn lock(slots: &SlotMap) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deduplicates start procedures per resource key.
#[derive(Clone, Default)]
pub struct ProvisioningCoordinator {
    slots: SlotMap,
}

impl ProvisioningCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure `key` has been started, running `start` at most once.
    ///
    /// - `Started`: returns immediately.
    /// - `Starting`: waits for the in-flight attempt, `start` is not called.
    /// - `NotStarted`: runs `start`. Success marks the key `Started`; failure
    ///   resets it to `NotStarted` and is reported to every waiting caller.
    ///
    /// The procedure runs on its own task, so a caller giving up (timeout,
    /// disconnect) does not abort the attempt for the others.
    pub async fn ensure_started<F, Fut>(&self, key: &str, start: F) -> RelayResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RelayResult<()>> + Send + 'static,
    {
        let mut pending = None;
        let mut rx = {
            let mut slots = lock(&self.slots);
            match slots.entry(key.to_string()) {
                Entry::Occupied(entry) => match entry.get() {
                    Slot::Started => return Ok(()),
                    Slot::Starting(rx) => {
                        debug!(key, "start already in flight, waiting");
                        rx.clone()
                    }
                },
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(Slot::Starting(rx.clone()));
                    pending = Some(tx);
                    rx
                }
            }
        };
        if let Some(tx) = pending {
            self.spawn_attempt(key.to_string(), tx, start());
        }

        let outcome = rx
            .wait_for(|o| o.is_some())
            .await
            .map_err(|_| RelayError::Start(format!("start of {key} was abandoned")))?
            .clone();

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(RelayError::Start(message)),
            None => Err(RelayError::Start(format!("start of {key} produced no outcome"))),
        }
    }

    fn spawn_attempt<Fut>(&self, key: String, tx: watch::Sender<Outcome>, attempt: Fut)
    where
        Fut: Future<Output = RelayResult<()>> + Send + 'static,
    {
        let guard = AttemptGuard {
            slots: self.slots.clone(),
            key,
            tx: Some(tx),
        };
        tokio::spawn(async move {
            info!(key = %guard.key, "starting resource");
            let result = attempt.await.map_err(|e| match e {
                RelayError::Start(message) => message,
                other => other.to_string(),
            });
            guard.finish(result);
        });
    }

    /// Current state of `key`.
    pub fn state(&self, key: &str) -> ProvisionState {
        match lock(&self.slots).get(key) {
            Some(Slot::Started) => ProvisionState::Started,
            Some(Slot::Starting(_)) => ProvisionState::Starting,
            None => ProvisionState::NotStarted,
        }
    }

    /// Drop a `Started` mark so the next caller provisions again.
    ///
    /// An in-flight attempt is left alone.
    pub fn forget(&self, key: &str) {
        let mut slots = lock(&self.slots);
        if matches!(slots.get(key), Some(Slot::Started)) {
            slots.remove(key);
            debug!(key, "provisioning state forgotten");
        }
    }
}

/// Owns the outcome sender of one attempt.
///
/// If the attempt task dies without reporting, the key is reset to
/// `NotStarted` before waiters observe the closed channel.
struct AttemptGuard {
    slots: SlotMap,
    key: String,
    tx: Option<watch::Sender<Outcome>>,
}

impl AttemptGuard {
    fn finish(mut self, result: Result<(), String>) {
        {
            let mut slots = lock(&self.slots);
            match &result {
                Ok(()) => {
                    slots.insert(self.key.clone(), Slot::Started);
                    info!(key = %self.key, "resource started");
                }
                Err(e) => {
                    slots.remove(&self.key);
                    warn!(key = %self.key, error = %e, "resource start failed");
                }
            }
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            lock(&self.slots).remove(&self.key);
            warn!(key = %self.key, "start attempt aborted");
            drop(tx);
        }
    }
}
