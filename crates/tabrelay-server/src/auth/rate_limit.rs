//! Attempt windows guarding session credentials and WebSocket attaches.
//!
//! Credential failures are counted per (client address, session), so one
//! client hammering a session cannot lock out others. Attaches are counted
//! per client address. Both forget attempts older than the window.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Budgets for [`ServerRateLimits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Rejected credentials per address and session before further attempts
    /// are refused.
    pub credential_failures: usize,
    /// Attaches per address.
    pub attaches: usize,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            credential_failures: 5,
            attaches: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Recent attempt times per key, oldest first.
#[derive(Debug)]
pub struct AttemptWindow<K> {
    limit: usize,
    window: Duration,
    attempts: HashMap<K, VecDeque<Instant>>,
}

impl<K: Hash + Eq> AttemptWindow<K> {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            attempts: HashMap::new(),
        }
    }

    fn expire(times: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while times
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            times.pop_front();
        }
    }

    /// Whether `key` has used up its budget for the current window.
    pub fn exhausted(&mut self, key: &K) -> bool {
        let now = Instant::now();
        let window = self.window;
        match self.attempts.get_mut(key) {
            Some(times) => {
                Self::expire(times, window, now);
                times.len() >= self.limit
            }
            None => self.limit == 0,
        }
    }

    /// Count an attempt for `key`.
    pub fn record(&mut self, key: K) {
        let now = Instant::now();
        let times = self.attempts.entry(key).or_default();
        Self::expire(times, self.window, now);
        times.push_back(now);
    }

    /// Count an attempt unless the budget is used up. Returns whether it was
    /// admitted.
    pub fn admit(&mut self, key: K) -> bool {
        if self.exhausted(&key) {
            return false;
        }
        self.record(key);
        true
    }

    pub fn forget(&mut self, key: &K) {
        self.attempts.remove(key);
    }

    /// Drop keys with no attempts left in the window.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.attempts.retain(|_, times| {
            Self::expire(times, window, now);
            !times.is_empty()
        });
    }

    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }
}

/// Rate limits applied by the HTTP surface.
#[derive(Debug)]
pub struct ServerRateLimits {
    credential_failures: AttemptWindow<(IpAddr, String)>,
    attaches: AttemptWindow<IpAddr>,
}

impl Default for ServerRateLimits {
    fn default() -> Self {
        Self::new(RateLimitSettings::default())
    }
}

impl ServerRateLimits {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            credential_failures: AttemptWindow::new(settings.credential_failures, settings.window),
            attaches: AttemptWindow::new(settings.attaches, settings.window),
        }
    }

    /// Whether `ip` may still present a credential for `session_id`.
    pub fn may_try_credential(&mut self, ip: IpAddr, session_id: &str) -> bool {
        !self
            .credential_failures
            .exhausted(&(ip, session_id.to_string()))
    }

    pub fn record_credential_failure(&mut self, ip: IpAddr, session_id: &str) {
        self.credential_failures.record((ip, session_id.to_string()));
    }

    /// A correct credential clears earlier failures.
    pub fn record_credential_success(&mut self, ip: IpAddr, session_id: &str) {
        self.credential_failures.forget(&(ip, session_id.to_string()));
    }

    /// Count an attach from `ip`; false once its budget is used up.
    pub fn admit_attach(&mut self, ip: IpAddr) -> bool {
        self.attaches.admit(ip)
    }

    pub fn gc(&mut self) {
        self.credential_failures.gc();
        self.attaches.gc();
    }
}
