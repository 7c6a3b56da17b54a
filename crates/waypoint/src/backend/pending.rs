//! Per-target ping bookkeeping: coalescing, timeouts and the re-ping window.

use super::PingCallback;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

struct PendingPing {
    elapsed: Duration,
    waiters: Vec<PingCallback>,
}

pub(crate) struct PendingPings<K> {
    pending: HashMap<K, PendingPing>,
    /// Backend-local time at which each target last completed
    completed_at: HashMap<K, Duration>,
    now: Duration,
    timeout: Duration,
    rate_window: Duration,
}

impl<K: Eq + Hash + Clone> PendingPings<K> {
    pub fn new(timeout: Duration, rate_window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            completed_at: HashMap::new(),
            now: Duration::ZERO,
            timeout,
            rate_window,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Adds a waiter to an already pending probe. Returns the callback when
    /// nothing is pending for `key`.
    pub fn attach(&mut self, key: &K, callback: PingCallback) -> Result<(), PingCallback> {
        match self.pending.get_mut(key) {
            Some(ping) => {
                ping.waiters.push(callback);
                Ok(())
            }
            None => Err(callback),
        }
    }

    pub fn is_rate_limited(&self, key: &K) -> bool {
        self.completed_at
            .get(key)
            .is_some_and(|at| self.now.saturating_sub(*at) < self.rate_window)
    }

    pub fn begin(&mut self, key: K, callback: PingCallback) {
        self.pending.insert(
            key,
            PendingPing {
                elapsed: Duration::ZERO,
                waiters: vec![callback],
            },
        );
    }

    /// Removes a pending probe and returns its waiters.
    pub fn complete(&mut self, key: &K) -> Vec<PingCallback> {
        match self.pending.remove(key) {
            Some(ping) => {
                self.completed_at.insert(key.clone(), self.now);
                ping.waiters
            }
            None => Vec::new(),
        }
    }

    /// Advances time and returns every probe that outlived the timeout.
    pub fn advance(&mut self, dt: Duration) -> Vec<(K, Vec<PingCallback>)> {
        self.now += dt;
        for ping in self.pending.values_mut() {
            ping.elapsed += dt;
        }

        let expired: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, ping)| ping.elapsed >= self.timeout)
            .map(|(key, _)| key.clone())
            .collect();

        let window = self.rate_window;
        let now = self.now;
        self.completed_at.retain(|_, at| now.saturating_sub(*at) < window);

        expired
            .into_iter()
            .map(|key| {
                let waiters = self.complete(&key);
                (key, waiters)
            })
            .collect()
    }
}
