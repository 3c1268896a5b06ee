//! Requeue backoff for failing Services.
//!
//! A Service whose reconcile keeps failing is retried after 1, 1, 2, 3, 5
//! and 8 minutes, then every 10 minutes until it succeeds once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Fibonacci sequence of whole minutes, capped
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    first: u64,
    cap: u64,
    previous: u64,
    next: u64,
}

impl FibonacciBackoff {
    #[must_use]
    pub fn new(first_minutes: u64, cap_minutes: u64) -> Self {
        Self {
            first: first_minutes,
            cap: cap_minutes,
            previous: 0,
            next: first_minutes,
        }
    }

    /// Current delay; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let minutes = self.next;
        self.next = (self.previous + self.next).min(self.cap);
        self.previous = minutes;
        Duration::from_secs(minutes * 60)
    }

    pub fn reset(&mut self) {
        self.previous = 0;
        self.next = self.first;
    }
}

#[derive(Debug)]
struct ServiceBackoff {
    backoff: FibonacciBackoff,
    failures: u32,
}

/// Per-Service backoff state, keyed by `namespace/name`
#[derive(Debug)]
pub struct BackoffRegistry {
    first_minutes: u64,
    cap_minutes: u64,
    states: Mutex<HashMap<String, ServiceBackoff>>,
}

impl Default for BackoffRegistry {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

impl BackoffRegistry {
    pub fn new(first_minutes: u64, cap_minutes: u64) -> Self {
        Self {
            first_minutes,
            cap_minutes,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return how long to wait and how many failures in a row there were
    pub fn record_failure(&self, key: &str) -> (Duration, u32) {
        let Ok(mut states) = self.states.lock() else {
            warn!("backoff state lock poisoned, requeueing {} after the first delay", key);
            return (Duration::from_secs(self.first_minutes * 60), 1);
        };
        let state = states.entry(key.to_string()).or_insert_with(|| ServiceBackoff {
            backoff: FibonacciBackoff::new(self.first_minutes, self.cap_minutes),
            failures: 0,
        });
        state.failures += 1;
        (state.backoff.next_delay(), state.failures)
    }

    /// Forget the failures of a Service after a successful reconcile
    pub fn record_success(&self, key: &str) {
        if let Ok(mut states) = self.states.lock() {
            if let Some(state) = states.get_mut(key) {
                state.backoff.reset();
                state.failures = 0;
            }
        }
    }

    /// Drop a Service that no longer exists
    pub fn forget(&self, key: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(d: Duration) -> u64 {
        d.as_secs() / 60
    }

    #[test]
    fn test_sequence_caps_at_ten_minutes() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        let seen: Vec<u64> = (0..9).map(|_| minutes(backoff.next_delay())).collect();
        assert_eq!(seen, vec![1, 1, 2, 3, 5, 8, 10, 10, 10]);
    }

    #[test]
    fn test_registry_tracks_services_separately() {
        let registry = BackoffRegistry::default();
        assert_eq!(registry.record_failure("default/a"), (Duration::from_secs(60), 1));
        assert_eq!(registry.record_failure("default/a"), (Duration::from_secs(60), 2));
        assert_eq!(registry.record_failure("default/a"), (Duration::from_secs(120), 3));
        assert_eq!(registry.record_failure("default/b"), (Duration::from_secs(60), 1));

        registry.record_success("default/a");
        assert_eq!(registry.record_failure("default/a"), (Duration::from_secs(60), 1));

        registry.forget("default/b");
        assert_eq!(registry.record_failure("default/b").1, 1);
    }
}
