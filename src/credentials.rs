//! API Credential Pool
//!
//! Owns the list of API keys and hands out the next usable one. Keys that
//! fail repeatedly are marked failed and skipped; a single failure always
//! advances the cursor so the next call prefers a different key. When every
//! key is marked failed the pool resets all marks and keeps going, treating
//! the outage as possibly transient.

use crate::config::CooldownStrategy;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::{info, warn};

/// Per-key bookkeeping
#[derive(Debug, Clone)]
struct KeyState {
    key: String,
    /// Consecutive error count, decremented toward zero on success
    error_count: u32,
    failed_since: Option<Instant>,
    usage_count: u64,
    last_used: Option<Instant>,
}

impl KeyState {
    fn new(key: String) -> Self {
        Self {
            key,
            error_count: 0,
            failed_since: None,
            usage_count: 0,
            last_used: None,
        }
    }

    /// Lazily expire the failure mark if the cool-down window has elapsed.
    fn is_failed(&mut self, cooldown: CooldownStrategy) -> bool {
        match (self.failed_since, cooldown) {
            (None, _) => false,
            (Some(_), CooldownStrategy::Never) => true,
            (Some(since), CooldownStrategy::After(window)) => {
                if since.elapsed() >= window {
                    self.failed_since = None;
                    self.error_count = 0;
                    info!("API key {} cool-down elapsed, eligible again", redact(&self.key));
                    false
                } else {
                    true
                }
            }
        }
    }
}

/// Snapshot of pool health, for logging and monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_keys: usize,
    pub active_keys: usize,
    pub failed_keys: usize,
    pub total_uses: u64,
}

struct PoolInner {
    keys: Vec<KeyState>,
    cursor: usize,
}

/// Rotating pool of API credentials with failure tracking
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    failure_threshold: u32,
    cooldown: CooldownStrategy,
}

impl CredentialPool {
    /// Build a pool from the configured key list.
    ///
    /// Panics if `keys` is empty: an empty pool is a configuration error and
    /// must fail at startup, never at request time.
    pub fn new(keys: &[String], failure_threshold: u32, cooldown: CooldownStrategy) -> Self {
        assert!(!keys.is_empty(), "credential pool requires at least one API key");
        info!("Credential pool initialized with {} keys", keys.len());
        Self {
            inner: Mutex::new(PoolInner {
                keys: keys.iter().cloned().map(KeyState::new).collect(),
                cursor: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Next usable credential, round-robin from the cursor, skipping failed
    /// keys. Resets all failure marks if every key is failed.
    pub fn current(&self) -> String {
        let mut inner = self.inner.lock();
        let cooldown = self.cooldown;
        let len = inner.keys.len();

        let all_failed = inner.keys.iter_mut().all(|k| k.is_failed(cooldown));
        if all_failed {
            warn!("All {} API keys failed, resetting failure status", len);
            for k in inner.keys.iter_mut() {
                k.failed_since = None;
                k.error_count = 0;
            }
        }

        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            if !inner.keys[idx].is_failed(cooldown) {
                inner.cursor = idx;
                return inner.keys[idx].key.clone();
            }
        }

        // Unreachable after the reset above, but never raise from here
        inner.keys[inner.cursor].key.clone()
    }

    /// Clear the failure mark (if any) and record usage.
    pub fn report_success(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.keys.iter_mut().find(|k| k.key == key) {
            if state.failed_since.take().is_some() {
                info!("API key {} recovered from failure", redact(key));
            }
            state.error_count = state.error_count.saturating_sub(1);
            state.usage_count += 1;
            state.last_used = Some(Instant::now());
        }
    }

    /// Count a failure against the key and advance the cursor so the next
    /// `current()` prefers a different one.
    pub fn report_failure(&self, key: &str, reason: &str) {
        let mut inner = self.inner.lock();
        let threshold = self.failure_threshold;
        if let Some(state) = inner.keys.iter_mut().find(|k| k.key == key) {
            state.error_count += 1;
            if state.error_count >= threshold && state.failed_since.is_none() {
                state.failed_since = Some(Instant::now());
                warn!(
                    "API key {} marked failed after {} errors",
                    redact(key),
                    state.error_count
                );
            }
        }
        inner.cursor = (inner.cursor + 1) % inner.keys.len();
        warn!("Switched to next API key: {}", reason);
    }

    pub fn stats(&self) -> PoolStats {
        let mut inner = self.inner.lock();
        let cooldown = self.cooldown;
        let total_keys = inner.keys.len();
        let mut failed_keys = 0;
        for k in inner.keys.iter_mut() {
            if k.is_failed(cooldown) {
                failed_keys += 1;
            }
        }
        let total_uses = inner.keys.iter().map(|k| k.usage_count).sum();
        PoolStats {
            total_keys,
            active_keys: total_keys - failed_keys,
            failed_keys,
            total_uses,
        }
    }
}

/// First 8 characters only, for logs
fn redact(key: &str) -> String {
    let end = key
        .char_indices()
        .take(8)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(key.len());
    format!("{}...", &key[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(n: usize, threshold: u32) -> CredentialPool {
        let keys: Vec<String> = (0..n).map(|i| format!("key-{}", i)).collect();
        CredentialPool::new(&keys, threshold, CooldownStrategy::Never)
    }

    #[test]
    #[should_panic(expected = "at least one API key")]
    fn test_empty_pool_panics_at_construction() {
        CredentialPool::new(&[], 3, CooldownStrategy::Never);
    }

    #[test]
    fn test_single_failure_rotates_to_next_key() {
        let p = pool(3, 3);
        let first = p.current();
        assert_eq!(first, "key-0");

        p.report_failure(&first, "timeout");
        // Below threshold: not marked failed, but cursor advanced
        assert_eq!(p.current(), "key-1");
        assert_eq!(p.stats().failed_keys, 0);
    }

    #[test]
    fn test_key_marked_failed_after_threshold() {
        let p = pool(3, 3);
        for _ in 0..3 {
            p.report_failure("key-0", "http 500");
        }
        let stats = p.stats();
        assert_eq!(stats.failed_keys, 1);
        assert_eq!(stats.active_keys, 2);

        // current() never returns a failed key while others remain
        for _ in 0..6 {
            assert_ne!(p.current(), "key-0");
            p.report_failure(&p.current(), "rotate");
        }
    }

    #[test]
    fn test_all_failed_resets_marks() {
        let p = pool(2, 1);
        p.report_failure("key-0", "err");
        p.report_failure("key-1", "err");
        assert_eq!(p.stats().failed_keys, 2);

        // Does not error, and marks are cleared
        let key = p.current();
        assert!(key == "key-0" || key == "key-1");
        assert_eq!(p.stats().failed_keys, 0);
    }

    #[test]
    fn test_success_clears_failure_mark() {
        let p = pool(2, 1);
        p.report_failure("key-0", "err");
        assert_eq!(p.stats().failed_keys, 1);

        p.report_success("key-0");
        let stats = p.stats();
        assert_eq!(stats.failed_keys, 0);
        assert_eq!(stats.total_uses, 1);
    }

    #[test]
    fn test_scenario_pool_of_three_under_sustained_failure() {
        // Spec-style walk: repeated failures knock out keys one by one, the
        // last remaining key is still always returned.
        let p = pool(3, 3);
        for _ in 0..3 {
            p.report_failure("key-0", "err");
        }
        assert_eq!(p.stats().active_keys, 2);

        for _ in 0..3 {
            p.report_failure("key-1", "err");
        }
        assert_eq!(p.stats().active_keys, 1);
        assert_eq!(p.current(), "key-2");
        assert_eq!(p.current(), "key-2");
    }

    #[test]
    fn test_cooldown_expiry_restores_key() {
        let keys = vec!["a".to_string(), "b".to_string()];
        let p = CredentialPool::new(&keys, 1, CooldownStrategy::After(Duration::from_millis(0)));
        p.report_failure("a", "err");
        // Zero-length window: mark expires by the time it is next considered
        assert_eq!(p.stats().failed_keys, 0);
    }
}
