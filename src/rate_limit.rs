//! Rate Limiting
//!
//! Two independent gates in front of the model call:
//! - per-user: a cooldown since the last admitted request, plus a sliding
//!   60-second spam window
//! - global: a bounded in-flight counter capping concurrent remote calls
//!
//! The global counter is paired through [`GlobalGuard`]: every admitted
//! request holds one and the count is released exactly once when the guard
//! drops, on success and error paths alike.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sliding window length for the spam check
const SPAM_WINDOW: Duration = Duration::from_secs(60);

/// Per-user admission outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    /// Cooling down; seconds until the next request is allowed
    CoolingDown(f64),
    /// Too many requests in the trailing window
    SpamLimited,
}

#[derive(Debug, Default)]
struct UserState {
    last_admitted: Option<Instant>,
    /// Admitted-or-attempted request times within the spam window
    recent: Vec<Instant>,
}

/// Per-user cooldown and global concurrency limiter
pub struct RateLimiter {
    cooldown: Duration,
    spam_window_max: u32,
    users: Mutex<HashMap<i64, UserState>>,
    in_flight: Arc<AtomicU32>,
    max_in_flight: u32,
}

impl RateLimiter {
    pub fn new(cooldown: Duration, spam_window_max: u32, max_in_flight: u32) -> Self {
        Self {
            cooldown,
            spam_window_max: spam_window_max.max(1),
            users: Mutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicU32::new(0)),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Check the user's cooldown and spam window; on admission the current
    /// time is recorded as last-admitted. Every attempt, admitted or not,
    /// counts toward the spam window.
    pub fn try_admit(&self, user_id: i64) -> Admission {
        let now = Instant::now();
        let mut users = self.users.lock();
        let state = users.entry(user_id).or_default();

        state.recent.retain(|t| now.duration_since(*t) < SPAM_WINDOW);
        state.recent.push(now);

        if state.recent.len() > self.spam_window_max as usize {
            warn!(user_id, count = state.recent.len(), "spam window exceeded");
            return Admission::SpamLimited;
        }

        if let Some(last) = state.last_admitted {
            let elapsed = now.duration_since(last);
            if elapsed < self.cooldown {
                let remaining = (self.cooldown - elapsed).as_secs_f64();
                debug!(user_id, remaining, "user cooling down");
                return Admission::CoolingDown(remaining);
            }
        }

        state.last_admitted = Some(now);
        Admission::Admitted
    }

    /// Try to claim a global slot. Returns `None` once the ceiling is
    /// reached; otherwise the returned guard holds the slot until dropped.
    pub fn try_start_global(&self) -> Option<GlobalGuard> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_in_flight {
                warn!(current, max = self.max_in_flight, "global concurrency cap hit");
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(GlobalGuard {
                        counter: Arc::clone(&self.in_flight),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Current number of in-flight requests
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// RAII slot on the global concurrency counter
pub struct GlobalGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for GlobalGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_admitted() {
        let limiter = RateLimiter::new(Duration::from_secs(2), 10, 20);
        assert_eq!(limiter.try_admit(1), Admission::Admitted);
    }

    #[test]
    fn test_cooldown_denies_second_request() {
        // Scenario D: 2s cooldown, requests closer together than that
        let limiter = RateLimiter::new(Duration::from_secs(2), 10, 20);
        assert_eq!(limiter.try_admit(1), Admission::Admitted);
        match limiter.try_admit(1) {
            Admission::CoolingDown(remaining) => {
                assert!(remaining > 0.0 && remaining <= 2.0);
            }
            other => panic!("expected CoolingDown, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_cooldown_admits_every_request() {
        let limiter = RateLimiter::new(Duration::from_secs(0), 100, 20);
        for _ in 0..5 {
            assert_eq!(limiter.try_admit(1), Admission::Admitted);
        }
    }

    #[test]
    fn test_users_do_not_interfere() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 10, 20);
        assert_eq!(limiter.try_admit(1), Admission::Admitted);
        assert_eq!(limiter.try_admit(2), Admission::Admitted);
    }

    #[test]
    fn test_spam_window_denies_burst() {
        let limiter = RateLimiter::new(Duration::from_secs(0), 3, 20);
        for _ in 0..3 {
            assert_eq!(limiter.try_admit(1), Admission::Admitted);
        }
        assert_eq!(limiter.try_admit(1), Admission::SpamLimited);
    }

    #[test]
    fn test_denied_attempts_count_toward_spam_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3, 20);
        assert_eq!(limiter.try_admit(1), Admission::Admitted);
        // Two cooldown denials still fill the window
        limiter.try_admit(1);
        limiter.try_admit(1);
        assert_eq!(limiter.try_admit(1), Admission::SpamLimited);
    }

    #[test]
    fn test_global_cap_and_guard_release() {
        let limiter = RateLimiter::new(Duration::from_secs(0), 100, 2);

        let a = limiter.try_start_global().unwrap();
        let _b = limiter.try_start_global().unwrap();
        assert_eq!(limiter.in_flight(), 2);
        assert!(limiter.try_start_global().is_none());

        drop(a);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.try_start_global().is_some());
    }

    #[tokio::test]
    async fn test_counter_returns_to_zero_after_concurrent_requests() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(0), 1000, 8));
        let mut handles = Vec::new();

        for i in 0..32 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                loop {
                    match limiter.try_start_global() {
                        Some(guard) => {
                            assert!(limiter.in_flight() <= 8);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            // Odd tasks simulate the error path
                            if i % 2 == 0 {
                                drop(guard);
                            }
                            break;
                        }
                        None => tokio::task::yield_now().await,
                    }
                }
            }));
        }

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(limiter.in_flight(), 0);
    }
}
