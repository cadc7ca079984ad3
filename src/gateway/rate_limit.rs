//! Failed-login throttle.
//!
//! Only failures are counted, per (client address, login handle). A client
//! that keeps guessing one account is slowed down; other users behind the
//! same address, and correct logins, never touch the budget.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{request::Parts, HeaderMap};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Window over which failures are counted.
pub const THROTTLE_WINDOW_SECS: u64 = 60;

/// Stale keys are dropped at most this often.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct Failures {
    by_key: HashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

#[derive(Debug)]
pub struct LoginThrottle {
    max_failures: u32,
    window: Duration,
    failures: Mutex<Failures>,
}

impl LoginThrottle {
    /// `max_failures == 0` disables throttling.
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            failures: Mutex::new(Failures::default()),
        }
    }

    pub fn per_minute(max_failures: u32) -> Self {
        Self::new(max_failures, Duration::from_secs(THROTTLE_WINDOW_SECS))
    }

    /// `true` once `key` has used up its failures for the current window.
    pub fn is_blocked(&self, key: &str) -> bool {
        self.is_blocked_at(key, Instant::now())
    }

    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, Instant::now());
    }

    /// Forget the failures of `key` after a successful login.
    pub fn clear(&self, key: &str) {
        self.failures.lock().by_key.remove(key);
    }

    fn is_blocked_at(&self, key: &str, now: Instant) -> bool {
        if self.max_failures == 0 {
            return false;
        }
        let mut failures = self.failures.lock();
        let Some(times) = failures.by_key.get_mut(key) else {
            return false;
        };
        prune(times, now, self.window);
        if times.is_empty() {
            failures.by_key.remove(key);
            return false;
        }
        times.len() >= self.max_failures as usize
    }

    fn record_failure_at(&self, key: &str, now: Instant) {
        if self.max_failures == 0 {
            return;
        }
        let mut failures = self.failures.lock();
        let window = self.window;
        if failures
            .last_sweep
            .is_none_or(|at| now.saturating_duration_since(at) >= SWEEP_INTERVAL)
        {
            failures.by_key.retain(|_, times| {
                prune(times, now, window);
                !times.is_empty()
            });
            failures.last_sweep = Some(now);
        }
        let times = failures.by_key.entry(key.to_owned()).or_default();
        prune(times, now, window);
        times.push_back(now);
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.failures.lock().by_key.len()
    }
}

fn prune(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while times
        .front()
        .is_some_and(|at| now.saturating_duration_since(*at) >= window)
    {
        times.pop_front();
    }
}

/// TCP peer of the request, when the server was started with connect info.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Client address for throttling.
///
/// Forwarding headers are client-controlled, so they are read only behind a
/// proxy the operator has declared trusted.
pub fn client_address(peer: PeerAddr, headers: &HeaderMap, trust_forwarded: bool) -> String {
    if trust_forwarded {
        for header_name in ["X-Forwarded-For", "X-Real-IP"] {
            if let Some(first) = headers
                .get(header_name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                return first.to_owned();
            }
        }
    }
    peer.0
        .map_or_else(|| "local".to_owned(), |addr| addr.ip().to_string())
}

/// Throttle key for one login handle as seen from one client.
pub fn throttle_key(client: &str, handle: &str) -> String {
    format!("{client}|{}", handle.trim().to_lowercase())
}
