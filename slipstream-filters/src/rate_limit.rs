//! Per-client admission rate limiting.
//!
//! Each client IP gets a fixed one-second window: up to `limit` admissions
//! per window, the rest rejected outright. Rejection is immediate and
//! never results in a queue entry.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use slipstream_core::{Error, Result};

/// Admissions allowed per client per window unless configured otherwise.
pub const DEFAULT_REQUEST_LIMIT: u32 = 5;

/// Length of the per-client counting window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Sweep the client table once it grows past this many entries.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct ClientRateState {
    count: u32,
    window_started_at: Instant,
}

/// Sliding per-client admission counter.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    clients: DashMap<IpAddr, ClientRateState>,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit` requests per client per second.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            clients: DashMap::new(),
        }
    }

    /// The configured per-window admission limit.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Counts one admission attempt for `client`.
    ///
    /// Returns `true` when the request may proceed. A window older than
    /// one second resets before counting.
    pub fn admit(&self, client: IpAddr) -> bool {
        self.admit_at(client, Instant::now())
    }

    /// Like [`RateLimiter::admit`], surfacing the rejection as a
    /// [`Error::RateLimited`].
    pub fn check(&self, client: IpAddr) -> Result<()> {
        if self.admit(client) {
            Ok(())
        } else {
            Err(Error::RateLimited {
                client: client.to_string(),
                limit: self.limit,
            })
        }
    }

    fn admit_at(&self, client: IpAddr, now: Instant) -> bool {
        let mut entry = self.clients.entry(client).or_insert(ClientRateState {
            count: 0,
            window_started_at: now,
        });

        if now.duration_since(entry.window_started_at) > WINDOW {
            entry.count = 1;
            entry.window_started_at = now;
            return true;
        }

        if entry.count < self.limit {
            entry.count += 1;
            return true;
        }

        drop(entry);
        self.maybe_sweep(now);
        false
    }

    /// Drops windows that expired, bounding table growth under churn.
    fn maybe_sweep(&self, now: Instant) {
        if self.clients.len() > SWEEP_THRESHOLD {
            self.clients
                .retain(|_, state| now.duration_since(state.window_started_at) <= WINDOW);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client(octet: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet))
    }

    #[test]
    fn sixth_request_in_a_window_is_rejected() {
        let limiter = RateLimiter::new(DEFAULT_REQUEST_LIMIT);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.admit_at(client(1), now));
        }
        assert!(!limiter.admit_at(client(1), now));
    }

    #[test]
    fn limits_are_tracked_per_client() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();

        assert!(limiter.admit_at(client(1), now));
        assert!(!limiter.admit_at(client(1), now));
        assert!(limiter.admit_at(client(2), now));
    }

    #[test]
    fn rejection_surfaces_as_a_typed_error() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check(client(9)).is_ok());
        assert!(matches!(
            limiter.check(client(9)),
            Err(Error::RateLimited { limit: 1, .. })
        ));
    }

    #[test]
    fn window_resets_after_one_second() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();

        assert!(limiter.admit_at(client(1), start));
        assert!(limiter.admit_at(client(1), start));
        assert!(!limiter.admit_at(client(1), start));

        let later = start + WINDOW + Duration::from_millis(1);
        assert!(limiter.admit_at(client(1), later));
        assert!(limiter.admit_at(client(1), later));
        assert!(!limiter.admit_at(client(1), later));
    }
}
