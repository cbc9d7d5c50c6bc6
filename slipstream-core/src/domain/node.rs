//! Backend node models.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::domain::probe::ProbeReport;
use crate::load_balancer::scoring::RunningMean;

/// Slots assumed for a node until its first capacity observation.
pub const DEFAULT_CAPACITY_SLOTS: u32 = 1;

/// Consecutive traffic failures after which a node stops being selectable.
pub const TRAFFIC_FAILURE_THRESHOLD: u32 = 5;

/// Consecutive failures after which a failed probe evicts the node.
pub const PROBE_FAILURE_EVICTION_THRESHOLD: u32 = 3;

/// Floor applied to the observed latency before scoring, in milliseconds.
///
/// A node with no completed requests yet carries a zero mean; scoring
/// divides by the latency, so it is clamped to this minimum first.
pub const MIN_SCORED_LATENCY_MS: f64 = 1.0;

/// Represents a single backend inference server and its observed state.
///
/// All mutable fields are atomics so score reads never block the dispatch
/// or health-check paths. Capacity reservation is a CAS loop and therefore
/// atomic with respect to concurrent reservations.
#[derive(Debug)]
pub struct Node {
    /// Dispatch target and unique key, without a trailing slash.
    url: String,
    /// Concurrent work units the backend last reported as idle.
    capacity_slots: AtomicU32,
    /// Slots currently reserved by requests dispatched through this process.
    active_connections: AtomicU32,
    /// Busy slot count from the last probe, for the aggregate health view.
    slots_processing: AtomicU32,
    /// Running mean of completed-request latency.
    latency: RunningMean,
    /// Epoch milliseconds of the last successful or attempted probe.
    last_health_check_ms: AtomicU64,
    /// Requests dispatched to this node, successful or not.
    total_requests: AtomicU64,
    /// Requests that completed with a 2xx status.
    successful_requests: AtomicU64,
    /// Failures since the last successful completion; shared between the
    /// traffic and probe accounting paths.
    consecutive_failures: AtomicU32,
    /// Whether the node may be selected at all.
    available: AtomicBool,
}

/// A thread-safe reference to a [`Node`].
pub type SharedNode = Arc<Node>;

impl Node {
    /// Creates a node with default capacity, assumed available.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: normalize_url(url.into()),
            capacity_slots: AtomicU32::new(DEFAULT_CAPACITY_SLOTS),
            active_connections: AtomicU32::new(0),
            slots_processing: AtomicU32::new(0),
            latency: RunningMean::new(),
            last_health_check_ms: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// The node's URL, its identity within the registry.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the node may currently be selected.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Forces the availability flag.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Reported capacity in slots.
    pub fn capacity_slots(&self) -> u32 {
        self.capacity_slots.load(Ordering::Acquire)
    }

    /// Slots reserved by in-flight requests from this process.
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Busy slot count observed by the last probe.
    pub fn slots_processing(&self) -> u32 {
        self.slots_processing.load(Ordering::Acquire)
    }

    /// Capacity not yet reserved by this process.
    pub fn free_slots(&self) -> u32 {
        self.capacity_slots().saturating_sub(self.active_connections())
    }

    /// Running mean of completed-request latency in milliseconds.
    pub fn avg_response_time_ms(&self) -> f64 {
        self.latency.value()
    }

    /// Failures since the last successful completion.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Requests dispatched to this node so far.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Acquire)
    }

    /// Requests that completed successfully.
    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Acquire)
    }

    /// Epoch milliseconds of the last probe attempt.
    pub fn last_health_check_ms(&self) -> u64 {
        self.last_health_check_ms.load(Ordering::Acquire)
    }

    /// Whether the last probe is at least `min_age_ms` old at `now_ms`.
    pub fn probe_due(&self, min_age_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_health_check_ms()) >= min_age_ms
    }

    /// The node's selection score. Higher is better.
    ///
    /// `-inf` while unavailable; otherwise capacity scaled by historical
    /// success rate and divided by latency and active load, so the score
    /// strictly decreases as reservations accumulate and strictly
    /// increases with reported capacity and reliability.
    pub fn score(&self) -> f64 {
        if !self.is_available() {
            return f64::NEG_INFINITY;
        }

        let total = self.total_requests.load(Ordering::Relaxed);
        let success_rate = if total > 0 {
            self.successful_requests.load(Ordering::Relaxed) as f64 / total as f64
        } else {
            1.0
        };

        let avg_ms = self.latency.value().max(MIN_SCORED_LATENCY_MS);
        let active = self.active_connections.load(Ordering::Relaxed).max(1) as f64;
        let capacity = self.capacity_slots.load(Ordering::Relaxed) as f64;

        capacity * success_rate / (avg_ms * active)
    }

    /// Attempts to reserve `slots` units of capacity.
    ///
    /// Returns `false` without side effects when the free capacity is
    /// insufficient. The CAS loop guarantees reservations never overcommit
    /// `capacity_slots` even under concurrent callers.
    pub fn try_reserve(&self, slots: u32) -> bool {
        let capacity = self.capacity_slots.load(Ordering::Acquire);
        let mut active = self.active_connections.load(Ordering::Acquire);

        loop {
            if capacity.saturating_sub(active) < slots {
                return false;
            }

            match self.active_connections.compare_exchange_weak(
                active,
                active + slots,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => active = observed,
            }
        }
    }

    /// Releases a reservation previously taken with [`Node::try_reserve`].
    pub fn release(&self, slots: u32) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                Some(active.saturating_sub(slots))
            });
    }

    /// Records a completed 2xx dispatch.
    ///
    /// Folds the latency sample into the running mean with
    /// `(avg * (n - 1) + latest) / n` where `n` is the request total after
    /// increment, and resets the consecutive-failure counter — the only
    /// path that resets it.
    pub fn record_success(&self, latency_ms: f64) {
        let total = self.total_requests.fetch_add(1, Ordering::AcqRel) + 1;
        self.successful_requests.fetch_add(1, Ordering::AcqRel);
        self.latency.observe(latency_ms, total);
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Records a failed dispatch (non-2xx or transport failure).
    ///
    /// Marks the node unavailable once the shared failure counter reaches
    /// [`TRAFFIC_FAILURE_THRESHOLD`]. Returns the new counter value.
    pub fn record_dispatch_failure(&self) -> u32 {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= TRAFFIC_FAILURE_THRESHOLD {
            self.available.store(false, Ordering::Release);
        }
        failures
    }

    /// Records a failed health probe.
    ///
    /// Increments the same failure counter as the traffic path and marks
    /// the node unavailable immediately. The monitor evicts the node once
    /// the returned value reaches [`PROBE_FAILURE_EVICTION_THRESHOLD`].
    pub fn record_probe_failure(&self) -> u32 {
        self.available.store(false, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Applies a valid probe with an accepted status.
    ///
    /// Refreshes capacity, busy count, and the probe timestamp. With
    /// `probe_recovery` enabled the node becomes selectable again; the
    /// failure counter is deliberately left untouched.
    pub fn apply_probe(&self, report: &ProbeReport, probe_recovery: bool) {
        self.capacity_slots
            .store(report.slots_idle, Ordering::Release);
        self.slots_processing
            .store(report.slots_processing, Ordering::Release);
        self.touch_health_check();
        if report.status.accepted() && probe_recovery {
            self.available.store(true, Ordering::Release);
        }
    }

    /// Stamps the probe timestamp with the current wall clock.
    pub fn touch_health_check(&self) {
        self.last_health_check_ms
            .store(now_epoch_ms(), Ordering::Release);
    }

    /// Serializable view of the node for the durable store.
    ///
    /// In-flight reservations are process-local and not part of the
    /// snapshot.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            url: self.url.clone(),
            capacity_slots: self.capacity_slots(),
            slots_processing: self.slots_processing(),
            avg_response_time_ms: self.avg_response_time_ms(),
            last_health_check_ms: self.last_health_check_ms(),
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            consecutive_failures: self.consecutive_failures(),
            is_available: self.is_available(),
        }
    }

    /// Rebuilds a node from a persisted snapshot.
    pub fn from_snapshot(snapshot: &NodeSnapshot) -> Self {
        Self {
            url: normalize_url(snapshot.url.clone()),
            capacity_slots: AtomicU32::new(snapshot.capacity_slots),
            active_connections: AtomicU32::new(0),
            slots_processing: AtomicU32::new(snapshot.slots_processing),
            latency: RunningMean::from_value(snapshot.avg_response_time_ms),
            last_health_check_ms: AtomicU64::new(snapshot.last_health_check_ms),
            total_requests: AtomicU64::new(snapshot.total_requests),
            successful_requests: AtomicU64::new(snapshot.successful_requests),
            consecutive_failures: AtomicU32::new(snapshot.consecutive_failures),
            available: AtomicBool::new(snapshot.is_available),
        }
    }
}

/// Persisted status of one node, keyed by URL in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Node URL, the store key.
    pub url: String,
    /// Last reported idle capacity in slots.
    pub capacity_slots: u32,
    /// Last reported busy slot count.
    pub slots_processing: u32,
    /// Running mean of completed-request latency in milliseconds.
    pub avg_response_time_ms: f64,
    /// Epoch milliseconds of the last probe attempt.
    pub last_health_check_ms: u64,
    /// Requests dispatched to this node, successful or not.
    pub total_requests: u64,
    /// Requests that completed successfully.
    pub successful_requests: u64,
    /// Failures since the last successful completion.
    pub consecutive_failures: u32,
    /// Whether the node was selectable when last persisted.
    pub is_available: bool,
}

/// Strips trailing slashes so URLs compare as identities.
pub fn normalize_url(url: String) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.len() == url.len() {
        url
    } else {
        trimmed.to_string()
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
