//! The deferred-request queue.
//!
//! Requests that cannot be placed immediately park here on a oneshot
//! receiver. Every capacity release runs [`AdmissionQueue::drain`], which
//! resolves waiters in strict priority order with slots already reserved
//! on their behalf.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::domain::node::SharedNode;
use crate::domain::registry::NodeRegistry;
use crate::load_balancer::selector::select_with_capacity;

/// Priority derived from a caller-supplied segment number.
///
/// Segment 1 (the default) maps to priority 1.
pub fn priority_for_segment(segment: u64) -> f64 {
    (segment.max(1) as f64).sqrt()
}

/// One parked request.
#[derive(Debug)]
struct QueuedRequest {
    required_slots: u32,
    priority: f64,
    seq: u64,
    enqueued_at: Instant,
    resolve: oneshot::Sender<SharedNode>,
}

/// Deferred requests awaiting capacity, drained by descending priority
/// with FIFO order among equal priorities.
#[derive(Debug)]
pub struct AdmissionQueue {
    entries: Mutex<Vec<QueuedRequest>>,
    next_seq: AtomicU64,
}

impl AdmissionQueue {
    /// Creates an empty queue. No size bound is imposed by default.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Parks a request until capacity frees up.
    ///
    /// The returned receiver resolves to a node on which
    /// `required_slots` have already been reserved. Dropping the receiver
    /// cancels the request: the entry is pruned on the next drain and any
    /// racing reservation is released.
    pub fn enqueue(&self, required_slots: u32, segment: u64) -> oneshot::Receiver<SharedNode> {
        let (resolve, wait) = oneshot::channel();
        let entry = QueuedRequest {
            required_slots,
            priority: priority_for_segment(segment),
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            enqueued_at: Instant::now(),
            resolve,
        };

        self.lock_entries().push(entry);
        wait
    }

    /// Number of parked requests, cancelled entries included until the
    /// next drain.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether no requests are parked.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Attempts to place parked requests, head first.
    ///
    /// Invoked after every capacity release. Cancelled waiters are pruned,
    /// remaining entries are ordered by descending priority (FIFO among
    /// equals), and only the head is attempted: a blocked high-priority
    /// entry holds back lower-priority ones by design, preserving priority
    /// order. With an empty registry this is a no-op and entries stay
    /// parked.
    pub fn drain(&self, registry: &NodeRegistry) {
        if registry.is_empty() {
            return;
        }

        let mut entries = self.lock_entries();
        entries.retain(|entry| !entry.resolve.is_closed());
        entries.sort_by(compare_entries);

        while !entries.is_empty() {
            let head_slots = entries[0].required_slots;
            let Some(node) = select_with_capacity(registry, head_slots) else {
                break;
            };
            if !node.try_reserve(head_slots) {
                // Lost a reservation race; re-evaluate against fresh state.
                continue;
            }

            let head = entries.remove(0);
            if let Err(unclaimed) = head.resolve.send(node) {
                // Waiter cancelled between prune and send.
                unclaimed.release(head.required_slots);
            }
        }
    }

    /// Age of the oldest parked request, if any.
    pub fn oldest_wait(&self) -> Option<std::time::Duration> {
        self.lock_entries()
            .iter()
            .map(|entry| entry.enqueued_at.elapsed())
            .max()
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<QueuedRequest>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn compare_entries(a: &QueuedRequest, b: &QueuedRequest) -> Ordering {
    b.priority
        .partial_cmp(&a.priority)
        .unwrap_or(Ordering::Equal)
        .then(a.seq.cmp(&b.seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::Node;
    use crate::domain::probe::{HealthStatus, ProbeReport};
    use std::sync::Arc;

    fn node_with_capacity(url: &str, idle: u32) -> SharedNode {
        let node = Node::new(url);
        node.apply_probe(
            &ProbeReport {
                status: HealthStatus::Ok,
                slots_idle: idle,
                slots_processing: 0,
            },
            true,
        );
        Arc::new(node)
    }

    #[test]
    fn segment_priority_is_sqrt() {
        assert_eq!(priority_for_segment(1), 1.0);
        assert_eq!(priority_for_segment(4), 2.0);
        assert_eq!(priority_for_segment(9), 3.0);
        // Segment 0 is treated as the default segment.
        assert_eq!(priority_for_segment(0), 1.0);
    }

    #[tokio::test]
    async fn drain_resolves_by_descending_priority() {
        let registry = NodeRegistry::with_nodes(vec![node_with_capacity("http://a", 1)]);
        let queue = AdmissionQueue::new();

        let mut low = queue.enqueue(1, 1);
        let mut high = queue.enqueue(1, 9);

        queue.drain(&registry);

        // Only one slot exists: the high-priority entry wins it.
        let node = high.try_recv().expect("high priority resolved");
        assert_eq!(node.url(), "http://a");
        assert!(low.try_recv().is_err());
        assert_eq!(queue.len(), 1);

        node.release(1);
        queue.drain(&registry);
        assert!(low.try_recv().is_ok());
    }

    #[tokio::test]
    async fn equal_priorities_resolve_fifo() {
        let registry = NodeRegistry::with_nodes(vec![node_with_capacity("http://a", 1)]);
        let queue = AdmissionQueue::new();

        let mut first = queue.enqueue(1, 1);
        let mut second = queue.enqueue(1, 1);

        queue.drain(&registry);
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn blocked_head_holds_back_lower_priorities() {
        let registry = NodeRegistry::with_nodes(vec![node_with_capacity("http://a", 1)]);
        let queue = AdmissionQueue::new();

        let mut wide = queue.enqueue(2, 9);
        let mut narrow = queue.enqueue(1, 1);

        queue.drain(&registry);

        // The two-slot head cannot be placed, so the one-slot entry must
        // not jump the line.
        assert!(wide.try_recv().is_err());
        assert!(narrow.try_recv().is_err());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn drain_reserves_on_behalf_of_the_waiter() {
        let node = node_with_capacity("http://a", 2);
        let registry = NodeRegistry::with_nodes(vec![node.clone()]);
        let queue = AdmissionQueue::new();

        let mut wait = queue.enqueue(2, 1);
        queue.drain(&registry);

        let resolved = wait.try_recv().expect("resolved");
        assert_eq!(resolved.active_connections(), 2);
        assert_eq!(node.free_slots(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiters_are_pruned_without_leaking_slots() {
        let node = node_with_capacity("http://a", 1);
        let registry = NodeRegistry::with_nodes(vec![node.clone()]);
        let queue = AdmissionQueue::new();

        let wait = queue.enqueue(1, 1);
        drop(wait);
        queue.drain(&registry);

        assert!(queue.is_empty());
        assert_eq!(node.active_connections(), 0);
    }

    #[tokio::test]
    async fn drain_with_empty_registry_is_a_no_op() {
        let registry = NodeRegistry::new();
        let queue = AdmissionQueue::new();

        let mut wait = queue.enqueue(1, 1);
        queue.drain(&registry);

        assert_eq!(queue.len(), 1);
        assert!(wait.try_recv().is_err());
    }
}
