//! Lock-free hot pool implementation using DashMap and SegQueue.

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use hyper::body::Bytes;
use hyper::client::conn::http1::SendRequest;
use http_body_util::Full;
use std::sync::Arc;

/// Request body type used on every outbound connection.
pub type OutboundBody = Full<Bytes>;

/// A lock-free two-stage hot pool for caching upstream HTTP/1.1 senders.
///
/// Keyed by the node's authority (`host:port`) so evicting a node simply
/// strands its idle senders until they are popped and discarded.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    /// Maps an authority to a lock-free queue of idle HTTP/1.1 senders.
    idle_connections: DashMap<String, Arc<SegQueue<SendRequest<OutboundBody>>>>,
}

impl ConnectionPool {
    /// Creates a new empty connection pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to pop an existing, usable sender for the given authority.
    ///
    /// Senders that went away or are mid-response are discarded rather
    /// than returned.
    pub fn try_pop(&self, authority: &str) -> Option<SendRequest<OutboundBody>> {
        if let Some(queue_ref) = self.idle_connections.get(authority) {
            let queue = queue_ref.value();
            while let Some(sender) = queue.pop() {
                if !sender.is_closed() && sender.is_ready() {
                    return Some(sender);
                }
            }
        }
        None
    }

    /// Pushes a sender back into the pool for reuse.
    ///
    /// Only senders ready for the next request are kept; the rest drop
    /// here and close once their in-flight response completes.
    pub fn push(&self, authority: &str, sender: SendRequest<OutboundBody>) {
        if sender.is_closed() || !sender.is_ready() {
            return;
        }

        let queue = self
            .idle_connections
            .entry(authority.to_string())
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .value()
            .clone();

        queue.push(sender);
    }
}
