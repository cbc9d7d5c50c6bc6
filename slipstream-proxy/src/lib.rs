//! Slipstream proxy engine.
//!
//! The Tokio async engine that fronts a pool of inference backends:
//! admission control with per-client rate limiting, capacity-aware node
//! selection, a priority queue for deferred requests, a periodic health
//! monitor with eviction, and one-retry failover on dispatch.

use std::sync::Arc;

use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};

use slipstream_admin::NodeStore;
use slipstream_core::admission::queue::AdmissionQueue;
use slipstream_core::domain::node::{Node, SharedNode};
use slipstream_core::domain::registry::NodeRegistry;
use slipstream_core::load_balancer::affinity::AffinityTable;
use slipstream_core::Result;
use slipstream_filters::RateLimiter;

pub mod admission;
pub mod client;
pub mod config;
pub mod connection_pool;
pub mod dispatcher;
pub mod health_check;
pub mod registration;
pub mod server;

pub use config::Config;

/// Response body type produced by the engine: either a synthesized full
/// body or a streamed upstream body.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// The engine's shared state, constructed once per process and injected
/// into every handler and background task.
pub struct AppState {
    /// Validated engine configuration.
    pub config: Config,
    /// Membership and observed state of the backend pool.
    pub registry: Arc<NodeRegistry>,
    /// Requests parked until capacity frees up.
    pub queue: Arc<AdmissionQueue>,
    /// Per-client admission limiter.
    pub limiter: RateLimiter,
    /// Soft client-to-node bindings.
    pub affinity: AffinityTable,
    /// Durable node store, the system of record across restarts.
    pub store: Arc<dyn NodeStore>,
    /// Outbound HTTP client shared by dispatch and probes.
    pub client: client::UpstreamClient,
}

impl AppState {
    /// Wires up the engine state around a validated configuration.
    pub fn new(config: Config, store: Arc<dyn NodeStore>) -> Arc<Self> {
        let limiter = RateLimiter::new(config.request_limit_per_second);
        Arc::new(Self {
            config,
            registry: Arc::new(NodeRegistry::new()),
            queue: Arc::new(AdmissionQueue::new()),
            limiter,
            affinity: AffinityTable::new(),
            store,
            client: client::UpstreamClient::new(),
        })
    }

    /// Hydrates the registry from the durable store.
    ///
    /// Returns the number of nodes loaded.
    pub async fn load_registry(&self) -> Result<usize> {
        let persisted = self.store.load_all().await?;
        let nodes: Vec<SharedNode> = persisted
            .values()
            .map(|snapshot| Arc::new(Node::from_snapshot(snapshot)))
            .collect();
        let loaded = nodes.len();
        self.registry.replace_all(nodes);
        Ok(loaded)
    }

    /// Persists the full node set to the durable store.
    pub async fn persist_registry(&self) -> Result<()> {
        let snapshot = self
            .registry
            .snapshot()
            .iter()
            .map(|node| (node.url().to_string(), node.snapshot()))
            .collect();
        self.store.save_all(&snapshot).await
    }
}

/// Builds a response body from a complete payload.
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Builds a plain-text response.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

/// Builds a JSON response.
pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(value.to_string()))
        .unwrap_or_else(|_| Response::new(full_body("")))
}
