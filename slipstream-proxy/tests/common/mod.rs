//! Shared test harness: scripted mock backends and engine wiring.

#![allow(dead_code)]

use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use http_body_util::Full;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use slipstream_admin::MemoryStore;
use slipstream_core::domain::node::Node;
use slipstream_core::domain::probe::{HealthStatus, ProbeReport};
use slipstream_proxy::{server, AppState, Config};

/// Scripted behavior of one mock backend.
pub struct BackendControl {
    /// Status string reported on `/health`.
    pub health_status: Mutex<String>,
    /// When set, `/health` answers HTTP 500.
    pub health_fails: AtomicBool,
    /// When set, `/health` omits slot counts (new-style backend).
    pub health_without_slots: AtomicBool,
    /// When set, `/slots` answers HTTP 500.
    pub slots_fails: AtomicBool,
    /// Idle slots reported by `/health` or `/slots`.
    pub slots_idle: AtomicU32,
    /// Busy slots reported by `/health` or `/slots`.
    pub slots_processing: AtomicU32,
    /// Status code for completion responses.
    pub completion_status: AtomicU16,
    /// Artificial completion latency in milliseconds.
    pub completion_delay_ms: AtomicU64,
    /// Completion requests served so far.
    pub completion_hits: AtomicU32,
    /// Body returned from completion responses.
    pub completion_body: Mutex<String>,
}

impl Default for BackendControl {
    fn default() -> Self {
        Self {
            health_status: Mutex::new("ok".to_string()),
            health_fails: AtomicBool::new(false),
            health_without_slots: AtomicBool::new(false),
            slots_fails: AtomicBool::new(false),
            slots_idle: AtomicU32::new(1),
            slots_processing: AtomicU32::new(0),
            completion_status: AtomicU16::new(200),
            completion_delay_ms: AtomicU64::new(0),
            completion_hits: AtomicU32::new(0),
            completion_body: Mutex::new(r#"{"content":"done"}"#.to_string()),
        }
    }
}

impl BackendControl {
    /// Completion requests observed so far.
    pub fn hits(&self) -> u32 {
        self.completion_hits.load(Ordering::SeqCst)
    }
}

/// Starts a scripted backend; returns its base URL.
pub async fn spawn_backend(control: Arc<BackendControl>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let control = Arc::clone(&control);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let control = Arc::clone(&control);
                    async move { handle(control, req).await }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    format!("http://{addr}")
}

async fn handle(
    control: Arc<BackendControl>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/health" => {
            if control.health_fails.load(Ordering::SeqCst) {
                plain(StatusCode::INTERNAL_SERVER_ERROR, "")
            } else {
                let status = control.health_status.lock().unwrap().clone();
                let body = if control.health_without_slots.load(Ordering::SeqCst) {
                    format!(r#"{{"status":"{status}"}}"#)
                } else {
                    format!(
                        r#"{{"status":"{status}","slots_idle":{},"slots_processing":{}}}"#,
                        control.slots_idle.load(Ordering::SeqCst),
                        control.slots_processing.load(Ordering::SeqCst),
                    )
                };
                json(StatusCode::OK, body)
            }
        }
        "/slots" => {
            if control.slots_fails.load(Ordering::SeqCst) {
                plain(StatusCode::INTERNAL_SERVER_ERROR, "")
            } else {
                let idle = control.slots_idle.load(Ordering::SeqCst);
                let busy = control.slots_processing.load(Ordering::SeqCst);
                let slots: Vec<String> = (0..idle)
                    .map(|_| r#"{"state":0}"#.to_string())
                    .chain((0..busy).map(|_| r#"{"state":1}"#.to_string()))
                    .collect();
                json(StatusCode::OK, format!("[{}]", slots.join(",")))
            }
        }
        _ => {
            control.completion_hits.fetch_add(1, Ordering::SeqCst);
            let delay = control.completion_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let status = StatusCode::from_u16(control.completion_status.load(Ordering::SeqCst))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = control.completion_body.lock().unwrap().clone();
            json(status, body)
        }
    };
    Ok(response)
}

fn plain(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn json(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Configuration tuned for fast tests: probes always due, generous rate
/// limit, short queue timeout.
pub fn test_config() -> Config {
    Config {
        request_limit_per_second: 1000,
        queue_timeout_seconds: 2,
        health_check_interval_seconds: 1,
        probe_min_age_ms: 0,
        probe_timeout_seconds: 2,
        upstream_timeout_seconds: 10,
        ..Config::default()
    }
}

/// Builds engine state around an in-memory store.
pub fn test_state(config: Config) -> Arc<AppState> {
    AppState::new(config, Arc::new(MemoryStore::new()))
}

/// Registers a node with an observed idle capacity, bypassing the
/// registration workflow.
pub fn add_node(state: &Arc<AppState>, url: &str, idle: u32) -> Arc<Node> {
    let node = Arc::new(Node::new(url));
    node.apply_probe(
        &ProbeReport {
            status: HealthStatus::Ok,
            slots_idle: idle,
            slots_processing: 0,
        },
        true,
    );
    state.registry.insert(Arc::clone(&node));
    node
}

/// Binds the engine's HTTP surface; returns its base URL.
pub async fn start_gateway(state: Arc<AppState>) -> String {
    let (addr, _handle) = server::bind(state).await.unwrap();
    format!("http://{addr}")
}
