//! Request dispatch: reserve, forward, record, release, retry.
//!
//! A reservation is taken before the outbound call and travels with the
//! response: releasing it — on success, failure, cancellation, or stream
//! completion — always runs the queue drain, so parked requests wake the
//! moment capacity frees up.

use hyper::body::{Body, Bytes, Frame};
use hyper::header::HeaderValue;
use hyper::{HeaderMap, Method, Response, StatusCode};
use http_body_util::BodyExt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, info, warn};

use slipstream_core::admission::queue::AdmissionQueue;
use slipstream_core::domain::node::SharedNode;
use slipstream_core::domain::registry::NodeRegistry;
use slipstream_core::load_balancer::selector::select_with_capacity_excluding;
use slipstream_core::Error;

use crate::{text_response, AppState, ResponseBody};

/// Header added to forwarded requests with the allocated slot count.
pub const ALLOCATED_SLOTS_HEADER: &str = "x-allocated-slots";

/// A buffered inbound request ready to be forwarded, replayable for the
/// retry attempt.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    /// Original request method.
    pub method: Method,
    /// Original path and query, appended to the node URL.
    pub path_and_query: String,
    /// Original headers, forwarded verbatim.
    pub headers: HeaderMap,
    /// Buffered request body.
    pub body: Bytes,
    /// Slots this request occupies for its duration.
    pub required_slots: u32,
}

/// Slots held on a node for one dispatch attempt.
///
/// Dropping the reservation releases the slots and drains the admission
/// queue — every exit path, including panics and cancelled futures, goes
/// through here.
pub struct SlotReservation {
    node: SharedNode,
    slots: u32,
    queue: Arc<AdmissionQueue>,
    registry: Arc<NodeRegistry>,
}

impl SlotReservation {
    /// Wraps slots already reserved on `node` (by the admission gate or a
    /// queue drain).
    pub fn new(
        node: SharedNode,
        slots: u32,
        queue: Arc<AdmissionQueue>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        Self {
            node,
            slots,
            queue,
            registry,
        }
    }

    /// The node the slots are held on.
    pub fn node(&self) -> &SharedNode {
        &self.node
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.node.release(self.slots);
        self.queue.drain(&self.registry);
    }
}

impl std::fmt::Debug for SlotReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotReservation")
            .field("node", &self.node.url())
            .field("slots", &self.slots)
            .finish()
    }
}

/// Response body that holds its slot reservation until fully streamed.
struct GuardedBody {
    inner: ResponseBody,
    _reservation: SlotReservation,
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

/// Outcome of a single dispatch attempt.
enum AttemptOutcome {
    /// 2xx from the backend; the response streams the reservation.
    Success(Response<ResponseBody>),
    /// Non-2xx from the backend, carried for verbatim passthrough.
    UpstreamFailure(Response<ResponseBody>),
    /// Transport-level failure; there is no backend response.
    TransportFailure,
}

/// Forwards a request on an already-reserved node, retrying once.
///
/// If the first attempt does not succeed, exactly one more attempt runs
/// against a freshly selected node excluding the one just tried. The
/// client sees the proxied success, the final backend failure verbatim,
/// or a synthesized 503 when no backend answered at all.
pub async fn dispatch_with_retry(
    state: &Arc<AppState>,
    reservation: SlotReservation,
    request: &ProxiedRequest,
) -> Response<ResponseBody> {
    let first_url = reservation.node().url().to_string();

    let first_failure = match attempt(state, reservation, request).await {
        AttemptOutcome::Success(response) => return response,
        AttemptOutcome::UpstreamFailure(response) => Some(response),
        AttemptOutcome::TransportFailure => None,
    };

    let Some(retry) = reserve_excluding(state, request.required_slots, &first_url) else {
        debug!(excluded = %first_url, "no alternative node for retry");
        return first_failure.unwrap_or_else(no_backend_response);
    };

    info!(
        failed = %first_url,
        retry = %retry.node().url(),
        "retrying request on a different node"
    );

    match attempt(state, retry, request).await {
        AttemptOutcome::Success(response) => response,
        AttemptOutcome::UpstreamFailure(response) => response,
        AttemptOutcome::TransportFailure => first_failure.unwrap_or_else(no_backend_response),
    }
}

/// Reserves capacity on the best node other than `exclude_url`.
fn reserve_excluding(
    state: &Arc<AppState>,
    required_slots: u32,
    exclude_url: &str,
) -> Option<SlotReservation> {
    for _ in 0..4 {
        let node = select_with_capacity_excluding(&state.registry, required_slots, exclude_url)?;
        if node.try_reserve(required_slots) {
            return Some(SlotReservation::new(
                node,
                required_slots,
                Arc::clone(&state.queue),
                Arc::clone(&state.registry),
            ));
        }
        // Lost the reservation race; reselect against fresh state.
    }
    None
}

async fn attempt(
    state: &Arc<AppState>,
    reservation: SlotReservation,
    request: &ProxiedRequest,
) -> AttemptOutcome {
    let node = Arc::clone(reservation.node());
    let url = format!("{}{}", node.url(), request.path_and_query);

    let mut headers = request.headers.clone();
    if let Ok(value) = HeaderValue::from_str(&request.required_slots.to_string()) {
        headers.insert(ALLOCATED_SLOTS_HEADER, value);
    }

    let started = Instant::now();
    let result = state
        .client
        .request(
            request.method.clone(),
            &url,
            &headers,
            request.body.clone(),
            state.config.upstream_timeout(),
        )
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            node.record_success(latency_ms);
            debug!(node = %node.url(), latency_ms, "dispatch succeeded");
            AttemptOutcome::Success(stream_with_reservation(response, reservation))
        }
        Ok(response) => {
            let status = response.status();
            let failures = node.record_dispatch_failure();
            warn!(
                node = %node.url(),
                %status,
                failures,
                "backend answered with a failure status"
            );
            AttemptOutcome::UpstreamFailure(stream_with_reservation(response, reservation))
        }
        Err(Error::Unreachable { url, message }) => {
            // An unreachable URL can never serve traffic again without
            // external reconfiguration; evict instead of penalizing.
            warn!(node = %node.url(), %message, "node unreachable, evicting");
            state.registry.remove(node.url());
            if let Err(err) = state.store.remove_one(node.url()).await {
                warn!(node = %url, error = %err, "failed to remove node from store");
            }
            drop(reservation);
            AttemptOutcome::TransportFailure
        }
        Err(err) => {
            let failures = node.record_dispatch_failure();
            warn!(node = %node.url(), error = %err, failures, "dispatch failed");
            drop(reservation);
            AttemptOutcome::TransportFailure
        }
    }
}

/// Ties the reservation's lifetime to the streamed upstream body.
fn stream_with_reservation(
    response: Response<hyper::body::Incoming>,
    reservation: SlotReservation,
) -> Response<ResponseBody> {
    let (parts, body) = response.into_parts();
    let guarded = GuardedBody {
        inner: body.boxed(),
        _reservation: reservation,
    };
    Response::from_parts(parts, guarded.boxed())
}

/// Synthesized response when neither attempt produced a backend answer.
fn no_backend_response() -> Response<ResponseBody> {
    text_response(StatusCode::SERVICE_UNAVAILABLE, "No nodes available")
}
