//! Inbound admission flow.
//!
//! A completion request passes the per-client rate limiter, then either
//! reserves capacity immediately or parks in the admission queue until a
//! drain resolves it. Clients only ever see a proxied response, a
//! rate-limit rejection, a no-nodes rejection, a queue timeout, or the
//! final backend failure after one retry.

use hyper::body::Incoming;
use hyper::{HeaderMap, Request, Response, StatusCode};
use http_body_util::BodyExt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use slipstream_core::load_balancer::selector::{select_with_affinity, select_with_capacity};

use crate::dispatcher::{dispatch_with_retry, ProxiedRequest, SlotReservation};
use crate::{text_response, AppState, ResponseBody};

/// Header naming how many slots the request needs (default 1).
pub const REQUIRED_SLOTS_HEADER: &str = "x-required-slots";

/// Header carrying the caller's segment number (default 1); queue
/// priority is the square root of the segment.
pub const SEGMENT_HEADER: &str = "x-segment";

/// Runs the full admission flow for a completion-style request.
pub async fn handle_completion(
    state: Arc<AppState>,
    client_ip: IpAddr,
    req: Request<Incoming>,
) -> Response<ResponseBody> {
    if let Err(err) = state.limiter.check(client_ip) {
        debug!(error = %err, "rate limit exceeded");
        return text_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    // Never queue when there is nothing to wait for.
    let nodes = state.registry.snapshot();
    if nodes.iter().all(|node| !node.is_available()) {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "No available nodes");
    }

    let required_slots = header_number(req.headers(), REQUIRED_SLOTS_HEADER)
        .unwrap_or(1u32)
        .max(1);
    let segment = header_number(req.headers(), SEGMENT_HEADER).unwrap_or(1u64);

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "failed to read request body");
            return text_response(StatusCode::BAD_REQUEST, "Error reading request body");
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let proxied = ProxiedRequest {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
        required_slots,
    };

    let reservation = match try_admit(&state, client_ip, segment, required_slots) {
        Some(reservation) => reservation,
        None => match wait_for_capacity(&state, segment, required_slots).await {
            Ok(reservation) => reservation,
            Err(response) => return response,
        },
    };

    dispatch_with_retry(&state, reservation, &proxied).await
}

/// Attempts an immediate reservation on the best eligible node.
fn try_admit(
    state: &Arc<AppState>,
    client_ip: IpAddr,
    segment: u64,
    required_slots: u32,
) -> Option<SlotReservation> {
    for _ in 0..4 {
        let node = if state.config.affinity {
            select_with_affinity(
                &state.registry,
                &state.affinity,
                &client_ip.to_string(),
                segment,
                required_slots,
            )
        } else {
            select_with_capacity(&state.registry, required_slots)
        }?;

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

/// Parks the request until a drain resolves it or the wait times out.
async fn wait_for_capacity(
    state: &Arc<AppState>,
    segment: u64,
    required_slots: u32,
) -> std::result::Result<SlotReservation, Response<ResponseBody>> {
    let mut wait = state.queue.enqueue(required_slots, segment);
    debug!(required_slots, segment, "request queued for capacity");

    // Capacity may have freed between the failed selection and the
    // enqueue; a drain here closes that window.
    state.queue.drain(&state.registry);

    let into_reservation = |node| {
        SlotReservation::new(
            node,
            required_slots,
            Arc::clone(&state.queue),
            Arc::clone(&state.registry),
        )
    };

    match tokio::time::timeout(state.config.queue_timeout(), &mut wait).await {
        Ok(Ok(node)) => Ok(into_reservation(node)),
        Ok(Err(_)) => Err(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No available nodes",
        )),
        Err(_) => {
            // Closing first makes the race with a concurrent drain safe:
            // later sends fail back to the drain (which releases the
            // reservation), while a resolution that landed just before
            // the deadline is claimed below instead of leaking its slots.
            wait.close();
            if let Ok(node) = wait.try_recv() {
                return Ok(into_reservation(node));
            }
            debug!(
                waited_ms = state.config.queue_timeout().as_millis() as u64,
                "gave up waiting for capacity"
            );
            Err(text_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Timed out waiting for free capacity",
            ))
        }
    }
}

fn header_number<T: FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn header_number_parses_and_defaults() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUIRED_SLOTS_HEADER, HeaderValue::from_static("3"));
        headers.insert(SEGMENT_HEADER, HeaderValue::from_static("not a number"));

        assert_eq!(
            header_number::<u32>(&headers, REQUIRED_SLOTS_HEADER),
            Some(3)
        );
        assert_eq!(header_number::<u64>(&headers, SEGMENT_HEADER), None);
        assert_eq!(header_number::<u64>(&headers, "x-absent"), None);
    }
}
