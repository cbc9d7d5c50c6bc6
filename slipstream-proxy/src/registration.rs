//! Node registration endpoints.
//!
//! A candidate backend joins the pool only after answering its health
//! probe with an accepted status and passing the model-fingerprint gate.
//! Response texts and status codes form the registration API contract.

use hyper::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use slipstream_admin::verify::{probe_request_body, verify_completion_body};
use slipstream_core::domain::node::{normalize_url, Node};
use slipstream_core::{Error, Result};

use crate::client::UpstreamClient;
use crate::health_check::probe::probe_node;
use crate::{text_response, AppState, ResponseBody};

#[derive(Deserialize)]
struct NodeRequest {
    url: Option<String>,
}

enum ParsedUrl {
    Url(String),
    Rejection(hyper::Response<ResponseBody>),
}

fn parse_url_field(body: &[u8]) -> ParsedUrl {
    match serde_json::from_slice::<NodeRequest>(body) {
        Ok(NodeRequest { url: Some(url) }) if !url.is_empty() => {
            ParsedUrl::Url(normalize_url(url))
        }
        Ok(_) => ParsedUrl::Rejection(text_response(
            StatusCode::BAD_REQUEST,
            "Missing URL in request body",
        )),
        Err(_) => ParsedUrl::Rejection(text_response(
            StatusCode::BAD_REQUEST,
            "Invalid JSON in request body",
        )),
    }
}

/// Handles `POST /register-node`.
///
/// The health probe gates admission; the fingerprint probe gates model
/// identity. Both run once, here — never per-request.
pub async fn register_node(state: &Arc<AppState>, body: &[u8]) -> hyper::Response<ResponseBody> {
    let url = match parse_url_field(body) {
        ParsedUrl::Url(url) => url,
        ParsedUrl::Rejection(response) => return response,
    };

    let report = match probe_node(&state.client, &url, state.config.probe_timeout()).await {
        Ok(report) => report,
        Err(Error::UnhealthyBackend { .. }) => {
            return text_response(StatusCode::BAD_REQUEST, "Node not available");
        }
        Err(err) => {
            warn!(node = %url, error = %err, "registration health probe failed");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error checking node availability",
            );
        }
    };

    if !report.status.accepted() {
        return text_response(StatusCode::BAD_REQUEST, "Node not available");
    }

    let verified = verify_model(state, &url).await.unwrap_or(false);
    if !verified {
        info!(node = %url, "registration rejected: model verification failed");
        return text_response(StatusCode::BAD_REQUEST, "Node not available");
    }

    let node = Arc::new(Node::new(url.clone()));
    node.apply_probe(&report, true);
    if state.registry.insert(node) {
        if let Err(err) = state.persist_registry().await {
            warn!(node = %url, error = %err, "failed to persist registry after registration");
        }
        info!(node = %url, slots = report.slots_idle, "node registered");
    }

    text_response(StatusCode::OK, "Node registered successfully")
}

/// Handles `POST /verify-node`: is this URL registered?
pub async fn verify_node(state: &Arc<AppState>, body: &[u8]) -> hyper::Response<ResponseBody> {
    let url = match parse_url_field(body) {
        ParsedUrl::Url(url) => url,
        ParsedUrl::Rejection(response) => return response,
    };

    if state.registry.contains(&url) {
        text_response(StatusCode::OK, "Node exists")
    } else {
        text_response(StatusCode::NOT_FOUND, "Node not found")
    }
}

/// Handles `POST /delete-node`.
pub async fn delete_node(state: &Arc<AppState>, body: &[u8]) -> hyper::Response<ResponseBody> {
    let url = match parse_url_field(body) {
        ParsedUrl::Url(url) => url,
        ParsedUrl::Rejection(response) => return response,
    };

    state.registry.remove(&url);
    if let Err(err) = state.store.remove_one(&url).await {
        warn!(node = %url, error = %err, "failed to remove node from store");
    }
    info!(node = %url, "node deleted");
    text_response(StatusCode::OK, "Node deleted")
}

async fn verify_model(state: &Arc<AppState>, url: &str) -> Result<bool> {
    let response = state
        .client
        .post_json(
            &format!("{url}/completion"),
            &probe_request_body(),
            state.config.probe_timeout(),
        )
        .await?;

    if !response.status().is_success() {
        return Ok(false);
    }

    let body = UpstreamClient::read_body(response).await?;
    verify_completion_body(&body)
}
