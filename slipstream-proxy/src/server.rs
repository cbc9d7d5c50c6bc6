//! Server module for handling incoming connections and request routing.

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use http_body_util::BodyExt;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use slipstream_core::{Error, Result};

use crate::{admission, registration, text_response, AppState, ResponseBody};

/// Binds the listener and spawns the accept loop.
///
/// Returns the bound address (useful with port 0) and the server task
/// handle.
pub async fn bind(state: Arc<AppState>) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(state.config.listen_addr)
        .await
        .map_err(|err| Error::http(format!("bind {}: {err}", state.config.listen_addr)))?;
    let addr = listener
        .local_addr()
        .map_err(|err| Error::http(format!("local_addr: {err}")))?;

    info!(%addr, "listening");
    let handle = tokio::spawn(accept_loop(listener, state));
    Ok((addr, handle))
}

/// Starts the proxy server and serves until the process exits.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let (_addr, handle) = bind(state).await?;
    handle
        .await
        .map_err(|err| Error::http(format!("server task failed: {err}")))
}

async fn accept_loop(listener: TcpListener, state: Arc<AppState>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        let state = Arc::clone(&state);
        tokio::task::spawn(async move {
            let io = TokioIo::new(stream);
            let client_ip = remote.ip();
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move {
                    Ok::<_, std::convert::Infallible>(route(state, client_ip, req).await)
                }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %err, "error serving connection");
            }
        });
    }
}

/// Routes one request to its handler.
pub async fn route(
    state: Arc<AppState>,
    client_ip: IpAddr,
    req: Request<Incoming>,
) -> Response<ResponseBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (_, "/completion" | "/completions" | "/v1/chat/completions") => {
            admission::handle_completion(state, client_ip, req).await
        }
        (Method::POST, "/register-node") => match collect_body(req).await {
            Ok(body) => registration::register_node(&state, &body).await,
            Err(response) => response,
        },
        (Method::POST, "/verify-node") => match collect_body(req).await {
            Ok(body) => registration::verify_node(&state, &body).await,
            Err(response) => response,
        },
        (Method::POST, "/delete-node") => match collect_body(req).await {
            Ok(body) => registration::delete_node(&state, &body).await,
            Err(response) => response,
        },
        (Method::GET, "/health") => aggregate_health(&state),
        _ => text_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

/// Pool-wide health view: summed observed capacity over all available
/// nodes.
fn aggregate_health(state: &Arc<AppState>) -> Response<ResponseBody> {
    let nodes = state.registry.snapshot();

    let mut slots_idle: u64 = 0;
    let mut slots_processing: u64 = 0;
    for node in nodes.iter().filter(|node| node.is_available()) {
        slots_idle += u64::from(node.free_slots());
        slots_processing +=
            u64::from(node.slots_processing()) + u64::from(node.active_connections());
    }

    let status = if slots_idle > 0 {
        "ok"
    } else {
        "no slot available"
    };

    crate::json_response(
        StatusCode::OK,
        &json!({
            "status": status,
            "slots_idle": slots_idle,
            "slots_processing": slots_processing,
        }),
    )
}

async fn collect_body(
    req: Request<Incoming>,
) -> std::result::Result<hyper::body::Bytes, Response<ResponseBody>> {
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| {
            warn!(error = %err, "failed to read request body");
            text_response(StatusCode::BAD_REQUEST, "Error reading request body")
        })
}
