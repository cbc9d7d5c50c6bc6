//! Outbound HTTP client.
//!
//! One client serves every upstream call the engine makes: forwarded
//! completions, health and capacity probes, and the registration
//! fingerprint probe. Idle connections are parked in the lock-free pool
//! and revived on the next call to the same authority.

use hyper::body::{Body, Bytes, Incoming};
use hyper::client::conn::http1;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderValue, HOST};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use http_body_util::{BodyExt, Full};
use std::time::Duration;
use tokio::net::TcpStream;

use slipstream_core::{Error, Result};

use crate::connection_pool::pool::OutboundBody;
use crate::connection_pool::ConnectionPool;

/// Largest response body the engine will buffer for its own consumption
/// (probe and registration payloads, not proxied completions).
const MAX_BUFFERED_BODY_BYTES: u64 = 1024 * 1024;

/// Shared outbound HTTP/1.1 client with connection reuse.
#[derive(Debug, Default)]
pub struct UpstreamClient {
    pool: ConnectionPool,
}

impl UpstreamClient {
    /// Creates a client with an empty connection pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a request to an absolute `http://` URL.
    ///
    /// Headers are forwarded as given except `Host`, which is rewritten
    /// for the target authority. Transport-level failures map to
    /// [`Error::Unreachable`]; an elapsed `timeout` maps to
    /// [`Error::Http`].
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<Response<Incoming>> {
        let uri: Uri = url
            .parse()
            .map_err(|err| Error::http(format!("invalid upstream url {url}: {err}")))?;

        let authority = uri
            .authority()
            .ok_or_else(|| Error::http(format!("upstream url {url} has no authority")))?
            .clone();
        if uri.scheme_str().is_some_and(|scheme| scheme != "http") {
            return Err(Error::http(format!("unsupported upstream scheme in {url}")));
        }

        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut request = Request::builder()
            .method(method)
            .uri(path_and_query)
            .body(Full::new(body))
            .map_err(Error::http)?;
        for (name, value) in headers {
            if name != &HOST {
                request.headers_mut().append(name.clone(), value.clone());
            }
        }
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|err| Error::http(format!("invalid authority {authority}: {err}")))?;
        request.headers_mut().insert(HOST, host);

        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(80);
        let key = authority.as_str();
        let mut sender = match self.pool.try_pop(key) {
            Some(sender) => sender,
            None => self.connect(url, &host, port, timeout).await?,
        };

        let unreachable = |err: hyper::Error| Error::Unreachable {
            url: url.to_string(),
            message: err.to_string(),
        };

        let send = async {
            sender.ready().await.map_err(unreachable)?;
            sender.send_request(request).await.map_err(unreachable)
        };

        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| Error::http(format!("request to {url} timed out")))??;

        self.pool.push(key, sender);
        Ok(response)
    }

    /// Issues a bare `GET` with no headers or body.
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<Response<Incoming>> {
        self.request(Method::GET, url, &HeaderMap::new(), Bytes::new(), timeout)
            .await
    }

    /// Issues a `POST` with a JSON payload.
    pub async fn post_json(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Response<Incoming>> {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            hyper::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        self.request(
            Method::POST,
            url,
            &headers,
            Bytes::from(payload.to_string()),
            timeout,
        )
        .await
    }

    /// Buffers a response body the engine itself needs to inspect.
    pub async fn read_body(response: Response<Incoming>) -> Result<Bytes> {
        let body = response.into_body();
        if body
            .size_hint()
            .upper()
            .is_some_and(|upper| upper > MAX_BUFFERED_BODY_BYTES)
        {
            return Err(Error::http("upstream body too large to buffer"));
        }
        let collected = body
            .collect()
            .await
            .map_err(|err| Error::http(format!("reading upstream body: {err}")))?;
        Ok(collected.to_bytes())
    }

    async fn connect(
        &self,
        url: &str,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<SendRequest<OutboundBody>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Unreachable {
                url: url.to_string(),
                message: "connect timed out".to_string(),
            })?
            .map_err(|err| Error::Unreachable {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| Error::Unreachable {
                url: url.to_string(),
                message: format!("handshake failed: {err}"),
            })?;

        tokio::task::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "upstream connection ended");
            }
        });

        Ok(sender)
    }
}
