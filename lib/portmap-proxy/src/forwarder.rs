//! HTTP request/response forwarding to mapped pod services

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

use portmap_core::{CoreError, Result};

/// HTTP request forwarder for proxying requests to pod services, with
/// connection pooling and timeout support.
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    /// Create a new forwarder; `timeout` bounds both connect and the
    /// whole upstream exchange.
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    /// Forward a request to `target_url` and relay the upstream
    /// response.
    ///
    /// The body is passed through byte-for-byte. Hop-by-hop headers
    /// (plus `Host` and `Content-Length` on the request side) are
    /// stripped in both directions; everything else, cookies and
    /// authorization included, is forwarded verbatim.
    pub async fn forward<B>(
        &self,
        target_url: &str,
        request: Request<B>,
    ) -> Result<Response<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        debug!("Forwarding request to: {}", target_url);

        let uri: Uri = target_url
            .parse()
            .map_err(|e| CoreError::BadGateway(format!("invalid upstream target: {}", e)))?;

        let (mut parts, body) = request.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| CoreError::InvalidArgument(format!("failed to read request body: {}", e)))?
            .to_bytes();

        parts.headers = filter_request_headers(&parts.headers);
        parts.uri = uri;

        let forwarded = Request::from_parts(parts, Full::new(body_bytes));

        let response = match tokio_timeout(self.timeout, self.client.request(forwarded)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Upstream request error: {}", e);
                return Err(CoreError::BadGateway(e.to_string()));
            }
            Err(_) => {
                warn!("Upstream request timeout after {:?}", self.timeout);
                return Err(CoreError::GatewayTimeout);
            }
        };

        debug!("Upstream responded with status: {}", response.status());

        let (mut parts, body) = response.into_parts();
        let response_bytes = body
            .collect()
            .await
            .map_err(|e| CoreError::BadGateway(format!("failed to read upstream body: {}", e)))?
            .to_bytes();
        parts.headers = filter_response_headers(&parts.headers);

        Ok(Response::from_parts(parts, response_bytes))
    }
}

/// Hop-by-hop headers, never forwarded in either direction.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// Request headers sent upstream: hop-by-hop set dropped, plus `Host`
/// (the client re-derives it from the target URI).
pub fn filter_request_headers(headers: &HeaderMap<HeaderValue>) -> HeaderMap<HeaderValue> {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_lowercase();
        if is_hop_by_hop_header(&lower) || lower == "host" {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Response headers relayed to the caller: hop-by-hop set dropped.
pub fn filter_response_headers(headers: &HeaderMap<HeaderValue>) -> HeaderMap<HeaderValue> {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop_header(&name.as_str().to_lowercase()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}
