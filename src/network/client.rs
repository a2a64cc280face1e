//! HTTP client for forwarding requests to origin servers

use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::config::CASCADE_HEADER;
use crate::{ProxyError, Result};

/// Headers that only describe one hop and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client for the origin side of the proxy
#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Option<Duration>,
}

impl OriginClient {
    /// Create a client; a zero timeout disables the origin timeout
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build_http();

        Self {
            client,
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        }
    }

    /// Send a request and return as soon as the response head arrives
    ///
    /// The body is left streaming so the caller can time it.
    ///
    /// # Errors
    ///
    /// Returns `Upstream` if the origin cannot be reached, times out, or
    /// the request cannot be built
    pub async fn forward(&self, request: ForwardRequest) -> Result<Response<Incoming>> {
        debug!("Forwarding {} to {}", request.method, request.uri);

        let mut builder = Request::builder()
            .method(request.method)
            .uri(request.uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers;
        }
        let http_request = builder
            .body(Full::new(request.body))
            .map_err(|e| ProxyError::Upstream(format!("Failed to build request: {e}")))?;

        let pending = self.client.request(http_request);
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                warn!("Origin did not answer within {:?}", limit);
                ProxyError::Upstream(format!("Origin timed out after {limit:?}"))
            })?,
            None => pending.await,
        };

        response.map_err(|e| {
            warn!("Request failed: {e}");
            ProxyError::Upstream(format!("Request failed: {e}"))
        })
    }

    #[cfg(test)]
    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Default for OriginClient {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Request to be forwarded
#[derive(Debug)]
pub struct ForwardRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute origin URI
    pub uri: Uri,
    /// Headers, hop-by-hop ones already removed
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

impl ForwardRequest {
    /// Build a forward request from the client's request parts
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` if `url` is not a valid URI
    pub fn new(method: Method, url: &str, mut headers: HeaderMap, body: Bytes) -> Result<Self> {
        let uri = url.parse::<Uri>().map_err(|e| ProxyError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        strip_hop_by_hop(&mut headers);
        headers.remove(CASCADE_HEADER);

        Ok(Self {
            method,
            uri,
            headers,
            body,
        })
    }
}

/// Remove hop-by-hop headers, including any named by `connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic abc"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["accept"], "*/*");
    }

    #[test]
    fn test_forward_request_drops_cascade_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CASCADE_HEADER, HeaderValue::from_static("a,b"));
        headers.insert("host", HeaderValue::from_static("example.com"));

        let request = ForwardRequest::new(
            Method::GET,
            "http://example.com/a?b=1",
            headers,
            Bytes::new(),
        )
        .unwrap();

        assert_eq!(request.uri.path(), "/a");
        assert!(request.headers.get(CASCADE_HEADER).is_none());
        assert_eq!(request.headers["host"], "example.com");
    }

    #[test]
    fn test_forward_request_invalid_url() {
        let result = ForwardRequest::new(Method::GET, "http://exa mple.com/", HeaderMap::new(), Bytes::new());
        assert!(matches!(result, Err(ProxyError::InvalidUrl { .. })));
    }

    #[test]
    fn test_timeout_setting() {
        assert_eq!(OriginClient::new(0).timeout(), None);
        assert_eq!(OriginClient::new(250).timeout(), Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_upstream_error() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = OriginClient::default();
        let request = ForwardRequest::new(
            Method::GET,
            &format!("http://{addr}/"),
            HeaderMap::new(),
            Bytes::new(),
        )
        .unwrap();

        let err = client.forward(request).await.unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(_)));
    }
}
