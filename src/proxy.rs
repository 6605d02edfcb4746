//! One reverse-proxy round trip: filter headers, stream the request body to
//! the backend and stream the backend's response back.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::text_response;
use crate::server::ResponseBody;

/// Connection-management headers, never forwarded in either direction
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const POOL_MAX_IDLE_PER_HOST: usize = 32;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Pooled HTTP client forwarding requests to backends
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client<HttpConnector, Incoming>,
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseProxy {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Self { client }
    }

    /// Forward `req` to `destination` and return the backend's response.
    ///
    /// Failure to build or send the request yields a plain-text 500; no
    /// retry is attempted. Once the backend's headers have arrived, body
    /// errors only truncate the stream already being sent to the caller.
    pub async fn forward(&self, req: Request<Incoming>, destination: &str) -> Response<ResponseBody> {
        let outbound = match build_outbound(req, destination) {
            Ok(outbound) => outbound,
            Err(message) => {
                warn!(destination, error = %message, "Failed to build backend request");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, message);
            }
        };

        let method = outbound.method().clone();
        match self.client.request(outbound).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                debug!(destination, %method, status = %parts.status, "Proxied request");
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(destination, %method, error = %e, "Failed to forward request");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

fn build_outbound(req: Request<Incoming>, destination: &str) -> Result<Request<Incoming>, String> {
    let uri: Uri = destination
        .parse()
        .map_err(|e| format!("invalid destination {}: {}", destination, e))?;
    if uri.scheme_str() != Some("http") || uri.authority().is_none() {
        return Err(format!("unsupported destination {}", destination));
    }

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    // The client derives Host from the destination.
    headers.remove(HOST);

    let mut outbound = Request::builder()
        .method(parts.method)
        .uri(uri)
        .body(body)
        .map_err(|e| e.to_string())?;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

/// Remove the fixed hop-by-hop set plus any header the `Connection` header
/// names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
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
    fn test_strip_fixed_hop_by_hop_set() {
        let mut headers = HeaderMap::new();
        for name in HOP_BY_HOP_HEADERS {
            headers.insert(name, HeaderValue::from_static("x"));
        }
        headers.insert("x-test", HeaderValue::from_static("1"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-test").unwrap(), "1");
    }

    #[test]
    fn test_strip_headers_named_by_connection() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Secret"));
        headers.insert("x-secret", HeaderValue::from_static("hunter2"));
        headers.append("x-test", HeaderValue::from_static("1"));
        headers.append("x-test", HeaderValue::from_static("2"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("x-secret").is_none());
        assert!(headers.get(CONNECTION).is_none());
        let values: Vec<_> = headers.get_all("x-test").iter().collect();
        assert_eq!(values, vec!["1", "2"]);
    }
}
