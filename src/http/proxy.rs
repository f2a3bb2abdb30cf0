//! Cross-node request forwarding
//!
//! When a request carries a session owned by another node, the raw HTTP
//! exchange is piped there: method, filtered headers, and body bytes go out;
//! status, headers, and the body stream come back untouched. If the target
//! fails before any byte was flushed the client gets a 502; mid-stream
//! failures terminate the stream.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::TryStreamExt;
use once_cell::sync::Lazy;

use crate::HubError;

/// Infallible extractor for the connecting client's socket address.
///
/// Reads the `ConnectInfo` the server install plants in request extensions;
/// absent under `tower::ServiceExt::oneshot` in tests, hence the Option.
pub struct ClientAddr(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        async move { Ok(ClientAddr(addr)) }
    }
}

// connection-scoped headers never cross the hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

static PROXY_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("proxy client")
});

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// The outgoing `x-forwarded-for` chain: the client's address appended to
/// whatever an earlier proxy tier already recorded
fn forwarded_for(headers: &HeaderMap, client: Option<SocketAddr>) -> Option<String> {
    let upstream_chain = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match (upstream_chain, client) {
        (Some(chain), Some(client)) => Some(format!("{}, {}", chain, client.ip())),
        (Some(chain), None) => Some(chain),
        (None, Some(client)) => Some(client.ip().to_string()),
        (None, None) => None,
    }
}

/// Forward a request verbatim to the owning node's base URL + original path
pub async fn forward(
    node_base_url: &str,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Bytes,
    local_host: &str,
    client: Option<SocketAddr>,
) -> Response {
    let target = format!("{}{}", node_base_url.trim_end_matches('/'), path_and_query);
    tracing::debug!(target = %target, "forwarding request to session owner");

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            return HubError::cluster(format!("unsupported method {}", method)).into_proxy_response();
        }
    };

    let mut request = PROXY_CLIENT.request(reqwest_method, &target);
    for (name, value) in headers {
        // the x-forwarded-for chain is rebuilt below with the client appended
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("x-forwarded-for") {
            continue;
        }
        request = request.header(name.as_str(), value.as_bytes());
    }
    request = request
        .header("x-forwarded-host", local_host)
        .header("x-forwarded-proto", "http");
    if let Some(chain) = forwarded_for(headers, client) {
        request = request.header("x-forwarded-for", chain);
    }

    let upstream = match request.body(body).send().await {
        Ok(response) => response,
        Err(e) => {
            // nothing was flushed yet, a clean 502 is still possible
            return HubError::cluster(format!("failed to reach session owner: {}", e))
                .into_proxy_response();
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }

    let stream = upstream
        .bytes_stream()
        .map_err(|e| std::io::Error::other(e.to_string()));

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

impl HubError {
    fn into_proxy_response(self) -> Response {
        tracing::warn!("cluster proxy error: {}", self);
        (
            StatusCode::BAD_GATEWAY,
            axum::Json(serde_json::json!({
                "error": "bad_gateway",
                "error_description": self.to_string(),
            })),
        )
            .into_response()
    }
}
