//! HTTP reverse proxy onto loopback workers.

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::warn;

use crate::{error::ApiError, tunnel};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Connection-scoped headers never forwarded in either direction.
pub const HOP_BY_HOP: [&str; 10] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any the `Connection` header names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn localhost_target(target: &str) -> Result<reqwest::Url, ApiError> {
    let url = reqwest::Url::parse(target)
        .map_err(|e| ApiError::bad_request(format!("invalid proxy target {target:?}: {e}")))?;
    if url.host_str() != Some("localhost") {
        return Err(ApiError::bad_request(
            "proxy target must be localhost",
        ));
    }
    Ok(url)
}

/// Target URL for `path_and_query` on the worker listening on `port`.
pub fn worker_target(port: u16, path_and_query: &str) -> String {
    format!("http://localhost:{port}{path_and_query}")
}

pub fn path_and_query(req: &Request) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

fn into_response(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let mut headers = resp.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut out = Response::new(Body::from_stream(resp.bytes_stream()));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

/// Forwards `req` to `target` and streams the reply back. WebSocket upgrade
/// requests are handed to the raw tunnel instead.
pub async fn proxy_to_url(client: &reqwest::Client, target: &str, req: Request) -> Response {
    let url = match localhost_target(target) {
        Ok(url) => url,
        Err(e) => return e.into_response(),
    };
    if tunnel::is_websocket_upgrade(req.headers()) {
        return tunnel::tunnel_websocket(&url, req).await;
    }

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => return ApiError::bad_request(format!("read request body: {e}")).into_response(),
    };
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    match client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(resp) => into_response(resp),
        Err(e) => {
            warn!(%target, error = %e, "proxy request failed");
            ApiError::bad_gateway(format!("proxy error: {e}")).into_response()
        }
    }
}

/// POSTs a JSON command to a worker's `/tab` endpoint and relays the reply.
/// `query` and the end-to-end `headers` of the inbound request ride along;
/// the body and its content type are always the command.
pub async fn post_tab_command(
    client: &reqwest::Client,
    port: u16,
    query: Option<&str>,
    mut headers: HeaderMap,
    command: &Value,
) -> Response {
    let mut target = worker_target(port, "/tab");
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(q);
    }
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::CONTENT_TYPE);

    match client.post(&target).headers(headers).json(command).send().await {
        Ok(resp) => into_response(resp),
        Err(e) => {
            warn!(%target, error = %e, "tab command failed");
            ApiError::bad_gateway(format!("proxy error: {e}")).into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::{HeaderValue, StatusCode};

    use super::*;

    #[test]
    fn strips_standard_and_named_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("example"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        let left: Vec<&str> = headers.keys().map(|k| k.as_str()).collect();
        assert_eq!(headers.len(), 2, "{left:?}");
        assert!(headers.contains_key(header::AUTHORIZATION));
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[tokio::test]
    async fn rejects_non_localhost_targets() {
        let req = Request::new(Body::empty());
        let resp = proxy_to_url(&reqwest::Client::new(), "http://example.com/x", req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = Request::new(Body::empty());
        let resp = proxy_to_url(&reqwest::Client::new(), "http://127.0.0.1:1/x", req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unreachable_worker_is_bad_gateway() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let req = Request::new(Body::empty());
        let resp = proxy_to_url(
            &reqwest::Client::new(),
            &worker_target(port, "/snapshot"),
            req,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
