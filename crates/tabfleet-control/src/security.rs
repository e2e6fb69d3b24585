use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn incoming_request_id(req: &Request<Body>) -> Option<String> {
    let raw = req.headers().get(REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    if raw.is_empty() || raw.len() > 128 {
        return None;
    }
    Some(raw.to_string())
}

// Middleware: tags every request with an id, runs it inside a span carrying
// that id and echoes it back on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let id = incoming_request_id(&req).unwrap_or_else(|| Uuid::new_v4().to_string());
    let span = info_span!(
        "http",
        method = %req.method(),
        path = %req.uri().path(),
        request_id = %id,
    );
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut resp = next.run(req).instrument(span.clone()).await;
    span.in_scope(|| debug!(status = resp.status().as_u16(), "request done"));
    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}
