//! Raw WebSocket passthrough. The upgrade handshake is replayed to the
//! worker over a plain TCP connection and, once the worker answers `101`,
//! bytes are pumped in both directions without looking at frames.

use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, warn};

use crate::{error::ApiError, proxy::strip_hop_by_hop};

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_REJECT_BODY_BYTES: usize = 1024 * 1024;
const REJECT_BODY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
    /// Bytes that arrived after the blank line.
    leftover: Vec<u8>,
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_head(raw: &[u8]) -> anyhow::Result<(StatusCode, HeaderMap)> {
    let text = std::str::from_utf8(raw)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("malformed status line {status_line:?}"))?;
    let status = StatusCode::from_u16(code.parse()?)?;

    let mut headers = HeaderMap::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.append(
            HeaderName::from_bytes(name.trim().as_bytes())?,
            HeaderValue::from_str(value.trim())?,
        );
    }
    Ok((status, headers))
}

async fn read_head(stream: &mut TcpStream) -> anyhow::Result<ResponseHead> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("backend closed before sending a response");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let (status, headers) = parse_head(&buf[..end])?;
            return Ok(ResponseHead {
                status,
                headers,
                leftover: buf.split_off(end),
            });
        }
        if buf.len() > MAX_HEAD_BYTES {
            anyhow::bail!("backend response head exceeds {MAX_HEAD_BYTES} bytes");
        }
    }
}

fn request_head(url: &reqwest::Url, req: &Request) -> Vec<u8> {
    let mut path = url.path().to_string();
    if let Some(q) = url.query() {
        path.push('?');
        path.push_str(q);
    }
    let host = match url.port() {
        Some(port) => format!("localhost:{port}"),
        None => "localhost".to_string(),
    };

    let mut head = format!("{} {path} HTTP/1.1\r\nHost: {host}\r\n", req.method()).into_bytes();
    for (name, value) in req.headers() {
        if name == header::HOST {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

async fn read_reject_body(stream: &mut TcpStream, head: &mut ResponseHead) -> Vec<u8> {
    let mut body = std::mem::take(&mut head.leftover);
    let wanted = head
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|n| n.min(MAX_REJECT_BODY_BYTES));

    let read = async {
        let mut chunk = [0u8; 4096];
        loop {
            if wanted.is_some_and(|n| body.len() >= n) || body.len() >= MAX_REJECT_BODY_BYTES {
                break;
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
            }
        }
    };
    if tokio::time::timeout(REJECT_BODY_TIMEOUT, read).await.is_err() {
        debug!("timed out reading rejected upgrade body");
    }
    if let Some(n) = wanted {
        body.truncate(n);
    }
    body
}

/// Tunnels a WebSocket upgrade request to `url`.
pub async fn tunnel_websocket(url: &reqwest::Url, mut req: Request) -> Response {
    let Some(port) = url.port_or_known_default() else {
        return ApiError::bad_request("proxy target has no port").into_response();
    };
    let mut backend = match TcpStream::connect(("localhost", port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%url, error = %e, "websocket dial failed");
            return ApiError::bad_gateway(format!("proxy error: {e}")).into_response();
        }
    };

    if let Err(e) = backend.write_all(&request_head(url, &req)).await {
        return ApiError::bad_gateway(format!("proxy error: {e}")).into_response();
    }
    let mut head = match read_head(&mut backend).await {
        Ok(h) => h,
        Err(e) => {
            warn!(%url, error = %format!("{e:#}"), "websocket handshake failed");
            return ApiError::bad_gateway(format!("proxy error: {e:#}")).into_response();
        }
    };

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        let body = read_reject_body(&mut backend, &mut head).await;
        let mut headers = head.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        let mut out = Response::new(Body::from(body));
        *out.status_mut() = head.status;
        *out.headers_mut() = headers;
        return out;
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    let leftover = std::mem::take(&mut head.leftover);
    let target = url.to_string();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                warn!(%target, error = %e, "client upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        if !leftover.is_empty()
            && let Err(e) = client.write_all(&leftover).await
        {
            debug!(%target, error = %e, "client went away");
            return;
        }
        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok((up, down)) => debug!(%target, up, down, "websocket tunnel closed"),
            Err(e) => debug!(%target, error = %e, "websocket tunnel ended"),
        }
    });

    let mut out = Response::new(Body::empty());
    *out.status_mut() = head.status;
    *out.headers_mut() = head.headers;
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::Router;
    use tabfleet_agent::testing::serve;
    use tokio::net::TcpListener;

    use super::*;
    use crate::proxy::{proxy_to_url, worker_target};

    #[test]
    fn parses_head_and_detects_upgrade() {
        let (status, headers) =
            parse_head(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nX-A: 1\r\n\r\n")
                .unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(is_websocket_upgrade(&headers));
        assert_eq!(headers.get("x-a").unwrap(), "1");
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(19));
        assert!(parse_head(b"garbage\r\n\r\n").is_err());
    }

    async fn echo_backend(status_line: &'static str, extra: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while find_head_end(&buf).is_none() {
                let n = sock.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            let head = String::from_utf8_lossy(&buf).to_string();
            assert!(head.starts_with("GET /ws?x=1 HTTP/1.1\r\n"), "{head}");
            sock.write_all(status_line.as_bytes()).await.unwrap();
            sock.write_all(extra).await.unwrap();
            loop {
                let n = sock.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                sock.write_all(&chunk[..n]).await.unwrap();
            }
        });
        port
    }

    async fn front(backend_port: u16) -> u16 {
        let app = Router::new().fallback(move |req: Request| async move {
            let target = worker_target(backend_port, "/ws?x=1");
            proxy_to_url(&reqwest::Client::new(), &target, req).await
        });
        serve(app).await.1
    }

    const UPGRADE_REQUEST: &[u8] = b"GET /screencast HTTP/1.1\r\nHost: front\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

    #[tokio::test]
    async fn pumps_bytes_after_switching_protocols() {
        let backend = echo_backend(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            b"hello",
        )
        .await;
        let front = front(backend).await;

        let mut client = TcpStream::connect(("127.0.0.1", front)).await.unwrap();
        client.write_all(UPGRADE_REQUEST).await.unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let body_start = loop {
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "front closed early");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
        };
        assert!(buf.starts_with(b"HTTP/1.1 101"));
        while buf.len() < body_start + 5 {
            let n = client.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(&buf[body_start..body_start + 5], b"hello");

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn relays_rejected_upgrade() {
        let backend = echo_backend(
            "HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\nContent-Type: text/plain\r\n\r\n",
            b"denied",
        )
        .await;
        let front = front(backend).await;

        let mut client = TcpStream::connect(("127.0.0.1", front)).await.unwrap();
        client.write_all(UPGRADE_REQUEST).await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !String::from_utf8_lossy(&buf).contains("denied") {
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "front closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
        assert!(buf.starts_with(b"HTTP/1.1 403"));
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let url = reqwest::Url::parse(&worker_target(port, "/ws")).unwrap();
        let resp = tunnel_websocket(&url, Request::new(Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
