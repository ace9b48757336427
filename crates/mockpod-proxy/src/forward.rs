use std::io;

use bytes::Bytes;
use mockpod_http::{parse_response_head, HttpBodyMode, HttpRequestHead, HttpResponseHead};
use tokio::io::AsyncRead;

use crate::io_util::{read_body, read_until_pattern, BufferedConn};

/// Request headers never forwarded upstream. `Host` is rewritten to the
/// origin, `Accept-Encoding` is dropped so bodies arrive uncompressed and
/// inspectable, and framing headers are recomputed because bodies are
/// buffered (and de-chunked) before forwarding.
const STRIPPED_ON_EGRESS: [&str; 6] = [
    "host",
    "accept-encoding",
    "proxy-connection",
    "connection",
    "transfer-encoding",
    "content-length",
];

pub(crate) fn origin_authority(host: &str, port: u16, default_port: u16) -> String {
    if port == default_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

pub(crate) fn build_upstream_request(
    request: &HttpRequestHead,
    path_query: &str,
    host_header: &str,
    body: &Bytes,
) -> Vec<u8> {
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        request.method, path_query, host_header
    );
    for header in &request.headers {
        if STRIPPED_ON_EGRESS.iter().any(|name| header.is(name)) {
            continue;
        }
        head.push_str(&header.name);
        head.push_str(": ");
        head.push_str(&header.value);
        head.push_str("\r\n");
    }
    if !body.is_empty() || request.body_mode != HttpBodyMode::None {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");

    let mut message = head.into_bytes();
    message.extend_from_slice(body);
    message
}

/// Collects a full upstream response, head and body, before anything is
/// relayed to the client.
pub(crate) async fn fetch_upstream_response<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    request_method: &str,
    max_head_bytes: usize,
    max_body_bytes: usize,
) -> io::Result<(HttpResponseHead, Bytes)> {
    let raw = read_until_pattern(conn, b"\r\n\r\n", max_head_bytes)
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before response head",
            )
        })?;
    let head = parse_response_head(&raw, request_method).map_err(|error| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("upstream response head: {error}"),
        )
    })?;
    let body = read_body(conn, head.body_mode, max_body_bytes).await?;
    Ok((head, body))
}
