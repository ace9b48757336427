use std::io;

use bytes::Bytes;
use mockpod_http::HttpBodyMode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;

/// A stream plus bytes already read past the last consumed message boundary.
pub(crate) struct BufferedConn<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

/// Reads until `pattern` appears and returns everything up to and including
/// it. `Ok(None)` means the peer closed cleanly before sending anything.
pub(crate) async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, pattern) {
            let end = start + pattern.len();
            let bytes = conn.read_buf.drain(..end).collect::<Vec<_>>();
            return Ok(Some(bytes));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message head exceeded configured limit",
            ));
        }

        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message boundary was reached",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Reads a full message body according to its framing mode. Chunked bodies
/// are de-chunked; the caller re-frames with an explicit `Content-Length`.
pub(crate) async fn read_body<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    mode: HttpBodyMode,
    max_bytes: usize,
) -> io::Result<Bytes> {
    match mode {
        HttpBodyMode::None => Ok(Bytes::new()),
        HttpBodyMode::ContentLength(length) => {
            if length > max_bytes as u64 {
                return Err(body_too_large(max_bytes));
            }
            let body = read_exact_buffered(conn, length as usize).await?;
            Ok(Bytes::from(body))
        }
        HttpBodyMode::Chunked => {
            let body = read_chunked_body(conn, max_bytes).await?;
            Ok(Bytes::from(body))
        }
        HttpBodyMode::CloseDelimited => {
            let mut body = std::mem::take(&mut conn.read_buf);
            loop {
                if body.len() > max_bytes {
                    return Err(body_too_large(max_bytes));
                }
                let mut chunk = [0_u8; IO_CHUNK_SIZE];
                let read = conn.stream.read(&mut chunk).await?;
                if read == 0 {
                    return Ok(Bytes::from(body));
                }
                body.extend_from_slice(&chunk[..read]);
            }
        }
    }
}

async fn read_exact_buffered<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    length: usize,
) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(length.min(4 * IO_CHUNK_SIZE));
    let buffered = length.min(conn.read_buf.len());
    out.extend(conn.read_buf.drain(..buffered));

    while out.len() < length {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let want = (length - out.len()).min(IO_CHUNK_SIZE);
        let read = conn.stream.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        out.extend_from_slice(&chunk[..read]);
    }
    Ok(out)
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    max_bytes: usize,
) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_until_pattern(conn, b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunk size line",
                )
            })?;
        let size_text = std::str::from_utf8(&size_line)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size not UTF-8"))?;
        let size_text = size_text.trim_end().split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;

        if size == 0 {
            loop {
                let trailer = read_until_pattern(conn, b"\r\n", CHUNK_LINE_LIMIT)
                    .await?
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed before chunked trailer end",
                        )
                    })?;
                if trailer == b"\r\n" {
                    break;
                }
            }
            return Ok(body);
        }

        if body.len() as u64 + size > max_bytes as u64 {
            return Err(body_too_large(max_bytes));
        }
        let chunk = read_exact_buffered(conn, size as usize + 2).await?;
        if &chunk[size as usize..] != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk not terminated by CRLF",
            ));
        }
        body.extend_from_slice(&chunk[..size as usize]);
    }
}

fn body_too_large(max_bytes: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("message body exceeded configured limit of {max_bytes} bytes"),
    )
}

pub(crate) async fn write_simple_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use mockpod_http::HttpBodyMode;
    use tokio::io::AsyncWriteExt;

    use super::{read_body, read_until_pattern, BufferedConn};

    #[tokio::test]
    async fn reads_head_and_leaves_remainder_buffered() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server);
        let mut client = client;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nleftover")
            .await
            .expect("write");

        let head = read_until_pattern(&mut conn, b"\r\n\r\n", 1024)
            .await
            .expect("read")
            .expect("head present");
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(conn.read_buf, b"leftover");
    }

    #[tokio::test]
    async fn content_length_body_drains_buffer_before_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server);
        conn.read_buf = b"hel".to_vec();
        let mut client = client;
        client.write_all(b"lo").await.expect("write");

        let body = read_body(&mut conn, HttpBodyMode::ContentLength(5), 1024)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn chunked_body_is_dechunked() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server);
        let mut client = client;
        client
            .write_all(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .await
            .expect("write");

        let body = read_body(&mut conn, HttpBodyMode::Chunked, 1024)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected() {
        let (_client, server) = tokio::io::duplex(64);
        let mut conn = BufferedConn::new(server);
        let error = read_body(&mut conn, HttpBodyMode::ContentLength(1 << 20), 1024)
            .await
            .expect_err("must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn close_delimited_body_reads_to_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server);
        let mut client = client;
        client.write_all(b"partial payload").await.expect("write");
        drop(client);

        let body = read_body(&mut conn, HttpBodyMode::CloseDelimited, 1024)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), b"partial payload");
    }
}
