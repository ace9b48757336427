use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use mockpod_http::{parse_request_head, ConnectTarget, HttpRequestHead, HttpResponseHead};
use mockpod_observe::TrafficEntry;
use mockpod_tls::upstream_client_config;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::compose;
use crate::forward::{build_upstream_request, fetch_upstream_response, origin_authority};
use crate::io_util::{read_body, read_until_pattern, BufferedConn};
use crate::{apply_mock_delay, ProxyCore};

/// TLS-terminated HTTP/1.1 session behind a CONNECT tunnel.
///
/// The client has already received `200 Connection Established`; from here
/// every failure before the first decoded request closes the tunnel
/// silently. Handshake failures in particular are expected from
/// certificate-pinned clients and are logged at debug level only.
pub(crate) async fn run_session(
    core: Arc<ProxyCore>,
    stream: TcpStream,
    target: ConnectTarget,
) -> io::Result<()> {
    let issued = match core.ca.leaf_server_config(&target.host) {
        Ok(issued) => issued,
        Err(error) => {
            tracing::debug!(host = %target.host, error = %error, "leaf issuance failed, closing tunnel");
            return Ok(());
        }
    };

    let acceptor = TlsAcceptor::from(issued.server_config);
    let tls = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::debug!(host = %target.host, error = %error, "client TLS handshake failed");
            return Ok(());
        }
    };

    let mut conn = BufferedConn::new(tls);
    loop {
        let head_raw = match timeout(
            core.config.keep_alive_idle,
            read_until_pattern(&mut conn, b"\r\n\r\n", core.config.max_http_head_bytes),
        )
        .await
        {
            Err(_) => return Ok(()),
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(error)) => {
                tracing::debug!(host = %target.host, error = %error, "closing tunnel on read error");
                return Ok(());
            }
        };

        let request = match parse_request_head(&head_raw) {
            Ok(request) => request,
            Err(error) => {
                tracing::debug!(host = %target.host, error = %error, "closing tunnel on malformed request");
                return Ok(());
            }
        };
        let started = Instant::now();
        let body = match read_body(&mut conn, request.body_mode, core.config.max_body_bytes).await
        {
            Ok(body) => body,
            Err(error) => {
                tracing::debug!(host = %target.host, error = %error, "closing tunnel on request body error");
                return Ok(());
            }
        };

        let keep_alive = process_request(&core, &mut conn, &target, request, body, started).await?;
        if !keep_alive {
            return Ok(());
        }
    }
}

/// One decoded request inside the tunnel: route, fetch, compose, reply,
/// publish. Returns whether the session stays open for the next request.
async fn process_request(
    core: &Arc<ProxyCore>,
    conn: &mut BufferedConn<ServerTlsStream<TcpStream>>,
    target: &ConnectTarget,
    request: HttpRequestHead,
    body: Bytes,
    started: Instant,
) -> io::Result<bool> {
    let authority = origin_authority(&target.host, target.port, 443);
    let full_url = if request.target.starts_with('/') {
        format!("https://{authority}{}", request.target)
    } else {
        request.target.clone()
    };
    let path = request.target.split('?').next().unwrap_or("/").to_string();

    if compose::is_certificate_request(&target.host, &path) {
        let composed = compose::certificate_download(core.ca.root_ca_der());
        conn.stream
            .write_all(&compose::encode(&composed, "close"))
            .await?;
        conn.stream.flush().await?;
        let entry = TrafficEntry::begin(
            &request.method,
            &full_url,
            &target.host,
            &path,
            "https",
            request.headers.clone(),
            None,
        );
        core.bus.publish(entry.finish(
            composed.status_code,
            composed.headers,
            composed.body,
            started.elapsed(),
        ));
        return Ok(false);
    }

    let entry = TrafficEntry::begin(
        &request.method,
        &full_url,
        &target.host,
        &path,
        "https",
        request.headers.clone(),
        if body.is_empty() {
            None
        } else {
            Some(body.clone())
        },
    );

    let rule = core.rules.find_match(&request.method, &full_url);

    // Fresh upstream TCP + TLS per request. Even with a matching rule the
    // origin is contacted first, so overlays keep real cookies, CORS and
    // rate-limit headers; the rule alone answers only when the origin is
    // unreachable.
    let (composed, mock_applied, fatal) = match open_upstream(core, target).await {
        Ok(mut upstream_conn) => {
            let upstream_request =
                build_upstream_request(&request, &request.target, &authority, &body);
            match exchange(core, &mut upstream_conn, &request, &upstream_request).await {
                Ok((head, upstream_body)) => match &rule {
                    Some(rule) => (compose::overlay(&head, upstream_body, rule), true, false),
                    None => (compose::pass_through(&head, upstream_body), false, false),
                },
                Err(error) => {
                    tracing::debug!(host = %target.host, error = %error, "upstream protocol error");
                    (compose::bad_gateway(&error.to_string()), false, true)
                }
            }
        }
        Err(error) => match &rule {
            Some(rule) => {
                tracing::debug!(host = %target.host, error = %error, "upstream unreachable, synthesizing from rule");
                (compose::synthesize(rule), true, false)
            }
            None => (compose::bad_gateway(&error.to_string()), false, true),
        },
    };

    if mock_applied {
        if let Some(rule) = &rule {
            apply_mock_delay(rule).await;
        }
    }

    let keep_alive = !fatal && !request.connection_close;
    let connection = if keep_alive { "keep-alive" } else { "close" };
    conn.stream
        .write_all(&compose::encode(&composed, connection))
        .await?;
    conn.stream.flush().await?;

    core.bus.publish(entry.finish(
        composed.status_code,
        composed.headers,
        composed.body,
        started.elapsed(),
    ));
    Ok(keep_alive)
}

async fn open_upstream(
    core: &Arc<ProxyCore>,
    target: &ConnectTarget,
) -> io::Result<BufferedConn<ClientTlsStream<TcpStream>>> {
    let tcp = timeout(
        core.config.upstream_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))??;

    let server_name = ServerName::try_from(target.host.clone()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "upstream host is not a valid TLS server name",
        )
    })?;
    let connector = TlsConnector::from(upstream_client_config(
        core.config.upstream_tls_insecure_skip_verify,
    ));
    let tls = timeout(
        core.config.upstream_timeout,
        connector.connect(server_name, tcp),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream TLS handshake timed out"))??;

    Ok(BufferedConn::new(tls))
}

async fn exchange(
    core: &Arc<ProxyCore>,
    upstream_conn: &mut BufferedConn<ClientTlsStream<TcpStream>>,
    request: &HttpRequestHead,
    upstream_request: &[u8],
) -> io::Result<(HttpResponseHead, Bytes)> {
    upstream_conn.stream.write_all(upstream_request).await?;
    upstream_conn.stream.flush().await?;
    fetch_upstream_response(
        upstream_conn,
        &request.method,
        core.config.max_http_head_bytes,
        core.config.max_body_bytes,
    )
    .await
}
