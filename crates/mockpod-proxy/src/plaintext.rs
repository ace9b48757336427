use std::io;
use std::sync::Arc;
use std::time::Instant;

use mockpod_http::{header_value, parse_absolute_url, HttpRequestHead};
use mockpod_observe::TrafficEntry;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::compose;
use crate::forward::{build_upstream_request, fetch_upstream_response, origin_authority};
use crate::io_util::{read_body, BufferedConn};
use crate::{apply_mock_delay, ProxyCore};

/// Plaintext proxy path: one absolute-form request, buffered end to end.
///
/// A matching rule synthesizes the response without contacting upstream;
/// without one the request is forwarded and passed through. Either way the
/// connection closes after the exchange.
pub(crate) async fn handle_request(
    core: Arc<ProxyCore>,
    mut conn: BufferedConn<TcpStream>,
    request: HttpRequestHead,
) -> io::Result<()> {
    let started = Instant::now();

    if request.target.starts_with('/') {
        let path = request.target.split('?').next().unwrap_or("").to_string();
        let host = header_value(&request.headers, "host")
            .unwrap_or("")
            .split(':')
            .next()
            .unwrap_or("")
            .to_string();
        if compose::is_certificate_request(&host, &path) {
            let url = format!("http://{host}{}", request.target);
            return serve_certificate(core, conn, &request, url, &host, &path, started).await;
        }
        tracing::debug!(target = %request.target, "origin-form target is not proxyable, closing");
        return Ok(());
    }

    let url = match parse_absolute_url(&request.target) {
        Ok(url) => url,
        Err(error) => {
            tracing::debug!(target = %request.target, error = %error, "closing on malformed absolute-form target");
            return Ok(());
        }
    };
    let path = url.path_query.split('?').next().unwrap_or("/").to_string();
    if compose::is_certificate_request(&url.host, &path) {
        let full_url = url.full();
        let host = url.host.clone();
        return serve_certificate(core, conn, &request, full_url, &host, &path, started).await;
    }

    let body = read_body(&mut conn, request.body_mode, core.config.max_body_bytes).await?;
    let full_url = url.full();
    let entry = TrafficEntry::begin(
        &request.method,
        &full_url,
        &url.host,
        &path,
        &url.scheme,
        request.headers.clone(),
        if body.is_empty() {
            None
        } else {
            Some(body.clone())
        },
    );

    if let Some(rule) = core.rules.find_match(&request.method, &full_url) {
        let composed = compose::synthesize(&rule);
        apply_mock_delay(&rule).await;
        conn.stream.write_all(&compose::encode(&composed, "close")).await?;
        conn.stream.flush().await?;
        core.bus.publish(entry.finish(
            composed.status_code,
            composed.headers,
            composed.body,
            started.elapsed(),
        ));
        return Ok(());
    }

    let upstream_tcp = match timeout(
        core.config.upstream_timeout,
        TcpStream::connect((url.host.as_str(), url.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            return respond_bad_gateway(&core, conn, entry, started, &error.to_string()).await;
        }
        Err(_) => {
            return respond_bad_gateway(&core, conn, entry, started, "upstream connect timed out")
                .await;
        }
    };

    let mut upstream_conn = BufferedConn::new(upstream_tcp);
    let host_header = origin_authority(&url.host, url.port, 80);
    let upstream_request = build_upstream_request(&request, &url.path_query, &host_header, &body);
    if let Err(error) = upstream_conn.stream.write_all(&upstream_request).await {
        return respond_bad_gateway(&core, conn, entry, started, &error.to_string()).await;
    }

    let (response_head, response_body) = match fetch_upstream_response(
        &mut upstream_conn,
        &request.method,
        core.config.max_http_head_bytes,
        core.config.max_body_bytes,
    )
    .await
    {
        Ok(exchange) => exchange,
        Err(error) => {
            return respond_bad_gateway(&core, conn, entry, started, &error.to_string()).await;
        }
    };

    let composed = compose::pass_through(&response_head, response_body);
    conn.stream.write_all(&compose::encode(&composed, "close")).await?;
    conn.stream.flush().await?;
    core.bus.publish(entry.finish(
        composed.status_code,
        composed.headers,
        composed.body,
        started.elapsed(),
    ));
    Ok(())
}

async fn serve_certificate(
    core: Arc<ProxyCore>,
    mut conn: BufferedConn<TcpStream>,
    request: &HttpRequestHead,
    url: String,
    host: &str,
    path: &str,
    started: Instant,
) -> io::Result<()> {
    let composed = compose::certificate_download(core.ca.root_ca_der());
    conn.stream.write_all(&compose::encode(&composed, "close")).await?;
    conn.stream.flush().await?;

    let entry = TrafficEntry::begin(
        &request.method,
        url,
        host,
        path,
        "http",
        request.headers.clone(),
        None,
    );
    core.bus.publish(entry.finish(
        composed.status_code,
        composed.headers,
        composed.body,
        started.elapsed(),
    ));
    Ok(())
}

async fn respond_bad_gateway(
    core: &Arc<ProxyCore>,
    mut conn: BufferedConn<TcpStream>,
    entry: TrafficEntry,
    started: Instant,
    detail: &str,
) -> io::Result<()> {
    tracing::debug!(url = %entry.url, detail = %detail, "plaintext upstream exchange failed");
    let composed = compose::bad_gateway(detail);
    conn.stream.write_all(&compose::encode(&composed, "close")).await?;
    conn.stream.flush().await?;
    core.bus.publish(entry.finish(
        composed.status_code,
        composed.headers,
        composed.body,
        started.elapsed(),
    ));
    Ok(())
}
