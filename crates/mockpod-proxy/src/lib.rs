use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mockpod_http::{parse_connect_request_line, parse_request_head};
use mockpod_observe::TrafficBus;
use mockpod_rules::{MockRule, RuleEngine};
use mockpod_tls::CertificateAuthority;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

mod compose;
mod forward;
mod io_util;
mod mitm;
mod plaintext;

pub use compose::{ComposedResponse, CERT_HOST, CERT_PATH, RULE_MARKER_HEADER};

use io_util::{read_until_pattern, write_simple_response, BufferedConn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Cap on the initial head; a request line that long without a
    /// delimiter closes the connection.
    pub max_initial_head_bytes: usize,
    pub max_http_head_bytes: usize,
    pub max_body_bytes: usize,
    /// Bounds upstream TCP connect and TLS handshake.
    pub upstream_timeout: Duration,
    /// Idle window between keep-alive requests inside a MITM tunnel.
    pub keep_alive_idle: Duration,
    /// Accept self-signed upstream certificates. Test fixtures only.
    pub upstream_tls_insecure_skip_verify: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            max_initial_head_bytes: 8 * 1024,
            max_http_head_bytes: 64 * 1024,
            max_body_bytes: 32 * 1024 * 1024,
            upstream_timeout: Duration::from_secs(10),
            keep_alive_idle: Duration::from_secs(60),
            upstream_tls_insecure_skip_verify: false,
        }
    }
}

/// The proxy core: owns the certificate authority, the rule engine and the
/// traffic bus, and drives one task per accepted connection.
///
/// The embedder keeps its own handles to the engine (to replace rules) and
/// to bus subscribers (to observe traffic); the core never calls back into
/// the embedder directly.
pub struct ProxyCore {
    pub config: ProxyConfig,
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) rules: Arc<RuleEngine>,
    pub(crate) bus: Arc<TrafficBus>,
}

impl ProxyCore {
    pub fn new(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        rules: Arc<RuleEngine>,
        bus: Arc<TrafficBus>,
    ) -> Self {
        Self {
            config,
            ca,
            rules,
            bus,
        }
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let bind_addr = format!("{}:{}", self.config.listen_addr, self.config.listen_port);
        TcpListener::bind(&bind_addr).await
    }

    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    /// Accept loop. Aborting the task running this loop (and thereby the
    /// per-connection tasks it spawned) is the shutdown path; in-flight
    /// requests torn down that way publish no traffic entries.
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let core = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = handle_client(core, stream, client_addr).await {
                    tracing::debug!(client = %client_addr, error = %error, "connection ended with error");
                }
            });
        }
    }
}

/// Per-connection entry point: reads the first head and branches to the
/// plaintext proxy path or, for CONNECT, into a MITM session.
async fn handle_client(
    core: Arc<ProxyCore>,
    stream: TcpStream,
    client_addr: SocketAddr,
) -> io::Result<()> {
    let mut conn = BufferedConn::new(stream);
    let head_raw = match read_until_pattern(
        &mut conn,
        b"\r\n\r\n",
        core.config.max_initial_head_bytes,
    )
    .await
    {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(()),
        Err(error) => {
            tracing::debug!(client = %client_addr, error = %error, "closing before a full request head arrived");
            return Ok(());
        }
    };

    if head_raw.starts_with(b"CONNECT ") {
        let line_end = head_raw
            .windows(2)
            .position(|window| window == b"\r\n")
            .unwrap_or(head_raw.len());
        let request_line = match std::str::from_utf8(&head_raw[..line_end]) {
            Ok(line) => line,
            Err(_) => {
                write_simple_response(&mut conn.stream, "400 Bad Request", "invalid CONNECT request")
                    .await?;
                return Ok(());
            }
        };
        let target = match parse_connect_request_line(request_line) {
            Ok(target) => target,
            Err(error) => {
                tracing::debug!(client = %client_addr, error = %error, "rejecting malformed CONNECT");
                write_simple_response(&mut conn.stream, "400 Bad Request", "invalid CONNECT request")
                    .await?;
                return Ok(());
            }
        };

        // From here the connection speaks TLS; the plaintext head buffer is done.
        conn.read_buf.clear();
        conn.stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        return mitm::run_session(core, conn.stream, target).await;
    }

    let request = match parse_request_head(&head_raw) {
        Ok(request) => request,
        Err(error) => {
            tracing::debug!(client = %client_addr, error = %error, "closing on malformed proxy request");
            return Ok(());
        }
    };
    plaintext::handle_request(core, conn, request).await
}

pub(crate) async fn apply_mock_delay(rule: &MockRule) {
    if let Some(delay_seconds) = rule.response.delay_seconds {
        if delay_seconds > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay_seconds)).await;
        }
    }
}
