use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use mockpod_observe::{LiveRingSubscriber, TrafficBus, TrafficSink};
use mockpod_proxy::{ProxyConfig, ProxyCore};
use mockpod_rules::RuleEngine;
use mockpod_tls::CertificateAuthority;

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ProxyConfig::default();
    let cert_dir = std::env::var_os("MOCKPOD_CERT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(default_cert_dir);
    let ca = CertificateAuthority::load_or_create(&cert_dir).map_err(io::Error::other)?;

    let rules = Arc::new(RuleEngine::new());
    let live = Arc::new(LiveRingSubscriber::default());
    let bus = Arc::new(TrafficBus::new(vec![
        Arc::clone(&live) as Arc<dyn TrafficSink>
    ]));

    let core = Arc::new(ProxyCore::new(config, Arc::new(ca), rules, bus));
    eprintln!(
        "mockpod proxy listening on {}:{} (CA material in {})",
        core.config.listen_addr,
        core.config.listen_port,
        cert_dir.display()
    );
    core.run().await
}

fn default_cert_dir() -> PathBuf {
    let base = std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local").join("share"))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("Mockpod").join("Certificates")
}
