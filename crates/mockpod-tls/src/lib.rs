use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use time::{Duration, OffsetDateTime};

pub const ROOT_KEY_FILE: &str = "rootCA.key.pem";
pub const ROOT_CERT_FILE: &str = "rootCA.cert.pem";

const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 825;
const NOT_BEFORE_SKEW: Duration = Duration::seconds(60);
const ROOT_COMMON_NAME: &str = "Mockpod Root CA";
const ROOT_ORGANIZATION: &str = "Mockpod";

#[derive(Debug)]
pub enum CaError {
    /// Fatal at startup: the storage directory is unusable or the persisted
    /// root material is corrupt.
    InitFailed(String),
    /// Fatal for one connection: a leaf could not be minted for its host.
    LeafIssueFailed(String),
    LockPoisoned,
}

impl fmt::Display for CaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitFailed(detail) => write!(f, "certificate authority init failed: {detail}"),
            Self::LeafIssueFailed(detail) => write!(f, "leaf issuance failed: {detail}"),
            Self::LockPoisoned => write!(f, "leaf cache lock poisoned"),
        }
    }
}

impl StdError for CaError {}

#[derive(Debug)]
struct RootMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

/// A minted per-host leaf: the TLS server config presenting
/// `[leaf, root]` plus the leaf certificate itself for inspection.
#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub leaf_cert_der: CertificateDer<'static>,
}

/// Persistent on-the-fly certificate authority.
///
/// The root key pair and certificate live under the storage directory as
/// `rootCA.key.pem` / `rootCA.cert.pem`; they are written once on first run
/// and read verbatim afterwards, so clients install trust exactly once.
/// Leaf server configs are minted per host and cached for the process
/// lifetime; a cached host is never re-issued.
#[derive(Debug)]
pub struct CertificateAuthority {
    root: RootMaterial,
    leaf_cache: Mutex<HashMap<String, IssuedLeaf>>,
}

impl CertificateAuthority {
    pub fn load_or_create(storage_dir: impl AsRef<Path>) -> Result<Self, CaError> {
        let storage_dir = storage_dir.as_ref();
        fs::create_dir_all(storage_dir).map_err(|error| {
            CaError::InitFailed(format!(
                "cannot create storage directory {}: {error}",
                storage_dir.display()
            ))
        })?;

        let key_path = storage_dir.join(ROOT_KEY_FILE);
        let cert_path = storage_dir.join(ROOT_CERT_FILE);

        let root = match (cert_path.exists(), key_path.exists()) {
            (true, true) => load_root(&cert_path, &key_path)?,
            (false, false) => {
                let (root, key_pem) = generate_root()?;
                persist_root(&cert_path, &key_path, &root.cert_pem, &key_pem)?;
                root
            }
            _ => {
                return Err(CaError::InitFailed(format!(
                    "partial root material in {}: cert and key must both exist or both be absent",
                    storage_dir.display()
                )));
            }
        };

        Ok(Self {
            root,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// TLS server config presenting `[leaf(host), root]` with the leaf's key.
    pub fn leaf_server_config(&self, host: &str) -> Result<IssuedLeaf, CaError> {
        let normalized = normalize_host(host);
        let mut cache = self.leaf_cache.lock().map_err(|_| CaError::LockPoisoned)?;
        if let Some(issued) = cache.get(&normalized) {
            return Ok(issued.clone());
        }

        let issued = issue_leaf_server_config(&self.root, &normalized)?;
        cache.insert(normalized, issued.clone());
        Ok(issued)
    }

    pub fn root_ca_pem(&self) -> &str {
        &self.root.cert_pem
    }

    pub fn root_ca_der(&self) -> &[u8] {
        self.root.cert_der.as_ref()
    }
}

fn load_root(cert_path: &Path, key_path: &Path) -> Result<RootMaterial, CaError> {
    let cert_pem = fs::read_to_string(cert_path).map_err(|error| {
        CaError::InitFailed(format!("cannot read {}: {error}", cert_path.display()))
    })?;
    let key_pem = fs::read_to_string(key_path).map_err(|error| {
        CaError::InitFailed(format!("cannot read {}: {error}", key_path.display()))
    })?;

    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        CaError::InitFailed(format!(
            "corrupt root certificate {}: {error}",
            cert_path.display()
        ))
    })?;
    let key = KeyPair::from_pem(&key_pem).map_err(|error| {
        CaError::InitFailed(format!("corrupt root key {}: {error}", key_path.display()))
    })?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
        CaError::InitFailed(format!(
            "root certificate {} is not usable as an issuer: {error}",
            cert_path.display()
        ))
    })?;

    Ok(RootMaterial {
        issuer,
        cert_pem,
        cert_der,
    })
}

fn generate_root() -> Result<(RootMaterial, String), CaError> {
    let key = KeyPair::generate()
        .map_err(|error| CaError::InitFailed(format!("root key generation failed: {error}")))?;
    let key_pem = key.serialize_pem();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = dn;

    let cert = params
        .self_signed(&key)
        .map_err(|error| CaError::InitFailed(format!("root self-signing failed: {error}")))?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();
    let issuer = Issuer::new(params, key);

    Ok((
        RootMaterial {
            issuer,
            cert_pem,
            cert_der,
        },
        key_pem,
    ))
}

fn persist_root(
    cert_path: &Path,
    key_path: &Path,
    cert_pem: &str,
    key_pem: &str,
) -> Result<(), CaError> {
    write_atomic(key_path, key_pem.as_bytes()).map_err(|error| {
        CaError::InitFailed(format!("cannot write {}: {error}", key_path.display()))
    })?;
    write_atomic(cert_path, cert_pem.as_bytes()).map_err(|error| {
        CaError::InitFailed(format!("cannot write {}: {error}", cert_path.display()))
    })?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp_path = PathBuf::from(path.as_os_str());
    tmp_path.as_mut_os_string().push(".tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)
}

fn issue_leaf_server_config(root: &RootMaterial, host: &str) -> Result<IssuedLeaf, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|error| CaError::LeafIssueFailed(error.to_string()))?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.to_string());
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        let dns_name = host
            .try_into()
            .map_err(|error: rcgen::Error| CaError::LeafIssueFailed(error.to_string()))?;
        params.subject_alt_names.push(SanType::DnsName(dns_name));
    }

    let leaf_key = KeyPair::generate()
        .map_err(|error| CaError::LeafIssueFailed(format!("leaf key generation: {error}")))?;
    let leaf_cert = params
        .signed_by(&leaf_key, &root.issuer)
        .map_err(|error| CaError::LeafIssueFailed(format!("leaf signing for {host}: {error}")))?;

    let leaf_cert_der = leaf_cert.der().clone();
    let chain = vec![leaf_cert_der.clone(), root.cert_der.clone()];
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .map_err(|error| CaError::LeafIssueFailed(format!("server config for {host}: {error}")))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(IssuedLeaf {
        server_config: Arc::new(server_config),
        leaf_cert_der,
    })
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

/// TLS client config for re-originating to upstreams. Real upstreams are
/// verified against the webpki root set; the insecure mode exists for test
/// fixtures that present self-signed certificates.
pub fn upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
