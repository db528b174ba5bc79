//! rustls client side of the STARTTLS upgrade.
//!
//! The verifying configuration is built once per process from the platform
//! trust store and shared by every connection; the one that skips
//! verification is built on demand for `dangerous_insecure_tls`.

use std::fmt;
use std::sync::{Arc, Once, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Install the ring crypto provider once per process.
pub(crate) fn init_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = ring::default_provider().install_default();
    });
}

/// Server certificate check for `dangerous_insecure_tls`: any chain is
/// accepted, handshake signatures are still verified.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Trust anchors from the platform store.
fn native_roots() -> Result<RootCertStore, String> {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        warn!(error = %e, "Could not read part of the system trust store");
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!(added, ignored, "Loaded system root certificates");
    if roots.is_empty() {
        return Err("No usable system root certificates; STARTTLS cannot validate the server \
                    (install the ca-certificates package on Linux)"
            .to_string());
    }
    Ok(roots)
}

fn verifying_config() -> Result<Arc<ClientConfig>, String> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }
    let config = ClientConfig::builder()
        .with_root_certificates(native_roots()?)
        .with_no_client_auth();
    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

fn insecure_config() -> Arc<ClientConfig> {
    let verifier = AcceptAnyServerCert(Arc::new(ring::default_provider()));
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth(),
    )
}

/// Connector for the STARTTLS handshake. `insecure` skips certificate
/// validation entirely.
pub fn create_tls_connector(insecure: bool) -> Result<TlsConnector, String> {
    init_crypto_provider();
    if insecure {
        warn!("TLS certificate verification DISABLED (dangerous_insecure_tls)");
        return Ok(TlsConnector::from(insecure_config()));
    }
    verifying_config().map(TlsConnector::from)
}

/// Coarse cause of a failed handshake, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeFailure {
    Certificate,
    Timeout,
    ConnectionLost,
    Other,
}

impl HandshakeFailure {
    pub(crate) fn classify(detail: &str) -> Self {
        let detail = detail.to_ascii_lowercase();
        if detail.contains("certificate") {
            Self::Certificate
        } else if detail.contains("timed out") || detail.contains("timeout") {
            Self::Timeout
        } else if ["refused", "reset", "eof", "broken pipe"].iter().any(|s| detail.contains(s)) {
            Self::ConnectionLost
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Certificate => "certificate_error",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection_lost",
            Self::Other => "other",
        })
    }
}
