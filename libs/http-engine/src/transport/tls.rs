//! TLS client configurations
//!
//! Native root certificates are loaded once per process; OS certificate store
//! lookups can be slow on some platforms.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::{Arc, OnceLock};

use super::TrustPolicy;
use crate::error::TransportError;

static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }
    result.certs
}

/// Cached native root certificates (may be empty)
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Globally installed provider if any, aws-lc-rs otherwise.
///
/// Never installs a process-wide default.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Client configuration for `trust`.
///
/// # Errors
/// `Tls` when the protocol versions can't be set up for the provider.
pub fn client_config(trust: TrustPolicy) -> Result<ClientConfig, TransportError> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(Box::new(e)))?;

    let config = match trust {
        TrustPolicy::Default => builder
            .with_root_certificates(native_root_store())
            .with_no_client_auth(),
        TrustPolicy::TrustAll => {
            tracing::warn!("server certificate validation is disabled for this call");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier { provider }))
                .with_no_client_auth()
        }
    };
    Ok(config)
}

/// Root store over the native certificates.
///
/// An empty store is returned rather than an error: plain HTTP calls don't
/// need roots, and HTTPS handshakes then fail with an unknown-issuer TLS error.
fn native_root_store() -> rustls::RootCertStore {
    let certs = native_root_certs();
    let mut root_store = rustls::RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(certs.iter().cloned());

    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        tracing::warn!(
            found = certs.len(),
            "no usable native root CA certificate, HTTPS handshakes will fail"
        );
    }
    root_store
}

/// Accepts any server certificate for any name.
///
/// Handshake signatures are still checked so the session keys belong to the
/// presented certificate.
#[derive(Debug)]
struct TrustAllVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustAllVerifier {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
