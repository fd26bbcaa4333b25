//! TLS errors, the allow-list derived from a pinned certificate chain and
//! the certificate verifier enforcing it

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, OtherError, RootCertStore, SignatureScheme};
use sha1::{Digest, Sha1};

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsErrorKind {
    HostNameMismatch,
    SelfSignedCertificate,
    SelfSignedCertificateInChain,
    Other,
}

impl TlsErrorKind {
    /// Classifies the message of a TLS backend error.
    pub fn classify(description: &str) -> Self {
        let lowered = description.to_lowercase();
        if lowered.contains("self signed certificate in certificate chain")
            || lowered.contains("self-signed certificate in certificate chain")
        {
            TlsErrorKind::SelfSignedCertificateInChain
        } else if lowered.contains("self signed") || lowered.contains("self-signed") {
            TlsErrorKind::SelfSignedCertificate
        } else if lowered.contains("hostname mismatch")
            || lowered.contains("host name mismatch")
            || lowered.contains("doesn't match")
            || lowered.contains("not valid for")
        {
            TlsErrorKind::HostNameMismatch
        } else {
            TlsErrorKind::Other
        }
    }
}

/// A certificate validation error reported by the HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub description: String,
    /// SHA-1 fingerprint of the offending certificate, when known
    pub certificate_fingerprint: Option<String>,
}

impl TlsError {
    pub fn from_description(description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            kind: TlsErrorKind::classify(&description),
            description,
            certificate_fingerprint: None,
        }
    }
}

impl TlsError {
    /// Describes a rejected server chain, naming the certificate at fault.
    fn from_certificate_error(
        error: &CertificateError,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Self {
        let (kind, certificate) = match error {
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
                (TlsErrorKind::HostNameMismatch, end_entity)
            }
            CertificateError::UnknownIssuer => match intermediates.last() {
                Some(top) => (TlsErrorKind::SelfSignedCertificateInChain, top),
                None => (TlsErrorKind::SelfSignedCertificate, end_entity),
            },
            _ => (TlsErrorKind::Other, end_entity),
        };
        Self {
            kind,
            description: rustls::Error::InvalidCertificate(error.clone()).to_string(),
            certificate_fingerprint: Some(certificate_fingerprint(certificate)),
        }
    }
}

/// Error carried through the TLS stack when the verifier rejects a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsRejection(pub TlsError);

impl fmt::Display for TlsRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for TlsRejection {}

/// Finds the verifier rejection inside an error from the TLS stack.
pub fn tls_rejection(error: &(dyn std::error::Error + 'static)) -> Option<TlsError> {
    if let Some(rejection) = error.downcast_ref::<TlsRejection>() {
        return Some(rejection.0.clone());
    }
    // io::Error hides its payload from source()
    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        return io_error.get_ref().and_then(|inner| tls_rejection(inner));
    }
    match error.downcast_ref::<rustls::Error>() {
        Some(rustls::Error::InvalidCertificate(CertificateError::Other(other))) => {
            tls_rejection(other.0.as_ref())
        }
        _ => None,
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)?;
        match &self.certificate_fingerprint {
            Some(fingerprint) => write!(f, " on certificate:\n - SHA-1 {fingerprint}"),
            None => Ok(()),
        }
    }
}

/// TLS errors to ignore because the user pinned the certificates causing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedTlsErrors {
    expected: HashSet<(TlsErrorKind, String)>,
}

impl ExpectedTlsErrors {
    /// Expects a host name mismatch and a self signed error for every
    /// certificate of the pinned chain.
    ///
    /// # Errors
    /// - `ConfigError::InvalidCertificate` - A chain entry is not PEM encoded
    pub fn from_pinned_chain(chain: &[String]) -> Result<Self, ConfigError> {
        let mut expected = HashSet::new();
        for pem in chain {
            for fingerprint in pem_fingerprints(pem)? {
                for kind in [
                    TlsErrorKind::HostNameMismatch,
                    TlsErrorKind::SelfSignedCertificate,
                    TlsErrorKind::SelfSignedCertificateInChain,
                ] {
                    expected.insert((kind, fingerprint.clone()));
                }
            }
        }
        Ok(Self { expected })
    }

    pub fn is_empty(&self) -> bool {
        self.expected.is_empty()
    }

    /// Errors without a known certificate never match.
    pub fn is_expected(&self, error: &TlsError) -> bool {
        error
            .certificate_fingerprint
            .as_ref()
            .is_some_and(|fingerprint| self.expected.contains(&(error.kind, fingerprint.clone())))
    }

    pub fn unexpected(&self, errors: &[TlsError]) -> Vec<TlsError> {
        errors
            .iter()
            .filter(|error| !self.is_expected(error))
            .cloned()
            .collect()
    }
}

/// Hex SHA-1 of a DER encoded certificate.
pub fn certificate_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha1::digest(der))
}

/// SHA-1 fingerprints of every certificate in a PEM bundle.
///
/// # Errors
/// - `ConfigError::InvalidCertificate` - No certificate block, or a block is not base64
pub fn pem_fingerprints(pem: &str) -> Result<Vec<String>, ConfigError> {
    Ok(pem_blocks(pem)?
        .iter()
        .map(|der| certificate_fingerprint(der))
        .collect())
}

/// DER contents of every block in a PEM bundle.
///
/// # Errors
/// - `ConfigError::InvalidCertificate` - No block, or a block is not base64
pub fn pem_blocks(pem: &str) -> Result<Vec<Vec<u8>>, ConfigError> {
    let mut blocks = Vec::new();
    let mut block: Option<String> = None;

    for line in pem.lines().map(str::trim) {
        if line.starts_with("-----BEGIN") {
            block = Some(String::new());
        } else if line.starts_with("-----END") {
            let encoded = block.take().ok_or_else(|| ConfigError::InvalidCertificate {
                reason: "END marker without BEGIN".to_string(),
            })?;
            let der = STANDARD
                .decode(encoded)
                .map_err(|e| ConfigError::InvalidCertificate {
                    reason: e.to_string(),
                })?;
            blocks.push(der);
        } else if let Some(encoded) = block.as_mut() {
            encoded.push_str(line);
        }
    }

    if blocks.is_empty() {
        return Err(ConfigError::InvalidCertificate {
            reason: "no PEM certificate found".to_string(),
        });
    }
    Ok(blocks)
}

/// Verifies daemon certificates against a pinned chain only.
///
/// The chain is the sole set of trust anchors. A host name mismatch, or a
/// lone self signed certificate, is accepted when the certificate the
/// daemon presented is itself pinned; its key is still proven by the
/// handshake signature. Every other failure is rejected as a
/// `TlsRejection` naming the offending certificate.
#[derive(Debug)]
pub struct PinnedCertificateVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected: ExpectedTlsErrors,
}

impl PinnedCertificateVerifier {
    /// # Errors
    /// - `ConfigError::InvalidCertificate` - A chain entry is not a usable certificate
    /// - `ConfigError::ClientConstruction` - The verifier cannot be built from the chain
    pub fn new(chain: &[String], provider: Arc<CryptoProvider>) -> Result<Self, ConfigError> {
        let mut roots = RootCertStore::empty();
        for pem in chain {
            for der in pem_blocks(pem)? {
                roots
                    .add(CertificateDer::from(der))
                    .map_err(|e| ConfigError::InvalidCertificate {
                        reason: e.to_string(),
                    })?;
            }
        }

        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| ConfigError::ClientConstruction {
                reason: e.to_string(),
            })?;

        Ok(Self {
            inner,
            expected: ExpectedTlsErrors::from_pinned_chain(chain)?,
        })
    }

    fn is_ignorable(&self, error: &TlsError) -> bool {
        matches!(
            error.kind,
            TlsErrorKind::HostNameMismatch | TlsErrorKind::SelfSignedCertificate
        ) && self.expected.is_expected(error)
    }
}

impl ServerCertVerifier for PinnedCertificateVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let error = match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(error)) => error,
            result => return result,
        };

        let tls_error = TlsError::from_certificate_error(&error, end_entity, intermediates);
        if self.is_ignorable(&tls_error) {
            tracing::debug!("Ignoring expected TLS error: {tls_error}");
            return Ok(ServerCertVerified::assertion());
        }
        Err(rustls::Error::InvalidCertificate(CertificateError::Other(
            OtherError(Arc::new(TlsRejection(tls_error))),
        )))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
