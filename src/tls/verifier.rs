use std::fmt;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::Deserialize;

use super::TlsConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    /// Chain and hostname.
    #[default]
    Full,
    /// Chain and hostname; the leaf must also carry subject alternative names.
    Strict,
    /// Chain only.
    Certificate,
    None,
}

impl VerificationMode {
    pub fn reports_verified_chains(&self) -> bool {
        matches!(self, VerificationMode::Full | VerificationMode::Strict)
    }
}

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the client configuration for one TLS settings block.
pub fn client_config(
    mode: VerificationMode,
    roots: &RootCertStore,
    versions: &[&'static rustls::SupportedProtocolVersion],
) -> Result<ClientConfig, TlsConfigError> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(|e| TlsConfigError::Protocol(e.to_string()))?;

    let mut config = match mode {
        VerificationMode::Full => builder
            .with_root_certificates(roots.clone())
            .with_no_client_auth(),
        VerificationMode::Strict | VerificationMode::Certificate => {
            let inner = WebPkiServerVerifier::builder_with_provider(
                Arc::new(roots.clone()),
                provider.clone(),
            )
            .build()
            .map_err(|e| TlsConfigError::Verifier(e.to_string()))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ModeVerifier { mode, inner }))
                .with_no_client_auth()
        }
        VerificationMode::None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
            .with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Wraps the webpki verifier to relax (`certificate`) or tighten (`strict`)
/// the default checks.
struct ModeVerifier {
    mode: VerificationMode,
    inner: Arc<WebPkiServerVerifier>,
}

impl fmt::Debug for ModeVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeVerifier").field("mode", &self.mode).finish()
    }
}

fn is_name_mismatch(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

impl ServerCertVerifier for ModeVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        match (self.mode, verified) {
            (VerificationMode::Certificate, Err(err)) if is_name_mismatch(&err) => {
                Ok(ServerCertVerified::assertion())
            }
            (VerificationMode::Strict, Ok(ok)) => {
                let info = super::cert::CertificateInfo::parse(end_entity)
                    .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
                if info.alternative_names.is_empty() {
                    return Err(rustls::Error::General(
                        "certificate has no subject alternative names".into(),
                    ));
                }
                Ok(ok)
            }
            (_, result) => result,
        }
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

/// Accepts any certificate; handshake signatures are still checked.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_deserializes_lowercase() {
        let mode: VerificationMode = serde_yaml::from_str("certificate").unwrap();
        assert_eq!(mode, VerificationMode::Certificate);
        let mode: VerificationMode = serde_yaml::from_str("none").unwrap();
        assert_eq!(mode, VerificationMode::None);
        assert!(serde_yaml::from_str::<VerificationMode>("lenient").is_err());
        assert_eq!(VerificationMode::default(), VerificationMode::Full);
    }

    #[test]
    fn builds_config_for_every_mode() {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for mode in [
            VerificationMode::Full,
            VerificationMode::Strict,
            VerificationMode::Certificate,
            VerificationMode::None,
        ] {
            let config = client_config(mode, &roots, &[&rustls::version::TLS13]).unwrap();
            assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        }
    }

    #[test]
    fn chain_reporting_modes() {
        assert!(VerificationMode::Strict.reports_verified_chains());
        assert!(VerificationMode::Full.reports_verified_chains());
        assert!(!VerificationMode::Certificate.reports_verified_chains());
        assert!(!VerificationMode::None.reports_verified_chains());
    }

    #[test]
    fn only_name_errors_count_as_mismatch() {
        let plain = rustls::Error::InvalidCertificate(CertificateError::NotValidForName);
        assert!(is_name_mismatch(&plain));

        let detailed = rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext {
            expected: ServerName::try_from("example.com").unwrap(),
            presented: vec!["DnsName(\"other.test\")".to_string()],
        });
        assert!(is_name_mismatch(&detailed));

        let expired = rustls::Error::InvalidCertificate(CertificateError::Expired);
        assert!(!is_name_mismatch(&expired));
        let unknown = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert!(!is_name_mismatch(&unknown));
    }
}
