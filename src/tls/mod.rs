//! TLS trust configuration and certificate metadata.

pub mod cert;
pub mod verifier;

use std::fs;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use rustls::{ClientConfig, RootCertStore};
use serde::Deserialize;
use thiserror::Error;

use cert::Anchor;
pub use verifier::VerificationMode;

#[derive(Error, Debug)]
pub enum TlsConfigError {
    #[error("unable to read certificate authority {path}: {source}")]
    ReadCa {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid certificate authority {0}")]
    InvalidCa(String),
    #[error("unsupported tls protocol {0}, expected TLSv1.2 or TLSv1.3")]
    UnsupportedProtocol(String),
    #[error("tls protocol versions: {0}")]
    Protocol(String),
    #[error("certificate verifier: {0}")]
    Verifier(String),
}

/// The `ssl` block of a monitor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfig {
    pub enabled: Option<bool>,

    #[serde(default)]
    pub verification_mode: VerificationMode,

    /// File paths or inline PEM blocks.
    #[serde(default)]
    pub certificate_authorities: Vec<String>,

    #[serde(default)]
    pub supported_protocols: Vec<String>,
}

/// Resolved TLS settings shared by every probe of a monitor.
#[derive(Clone)]
pub struct TlsSettings {
    pub mode: VerificationMode,
    /// Configured CAs plus the bundled webpki roots, used to assemble
    /// verified chains.
    pub anchors: Arc<Vec<Anchor>>,
    pub config: Arc<ClientConfig>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("mode", &self.mode)
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

impl TlsSettings {
    pub fn from_config(config: &SslConfig) -> Result<Self, TlsConfigError> {
        let mut authorities = Vec::new();
        for source in &config.certificate_authorities {
            authorities.extend(load_certificates(source)?);
        }

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut anchors: Vec<Anchor> = webpki_roots::TLS_SERVER_ROOTS
            .iter()
            .map(Anchor::from_trust_anchor)
            .collect();
        for ca in &authorities {
            roots
                .add(ca.clone())
                .map_err(|e| TlsConfigError::InvalidCa(e.to_string()))?;
            let anchor =
                Anchor::from_der(ca).map_err(|e| TlsConfigError::InvalidCa(e.to_string()))?;
            anchors.push(anchor);
        }

        let versions = protocol_versions(&config.supported_protocols)?;
        let client = verifier::client_config(config.verification_mode, &roots, &versions)?;

        Ok(TlsSettings {
            mode: config.verification_mode,
            anchors: Arc::new(anchors),
            config: Arc::new(client),
        })
    }
}

fn load_certificates(source: &str) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let pem = if source.trim_start().starts_with("-----BEGIN") {
        source.as_bytes().to_vec()
    } else {
        fs::read(source).map_err(|e| TlsConfigError::ReadCa {
            path: source.to_string(),
            source: e,
        })?
    };

    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::InvalidCa(format!("{source}: {e}")))?;
    if certs.is_empty() {
        return Err(TlsConfigError::InvalidCa(format!(
            "{source}: no certificates found"
        )));
    }
    Ok(certs)
}

fn protocol_versions(
    names: &[String],
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsConfigError> {
    if names.is_empty() {
        return Ok(vec![&rustls::version::TLS12, &rustls::version::TLS13]);
    }
    names
        .iter()
        .map(|name| match name.as_str() {
            "TLSv1.2" => Ok(&rustls::version::TLS12),
            "TLSv1.3" => Ok(&rustls::version::TLS13),
            other => Err(TlsConfigError::UnsupportedProtocol(other.to_string())),
        })
        .collect()
}
