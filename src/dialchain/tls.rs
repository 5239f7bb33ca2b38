//! TLS layer: handshake over the lower connection and record certificate
//! metadata.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rustls::ProtocolVersion;
use rustls::pki_types::ServerName;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::{BoxDialer, BoxedStream, DialError, Dialer, Layer, Network, split_host_port};
use crate::event::{Fields, Timer};
use crate::tls::TlsSettings;
use crate::tls::cert::{CertificateInfo, select_window, validity_from_der, verified_chain_validities};

#[derive(Debug, Clone)]
pub struct TlsLayer {
    settings: TlsSettings,
    timeout: Duration,
}

impl TlsLayer {
    pub fn new(settings: TlsSettings, timeout: Duration) -> Self {
        TlsLayer { settings, timeout }
    }
}

impl Layer for TlsLayer {
    fn wrap(&self, inner: BoxDialer) -> Result<BoxDialer, DialError> {
        if self.timeout.is_zero() {
            return Err(DialError::Config("tls handshake timeout must be positive".into()));
        }
        Ok(Arc::new(TlsDialer {
            inner,
            settings: self.settings.clone(),
            timeout: self.timeout,
        }))
    }
}

struct TlsDialer {
    inner: BoxDialer,
    settings: TlsSettings,
    timeout: Duration,
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(
        &self,
        network: Network,
        address: &str,
        fields: &mut Fields,
    ) -> Result<BoxedStream, DialError> {
        // The address seen here is the logical one; the pin layer below may
        // send the socket somewhere else.
        let (host, _) = split_host_port(address)?;
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| DialError::ServerName(host.clone()))?;

        let conn = self.inner.dial(network, address, fields).await?;

        let connector = TlsConnector::from(self.settings.config.clone());
        let started = Timer::start();
        let stream = match timeout(self.timeout, connector.connect(server_name, conn)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DialError::Tls {
                    server_name: host,
                    source,
                });
            }
            Err(_) => {
                return Err(DialError::TlsTimeout {
                    server_name: host,
                    timeout: self.timeout,
                });
            }
        };
        let handshake = started.stop();

        fields.put("tls.established", true);
        fields.put_rtt("tls.rtt.handshake", handshake.duration());
        self.write_session_fields(&stream, fields);

        Ok(Box::new(stream))
    }
}

impl TlsDialer {
    fn write_session_fields(&self, stream: &TlsStream<BoxedStream>, fields: &mut Fields) {
        let (_, session) = stream.get_ref();

        if let Some(version) = session.protocol_version() {
            let (protocol, number) = version_parts(version);
            fields.put("tls.version_protocol", protocol);
            fields.put("tls.version", number);
        }
        if let Some(suite) = session.negotiated_cipher_suite() {
            fields.put("tls.cipher", format!("{:?}", suite.suite()));
        }
        if let Some(alpn) = session.alpn_protocol() {
            fields.put("tls.next_protocol", String::from_utf8_lossy(alpn).into_owned());
        }

        let Some(peer) = session.peer_certificates() else {
            return;
        };
        match peer.first().map(|leaf| CertificateInfo::parse(leaf)) {
            Some(Ok(info)) => info.write_fields(fields),
            Some(Err(e)) => log::warn!("unable to read peer certificate metadata: {e}"),
            None => return,
        }

        let peer_validities: Vec<_> = peer
            .iter()
            .filter_map(|der| validity_from_der(der).ok())
            .collect();
        let verified = if self.settings.mode.reports_verified_chains() {
            let peer_der: Vec<&[u8]> = peer.iter().map(|c| c.as_ref()).collect();
            verified_chain_validities(&peer_der, &self.settings.anchors)
        } else {
            Vec::new()
        };

        select_window(&peer_validities, &verified, Utc::now()).write_fields(fields);
    }
}

fn version_parts(version: ProtocolVersion) -> (&'static str, String) {
    match version {
        ProtocolVersion::TLSv1_0 => ("tls", "1.0".to_string()),
        ProtocolVersion::TLSv1_1 => ("tls", "1.1".to_string()),
        ProtocolVersion::TLSv1_2 => ("tls", "1.2".to_string()),
        ProtocolVersion::TLSv1_3 => ("tls", "1.3".to_string()),
        ProtocolVersion::SSLv3 => ("ssl", "3.0".to_string()),
        other => ("tls", format!("{other:?}")),
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::testing::spawn_tls_server;
    use super::*;
    use crate::dialchain::net::{NetDialer, SystemResolver};
    use crate::tls::{SslConfig, VerificationMode};

    fn base() -> BoxDialer {
        Arc::new(NetDialer::new(Arc::new(SystemResolver), Duration::from_secs(2)))
    }

    #[tokio::test]
    async fn handshake_records_metadata_with_trusted_ca() {
        let (pem, addr) = spawn_tls_server(&["localhost"], b"pong").await;
        let settings = TlsSettings::from_config(&SslConfig {
            certificate_authorities: vec![pem],
            ..SslConfig::default()
        })
        .unwrap();

        let dialer = TlsLayer::new(settings, Duration::from_secs(2))
            .wrap(base())
            .unwrap();
        let mut fields = Fields::new();
        let mut stream = dialer
            .dial(Network::Tcp, &format!("localhost:{}", addr.port()), &mut fields)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");

        assert_eq!(fields.get("tls.established"), Some(&serde_json::json!(true)));
        assert!(fields.contains("tls.rtt.handshake.us"));
        assert_eq!(fields.get("tls.version"), Some(&serde_json::json!("1.3")));
        assert_eq!(fields.get("tls.version_protocol"), Some(&serde_json::json!("tls")));
        assert!(fields.contains("tls.cipher"));
        assert!(fields.contains("tls.server.hash.sha1"));
        assert!(fields.contains("tls.certificate_not_valid_before"));
        assert!(fields.contains("tls.certificate_not_valid_after"));
        assert!(fields.contains("tcp.rtt.connect.us"));
    }

    #[tokio::test]
    async fn untrusted_certificate_fails_in_full_mode() {
        let (_pem, addr) = spawn_tls_server(&["localhost"], b"pong").await;
        let settings = TlsSettings::from_config(&SslConfig::default()).unwrap();
        let dialer = TlsLayer::new(settings, Duration::from_secs(2))
            .wrap(base())
            .unwrap();

        let mut fields = Fields::new();
        let err = dialer
            .dial(Network::Tcp, &format!("localhost:{}", addr.port()), &mut fields)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::Tls { .. }));
        assert!(!fields.contains("tls.established"));
    }

    #[tokio::test]
    async fn verification_none_accepts_any_certificate() {
        let (_pem, addr) = spawn_tls_server(&["other.test"], b"pong").await;
        let settings = TlsSettings::from_config(&SslConfig {
            verification_mode: VerificationMode::None,
            ..SslConfig::default()
        })
        .unwrap();
        let dialer = TlsLayer::new(settings, Duration::from_secs(2))
            .wrap(base())
            .unwrap();

        let mut fields = Fields::new();
        dialer
            .dial(Network::Tcp, &format!("localhost:{}", addr.port()), &mut fields)
            .await
            .unwrap();
        assert_eq!(
            fields.get("tls.server.x509.alternative_names"),
            Some(&serde_json::json!(["other.test"]))
        );
    }

    #[tokio::test]
    async fn certificate_mode_ignores_only_the_name() {
        let (pem, addr) = spawn_tls_server(&["other.test"], b"pong").await;
        let address = format!("localhost:{}", addr.port());

        for (mode, accepted) in [
            (VerificationMode::Certificate, true),
            (VerificationMode::Full, false),
        ] {
            let settings = TlsSettings::from_config(&SslConfig {
                verification_mode: mode,
                certificate_authorities: vec![pem.clone()],
                ..SslConfig::default()
            })
            .unwrap();
            let dialer = TlsLayer::new(settings, Duration::from_secs(2))
                .wrap(base())
                .unwrap();
            let mut fields = Fields::new();
            let result = dialer.dial(Network::Tcp, &address, &mut fields).await;
            assert_eq!(result.is_ok(), accepted, "{mode:?}");
        }
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and never answer the ClientHello.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let settings = TlsSettings::from_config(&SslConfig::default()).unwrap();
        let dialer = TlsLayer::new(settings, Duration::from_millis(200))
            .wrap(base())
            .unwrap();
        let mut fields = Fields::new();
        let err = dialer
            .dial(Network::Tcp, &format!("127.0.0.1:{port}"), &mut fields)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::TlsTimeout { .. }));
    }

    #[test]
    fn zero_timeout_is_a_configuration_error() {
        let settings = TlsSettings::from_config(&SslConfig::default()).unwrap();
        let layer = TlsLayer::new(settings, Duration::ZERO);
        assert!(matches!(
            layer.wrap(Arc::new(crate::dialchain::NoopDialer)),
            Err(DialError::Config(_))
        ));
    }
}
