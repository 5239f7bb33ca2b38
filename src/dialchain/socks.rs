//! SOCKS5 proxy layer.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use super::net::{Resolve, resolve_host};
use super::{BoxDialer, BoxedStream, DialError, Dialer, Layer, Network, join_host_port, split_host_port};
use crate::event::{Fields, Timer};

/// Where the proxied target name is resolved.
///
/// With `Proxy` the hostname is sent verbatim and the proxy picks the address;
/// if the name has several addresses the probe no longer controls which one is
/// used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Resolution {
    Local,
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Settings {
    pub proxy_address: String,
    pub credentials: Option<(String, String)>,
    pub resolution: Socks5Resolution,
}

impl Socks5Settings {
    /// Parse a `socks5://[user:pass@]host:port` URL. `socks5h://` always
    /// resolves on the proxy.
    pub fn from_url(url: &Url, use_local_resolver: bool) -> Result<Self, DialError> {
        let resolution = match url.scheme() {
            "socks5" if use_local_resolver => Socks5Resolution::Local,
            "socks5" | "socks5h" => Socks5Resolution::Proxy,
            other => {
                return Err(DialError::Config(format!(
                    "unsupported proxy scheme {other}, expected socks5"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| DialError::Config(format!("proxy url {url} has no host")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port().unwrap_or(1080);

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            ))
        };

        Ok(Socks5Settings {
            proxy_address: join_host_port(host, port),
            credentials,
            resolution,
        })
    }
}

#[derive(Clone)]
pub struct Socks5Layer {
    settings: Arc<Socks5Settings>,
    resolver: Arc<dyn Resolve>,
}

impl Socks5Layer {
    pub fn new(settings: Socks5Settings, resolver: Arc<dyn Resolve>) -> Self {
        Socks5Layer {
            settings: Arc::new(settings),
            resolver,
        }
    }
}

impl std::fmt::Debug for Socks5Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Layer")
            .field("proxy", &self.settings.proxy_address)
            .field("resolution", &self.settings.resolution)
            .finish()
    }
}

impl Layer for Socks5Layer {
    fn wrap(&self, inner: BoxDialer) -> Result<BoxDialer, DialError> {
        split_host_port(&self.settings.proxy_address)?;
        Ok(Arc::new(Socks5Dialer {
            inner,
            settings: self.settings.clone(),
            resolver: self.resolver.clone(),
        }))
    }
}

struct Socks5Dialer {
    inner: BoxDialer,
    settings: Arc<Socks5Settings>,
    resolver: Arc<dyn Resolve>,
}

impl Socks5Dialer {
    async fn target(&self, address: &str) -> Result<(String, u16), DialError> {
        let (host, port) = split_host_port(address)?;
        match self.settings.resolution {
            Socks5Resolution::Proxy => Ok((host, port)),
            Socks5Resolution::Local => {
                let ips = resolve_host(self.resolver.as_ref(), &host).await?;
                let ip = ips
                    .choose(&mut rand::thread_rng())
                    .ok_or(DialError::NoRoute)?;
                Ok((ip.to_string(), port))
            }
        }
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(
        &self,
        network: Network,
        address: &str,
        fields: &mut Fields,
    ) -> Result<BoxedStream, DialError> {
        if !network.is_stream() {
            return Err(DialError::UnsupportedNetwork(format!("{network} over socks5")));
        }
        let (host, port) = self.target(address).await?;

        let conn = self
            .inner
            .dial(network, &self.settings.proxy_address, fields)
            .await?;

        let started = Timer::start();
        let target = (host.as_str(), port);
        let handshake = match &self.settings.credentials {
            Some((user, pass)) => {
                Socks5Stream::connect_with_password_and_socket(conn, target, user, pass).await
            }
            None => Socks5Stream::connect_with_socket(conn, target).await,
        };
        let stream = handshake.map_err(|source| DialError::Socks5 {
            proxy: self.settings.proxy_address.clone(),
            source,
        })?;
        fields.put_rtt("socks5.rtt.connect", started.stop().duration());

        Ok(Box::new(stream.into_inner()))
    }
}
