//! Layered, instrumented connection factories.
//!
//! A probe connection is produced by folding a base [`net::NetDialer`] through
//! an ordered list of [`Layer`]s (SOCKS5, address pinning, TLS). Each layer
//! wraps the dialer below it and records its own timings into the probe's
//! [`Fields`] while the connection is being established.

pub mod builder;
pub mod net;
pub mod socks;
pub mod tls;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::event::Fields;

pub use builder::{Builder, BuilderSettings};

/// Any bidirectional byte stream a dialer can hand back.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Connection factory shared by every layer of the chain.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `address` (`host:port`) over `network`, writing this
    /// layer's measurements into `fields`.
    async fn dial(
        &self,
        network: Network,
        address: &str,
        fields: &mut Fields,
    ) -> Result<BoxedStream, DialError>;
}

pub type BoxDialer = Arc<dyn Dialer>;

/// One protocol stage that wraps a lower-level dialer.
pub trait Layer: Send + Sync + fmt::Debug {
    fn wrap(&self, inner: BoxDialer) -> Result<BoxDialer, DialError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    /// Event namespace the base dialer writes under.
    pub fn namespace(&self) -> &'static str {
        match self {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => "tcp",
            Network::Udp | Network::Udp4 | Network::Udp6 => "udp",
        }
    }

    pub fn is_stream(&self) -> bool {
        self.namespace() == "tcp"
    }

    pub fn accepts(&self, ip: &std::net::IpAddr) -> bool {
        match self {
            Network::Tcp4 | Network::Udp4 => ip.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => ip.is_ipv6(),
            _ => true,
        }
    }
}

impl FromStr for Network {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(DialError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DialError {
    #[error("unsupported network type {0}")]
    UnsupportedNetwork(String),
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("dns lookup failure for {host}: {message}")]
    Resolve { host: String, message: String },
    #[error("no route to host")]
    NoRoute,
    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },
    #[error("socks5 proxy {proxy}: {source}")]
    Socks5 {
        proxy: String,
        #[source]
        source: tokio_socks::Error,
    },
    #[error("tls handshake with {server_name} failed: {source}")]
    Tls {
        server_name: String,
        #[source]
        source: io::Error,
    },
    #[error("tls handshake with {server_name} timed out after {timeout:?}")]
    TlsTimeout {
        server_name: String,
        timeout: Duration,
    },
    #[error("invalid tls server name {0}")]
    ServerName(String),
    #[error("layer configuration: {0}")]
    Config(String),
}

/// Split `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(address: &str) -> Result<(String, u16), DialError> {
    let invalid = |reason: &str| DialError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    if host.contains(':') && !address.starts_with('[') {
        return Err(invalid("IPv6 addresses must be bracketed"));
    }
    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok((host.to_string(), port))
}

/// Join a host and port into a dialable address, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// An ordered stack of layers over a shared base dialer.
///
/// Cloning copies the layer list only; the base is shared. A template chain is
/// built once per monitor and cloned for every probe.
#[derive(Clone)]
pub struct DialerChain {
    pub base: BoxDialer,
    pub layers: Vec<Arc<dyn Layer>>,
}

impl DialerChain {
    pub fn new(base: BoxDialer) -> Self {
        DialerChain {
            base,
            layers: Vec::new(),
        }
    }

    pub fn push(&mut self, layer: Arc<dyn Layer>) {
        self.layers.push(layer);
    }

    /// Fold the base dialer through every layer in order. The first layer
    /// wraps the base, the last layer is the one callers dial through.
    pub fn build(&self) -> Result<BoxDialer, DialError> {
        self.layers
            .iter()
            .try_fold(self.base.clone(), |dialer, layer| layer.wrap(dialer))
    }

    /// Static validity check run at configuration time: build the chain over a
    /// base that never connects.
    pub fn test_build(&self) -> Result<(), DialError> {
        let chain = DialerChain {
            base: Arc::new(NoopDialer),
            layers: self.layers.clone(),
        };
        chain.build().map(|_| ())
    }
}

impl fmt::Debug for DialerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialerChain")
            .field("layers", &self.layers)
            .finish()
    }
}

/// Base dialer used for configuration checks; refuses every connection.
#[derive(Debug, Clone, Copy)]
pub struct NoopDialer;

#[async_trait]
impl Dialer for NoopDialer {
    async fn dial(
        &self,
        network: Network,
        address: &str,
        _fields: &mut Fields,
    ) -> Result<BoxedStream, DialError> {
        Err(DialError::Connect {
            address: address.to_string(),
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no-op dialer does not connect ({network})"),
            ),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every address it is asked to dial and hands back an in-memory
    /// duplex stream.
    #[derive(Default)]
    pub struct RecordingDialer {
        pub dialed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(
            &self,
            _network: Network,
            address: &str,
            fields: &mut Fields,
        ) -> Result<BoxedStream, DialError> {
            self.dialed.lock().unwrap().push(address.to_string());
            fields.put("recording.address", address);
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client))
        }
    }
}
