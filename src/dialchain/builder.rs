//! Per-monitor dialer templates with address pinning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::net::{NetDialer, Resolve};
use super::socks::{Socks5Layer, Socks5Resolution, Socks5Settings};
use super::tls::TlsLayer;
use super::{BoxDialer, BoxedStream, DialError, Dialer, DialerChain, Layer, Network};
use crate::event::Fields;
use crate::tls::TlsSettings;

#[derive(Debug, Clone)]
pub struct BuilderSettings {
    /// Timeout for the base connect and for the TLS handshake.
    pub timeout: Duration,
    pub socks5: Option<Socks5Settings>,
    pub tls: Option<TlsSettings>,
}

/// A dialer template for one monitor.
///
/// The chain is `[socks5?, pin, tls?]` over a [`NetDialer`]. The pin slot
/// holds a pass-through placeholder in the template; [`Builder::build`]
/// replaces it in a clone so the socket goes to the requested address while
/// the TLS layer above keeps using the logical host for SNI.
#[derive(Debug)]
pub struct Builder {
    template: DialerChain,
    addr_pin_index: usize,
    resolve_via_socks5: bool,
}

impl Builder {
    pub fn new(settings: BuilderSettings, resolver: Arc<dyn Resolve>) -> Result<Self, DialError> {
        let base = Arc::new(NetDialer::new(resolver.clone(), settings.timeout));
        let mut template = DialerChain::new(base);

        let mut resolve_via_socks5 = false;
        if let Some(socks5) = settings.socks5 {
            resolve_via_socks5 = socks5.resolution == Socks5Resolution::Proxy;
            template.push(Arc::new(Socks5Layer::new(socks5, resolver)));
        }

        template.push(Arc::new(AddrPinLayer::placeholder()));
        let addr_pin_index = template.layers.len() - 1;

        if let Some(tls) = settings.tls {
            template.push(Arc::new(TlsLayer::new(tls, settings.timeout)));
        }

        let builder = Builder {
            template,
            addr_pin_index,
            resolve_via_socks5,
        };
        builder.test_build()?;
        Ok(builder)
    }

    /// Produce a dialer whose connections always go to `addr` (`host:port`).
    pub fn build(&self, addr: &str) -> Result<BoxDialer, DialError> {
        let mut chain = self.template.clone();
        chain.layers[self.addr_pin_index] = Arc::new(AddrPinLayer::pinned(addr));
        chain.build()
    }

    pub fn test_build(&self) -> Result<(), DialError> {
        self.template.test_build()
    }

    /// True when the proxy resolves target names, in which case jobs are
    /// built per host rather than per resolved IP.
    pub fn resolve_via_socks5(&self) -> bool {
        self.resolve_via_socks5
    }

    pub fn has_tls(&self) -> bool {
        self.template.layers.len() > self.addr_pin_index + 1
    }
}

/// Address pinning slot. Without an address it passes the dialer below
/// through unchanged.
#[derive(Debug, Clone)]
pub struct AddrPinLayer {
    addr: Option<String>,
}

impl AddrPinLayer {
    pub fn placeholder() -> Self {
        AddrPinLayer { addr: None }
    }

    pub fn pinned(addr: &str) -> Self {
        AddrPinLayer {
            addr: Some(addr.to_string()),
        }
    }
}

impl Layer for AddrPinLayer {
    fn wrap(&self, inner: BoxDialer) -> Result<BoxDialer, DialError> {
        match &self.addr {
            None => Ok(inner),
            Some(addr) => {
                super::split_host_port(addr)?;
                Ok(Arc::new(PinnedDialer {
                    inner,
                    addr: addr.clone(),
                }))
            }
        }
    }
}

struct PinnedDialer {
    inner: BoxDialer,
    addr: String,
}

#[async_trait]
impl Dialer for PinnedDialer {
    async fn dial(
        &self,
        network: Network,
        _address: &str,
        fields: &mut Fields,
    ) -> Result<BoxedStream, DialError> {
        self.inner.dial(network, &self.addr, fields).await
    }
}
