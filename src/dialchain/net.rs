//! Base layer: resolve, shuffle and connect.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use trust_dns_resolver::TokioAsyncResolver;

use super::{BoxedStream, DialError, Dialer, Network, split_host_port};
use crate::event::{Fields, Timer};

/// Hostname resolution used by the dialers.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DialError>;
}

#[async_trait]
impl Resolve for TokioAsyncResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DialError> {
        let lookup = self.lookup_ip(host).await.map_err(|e| DialError::Resolve {
            host: host.to_string(),
            message: e.to_string(),
        })?;
        Ok(lookup.iter().collect())
    }
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DialError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| DialError::Resolve {
                host: host.to_string(),
                message: e.to_string(),
            })?;
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        Ok(ips)
    }
}

/// Resolve `host` unless it already is an IP literal.
pub async fn resolve_host(resolver: &dyn Resolve, host: &str) -> Result<Vec<IpAddr>, DialError> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(vec![ip]),
        Err(_) => resolver.lookup(host).await,
    }
}

/// Base dialer for `tcp*` and `udp*` networks.
///
/// DNS answer order is not trusted: when a name resolves to several addresses
/// they are tried in a random permutation until one connects.
pub struct NetDialer {
    resolver: Arc<dyn Resolve>,
    timeout: Duration,
}

impl NetDialer {
    pub fn new(resolver: Arc<dyn Resolve>, timeout: Duration) -> Self {
        NetDialer { resolver, timeout }
    }

    async fn connect_one(
        &self,
        network: Network,
        addr: SocketAddr,
    ) -> Result<BoxedStream, DialError> {
        let address = addr.to_string();
        let attempt = open(network, addr);

        match timeout(self.timeout, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(DialError::Connect { address, source }),
            Err(_) => Err(DialError::ConnectTimeout {
                address,
                timeout: self.timeout,
            }),
        }
    }
}

async fn open(network: Network, addr: SocketAddr) -> io::Result<BoxedStream> {
    if network.is_stream() {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        return Ok(Box::new(stream));
    }

    let local: SocketAddr = if addr.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(Box::new(UdpStream::new(socket)))
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(
        &self,
        network: Network,
        address: &str,
        fields: &mut Fields,
    ) -> Result<BoxedStream, DialError> {
        let (host, port) = split_host_port(address)?;

        let mut ips: Vec<IpAddr> = resolve_host(self.resolver.as_ref(), &host)
            .await?
            .into_iter()
            .filter(|ip| network.accepts(ip))
            .collect();
        if ips.is_empty() {
            return Err(DialError::NoRoute);
        }
        if ips.len() > 1 {
            ips.shuffle(&mut rand::thread_rng());
        }

        let namespace = network.namespace();
        let mut last_err = None;
        for ip in ips {
            let started = Timer::start();
            match self.connect_one(network, SocketAddr::new(ip, port)).await {
                Ok(stream) => {
                    let connect = started.stop();
                    fields.put(&format!("{namespace}.port"), port);
                    fields.put_rtt(&format!("{namespace}.rtt.connect"), connect.duration());
                    return Ok(stream);
                }
                Err(err) => {
                    log::debug!("dial {network} {ip}:{port} failed: {err}");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(DialError::NoRoute))
    }
}

/// A connected UDP socket exposed as a byte stream; each write is one datagram
/// and each read receives one.
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    fn new(socket: UdpSocket) -> Self {
        UdpStream { socket }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let sent = ready!(self.socket.poll_send(cx, buf))?;
        Poll::Ready(Ok(sent))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
