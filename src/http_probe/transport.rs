//! A single-shot HTTP/1.1 transport with per-phase timestamps.
//!
//! Every call dials one connection, writes the request and reads the
//! response on two separate tasks, and closes the connection. No pooling,
//! no retries, no redirects.

use std::io::{self, Read};
use std::time::Instant;

use flate2::read::GzDecoder;
use hyper::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST, HeaderName, HeaderValue,
    TRANSFER_ENCODING, USER_AGENT,
};
use hyper::{Method, Request, Response, StatusCode, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dialchain::{BoxDialer, BoxedStream, DialError, Network, join_host_port};
use crate::event::Fields;

/// Bytes of body kept in memory; the rest is read and counted.
pub const MAX_BUFFERED_BODY: usize = 1024 * 1024;

const MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 8 * 1024;

pub const DEFAULT_USER_AGENT: &str = concat!("heartprobe/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("timed out while dialing")]
    DialTimeout,
    #[error("error writing request: {0}")]
    Write(#[source] io::Error),
    #[error("error reading response: {0}")]
    Read(#[source] io::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("timed out writing request")]
    TimeoutWriting,
    #[error("timed out waiting for response")]
    TimeoutReading,
    #[error("unable to decode gzip body: {0}")]
    Decode(#[source] io::Error),
}

/// Instants recorded during one round trip.
#[derive(Debug, Clone, Copy)]
pub struct Trace {
    pub write_start: Instant,
    pub write_end: Instant,
    /// First response byte available.
    pub read_start: Instant,
    /// Body fully read.
    pub body_end: Instant,
}

#[derive(Debug)]
pub struct Exchange {
    /// Response with its body truncated to [`MAX_BUFFERED_BODY`] and gzip
    /// removed when the transport negotiated it.
    pub response: Response<Vec<u8>>,
    pub trace: Trace,
    /// Body size on the wire, including anything drained past the buffer.
    pub body_bytes: u64,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct SimpleTransport {
    dialer: BoxDialer,
    disable_compression: bool,
}

impl std::fmt::Debug for SimpleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleTransport")
            .field("disable_compression", &self.disable_compression)
            .finish()
    }
}

impl SimpleTransport {
    pub fn new(dialer: BoxDialer) -> Self {
        SimpleTransport {
            dialer,
            disable_compression: false,
        }
    }

    pub fn disable_compression(mut self, disable: bool) -> Self {
        self.disable_compression = disable;
        self
    }

    /// Perform one round trip, giving up at `deadline`.
    ///
    /// Dial measurements land in `fields`. An `Accept-Encoding` header added
    /// by the transport is removed from `request` again before returning.
    pub async fn round_trip(
        &self,
        request: &mut Request<Vec<u8>>,
        deadline: tokio::time::Instant,
        fields: &mut Fields,
    ) -> Result<Exchange, TransportError> {
        let address = validate(request)?;

        let requested_gzip = !self.disable_compression
            && !request.headers().contains_key(ACCEPT_ENCODING)
            && request.headers().get(hyper::header::RANGE).is_none();
        if requested_gzip {
            request
                .headers_mut()
                .insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let result = self.exchange(request, &address, deadline, fields).await;

        if requested_gzip {
            request.headers_mut().remove(ACCEPT_ENCODING);
        }

        let mut exchange = result?;
        if requested_gzip {
            ungzip(&mut exchange)?;
        }
        Ok(exchange)
    }

    async fn exchange(
        &self,
        request: &Request<Vec<u8>>,
        address: &str,
        deadline: tokio::time::Instant,
        fields: &mut Fields,
    ) -> Result<Exchange, TransportError> {
        let conn = tokio::time::timeout_at(
            deadline,
            self.dialer.dial(Network::Tcp, address, fields),
        )
        .await
        .map_err(|_| TransportError::DialTimeout)??;

        let payload = serialize(request);
        let head_only = request.method() == Method::HEAD;
        let (reader, mut writer) = tokio::io::split(conn);

        let token = CancellationToken::new();
        let (write_tx, mut write_rx) = oneshot::channel();
        let (read_tx, mut read_rx) = oneshot::channel();

        let cancelled = token.clone();
        tokio::spawn(async move {
            let write_start = Instant::now();
            let result = tokio::select! {
                _ = cancelled.cancelled() => return,
                r = async {
                    writer.write_all(&payload).await?;
                    writer.flush().await
                } => r,
            };
            let _ = write_tx.send(result.map(|_| (write_start, Instant::now())));
            // Keep the write half open until the read side is finished; some
            // servers close on half-close.
            cancelled.cancelled().await;
        });

        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                r = read_response(reader, head_only) => {
                    let _ = read_tx.send(r);
                }
            }
        });

        // Both tasks exit once the token fires, which drops both halves and
        // closes the connection on every path.
        let _guard = token.drop_guard();

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut written = None;
        let mut read = None;
        while written.is_none() || read.is_none() {
            tokio::select! {
                w = &mut write_rx, if written.is_none() => {
                    match w {
                        Ok(Ok(times)) => written = Some(times),
                        Ok(Err(e)) => return Err(TransportError::Write(e)),
                        Err(_) => return Err(TransportError::Write(io::ErrorKind::BrokenPipe.into())),
                    }
                }
                r = &mut read_rx, if read.is_none() => {
                    match r {
                        Ok(result) => read = Some(result?),
                        Err(_) => return Err(TransportError::Read(io::ErrorKind::BrokenPipe.into())),
                    }
                }
                _ = &mut sleep => {
                    return Err(if written.is_none() {
                        TransportError::TimeoutWriting
                    } else {
                        TransportError::TimeoutReading
                    });
                }
            }
        }

        let (Some((write_start, write_end)), Some(read)) = (written, read) else {
            return Err(TransportError::Malformed("incomplete exchange".into()));
        };
        // The write task may record its end after the reader saw the first
        // byte; the trace stays ordered.
        let read_start = read.read_start.max(write_end);
        Ok(Exchange {
            response: read.response,
            trace: Trace {
                write_start,
                write_end,
                read_start,
                body_end: read.body_end.max(read_start),
            },
            body_bytes: read.body_bytes,
            truncated: read.truncated,
        })
    }
}

/// Check the request and return the address to dial.
fn validate(request: &Request<Vec<u8>>) -> Result<String, TransportError> {
    let uri = request.uri();
    let default_port = match uri.scheme_str() {
        Some("http") => 80,
        Some("https") => 443,
        Some(other) => {
            return Err(TransportError::InvalidRequest(format!(
                "unsupported protocol scheme {other:?}"
            )));
        }
        None => return Err(TransportError::InvalidRequest("missing protocol scheme".into())),
    };
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidRequest(format!("no host in request URL {uri}")))?;
    Ok(join_host_port(host, uri.port_u16().unwrap_or(default_port)))
}

fn serialize(request: &Request<Vec<u8>>) -> Vec<u8> {
    let uri = request.uri();
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target = if target.is_empty() { "/" } else { target };

    let mut out = Vec::with_capacity(256 + request.body().len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method(), target).as_bytes());

    let headers = request.headers();
    if !headers.contains_key(HOST) {
        let host = uri.authority().map(|a| a.as_str()).unwrap_or_default();
        let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    if !headers.contains_key(USER_AGENT) {
        out.extend_from_slice(format!("User-Agent: {DEFAULT_USER_AGENT}\r\n").as_bytes());
    }
    if !headers.contains_key(CONNECTION) {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    let body = request.body();
    let method_has_body = matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH);
    if !headers.contains_key(CONTENT_LENGTH) && (!body.is_empty() || method_has_body) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

struct ReadOutcome {
    response: Response<Vec<u8>>,
    read_start: Instant,
    body_end: Instant,
    body_bytes: u64,
    truncated: bool,
}

/// Buffered reader over the response half with a byte sink for the body.
struct BodyReader<R> {
    inner: R,
    pending: Vec<u8>,
}

struct BodySink {
    data: Vec<u8>,
    total: u64,
}

impl BodySink {
    fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = MAX_BUFFERED_BODY.saturating_sub(self.data.len());
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

impl<R: AsyncRead + Unpin> BodyReader<R> {
    /// Read more bytes into `pending`; returns 0 on EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn copy_exact(&mut self, mut n: u64, sink: &mut BodySink) -> io::Result<()> {
        while n > 0 {
            if self.pending.is_empty() && self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let take = self.pending.len().min(usize::try_from(n).unwrap_or(usize::MAX));
            sink.push(&self.pending[..take]);
            self.pending.drain(..take);
            n -= take as u64;
        }
        Ok(())
    }

    async fn copy_to_end(&mut self, sink: &mut BodySink) -> io::Result<()> {
        sink.push(&self.pending);
        self.pending.clear();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            sink.push(&chunk[..n]);
        }
    }

    async fn line(&mut self) -> io::Result<String> {
        loop {
            if let Some(end) = self.pending.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&self.pending[..end]).into_owned();
                self.pending.drain(..end + 2);
                return Ok(line);
            }
            if self.pending.len() > MAX_HEAD {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    async fn copy_chunked(&mut self, sink: &mut BodySink) -> io::Result<()> {
        loop {
            let line = self.line().await?;
            let size = line.split(';').next().unwrap_or_default().trim();
            let size = u64::from_str_radix(size, 16).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, format!("invalid chunk size {size:?}"))
            })?;
            if size == 0 {
                // Trailers end with an empty line.
                while !self.line().await?.is_empty() {}
                return Ok(());
            }
            self.copy_exact(size, sink).await?;
            if !self.line().await?.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "missing chunk terminator",
                ));
            }
        }
    }
}

async fn read_response(
    reader: ReadHalf<BoxedStream>,
    head_only: bool,
) -> Result<ReadOutcome, TransportError> {
    let mut body = BodyReader {
        inner: reader,
        pending: Vec::with_capacity(READ_CHUNK),
    };

    if body.fill().await.map_err(TransportError::Read)? == 0 {
        return Err(TransportError::Read(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response",
        )));
    }
    let read_start = Instant::now();

    let mut response = loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&body.pending) {
            Ok(httparse::Status::Complete(len)) => {
                let response = build_head(&parsed)?;
                body.pending.drain(..len);
                let status = response.status();
                if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                    // Interim response; the final one follows.
                    continue;
                }
                break response;
            }
            Ok(httparse::Status::Partial) => {
                if body.pending.len() > MAX_HEAD {
                    return Err(TransportError::Malformed("response head too large".into()));
                }
                if body.fill().await.map_err(TransportError::Read)? == 0 {
                    return Err(TransportError::Malformed("truncated response head".into()));
                }
            }
            Err(e) => return Err(TransportError::Malformed(e.to_string())),
        }
    };

    let mut sink = BodySink {
        data: Vec::new(),
        total: 0,
    };
    let status = response.status();
    let bodiless = head_only
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    if !bodiless {
        let chunked = response
            .headers()
            .get_all(TRANSFER_ENCODING)
            .iter()
            .any(|v| v.to_str().is_ok_and(|s| s.to_ascii_lowercase().contains("chunked")));
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .map_err(|_| TransportError::Malformed("invalid content-length".into()))?;

        let copied = match (chunked, length) {
            (true, _) => body.copy_chunked(&mut sink).await,
            (false, Some(n)) => body.copy_exact(n, &mut sink).await,
            (false, None) => body.copy_to_end(&mut sink).await,
        };
        copied.map_err(TransportError::Read)?;
    }
    let body_end = Instant::now();

    let truncated = sink.total > sink.data.len() as u64;
    *response.body_mut() = sink.data;
    Ok(ReadOutcome {
        response,
        read_start,
        body_end,
        body_bytes: sink.total,
        truncated,
    })
}

fn build_head(parsed: &httparse::Response<'_, '_>) -> Result<Response<Vec<u8>>, TransportError> {
    let code = parsed
        .code
        .ok_or_else(|| TransportError::Malformed("missing status code".into()))?;
    let status =
        StatusCode::from_u16(code).map_err(|e| TransportError::Malformed(e.to_string()))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Response::builder().status(status).version(version);
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        builder = builder.header(name, value);
    }
    builder
        .body(Vec::new())
        .map_err(|e| TransportError::Malformed(e.to_string()))
}

fn ungzip(exchange: &mut Exchange) -> Result<(), TransportError> {
    let headers = exchange.response.headers();
    let gzipped = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));
    if !gzipped || exchange.response.body().is_empty() {
        return Ok(());
    }

    let compressed = std::mem::take(exchange.response.body_mut());
    let mut decoded = Vec::new();
    let result = GzDecoder::new(compressed.as_slice())
        .take(MAX_BUFFERED_BODY as u64)
        .read_to_end(&mut decoded);
    match result {
        Ok(_) => {}
        // A body cut short at the buffer limit decodes partially.
        Err(_) if exchange.truncated => {}
        Err(e) => return Err(TransportError::Decode(e)),
    }

    let headers = exchange.response.headers_mut();
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
    *exchange.response.body_mut() = decoded;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::dialchain::net::{NetDialer, SystemResolver};

    /// Serve one connection: capture the request head, then reply with
    /// `response`. Requests are forwarded on the returned channel.
    async fn serve_once(response: Vec<u8>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            socket.write_all(&response).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        (format!("http://{addr}"), rx)
    }

    fn transport() -> SimpleTransport {
        SimpleTransport::new(Arc::new(NetDialer::new(
            Arc::new(SystemResolver),
            Duration::from_secs(2),
        )))
    }

    fn request(url: &str) -> Request<Vec<u8>> {
        Request::builder().uri(url).body(Vec::new()).unwrap()
    }

    fn deadline(secs: u64) -> tokio::time::Instant {
        tokio::time::Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn content_length_body_and_trace_order() {
        let (url, mut requests) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: yes\r\n\r\nhello".to_vec())
                .await;
        let mut req = request(&format!("{url}/health?x=1"));
        let mut fields = Fields::new();
        let exchange = transport()
            .round_trip(&mut req, deadline(5), &mut fields)
            .await
            .unwrap();

        assert_eq!(exchange.response.status(), StatusCode::OK);
        assert_eq!(exchange.response.body(), b"hello");
        assert_eq!(exchange.response.headers()["x-test"], "yes");
        assert_eq!(exchange.body_bytes, 5);
        assert!(!exchange.truncated);

        let t = exchange.trace;
        assert!(t.write_start <= t.write_end);
        assert!(t.write_end <= t.read_start);
        assert!(t.read_start <= t.body_end);
        assert!(fields.contains("tcp.rtt.connect.us"));

        let head = requests.recv().await.unwrap();
        assert!(head.starts_with("GET /health?x=1 HTTP/1.1\r\n"));
        assert!(head.contains("accept-encoding: gzip\r\n"));
        assert!(head.contains("Host: 127.0.0.1:"));
    }

    #[tokio::test]
    async fn gzip_is_negotiated_and_removed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"status\":\"up\"}").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        response.extend_from_slice(&compressed);
        let (url, _requests) = serve_once(response).await;

        let mut req = request(&url);
        let mut fields = Fields::new();
        let exchange = transport()
            .round_trip(&mut req, deadline(5), &mut fields)
            .await
            .unwrap();

        assert_eq!(exchange.response.body(), b"{\"status\":\"up\"}");
        assert!(!exchange.response.headers().contains_key(CONTENT_ENCODING));
        assert!(!req.headers().contains_key(ACCEPT_ENCODING));
        assert_eq!(exchange.body_bytes, compressed.len() as u64);
    }

    #[tokio::test]
    async fn caller_accept_encoding_is_left_alone() {
        let (url, mut requests) =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()).await;
        let mut req = request(&url);
        req.headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        let mut fields = Fields::new();
        transport()
            .round_trip(&mut req, deadline(5), &mut fields)
            .await
            .unwrap();
        assert_eq!(req.headers()[ACCEPT_ENCODING], "identity");
        assert!(requests.recv().await.unwrap().contains("accept-encoding: identity"));
    }

    #[tokio::test]
    async fn chunked_and_read_to_eof_bodies() {
        let (url, _) = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nTrailer: x\r\n\r\n"
                .to_vec(),
        )
        .await;
        let mut fields = Fields::new();
        let exchange = transport()
            .round_trip(&mut request(&url), deadline(5), &mut fields)
            .await
            .unwrap();
        assert_eq!(exchange.response.body(), b"Wikipedia");

        let (url, _) = serve_once(b"HTTP/1.0 200 OK\r\n\r\nuntil close".to_vec()).await;
        let mut fields = Fields::new();
        let exchange = transport()
            .round_trip(&mut request(&url), deadline(5), &mut fields)
            .await
            .unwrap();
        assert_eq!(exchange.response.body(), b"until close");
        assert_eq!(exchange.response.version(), Version::HTTP_10);
    }

    #[tokio::test]
    async fn oversized_body_is_drained_and_counted() {
        let size = MAX_BUFFERED_BODY + 4096;
        let mut response = format!("HTTP/1.1 200 OK\r\nContent-Length: {size}\r\n\r\n").into_bytes();
        response.extend(std::iter::repeat_n(b'a', size));
        let (url, _) = serve_once(response).await;

        let mut fields = Fields::new();
        let exchange = transport()
            .round_trip(&mut request(&url), deadline(10), &mut fields)
            .await
            .unwrap();
        assert_eq!(exchange.response.body().len(), MAX_BUFFERED_BODY);
        assert_eq!(exchange.body_bytes, size as u64);
        assert!(exchange.truncated);
    }

    #[tokio::test]
    async fn head_and_no_content_have_no_body() {
        let (url, _) =
            serve_once(b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()).await;
        let mut fields = Fields::new();
        let exchange = transport()
            .round_trip(&mut request(&url), deadline(5), &mut fields)
            .await
            .unwrap();
        assert_eq!(exchange.response.status(), StatusCode::NO_CONTENT);
        assert!(exchange.response.body().is_empty());
    }

    #[tokio::test]
    async fn silent_server_times_out_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut req = request(&format!("http://{addr}/"));
        let mut fields = Fields::new();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        let err = transport()
            .round_trip(&mut req, deadline, &mut fields)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TimeoutReading));
        assert!(!req.headers().contains_key(ACCEPT_ENCODING));
    }

    #[tokio::test]
    async fn peer_that_never_reads_times_out_writing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Hold the connection without reading so the send buffers fill.
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}/upload"))
            .body(vec![b'x'; 32 * 1024 * 1024])
            .unwrap();
        let mut fields = Fields::new();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        let err = transport()
            .round_trip(&mut req, deadline, &mut fields)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TimeoutWriting), "{err:?}");
        assert!(fields.contains("tcp.rtt.connect.us"));
    }

    struct StalledDialer;

    #[async_trait::async_trait]
    impl crate::dialchain::Dialer for StalledDialer {
        async fn dial(
            &self,
            _network: Network,
            _address: &str,
            _fields: &mut Fields,
        ) -> Result<BoxedStream, DialError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn deadline_stops_a_stalled_dial() {
        let transport = SimpleTransport::new(Arc::new(StalledDialer));
        let mut req = request("http://stalled.test/");
        let mut fields = Fields::new();

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        let err = transport
            .round_trip(&mut req, deadline, &mut fields)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::DialTimeout), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!req.headers().contains_key(ACCEPT_ENCODING));
    }

    #[tokio::test]
    async fn interim_responses_are_skipped() {
        let (url, _) = serve_once(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </style.css>; rel=preload\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
                .to_vec(),
        )
        .await;
        let mut fields = Fields::new();
        let exchange = transport()
            .round_trip(&mut request(&url), deadline(5), &mut fields)
            .await
            .unwrap();
        assert_eq!(exchange.response.status(), StatusCode::OK);
        assert_eq!(exchange.response.body(), b"ok");
        assert!(!exchange.response.headers().contains_key("link"));
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let mut fields = Fields::new();
        for url in ["ftp://example.com/", "/relative"] {
            let err = transport()
                .round_trip(&mut request(url), deadline(1), &mut fields)
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::InvalidRequest(_)), "{url}");
        }
    }

    #[tokio::test]
    async fn malformed_status_line() {
        let (url, _) = serve_once(b"SSH-2.0-OpenSSH\r\n\r\n".to_vec()).await;
        let mut fields = Fields::new();
        let err = transport()
            .round_trip(&mut request(&url), deadline(5), &mut fields)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[test]
    fn serialize_adds_framing_headers() {
        let mut req = Request::builder()
            .method(Method::POST)
            .uri("http://user:pw@example.com:8080/submit")
            .body(b"{}".to_vec())
            .unwrap();
        req.headers_mut()
            .insert("x-custom", HeaderValue::from_static("1"));
        let text = String::from_utf8(serialize(&req)).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\nHost: example.com:8080\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("x-custom: 1\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }
}
