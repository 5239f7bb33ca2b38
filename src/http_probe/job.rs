//! Monitors and the jobs they schedule.
//!
//! An [`HttpMonitor`] is built once from configuration and hands out
//! [`Job`]s. A job either probes the configured host directly (when a SOCKS5
//! proxy resolves names for us), one fixed IP, one random IP of the host, or
//! every IP of the host.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue, LOCATION};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use url::{Host, Url};

use super::check::Validator;
use super::encoder::new_content_encoder;
use super::result::{ProbeError, ProbeResult};
use super::transport::{Exchange, SimpleTransport, TransportError};
use crate::config::ConfigError;
use crate::config::model::{IncludeBody, IpMode, MonitorConfig, ResponseConfig};
use crate::dialchain::net::{Resolve, resolve_host};
use crate::dialchain::socks::Socks5Settings;
use crate::dialchain::{Builder, BuilderSettings, DialError, join_host_port};
use crate::event::{Fields, Timer};
use crate::stats::ProbeStats;
use crate::tls::TlsSettings;

/// One configured URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: Url,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::Url {
            url: raw.to_string(),
            message: message.to_string(),
        };
        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        let host = host_of(&url).ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        Ok(Endpoint { url, host, port })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    fn static_fields(&self, monitor_id: &str) -> Fields {
        let mut fields = Fields::new();
        fields.put("monitor.id", monitor_id);
        fields.put("monitor.scheme", self.scheme());
        fields.put("monitor.host", self.host.as_str());
        fields.put("http.url", self.url.as_str());
        fields.put("tcp.port", self.port);
        fields
    }
}

/// Connect, SOCKS5 handshake and TLS handshake each get half the probe
/// timeout. The probe deadline still bounds the dial as a whole.
fn dial_timeout(timeout: Duration) -> Duration {
    timeout / 2
}

fn host_of(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(d) if d.is_empty() => None,
        Host::Domain(d) => Some(d.to_string()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

/// Immutable per-monitor state shared by every job and every probe.
struct ProbeSettings {
    id: String,
    method: Method,
    headers: HeaderMap,
    body: Vec<u8>,
    validator: Validator,
    response: ResponseConfig,
    timeout: Duration,
    max_redirects: usize,
    mode: IpMode,
    ipv4: bool,
    ipv6: bool,
    http: Builder,
    https: Option<Builder>,
    resolver: Arc<dyn Resolve>,
    stats: Arc<ProbeStats>,
}

pub struct HttpMonitor {
    settings: Arc<ProbeSettings>,
    endpoints: Vec<Arc<Endpoint>>,
    schedule: Duration,
}

impl std::fmt::Debug for HttpMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMonitor")
            .field("id", &self.settings.id)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl HttpMonitor {
    /// Validate `config` and prepare everything a probe needs. Any problem
    /// is reported here, before a probe runs.
    pub fn new(
        id: &str,
        config: &MonitorConfig,
        resolver: Arc<dyn Resolve>,
        stats: Arc<ProbeStats>,
    ) -> Result<Self, ConfigError> {
        let endpoints = config
            .urls
            .iter()
            .map(|raw| Endpoint::parse(raw).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(ConfigError::Invalid(format!("monitor {id} has no urls")));
        }

        let timeout = Duration::from_secs(config.timeout_seconds);
        if timeout.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "monitor {id}: timeout_seconds must be positive"
            )));
        }

        let socks5 = match &config.proxy_url {
            Some(raw) => {
                let url = Url::parse(raw).map_err(|e| ConfigError::Url {
                    url: raw.clone(),
                    message: e.to_string(),
                })?;
                Some(Socks5Settings::from_url(&url, config.proxy_use_local_resolver)?)
            }
            None => None,
        };

        let http = Builder::new(
            BuilderSettings {
                timeout: dial_timeout(timeout),
                socks5: socks5.clone(),
                tls: None,
            },
            resolver.clone(),
        )?;
        let https = if config.ssl.enabled == Some(false) {
            if endpoints.iter().any(|e| e.scheme() == "https") {
                return Err(ConfigError::Invalid(format!(
                    "monitor {id}: https urls need ssl enabled"
                )));
            }
            None
        } else {
            Some(Builder::new(
                BuilderSettings {
                    timeout: dial_timeout(timeout),
                    socks5,
                    tls: Some(TlsSettings::from_config(&config.ssl)?),
                },
                resolver.clone(),
            )?)
        };

        let request = &config.check.request;
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ConfigError::Invalid(format!("invalid method {}", request.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::Invalid(format!("invalid request header {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ConfigError::Invalid(format!("invalid value for header {name}")))?;
            headers.append(name, value);
        }

        let encoder = new_content_encoder(&request.compression)?;
        let mut body = Vec::new();
        if !request.body.is_empty() {
            encoder.add_headers(&mut headers);
            encoder
                .encode(&mut body, request.body.as_bytes())
                .map_err(|e| ConfigError::Invalid(format!("unable to encode request body: {e}")))?;
        }

        let validator = Validator::new(&config.check.response)?;

        let settings = ProbeSettings {
            id: id.to_string(),
            method,
            headers,
            body,
            validator,
            response: config.response.clone(),
            timeout,
            max_redirects: config.max_redirects,
            mode: config.mode,
            ipv4: config.ipv4,
            ipv6: config.ipv6,
            http,
            https,
            resolver,
            stats,
        };

        // Every endpoint must turn into a well-formed request.
        for endpoint in &endpoints {
            settings
                .request(&endpoint.url, settings.method.clone(), true)
                .map_err(|e| ConfigError::Url {
                    url: endpoint.url.to_string(),
                    message: e.to_string(),
                })?;
        }

        Ok(HttpMonitor {
            settings: Arc::new(settings),
            endpoints,
            schedule: Duration::from_secs(config.schedule_seconds),
        })
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn schedule(&self) -> Duration {
        self.schedule
    }

    /// One job per endpoint. Endpoints reached through a proxy that resolves
    /// names get a by-host job; the rest resolve and fan out per IP.
    pub fn jobs(&self) -> Vec<Job> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let via_proxy = self
                    .settings
                    .builder_for(endpoint.scheme())
                    .is_ok_and(|b| b.resolve_via_socks5());
                let kind = match (via_proxy, self.settings.mode) {
                    (true, _) => JobKind::Host,
                    (false, IpMode::Any) => JobKind::AnyIp,
                    (false, IpMode::All) => JobKind::AllIps,
                };
                self.job(endpoint.clone(), kind)
            })
            .collect()
    }

    /// A job for `endpoint` that always connects to `ip`.
    pub fn ip_job(&self, endpoint: &Endpoint, ip: IpAddr) -> Job {
        self.job(Arc::new(endpoint.clone()), JobKind::Ip(ip))
    }

    fn job(&self, endpoint: Arc<Endpoint>, kind: JobKind) -> Job {
        Job {
            settings: self.settings.clone(),
            endpoint,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Dial the configured host name; the proxy resolves it.
    Host,
    /// Dial one fixed address.
    Ip(IpAddr),
    /// Resolve, then probe one random address.
    AnyIp,
    /// Resolve, then probe every address.
    AllIps,
}

#[derive(Clone)]
pub struct Job {
    settings: Arc<ProbeSettings>,
    endpoint: Arc<Endpoint>,
    kind: JobKind,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("monitor", &self.settings.id)
            .field("url", &self.endpoint.url.as_str())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Run the job and return one event per probe. Resolution and every
    /// probe it fans out to share one deadline.
    pub async fn run(&self) -> Vec<Fields> {
        let deadline = tokio::time::Instant::now() + self.settings.timeout;
        match self.kind {
            JobKind::Host => vec![self.probe(None, Fields::new(), deadline).await],
            JobKind::Ip(ip) => vec![self.probe(Some(ip), Fields::new(), deadline).await],
            JobKind::AnyIp => {
                let (resolved, resolve_fields) = self.resolve(deadline).await;
                let ips = match resolved {
                    Ok(ips) => ips,
                    Err(err) => return vec![self.failed_resolve(resolve_fields, err)],
                };
                let Some(ip) = ips.choose(&mut rand::thread_rng()).copied() else {
                    return vec![self.failed_resolve(resolve_fields, DialError::NoRoute)];
                };
                vec![self.probe(Some(ip), resolve_fields, deadline).await]
            }
            JobKind::AllIps => {
                let (resolved, resolve_fields) = self.resolve(deadline).await;
                let ips = match resolved {
                    Ok(ips) => ips,
                    Err(err) => return vec![self.failed_resolve(resolve_fields, err)],
                };
                let handles: Vec<_> = ips
                    .into_iter()
                    .map(|ip| {
                        let job = Job {
                            kind: JobKind::Ip(ip),
                            ..self.clone()
                        };
                        let extra = resolve_fields.clone();
                        tokio::spawn(async move { job.probe(Some(ip), extra, deadline).await })
                    })
                    .collect();

                let mut events = Vec::with_capacity(handles.len());
                for handle in handles {
                    match handle.await {
                        Ok(event) => events.push(event),
                        Err(e) => log::error!("probe task for {} failed: {e}", self.endpoint.url),
                    }
                }
                events
            }
        }
    }

    async fn resolve(
        &self,
        deadline: tokio::time::Instant,
    ) -> (Result<Vec<IpAddr>, DialError>, Fields) {
        let settings = &self.settings;
        let mut fields = Fields::new();
        let started = Timer::start();
        let lookup = tokio::time::timeout_at(
            deadline,
            resolve_host(settings.resolver.as_ref(), &self.endpoint.host),
        )
        .await
        .unwrap_or_else(|_| {
            Err(DialError::Resolve {
                host: self.endpoint.host.clone(),
                message: "lookup timed out".into(),
            })
        });
        fields.put_rtt("resolve.rtt", started.stop().duration());

        let ips = lookup.map(|ips| {
            ips.into_iter()
                .filter(|ip| (ip.is_ipv4() && settings.ipv4) || (ip.is_ipv6() && settings.ipv6))
                .collect::<Vec<_>>()
        });
        let result = match ips {
            Ok(ips) if ips.is_empty() => Err(DialError::NoRoute),
            other => other,
        };
        (result, fields)
    }

    fn failed_resolve(&self, resolve_fields: Fields, err: DialError) -> Fields {
        let settings = &self.settings;
        settings.stats.probe_started();
        log::debug!(
            "monitor {}: unable to resolve {}: {err}",
            settings.id,
            self.endpoint.host
        );
        let duration = resolve_fields
            .get("resolve.rtt.us")
            .and_then(|v| v.as_u64())
            .map(Duration::from_micros)
            .unwrap_or_default();
        let mut fields = self.endpoint.static_fields(&settings.id);
        fields.merge(resolve_fields);
        let error = ProbeError::from(err);
        settings.stats.probe_finished(Some(error.error_type()));
        ProbeResult {
            fields,
            duration,
            error: Some(error),
        }
        .into_fields()
    }

    async fn probe(
        &self,
        pin: Option<IpAddr>,
        extra: Fields,
        deadline: tokio::time::Instant,
    ) -> Fields {
        let settings = &self.settings;
        settings.stats.probe_started();
        let started = Timer::start();

        let mut dynamic = extra;
        if let Some(ip) = pin {
            dynamic.put("monitor.ip", ip.to_string());
            dynamic.put("resolve.ip", ip.to_string());
        }
        let result = self.execute(pin, deadline, &mut dynamic).await;

        let mut fields = self.endpoint.static_fields(&settings.id);
        fields.merge(dynamic);

        let error = result.err();
        if let Some(err) = &error {
            log::debug!(
                "monitor {}: probe of {} failed: {}",
                settings.id,
                self.endpoint.url,
                super::report(err)
            );
        }
        settings
            .stats
            .probe_finished(error.as_ref().map(ProbeError::error_type));
        ProbeResult {
            fields,
            duration: started.stop().duration(),
            error,
        }
        .into_fields()
    }

    async fn execute(
        &self,
        pin: Option<IpAddr>,
        deadline: tokio::time::Instant,
        fields: &mut Fields,
    ) -> Result<(), ProbeError> {
        let settings = &self.settings;
        let endpoint = &self.endpoint;

        let dial_address = match pin {
            Some(ip) => join_host_port(&ip.to_string(), endpoint.port),
            None => endpoint.address(),
        };
        let dialer = settings.builder_for(endpoint.scheme())?.build(&dial_address)?;

        let mut request = settings.request(&endpoint.url, settings.method.clone(), true)?;
        fields.put("http.request.method", settings.method.as_str());
        fields.put("http.request.body.bytes", settings.body.len());

        let round_trip_start = Instant::now();
        let mut exchange = SimpleTransport::new(dialer)
            .round_trip(&mut request, deadline, fields)
            .await?;

        let mut current = endpoint.url.clone();
        let mut method = settings.method.clone();
        let mut redirects: Vec<String> = Vec::new();
        while redirects.len() < settings.max_redirects {
            let Some(next) = redirect_target(&current, &exchange.response)? else {
                break;
            };
            redirects.push(next.to_string());

            let status = exchange.response.status();
            let keep_body = status == StatusCode::TEMPORARY_REDIRECT
                || status == StatusCode::PERMANENT_REDIRECT;
            if !keep_body && method != Method::HEAD {
                method = Method::GET;
            }

            let host = host_of(&next).ok_or_else(|| ProbeError::Redirect {
                location: next.to_string(),
                message: "missing host".into(),
            })?;
            let port = next.port_or_known_default().unwrap_or(80);
            let dialer = settings
                .builder_for(next.scheme())?
                .build(&join_host_port(&host, port))?;

            let mut hop = settings.request(&next, method.clone(), keep_body)?;
            // Only the first connection is reported; hops use scratch fields.
            let mut hop_fields = Fields::new();
            exchange = SimpleTransport::new(dialer)
                .round_trip(&mut hop, deadline, &mut hop_fields)
                .await?;
            current = next;
        }
        if !redirects.is_empty() {
            fields.put("http.response.redirects", redirects);
        }

        let validating = Timer::start();
        let verdict = settings.validator.validate(&exchange.response);
        let validated = validating.stop();

        let trace = exchange.trace;
        fields.put_rtt(
            "http.rtt.write_request",
            Timer::between(trace.write_start, trace.write_end).duration(),
        );
        fields.put_rtt(
            "http.rtt.response_header",
            Timer::between(trace.write_start, trace.read_start).duration(),
        );
        fields.put_rtt(
            "http.rtt.content",
            Timer::between(trace.read_start, trace.body_end).duration(),
        );
        fields.put_rtt("http.rtt.validate", validated.duration());
        fields.put_rtt(
            "http.rtt.total",
            Timer::between(round_trip_start, validated.ended_at()).duration(),
        );

        settings.write_response_fields(&exchange, verdict.is_err(), fields);
        verdict?;
        Ok(())
    }
}

impl ProbeSettings {
    fn builder_for(&self, scheme: &str) -> Result<&Builder, ProbeError> {
        match scheme {
            "http" => Ok(&self.http),
            "https" => self.https.as_ref().ok_or_else(|| {
                ProbeError::Dial(DialError::Config("tls is disabled for this monitor".into()))
            }),
            other => Err(ProbeError::Transport(TransportError::InvalidRequest(format!(
                "unsupported protocol scheme {other:?}"
            )))),
        }
    }

    fn request(
        &self,
        url: &Url,
        method: Method,
        with_body: bool,
    ) -> Result<Request<Vec<u8>>, ProbeError> {
        let body = if with_body { self.body.clone() } else { Vec::new() };
        let mut request = Request::builder()
            .method(method)
            .uri(url.as_str())
            .body(body)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let mut headers = self.headers.clone();
        if !with_body {
            headers.remove(CONTENT_TYPE);
            headers.remove(CONTENT_ENCODING);
            headers.remove(CONTENT_LENGTH);
        }
        *request.headers_mut() = headers;
        Ok(request)
    }

    fn write_response_fields(&self, exchange: &Exchange, failed: bool, fields: &mut Fields) {
        let response = &exchange.response;
        let body = response.body();

        fields.put("http.response.status", response.status().as_u16());
        fields.put("http.response.body.bytes", exchange.body_bytes);
        fields.put("http.response.body.hash", hex::encode(Sha256::digest(body)));

        let include = match self.response.include_body {
            IncludeBody::Always => true,
            IncludeBody::Never => false,
            IncludeBody::OnError => failed,
        };
        if include && !body.is_empty() {
            let end = body.len().min(self.response.include_body_max_bytes);
            fields.put(
                "http.response.body.content",
                String::from_utf8_lossy(&body[..end]).into_owned(),
            );
        }

        if self.response.include_headers {
            for name in response.headers().keys() {
                let values: Vec<String> = response
                    .headers()
                    .get_all(name)
                    .iter()
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                    .collect();
                fields.put(
                    &format!("http.response.headers.{}", canonical_header_name(name.as_str())),
                    values.join(", "),
                );
            }
        }
    }
}

/// The next URL to visit when `response` is a redirect with a `Location`.
fn redirect_target(current: &Url, response: &Response<Vec<u8>>) -> Result<Option<Url>, ProbeError> {
    if !matches!(response.status().as_u16(), 301 | 302 | 303 | 307 | 308) {
        return Ok(None);
    }
    let Some(location) = response.headers().get(LOCATION) else {
        return Ok(None);
    };
    let location = String::from_utf8_lossy(location.as_bytes()).into_owned();
    let next = current.join(&location).map_err(|e| ProbeError::Redirect {
        location: location.clone(),
        message: e.to_string(),
    })?;
    if !matches!(next.scheme(), "http" | "https") {
        return Err(ProbeError::Redirect {
            location,
            message: format!("unsupported scheme {}", next.scheme()),
        });
    }
    Ok(Some(next))
}

/// `content-type` -> `Content-Type`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
