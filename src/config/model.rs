use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::http_probe::check::ResponseCheckConfig;
use crate::http_probe::encoder::CompressionConfig;
use crate::tls::SslConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_schedule_seconds")]
    pub schedule_seconds: u64,

    pub urls: Vec<String>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub max_redirects: usize,

    #[serde(default)]
    pub mode: IpMode,

    #[serde(default = "default_true")]
    pub ipv4: bool,

    #[serde(default = "default_true")]
    pub ipv6: bool,

    pub proxy_url: Option<String>,

    #[serde(default)]
    pub proxy_use_local_resolver: bool,

    #[serde(default)]
    pub ssl: SslConfig,

    #[serde(default)]
    pub response: ResponseConfig,

    #[serde(default)]
    pub check: CheckConfig,
}

/// Which resolved addresses of a host are probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMode {
    /// One random address per run.
    #[default]
    Any,
    /// Every address, one event each.
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeBody {
    #[default]
    OnError,
    Never,
    Always,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseConfig {
    #[serde(default)]
    pub include_body: IncludeBody,

    #[serde(default = "default_include_body_max_bytes")]
    pub include_body_max_bytes: usize,

    #[serde(default = "default_true")]
    pub include_headers: bool,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        ResponseConfig {
            include_body: IncludeBody::default(),
            include_body_max_bytes: default_include_body_max_bytes(),
            include_headers: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckConfig {
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub response: ResponseCheckConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            method: default_method(),
            headers: BTreeMap::new(),
            body: String::new(),
            compression: CompressionConfig::default(),
        }
    }
}

fn default_schedule_seconds() -> u64 {
    60
}

fn default_timeout_seconds() -> u64 {
    16
}

fn default_include_body_max_bytes() -> usize {
    2048
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

/// Monitor id to monitor.
pub type Config = HashMap<String, MonitorConfig>;
