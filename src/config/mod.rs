pub mod app_config;
pub mod model;

use thiserror::Error;

use crate::dialchain::DialError;
use crate::http_probe::check::CheckConfigError;
use crate::http_probe::encoder::EncoderError;
use crate::tls::TlsConfigError;

/// Problems found while loading configuration or building monitors. These
/// stop a monitor from ever running; they are never reported as probe
/// failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid url {url}: {message}")]
    Url { url: String, message: String },
    #[error("{0}")]
    Invalid(String),
    #[error("invalid DNS host {0}")]
    DnsHost(String),
    #[error(transparent)]
    Tls(#[from] TlsConfigError),
    #[error(transparent)]
    Check(#[from] CheckConfigError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Dial(#[from] DialError),
}
