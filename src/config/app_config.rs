use std::env;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts},
};

use super::ConfigError;
use super::model::Config;
use crate::dialchain::net::{Resolve, SystemResolver};

pub struct AppConfig {
    pub config: Config,
    pub dns_hosts: Vec<String>,
    pub max_monitor_width: usize,
}

/// Load the monitors from the YAML file named by `CONFIG_FILE` (default
/// `config.yml`) and the resolver list from `DNS_HOSTS`.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let _ = dotenvy::dotenv();

    let config_file_location =
        env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yml".to_string());
    let config_str =
        std::fs::read_to_string(&config_file_location).map_err(|source| ConfigError::Read {
            path: config_file_location.clone(),
            source,
        })?;

    let config = parse_config(&config_str)?;

    let dns_hosts = parse_dns_hosts(
        &env::var("DNS_HOSTS").unwrap_or_else(|_| "1.1.1.1,8.8.8.8".to_string()),
    );
    log::info!(
        "Loaded {} monitors from {config_file_location}, using DNS hosts: {:?}",
        config.len(),
        dns_hosts
    );

    let max_monitor_width = config.keys().map(|id| id.len()).max().unwrap_or(10);

    Ok(AppConfig {
        config,
        dns_hosts,
        max_monitor_width,
    })
}

pub fn parse_config(source: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(source)?;
    for (id, monitor) in &config {
        if monitor.urls.is_empty() {
            return Err(ConfigError::Invalid(format!("monitor {id} has no urls")));
        }
        if monitor.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(format!(
                "monitor {id}: timeout_seconds must be positive"
            )));
        }
        if monitor.schedule_seconds == 0 {
            return Err(ConfigError::Invalid(format!(
                "monitor {id}: schedule_seconds must be positive"
            )));
        }
        if !monitor.ipv4 && !monitor.ipv6 {
            return Err(ConfigError::Invalid(format!(
                "monitor {id}: at least one of ipv4 or ipv6 must be enabled"
            )));
        }
    }
    Ok(config)
}

fn parse_dns_hosts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Build the resolver used by every dialer. `system` selects the operating
/// system resolver; anything else is a list of nameserver IPs queried over
/// TCP with 2 attempts, a 100ms timeout and a 1024 entry cache.
pub fn setup_resolver(dns_hosts: &[String]) -> Result<Arc<dyn Resolve>, ConfigError> {
    if dns_hosts.is_empty() || dns_hosts.iter().any(|h| h == "system") {
        return Ok(Arc::new(SystemResolver));
    }

    let mut opts = ResolverOpts::default();
    opts.attempts = 2;
    opts.timeout = Duration::from_millis(100);
    opts.cache_size = 1024;

    let mut name_servers = NameServerConfigGroup::new();

    for host in dns_hosts {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::DnsHost(host.clone()))?;
        name_servers.push(NameServerConfig {
            socket_addr: (ip, 53).into(),
            protocol: Protocol::Tcp,
            tls_dns_name: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
    }

    let resolver_config = ResolverConfig::from_parts(None, vec![], name_servers);
    Ok(Arc::new(TokioAsyncResolver::tokio(resolver_config, opts)))
}
