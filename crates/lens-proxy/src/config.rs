use std::net::IpAddr;
use std::time::Duration;

use crate::ProxyError;

/// Engine configuration. Everything is optional with workable defaults; a
/// default config listens on an ephemeral port, intercepts TLS, and keeps
/// the last 1000 records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: IpAddr,
    /// `None` binds an ephemeral port.
    pub listen_port: Option<u16>,
    /// Empty means direct connections to origin servers.
    pub upstream_proxy: Option<UpstreamProxy>,
    /// Hosts that bypass interception. `*.example.com` matches any
    /// subdomain depth; a bare name matches exactly.
    pub excluded_hosts: Vec<String>,
    pub intercept_tls: bool,
    /// Skip verification on the server-facing TLS leg. Test rigs only.
    pub upstream_tls_insecure: bool,
    pub max_body_bytes: usize,
    pub max_head_bytes: usize,
    pub leaf_cache_ttl: Duration,
    pub max_records: usize,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub classify_read: Duration,
    pub response_headers: Duration,
    pub tunnel_idle: Duration,
    pub tls_handshake: Duration,
    pub upstream_connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            classify_read: Duration::from_secs(10),
            response_headers: Duration::from_secs(30),
            tunnel_idle: Duration::from_secs(120),
            tls_handshake: Duration::from_secs(15),
            upstream_connect: Duration::from_secs(10),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: IpAddr::from([127, 0, 0, 1]),
            listen_port: None,
            upstream_proxy: None,
            excluded_hosts: Vec::new(),
            intercept_tls: true,
            upstream_tls_insecure: false,
            max_body_bytes: 1024 * 1024,
            max_head_bytes: lens_http::MAX_HEAD_BYTES,
            leaf_cache_ttl: Duration::from_secs(3600),
            max_records: 1000,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.max_body_bytes == 0 {
            return Err(ProxyError::Config(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_head_bytes == 0 {
            return Err(ProxyError::Config(
                "max_head_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_records == 0 {
            return Err(ProxyError::Config(
                "max_records must be greater than zero".to_string(),
            ));
        }
        if let Some(upstream) = &self.upstream_proxy {
            if upstream.host.trim().is_empty() {
                return Err(ProxyError::Config(
                    "upstream_proxy.host must not be empty".to_string(),
                ));
            }
            if upstream.port == 0 {
                return Err(ProxyError::Config(
                    "upstream_proxy.port must be greater than zero".to_string(),
                ));
            }
        }
        for pattern in &self.excluded_hosts {
            if pattern.trim().is_empty() {
                return Err(ProxyError::Config(
                    "excluded host pattern must not be empty".to_string(),
                ));
            }
            if pattern.contains('*') && !pattern.starts_with("*.") {
                return Err(ProxyError::Config(format!(
                    "wildcard is only supported as a leading label: {pattern:?}"
                )));
            }
            if pattern.matches('*').count() > 1 {
                return Err(ProxyError::Config(format!(
                    "only one wildcard per pattern: {pattern:?}"
                )));
            }
        }
        let timeouts = [
            self.timeouts.classify_read,
            self.timeouts.response_headers,
            self.timeouts.tunnel_idle,
            self.timeouts.tls_handshake,
            self.timeouts.upstream_connect,
        ];
        if timeouts.iter().any(Duration::is_zero) {
            return Err(ProxyError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn host_is_excluded(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.excluded_hosts.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            match pattern.strip_prefix("*.") {
                Some(suffix) => {
                    host.len() > suffix.len()
                        && host.ends_with(suffix)
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                }
                None => host == pattern,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        ProxyConfig::default().validate().expect("default is valid");
    }

    #[test]
    fn rejects_mid_label_wildcards_and_zero_caps() {
        let mut config = ProxyConfig {
            excluded_hosts: vec!["api.*.example.com".to_string()],
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());

        config.excluded_hosts = vec!["*.example.com".to_string()];
        config.validate().expect("leading wildcard is valid");

        config.max_body_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_upstream_without_port() {
        let config = ProxyConfig {
            upstream_proxy: Some(UpstreamProxy {
                host: "10.0.0.2".to_string(),
                port: 0,
            }),
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let config = ProxyConfig {
            excluded_hosts: vec!["*.example.com".to_string(), "plain.test".to_string()],
            ..ProxyConfig::default()
        };
        assert!(config.host_is_excluded("api.example.com"));
        assert!(config.host_is_excluded("deep.api.Example.COM"));
        assert!(!config.host_is_excluded("example.com"));
        assert!(!config.host_is_excluded("notexample.com"));
        assert!(config.host_is_excluded("plain.test"));
        assert!(!config.host_is_excluded("sub.plain.test"));
    }
}
