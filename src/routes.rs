//! Hostname to upstream routing table

use crate::config::ServiceSpec;
use http::uri::{Authority, Scheme};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Base URL of an upstream reached through a forwarding channel,
/// i.e. `scheme://host:local_port` with no path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl {
    scheme: Scheme,
    authority: Authority,
}

impl BaseUrl {
    pub fn new(protocol: &str, host: &str, port: u16) -> Result<Self, String> {
        let scheme = match protocol {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => return Err(format!("unsupported protocol '{}'", other)),
        };
        let authority: Authority = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| format!("invalid upstream authority '{}:{}': {}", host, port, e))?;
        Ok(Self { scheme, authority })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    pub fn port(&self) -> u16 {
        self.authority.port_u16().unwrap_or(if self.is_https() { 443 } else { 80 })
    }
}

impl fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Returned when a hostname has no route
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no route for host '{hostname}'")]
pub struct RouteNotFound {
    pub hostname: String,
}

/// Immutable hostname → upstream mapping.
///
/// Built once before serving starts and shared behind an `Arc`; lookups
/// take no locks.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: HashMap<String, BaseUrl>,
}

impl RouteTable {
    /// Build the table from defaulted services. A later service with the
    /// same hostname replaces an earlier one.
    pub fn build(services: &[ServiceSpec]) -> Result<Self, String> {
        let mut routes = HashMap::with_capacity(services.len());

        for service in services {
            let base = BaseUrl::new(&service.protocol, &service.host, service.local_port)?;
            let hostname = service.name.to_ascii_lowercase();
            if let Some(previous) = routes.insert(hostname.clone(), base.clone()) {
                warn!(
                    hostname = %hostname,
                    previous = %previous,
                    replacement = %base,
                    "Duplicate hostname in manifest, later service wins"
                );
            }
        }

        Ok(Self { routes })
    }

    /// Exact-match lookup. `hostname` must already have its port stripped.
    pub fn resolve(&self, hostname: &str) -> Result<&BaseUrl, RouteNotFound> {
        self.routes
            .get(&hostname.to_ascii_lowercase())
            .ok_or_else(|| RouteNotFound {
                hostname: hostname.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

/// Maximum hostname length per DNS specification
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Whether `hostname` (port already stripped) is something a request can be
/// routed by: letters, digits, hyphens and dots, or a bracketed IPv6 literal.
pub fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    if hostname.starts_with('[') {
        return hostname.len() > 2
            && hostname.ends_with(']')
            && hostname[1..hostname.len() - 1]
                .chars()
                .all(|c| c.is_ascii_hexdigit() || matches!(c, ':' | '.'));
    }
    hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Strip an optional `:port` suffix from a Host header value.
/// Bracketed IPv6 literals keep their brackets.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, protocol: &str, local_port: u16) -> ServiceSpec {
        let mut spec = ServiceSpec::new(name, "svc/x", 80);
        spec.protocol = protocol.to_string();
        spec.local_port = local_port;
        spec.apply_defaults(0);
        spec
    }

    #[test]
    fn test_build_and_resolve() {
        let table = RouteTable::build(&[
            service("api", "http", 1500),
            service("secure", "https", 1501),
        ])
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("api.local").unwrap().to_string(), "http://127.0.0.1:1500");
        assert_eq!(
            table.resolve("secure.local").unwrap().to_string(),
            "https://127.0.0.1:1501"
        );
        assert!(table.resolve("secure.local").unwrap().is_https());
    }

    #[test]
    fn test_resolve_miss() {
        let table = RouteTable::build(&[service("api", "http", 1500)]).unwrap();
        let err = table.resolve("other.local").unwrap_err();
        assert_eq!(err.hostname, "other.local");
        assert!(err.to_string().contains("other.local"));
    }

    #[test]
    fn test_resolve_is_exact_match() {
        let table = RouteTable::build(&[service("api", "http", 1500)]).unwrap();
        assert!(table.resolve("v1.api.local").is_err());
        assert!(table.resolve("api").is_err());
        assert!(table.resolve("").is_err());
    }

    #[test]
    fn test_resolve_ignores_case() {
        let table = RouteTable::build(&[service("Api", "http", 1500)]).unwrap();
        assert!(table.resolve("API.LOCAL").is_ok());
    }

    #[test]
    fn test_duplicate_hostname_later_wins() {
        let table = RouteTable::build(&[
            service("api", "http", 1500),
            service("api.local", "http", 1600),
        ])
        .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("api.local").unwrap().port(), 1600);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("api.local:8080"), "api.local");
        assert_eq!(strip_port("api.local"), "api.local");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
    }

    #[test]
    fn test_is_valid_hostname() {
        assert!(is_valid_hostname("api.local"));
        assert!(is_valid_hostname("my-svc.local"));
        assert!(is_valid_hostname("[::1]"));
        assert!(!is_valid_hostname("my_svc.local"));
        assert!(!is_valid_hostname("bad host"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("[]"));
        assert!(!is_valid_hostname(&"a".repeat(MAX_HOSTNAME_LEN + 1)));
    }

    #[test]
    fn test_base_url() {
        let base = BaseUrl::new("http", "127.0.0.1", 1500).unwrap();
        assert_eq!(base.to_string(), "http://127.0.0.1:1500");
        assert_eq!(base.host(), "127.0.0.1");
        assert_eq!(base.port(), 1500);
        assert!(BaseUrl::new("gopher", "127.0.0.1", 1).is_err());
    }
}
