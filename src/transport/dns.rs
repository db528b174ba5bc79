//! Server resolution: explicit server overrides and SRV lookup.
//!
//! A bare domain is resolved through `_xmpp-client._tcp` SRV records
//! (RFC 6120 §3.2), sorted by priority then weight (RFC 2782). Without usable
//! records the domain itself is tried on the configured port.

use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// A TCP endpoint to try, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Result of parsing a server override string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTarget {
    /// Explicit endpoint, SRV is skipped.
    Direct(Endpoint),
    /// Domain to resolve.
    Domain(String),
}

/// Parse a server string.
///
/// - `tcp://host:port` or `host:port` connect directly
/// - `tcp://host` connects directly on `default_port`
/// - `domain` goes through SRV resolution
pub fn parse_server_input(server: &str, default_port: u16) -> ServerTarget {
    let trimmed = server.trim();

    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        if let Some((host, port)) = rest.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return ServerTarget::Direct(Endpoint::new(host, port));
            }
        }
        return ServerTarget::Direct(Endpoint::new(rest, default_port));
    }

    // rsplit_once keeps IPv6 literals intact
    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return ServerTarget::Direct(Endpoint::new(host, port));
        }
    }

    ServerTarget::Domain(trimmed.to_string())
}

/// Resolve `domain` to candidate endpoints in connection-attempt order.
///
/// Never fails: lookup errors fall back to `domain:fallback_port`.
pub async fn resolve_xmpp_server(domain: &str, fallback_port: u16) -> Vec<Endpoint> {
    let started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system DNS config: {}, falling back to default resolver", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let srv_name = format!("_xmpp-client._tcp.{}", domain);
    let mut endpoints = Vec::new();
    match resolver.srv_lookup(&srv_name).await {
        Ok(lookup) => {
            let mut records: Vec<_> = lookup.iter().collect();
            records.sort_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then(b.weight().cmp(&a.weight()))
            });
            for r in records {
                let target = r.target().to_string().trim_end_matches('.').to_string();
                // RFC 2782: a "." target means the service is not offered
                if target.is_empty() {
                    debug!(domain, "SRV record with '.' target, skipping");
                    continue;
                }
                debug!(domain, host = %target, port = r.port(),
                    priority = r.priority(), weight = r.weight(), "SRV record");
                endpoints.push(Endpoint::new(target, r.port()));
            }
        }
        Err(e) => {
            debug!(domain, srv = %srv_name, error = %e, "SRV lookup failed");
        }
    }

    if endpoints.is_empty() {
        info!(
            domain,
            lookup_ms = elapsed_ms(started),
            "No SRV records found, using {}:{}", domain, fallback_port
        );
        endpoints.push(Endpoint::new(domain, fallback_port));
    } else {
        info!(domain, count = endpoints.len(), lookup_ms = elapsed_ms(started), "SRV resolved");
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_uri_with_port() {
        assert_eq!(
            parse_server_input("tcp://chat.example.com:5280", 5222),
            ServerTarget::Direct(Endpoint::new("chat.example.com", 5280))
        );
    }

    #[test]
    fn test_parse_tcp_uri_no_port() {
        assert_eq!(
            parse_server_input("tcp://chat.example.com", 5222),
            ServerTarget::Direct(Endpoint::new("chat.example.com", 5222))
        );
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_server_input("  127.0.0.1:15222 ", 5222),
            ServerTarget::Direct(Endpoint::new("127.0.0.1", 15222))
        );
    }

    #[test]
    fn test_parse_ipv6_host_port() {
        assert_eq!(
            parse_server_input("[::1]:5222", 5222),
            ServerTarget::Direct(Endpoint::new("[::1]", 5222))
        );
    }

    #[test]
    fn test_parse_bare_domain() {
        assert_eq!(
            parse_server_input("process-one.net", 5222),
            ServerTarget::Domain("process-one.net".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_nonexistent_domain_returns_fallback() {
        let endpoints =
            resolve_xmpp_server("this-domain-definitely-does-not-exist-xmpp-test.example", 5222).await;
        assert_eq!(
            endpoints,
            vec![Endpoint::new(
                "this-domain-definitely-does-not-exist-xmpp-test.example",
                5222
            )]
        );
    }
}
