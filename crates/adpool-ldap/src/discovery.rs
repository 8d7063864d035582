//! Domain controller discovery
//!
//! Resolves a logical domain name into a prioritized, weighted list of
//! candidate directory servers via DNS SRV records, with a deterministic
//! fallback to the well-known LDAP ports when no records exist. Explicit
//! `ldap://` / `ldaps://` URLs from configuration bypass discovery entirely.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use adpool_core::error::{DirectoryError, DirectoryResult};

/// Default plaintext LDAP port.
pub const LDAP_PORT: u16 = 389;
/// Default LDAP-over-TLS port.
pub const LDAPS_PORT: u16 = 636;

/// Where a candidate server entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSource {
    /// Resolved from a DNS SRV record.
    Srv,
    /// Synthesized fallback against the domain itself.
    Fallback,
    /// Explicitly configured URL.
    Config,
}

impl ServerSource {
    /// Stable string form for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ServerSource::Srv => "srv",
            ServerSource::Fallback => "fallback",
            ServerSource::Config => "config",
        }
    }
}

impl std::fmt::Display for ServerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate directory server.
///
/// Immutable once constructed. Priority follows RFC 2782 semantics: lower
/// value is preferred; weight breaks ties among equal-priority peers, higher
/// value first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Whether to connect with direct TLS (ldaps).
    pub use_tls: bool,
    /// RFC 2782 priority; lower is preferred.
    pub priority: u16,
    /// RFC 2782 weight; higher is preferred within a priority.
    pub weight: u16,
    /// Discovery origin.
    pub source: ServerSource,
}

impl ServerInfo {
    /// The connection URL for this server.
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "ldaps" } else { "ldap" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (source={})", self.url(), self.source)
    }
}

/// Validate a candidate server entry.
///
/// The unsigned field types already rule out negative priorities, weights and
/// out-of-range ports; what remains is an empty host or a zero port.
pub fn validate_server_info(server: &ServerInfo) -> DirectoryResult<()> {
    if server.host.is_empty() {
        return Err(DirectoryError::invalid_config("server host must not be empty"));
    }
    if server.port == 0 {
        return Err(DirectoryError::invalid_config(format!(
            "server {} has invalid port 0",
            server.host
        )));
    }
    Ok(())
}

/// Sort candidates: ascending priority, then descending weight.
///
/// Weighted-random selection among equal weights is deliberately reduced to a
/// deterministic order; callers wanting randomization layer it on top.
pub fn sort_servers(servers: &mut [ServerInfo]) {
    servers.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.weight.cmp(&a.weight))
    });
}

/// One resolved SRV record.
#[derive(Debug, Clone)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// DNS SRV lookup capability, injectable so tests can mock resolution.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    /// Look up SRV records for a fully qualified service name.
    async fn lookup_srv(&self, name: &str) -> DirectoryResult<Vec<SrvRecord>>;
}

/// System DNS resolver backed by hickory.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    /// Create a resolver from the system configuration (/etc/resolv.conf).
    pub fn from_system_conf() -> DirectoryResult<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            DirectoryError::NetworkError {
                message: "failed to initialize DNS resolver from system configuration".to_string(),
                source: Some(Box::new(e)),
            }
        })?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl SrvResolver for SystemResolver {
    async fn lookup_srv(&self, name: &str) -> DirectoryResult<Vec<SrvRecord>> {
        let lookup = self
            .resolver
            .srv_lookup(name)
            .await
            .map_err(|e| DirectoryError::network_with_source(format!("SRV lookup {name}"), e))?;

        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                target: srv.target().to_utf8(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect())
    }
}

/// Discover directory servers for a domain using the system resolver.
pub async fn discover_servers(domain: &str) -> DirectoryResult<Vec<ServerInfo>> {
    let resolver =
        SystemResolver::from_system_conf().map_err(|e| DirectoryError::DiscoveryFailed {
            domain: domain.to_string(),
            message: e.to_string(),
        })?;
    discover_servers_with(&resolver, domain).await
}

/// Discover directory servers for a domain.
///
/// Tries, in strict order: `_ldaps._tcp` (any records stop discovery and are
/// returned alone), then `_ldap._tcp` and `_gc._tcp` concatenated. Individual
/// lookup failures are swallowed. When every lookup yields nothing, returns
/// exactly two fallback entries against the domain itself on the well-known
/// ports. Never returns an empty list.
#[instrument(skip(resolver))]
pub async fn discover_servers_with(
    resolver: &dyn SrvResolver,
    domain: &str,
) -> DirectoryResult<Vec<ServerInfo>> {
    if domain.is_empty() {
        return Err(DirectoryError::invalid_config(
            "discovery domain must not be empty",
        ));
    }

    // Secure transport first: when present these are authoritative.
    let mut servers = lookup_service(resolver, &format!("_ldaps._tcp.{domain}"), true).await;
    if !servers.is_empty() {
        sort_servers(&mut servers);
        debug!(domain, count = servers.len(), "discovered ldaps SRV records");
        return Ok(servers);
    }

    servers.extend(lookup_service(resolver, &format!("_ldap._tcp.{domain}"), false).await);
    servers.extend(lookup_service(resolver, &format!("_gc._tcp.{domain}"), false).await);

    if servers.is_empty() {
        debug!(domain, "no SRV records found, falling back to well-known ports");
        servers = vec![
            ServerInfo {
                host: domain.to_string(),
                port: LDAPS_PORT,
                use_tls: true,
                priority: 0,
                weight: 100,
                source: ServerSource::Fallback,
            },
            ServerInfo {
                host: domain.to_string(),
                port: LDAP_PORT,
                use_tls: false,
                priority: 1,
                weight: 100,
                source: ServerSource::Fallback,
            },
        ];
    }

    sort_servers(&mut servers);
    debug!(domain, count = servers.len(), "server discovery complete");
    Ok(servers)
}

/// Perform one SRV lookup, swallowing failures and dropping unusable records.
async fn lookup_service(
    resolver: &dyn SrvResolver,
    name: &str,
    use_tls: bool,
) -> Vec<ServerInfo> {
    let records = match resolver.lookup_srv(name).await {
        Ok(records) => records,
        Err(e) => {
            debug!(name, error = %e, "SRV lookup failed, trying next record type");
            return Vec::new();
        }
    };

    records
        .into_iter()
        .filter_map(|record| {
            let host = record.target.trim_end_matches('.').to_string();
            // "." is the RFC 2782 "service not available" marker.
            if host.is_empty() || record.port == 0 {
                warn!(name, target = %record.target, "skipping unusable SRV record");
                return None;
            }
            Some(ServerInfo {
                host,
                port: record.port,
                use_tls,
                priority: record.priority,
                weight: record.weight,
                source: ServerSource::Srv,
            })
        })
        .collect()
}

/// Parse an explicit `ldap://host[:port]` or `ldaps://host[:port]` URL into a
/// candidate server entry.
///
/// A missing port defaults to 389/636 per scheme. Explicit configuration
/// always outranks discovery, so the entry gets priority 0 and source
/// `Config`. Trailing path segments are ignored.
pub fn parse_ldap_url(raw: &str) -> DirectoryResult<ServerInfo> {
    if raw.is_empty() {
        return Err(DirectoryError::invalid_config("server URL must not be empty"));
    }

    let url = Url::parse(raw)
        .map_err(|e| DirectoryError::invalid_config(format!("invalid server URL '{raw}': {e}")))?;

    let use_tls = match url.scheme() {
        "ldap" => false,
        "ldaps" => true,
        other => {
            return Err(DirectoryError::invalid_config(format!(
                "unsupported URL scheme '{other}' in '{raw}': expected ldap or ldaps"
            )));
        }
    };

    let host = url
        .host_str()
        .ok_or_else(|| {
            DirectoryError::invalid_config(format!("server URL '{raw}' is missing a host"))
        })?
        .to_string();

    let port = url
        .port()
        .unwrap_or(if use_tls { LDAPS_PORT } else { LDAP_PORT });

    let server = ServerInfo {
        host,
        port,
        use_tls,
        priority: 0,
        weight: 100,
        source: ServerSource::Config,
    };
    validate_server_info(&server)?;
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Mock resolver mapping service names to record sets; unknown names fail.
    struct MockResolver {
        zones: HashMap<String, Vec<SrvRecord>>,
    }

    impl MockResolver {
        fn empty() -> Self {
            Self {
                zones: HashMap::new(),
            }
        }

        fn with_zone(mut self, name: &str, records: Vec<SrvRecord>) -> Self {
            self.zones.insert(name.to_string(), records);
            self
        }
    }

    #[async_trait]
    impl SrvResolver for MockResolver {
        async fn lookup_srv(&self, name: &str) -> DirectoryResult<Vec<SrvRecord>> {
            self.zones
                .get(name)
                .cloned()
                .ok_or_else(|| DirectoryError::NetworkError {
                    message: format!("NXDOMAIN {name}"),
                    source: None,
                })
        }
    }

    fn srv(target: &str, port: u16, priority: u16, weight: u16) -> SrvRecord {
        SrvRecord {
            target: target.to_string(),
            port,
            priority,
            weight,
        }
    }

    #[tokio::test]
    async fn test_ldaps_records_stop_discovery() {
        let resolver = MockResolver::empty()
            .with_zone(
                "_ldaps._tcp.example.com",
                vec![srv("dc1.example.com.", 636, 0, 100)],
            )
            .with_zone(
                "_ldap._tcp.example.com",
                vec![srv("dc2.example.com.", 389, 0, 100)],
            );

        let servers = discover_servers_with(&resolver, "example.com").await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].host, "dc1.example.com");
        assert!(servers[0].use_tls);
        assert_eq!(servers[0].source, ServerSource::Srv);
    }

    #[tokio::test]
    async fn test_plain_and_gc_records_concatenated() {
        let resolver = MockResolver::empty()
            .with_zone(
                "_ldap._tcp.example.com",
                vec![srv("dc1.example.com.", 389, 0, 100)],
            )
            .with_zone(
                "_gc._tcp.example.com",
                vec![srv("gc1.example.com.", 3268, 1, 100)],
            );

        let servers = discover_servers_with(&resolver, "example.com").await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].host, "dc1.example.com");
        assert_eq!(servers[1].host, "gc1.example.com");
        assert_eq!(servers[1].port, 3268);
    }

    #[tokio::test]
    async fn test_fallback_when_no_records() {
        let servers = discover_servers_with(&MockResolver::empty(), "example.com")
            .await
            .unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].host, "example.com");
        assert_eq!(servers[0].port, LDAPS_PORT);
        assert!(servers[0].use_tls);
        assert_eq!(servers[0].priority, 0);
        assert_eq!(servers[1].port, LDAP_PORT);
        assert!(!servers[1].use_tls);
        assert_eq!(servers[1].priority, 1);
        for server in &servers {
            assert_eq!(server.source, ServerSource::Fallback);
            assert_eq!(server.weight, 100);
        }
    }

    #[tokio::test]
    async fn test_empty_domain_fails_without_lookup() {
        struct PanicResolver;

        #[async_trait]
        impl SrvResolver for PanicResolver {
            async fn lookup_srv(&self, _name: &str) -> DirectoryResult<Vec<SrvRecord>> {
                panic!("lookup must not be attempted for an empty domain");
            }
        }

        let err = discover_servers_with(&PanicResolver, "").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn test_unusable_records_skipped() {
        let resolver = MockResolver::empty().with_zone(
            "_ldaps._tcp.example.com",
            vec![srv(".", 636, 0, 100), srv("dc1.example.com.", 0, 0, 100)],
        );

        // Both records unusable, so discovery proceeds to fallback.
        let servers = discover_servers_with(&resolver, "example.com").await.unwrap();
        assert_eq!(servers[0].source, ServerSource::Fallback);
    }

    #[test]
    fn test_sort_priority_then_weight() {
        let mut servers = vec![
            ServerInfo {
                host: "c".into(),
                port: 389,
                use_tls: false,
                priority: 1,
                weight: 50,
                source: ServerSource::Srv,
            },
            ServerInfo {
                host: "a".into(),
                port: 389,
                use_tls: false,
                priority: 0,
                weight: 10,
                source: ServerSource::Srv,
            },
            ServerInfo {
                host: "b".into(),
                port: 389,
                use_tls: false,
                priority: 0,
                weight: 90,
                source: ServerSource::Srv,
            },
        ];
        sort_servers(&mut servers);

        // Priorities non-decreasing; weights non-increasing within a priority.
        for pair in servers.windows(2) {
            assert!(pair[0].priority <= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                assert!(pair[0].weight >= pair[1].weight);
            }
        }
        assert_eq!(servers[0].host, "b");
        assert_eq!(servers[1].host, "a");
        assert_eq!(servers[2].host, "c");
    }

    #[test]
    fn test_parse_ldaps_url_defaults() {
        let server = parse_ldap_url("ldaps://dc1.example.com").unwrap();
        assert_eq!(server.host, "dc1.example.com");
        assert_eq!(server.port, 636);
        assert!(server.use_tls);
        assert_eq!(server.priority, 0);
        assert_eq!(server.source, ServerSource::Config);
    }

    #[test]
    fn test_parse_ldap_url_explicit_port() {
        let server = parse_ldap_url("ldap://dc1.example.com:389").unwrap();
        assert_eq!(server.port, 389);
        assert!(!server.use_tls);
    }

    #[test]
    fn test_parse_url_ignores_trailing_path() {
        let server = parse_ldap_url("ldap://dc1.example.com:3268/dc=example,dc=com").unwrap();
        assert_eq!(server.port, 3268);
    }

    #[test]
    fn test_parse_url_failures() {
        assert!(parse_ldap_url("").is_err());
        assert!(parse_ldap_url("https://x").is_err());
        assert!(parse_ldap_url("ldap://x:abc").is_err());
    }

    #[test]
    fn test_validate_server_info() {
        let good = ServerInfo {
            host: "dc1.example.com".into(),
            port: 636,
            use_tls: true,
            priority: 0,
            weight: 100,
            source: ServerSource::Config,
        };
        assert!(validate_server_info(&good).is_ok());

        let empty_host = ServerInfo {
            host: String::new(),
            ..good.clone()
        };
        assert!(validate_server_info(&empty_host).is_err());

        let zero_port = ServerInfo { port: 0, ..good };
        assert!(validate_server_info(&zero_port).is_err());
    }
}
