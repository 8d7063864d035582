//! Directory client
//!
//! Thin adapter over [`ConnectionPool`] exposing the operation surface
//! downstream object managers depend on: bind, search (plain and paged),
//! add, modify, delete, rename, liveness ping, WhoAmI, base DN resolution,
//! and pool statistics.
//!
//! Each operation checks a connection out of the pool, runs against it, and
//! returns it. Connections that failed with a retryable error are marked
//! unhealthy so the pool closes them instead of re-queuing them.

use std::collections::{HashMap, HashSet};

use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::exop::{WhoAmI, WhoAmIResp};
use ldap3::{Mod, Scope, SearchEntry};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use adpool_core::config::ConnectionConfig;
use adpool_core::error::{DirectoryError, DirectoryResult};

use crate::auth;
use crate::codes;
use crate::pool::{self, ConnectionPool, PoolStats, PooledConnection};

/// One directory entry with its DN and attribute values.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
    pub binary_attributes: HashMap<String, Vec<Vec<u8>>>,
}

impl DirectoryEntry {
    /// First value of a textual attribute, if present.
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of a textual attribute.
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Result of a search, including how many server entries were dropped
/// because they could not be converted.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub entries: Vec<DirectoryEntry>,
    /// Entries the server returned that were skipped during conversion.
    pub skipped: usize,
}

/// Pooled, authenticated directory client.
pub struct DirectoryClient {
    pool: ConnectionPool,
    cached_base_dn: RwLock<Option<String>>,
}

impl DirectoryClient {
    /// Build a client: validates configuration, discovers servers, and
    /// starts the pool. No connection is established until first use.
    pub async fn connect(config: ConnectionConfig) -> DirectoryResult<Self> {
        let pool = ConnectionPool::connect(config).await?;
        Ok(Self {
            pool,
            cached_base_dn: RwLock::new(None),
        })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Pool statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close the client and its pool. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Verify a username/password pair with a simple bind.
    ///
    /// The connection is closed afterwards rather than pooled: it carries
    /// the caller's identity, not the pool's configured one.
    #[instrument(skip(self, password))]
    pub async fn bind(&self, username: &str, password: &str) -> DirectoryResult<()> {
        let mut conn = self.pool.get().await?;

        let result = match conn.ldap().simple_bind(username, password).await {
            Ok(res) => codes::check_result("simple bind", res).map(|_| ()),
            Err(e) => Err(codes::op_error("simple bind", e)),
        };

        conn.mark_unhealthy();
        conn.close().await;
        result
    }

    /// Re-apply the configured authentication to a pooled connection.
    #[instrument(skip(self))]
    pub async fn bind_with_config(&self) -> DirectoryResult<()> {
        let mut conn = self.pool.get().await?;
        let server = conn.server().clone();
        let config = self.pool.config().clone();

        let result = auth::authenticate(conn.ldap(), &config, &server).await;
        if result.is_ok() {
            conn.mark_authenticated();
        }
        finish(conn, &result).await;
        result
    }

    /// Search, collecting all entries in one result set.
    #[instrument(skip(self, attrs))]
    pub async fn search(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: Vec<String>,
    ) -> DirectoryResult<SearchOutcome> {
        let mut conn = self.pool.get().await?;
        let result = run_search(&mut conn, base, scope, filter, attrs).await;
        finish(conn, &result).await;
        result
    }

    /// Search with simple paged results, transparently following paging
    /// cookies across round trips. Use for result sets that may exceed the
    /// server's size limit.
    #[instrument(skip(self, attrs))]
    pub async fn search_with_paging(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: Vec<String>,
        page_size: i32,
    ) -> DirectoryResult<SearchOutcome> {
        let mut conn = self.pool.get().await?;
        let result = run_paged_search(&mut conn, base, scope, filter, attrs, page_size).await;
        finish(conn, &result).await;
        result
    }

    /// Add an entry.
    #[instrument(skip(self, attrs))]
    pub async fn add(
        &self,
        dn: &str,
        attrs: Vec<(String, HashSet<String>)>,
    ) -> DirectoryResult<()> {
        let mut conn = self.pool.get().await?;
        let result = match conn.ldap().add(dn, attrs).await {
            Ok(res) => codes::check_result("add entry", res).map(|_| ()),
            Err(e) => Err(codes::op_error("add entry", e)),
        };
        finish(conn, &result).await;
        result
    }

    /// Apply attribute modifications to an entry.
    #[instrument(skip(self, mods))]
    pub async fn modify(&self, dn: &str, mods: Vec<Mod<String>>) -> DirectoryResult<()> {
        let mut conn = self.pool.get().await?;
        let result = match conn.ldap().modify(dn, mods).await {
            Ok(res) => codes::check_result("modify entry", res).map(|_| ()),
            Err(e) => Err(codes::op_error("modify entry", e)),
        };
        finish(conn, &result).await;
        result
    }

    /// Delete an entry.
    #[instrument(skip(self))]
    pub async fn delete(&self, dn: &str) -> DirectoryResult<()> {
        let mut conn = self.pool.get().await?;
        let result = match conn.ldap().delete(dn).await {
            Ok(res) => codes::check_result("delete entry", res).map(|_| ()),
            Err(e) => Err(codes::op_error("delete entry", e)),
        };
        finish(conn, &result).await;
        result
    }

    /// Rename an entry, optionally moving it under a new parent.
    #[instrument(skip(self))]
    pub async fn modify_dn(
        &self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> DirectoryResult<()> {
        let mut conn = self.pool.get().await?;
        let result = match conn
            .ldap()
            .modifydn(dn, new_rdn, delete_old_rdn, new_superior)
            .await
        {
            Ok(res) => codes::check_result("modify DN", res).map(|_| ()),
            Err(e) => Err(codes::op_error("modify DN", e)),
        };
        finish(conn, &result).await;
        result
    }

    /// Liveness check against the directory.
    pub async fn ping(&self) -> DirectoryResult<()> {
        let timeout = self.pool.config().pool.timeout();
        let mut conn = self.pool.get().await?;
        let result = pool::probe(conn.ldap(), timeout).await;
        finish(conn, &result).await;
        result
    }

    /// The identity the directory associates with the pool's connections.
    pub async fn whoami(&self) -> DirectoryResult<String> {
        let mut conn = self.pool.get().await?;
        let result = match conn.ldap().extended(WhoAmI).await {
            Ok(res) => match res.success() {
                Ok((exop, _)) => {
                    let resp: WhoAmIResp = exop.parse();
                    Ok(resp.authzid)
                }
                Err(e) => Err(codes::op_error("whoami", e)),
            },
            Err(e) => Err(codes::op_error("whoami", e)),
        };
        finish(conn, &result).await;
        result
    }

    /// The search base DN: the configured value when set, otherwise the
    /// server's defaultNamingContext from the rootDSE, cached after the
    /// first lookup.
    pub async fn base_dn(&self) -> DirectoryResult<String> {
        if let Some(base_dn) = &self.pool.config().base_dn {
            if !base_dn.is_empty() {
                return Ok(base_dn.clone());
            }
        }

        if let Some(cached) = self.cached_base_dn.read().await.clone() {
            return Ok(cached);
        }

        debug!("querying rootDSE for defaultNamingContext");
        let outcome = self
            .search(
                "",
                Scope::Base,
                "(objectClass=*)",
                vec!["defaultNamingContext".to_string()],
            )
            .await?;

        let base_dn = outcome
            .entries
            .first()
            .and_then(|entry| entry.first_value("defaultNamingContext"))
            .map(str::to_string)
            .ok_or_else(|| {
                DirectoryError::invalid_config(
                    "no base DN configured and the server advertises no defaultNamingContext",
                )
            })?;

        *self.cached_base_dn.write().await = Some(base_dn.clone());
        Ok(base_dn)
    }
}

async fn run_search(
    conn: &mut PooledConnection,
    base: &str,
    scope: Scope,
    filter: &str,
    attrs: Vec<String>,
) -> DirectoryResult<SearchOutcome> {
    let result = conn
        .ldap()
        .search(base, scope, filter, attrs)
        .await
        .map_err(|e| codes::op_error("search", e))?;

    let (entries, res) = result
        .success()
        .map_err(|e| codes::op_error("search", e))?;
    codes::check_result("search", res)?;

    let mut outcome = SearchOutcome::default();
    for entry in entries {
        collect_entry(SearchEntry::construct(entry), &mut outcome);
    }
    Ok(outcome)
}

async fn run_paged_search(
    conn: &mut PooledConnection,
    base: &str,
    scope: Scope,
    filter: &str,
    attrs: Vec<String>,
    page_size: i32,
) -> DirectoryResult<SearchOutcome> {
    let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
        Box::new(EntriesOnly::new()),
        Box::new(PagedResults::new(page_size)),
    ];

    let mut search = conn
        .ldap()
        .streaming_search_with(adapters, base, scope, filter, attrs)
        .await
        .map_err(|e| codes::op_error("paged search", e))?;

    let mut outcome = SearchOutcome::default();
    loop {
        match search.next().await {
            Ok(Some(entry)) => collect_entry(SearchEntry::construct(entry), &mut outcome),
            Ok(None) => break,
            Err(e) => return Err(codes::op_error("paged search", e)),
        }
    }

    let res = search
        .finish()
        .await
        .success()
        .map_err(|e| codes::op_error("paged search", e))?;
    codes::check_result("paged search", res)?;

    Ok(outcome)
}

/// Convert one server entry, skipping (and counting) ones without a DN
/// rather than failing the whole search.
fn collect_entry(entry: SearchEntry, outcome: &mut SearchOutcome) {
    if entry.dn.is_empty() {
        warn!("skipping search result entry without a DN");
        outcome.skipped += 1;
        return;
    }
    outcome.entries.push(DirectoryEntry {
        dn: entry.dn,
        attributes: entry.attrs,
        binary_attributes: entry.bin_attrs,
    });
}

/// Return a connection after an operation, dropping it from the pool when
/// the failure suggests the transport is no longer trustworthy.
async fn finish<T>(mut conn: PooledConnection, result: &DirectoryResult<T>) {
    if let Err(e) = result {
        if e.is_retryable() {
            conn.mark_unhealthy();
        }
    }
    conn.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dn: &str, attr: (&str, &[&str])) -> SearchEntry {
        let mut attrs = HashMap::new();
        attrs.insert(
            attr.0.to_string(),
            attr.1.iter().map(|v| v.to_string()).collect(),
        );
        SearchEntry {
            dn: dn.to_string(),
            attrs,
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn test_collect_entry_keeps_well_formed() {
        let mut outcome = SearchOutcome::default();
        collect_entry(
            entry("cn=alice,dc=example,dc=com", ("cn", &["alice"])),
            &mut outcome,
        );

        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.entries[0].first_value("cn"), Some("alice"));
    }

    #[test]
    fn test_collect_entry_counts_skipped() {
        let mut outcome = SearchOutcome::default();
        collect_entry(entry("", ("cn", &["ghost"])), &mut outcome);
        collect_entry(
            entry("cn=bob,dc=example,dc=com", ("cn", &["bob"])),
            &mut outcome,
        );

        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_entry_value_accessors() {
        let mut outcome = SearchOutcome::default();
        collect_entry(
            entry(
                "cn=carol,dc=example,dc=com",
                ("memberOf", &["cn=admins", "cn=users"]),
            ),
            &mut outcome,
        );

        let e = &outcome.entries[0];
        assert_eq!(e.values("memberOf"), ["cn=admins", "cn=users"]);
        assert_eq!(e.first_value("memberOf"), Some("cn=admins"));
        assert_eq!(e.first_value("mail"), None);
        assert!(e.values("mail").is_empty());
    }

    #[tokio::test]
    async fn test_configured_base_dn_needs_no_network() {
        let config = ConnectionConfig::for_servers(vec!["ldap://dc1.example.com".to_string()])
            .with_base_dn("dc=example,dc=com");
        let client = DirectoryClient::connect(disable_background(config))
            .await
            .unwrap();

        assert_eq!(client.base_dn().await.unwrap(), "dc=example,dc=com");
        client.close().await;
    }

    #[tokio::test]
    async fn test_client_close_then_operation_fails() {
        let config = ConnectionConfig::for_servers(vec!["ldap://dc1.example.com".to_string()]);
        let client = DirectoryClient::connect(disable_background(config))
            .await
            .unwrap();

        client.close().await;
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, DirectoryError::PoolClosed));
    }

    fn disable_background(mut config: ConnectionConfig) -> ConnectionConfig {
        config.pool.health_check_secs = 0;
        config.retry.max_retries = 0;
        config
    }
}
