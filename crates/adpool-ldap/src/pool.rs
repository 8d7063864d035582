//! Connection pool
//!
//! Orchestrates discovery, connection creation with retry and backoff across
//! the candidate server list, reuse through a bounded idle queue, periodic
//! background health verification, and statistics.
//!
//! The idle store is a bounded queue with non-blocking push/pop semantics:
//! push never blocks (excess connections are discarded, favoring discarded
//! idle capacity over stalled callers) and pop never blocks (an empty queue
//! immediately triggers connection creation).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchOptions};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use adpool_core::config::ConnectionConfig;
use adpool_core::error::{DirectoryError, DirectoryResult};

use crate::auth;
use crate::codes;
use crate::discovery::{self, ServerInfo};

/// Connections authenticated longer ago than this window are re-authenticated
/// before reuse.
pub const REAUTH_WINDOW: Duration = Duration::from_secs(300);

/// Idle connections probed per health-check tick.
const HEALTH_CHECK_BATCH: usize = 3;

/// One live directory connection owned by the pool.
///
/// Lifecycle: created by the pool, handed to exactly one caller at a time,
/// and returned via [`PooledConnection::close`], which gives it back to the
/// owning pool (or closes the transport when the pool is gone).
pub struct PooledConnection {
    ldap: Ldap,
    server: Arc<ServerInfo>,
    last_used: Instant,
    auth_time: Option<Instant>,
    healthy: bool,
    pool: Weak<PoolInner>,
}

impl PooledConnection {
    /// The underlying protocol handle.
    pub fn ldap(&mut self) -> &mut Ldap {
        &mut self.ldap
    }

    /// The server this connection is bound to.
    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// Whether this connection has been authenticated at least once.
    pub fn is_authenticated(&self) -> bool {
        self.auth_time.is_some()
    }

    /// Mark the connection as unusable; it will be closed instead of pooled.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Record a successful fresh authentication on this connection.
    pub(crate) fn mark_authenticated(&mut self) {
        self.auth_time = Some(Instant::now());
    }

    /// Return the connection to its pool, or close the transport when the
    /// pool has already been dropped.
    pub async fn close(self) {
        match self.pool.upgrade() {
            Some(pool) => pool.return_connection(self).await,
            None => discard(self.ldap).await,
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn auth_stale(&self) -> bool {
        match self.auth_time {
            None => true,
            Some(at) => at.elapsed() >= REAUTH_WINDOW,
        }
    }

    fn is_healthy(&self, max_idle: Duration, auth_required: bool) -> bool {
        self.healthy
            && self.idle_for() <= max_idle
            && (!auth_required || self.auth_time.is_some())
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("server", &self.server.url())
            .field("healthy", &self.healthy)
            .field("authenticated", &self.is_authenticated())
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

/// Snapshot of pool counters, safe to poll concurrently with operation.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Connections currently known to the pool (active + idle).
    pub total: u64,
    /// Connections currently checked out by callers.
    pub active: u64,
    /// Connections resting in the idle queue.
    pub idle: u64,
    /// Cumulative connections created.
    pub created: u64,
    /// Cumulative connection and authentication failures.
    pub errors: u64,
    /// Time since pool construction.
    pub uptime: Duration,
}

struct PoolInner {
    config: ConnectionConfig,
    auth_required: bool,
    servers: RwLock<Vec<Arc<ServerInfo>>>,
    idle_tx: mpsc::Sender<PooledConnection>,
    idle_rx: Mutex<mpsc::Receiver<PooledConnection>>,
    closed: RwLock<bool>,
    stopping: AtomicBool,
    shutdown: Notify,
    active: AtomicI64,
    created: AtomicU64,
    errors: AtomicU64,
    started_at: Instant,
}

/// Pool of authenticated directory connections with multi-server failover.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Construct a pool: validate the configuration, discover the candidate
    /// servers once, and start the background health checker when enabled.
    ///
    /// With explicit server URLs configured, no DNS discovery is attempted.
    #[instrument(skip(config))]
    pub async fn connect(config: ConnectionConfig) -> DirectoryResult<Self> {
        config.validate()?;
        config.tls.warn_if_insecure();

        let mut servers = if config.servers.is_empty() {
            let domain = config.domain.as_deref().unwrap_or_default();
            discovery::discover_servers(domain).await?
        } else {
            config
                .servers
                .iter()
                .map(|url| discovery::parse_ldap_url(url))
                .collect::<DirectoryResult<Vec<_>>>()?
        };
        discovery::sort_servers(&mut servers);

        info!(
            servers = servers.len(),
            first = %servers[0],
            "connection pool initialized"
        );

        let capacity = config.pool.max_connections as usize;
        let (idle_tx, idle_rx) = mpsc::channel(capacity);
        let auth_required = auth::has_authentication(&config);
        let health_interval = config.pool.health_check_interval();

        let inner = Arc::new(PoolInner {
            config,
            auth_required,
            servers: RwLock::new(servers.into_iter().map(Arc::new).collect()),
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            closed: RwLock::new(false),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            active: AtomicI64::new(0),
            created: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started_at: Instant::now(),
        });

        let health_task = health_interval.map(|every| {
            let pool = inner.clone();
            tokio::spawn(health_check_loop(pool, every))
        });

        Ok(Self {
            inner,
            health_task: Mutex::new(health_task),
        })
    }

    /// The pool configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Snapshot of the discovered candidate servers, in failover order.
    pub async fn servers(&self) -> Vec<Arc<ServerInfo>> {
        self.inner.servers.read().await.clone()
    }

    /// Get a healthy connection, reusing an idle one when possible and
    /// creating a new one otherwise.
    ///
    /// Blocks only for network I/O during creation or re-authentication,
    /// bounded by the configured timeout and cancellable by dropping the
    /// returned future.
    #[instrument(skip(self))]
    pub async fn get(&self) -> DirectoryResult<PooledConnection> {
        if *self.inner.closed.read().await {
            return Err(DirectoryError::PoolClosed);
        }

        if let Some(conn) = self.inner.pop_idle().await {
            if let Some(conn) = self.inner.recycle(conn).await {
                return Ok(conn);
            }
            // Unreusable idle connection was discarded; fall through.
        }

        self.inner.clone().create_connection().await
    }

    /// Close the pool: stop the health checker, wait for it to finish, and
    /// close every idle connection. Idempotent; `get` fails afterwards.
    pub async fn close(&self) {
        {
            let mut closed = self.inner.closed.write().await;
            if *closed {
                return;
            }
            *closed = true;
        }

        self.inner.stopping.store(true, Ordering::Relaxed);
        self.inner.shutdown.notify_one();

        if let Some(handle) = self.health_task.lock().await.take() {
            let _ = handle.await;
        }

        // The checker has observed the stop signal; draining cannot race it.
        while let Some(conn) = self.inner.pop_idle().await {
            discard(conn.ldap).await;
        }

        info!("connection pool closed");
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let idle = (inner.idle_tx.max_capacity() - inner.idle_tx.capacity()) as u64;
        let active = inner.active.load(Ordering::Relaxed).max(0) as u64;
        PoolStats {
            total: active + idle,
            active,
            idle,
            created: inner.created.load(Ordering::Relaxed),
            errors: inner.errors.load(Ordering::Relaxed),
            uptime: inner.started_at.elapsed(),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        // Stop the health checker even when close() was never called.
        self.inner.stopping.store(true, Ordering::Relaxed);
        self.inner.shutdown.notify_one();
    }
}

impl PoolInner {
    async fn pop_idle(&self) -> Option<PooledConnection> {
        self.idle_rx.lock().await.try_recv().ok()
    }

    /// Prepare a popped idle connection for reuse, re-authenticating when the
    /// authentication window has lapsed. Returns None when the connection was
    /// discarded instead.
    async fn recycle(&self, mut conn: PooledConnection) -> Option<PooledConnection> {
        let max_idle = self.config.pool.max_idle();
        if !conn.is_healthy(max_idle, self.auth_required) {
            debug!(server = %conn.server.host, "discarding unhealthy idle connection");
            discard(conn.ldap).await;
            return None;
        }

        if self.auth_required && conn.auth_stale() {
            let server = conn.server.clone();
            match self.authenticate_bounded(&mut conn.ldap, &server).await {
                Ok(()) => conn.auth_time = Some(Instant::now()),
                Err(e) => {
                    warn!(server = %server.host, error = %e, "re-authentication failed");
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    discard(conn.ldap).await;
                    return None;
                }
            }
        }

        conn.last_used = Instant::now();
        self.active.fetch_add(1, Ordering::Relaxed);
        Some(conn)
    }

    /// Create a new connection: up to `max_retries + 1` sweeps over the
    /// sorted server list, backing off between sweeps. Authentication
    /// failures surface immediately; every server would reject the same
    /// credentials.
    async fn create_connection(self: Arc<Self>) -> DirectoryResult<PooledConnection> {
        let retry = self.config.retry.clone();
        let sweeps = retry.max_retries + 1;
        let mut last_err: Option<DirectoryError> = None;

        for sweep in 0..sweeps {
            if sweep > 0 {
                let backoff = retry.backoff_for_sweep(sweep - 1);
                debug!(
                    sweep,
                    backoff_ms = backoff.as_millis() as u64,
                    "backing off before next server sweep"
                );
                tokio::time::sleep(backoff).await;
            }

            let servers = self.servers.read().await.clone();
            for server in servers {
                match self.connect_to(&server).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(server = %server, error = %e, "connection attempt failed");
                        if e.is_authentication() {
                            return Err(e);
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(DirectoryError::RetriesExhausted {
            attempts: sweeps,
            source: last_err.map(|e| Box::new(e) as _),
        })
    }

    /// One connection attempt against one server: establish the transport
    /// (direct TLS, or plaintext with optional STARTTLS upgrade) and
    /// authenticate immediately when authentication is configured.
    async fn connect_to(
        self: &Arc<Self>,
        server: &Arc<ServerInfo>,
    ) -> DirectoryResult<PooledConnection> {
        let url = server.url();
        debug!(url = %url, "connecting to directory server");

        let mut settings = LdapConnSettings::new().set_conn_timeout(self.config.pool.timeout());
        if !server.use_tls && self.config.tls.start_tls {
            settings = settings.set_starttls(true);
        }
        if self.config.tls.insecure_skip_verify {
            settings = settings.set_no_tls_verify(true);
        }

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| codes::connect_error(&format!("connect to {url}"), e))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let mut auth_time = None;
        if self.auth_required {
            if let Err(e) = self.authenticate_bounded(&mut ldap, server).await {
                discard(ldap).await;
                return Err(e);
            }
            auth_time = Some(Instant::now());
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        info!(server = %server.host, authenticated = self.auth_required, "connection established");

        Ok(PooledConnection {
            ldap,
            server: server.clone(),
            last_used: Instant::now(),
            auth_time,
            healthy: true,
            pool: Arc::downgrade(self),
        })
    }

    async fn authenticate_bounded(
        &self,
        ldap: &mut Ldap,
        server: &ServerInfo,
    ) -> DirectoryResult<()> {
        let timeout = self.config.pool.timeout();
        match tokio::time::timeout(timeout, auth::authenticate(ldap, &self.config, server)).await {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::ConnectionTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Take back a checked-out connection. The active counter always
    /// decrements; the connection is re-queued only when the pool is open,
    /// the connection is healthy, its idle budget is unspent, and the queue
    /// has room.
    async fn return_connection(&self, mut conn: PooledConnection) {
        self.active.fetch_sub(1, Ordering::Relaxed);

        if *self.closed.read().await {
            discard(conn.ldap).await;
            return;
        }

        let max_idle = self.config.pool.max_idle();
        if !conn.healthy || conn.idle_for() > max_idle {
            debug!(server = %conn.server.host, "closing returned connection");
            discard(conn.ldap).await;
            return;
        }

        conn.last_used = Instant::now();
        if let Err(err) = self.idle_tx.try_send(conn) {
            let conn = match err {
                TrySendError::Full(conn) => {
                    debug!("idle queue full, discarding returned connection");
                    conn
                }
                TrySendError::Closed(conn) => conn,
            };
            discard(conn.ldap).await;
        }
    }

    /// Probe up to [`HEALTH_CHECK_BATCH`] idle connections and re-queue the
    /// ones that pass.
    async fn run_health_checks(&self) {
        for _ in 0..HEALTH_CHECK_BATCH {
            let Some(mut conn) = self.pop_idle().await else {
                break;
            };

            if self.auth_required && conn.auth_stale() {
                let server = conn.server.clone();
                match self.authenticate_bounded(&mut conn.ldap, &server).await {
                    Ok(()) => conn.auth_time = Some(Instant::now()),
                    Err(e) => {
                        warn!(server = %server.host, error = %e, "health check re-authentication failed");
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        discard(conn.ldap).await;
                        continue;
                    }
                }
            }

            match probe(&mut conn.ldap, self.config.pool.timeout()).await {
                Ok(()) => {
                    conn.last_used = Instant::now();
                    if let Err(err) = self.idle_tx.try_send(conn) {
                        let conn = match err {
                            TrySendError::Full(conn) | TrySendError::Closed(conn) => conn,
                        };
                        discard(conn.ldap).await;
                    }
                }
                Err(e) => {
                    debug!(server = %conn.server.host, error = %e, "health probe failed, closing connection");
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    discard(conn.ldap).await;
                }
            }
        }
    }
}

/// Minimal protocol-level liveness probe: a size-limited base-object search
/// against the rootDSE.
pub(crate) async fn probe(ldap: &mut Ldap, timeout: Duration) -> DirectoryResult<()> {
    let search = ldap
        .with_search_options(SearchOptions::new().sizelimit(1))
        .search("", Scope::Base, "(objectClass=*)", vec!["1.1"]);

    let result = tokio::time::timeout(timeout, search)
        .await
        .map_err(|_| DirectoryError::ConnectionTimeout {
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|e| codes::op_error("health probe", e))?;

    result
        .success()
        .map_err(|e| codes::op_error("health probe", e))?;
    Ok(())
}

/// Close the underlying transport, ignoring unbind failures.
async fn discard(mut ldap: Ldap) {
    let _ = ldap.unbind().await;
}

/// Background health-check loop. Exits when the pool signals shutdown; the
/// pool awaits this task before draining the idle queue.
async fn health_check_loop(pool: Arc<PoolInner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if pool.stopping.load(Ordering::Relaxed) {
                    break;
                }
                pool.run_health_checks().await;
            }
            _ = pool.shutdown.notified() => break,
        }
    }

    debug!("health checker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpool_core::config::ConnectionConfig;

    use crate::discovery::ServerSource;

    fn offline_config(servers: Vec<&str>) -> ConnectionConfig {
        let mut config =
            ConnectionConfig::for_servers(servers.into_iter().map(String::from).collect());
        // Keep unit tests self-contained: no background checker, fast retries.
        config.pool.health_check_secs = 0;
        config.pool.timeout_secs = 1;
        config.retry.max_retries = 0;
        config.retry.initial_backoff_ms = 10;
        config.retry.max_backoff_ms = 50;
        config
    }

    #[tokio::test]
    async fn test_url_pool_needs_no_dns() {
        let pool = ConnectionPool::connect(offline_config(vec![
            "ldaps://dc1.example.com",
            "ldap://dc2.example.com:389",
        ]))
        .await
        .unwrap();

        let servers = pool.servers().await;
        assert_eq!(servers.len(), 2);
        for server in &servers {
            assert_eq!(server.source, ServerSource::Config);
        }

        let stats = pool.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.created, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_invalid_config_fails_construction() {
        let mut config = offline_config(vec!["ldap://dc1.example.com"]);
        config.pool.max_connections = 0;
        assert!(ConnectionPool::connect(config).await.is_err());

        let mut config = offline_config(vec!["ldap://dc1.example.com"]);
        config.retry.backoff_multiplier = 1.0;
        assert!(ConnectionPool::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_url_fails_construction() {
        let config = offline_config(vec!["https://not-ldap.example.com"]);
        assert!(ConnectionPool::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_get_fails_after() {
        let pool = ConnectionPool::connect(offline_config(vec!["ldap://dc1.example.com"]))
            .await
            .unwrap();

        pool.close().await;
        pool.close().await; // no panic, no error

        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, DirectoryError::PoolClosed));
    }

    #[tokio::test]
    async fn test_retry_sweeps_exhausted_against_dead_server() {
        // Port 1 on loopback refuses immediately; every sweep fails fast.
        let mut config = offline_config(vec!["ldap://127.0.0.1:1"]);
        config.retry.max_retries = 2;

        let pool = ConnectionPool::connect(config).await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(err.is_retryable());

        match err {
            DirectoryError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.is_some());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        // One error per failed attempt: 1 server x 3 sweeps.
        assert_eq!(pool.stats().errors, 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_return_to_full_queue_discards_and_decrements_active() {
        // A bare TCP acceptor is enough: anonymous pools never bind, so
        // get() succeeds as soon as the transport is up.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    sockets.push(socket);
                }
            }
        });

        let url = format!("ldap://{addr}");
        let mut config = offline_config(vec![url.as_str()]);
        config.pool.max_connections = 1;

        let pool = ConnectionPool::connect(config).await.unwrap();
        let first = pool.get().await.unwrap();
        let second = pool.get().await.unwrap();
        assert_eq!(pool.stats().active, 2);

        first.close().await;
        let stats = pool.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 1);

        // Queue is at capacity: the second return is discarded, not queued,
        // and the active counter still decrements.
        second.close().await;
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.total, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_health_checker_stops_on_close() {
        let mut config = offline_config(vec!["ldap://dc1.example.com"]);
        config.pool.health_check_secs = 1;

        let pool = ConnectionPool::connect(config).await.unwrap();
        // close() waits for the checker task; completing is the assertion.
        pool.close().await;
    }

    #[tokio::test]
    async fn test_stats_uptime_advances() {
        let pool = ConnectionPool::connect(offline_config(vec!["ldap://dc1.example.com"]))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pool.stats().uptime >= Duration::from_millis(10));
        pool.close().await;
    }
}
