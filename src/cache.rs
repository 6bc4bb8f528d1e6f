//! Reference-counted transport connection cache.
//!
//! Every link needs two RPC connections, one for the core channel and one for
//! the abort channel. Many links usually talk to the same gateway, so
//! connections are pooled by [`ConnectionKey`]:
//!
//! - The first `acquire` for a key establishes the connection (refcount 1)
//! - Later acquires for an equal key share it and bump the refcount
//! - Dropping a [`ConnectionRef`] releases it; the connection is torn down
//!   when the last reference goes
//!
//! Acquires for the same key are serialized by a per-key gate so two callers
//! can never race to create two connections. Acquires for different keys do
//! not wait on each other. A failed connect leaves no entry behind.
//!
//! The cache is the only owner of raw network resources; links hold
//! [`ConnectionRef`]s.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{AppResult, VxiError};
use crate::rpc::portmap::{self, IPPROTO_TCP};
use crate::rpc::RpcClient;

/// How to find the program's port on a named host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Ask the portmapper listening on this port.
    Portmapper(u16),
    /// Dial this port directly.
    Direct(u16),
}

/// Everything that identifies a pooled connection. Two requests share a
/// connection only when every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    /// A program on a named host.
    Host {
        /// Host name or IP literal.
        host: String,
        /// Port discovery.
        endpoint: Endpoint,
        /// RPC program number.
        program: u32,
        /// RPC program version.
        version: u32,
        /// Transport protocol number.
        protocol: u32,
    },
    /// A program at a known socket address.
    Address {
        /// Remote address.
        addr: SocketAddr,
        /// RPC program number.
        program: u32,
        /// RPC program version.
        version: u32,
        /// Send buffer size hint.
        send_size: u32,
        /// Receive buffer size hint.
        recv_size: u32,
    },
}

impl ConnectionKey {
    /// Program number in this key.
    pub fn program(&self) -> u32 {
        match self {
            ConnectionKey::Host { program, .. } | ConnectionKey::Address { program, .. } => {
                *program
            }
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKey::Host {
                host,
                program,
                version,
                ..
            } => write!(f, "{}/{:#x}v{}", host, program, version),
            ConnectionKey::Address {
                addr,
                program,
                version,
                ..
            } => write!(f, "{}/{:#x}v{}", addr, program, version),
        }
    }
}

/// A connection that can be pooled.
pub trait PooledConnection: Send + Sync + 'static {
    /// False once the connection can no longer carry calls; the next acquire
    /// replaces it instead of sharing it.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Establishes new connections for the cache.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced.
    type Connection: PooledConnection;

    /// Open a connection for `key`.
    async fn connect(&self, key: &ConnectionKey) -> AppResult<Self::Connection>;
}

/// Opens [`RpcClient`] connections over TCP.
#[derive(Debug, Clone)]
pub struct RpcConnector {
    connect_timeout: Duration,
}

impl RpcConnector {
    /// Connector with the given connect (and portmapper lookup) timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RpcConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

async fn resolve(host: &str, port: u16) -> AppResult<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| VxiError::Transport(format!("cannot resolve host '{}': {}", host, e)))?
        .collect::<Vec<_>>();
    // Gateways are overwhelmingly IPv4; prefer it when both are offered.
    addrs.sort_by_key(|a| !a.is_ipv4());
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| VxiError::Transport(format!("host '{}' has no addresses", host)))
}

#[async_trait]
impl Connector for RpcConnector {
    type Connection = RpcClient;

    async fn connect(&self, key: &ConnectionKey) -> AppResult<RpcClient> {
        match key {
            ConnectionKey::Host {
                host,
                endpoint,
                program,
                version,
                protocol,
            } => {
                if *protocol != IPPROTO_TCP {
                    return Err(VxiError::Transport(format!(
                        "unsupported transport protocol {}",
                        protocol
                    )));
                }
                let addr = match endpoint {
                    Endpoint::Direct(port) => resolve(host, *port).await?,
                    Endpoint::Portmapper(pm_port) => {
                        let pm = resolve(host, *pm_port).await?;
                        let port = portmap::get_port(
                            pm,
                            *program,
                            *version,
                            *protocol,
                            self.connect_timeout,
                        )
                        .await?;
                        SocketAddr::new(pm.ip(), port)
                    }
                };
                RpcClient::connect(addr, *program, *version, self.connect_timeout).await
            }
            ConnectionKey::Address {
                addr,
                program,
                version,
                ..
            } => RpcClient::connect(*addr, *program, *version, self.connect_timeout).await,
        }
    }
}

struct Entry<T> {
    conn: Arc<T>,
    refcount: usize,
    generation: u64,
}

struct Inner<C: Connector> {
    connector: C,
    entries: Mutex<HashMap<ConnectionKey, Entry<C::Connection>>>,
    gates: Mutex<HashMap<ConnectionKey, Arc<tokio::sync::Mutex<()>>>>,
    created: AtomicU64,
    next_generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Connector> Inner<C> {
    fn release_ref(&self, key: &ConnectionKey, generation: u64) {
        let removed = {
            let mut entries = lock(&self.entries);
            let remaining = match entries.get_mut(key) {
                Some(entry) if entry.generation == generation => {
                    entry.refcount -= 1;
                    Some(entry.refcount)
                }
                // The entry was replaced after its connection died.
                _ => None,
            };
            if remaining == Some(0) {
                entries.remove(key)
            } else {
                None
            }
        };
        if removed.is_some() {
            debug!(%key, "Last reference released, closing pooled connection");
        }
    }
}

/// Removes a key's gate once nobody else is queued on it. Runs on drop so a
/// cancelled acquire cleans up too.
struct GateCleanup<'a, C: Connector> {
    gate: Arc<tokio::sync::Mutex<()>>,
    inner: &'a Inner<C>,
    key: &'a ConnectionKey,
}

impl<C: Connector> Drop for GateCleanup<'_, C> {
    fn drop(&mut self) {
        let mut gates = lock(&self.inner.gates);
        let ours = gates
            .get(self.key)
            .is_some_and(|g| Arc::ptr_eq(g, &self.gate));
        if ours && Arc::strong_count(&self.gate) == 2 {
            gates.remove(self.key);
        }
    }
}

/// Shared, reference-counted connection pool. Cloning shares the pool.
pub struct ConnectionCache<C: Connector = RpcConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionCache<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ConnectionCache<RpcConnector> {
    /// Pool of TCP RPC connections.
    pub fn new() -> Self {
        Self::with_connector(RpcConnector::default())
    }
}

impl Default for ConnectionCache<RpcConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> ConnectionCache<C> {
    /// Pool using a custom connector.
    pub fn with_connector(connector: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                entries: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                created: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Share the connection for `key`, establishing it if needed.
    ///
    /// # Errors
    /// Whatever the connector reports; the cache is left unchanged.
    pub async fn acquire(&self, key: ConnectionKey) -> AppResult<ConnectionRef<C::Connection>> {
        let gate = GateCleanup {
            gate: lock(&self.inner.gates)
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone(),
            inner: &*self.inner,
            key: &key,
        };

        let _serialized = gate.gate.lock().await;
        self.acquire_gated(&key).await
    }

    async fn acquire_gated(&self, key: &ConnectionKey) -> AppResult<ConnectionRef<C::Connection>> {
        {
            let mut entries = lock(&self.inner.entries);
            let mut stale = false;
            if let Some(entry) = entries.get_mut(key) {
                if entry.conn.is_alive() {
                    entry.refcount += 1;
                    debug!(%key, refcount = entry.refcount, "Reusing pooled connection");
                    return Ok(ConnectionRef {
                        conn: entry.conn.clone(),
                        key: key.clone(),
                        generation: entry.generation,
                        cache: self.inner.clone(),
                    });
                }
                stale = true;
            }
            if stale {
                debug!(%key, "Pooled connection is dead, replacing it");
                entries.remove(key);
            }
        }

        debug!(%key, "Creating new pooled connection");
        let conn = Arc::new(self.inner.connector.connect(key).await?);
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        lock(&self.inner.entries).insert(
            key.clone(),
            Entry {
                conn: conn.clone(),
                refcount: 1,
                generation,
            },
        );

        Ok(ConnectionRef {
            conn,
            key: key.clone(),
            generation,
            cache: self.inner.clone(),
        })
    }

    /// Number of live pooled connections.
    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    /// True when nothing is pooled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count for `key`, if pooled.
    pub fn refcount(&self, key: &ConnectionKey) -> Option<usize> {
        lock(&self.inner.entries).get(key).map(|e| e.refcount)
    }

    /// Total connections ever established by this cache.
    pub fn connections_created(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }
}

/// A counted reference to a pooled connection; releases on drop.
pub struct ConnectionRef<T: PooledConnection> {
    conn: Arc<T>,
    key: ConnectionKey,
    generation: u64,
    cache: Arc<dyn Release>,
}

/// Type-erased release hook so `ConnectionRef` need not name the connector.
trait Release: Send + Sync {
    fn release(&self, key: &ConnectionKey, generation: u64);
}

impl<C: Connector> Release for Inner<C> {
    fn release(&self, key: &ConnectionKey, generation: u64) {
        self.release_ref(key, generation);
    }
}

impl<T: PooledConnection> ConnectionRef<T> {
    /// Key this reference was acquired under.
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Clone of the underlying shared connection, not counted by the cache.
    pub fn shared(&self) -> Arc<T> {
        self.conn.clone()
    }
}

impl<T: PooledConnection> Deref for ConnectionRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T: PooledConnection> Drop for ConnectionRef<T> {
    fn drop(&mut self) {
        self.cache.release(&self.key, self.generation);
    }
}

impl<T: PooledConnection> fmt::Debug for ConnectionRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRef")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FakeConn {
        alive: Arc<AtomicBool>,
    }

    impl PooledConnection for FakeConn {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        attempts: AtomicUsize,
        fail_hosts: Vec<String>,
        alive: Arc<AtomicBool>,
        delay: Duration,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Connection = FakeConn;

        async fn connect(&self, key: &ConnectionKey) -> AppResult<FakeConn> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let ConnectionKey::Host { host, .. } = key {
                if self.fail_hosts.contains(host) {
                    return Err(VxiError::Transport(format!("cannot resolve {}", host)));
                }
            }
            Ok(FakeConn {
                alive: self.alive.clone(),
            })
        }
    }

    fn connector() -> CountingConnector {
        CountingConnector {
            alive: Arc::new(AtomicBool::new(true)),
            fail_hosts: vec!["nowhere".to_string()],
            ..Default::default()
        }
    }

    fn host_key(host: &str, program: u32) -> ConnectionKey {
        ConnectionKey::Host {
            host: host.to_string(),
            endpoint: Endpoint::Portmapper(111),
            program,
            version: 1,
            protocol: IPPROTO_TCP,
        }
    }

    #[tokio::test]
    async fn test_same_key_shares_one_connection() {
        let cache = ConnectionCache::with_connector(connector());
        let key = host_key("gw", 0x0607AF);

        let a = cache.acquire(key.clone()).await.unwrap();
        let b = cache.acquire(key.clone()).await.unwrap();

        assert!(Arc::ptr_eq(&a.shared(), &b.shared()));
        assert_eq!(cache.refcount(&key), Some(2));
        assert_eq!(cache.connections_created(), 1);

        drop(a);
        assert_eq!(cache.refcount(&key), Some(1));
        drop(b);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_any_differing_field_is_a_distinct_entry() {
        let cache = ConnectionCache::with_connector(connector());
        let addr: SocketAddr = "127.0.0.1:1024".parse().unwrap();
        let address_key = |recv_size| ConnectionKey::Address {
            addr,
            program: 0x0607B0,
            version: 1,
            send_size: 0,
            recv_size,
        };

        let _refs = vec![
            cache.acquire(host_key("gw", 0x0607AF)).await.unwrap(),
            cache.acquire(host_key("gw", 0x0607B0)).await.unwrap(),
            cache.acquire(host_key("gw2", 0x0607AF)).await.unwrap(),
            cache.acquire(address_key(0)).await.unwrap(),
            cache.acquire(address_key(4096)).await.unwrap(),
        ];
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.connections_created(), 5);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_entry() {
        let cache = ConnectionCache::with_connector(connector());
        let result = cache.acquire(host_key("nowhere", 0x0607AF)).await;
        assert!(matches!(result, Err(VxiError::Transport(_))));
        assert!(cache.is_empty());
        assert_eq!(cache.connections_created(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_create_one_connection() {
        let cache = ConnectionCache::with_connector(CountingConnector {
            delay: Duration::from_millis(20),
            ..connector()
        });
        let key = host_key("gw", 0x0607AF);

        let mut tasks = vec![];
        for _ in 0..50 {
            let cache = cache.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move { cache.acquire(key).await }));
        }
        let mut refs = vec![];
        for task in tasks {
            refs.push(task.await.unwrap().unwrap());
        }

        assert_eq!(cache.connections_created(), 1);
        assert_eq!(cache.inner.connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refcount(&key), Some(50));

        drop(refs);
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_acquire_release_keeps_refcount_consistent() {
        let cache = ConnectionCache::with_connector(connector());
        let key = host_key("gw", 0x0607AF);
        let anchor = cache.acquire(key.clone()).await.unwrap();

        let mut tasks = vec![];
        for _ in 0..20 {
            let cache = cache.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let r = cache.acquire(key.clone()).await.unwrap();
                    tokio::task::yield_now().await;
                    drop(r);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.refcount(&key), Some(1));
        assert_eq!(cache.connections_created(), 1);
        drop(anchor);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_dead_connection_is_replaced_without_disturbing_old_refs() {
        let conn = connector();
        let alive = conn.alive.clone();
        let cache = ConnectionCache::with_connector(conn);
        let key = host_key("gw", 0x0607AF);

        let old = cache.acquire(key.clone()).await.unwrap();
        alive.store(false, Ordering::SeqCst);
        let new = cache.acquire(key.clone()).await.unwrap();
        alive.store(true, Ordering::SeqCst);

        assert_eq!(cache.connections_created(), 2);
        assert!(!Arc::ptr_eq(&old.shared(), &new.shared()));

        // Releasing the stale reference must not touch the replacement.
        drop(old);
        assert_eq!(cache.refcount(&key), Some(1));
        drop(new);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_gates_are_cleaned_up() {
        let cache = ConnectionCache::with_connector(connector());
        let _r = cache.acquire(host_key("gw", 1)).await.unwrap();
        assert!(lock(&cache.inner.gates).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_acquires_leave_no_gate_behind() {
        let cache = ConnectionCache::with_connector(CountingConnector {
            delay: Duration::from_millis(300),
            ..connector()
        });
        let key = host_key("gw", 0x0607AF);

        // One caller cancelled inside connect, one while queued on the gate.
        let connecting = cache.acquire(key.clone());
        let queued = cache.acquire(key.clone());
        let (a, b) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(50), connecting),
            tokio::time::timeout(Duration::from_millis(100), queued),
        );
        assert!(a.is_err());
        assert!(b.is_err());

        assert!(lock(&cache.inner.gates).is_empty());
        assert!(cache.is_empty());
        assert_eq!(cache.connections_created(), 0);
    }
}
