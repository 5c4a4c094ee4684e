//! Bounded pool of reusable Redis command clients, per environment.
//!
//! Borrow with [`ConnectionPool::get`]; the returned guard hands the
//! entry back on drop. Entries returned while the idle list is full are
//! disconnected instead of kept.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Client as RedisClient;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info};

use redbus_core::config::{ConnectionConfig, Environment};
use redbus_core::error::{Error, Result};
use redbus_core::metrics::pubsub::POOL_CONNECTIONS_ACTIVE;

/// Default maximum clients per environment
pub const DEFAULT_POOL_CAP: usize = 10;
/// Hard upper bound on the configurable cap
pub const MAX_POOL_CAP: usize = 100;

/// Lifecycle state of a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    Leased,
    Broken,
}

/// One pooled client plus its metadata.
pub struct PoolEntry {
    environment: Environment,
    client: RedisClient,
    conn: Option<MultiplexedConnection>,
    connect_timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    state: EntryState,
}

impl PoolEntry {
    fn new(environment: Environment, config: &ConnectionConfig) -> Result<Self> {
        let client = RedisClient::open(config.redis_url())
            .map_err(|e| Error::Connect(format!("Failed to create pooled client: {e}")))?;
        Ok(Self {
            environment,
            client,
            conn: None,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            state: EntryState::Idle,
        })
    }

    /// The entry's connection, established on first use.
    pub async fn connection(&mut self) -> Result<MultiplexedConnection> {
        self.last_used_at = Utc::now();
        if let Some(conn) = self.conn.as_ref() {
            return Ok(conn.clone());
        }
        let conn = match timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.state = EntryState::Broken;
                return Err(Error::Connect(format!(
                    "Failed to connect pooled client ({}): {e}",
                    self.environment
                )));
            }
            Err(_) => {
                self.state = EntryState::Broken;
                return Err(Error::Timeout(format!(
                    "Timed out connecting pooled client ({})",
                    self.environment
                )));
            }
        };
        self.conn = Some(conn.clone());
        Ok(conn)
    }
}

struct EnvPool {
    environment: Environment,
    config: ConnectionConfig,
    cap: usize,
    /// Permits bound the number of entries checked out at once.
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<PoolEntry>>,
    /// Entries in existence, idle or leased.
    total: AtomicUsize,
    leased: AtomicUsize,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
    last_used_at: Mutex<DateTime<Utc>>,
}

impl EnvPool {
    fn return_entry(&self, mut entry: PoolEntry) {
        self.leased.fetch_sub(1, Ordering::SeqCst);
        POOL_CONNECTIONS_ACTIVE.dec();
        *self.last_used_at.lock() = Utc::now();

        if self.closed.load(Ordering::SeqCst) || entry.state == EntryState::Broken {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return; // dropped: the client disconnects
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.cap {
            entry.state = EntryState::Idle;
            idle.push(entry);
        } else {
            self.total.fetch_sub(1, Ordering::SeqCst);
            debug!(environment = %self.environment, "Idle list full, disconnecting returned client");
        }
    }

    fn discard_entry(&self, _entry: PoolEntry) {
        self.leased.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_sub(1, Ordering::SeqCst);
        POOL_CONNECTIONS_ACTIVE.dec();
    }
}

/// Borrow guard for one pooled client.
///
/// Dropping the guard returns the client to the pool; [`discard`] closes
/// it instead (for clients observed broken mid-use).
///
/// [`discard`]: PooledConnection::discard
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    pool: Arc<EnvPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The leased client's connection, established lazily.
    pub async fn connection(&mut self) -> Result<MultiplexedConnection> {
        self.entry
            .as_mut()
            .ok_or(Error::Shutdown)?
            .connection()
            .await
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.pool.environment
    }

    /// Close this client instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.discard_entry(entry);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.return_entry(entry);
        }
    }
}

/// Bounded set of reusable command clients per environment.
pub struct ConnectionPool {
    configs: DashMap<Environment, ConnectionConfig>,
    pools: DashMap<Environment, Arc<EnvPool>>,
    cap: usize,
}

impl ConnectionPool {
    /// Create a pool with the given per-lease cap (clamped to
    /// [`MAX_POOL_CAP`], defaulting to [`DEFAULT_POOL_CAP`] when zero).
    #[must_use]
    pub fn new(cap: usize) -> Self {
        let cap = if cap == 0 { DEFAULT_POOL_CAP } else { cap.min(MAX_POOL_CAP) };
        Self {
            configs: DashMap::new(),
            pools: DashMap::new(),
            cap,
        }
    }

    /// Register connection settings for an environment. Environments
    /// without explicit settings use baseline defaults.
    pub fn register(&self, env: Environment, config: ConnectionConfig) {
        self.configs.insert(env, config);
    }

    fn env_pool(&self, env: Environment) -> Arc<EnvPool> {
        if let Some(pool) = self.pools.get(&env) {
            return pool.clone();
        }
        let config = self
            .configs
            .get(&env)
            .map(|c| c.clone())
            .unwrap_or_else(|| ConnectionConfig::for_env(env));
        let pool = Arc::new(EnvPool {
            environment: env,
            config,
            cap: self.cap,
            semaphore: Arc::new(Semaphore::new(self.cap)),
            idle: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
            last_used_at: Mutex::new(Utc::now()),
        });
        self.pools.entry(env).or_insert(pool).clone()
    }

    /// Borrow a client for `env`.
    ///
    /// Pops an idle entry when one exists, creates a new one while the
    /// pool is under its cap, and otherwise waits for a return. Waiters
    /// are served in FIFO order, so an oversubscribed pool makes forward
    /// progress without starvation.
    pub async fn get(&self, env: Environment) -> Result<PooledConnection> {
        let pool = self.env_pool(env);
        if pool.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let permit = pool
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Shutdown)?;

        let entry = {
            let mut idle = pool.idle.lock();
            idle.pop()
        };

        let mut entry = match entry {
            Some(entry) => entry,
            None => {
                let entry = PoolEntry::new(env, &pool.config)?;
                pool.total.fetch_add(1, Ordering::SeqCst);
                entry
            }
        };
        entry.state = EntryState::Leased;
        entry.last_used_at = Utc::now();

        pool.leased.fetch_add(1, Ordering::SeqCst);
        POOL_CONNECTIONS_ACTIVE.inc();
        *pool.last_used_at.lock() = Utc::now();

        Ok(PooledConnection {
            entry: Some(entry),
            pool,
            _permit: permit,
        })
    }

    /// Usage statistics for one environment.
    #[must_use]
    pub fn stats(&self, env: Environment) -> PoolStats {
        match self.pools.get(&env) {
            Some(pool) => PoolStats {
                environment: env,
                active: pool.leased.load(Ordering::SeqCst),
                idle: pool.idle.lock().len(),
                total: pool.total.load(Ordering::SeqCst),
                created_at: pool.created_at,
                last_used_at: *pool.last_used_at.lock(),
            },
            None => PoolStats {
                environment: env,
                active: 0,
                idle: 0,
                total: 0,
                created_at: Utc::now(),
                last_used_at: Utc::now(),
            },
        }
    }

    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Disconnect every idle client and refuse further leases.
    pub fn clear_all(&self) {
        for entry in self.pools.iter() {
            let pool = entry.value();
            pool.closed.store(true, Ordering::SeqCst);
            let mut idle = pool.idle.lock();
            let drained = idle.len();
            pool.total.fetch_sub(drained, Ordering::SeqCst);
            idle.clear();
        }
        self.pools.clear();
        info!("Connection pool cleared");
    }
}

/// Pool usage snapshot.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub environment: Environment,
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}
