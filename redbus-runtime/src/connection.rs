//! Per-environment Redis client lifecycle.
//!
//! One logical client per environment, created lazily. Readiness is
//! gated on a round-tripped PING when the environment's config asks for
//! it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::Client as RedisClient;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use redbus_core::config::{ConnectionConfig, Environment, RuntimeConfig};
use redbus_core::error::{Error, Result};

/// Outcome of a health probe against one environment.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub healthy: bool,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

/// A lazily-connected client for one environment.
pub struct ManagedConnection {
    environment: Environment,
    config: ConnectionConfig,
    client: RedisClient,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
}

impl ManagedConnection {
    fn new(environment: Environment, config: ConnectionConfig) -> Result<Self> {
        let client = RedisClient::open(config.redis_url())
            .map_err(|e| Error::Connect(format!("Failed to create Redis client: {e}")))?;
        Ok(Self {
            environment,
            config,
            client,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    /// The underlying client, for callers that need a fresh dedicated
    /// connection (pub/sub mode, confirmation waits).
    #[must_use]
    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the shared multiplexed connection, connecting on first use.
    pub async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let mut conn = match timeout(
            connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(Error::Connect(format!(
                    "Failed to connect to Redis ({}): {e}",
                    self.environment
                )));
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "Timed out connecting to Redis ({})",
                    self.environment
                )));
            }
        };

        if self.config.ready_check {
            Self::ping(&mut conn, Duration::from_secs(self.config.command_timeout_secs)).await?;
        }

        info!(environment = %self.environment, "Redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next use reconnects.
    pub async fn reset(&self) {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            debug!(environment = %self.environment, "Redis connection reset");
        }
    }

    async fn ping(conn: &mut MultiplexedConnection, deadline: Duration) -> Result<()> {
        match timeout(deadline, redis::cmd("PING").query_async::<String>(conn)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Connect(format!("Redis ping failed: {e}"))),
            Err(_) => Err(Error::Timeout("Redis ping timed out".to_string())),
        }
    }
}

/// Registry of one [`ManagedConnection`] per environment.
///
/// Explicitly constructed during runtime wiring and torn down on
/// shutdown; components hold a shared reference instead of reaching for
/// globals.
pub struct ConnectionRegistry {
    runtime_config: RuntimeConfig,
    connections: DashMap<Environment, Arc<ManagedConnection>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self {
            runtime_config,
            connections: DashMap::new(),
        }
    }

    /// Connection settings for an environment. The runtime's own
    /// environment uses the loaded config; others fall back to baseline
    /// per-environment defaults.
    #[must_use]
    pub fn config(&self, env: Environment) -> ConnectionConfig {
        if env == self.runtime_config.environment {
            self.runtime_config.connection.clone()
        } else {
            ConnectionConfig::for_env(env)
        }
    }

    /// The managed client for an environment, created on first access.
    pub fn managed(&self, env: Environment) -> Result<Arc<ManagedConnection>> {
        if let Some(existing) = self.connections.get(&env) {
            return Ok(existing.clone());
        }
        let managed = Arc::new(ManagedConnection::new(env, self.config(env))?);
        Ok(self
            .connections
            .entry(env)
            .or_insert(managed)
            .clone())
    }

    /// Shared command connection for an environment, connecting lazily.
    pub async fn get(&self, env: Environment) -> Result<MultiplexedConnection> {
        self.managed(env)?.connection().await
    }

    /// Ping the environment and report round-trip latency.
    pub async fn health_status(&self, env: Environment) -> ConnectionHealth {
        let managed = match self.managed(env) {
            Ok(managed) => managed,
            Err(e) => {
                return ConnectionHealth {
                    healthy: false,
                    latency: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let started = Instant::now();
        let probe = async {
            let mut conn = managed.connection().await?;
            ManagedConnection::ping(
                &mut conn,
                Duration::from_secs(managed.config.command_timeout_secs),
            )
            .await
        };

        match probe.await {
            Ok(()) => ConnectionHealth {
                healthy: true,
                latency: Some(started.elapsed()),
                error: None,
            },
            Err(e) => {
                warn!(environment = %env, error = %e, "Redis health probe failed");
                // A failed probe may mean a stale cached connection
                managed.reset().await;
                ConnectionHealth {
                    healthy: false,
                    latency: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Environments with a created client.
    #[must_use]
    pub fn active_environments(&self) -> Vec<Environment> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Disconnect every cached client and clear the registry.
    pub async fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().reset().await;
        }
        self.connections.clear();
        info!("All Redis connections closed");
    }
}
