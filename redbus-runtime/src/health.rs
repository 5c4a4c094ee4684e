//! Structured health reporting for Redis environments.
//!
//! Every probe failure is swallowed into `healthy: false` plus a reason;
//! health checks never propagate errors.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use redbus_core::config::{Environment, HealthConfig};
use redbus_core::error::Result;

use crate::connection::ConnectionRegistry;
use crate::pool::ConnectionPool;

/// Full health record for one environment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub environment: Environment,
    pub timestamp: DateTime<Utc>,
    pub connection: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub active_connections: usize,
    pub total_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    pub used: u64,
    pub peak: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands_per_second: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyspace_hits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyspace_misses: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_ratio: Option<f64>,
}

/// One retained probe result.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub healthy: bool,
    pub latency: Option<Duration>,
    pub at: DateTime<Utc>,
}

/// Health monitor with a rolling per-environment sample history.
pub struct RedisHealth {
    registry: Arc<ConnectionRegistry>,
    pool: Option<Arc<ConnectionPool>>,
    config: HealthConfig,
    history: DashMap<Environment, Mutex<VecDeque<HealthSample>>>,
}

impl RedisHealth {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pool: Option<Arc<ConnectionPool>>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            config,
            history: DashMap::new(),
        }
    }

    /// Probe one environment and build its full status record.
    pub async fn status(&self, env: Environment) -> HealthStatus {
        let probe = self.registry.health_status(env).await;

        let (memory, performance) = if probe.healthy {
            self.server_info(env).await.unwrap_or((None, None))
        } else {
            (None, None)
        };

        self.push_sample(
            env,
            HealthSample {
                healthy: probe.healthy,
                latency: probe.latency,
                at: Utc::now(),
            },
        );

        HealthStatus {
            healthy: probe.healthy,
            environment: env,
            timestamp: Utc::now(),
            connection: ConnectionStatus {
                status: if probe.healthy { "connected" } else { "disconnected" }.to_string(),
                latency_ms: probe.latency.map(|d| d.as_millis() as u64),
                error: probe.error,
            },
            pool: self.pool.as_ref().map(|pool| {
                let stats = pool.stats(env);
                PoolStatus {
                    active_connections: stats.active,
                    total_connections: stats.total,
                }
            }),
            memory,
            performance,
        }
    }

    /// Boolean health with a hard deadline. Timeouts read as unhealthy.
    pub async fn is_healthy(&self, env: Environment) -> bool {
        let deadline = Duration::from_secs(self.config.probe_timeout_secs.max(1));
        match timeout(deadline, self.registry.health_status(env)).await {
            Ok(probe) => probe.healthy,
            Err(_) => false,
        }
    }

    /// Average latency over the last `n` healthy samples.
    #[must_use]
    pub fn average_latency(&self, env: Environment, n: usize) -> Option<Duration> {
        let entry = self.history.get(&env)?;
        let history = entry.lock();
        let latencies: Vec<Duration> = history
            .iter()
            .rev()
            .take(n)
            .filter_map(|sample| sample.latency)
            .collect();
        if latencies.is_empty() {
            return None;
        }
        let total: Duration = latencies.iter().sum();
        Some(total / latencies.len() as u32)
    }

    /// The retained samples for an environment, oldest first.
    #[must_use]
    pub fn history(&self, env: Environment) -> Vec<HealthSample> {
        self.history
            .get(&env)
            .map(|entry| entry.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Spawn a periodic probe loop for one environment.
    ///
    /// Probes every `probe_interval_secs`; after
    /// `max_consecutive_failures` consecutive failed probes the
    /// environment is reported unhealthy until a probe succeeds. Samples
    /// land in the rolling history either way.
    pub fn start_monitoring(self: &Arc<Self>, env: Environment, cancel_token: CancellationToken) {
        let monitor = self.clone();
        let interval = Duration::from_secs(self.config.probe_interval_secs.max(1));
        let failure_threshold = self.config.max_consecutive_failures.max(1);

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            let mut consecutive_failures: u32 = 0;
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!(environment = %env, "Health monitor stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        let status = monitor.status(env).await;
                        if status.healthy {
                            if consecutive_failures >= failure_threshold {
                                info!(environment = %env, "Redis recovered");
                            }
                            consecutive_failures = 0;
                        } else {
                            consecutive_failures += 1;
                            if consecutive_failures == failure_threshold {
                                warn!(
                                    environment = %env,
                                    consecutive_failures = consecutive_failures,
                                    "Redis marked unhealthy after consecutive probe failures"
                                );
                            }
                        }
                    }
                }
            }
        });
    }

    fn push_sample(&self, env: Environment, sample: HealthSample) {
        let entry = self
            .history
            .entry(env)
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut history = entry.lock();
        if history.len() == self.config.history_size.max(1) {
            history.pop_front();
        }
        history.push_back(sample);
    }

    async fn server_info(
        &self,
        env: Environment,
    ) -> Result<(Option<MemoryStatus>, Option<PerformanceStatus>)> {
        let mut conn = self.registry.get(env).await?;
        let raw: String = redis::cmd("INFO")
            .arg("memory")
            .arg("stats")
            .query_async(&mut conn)
            .await?;
        let info = parse_info(&raw);
        debug!(environment = %env, fields = info.len(), "Parsed server INFO");

        let memory = info.get("used_memory").and_then(|v| v.parse::<u64>().ok()).map(|used| {
            let peak = info
                .get("used_memory_peak")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(used);
            let percentage = info
                .get("maxmemory")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|max| *max > 0)
                .map(|max| used as f64 / max as f64 * 100.0);
            MemoryStatus { used, peak, percentage }
        });

        let keyspace_hits = info.get("keyspace_hits").and_then(|v| v.parse::<u64>().ok());
        let keyspace_misses = info.get("keyspace_misses").and_then(|v| v.parse::<u64>().ok());
        let hit_ratio = match (keyspace_hits, keyspace_misses) {
            (Some(hits), Some(misses)) if hits + misses > 0 => {
                Some(hits as f64 / (hits + misses) as f64)
            }
            _ => None,
        };
        let performance = Some(PerformanceStatus {
            commands_per_second: info
                .get("instantaneous_ops_per_sec")
                .and_then(|v| v.parse::<u64>().ok()),
            keyspace_hits,
            keyspace_misses,
            hit_ratio,
        });

        Ok((memory, performance))
    }
}

/// Parse a Redis INFO response into key/value pairs.
fn parse_info(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use redbus_core::config::RuntimeConfig;

    fn health() -> RedisHealth {
        let registry = Arc::new(ConnectionRegistry::new(RuntimeConfig::default()));
        RedisHealth::new(registry, None, HealthConfig::default())
    }

    #[test]
    fn test_parse_info() {
        let raw = "# Memory\r\nused_memory:1024\r\nused_memory_peak:2048\r\nmaxmemory:0\r\n\
                   # Stats\r\nkeyspace_hits:90\r\nkeyspace_misses:10\r\n";
        let info = parse_info(raw);
        assert_eq!(info.get("used_memory").map(String::as_str), Some("1024"));
        assert_eq!(info.get("keyspace_hits").map(String::as_str), Some("90"));
        assert!(!info.contains_key("# Memory"));
    }

    #[test]
    fn test_history_is_bounded() {
        let registry = Arc::new(ConnectionRegistry::new(RuntimeConfig::default()));
        let monitor = RedisHealth::new(
            registry,
            None,
            HealthConfig {
                history_size: 3,
                ..HealthConfig::default()
            },
        );

        for i in 0..10 {
            monitor.push_sample(
                Environment::Development,
                HealthSample {
                    healthy: true,
                    latency: Some(Duration::from_millis(i)),
                    at: Utc::now(),
                },
            );
        }

        let history = monitor.history(Environment::Development);
        assert_eq!(history.len(), 3);
        // Oldest samples were evicted
        assert_eq!(history[0].latency, Some(Duration::from_millis(7)));
    }

    #[test]
    fn test_average_latency_over_last_n() {
        let monitor = health();
        for ms in [10u64, 20, 30, 40] {
            monitor.push_sample(
                Environment::Development,
                HealthSample {
                    healthy: true,
                    latency: Some(Duration::from_millis(ms)),
                    at: Utc::now(),
                },
            );
        }

        // Last two samples: 30ms and 40ms
        assert_eq!(
            monitor.average_latency(Environment::Development, 2),
            Some(Duration::from_millis(35))
        );
        assert!(monitor.average_latency(Environment::Test, 5).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_redis_reads_unhealthy() {
        let mut config = RuntimeConfig::default();
        // A port nothing listens on
        config.connection.port = 1;
        config.connection.connect_timeout_secs = 1;
        let registry = Arc::new(ConnectionRegistry::new(config));
        let monitor = RedisHealth::new(registry, None, HealthConfig::default());

        let status = monitor.status(Environment::Development).await;
        assert!(!status.healthy);
        assert_eq!(status.connection.status, "disconnected");
        assert!(status.connection.error.is_some());
        assert!(status.memory.is_none());

        assert!(!monitor.is_healthy(Environment::Development).await);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_status_against_live_server() {
        let monitor = health();
        let status = monitor.status(Environment::Development).await;
        assert!(status.healthy);
        assert!(status.connection.latency_ms.is_some());
        assert!(status.memory.is_some());

        let json = serde_json::to_value(&status).unwrap();
        assert!(json["connection"]["latencyMs"].is_number());
    }
}
