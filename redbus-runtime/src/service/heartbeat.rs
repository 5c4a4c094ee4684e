//! Process liveness: periodic heartbeat emission and a tracked map of
//! peer processes with staleness eviction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use redbus_core::channel::HEARTBEAT_STATUS;
use redbus_core::error::Result;
use redbus_core::message::{HeartbeatMessage, MessageBody, STOPPED_STATUS};

use crate::publisher::{PublishOptions, Publisher};
use crate::service::ServiceStatus;
use crate::subscriber::{handler, HandlerFn, SubscribeOptions, Subscriber, SubscriptionId};

/// Default emission interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default liveness timeout
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Tracked state of one peer process.
#[derive(Clone)]
pub struct ProcessStatus {
    pub process_id: String,
    pub status: String,
    pub last_seen: DateTime<Utc>,
    pub metadata: Option<Map<String, Value>>,
    /// Monotonic receipt time, used for liveness math.
    last_seen_at: Instant,
}

impl std::fmt::Debug for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessStatus")
            .field("process_id", &self.process_id)
            .field("status", &self.status)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

/// Heartbeat emitter and peer tracker.
pub struct HeartbeatService {
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    process_id: String,
    interval: Duration,
    timeout: Duration,
    processes: Arc<DashMap<String, ProcessStatus>>,
    emitter: Mutex<Option<CancellationToken>>,
    cleanup: Mutex<Option<CancellationToken>>,
    listen_sub: Mutex<Option<SubscriptionId>>,
}

impl HeartbeatService {
    #[must_use]
    pub fn new(
        publisher: Arc<Publisher>,
        subscriber: Arc<Subscriber>,
        process_id: Option<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            publisher,
            subscriber,
            process_id: process_id.unwrap_or_else(default_process_id),
            interval,
            timeout,
            processes: Arc::new(DashMap::new()),
            emitter: Mutex::new(None),
            cleanup: Mutex::new(None),
            listen_sub: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Start emitting heartbeats: one immediately, then every interval.
    /// A previous emitter is cancelled first.
    pub fn start_heartbeat(&self, status: &str, metadata: Option<Map<String, Value>>) {
        if let Some(previous) = self.emitter.lock().take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        *self.emitter.lock() = Some(token.clone());

        let publisher = self.publisher.clone();
        let process_id = self.process_id.clone();
        let status = status.to_string();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!(process_id = %process_id, "Heartbeat emitter stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        let body = MessageBody::Heartbeat(HeartbeatMessage {
                            process_id: process_id.clone(),
                            status: status.clone(),
                            metadata: metadata.clone(),
                        });
                        let result = publisher
                            .publish(HEARTBEAT_STATUS, body, &PublishOptions::default())
                            .await;
                        if !result.success {
                            warn!(
                                process_id = %process_id,
                                error = ?result.error,
                                "Heartbeat publish failed"
                            );
                        }
                    }
                }
            }
        });
        info!(process_id = %self.process_id, interval = ?self.interval, "Heartbeat started");
    }

    /// Cancel the emitter and send a final `stopped` heartbeat.
    pub async fn stop_heartbeat(&self) {
        let token = self.emitter.lock().take();
        let Some(token) = token else {
            return;
        };
        token.cancel();

        let body = MessageBody::Heartbeat(HeartbeatMessage {
            process_id: self.process_id.clone(),
            status: STOPPED_STATUS.to_string(),
            metadata: None,
        });
        let result = self
            .publisher
            .publish(HEARTBEAT_STATUS, body, &PublishOptions::default())
            .await;
        if !result.success {
            warn!(error = ?result.error, "Final stopped heartbeat failed");
        }
        info!(process_id = %self.process_id, "Heartbeat stopped");
    }

    /// Subscribe to heartbeats and maintain the process map. An optional
    /// handler observes every inbound heartbeat after the map update.
    pub fn start_listening(&self, default_handler: Option<HandlerFn>) -> Result<()> {
        let mut guard = self.listen_sub.lock();
        if guard.is_some() {
            return Ok(());
        }

        let processes = self.processes.clone();
        let listen = handler(move |envelope| {
            let processes = processes.clone();
            let default_handler = default_handler.clone();
            async move {
                if let MessageBody::Heartbeat(hb) = &envelope.body {
                    apply_heartbeat(&processes, hb);
                }
                if let Some(h) = default_handler {
                    h(envelope).await?;
                }
                Ok(())
            }
        });

        let id = self
            .subscriber
            .subscribe(HEARTBEAT_STATUS, listen, SubscribeOptions::default())?;
        *guard = Some(id);
        drop(guard);

        self.start_cleanup_task();
        Ok(())
    }

    /// Whether a process was seen recently and has not reported stopping.
    #[must_use]
    pub fn is_process_healthy(&self, process_id: &str) -> bool {
        self.processes.get(process_id).is_some_and(|status| {
            status.last_seen_at.elapsed() < self.timeout && status.status != STOPPED_STATUS
        })
    }

    /// All tracked processes.
    #[must_use]
    pub fn get_active_processes(&self) -> Vec<ProcessStatus> {
        self.processes.iter().map(|entry| entry.value().clone()).collect()
    }

    #[must_use]
    pub fn get_process(&self, process_id: &str) -> Option<ProcessStatus> {
        self.processes.get(process_id).map(|entry| entry.clone())
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: "heartbeat",
            listening: self.listen_sub.lock().is_some(),
            handler_count: usize::from(self.listen_sub.lock().is_some()),
        }
    }

    /// Cancel the emitter and cleanup tasks, drop the subscription, and
    /// clear tracked processes. The final `stopped` heartbeat is sent.
    pub async fn destroy(&self) {
        self.stop_heartbeat().await;
        if let Some(token) = self.cleanup.lock().take() {
            token.cancel();
        }
        let sub = self.listen_sub.lock().take();
        if let Some(id) = sub {
            if let Err(e) = self.subscriber.unsubscribe(&id) {
                warn!(error = %e, "Failed to drop heartbeat subscription");
            }
        }
        self.processes.clear();
    }

    /// Evict processes unseen for `3 × timeout`, checking every
    /// `2 × timeout`.
    fn start_cleanup_task(&self) {
        let mut guard = self.cleanup.lock();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());

        let processes = self.processes.clone();
        let horizon = self.timeout * 3;
        let check_interval = self.timeout * 2;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(check_interval);
            timer.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = timer.tick() => {
                        evict_stale(&processes, horizon);
                    }
                }
            }
        });
    }
}

/// Record one inbound heartbeat in the process map.
fn apply_heartbeat(processes: &DashMap<String, ProcessStatus>, hb: &HeartbeatMessage) {
    processes.insert(
        hb.process_id.clone(),
        ProcessStatus {
            process_id: hb.process_id.clone(),
            status: hb.status.clone(),
            last_seen: Utc::now(),
            metadata: hb.metadata.clone(),
            last_seen_at: Instant::now(),
        },
    );
}

/// Drop processes unseen for longer than `horizon`.
fn evict_stale(processes: &DashMap<String, ProcessStatus>, horizon: Duration) -> usize {
    let before = processes.len();
    processes.retain(|_, status| status.last_seen_at.elapsed() <= horizon);
    let evicted = before - processes.len();
    if evicted > 0 {
        debug!(evicted = evicted, "Evicted stale processes");
    }
    evicted
}

/// `<hostname>-<pid>`, falling back to a random id when the hostname is
/// unavailable.
fn default_process_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("host-{}", nanoid::nanoid!(6)));
    format!("{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::pool::ConnectionPool;
    use redbus_core::config::{Environment, PubSubConfig, RuntimeConfig};
    use redbus_core::metrics::OperationMetrics;

    fn service(interval: Duration, timeout: Duration) -> HeartbeatService {
        let config = RuntimeConfig::default();
        let registry = Arc::new(ConnectionRegistry::new(config.clone()));
        let pool = Arc::new(ConnectionPool::new(4));
        let publisher = Arc::new(Publisher::new(
            Environment::Development,
            registry.clone(),
            pool,
            &config.pubsub,
            OperationMetrics::new(100),
        ));
        let subscriber = Arc::new(Subscriber::new(
            Environment::Development,
            registry,
            &PubSubConfig::default(),
        ));
        HeartbeatService::new(
            publisher,
            subscriber,
            Some("proc-test".to_string()),
            interval,
            timeout,
        )
    }

    fn heartbeat(process_id: &str, status: &str) -> HeartbeatMessage {
        HeartbeatMessage {
            process_id: process_id.to_string(),
            status: status.to_string(),
            metadata: None,
        }
    }

    #[test]
    fn test_default_process_id_shape() {
        let id = default_process_id();
        assert!(id.contains('-'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_window() {
        let service = service(Duration::from_secs(30), Duration::from_secs(60));

        apply_heartbeat(&service.processes, &heartbeat("A", "healthy"));
        assert!(service.is_process_healthy("A"));

        // Refreshed at t=30s
        tokio::time::advance(Duration::from_secs(30)).await;
        apply_heartbeat(&service.processes, &heartbeat("A", "healthy"));

        // t=45s: last seen 15s ago
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(service.is_process_healthy("A"));

        // t=91s: last seen 61s ago, past the 60s timeout
        tokio::time::advance(Duration::from_secs(46)).await;
        assert!(!service.is_process_healthy("A"));

        // Still tracked until the eviction horizon
        assert_eq!(service.get_active_processes().len(), 1);

        // t=211s: last seen 181s ago, past 3x timeout
        tokio::time::advance(Duration::from_secs(120)).await;
        evict_stale(&service.processes, Duration::from_secs(180));
        assert!(service.get_active_processes().is_empty());
        assert!(!service.is_process_healthy("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_status_is_unhealthy() {
        let service = service(Duration::from_secs(30), Duration::from_secs(60));

        apply_heartbeat(&service.processes, &heartbeat("A", STOPPED_STATUS));
        // Seen just now, but stopped
        assert!(!service.is_process_healthy("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_process_is_unhealthy() {
        let service = service(Duration::from_secs(30), Duration::from_secs(60));
        assert!(!service.is_process_healthy("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale_keeps_fresh_entries() {
        let processes = DashMap::new();
        apply_heartbeat(&processes, &heartbeat("old", "healthy"));
        tokio::time::advance(Duration::from_secs(100)).await;
        apply_heartbeat(&processes, &heartbeat("fresh", "healthy"));

        assert_eq!(evict_stale(&processes, Duration::from_secs(60)), 1);
        assert!(processes.contains_key("fresh"));
        assert!(!processes.contains_key("old"));
    }

    #[tokio::test]
    async fn test_get_process_snapshot() {
        let service = service(Duration::from_secs(30), Duration::from_secs(60));
        apply_heartbeat(&service.processes, &heartbeat("A", "degraded"));

        let status = service.get_process("A").unwrap();
        assert_eq!(status.process_id, "A");
        assert_eq!(status.status, "degraded");
        assert!(service.get_process("B").is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_heartbeat_emission_round_trip() {
        let service = service(Duration::from_millis(200), Duration::from_secs(2));
        service.start_listening(None).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        service.start_heartbeat("healthy", None);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(service.is_process_healthy("proc-test"));
        service.destroy().await;
        assert!(service.get_active_processes().is_empty());
    }
}
