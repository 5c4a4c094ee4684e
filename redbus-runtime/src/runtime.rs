//! Runtime wiring: construct the registry, pool, publisher, subscriber,
//! and domain services from one configuration, with idempotent
//! start/stop.
//!
//! Components hold shared references handed out during wiring; nothing
//! reaches for process-wide globals.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use redbus_core::config::{Environment, RuntimeConfig};
use redbus_core::error::{Error, Result};
use redbus_core::metrics::OperationMetrics;

use crate::channel_manager::{ChannelStatsRegistry, DEFAULT_CLEANUP_HORIZON};
use crate::connection::ConnectionRegistry;
use crate::health::RedisHealth;
use crate::pool::ConnectionPool;
use crate::publisher::Publisher;
use crate::service::{AdminService, ChatService, EventsService, HeartbeatService};
use crate::subscriber::Subscriber;

/// Everything that exists only while the runtime is started.
struct Components {
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    health: Arc<RedisHealth>,
    admin: Arc<AdminService>,
    chat: Arc<ChatService>,
    heartbeat: Arc<HeartbeatService>,
    events: Arc<EventsService>,
    cancel_token: CancellationToken,
}

/// The messaging runtime: one wired set of components per process.
pub struct MessagingRuntime {
    config: RwLock<RuntimeConfig>,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<ConnectionPool>,
    metrics: OperationMetrics,
    channel_stats: ChannelStatsRegistry,
    components: Mutex<Option<Arc<Components>>>,
}

impl MessagingRuntime {
    /// Validate the configuration and wire the connection layer.
    ///
    /// `None` loads configuration from the environment.
    pub fn initialize(config: Option<RuntimeConfig>) -> Result<Self> {
        let config = match config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => RuntimeConfig::load()?,
        };

        let registry = Arc::new(ConnectionRegistry::new(config.clone()));
        let pool = Arc::new(ConnectionPool::new(config.connection.pool_size));
        pool.register(config.environment, config.connection.clone());

        let metrics = if config.metrics.enabled {
            OperationMetrics::new(config.metrics.history_size)
        } else {
            OperationMetrics::disabled()
        };

        info!(environment = %config.environment, "Messaging runtime initialized");
        Ok(Self {
            config: RwLock::new(config),
            registry,
            pool,
            metrics,
            channel_stats: ChannelStatsRegistry::new(),
            components: Mutex::new(None),
        })
    }

    /// Build and start the messaging components. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.components.lock().is_some() {
            return Ok(());
        }

        let config = self.config.read().clone();
        let env = config.environment;

        let publisher = Arc::new(
            Publisher::new(
                env,
                self.registry.clone(),
                self.pool.clone(),
                &config.pubsub,
                self.metrics.clone(),
            )
            .with_source(
                config
                    .heartbeat
                    .process_id
                    .clone()
                    .unwrap_or_else(|| format!("redbus-{}", std::process::id())),
            )
            .with_channel_stats(self.channel_stats.clone()),
        );
        let subscriber = Arc::new(
            Subscriber::new(env, self.registry.clone(), &config.pubsub)
                .with_channel_stats(self.channel_stats.clone()),
        );
        let health = Arc::new(RedisHealth::new(
            self.registry.clone(),
            Some(self.pool.clone()),
            config.health.clone(),
        ));

        let admin = Arc::new(AdminService::new(
            publisher.clone(),
            subscriber.clone(),
            config
                .heartbeat
                .process_id
                .clone()
                .unwrap_or_else(|| "admin".to_string()),
        ));
        let chat = Arc::new(ChatService::new(
            publisher.clone(),
            subscriber.clone(),
            config.pubsub.rate_limit_per_minute,
            config.pubsub.max_chat_length,
        ));
        let heartbeat = Arc::new(HeartbeatService::new(
            publisher.clone(),
            subscriber.clone(),
            config.heartbeat.process_id.clone(),
            Duration::from_secs(config.heartbeat.interval_secs),
            Duration::from_secs(config.heartbeat.timeout_secs),
        ));
        let events = Arc::new(EventsService::new(publisher.clone(), subscriber.clone()));

        let cancel_token = CancellationToken::new();
        self.channel_stats.start_cleanup_task(
            Duration::from_secs(60 * 60),
            DEFAULT_CLEANUP_HORIZON,
            cancel_token.clone(),
        );
        health.start_monitoring(env, cancel_token.clone());

        // Eager connect unless the environment asked for lazy startup.
        if !config.connection.lazy_connect {
            self.registry.get(env).await?;
        }

        *self.components.lock() = Some(Arc::new(Components {
            publisher,
            subscriber,
            health,
            admin,
            chat,
            heartbeat,
            events,
            cancel_token,
        }));
        info!(environment = %env, "Messaging runtime started");
        Ok(())
    }

    /// Tear everything down. Idempotent; failures are logged and never
    /// block the remaining shutdown steps.
    pub async fn stop(&self) {
        let components = self.components.lock().take();
        let Some(components) = components else {
            return;
        };

        components.heartbeat.destroy().await;
        components.admin.destroy();
        components.chat.destroy();
        components.events.destroy();
        components.subscriber.shutdown();
        components.cancel_token.cancel();

        self.pool.clear_all();
        self.registry.close_all().await;
        info!("Messaging runtime stopped");
    }

    /// Apply a configuration change. Takes effect for components built
    /// after the next start; connection settings require a stop/start
    /// cycle.
    pub fn update_config(&self, apply: impl FnOnce(&mut RuntimeConfig)) -> Result<()> {
        let mut updated = self.config.read().clone();
        apply(&mut updated);
        updated.validate()?;
        if self.components.lock().is_some() {
            warn!("Configuration updated while running; restart to apply connection changes");
        }
        *self.config.write() = updated;
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.config.read().environment
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.components.lock().is_some()
    }

    #[must_use]
    pub fn metrics(&self) -> &OperationMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn channel_stats(&self) -> &ChannelStatsRegistry {
        &self.channel_stats
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn components(&self) -> Result<Arc<Components>> {
        self.components
            .lock()
            .clone()
            .ok_or_else(|| Error::Config("Runtime is not started".to_string()))
    }

    pub fn publisher(&self) -> Result<Arc<Publisher>> {
        Ok(self.components()?.publisher.clone())
    }

    pub fn subscriber(&self) -> Result<Arc<Subscriber>> {
        Ok(self.components()?.subscriber.clone())
    }

    pub fn health(&self) -> Result<Arc<RedisHealth>> {
        Ok(self.components()?.health.clone())
    }

    pub fn admin(&self) -> Result<Arc<AdminService>> {
        Ok(self.components()?.admin.clone())
    }

    pub fn chat(&self) -> Result<Arc<ChatService>> {
        Ok(self.components()?.chat.clone())
    }

    pub fn heartbeat(&self) -> Result<Arc<HeartbeatService>> {
        Ok(self.components()?.heartbeat.clone())
    }

    pub fn events(&self) -> Result<Arc<EventsService>> {
        Ok(self.components()?.events.clone())
    }
}
