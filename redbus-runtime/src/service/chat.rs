//! Room chat: rate-limited, sanitized sends, room subscriptions, and a
//! global monitoring feed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::warn;

use redbus_core::channel::{self, CHAT_GLOBAL};
use redbus_core::error::{Error, Result};
use redbus_core::message::{ChatMessage, Envelope, MessageBody};
use redbus_core::validation::strip_html;

use crate::publisher::{PublishOptions, PublishResult, Publisher};
use crate::service::ServiceStatus;
use crate::subscriber::{handler, HandlerFn, SubscribeOptions, Subscriber, SubscriptionId};

/// Default per-user sends per minute
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 30;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Per-user tumbling window state.
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Chat messaging facade.
pub struct ChatService {
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    rate_limit_per_minute: u32,
    max_message_length: usize,
    /// Tumbling 1-minute windows keyed by user id.
    windows: DashMap<String, RateWindow>,
    /// Active room subscriptions keyed by room id.
    rooms: DashMap<String, SubscriptionId>,
    monitor: Mutex<Option<SubscriptionId>>,
}

impl ChatService {
    #[must_use]
    pub fn new(
        publisher: Arc<Publisher>,
        subscriber: Arc<Subscriber>,
        rate_limit_per_minute: u32,
        max_message_length: usize,
    ) -> Self {
        Self {
            publisher,
            subscriber,
            rate_limit_per_minute: rate_limit_per_minute.max(1),
            max_message_length,
            windows: DashMap::new(),
            rooms: DashMap::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Send a chat message into a room.
    ///
    /// Enforces the message length bound and the per-user rate limit,
    /// sanitizes the content, and publishes to both the room channel and
    /// the global monitoring channel.
    pub async fn send_message(
        &self,
        room_id: &str,
        user_id: &str,
        content: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<PublishResult> {
        if room_id.trim().is_empty() || user_id.trim().is_empty() {
            return Err(Error::Validation("roomId and userId are required".to_string()));
        }
        if content.chars().count() > self.max_message_length {
            return Err(Error::TooLarge {
                size: content.chars().count(),
                max: self.max_message_length,
            });
        }
        self.check_rate_limit(user_id)?;

        let sanitized = strip_html(content);
        if sanitized.is_empty() {
            return Err(Error::Validation("content is empty".to_string()));
        }

        let body = MessageBody::Chat(ChatMessage {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            content: sanitized,
            metadata,
        });

        let opts = PublishOptions::default();
        let result = self
            .publisher
            .publish(&channel::chat_room(room_id), body.clone(), &opts)
            .await;

        // Mirror onto the global feed for monitors; the room publish is
        // the authoritative result.
        let mirror = self.publisher.publish(CHAT_GLOBAL, body, &opts).await;
        if !mirror.success {
            warn!(
                room_id = %room_id,
                error = ?mirror.error,
                "Global chat mirror publish failed"
            );
        }

        Ok(result)
    }

    /// Send a direct message. The room id is deterministic for the pair
    /// of users, regardless of direction.
    pub async fn send_direct_message(
        &self,
        from_user: &str,
        to_user: &str,
        content: &str,
    ) -> Result<PublishResult> {
        let room_id = Self::direct_room_id(from_user, to_user);
        self.send_message(&room_id, from_user, content, None).await
    }

    /// Deterministic DM room id: `dm:<min>:<max>`.
    #[must_use]
    pub fn direct_room_id(a: &str, b: &str) -> String {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        format!("dm:{low}:{high}")
    }

    /// Subscribe to a room. The handler sees only messages whose
    /// `roomId` matches.
    pub fn join_room(&self, room_id: &str, room_handler: HandlerFn) -> Result<SubscriptionId> {
        let target_room = room_id.to_string();
        let filtered = handler(move |envelope: Envelope| {
            let target_room = target_room.clone();
            let room_handler = room_handler.clone();
            async move {
                if let MessageBody::Chat(chat) = &envelope.body {
                    if chat.room_id == target_room {
                        room_handler(envelope.clone()).await?;
                    }
                }
                Ok(())
            }
        });

        let id = self.subscriber.subscribe(
            &channel::chat_room(room_id),
            filtered,
            SubscribeOptions::default(),
        )?;
        self.rooms.insert(room_id.to_string(), id.clone());
        Ok(id)
    }

    /// Drop the subscription for a room.
    pub fn leave_room(&self, room_id: &str) -> Result<()> {
        let Some((_, id)) = self.rooms.remove(room_id) else {
            return Err(Error::Subscribe(format!("Not joined to room {room_id}")));
        };
        self.subscriber.unsubscribe(&id)
    }

    /// Subscribe to the global feed carrying every chat message.
    pub fn monitor_all_messages(&self, monitor_handler: HandlerFn) -> Result<SubscriptionId> {
        let id = self
            .subscriber
            .subscribe(CHAT_GLOBAL, monitor_handler, SubscribeOptions::default())?;
        *self.monitor.lock() = Some(id.clone());
        Ok(id)
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            name: "chat",
            listening: !self.rooms.is_empty() || self.monitor.lock().is_some(),
            handler_count: self.rooms.len() + usize::from(self.monitor.lock().is_some()),
        }
    }

    /// Drop room subscriptions, the monitor, and rate-limit state.
    pub fn destroy(&self) {
        let room_subs: Vec<SubscriptionId> =
            self.rooms.iter().map(|entry| entry.value().clone()).collect();
        self.rooms.clear();
        for id in room_subs {
            if let Err(e) = self.subscriber.unsubscribe(&id) {
                warn!(error = %e, "Failed to drop room subscription");
            }
        }
        let monitor = self.monitor.lock().take();
        if let Some(id) = monitor {
            if let Err(e) = self.subscriber.unsubscribe(&id) {
                warn!(error = %e, "Failed to drop chat monitor subscription");
            }
        }
        self.windows.clear();
    }

    /// Tumbling-window rate limit. The window opens on the first
    /// accepted send and resets exactly `RATE_WINDOW` later.
    fn check_rate_limit(&self, user_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(user_id.to_string())
            .or_insert_with(|| RateWindow {
                window_start: now,
                count: 0,
            });

        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= RATE_WINDOW {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= self.rate_limit_per_minute {
            let retry_after = RATE_WINDOW.saturating_sub(elapsed);
            return Err(Error::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::pool::ConnectionPool;
    use redbus_core::config::{Environment, PubSubConfig, RuntimeConfig};
    use redbus_core::metrics::OperationMetrics;

    fn service(rate_limit: u32) -> ChatService {
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
        ChatService::new(publisher, subscriber, rate_limit, 1_000)
    }

    #[test]
    fn test_direct_room_id_is_order_independent() {
        assert_eq!(ChatService::direct_room_id("alice", "bob"), "dm:alice:bob");
        assert_eq!(ChatService::direct_room_id("bob", "alice"), "dm:alice:bob");
        assert_eq!(ChatService::direct_room_id("u", "u"), "dm:u:u");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_tumbling_window() {
        let service = service(2);

        service.check_rate_limit("u1").unwrap();
        service.check_rate_limit("u1").unwrap();
        assert!(matches!(
            service.check_rate_limit("u1"),
            Err(Error::RateLimited { .. })
        ));

        // Another user has an independent window
        service.check_rate_limit("u2").unwrap();

        // Just before the window closes, still limited
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(service.check_rate_limit("u1").is_err());

        // The window resets 60s after the first accepted send
        tokio::time::advance(Duration::from_secs(1)).await;
        service.check_rate_limit("u1").unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
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
        let service = ChatService::new(publisher, subscriber, 30, 5);

        let result = service.send_message("r1", "u1", "too long!", None).await;
        assert!(matches!(result, Err(Error::TooLarge { .. })));
        service.destroy();
    }

    #[tokio::test]
    async fn test_empty_identifiers_are_rejected() {
        let service = service(30);
        assert!(service.send_message("", "u1", "hi", None).await.is_err());
        assert!(service.send_message("r1", "", "hi", None).await.is_err());
        service.destroy();
    }

    #[tokio::test]
    async fn test_html_only_content_is_rejected() {
        let service = service(30);
        let result = service
            .send_message("r1", "u1", "<script>alert(1)</script>", None)
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        service.destroy();
    }

    #[tokio::test]
    async fn test_join_and_leave_room() {
        let service = service(30);
        service
            .join_room("r1", handler(|_| async { Ok(()) }))
            .unwrap();
        assert!(service.status().listening);

        service.leave_room("r1").unwrap();
        assert!(service.leave_room("r1").is_err());
        assert!(!service.status().listening);
        service.destroy();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_chat_round_trip_with_monitor() {
        use tokio::sync::mpsc;

        let service = service(30);
        let (room_tx, mut room_rx) = mpsc::channel(4);
        let (mon_tx, mut mon_rx) = mpsc::channel(4);

        service
            .join_room(
                "r1",
                handler(move |envelope| {
                    let tx = room_tx.clone();
                    async move {
                        tx.send(envelope).await.ok();
                        Ok(())
                    }
                }),
            )
            .unwrap();
        service
            .monitor_all_messages(handler(move |envelope| {
                let tx = mon_tx.clone();
                async move {
                    tx.send(envelope).await.ok();
                    Ok(())
                }
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        let result = service.send_message("r1", "u1", "hi", None).await.unwrap();
        assert!(result.success);

        let room_msg = tokio::time::timeout(Duration::from_secs(2), room_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match &room_msg.body {
            MessageBody::Chat(chat) => {
                assert_eq!(chat.content, "hi");
                assert_eq!(chat.room_id, "r1");
            }
            other => panic!("Expected chat message, got {other:?}"),
        }

        let mon_msg = tokio::time::timeout(Duration::from_secs(2), mon_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mon_msg.message_type(), "chat");

        service.destroy();
    }
}
