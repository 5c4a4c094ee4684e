//! Validate → serialize → publish, with batching and optional
//! confirmation.
//!
//! Expected failure modes come back inside [`PublishResult`] rather than
//! as errors, so callers always receive a structured outcome.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::AsyncCommands;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use redbus_core::channel;
use redbus_core::config::{Environment, PubSubConfig};
use redbus_core::error::{Error, Result};
use redbus_core::message::{Envelope, MessageBody};
use redbus_core::metrics::{self, pubsub::MESSAGES_PUBLISHED, pubsub::PUBLISH_DURATION_SECONDS, OperationMetrics};
use redbus_core::resilience::{timeout::REDIS_OPERATION_TIMEOUT, with_retry, CircuitBreaker, RetryPolicy};
use redbus_core::serializer::Serializer;
use redbus_core::validation::MessageValidator;

use crate::channel_manager::{ChannelEvent, ChannelStatsRegistry};
use crate::connection::ConnectionRegistry;
use crate::pool::ConnectionPool;

/// Per-publish options.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub validate: bool,
    pub retry: bool,
    /// When set, a side key `ttl:<channel>:<id>` is written with this
    /// expiry in seconds. Consumption of the key is a caller convention;
    /// no behavior is attached to its expiry.
    pub ttl: Option<u64>,
    pub compress: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            validate: true,
            retry: true,
            ttl: None,
            compress: false,
        }
    }
}

/// Outcome of a publish call.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub success: bool,
    pub message_id: Option<String>,
    /// Subscriber count reported by Redis.
    pub subscriber_count: Option<usize>,
    pub retries: u32,
    pub error: Option<String>,
}

impl PublishResult {
    fn failure(message_id: Option<String>, retries: u32, error: &Error) -> Self {
        Self {
            success: false,
            message_id,
            subscriber_count: None,
            retries,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of [`Publisher::publish_with_confirmation`].
#[derive(Debug, Clone)]
pub struct ConfirmedPublish {
    pub publish: PublishResult,
    pub confirmed: bool,
    pub confirmation_time: Option<Duration>,
}

/// Publishes envelopes onto Redis channels via the shared pool.
pub struct Publisher {
    environment: Environment,
    registry: Arc<ConnectionRegistry>,
    pool: Arc<ConnectionPool>,
    validator: MessageValidator,
    retry_policy: RetryPolicy,
    breaker: CircuitBreaker,
    metrics: OperationMetrics,
    compression: bool,
    compression_threshold: usize,
    source: Option<String>,
    channel_stats: Option<ChannelStatsRegistry>,
}

impl Publisher {
    #[must_use]
    pub fn new(
        environment: Environment,
        registry: Arc<ConnectionRegistry>,
        pool: Arc<ConnectionPool>,
        config: &PubSubConfig,
        metrics: OperationMetrics,
    ) -> Self {
        Self {
            environment,
            registry,
            pool,
            validator: MessageValidator::new(config.max_chat_length, config.max_message_size),
            retry_policy: RetryPolicy::from(&config.retry),
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
            metrics,
            compression: config.compression,
            compression_threshold: config.compression_threshold,
            source: None,
            channel_stats: None,
        }
    }

    /// Tag outgoing envelopes with a producer identity.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Record per-channel activity into a stats registry.
    #[must_use]
    pub fn with_channel_stats(mut self, stats: ChannelStatsRegistry) -> Self {
        self.channel_stats = Some(stats);
        self
    }

    fn record_stat(&self, channel_name: &str, event: ChannelEvent) {
        if let Some(stats) = &self.channel_stats {
            stats.record(channel_name, event);
        }
    }

    #[must_use]
    pub fn validator(&self) -> &MessageValidator {
        &self.validator
    }

    fn serializer(&self, opts: &PublishOptions) -> Serializer {
        Serializer::new(self.compression || opts.compress, self.compression_threshold)
    }

    fn envelope_for(&self, body: MessageBody) -> Envelope {
        let envelope = Envelope::new(body);
        match &self.source {
            Some(source) => envelope.with_source(source.clone()),
            None => envelope,
        }
    }

    /// Publish one message.
    pub async fn publish(
        &self,
        channel_name: &str,
        body: MessageBody,
        opts: &PublishOptions,
    ) -> PublishResult {
        let timer = self.metrics.start_operation("publisher.publish");
        let started = Instant::now();
        let result = self.publish_inner(channel_name, body, opts).await;

        match &result {
            r if r.success => {
                timer.finish(true, None);
                self.record_stat(channel_name, ChannelEvent::MessageSent);
                let kind = channel::parse(channel_name).kind;
                MESSAGES_PUBLISHED.with_label_values(&[kind.as_str()]).inc();
                PUBLISH_DURATION_SECONDS
                    .with_label_values(&[kind.as_str()])
                    .observe(started.elapsed().as_secs_f64());
            }
            r => {
                timer.finish(false, r.error.as_deref());
                self.record_stat(channel_name, ChannelEvent::Error);
            }
        }
        result
    }

    async fn publish_inner(
        &self,
        channel_name: &str,
        body: MessageBody,
        opts: &PublishOptions,
    ) -> PublishResult {
        if let Err(e) = channel::validate(channel_name) {
            return PublishResult::failure(None, 0, &e);
        }

        let envelope = self.envelope_for(body);
        let message_id = envelope.id.clone();

        if opts.validate {
            if let Err(e) = self.validator.validate(&envelope) {
                return PublishResult::failure(Some(message_id), 0, &e);
            }
        }

        let payload = match self.serializer(opts).serialize(&envelope) {
            Ok(payload) => payload,
            Err(e) => return PublishResult::failure(Some(message_id), 0, &e),
        };

        if let Err(e) = self.breaker.check() {
            return PublishResult::failure(Some(message_id), 0, &e);
        }

        let attempt = || async {
            let mut leased = self.pool.get(self.environment).await?;
            let mut conn = leased.connection().await?;
            let published = timeout(
                REDIS_OPERATION_TIMEOUT,
                conn.publish::<_, _, usize>(channel_name, &payload),
            )
            .await;
            match published {
                Ok(Ok(subscribers)) => Ok(subscribers),
                Ok(Err(e)) => {
                    // The leased client may hold a dead connection
                    leased.discard();
                    Err(Error::Publish(e.to_string()))
                }
                Err(_) => {
                    leased.discard();
                    Err(Error::Timeout(format!("PUBLISH on {channel_name} timed out")))
                }
            }
        };

        let (publish_result, attempts) = if opts.retry {
            let outcome = with_retry(&self.retry_policy, attempt).await;
            (outcome.result, outcome.attempts)
        } else {
            (attempt().await, 1)
        };
        let retries = attempts.saturating_sub(1);

        let subscribers = match publish_result {
            Ok(subscribers) => {
                self.breaker.on_success();
                subscribers
            }
            Err(e) => {
                self.breaker.on_failure();
                return PublishResult::failure(Some(message_id), retries, &e);
            }
        };

        if let Some(ttl) = opts.ttl {
            self.write_ttl_key(channel_name, &message_id, ttl).await;
        }

        debug!(
            channel = %channel_name,
            message_id = %message_id,
            subscribers = subscribers,
            retries = retries,
            "Message published"
        );

        PublishResult {
            success: true,
            message_id: Some(message_id),
            subscriber_count: Some(subscribers),
            retries,
            error: None,
        }
    }

    /// Best-effort TTL side key: `ttl:<channel>:<id> = id`, expiring
    /// after `ttl` seconds.
    async fn write_ttl_key(&self, channel_name: &str, message_id: &str, ttl: u64) {
        let key = format!("ttl:{channel_name}:{message_id}");
        let write = async {
            let mut leased = self.pool.get(self.environment).await?;
            let mut conn = leased.connection().await?;
            timeout(
                REDIS_OPERATION_TIMEOUT,
                conn.set_ex::<_, _, ()>(&key, message_id, ttl),
            )
            .await
            .map_err(|_| Error::Timeout("TTL key write timed out".to_string()))?
            .map_err(Error::from)
        };
        if let Err(e) = write.await {
            warn!(key = %key, error = %e, "Failed to write TTL side key");
        }
    }

    /// Publish a batch through one pipeline.
    ///
    /// Payloads are built up front (per-message failures are recorded in
    /// place), then the pipeline executes once and its replies map back
    /// to results in caller order. One bad message never aborts the rest.
    pub async fn publish_batch(
        &self,
        messages: Vec<(String, MessageBody)>,
        opts: &PublishOptions,
    ) -> Vec<PublishResult> {
        let serializer = self.serializer(opts);
        let mut results: Vec<Option<PublishResult>> = Vec::with_capacity(messages.len());
        let mut prepared: Vec<(usize, String, String, String)> = Vec::new();

        for (index, (channel_name, body)) in messages.into_iter().enumerate() {
            results.push(None);

            if let Err(e) = channel::validate(&channel_name) {
                results[index] = Some(PublishResult::failure(None, 0, &e));
                continue;
            }
            let envelope = self.envelope_for(body);
            let message_id = envelope.id.clone();
            if opts.validate {
                if let Err(e) = self.validator.validate(&envelope) {
                    results[index] = Some(PublishResult::failure(Some(message_id), 0, &e));
                    continue;
                }
            }
            match serializer.serialize(&envelope) {
                Ok(payload) => prepared.push((index, channel_name, message_id, payload)),
                Err(e) => results[index] = Some(PublishResult::failure(Some(message_id), 0, &e)),
            }
        }

        if prepared.is_empty() {
            return results.into_iter().flatten().collect();
        }

        let pipeline_result: Result<Vec<usize>> = async {
            let mut leased = self.pool.get(self.environment).await?;
            let mut conn = leased.connection().await?;
            let mut pipe = redis::pipe();
            for (_, channel_name, _, payload) in &prepared {
                pipe.publish(channel_name, payload);
            }
            timeout(REDIS_OPERATION_TIMEOUT, pipe.query_async(&mut conn))
                .await
                .map_err(|_| Error::Timeout("Batch publish timed out".to_string()))?
                .map_err(Error::from)
        }
        .await;

        match pipeline_result {
            Ok(counts) => {
                for ((index, channel_name, message_id, _), subscribers) in
                    prepared.into_iter().zip(counts)
                {
                    self.record_stat(&channel_name, ChannelEvent::MessageSent);
                    let kind = channel::parse(&channel_name).kind;
                    MESSAGES_PUBLISHED.with_label_values(&[kind.as_str()]).inc();
                    results[index] = Some(PublishResult {
                        success: true,
                        message_id: Some(message_id),
                        subscriber_count: Some(subscribers),
                        retries: 0,
                        error: None,
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, "Batch pipeline failed");
                for (index, _, message_id, _) in prepared {
                    results[index] = Some(PublishResult::failure(Some(message_id), 0, &e));
                }
            }
        }

        results.into_iter().flatten().collect()
    }

    /// Publish and wait for a confirmation carrying the message id.
    ///
    /// The confirmation subscription is a short-lived dedicated client,
    /// created before the publish so a fast confirmer cannot be missed.
    /// One timeout covers every exit path; the client is dropped on all
    /// of them. A timeout is reported as `confirmed: false`, not an
    /// error.
    pub async fn publish_with_confirmation(
        &self,
        channel_name: &str,
        body: MessageBody,
        confirmation_channel: &str,
        wait: Duration,
        opts: &PublishOptions,
    ) -> ConfirmedPublish {
        let result = metrics::timed(&self.metrics, "publisher.publish_with_confirmation", async {
            self.confirm_inner(channel_name, body, confirmation_channel, wait, opts)
                .await
        })
        .await;

        match result {
            Ok(confirmed) => confirmed,
            Err(e) => ConfirmedPublish {
                publish: PublishResult::failure(None, 0, &e),
                confirmed: false,
                confirmation_time: None,
            },
        }
    }

    async fn confirm_inner(
        &self,
        channel_name: &str,
        body: MessageBody,
        confirmation_channel: &str,
        wait: Duration,
        opts: &PublishOptions,
    ) -> Result<ConfirmedPublish> {
        channel::validate(confirmation_channel)?;

        let managed = self.registry.managed(self.environment)?;
        let mut pubsub = managed
            .client()
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Connect(format!("Failed to open confirmation client: {e}")))?;
        pubsub
            .subscribe(confirmation_channel)
            .await
            .map_err(|e| Error::Subscribe(format!("Failed to subscribe {confirmation_channel}: {e}")))?;

        let publish = self.publish(channel_name, body, opts).await;
        if !publish.success {
            return Ok(ConfirmedPublish {
                publish,
                confirmed: false,
                confirmation_time: None,
            });
        }
        let expected_id = publish.message_id.clone().unwrap_or_default();

        let started = Instant::now();
        let confirmed = timeout(wait, async {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload) else {
                    continue;
                };
                if value.get("messageId").and_then(|v| v.as_str()) == Some(expected_id.as_str()) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        // The pubsub client drops here on every path, releasing the
        // connection regardless of how the wait ended.

        Ok(ConfirmedPublish {
            confirmation_time: confirmed.then(|| started.elapsed()),
            publish,
            confirmed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redbus_core::config::RuntimeConfig;
    use redbus_core::message::ChatMessage;

    fn publisher() -> Publisher {
        let config = RuntimeConfig::default();
        let registry = Arc::new(ConnectionRegistry::new(config.clone()));
        let pool = Arc::new(ConnectionPool::new(4));
        Publisher::new(
            Environment::Development,
            registry,
            pool,
            &config.pubsub,
            OperationMetrics::new(100),
        )
    }

    fn chat_body(content: &str) -> MessageBody {
        MessageBody::Chat(ChatMessage {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
            content: content.to_string(),
            metadata: None,
        })
    }

    #[tokio::test]
    async fn test_invalid_channel_is_reported_not_thrown() {
        let publisher = publisher();
        let result = publisher
            .publish("bad channel!", chat_body("hi"), &PublishOptions::default())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("invalid characters"));
        assert_eq!(result.retries, 0);
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let publisher = publisher();
        let result = publisher
            .publish("chat_room:r1", chat_body(""), &PublishOptions::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.retries, 0);
        assert!(result.message_id.is_some());
    }

    #[tokio::test]
    async fn test_batch_records_per_message_validation_failures() {
        let publisher = publisher();
        let results = publisher
            .publish_batch(
                vec![
                    ("bad channel!".to_string(), chat_body("a")),
                    ("chat_room:r1".to_string(), chat_body("")),
                ],
                &PublishOptions::default(),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(!results[1].success);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_publish_round_trip() {
        let publisher = publisher();
        let result = publisher
            .publish("chat_room:r1", chat_body("hello"), &PublishOptions::default())
            .await;
        assert!(result.success);
        assert!(result.message_id.is_some());
        assert!(result.subscriber_count.is_some());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_confirmation_times_out_without_confirmer() {
        let publisher = publisher();
        let outcome = publisher
            .publish_with_confirmation(
                "chat_room:r1",
                chat_body("anyone there?"),
                "confirmations:test",
                Duration::from_millis(500),
                &PublishOptions::default(),
            )
            .await;
        assert!(outcome.publish.success);
        assert!(!outcome.confirmed);
        assert!(outcome.confirmation_time.is_none());
    }
}
