//! Pattern-aware subscriber with per-subscription dispatch, retry, and
//! dead-letter routing.
//!
//! The subscriber owns one dedicated Redis connection in subscription
//! mode, driven by a background read loop. Each subscription gets its own
//! bounded worker queue: frames for one subscription are processed in
//! order (retries included), while a slow handler never blocks dispatch
//! to the others.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use redbus_core::channel;
use redbus_core::config::{Environment, PubSubConfig};
use redbus_core::error::{Error, Result};
use redbus_core::message::{DeadLetter, Envelope};
use redbus_core::metrics::pubsub::{
    DEAD_LETTERS_TOTAL, HANDLER_ERRORS_TOTAL, MESSAGES_RECEIVED, SUBSCRIPTIONS_ACTIVE,
};
use redbus_core::resilience::timeout::REDIS_OPERATION_TIMEOUT;
use redbus_core::serializer::Serializer;
use redbus_core::validation::MessageValidator;

use crate::channel_manager::{ChannelEvent, ChannelStatsRegistry};
use crate::connection::ConnectionRegistry;

/// Capacity of each subscription's worker queue. Frames are dropped with
/// a warning when a handler falls this far behind.
const WORKER_QUEUE_CAPACITY: usize = 256;

/// Initial backoff before a subscriber reconnect attempt
const INITIAL_BACKOFF_SECS: u64 = 1;
/// Maximum backoff between reconnect attempts
const MAX_BACKOFF_SECS: u64 = 30;
/// Reconnect attempts shared across all subscriptions
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 20;

/// Handler invoked for each delivered message.
pub type HandlerFn = Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Build a [`HandlerFn`] from an async closure.
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(f(envelope)))
}

/// Per-subscription options.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Subscribe with PSUBSCRIBE and match on the original pattern.
    pub pattern: bool,
    pub auto_reconnect: bool,
    /// Handler retries per message before dead-lettering.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub validate: bool,
    pub dead_letter_channel: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            pattern: false,
            auto_reconnect: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            validate: true,
            dead_letter_channel: None,
        }
    }
}

/// Lifecycle of a subscription. Only `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Creating,
    Active,
    /// Transiently disconnected; will return to `Active` on reconnect.
    Broken,
    Closed,
}

pub type SubscriptionId = String;

/// Shared subscription record, owned by the subscriber.
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel: String,
    pub is_pattern: bool,
    pub options: SubscribeOptions,
    state: Mutex<SubscriptionState>,
    pub created_at: DateTime<Utc>,
    message_count: AtomicU64,
    error_count: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    worker_tx: mpsc::Sender<Frame>,
}

impl Subscription {
    fn set_state(&self, state: SubscriptionState) {
        *self.state.lock() = state;
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    fn snapshot(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            channel: self.channel.clone(),
            is_pattern: self.is_pattern,
            state: self.state(),
            created_at: self.created_at,
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_activity: *self.last_activity.lock(),
        }
    }
}

/// Point-in-time view of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub channel: String,
    pub is_pattern: bool,
    pub state: SubscriptionState,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Aggregate subscriber statistics.
#[derive(Debug, Clone)]
pub struct SubscriberStats {
    pub subscriptions: usize,
    pub active: usize,
    pub total_messages: u64,
    pub total_errors: u64,
    pub connected: bool,
}

/// One inbound frame routed to a subscription worker.
#[derive(Debug, Clone)]
struct Frame {
    channel: String,
    payload: String,
}

/// Dead-letter publish request, drained by the pump task.
struct DeadLetterJob {
    target: String,
    letter: DeadLetter,
}

enum Control {
    Subscribe { channel: String, pattern: bool },
    Unsubscribe { channel: String, pattern: bool },
}

/// How the connected read loop ended.
enum SubscriberExit {
    /// The connection was healthy, then the stream ended. Backoff resets.
    Disconnected,
    /// Connecting or subscribing failed. Backoff keeps increasing.
    ConnectFailed(Error),
}

/// Subscribes to channels and patterns, dispatching frames to handlers.
pub struct Subscriber {
    environment: Environment,
    registry: Arc<ConnectionRegistry>,
    serializer: Serializer,
    validator: MessageValidator,
    subscriptions: Arc<DashMap<SubscriptionId, Arc<Subscription>>>,
    control_tx: Mutex<Option<mpsc::Sender<Control>>>,
    dlq_tx: mpsc::Sender<DeadLetterJob>,
    connected: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    max_reconnect_attempts: u32,
    channel_stats: Option<ChannelStatsRegistry>,
}

impl Subscriber {
    #[must_use]
    pub fn new(
        environment: Environment,
        registry: Arc<ConnectionRegistry>,
        config: &PubSubConfig,
    ) -> Self {
        let (dlq_tx, dlq_rx) = mpsc::channel(1024);
        let cancel_token = CancellationToken::new();

        let subscriber = Self {
            environment,
            registry: registry.clone(),
            serializer: Serializer::new(config.compression, config.compression_threshold),
            validator: MessageValidator::new(config.max_chat_length, config.max_message_size),
            subscriptions: Arc::new(DashMap::new()),
            control_tx: Mutex::new(None),
            dlq_tx,
            connected: Arc::new(AtomicBool::new(false)),
            cancel_token: cancel_token.clone(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            channel_stats: None,
        };

        tokio::spawn(run_dead_letter_pump(
            environment,
            registry,
            dlq_rx,
            cancel_token,
        ));

        subscriber
    }

    /// Cancellation token for external shutdown signaling.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
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

    /// Register a handler for a channel or pattern.
    pub fn subscribe(
        &self,
        channel_name: &str,
        handler: HandlerFn,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionId> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let mut opts = opts;
        if opts.pattern {
            // Pattern channels carry glob metacharacters the plain
            // grammar rejects; only bound the length.
            if channel_name.is_empty() || channel_name.len() > channel::MAX_CHANNEL_LENGTH {
                return Err(Error::Validation(format!(
                    "Invalid pattern channel: {channel_name:?}"
                )));
            }
        } else {
            channel::validate(channel_name)?;
        }
        if let Some(dlq) = &opts.dead_letter_channel {
            channel::validate(dlq)?;
        }
        opts.retry_delay = opts.retry_delay.max(Duration::from_millis(1));

        let id: SubscriptionId = nanoid::nanoid!(16);
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);

        let subscription = Arc::new(Subscription {
            id: id.clone(),
            channel: channel_name.to_string(),
            is_pattern: opts.pattern,
            options: opts,
            state: Mutex::new(SubscriptionState::Creating),
            created_at: Utc::now(),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_activity: Mutex::new(None),
            worker_tx,
        });

        let is_pattern = subscription.is_pattern;
        self.subscriptions.insert(id.clone(), subscription.clone());
        SUBSCRIPTIONS_ACTIVE.inc();
        self.record_stat(channel_name, ChannelEvent::SubscriberAdded);

        tokio::spawn(run_worker(
            WorkerContext {
                subscription,
                handler,
                serializer: self.serializer.clone(),
                validator: self.validator.clone(),
                dlq_tx: self.dlq_tx.clone(),
                channel_stats: self.channel_stats.clone(),
            },
            worker_rx,
        ));

        self.ensure_read_loop();
        self.send_control(Control::Subscribe {
            channel: channel_name.to_string(),
            pattern: is_pattern,
        });

        info!(
            subscription_id = %id,
            channel = %channel_name,
            "Subscription registered"
        );
        Ok(id)
    }

    /// Register several subscriptions at once.
    pub fn subscribe_multiple(
        &self,
        requests: Vec<(String, HandlerFn, SubscribeOptions)>,
    ) -> Vec<Result<SubscriptionId>> {
        requests
            .into_iter()
            .map(|(channel_name, handler, opts)| self.subscribe(&channel_name, handler, opts))
            .collect()
    }

    /// Remove a subscription. Unsubscribes from Redis when it was the
    /// last subscription on its channel.
    pub fn unsubscribe(&self, id: &str) -> Result<()> {
        let Some((_, subscription)) = self.subscriptions.remove(id) else {
            return Err(Error::Subscribe(format!("Unknown subscription: {id}")));
        };
        subscription.set_state(SubscriptionState::Closed);
        SUBSCRIPTIONS_ACTIVE.dec();
        self.record_stat(&subscription.channel, ChannelEvent::SubscriberRemoved);

        let still_used = self.subscriptions.iter().any(|entry| {
            entry.channel == subscription.channel && entry.is_pattern == subscription.is_pattern
        });
        if !still_used {
            // Unsubscribe with the original pattern, not a matched
            // channel, so PSUBSCRIBE bookkeeping stays symmetric.
            self.send_control(Control::Unsubscribe {
                channel: subscription.channel.clone(),
                pattern: subscription.is_pattern,
            });
        }

        info!(subscription_id = %id, channel = %subscription.channel, "Unsubscribed");
        Ok(())
    }

    /// Remove every subscription.
    pub fn unsubscribe_all(&self) {
        let ids: Vec<SubscriptionId> =
            self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.unsubscribe(&id);
        }
    }

    #[must_use]
    pub fn get_subscription(&self, id: &str) -> Option<SubscriptionInfo> {
        self.subscriptions.get(id).map(|s| s.snapshot())
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|info| info.state == SubscriptionState::Active)
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> SubscriberStats {
        let mut total_messages = 0;
        let mut total_errors = 0;
        let mut active = 0;
        for entry in self.subscriptions.iter() {
            total_messages += entry.message_count.load(Ordering::Relaxed);
            total_errors += entry.error_count.load(Ordering::Relaxed);
            if entry.state() == SubscriptionState::Active {
                active += 1;
            }
        }
        SubscriberStats {
            subscriptions: self.subscriptions.len(),
            active,
            total_messages,
            total_errors,
            connected: self.connected.load(Ordering::Relaxed),
        }
    }

    /// Stop the read loop and drop every subscription.
    pub fn shutdown(&self) {
        info!("Shutting down subscriber");
        self.cancel_token.cancel();
        self.unsubscribe_all();
    }

    fn send_control(&self, control: Control) {
        let guard = self.control_tx.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(control).is_err() {
                warn!("Subscriber control queue full or closed, command dropped");
            }
        }
    }

    fn ensure_read_loop(&self) {
        let mut guard = self.control_tx.lock();
        if guard.is_some() {
            return;
        }
        let (control_tx, control_rx) = mpsc::channel(64);
        *guard = Some(control_tx);

        tokio::spawn(run_read_loop(ReadLoopContext {
            environment: self.environment,
            registry: self.registry.clone(),
            subscriptions: self.subscriptions.clone(),
            connected: self.connected.clone(),
            cancel_token: self.cancel_token.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            control_rx,
        }));
    }
}

struct ReadLoopContext {
    environment: Environment,
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<DashMap<SubscriptionId, Arc<Subscription>>>,
    connected: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    max_reconnect_attempts: u32,
    control_rx: mpsc::Receiver<Control>,
}

/// Reconnecting read loop that owns the dedicated pub/sub connection.
async fn run_read_loop(mut ctx: ReadLoopContext) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    let mut is_first_connect = true;
    let mut reconnect_attempts: u32 = 0;

    loop {
        if ctx.cancel_token.is_cancelled() {
            info!("Subscriber read loop cancelled");
            return;
        }

        match run_connected(&mut ctx, is_first_connect).await {
            SubscriberExit::Disconnected => {
                // The server was reachable before the drop; retry promptly.
                backoff_secs = INITIAL_BACKOFF_SECS;
                error!(
                    "Subscriber connection lost, reconnecting after {}s",
                    backoff_secs
                );
            }
            SubscriberExit::ConnectFailed(e) => {
                error!(
                    error = %e,
                    backoff_secs = backoff_secs,
                    "Subscriber failed to connect, retrying after backoff"
                );
            }
        }
        is_first_connect = false;
        ctx.connected.store(false, Ordering::Relaxed);
        mark_all(&ctx.subscriptions, SubscriptionState::Broken);

        reconnect_attempts += 1;
        if reconnect_attempts > ctx.max_reconnect_attempts {
            error!(
                attempts = reconnect_attempts,
                "Subscriber exceeded reconnect attempts, closing subscriptions"
            );
            mark_all(&ctx.subscriptions, SubscriptionState::Closed);
            return;
        }

        tokio::select! {
            () = ctx.cancel_token.cancelled() => {
                info!("Subscriber read loop cancelled during backoff");
                return;
            }
            () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
        }
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

/// Run one connected session. Returns how it ended.
async fn run_connected(ctx: &mut ReadLoopContext, is_first_connect: bool) -> SubscriberExit {
    let managed = match ctx.registry.managed(ctx.environment) {
        Ok(managed) => managed,
        Err(e) => return SubscriberExit::ConnectFailed(e),
    };

    let pubsub = match timeout(
        Duration::from_secs(managed.config().connect_timeout_secs),
        managed.client().get_async_pubsub(),
    )
    .await
    {
        Ok(Ok(ps)) => ps,
        Ok(Err(e)) => {
            return SubscriberExit::ConnectFailed(Error::Connect(format!(
                "Failed to open pub/sub connection: {e}"
            )));
        }
        Err(_) => {
            return SubscriberExit::ConnectFailed(Error::Timeout(
                "Timed out opening pub/sub connection".to_string(),
            ));
        }
    };

    let mut pubsub = pubsub;

    // (Re)issue subscriptions. On first connect every registered
    // subscription is subscribed; after a drop only those that asked for
    // auto-reconnect come back. Snapshot first: subscribe commands
    // suspend, and map guards must not be held across them.
    let to_subscribe: Vec<Arc<Subscription>> = ctx
        .subscriptions
        .iter()
        .filter(|entry| {
            entry.state() != SubscriptionState::Closed
                && (is_first_connect || entry.options.auto_reconnect)
        })
        .map(|entry| entry.value().clone())
        .collect();

    for sub in to_subscribe {
        let result = if sub.is_pattern {
            pubsub.psubscribe(&sub.channel).await
        } else {
            pubsub.subscribe(&sub.channel).await
        };
        match result {
            Ok(()) => sub.set_state(SubscriptionState::Active),
            Err(e) => {
                return SubscriberExit::ConnectFailed(Error::Subscribe(format!(
                    "Failed to subscribe {}: {e}",
                    sub.channel
                )));
            }
        }
    }

    ctx.connected.store(true, Ordering::Relaxed);
    info!(environment = %ctx.environment, "Subscriber connected");

    let mut stream = pubsub.on_message();

    loop {
        tokio::select! {
            () = ctx.cancel_token.cancelled() => {
                info!("Subscriber read loop cancelled");
                return SubscriberExit::Disconnected;
            }
            control = ctx.control_rx.recv() => {
                let Some(control) = control else {
                    return SubscriberExit::Disconnected;
                };
                // Subscription commands need the connection back; drop
                // the message stream, issue them, then resume streaming.
                drop(stream);
                match control {
                    Control::Subscribe { channel, pattern } => {
                        let result = if pattern {
                            pubsub.psubscribe(&channel).await
                        } else {
                            pubsub.subscribe(&channel).await
                        };
                        match result {
                            Ok(()) => mark_channel(&ctx.subscriptions, &channel, pattern, SubscriptionState::Active),
                            Err(e) => {
                                warn!(channel = %channel, error = %e, "Subscribe command failed");
                                return SubscriberExit::Disconnected;
                            }
                        }
                    }
                    Control::Unsubscribe { channel, pattern } => {
                        let result = if pattern {
                            pubsub.punsubscribe(&channel).await
                        } else {
                            pubsub.unsubscribe(&channel).await
                        };
                        if let Err(e) = result {
                            warn!(channel = %channel, error = %e, "Unsubscribe command failed");
                        }
                    }
                }
                stream = pubsub.on_message();
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return SubscriberExit::Disconnected;
                };
                let channel_name = msg.get_channel_name().to_string();
                let pattern: Option<String> = msg.get_pattern().ok();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Invalid payload encoding");
                        continue;
                    }
                };
                dispatch_frame(&ctx.subscriptions, &channel_name, pattern.as_deref(), &payload);
            }
        }
    }
}

fn mark_all(subscriptions: &DashMap<SubscriptionId, Arc<Subscription>>, state: SubscriptionState) {
    for entry in subscriptions.iter() {
        if entry.state() != SubscriptionState::Closed {
            entry.set_state(state);
        }
    }
}

fn mark_channel(
    subscriptions: &DashMap<SubscriptionId, Arc<Subscription>>,
    channel_name: &str,
    pattern: bool,
    state: SubscriptionState,
) {
    for entry in subscriptions.iter() {
        if entry.channel == channel_name && entry.is_pattern == pattern {
            entry.set_state(state);
        }
    }
}

/// Route one frame to every matching subscription's worker queue.
///
/// Non-pattern subscriptions match on channel equality; pattern
/// subscriptions match on the pattern Redis reported for the frame.
fn dispatch_frame(
    subscriptions: &DashMap<SubscriptionId, Arc<Subscription>>,
    channel_name: &str,
    pattern: Option<&str>,
    payload: &str,
) -> usize {
    let mut matched = 0;
    for entry in subscriptions.iter() {
        let sub = entry.value();
        if sub.state() == SubscriptionState::Closed {
            continue;
        }
        let matches = if sub.is_pattern {
            pattern == Some(sub.channel.as_str())
        } else {
            sub.channel == channel_name
        };
        if !matches {
            continue;
        }
        matched += 1;
        let frame = Frame {
            channel: channel_name.to_string(),
            payload: payload.to_string(),
        };
        match sub.worker_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription_id = %sub.id,
                    channel = %channel_name,
                    "Worker queue full, dropping frame for slow handler"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscription_id = %sub.id, "Worker gone, frame dropped");
            }
        }
    }
    matched
}

struct WorkerContext {
    subscription: Arc<Subscription>,
    handler: HandlerFn,
    serializer: Serializer,
    validator: MessageValidator,
    dlq_tx: mpsc::Sender<DeadLetterJob>,
    channel_stats: Option<ChannelStatsRegistry>,
}

impl WorkerContext {
    fn record_stat(&self, channel_name: &str, event: ChannelEvent) {
        if let Some(stats) = &self.channel_stats {
            stats.record(channel_name, event);
        }
    }
}

/// Sequentially process one subscription's frames.
async fn run_worker(ctx: WorkerContext, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        process_frame(&ctx, frame).await;
    }
    debug!(subscription_id = %ctx.subscription.id, "Subscription worker stopped");
}

async fn process_frame(ctx: &WorkerContext, frame: Frame) {
    let sub = &ctx.subscription;
    let opts = &sub.options;
    let kind = channel::parse(&frame.channel).kind;

    let envelope = match ctx.serializer.deserialize(&frame.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            if opts.validate {
                sub.error_count.fetch_add(1, Ordering::Relaxed);
                dead_letter(ctx, &frame, format!("Malformed payload: {e}")).await;
            } else {
                warn!(
                    subscription_id = %sub.id,
                    channel = %frame.channel,
                    error = %e,
                    "Dropping malformed payload"
                );
            }
            return;
        }
    };

    if opts.validate {
        if let Err(e) = ctx.validator.validate(&envelope) {
            sub.error_count.fetch_add(1, Ordering::Relaxed);
            dead_letter(ctx, &frame, format!("Validation failed: {e}")).await;
            return;
        }
    }

    // One initial attempt plus up to max_retries re-invocations, all in
    // sequence so a retried message is never reordered past later frames
    // for this subscription.
    let mut attempt = 0;
    loop {
        attempt += 1;
        match (ctx.handler)(envelope.clone()).await {
            Ok(()) => {
                sub.message_count.fetch_add(1, Ordering::Relaxed);
                *sub.last_activity.lock() = Some(Utc::now());
                ctx.record_stat(&frame.channel, ChannelEvent::MessageReceived);
                MESSAGES_RECEIVED.with_label_values(&[kind.as_str()]).inc();
                return;
            }
            Err(e) => {
                sub.error_count.fetch_add(1, Ordering::Relaxed);
                ctx.record_stat(&frame.channel, ChannelEvent::Error);
                HANDLER_ERRORS_TOTAL.with_label_values(&[kind.as_str()]).inc();
                if attempt > opts.max_retries {
                    dead_letter(ctx, &frame, format!("Handler failed after {attempt} attempts: {e}"))
                        .await;
                    return;
                }
                debug!(
                    subscription_id = %sub.id,
                    attempt = attempt,
                    error = %e,
                    "Handler failed, retrying"
                );
                tokio::time::sleep(opts.retry_delay).await;
            }
        }
    }
}

async fn dead_letter(ctx: &WorkerContext, frame: &Frame, reason: String) {
    let Some(target) = ctx.subscription.options.dead_letter_channel.clone() else {
        return;
    };
    let job = DeadLetterJob {
        target,
        letter: DeadLetter::new(&frame.channel, &frame.payload, reason),
    };
    if ctx.dlq_tx.send(job).await.is_err() {
        warn!(
            subscription_id = %ctx.subscription.id,
            "Dead-letter queue closed, payload lost"
        );
    }
}

/// Drain dead-letter jobs onto their channels over the shared command
/// connection. Fire and forget: failures are logged, never retried.
async fn run_dead_letter_pump(
    environment: Environment,
    registry: Arc<ConnectionRegistry>,
    mut rx: mpsc::Receiver<DeadLetterJob>,
    cancel_token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            () = cancel_token.cancelled() => return,
            job = rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        let payload = match serde_json::to_string(&job.letter) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode dead letter");
                continue;
            }
        };

        let publish = async {
            let mut conn = registry.get(environment).await?;
            timeout(
                REDIS_OPERATION_TIMEOUT,
                redis::AsyncCommands::publish::<_, _, usize>(&mut conn, &job.target, &payload),
            )
            .await
            .map_err(|_| Error::Timeout("Dead-letter publish timed out".to_string()))?
            .map_err(Error::from)
        };

        match publish.await {
            Ok(_) => {
                DEAD_LETTERS_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
                debug!(channel = %job.target, "Dead letter published");
            }
            Err(e) => {
                DEAD_LETTERS_TOTAL.with_label_values(&["failed"]).inc();
                warn!(channel = %job.target, error = %e, "Dead-letter publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redbus_core::message::{ChatMessage, MessageBody};
    use std::sync::atomic::AtomicU32;

    fn test_subscription(
        channel_name: &str,
        is_pattern: bool,
        opts: SubscribeOptions,
    ) -> (Arc<Subscription>, mpsc::Receiver<Frame>) {
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
        let sub = Arc::new(Subscription {
            id: nanoid::nanoid!(16),
            channel: channel_name.to_string(),
            is_pattern,
            options: opts,
            state: Mutex::new(SubscriptionState::Active),
            created_at: Utc::now(),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_activity: Mutex::new(None),
            worker_tx,
        });
        (sub, worker_rx)
    }

    fn worker_ctx(
        sub: Arc<Subscription>,
        handler_fn: HandlerFn,
    ) -> (WorkerContext, mpsc::Receiver<DeadLetterJob>) {
        let (dlq_tx, dlq_rx) = mpsc::channel(16);
        (
            WorkerContext {
                subscription: sub,
                handler: handler_fn,
                serializer: Serializer::default(),
                validator: MessageValidator::default(),
                dlq_tx,
                channel_stats: None,
            },
            dlq_rx,
        )
    }

    fn chat_payload(content: &str) -> String {
        let envelope = Envelope::new(MessageBody::Chat(ChatMessage {
            room_id: "r1".to_string(),
            user_id: "u1".to_string(),
            content: content.to_string(),
            metadata: None,
        }));
        Serializer::default().serialize(&envelope).unwrap()
    }

    #[tokio::test]
    async fn test_exact_matching_ignores_other_channels() {
        let subscriptions = DashMap::new();
        let (sub, mut rx) = test_subscription("chat_room:r1", false, SubscribeOptions::default());
        subscriptions.insert(sub.id.clone(), sub);

        assert_eq!(dispatch_frame(&subscriptions, "chat_room:r1", None, "x"), 1);
        assert_eq!(dispatch_frame(&subscriptions, "chat_room:r2", None, "x"), 0);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.channel, "chat_room:r1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pattern_matching_uses_original_pattern() {
        let subscriptions = DashMap::new();
        let opts = SubscribeOptions {
            pattern: true,
            ..SubscribeOptions::default()
        };
        let (sub, mut rx) = test_subscription("chat_room:*", true, opts);
        subscriptions.insert(sub.id.clone(), sub);

        // Frame matched by the subscribed pattern
        assert_eq!(
            dispatch_frame(&subscriptions, "chat_room:r1", Some("chat_room:*"), "x"),
            1
        );
        // Frame delivered under a different pattern
        assert_eq!(
            dispatch_frame(&subscriptions, "chat_room:r1", Some("chat_*"), "x"),
            0
        );
        // Non-pattern frame never matches a pattern subscription
        assert_eq!(dispatch_frame(&subscriptions, "chat_room:*", None, "x"), 0);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.channel, "chat_room:r1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_retries_then_dead_letters() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let failing = handler(move |_| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("handler exploded")
            }
        });

        let opts = SubscribeOptions {
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            dead_letter_channel: Some("dlq:test".to_string()),
            ..SubscribeOptions::default()
        };
        let (sub, _worker_rx) = test_subscription("chat_room:r1", false, opts);
        let (ctx, mut dlq_rx) = worker_ctx(sub.clone(), failing);

        process_frame(
            &ctx,
            Frame {
                channel: "chat_room:r1".to_string(),
                payload: chat_payload("hi"),
            },
        )
        .await;

        // Initial attempt + one retry, then exactly one dead letter
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let job = dlq_rx.recv().await.unwrap();
        assert_eq!(job.target, "dlq:test");
        assert_eq!(job.letter.original_channel, "chat_room:r1");
        assert!(job.letter.failure_reason.contains("handler exploded"));
        assert!(dlq_rx.try_recv().is_err());
        assert_eq!(sub.error_count.load(Ordering::Relaxed), 2);
        assert_eq!(sub.message_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_dead_letters_once() {
        let never_called = handler(|_| async { panic!("handler must not run") });
        let opts = SubscribeOptions {
            dead_letter_channel: Some("dlq:test".to_string()),
            ..SubscribeOptions::default()
        };
        let (sub, _worker_rx) = test_subscription("chat_room:r1", false, opts);
        let (ctx, mut dlq_rx) = worker_ctx(sub.clone(), never_called);

        process_frame(
            &ctx,
            Frame {
                channel: "chat_room:r1".to_string(),
                payload: "{definitely not json".to_string(),
            },
        )
        .await;

        let job = dlq_rx.recv().await.unwrap();
        assert_eq!(job.letter.original_message, "{definitely not json");
        assert!(job.letter.failure_reason.contains("Malformed"));
        assert_eq!(sub.error_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_dead_letters() {
        let never_called = handler(|_| async { panic!("handler must not run") });
        let opts = SubscribeOptions {
            dead_letter_channel: Some("dlq:test".to_string()),
            ..SubscribeOptions::default()
        };
        let (sub, _worker_rx) = test_subscription("chat_room:r1", false, opts);
        let (ctx, mut dlq_rx) = worker_ctx(sub, never_called);

        process_frame(
            &ctx,
            Frame {
                channel: "chat_room:r1".to_string(),
                payload: chat_payload(""), // empty content fails validation
            },
        )
        .await;

        let job = dlq_rx.recv().await.unwrap();
        assert!(job.letter.failure_reason.contains("Validation"));
    }

    #[tokio::test]
    async fn test_successful_dispatch_updates_counters() {
        let ok = handler(|_| async { Ok(()) });
        let (sub, _worker_rx) =
            test_subscription("chat_room:r1", false, SubscribeOptions::default());
        let (ctx, _dlq_rx) = worker_ctx(sub.clone(), ok);

        process_frame(
            &ctx,
            Frame {
                channel: "chat_room:r1".to_string(),
                payload: chat_payload("hello"),
            },
        )
        .await;

        assert_eq!(sub.message_count.load(Ordering::Relaxed), 1);
        assert_eq!(sub.error_count.load(Ordering::Relaxed), 0);
        assert!(sub.last_activity.lock().is_some());
    }

    #[tokio::test]
    async fn test_subscription_registry_lifecycle() {
        let registry = Arc::new(ConnectionRegistry::new(
            redbus_core::config::RuntimeConfig::default(),
        ));
        let subscriber = Subscriber::new(
            Environment::Development,
            registry,
            &PubSubConfig::default(),
        );

        let id = subscriber
            .subscribe("chat_room:r1", handler(|_| async { Ok(()) }), SubscribeOptions::default())
            .unwrap();

        let info = subscriber.get_subscription(&id).unwrap();
        assert_eq!(info.channel, "chat_room:r1");
        assert!(!info.is_pattern);
        assert_eq!(info.message_count, 0);

        let stats = subscriber.stats();
        assert_eq!(stats.subscriptions, 1);

        subscriber.unsubscribe(&id).unwrap();
        assert!(subscriber.get_subscription(&id).is_none());
        assert!(subscriber.unsubscribe(&id).is_err());

        subscriber.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_channel_is_rejected() {
        let registry = Arc::new(ConnectionRegistry::new(
            redbus_core::config::RuntimeConfig::default(),
        ));
        let subscriber = Subscriber::new(
            Environment::Development,
            registry,
            &PubSubConfig::default(),
        );

        let result = subscriber.subscribe(
            "bad channel!",
            handler(|_| async { Ok(()) }),
            SubscribeOptions::default(),
        );
        assert!(result.is_err());
        subscriber.shutdown();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_end_to_end_receive() {
        use redis::AsyncCommands;

        let registry = Arc::new(ConnectionRegistry::new(
            redbus_core::config::RuntimeConfig::default(),
        ));
        let subscriber = Subscriber::new(
            Environment::Development,
            registry.clone(),
            &PubSubConfig::default(),
        );

        let (tx, mut rx) = mpsc::channel(4);
        subscriber
            .subscribe(
                "chat_room:e2e",
                handler(move |envelope| {
                    let tx = tx.clone();
                    async move {
                        tx.send(envelope).await.ok();
                        Ok(())
                    }
                }),
                SubscribeOptions::default(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut conn = registry.get(Environment::Development).await.unwrap();
        let payload = chat_payload("over the wire");
        let _: usize = conn.publish("chat_room:e2e", payload).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message_type(), "chat");
        subscriber.shutdown();
    }
}
