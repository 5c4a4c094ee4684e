//! In-memory registry of per-channel activity statistics.
//!
//! Counters are monotonic; `last_activity` advances on every recorded
//! event. Stats for channels idle past a horizon are cleared by
//! [`ChannelStatsRegistry::cleanup`] or the optional background task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default horizon for [`ChannelStatsRegistry::active_channels`]
pub const DEFAULT_ACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Default horizon for [`ChannelStatsRegistry::cleanup`]
pub const DEFAULT_CLEANUP_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

/// Events a channel can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    MessageSent,
    MessageReceived,
    SubscriberAdded,
    SubscriberRemoved,
    Error,
}

/// Monotonic counters for one channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub subscribers: u64,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Metric to rank channels by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMetric {
    MessagesSent,
    MessagesReceived,
    Subscribers,
    Errors,
}

/// Rollup across all tracked channels.
#[derive(Debug, Clone)]
pub struct ChannelHealthSummary {
    pub total_channels: usize,
    pub active_channels: usize,
    pub total_messages: u64,
    pub total_errors: u64,
    /// Errors per message across all channels.
    pub error_rate: f64,
}

/// Concurrent registry of [`ChannelStats`].
#[derive(Clone, Default)]
pub struct ChannelStatsRegistry {
    stats: Arc<DashMap<String, ChannelStats>>,
}

impl ChannelStatsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event against a channel.
    pub fn record(&self, channel: &str, event: ChannelEvent) {
        let mut entry = self.stats.entry(channel.to_string()).or_default();
        match event {
            ChannelEvent::MessageSent => entry.messages_sent += 1,
            ChannelEvent::MessageReceived => entry.messages_received += 1,
            ChannelEvent::SubscriberAdded => entry.subscribers += 1,
            ChannelEvent::SubscriberRemoved => entry.subscribers = entry.subscribers.saturating_sub(1),
            ChannelEvent::Error => entry.error_count += 1,
        }
        entry.last_activity = Some(Utc::now());
    }

    /// Stats for one channel.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<ChannelStats> {
        self.stats.get(channel).map(|entry| entry.clone())
    }

    /// Stats for every tracked channel.
    #[must_use]
    pub fn all(&self) -> Vec<(String, ChannelStats)> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Channels with activity inside the window.
    #[must_use]
    pub fn active_channels(&self, window: Duration) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        self.stats
            .iter()
            .filter(|entry| entry.last_activity.is_some_and(|at| at > cutoff))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The `limit` highest-ranking channels by `metric`, descending.
    #[must_use]
    pub fn top_channels(&self, metric: ChannelMetric, limit: usize) -> Vec<(String, u64)> {
        let mut ranked: Vec<(String, u64)> = self
            .stats
            .iter()
            .map(|entry| {
                let value = match metric {
                    ChannelMetric::MessagesSent => entry.messages_sent,
                    ChannelMetric::MessagesReceived => entry.messages_received,
                    ChannelMetric::Subscribers => entry.subscribers,
                    ChannelMetric::Errors => entry.error_count,
                };
                (entry.key().clone(), value)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(limit);
        ranked
    }

    /// Aggregate health rollup.
    #[must_use]
    pub fn health_summary(&self) -> ChannelHealthSummary {
        let mut total_messages = 0;
        let mut total_errors = 0;
        for entry in self.stats.iter() {
            total_messages += entry.messages_sent + entry.messages_received;
            total_errors += entry.error_count;
        }
        ChannelHealthSummary {
            total_channels: self.stats.len(),
            active_channels: self.active_channels(DEFAULT_ACTIVE_WINDOW).len(),
            total_messages,
            total_errors,
            error_rate: if total_messages == 0 {
                0.0
            } else {
                total_errors as f64 / total_messages as f64
            },
        }
    }

    /// Drop stats for channels idle longer than `horizon`.
    /// Returns the number of cleared channels.
    pub fn cleanup(&self, horizon: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.stats.len();
        self.stats
            .retain(|_, stats| stats.last_activity.is_some_and(|at| at > cutoff));
        let cleared = before - self.stats.len();
        if cleared > 0 {
            debug!(cleared = cleared, "Cleared idle channel stats");
        }
        cleared
    }

    /// Drop everything.
    pub fn reset(&self) {
        self.stats.clear();
    }

    /// Spawn a periodic cleanup task bound to `cancel_token`.
    pub fn start_cleanup_task(
        &self,
        interval: Duration,
        horizon: Duration,
        cancel_token: CancellationToken,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("Channel stats cleanup task stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        registry.cleanup(horizon);
                    }
                }
            }
        });
    }
}
