//! Typed system events with glob-style pattern dispatch.
//!
//! Patterns: `*` matches everything, `prefix.*` matches event types
//! starting with `prefix.`, `*.suffix` matches those ending with
//! `.suffix`, anything else is an exact match.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::warn;

use redbus_core::channel::{self, SYSTEM_EVENTS};
use redbus_core::error::Result;
use redbus_core::message::{Envelope, EventMessage, MessageBody};

use crate::publisher::{PublishOptions, PublishResult, Publisher};
use crate::service::ServiceStatus;
use crate::subscriber::{handler, HandlerFn, SubscribeOptions, Subscriber, SubscriptionId};

/// Events facade: typed publishers plus pattern-matched handlers.
pub struct EventsService {
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    /// Handlers keyed by the pattern they were registered under.
    handlers: Arc<DashMap<String, Vec<HandlerFn>>>,
    default_handler: Arc<Mutex<Option<HandlerFn>>>,
    /// Optional allow-list; events outside it skip dispatch entirely.
    event_filters: Arc<Mutex<Option<HashSet<String>>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl EventsService {
    #[must_use]
    pub fn new(publisher: Arc<Publisher>, subscriber: Arc<Subscriber>) -> Self {
        Self {
            publisher,
            subscriber,
            handlers: Arc::new(DashMap::new()),
            default_handler: Arc::new(Mutex::new(None)),
            event_filters: Arc::new(Mutex::new(None)),
            subscription: Mutex::new(None),
        }
    }

    /// Publish an event with an explicit type.
    pub async fn publish_event(
        &self,
        event_type: &str,
        data: Option<Value>,
    ) -> PublishResult {
        let body = MessageBody::Event(EventMessage {
            event_type: event_type.to_string(),
            data,
        });
        self.publisher
            .publish(SYSTEM_EVENTS, body, &PublishOptions::default())
            .await
    }

    /// `user.<verb>` event.
    pub async fn publish_user_event(
        &self,
        verb: &str,
        user_id: &str,
        data: Option<Map<String, Value>>,
    ) -> PublishResult {
        let mut payload = data.unwrap_or_default();
        payload.insert("userId".to_string(), Value::String(user_id.to_string()));
        self.publish_event(&format!("user.{verb}"), Some(Value::Object(payload)))
            .await
    }

    /// `room.<verb>` event, mirrored onto the room's event channel.
    pub async fn publish_room_event(
        &self,
        verb: &str,
        room_id: &str,
        data: Option<Map<String, Value>>,
    ) -> PublishResult {
        let mut payload = data.unwrap_or_default();
        payload.insert("roomId".to_string(), Value::String(room_id.to_string()));
        let body = MessageBody::Event(EventMessage {
            event_type: format!("room.{verb}"),
            data: Some(Value::Object(payload)),
        });

        let mirror = self
            .publisher
            .publish(
                &channel::events_room(room_id),
                body.clone(),
                &PublishOptions::default(),
            )
            .await;
        if !mirror.success {
            warn!(room_id = %room_id, error = ?mirror.error, "Room event mirror failed");
        }

        self.publisher
            .publish(SYSTEM_EVENTS, body, &PublishOptions::default())
            .await
    }

    /// `system.<verb>` event.
    pub async fn publish_system_event(
        &self,
        verb: &str,
        data: Option<Map<String, Value>>,
    ) -> PublishResult {
        self.publish_event(
            &format!("system.{verb}"),
            data.map(Value::Object),
        )
        .await
    }

    /// `system.error` event serializing the error and its source chain.
    pub async fn publish_error_event(
        &self,
        error: &(dyn std::error::Error + 'static),
        context: Option<Map<String, Value>>,
    ) -> PublishResult {
        let payload = error_payload(error, context);
        self.publish_event("system.error", Some(Value::Object(payload)))
            .await
    }

    /// Register a handler for an event pattern. Starts listening on the
    /// first registration.
    pub fn on_event(&self, pattern: &str, event_handler: HandlerFn) -> Result<()> {
        self.handlers
            .entry(pattern.to_string())
            .or_default()
            .push(event_handler);
        self.ensure_listening()
    }

    /// Default handler invoked at most once per dispatched event, after
    /// the matching handlers.
    pub fn set_default_handler(&self, fallback: HandlerFn) -> Result<()> {
        *self.default_handler.lock() = Some(fallback);
        self.ensure_listening()
    }

    /// Restrict dispatch to an allow-list of exact event types. `None`
    /// clears the filter.
    pub fn set_event_filters(&self, filters: Option<Vec<String>>) {
        *self.event_filters.lock() = filters.map(|f| f.into_iter().collect());
    }

    /// Drop all handlers for a pattern. Stops listening when no handlers
    /// remain.
    pub fn remove_handlers(&self, pattern: &str) {
        self.handlers.remove(pattern);
        if self.handlers.is_empty() && self.default_handler.lock().is_none() {
            let sub = self.subscription.lock().take();
            if let Some(id) = sub {
                if let Err(e) = self.subscriber.unsubscribe(&id) {
                    warn!(error = %e, "Failed to stop events listener");
                }
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        let handler_count: usize = self.handlers.iter().map(|entry| entry.len()).sum();
        ServiceStatus {
            name: "events",
            listening: self.subscription.lock().is_some(),
            handler_count,
        }
    }

    /// Drop handlers, filters, and the subscription.
    pub fn destroy(&self) {
        self.handlers.clear();
        *self.default_handler.lock() = None;
        *self.event_filters.lock() = None;
        let sub = self.subscription.lock().take();
        if let Some(id) = sub {
            if let Err(e) = self.subscriber.unsubscribe(&id) {
                warn!(error = %e, "Failed to drop events subscription");
            }
        }
    }

    fn ensure_listening(&self) -> Result<()> {
        let mut guard = self.subscription.lock();
        if guard.is_some() {
            return Ok(());
        }

        let handlers = self.handlers.clone();
        let default_handler = self.default_handler.clone();
        let event_filters = self.event_filters.clone();

        let dispatch = handler(move |envelope| {
            let handlers = handlers.clone();
            let default_handler = default_handler.clone();
            let event_filters = event_filters.clone();
            async move {
                dispatch_event(&handlers, &default_handler, &event_filters, envelope).await
            }
        });

        let id = self
            .subscriber
            .subscribe(SYSTEM_EVENTS, dispatch, SubscribeOptions::default())?;
        *guard = Some(id);
        Ok(())
    }
}

/// Serialize an error into the `system.error` payload: name, message,
/// and the source chain as the stack, merged over the caller context.
fn error_payload(
    error: &(dyn std::error::Error + 'static),
    context: Option<Map<String, Value>>,
) -> Map<String, Value> {
    let mut sources = Vec::new();
    let mut current = error.source();
    while let Some(cause) = current {
        sources.push(cause.to_string());
        current = cause.source();
    }

    let mut payload = context.unwrap_or_default();
    payload.insert("name".to_string(), json!("Error"));
    payload.insert("message".to_string(), json!(error.to_string()));
    if !sources.is_empty() {
        payload.insert("stack".to_string(), json!(sources.join("\n")));
    }
    payload
}

/// Whether `pattern` matches `event_type` under the service's rules.
#[must_use]
pub fn matches_pattern(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return event_type
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.'));
    }
    pattern == event_type
}

/// Invoke every matching handler once (deduplicated by identity), then
/// the default handler at most once.
async fn dispatch_event(
    handlers: &DashMap<String, Vec<HandlerFn>>,
    default_handler: &Mutex<Option<HandlerFn>>,
    event_filters: &Mutex<Option<HashSet<String>>>,
    envelope: Envelope,
) -> anyhow::Result<()> {
    let MessageBody::Event(event) = &envelope.body else {
        return Ok(());
    };

    if let Some(filters) = event_filters.lock().as_ref() {
        if !filters.contains(&event.event_type) {
            return Ok(());
        }
    }

    let mut matched: Vec<HandlerFn> = Vec::new();
    for entry in handlers.iter() {
        if !matches_pattern(entry.key(), &event.event_type) {
            continue;
        }
        for h in entry.value() {
            if !matched.iter().any(|seen| Arc::ptr_eq(seen, h)) {
                matched.push(h.clone());
            }
        }
    }

    for h in matched {
        h(envelope.clone()).await?;
    }

    let fallback = default_handler.lock().clone();
    if let Some(h) = fallback {
        h(envelope).await?;
    }
    Ok(())
}
