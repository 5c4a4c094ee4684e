//! Administrative control fan-out: operational commands published to
//! every listener, with action-keyed handler dispatch.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use redbus_core::channel::ADMIN_BROADCAST;
use redbus_core::error::Result;
use redbus_core::message::{AdminMessage, MessageBody};

use crate::publisher::{PublishOptions, PublishResult, Publisher};
use crate::service::ServiceStatus;
use crate::subscriber::{handler, HandlerFn, SubscribeOptions, Subscriber, SubscriptionId};

/// Administrative messaging facade.
///
/// Subscription is lazy: the service listens on the broadcast channel
/// only while at least one handler is registered.
pub struct AdminService {
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    /// Identity stamped into outgoing messages as `fromAdmin`.
    identity: String,
    action_handlers: Arc<DashMap<String, HandlerFn>>,
    wildcard: Arc<Mutex<Option<HandlerFn>>>,
    default_handler: Arc<Mutex<Option<HandlerFn>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl AdminService {
    #[must_use]
    pub fn new(publisher: Arc<Publisher>, subscriber: Arc<Subscriber>, identity: String) -> Self {
        Self {
            publisher,
            subscriber,
            identity,
            action_handlers: Arc::new(DashMap::new()),
            wildcard: Arc::new(Mutex::new(None)),
            default_handler: Arc::new(Mutex::new(None)),
            subscription: Mutex::new(None),
        }
    }

    /// Publish an administrative command.
    pub async fn send_message(
        &self,
        action: &str,
        data: Option<Map<String, Value>>,
    ) -> PublishResult {
        let body = MessageBody::Admin(AdminMessage {
            action: action.to_string(),
            from_admin: self.identity.clone(),
            data,
        });
        self.publisher
            .publish(ADMIN_BROADCAST, body, &PublishOptions::default())
            .await
    }

    /// Server-scoped command, e.g. `restart` or `drain`.
    pub async fn send_server_control(&self, action: &str) -> PublishResult {
        let mut data = Map::new();
        data.insert("target".to_string(), Value::String("server".to_string()));
        self.send_message(action, Some(data)).await
    }

    /// Room-scoped command.
    pub async fn send_room_management(&self, action: &str, room_id: &str) -> PublishResult {
        let mut data = Map::new();
        data.insert("target".to_string(), Value::String("room".to_string()));
        data.insert("roomId".to_string(), Value::String(room_id.to_string()));
        self.send_message(action, Some(data)).await
    }

    /// User-scoped command.
    pub async fn send_user_management(&self, action: &str, user_id: &str) -> PublishResult {
        let mut data = Map::new();
        data.insert("target".to_string(), Value::String("user".to_string()));
        data.insert("userId".to_string(), Value::String(user_id.to_string()));
        self.send_message(action, Some(data)).await
    }

    /// Register a handler for one exact action. Starts listening if this
    /// is the first handler.
    pub fn on_message(&self, action: &str, action_handler: HandlerFn) -> Result<()> {
        self.action_handlers
            .insert(action.to_string(), action_handler);
        self.ensure_listening()
    }

    /// Register a wildcard handler invoked for every admin message.
    pub fn on_any_message(&self, wildcard_handler: HandlerFn) -> Result<()> {
        *self.wildcard.lock() = Some(wildcard_handler);
        self.ensure_listening()
    }

    /// Fallback handler for actions without an exact handler.
    pub fn set_default_handler(&self, fallback: HandlerFn) {
        *self.default_handler.lock() = Some(fallback);
    }

    /// Remove the handler for an action. Stops listening when the last
    /// handler (exact or wildcard) is gone.
    pub fn remove_handler(&self, action: &str) {
        self.action_handlers.remove(action);
        self.stop_if_idle();
    }

    /// Remove the wildcard handler.
    pub fn remove_wildcard(&self) {
        *self.wildcard.lock() = None;
        self.stop_if_idle();
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        let wildcard_count = usize::from(self.wildcard.lock().is_some());
        ServiceStatus {
            name: "admin",
            listening: self.subscription.lock().is_some(),
            handler_count: self.action_handlers.len() + wildcard_count,
        }
    }

    /// Drop handlers and the subscription.
    pub fn destroy(&self) {
        self.action_handlers.clear();
        *self.wildcard.lock() = None;
        *self.default_handler.lock() = None;
        let sub = self.subscription.lock().take();
        if let Some(id) = sub {
            if let Err(e) = self.subscriber.unsubscribe(&id) {
                warn!(error = %e, "Failed to drop admin subscription");
            }
        }
    }

    fn ensure_listening(&self) -> Result<()> {
        let mut guard = self.subscription.lock();
        if guard.is_some() {
            return Ok(());
        }

        let action_handlers = self.action_handlers.clone();
        let wildcard = self.wildcard.clone();
        let default_handler = self.default_handler.clone();

        let dispatch = handler(move |envelope| {
            let action_handlers = action_handlers.clone();
            let wildcard = wildcard.clone();
            let default_handler = default_handler.clone();
            async move {
                dispatch_admin(&action_handlers, &wildcard, &default_handler, envelope).await
            }
        });

        let id = self.subscriber.subscribe(
            ADMIN_BROADCAST,
            dispatch,
            SubscribeOptions::default(),
        )?;
        *guard = Some(id);
        Ok(())
    }

    fn stop_if_idle(&self) {
        if !self.action_handlers.is_empty() || self.wildcard.lock().is_some() {
            return;
        }
        let sub = self.subscription.lock().take();
        if let Some(id) = sub {
            if let Err(e) = self.subscriber.unsubscribe(&id) {
                warn!(error = %e, "Failed to stop admin listener");
            }
        }
    }
}

/// Exact handler first, then wildcard, then the fallback when no exact
/// handler claimed the action. Each runs at most once per message.
async fn dispatch_admin(
    action_handlers: &DashMap<String, HandlerFn>,
    wildcard: &Mutex<Option<HandlerFn>>,
    default_handler: &Mutex<Option<HandlerFn>>,
    envelope: redbus_core::message::Envelope,
) -> anyhow::Result<()> {
    let MessageBody::Admin(admin) = &envelope.body else {
        debug!("Ignoring non-admin message on admin channel");
        return Ok(());
    };

    let exact = action_handlers.get(&admin.action).map(|h| h.clone());
    let matched_exact = exact.is_some();
    if let Some(h) = exact {
        h(envelope.clone()).await?;
    }
    let any = wildcard.lock().clone();
    if let Some(h) = any {
        h(envelope.clone()).await?;
    }
    if !matched_exact {
        let fallback = default_handler.lock().clone();
        if let Some(h) = fallback {
            h(envelope).await?;
        }
    }
    Ok(())
}
