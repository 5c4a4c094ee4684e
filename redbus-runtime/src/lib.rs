//! The redbus messaging runtime: a typed, reliable pub/sub layer over
//! Redis with environment-aware connections, a bounded connection pool,
//! a validating publisher, a pattern-aware subscriber with dead-letter
//! routing, and typed domain services for admin control, chat, process
//! heartbeats, and system events.

pub mod channel_manager;
pub mod connection;
pub mod health;
pub mod pool;
pub mod publisher;
pub mod runtime;
pub mod service;
pub mod subscriber;

pub use channel_manager::{ChannelEvent, ChannelStatsRegistry};
pub use connection::{ConnectionHealth, ConnectionRegistry};
pub use health::{HealthStatus, RedisHealth};
pub use pool::{ConnectionPool, PooledConnection, PoolStats};
pub use publisher::{ConfirmedPublish, PublishOptions, PublishResult, Publisher};
pub use runtime::MessagingRuntime;
pub use service::{AdminService, ChatService, EventsService, HeartbeatService, ServiceStatus};
pub use subscriber::{
    handler, HandlerFn, SubscribeOptions, Subscriber, SubscriptionId, SubscriptionInfo,
    SubscriptionState,
};
