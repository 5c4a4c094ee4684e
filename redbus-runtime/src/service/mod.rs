//! Typed domain services layered over the publisher and subscriber.

pub mod admin;
pub mod chat;
pub mod events;
pub mod heartbeat;

pub use admin::AdminService;
pub use chat::ChatService;
pub use events::EventsService;
pub use heartbeat::HeartbeatService;

/// Point-in-time view of a domain service.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: &'static str,
    pub listening: bool,
    pub handler_count: usize,
}
