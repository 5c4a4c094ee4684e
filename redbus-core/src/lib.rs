//! Building blocks for the redbus messaging runtime: configuration,
//! error taxonomy, channel naming, the message model, serialization,
//! validation, resilience primitives, and metrics.

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod resilience;
pub mod serializer;
pub mod validation;

pub use config::{Environment, RuntimeConfig};
pub use error::{Error, Result};
pub use message::{DeadLetter, Envelope, MessageBody};
pub use serializer::Serializer;
pub use validation::MessageValidator;
