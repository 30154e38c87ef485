//! The distributed-log broker abstraction every other component consumes.
//!
//! This module contains:
//! - `Broker` trait: publish to a named topic, subscribe as a durable
//!   consumer group member
//! - `Subscription` trait: pull-based receive with explicit offset commit
//! - In-memory implementation (`in_memory`) for standalone mode and tests
//!
//! A wire-level backend (AMQP, Kafka, NATS, cloud pub-sub, ...) would
//! implement the same two traits; nothing above this module would change.

pub mod in_memory;

pub use in_memory::InMemoryBroker;

use async_trait::async_trait;

use crate::envelope::BrokerMessage;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error, Clone)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("broker closed")]
    Closed,
}

/// A message delivered from a subscription, paired with a handle that must
/// be used to commit its offset. The offset must not be committed before
/// the consumer has finished whatever downstream produce the delivery
/// requires (DB commit -> ack produce -> offset commit, strictly ordered).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: BrokerMessage,
    offset: u64,
}

impl Delivery {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Pull-based receive side of a topic, scoped to one consumer group.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Receive the next delivery, or `None` if the broker was closed while
    /// waiting. Cancellation-safe: callers select this against a
    /// cancellation signal.
    async fn recv(&mut self) -> Option<Delivery>;

    /// Commit the offset for a delivery previously returned by `recv`. Only
    /// successfully-processed units should be committed; anything left
    /// uncommitted is eligible for redelivery.
    async fn commit(&mut self, delivery: &Delivery) -> Result<()>;
}

/// Interface for publishing to and consuming from named topics.
///
/// Implementations:
/// - `InMemoryBroker`: single-process broker for standalone mode and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message to `topic`. Delivery is at-least-once: a message
    /// may be redelivered after a crash between produce and offset commit.
    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<()>;

    /// Subscribe to `topic` as a member of durable consumer group `group`.
    /// Multiple subscribers in the same group compete for messages
    /// (work-queue semantics, not broadcast) so that partition-key order is
    /// preserved per key but there is no ordering across keys.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>>;
}
