//! Relay queue between watchers and the swap executor
//!
//! Watchers publish one JSON-encoded [`BridgeIntent`] per message. The
//! executor pulls one delivery at a time and settles it only after the
//! intent is persisted and broadcast, so a crash mid-flight redelivers the
//! message and the ledger's idempotency check absorbs the duplicate.

use async_trait::async_trait;
use eyre::Result;

use crate::types::BridgeIntent;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpQueue;
pub use memory::MemoryQueue;

/// Durable queue every intent travels through
pub const QUEUE_NAME: &str = "txQueue";

/// Publishing side, held by the watchers
#[async_trait]
pub trait IntentPublisher: Send + Sync {
    /// Publish a persistent message and wait for the broker's confirm
    async fn publish(&self, intent: &BridgeIntent) -> Result<()>;
}

/// A single message taken from the queue. Must be settled exactly once.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    /// Remove the message from the queue
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Give the message back. `requeue = false` drops it for good.
    async fn reject(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// Consuming side, held by the executor
#[async_trait]
pub trait IntentConsumer: Send {
    /// Wait for the next delivery. `None` means the queue was closed.
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>>>;
}

/// Serialize an intent into a queue payload
pub fn encode_intent(intent: &BridgeIntent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(intent)?)
}

/// Parse a queue payload
pub fn decode_intent(payload: &[u8]) -> Result<BridgeIntent> {
    Ok(serde_json::from_slice(payload)?)
}
