//! In-process relay queue
//!
//! Same contract as the AMQP queue: every delivery is settled once, and a
//! requeued message goes back to the tail. Settlements are recorded so tests
//! can assert on ack/reject behaviour.

use async_trait::async_trait;
use eyre::{eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{encode_intent, Delivery, IntentConsumer, IntentPublisher};
use crate::types::BridgeIntent;

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject,
    Requeue,
}

#[derive(Debug, Clone)]
pub struct SettledMessage {
    pub payload: Vec<u8>,
    pub settlement: Settlement,
}

type SettlementLog = Arc<Mutex<Vec<SettledMessage>>>;

/// Publisher half of an in-memory queue
#[derive(Clone)]
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    settled: SettlementLog,
}

impl MemoryQueue {
    /// Create a queue and its single consumer
    pub fn new() -> (Self, MemoryConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settled: SettlementLog = Arc::default();
        let queue = Self {
            tx: tx.clone(),
            settled: settled.clone(),
        };
        let consumer = MemoryConsumer {
            rx,
            requeue_tx: tx,
            settled,
        };
        (queue, consumer)
    }

    /// Push an arbitrary payload, e.g. a malformed message
    pub fn publish_raw(&self, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| eyre!("memory queue consumer dropped"))
    }

    /// Every settlement so far, in order
    pub fn settlements(&self) -> Vec<SettledMessage> {
        self.settled
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IntentPublisher for MemoryQueue {
    async fn publish(&self, intent: &BridgeIntent) -> Result<()> {
        self.publish_raw(encode_intent(intent)?)
    }
}

/// Consumer half of an in-memory queue
pub struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    requeue_tx: mpsc::UnboundedSender<Vec<u8>>,
    settled: SettlementLog,
}

impl MemoryConsumer {
    /// Next delivery if one is already queued, without waiting
    pub fn try_next(&mut self) -> Option<Box<dyn Delivery>> {
        let payload = self.rx.try_recv().ok()?;
        Some(self.wrap(payload))
    }

    fn wrap(&self, payload: Vec<u8>) -> Box<dyn Delivery> {
        Box::new(MemoryDelivery {
            payload,
            requeue_tx: self.requeue_tx.clone(),
            settled: self.settled.clone(),
        })
    }
}

#[async_trait]
impl IntentConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>>> {
        let payload = self.rx.recv().await?;
        Some(Ok(self.wrap(payload)))
    }
}

struct MemoryDelivery {
    payload: Vec<u8>,
    requeue_tx: mpsc::UnboundedSender<Vec<u8>>,
    settled: SettlementLog,
}

impl MemoryDelivery {
    fn record(&self, settlement: Settlement) -> Result<()> {
        let mut log = self
            .settled
            .lock()
            .map_err(|_| eyre!("settlement log poisoned"))?;
        log.push(SettledMessage {
            payload: self.payload.clone(),
            settlement,
        });
        Ok(())
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.record(Settlement::Ack)
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        if requeue {
            self.record(Settlement::Requeue)?;
            self.requeue_tx
                .send(self.payload.clone())
                .map_err(|_| eyre!("memory queue closed"))
        } else {
            self.record(Settlement::Reject)
        }
    }
}
