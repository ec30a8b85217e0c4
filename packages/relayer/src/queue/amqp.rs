//! AMQP 0-9-1 relay queue (RabbitMQ)

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{encode_intent, Delivery, IntentConsumer, IntentPublisher, QUEUE_NAME};
use crate::retry::{with_retry, RetryPolicy};
use crate::types::BridgeIntent;

/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connection and channel with `txQueue` declared and confirms enabled
struct Link {
    _connection: Connection,
    channel: Channel,
}

impl Link {
    async fn open(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .wrap_err("Failed to connect to AMQP broker")?;

        let channel = connection
            .create_channel()
            .await
            .wrap_err("Failed to open AMQP channel")?;

        channel
            .queue_declare(
                QUEUE_NAME,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .wrap_err_with(|| format!("Failed to declare queue {}", QUEUE_NAME))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .wrap_err("Failed to enable publisher confirms")?;

        info!(queue = QUEUE_NAME, "Connected to AMQP broker");

        Ok(Self {
            _connection: connection,
            channel,
        })
    }
}

/// Relay queue on a RabbitMQ broker.
///
/// A channel lost to a broker restart is reopened on the next use, under the
/// same retry policy as the initial connect.
pub struct AmqpQueue {
    url: String,
    policy: RetryPolicy,
    link: Mutex<Link>,
}

impl AmqpQueue {
    /// Connect with a fixed-delay retry budget
    pub async fn connect_with_retry(url: &str, policy: RetryPolicy) -> Result<Self> {
        let link = with_retry(policy, "AMQP connect", |_| Link::open(url)).await?;
        Ok(Self {
            url: url.to_string(),
            policy,
            link: Mutex::new(link),
        })
    }

    /// The open channel, reconnecting first if the broker dropped it
    async fn channel(&self) -> Result<Channel> {
        let mut link = self.link.lock().await;
        if !link.channel.status().connected() {
            warn!(queue = QUEUE_NAME, "AMQP channel closed, reconnecting");
            *link = with_retry(self.policy, "AMQP reconnect", |_| Link::open(&self.url)).await?;
        }
        Ok(link.channel.clone())
    }

    /// Start consuming with prefetch 1 and explicit acks
    pub async fn consumer(&self, tag: &str) -> Result<AmqpConsumer> {
        let channel = self.channel().await?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .wrap_err("Failed to set prefetch")?;

        let consumer = channel
            .basic_consume(
                QUEUE_NAME,
                tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .wrap_err("Failed to start consumer")?;

        info!(queue = QUEUE_NAME, consumer_tag = tag, "Consuming relay queue");
        Ok(AmqpConsumer { consumer })
    }

    /// Publish raw bytes as a persistent message and wait for the confirm
    pub async fn publish_payload(&self, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_content_type("application/json".into());

        let channel = self.channel().await?;
        let confirmation = channel
            .basic_publish(
                "",
                QUEUE_NAME,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .wrap_err("Failed to publish message")?
            .await
            .wrap_err("Failed to receive publisher confirm")?;

        if confirmation.is_nack() {
            return Err(eyre!("Broker refused message"));
        }
        Ok(())
    }
}

#[async_trait]
impl IntentPublisher for AmqpQueue {
    async fn publish(&self, intent: &BridgeIntent) -> Result<()> {
        let payload = encode_intent(intent)?;
        self.publish_payload(&payload).await?;
        debug!(tx_hash = %intent.from_tx_hash, "Intent published");
        Ok(())
    }
}

/// Executor-side consumer
pub struct AmqpConsumer {
    consumer: Consumer,
}

#[async_trait]
impl IntentConsumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| Box::new(AmqpDelivery { delivery }) as Box<dyn Delivery>)
                .wrap_err("Failed to receive delivery"),
        )
    }
}

struct AmqpDelivery {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .wrap_err("Failed to ack delivery")
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        self.delivery
            .acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .wrap_err("Failed to nack delivery")
    }
}
