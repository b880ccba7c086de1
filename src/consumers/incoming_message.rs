use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions},
    BasicProperties,
};
use std::sync::Arc;

/// Settles a delivery with the broker.
///
/// A delivery must be settled exactly once: [`Consumer`](super::Consumer) takes care of it,
/// handlers never get to see the acknowledger.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), anyhow::Error>;

    /// Negative acknowledgement. With `requeue` unset the broker dead-letters the message.
    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn nack(&self, requeue: bool) -> Result<(), anyhow::Error> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map(|_| ())
        .map_err(Into::into)
    }
}

/// A message pushed by the broker on one of our subscriptions.
pub struct Delivery {
    pub delivery_tag: DeliveryTag,

    /// The routing key of the message, i.e. the queue it was originally published to.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,

    // Private on purpose: a delivery is settled by the consumer, once.
    pub(crate) acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Build a delivery settled through `acker`, for transports other than `lapin`.
    pub fn new(
        delivery_tag: DeliveryTag,
        routing_key: impl Into<ShortString>,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            redelivered: false,
            properties,
            data,
            acker,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
            acker: Arc::new(value.acker),
        }
    }
}
