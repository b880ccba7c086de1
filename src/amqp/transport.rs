//! The seam between this crate and the AMQP client.
//!
//! [`ConnectionSupervisor`](crate::amqp::ConnectionSupervisor), the publisher and the consumer
//! only talk to the broker through these traits.
//! They are implemented for [`ConnectionFactory`], [`lapin::Connection`] and [`lapin::Channel`];
//! tests plug in an in-memory broker instead.
use crate::amqp::ConnectionFactory;
use crate::consumers::Delivery;
use amq_protocol_types::FieldTable;
use anyhow::Context;
use futures_util::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    BasicProperties, ChannelState, ConnectionState,
};

/// Deliveries pushed by the broker for a single subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// Something capable of opening connections to the broker.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a brand new connection.
    ///
    /// Implementations must bound the time spent connecting.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// An open connection to the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    fn is_open(&self) -> bool;

    /// Open a channel with publisher confirms enabled.
    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// The subset of channel operations the delivery subsystem relies on.
///
/// All publishing goes through the default exchange: `routing_key` is the target queue name.
#[async_trait::async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Declare a queue. With `options.passive` set this is an existence check: it fails
    /// (and, on a real broker, closes the channel) if the queue does not exist.
    async fn queue_declare(
        &self,
        queue_name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    /// Publish `payload` and wait for the broker's confirmation.
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Confirmation, anyhow::Error>;

    /// Start a subscription on `queue_name` with the given prefetch window.
    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, anyhow::Error>;

    /// Stop the subscription identified by `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl TransportFactory for ConnectionFactory {
    type Connection = lapin::Connection;

    async fn connect(&self) -> Result<Self::Connection, anyhow::Error> {
        self.new_connection().await
    }
}

#[async_trait::async_trait]
impl BrokerConnection for lapin::Connection {
    type Channel = lapin::Channel;

    fn is_open(&self) -> bool {
        matches!(self.status().state(), ConnectionState::Connected)
    }

    async fn create_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        let channel = lapin::Connection::create_channel(self).await?;
        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        Ok(channel)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        lapin::Connection::close(self, 200, "Shutting down")
            .await
            .map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl BrokerChannel for lapin::Channel {
    fn is_open(&self) -> bool {
        matches!(self.status().state(), ChannelState::Connected)
    }

    async fn queue_declare(
        &self,
        queue_name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::queue_declare(self, queue_name, options, arguments).await?;
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Confirmation, anyhow::Error> {
        let options = BasicPublishOptions {
            // Unroutable messages come back as a return instead of being silently dropped.
            mandatory: true,
            // The immediate flag was dropped in RabbitMQ 3.0, setting it causes a not-supported error.
            immediate: false,
        };
        let confirmation = self
            .basic_publish("", routing_key, options, payload, properties)
            .await?
            .await?;
        Ok(confirmation)
    }

    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<DeliveryStream, anyhow::Error> {
        self.basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .context("Failed to set the prefetch window")?;
        let consumer = self
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(Into::into)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        lapin::Channel::close(self, 200, "Shutting down")
            .await
            .map_err(Into::into)
    }
}
