use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use shutdown_handler::ShutdownHandler;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::amqp::convenience::BasicPropertiesExt;
use crate::amqp::transport::{BrokerChannel, DeliveryStream, TransportFactory};
use crate::amqp::{ConnectionError, ConnectionFactory, ConnectionSupervisor};
use crate::consumers::{Delivery, Handler};
use crate::envelope::Envelope;

/// Subscribes handlers to queues and settles every delivery with the broker.
///
/// For each delivery:
/// - the payload is deserialized into an [`Envelope`]; if that fails the message is nacked
///   without requeueing and the handler is not called;
/// - the handler is called; `Ok` acks the message, `Err` (or a panic) nacks it without
///   requeueing.
///
/// Nacked messages are dead-lettered by the broker into the delay queue and come back to the
/// main queue once its TTL expires. The terminal queue is the exception: it dead-letters
/// nowhere, so nacked messages are discarded.
pub struct Consumer<F: TransportFactory = ConnectionFactory> {
    supervisor: Arc<ConnectionSupervisor<F>>,
    default_queue: String,
    prefetch_count: u16,
    shutdown: Option<Arc<ShutdownHandler>>,
}

/// Error returned when a subscription cannot be set up.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("Could not get a healthy channel to the RabbitMq broker")]
    Connection(#[from] ConnectionError),
    #[error("Failed to subscribe to `{queue}`")]
    Subscribe {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A live subscription, consuming in a background task.
///
/// Dropping a `Subscription` does not stop it: call [`Subscription::cancel`].
pub struct Subscription {
    queue_name: String,
    consumer_tag: String,
    shutdown: Arc<ShutdownHandler>,
    task: JoinHandle<Result<(), anyhow::Error>>,
}

enum BrokerAction {
    Ack,
    Nack,
}

impl<F: TransportFactory> Consumer<F> {
    pub fn new(supervisor: Arc<ConnectionSupervisor<F>>) -> Self {
        let settings = supervisor.queue_settings();
        Self {
            default_queue: settings.default_queue.clone(),
            prefetch_count: settings.prefetch_count,
            supervisor,
            shutdown: None,
        }
    }

    /// The queue whose terminal queue [`Consumer::consume_final_queue`] subscribes to.
    #[must_use]
    pub fn with_default_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.default_queue = queue_name.into();
        self
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Stop every subscription of this consumer when `shutdown` fires, e.g. on SIGTERM via
    /// [`ShutdownHandler::sigterm`].
    ///
    /// By default each subscription gets its own handler, triggered by
    /// [`Subscription::cancel`]. With a shared handler, cancelling one subscription cancels
    /// all of them.
    #[must_use]
    pub fn with_shutdown_handler(mut self, shutdown: Arc<ShutdownHandler>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Subscribe `handler` to `queue_name`, declaring its topology first if needed.
    ///
    /// Returns as soon as the broker has registered the subscription; deliveries are then
    /// processed in a background task.
    pub async fn consume<T, H>(
        &self,
        queue_name: &str,
        handler: H,
    ) -> Result<Subscription, ConsumerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        self.subscribe::<T, H>(queue_name, queue_name, handler).await
    }

    /// Subscribe `handler` to the terminal dead-letter queue of the default queue.
    ///
    /// Deliveries are settled as in [`Consumer::consume`], but the terminal queue has no
    /// dead-letter target: a message whose handler returns `Err` or panics is dropped by the
    /// broker for good. Terminal handlers should only fail if losing the message is acceptable.
    pub async fn consume_final_queue<T, H>(&self, handler: H) -> Result<Subscription, ConsumerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        let topology = self.supervisor.topology(&self.default_queue);
        self.subscribe::<T, H>(topology.main_queue(), topology.final_queue(), handler)
            .await
    }

    #[tracing::instrument(name = "consumer_subscribe", skip(self, handler))]
    async fn subscribe<T, H>(
        &self,
        topology_queue: &str,
        queue_name: &str,
        handler: H,
    ) -> Result<Subscription, ConsumerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        let channel = self
            .supervisor
            .open_subscription_channel(topology_queue)
            .await?;
        let consumer_tag = format!("{queue_name}-{}", Uuid::new_v4());
        let deliveries = channel
            .consume(queue_name, &consumer_tag, self.prefetch_count)
            .await
            .map_err(|source| ConsumerError::Subscribe {
                queue: queue_name.to_owned(),
                source,
            })?;
        tracing::info!(consumer_tag = %consumer_tag, "Subscribed");

        let shutdown = self
            .shutdown
            .clone()
            .unwrap_or_else(|| Arc::new(ShutdownHandler::new()));
        let task = tokio::spawn(run_until_shutdown::<_, T, H>(
            channel,
            deliveries,
            handler,
            queue_name.to_owned(),
            consumer_tag.clone(),
            shutdown.clone(),
        ));

        Ok(Subscription {
            queue_name: queue_name.to_owned(),
            consumer_tag,
            shutdown,
            task,
        })
    }
}

impl Subscription {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Ask the broker to stop pushing messages and wait for the in-flight delivery to settle.
    pub async fn cancel(self) -> Result<(), anyhow::Error> {
        self.shutdown.shutdown();
        self.closed().await
    }

    /// Wait until the subscription ends: cancelled, or closed by the broker.
    ///
    /// Fails if the delivery stream broke (e.g. the connection was lost).
    pub async fn closed(self) -> Result<(), anyhow::Error> {
        self.task
            .await
            .context("The subscription task panicked or was aborted")?
    }
}

/// Pull deliveries until the stream ends or `shutdown` fires.
#[tracing::instrument(name = "consumer_run", skip_all, fields(queue_name = %queue_name))]
async fn run_until_shutdown<C, T, H>(
    channel: C,
    mut deliveries: DeliveryStream,
    handler: H,
    queue_name: String,
    consumer_tag: String,
    shutdown: Arc<ShutdownHandler>,
) -> Result<(), anyhow::Error>
where
    C: BrokerChannel,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let signal = shutdown.wait_for_signal();
    tokio::pin!(signal);

    let outcome = loop {
        tokio::select! {
            // Prefer shutting down over picking up more work.
            biased;

            _ = &mut signal => {
                tracing::info!("Subscription received shutdown event");
                if let Err(e) = channel.cancel(&consumer_tag).await {
                    tracing::warn!(error = ?e, "Failed to cancel the subscription with the broker");
                }
                break Ok(());
            }

            event = deliveries.next() => match event {
                None => {
                    tracing::info!("Subscription closed by the broker");
                    break Ok(());
                }
                Some(Err(e)) => {
                    tracing::error!(error = ?e, "Subscription failed");
                    break Err(e);
                }
                // Handled inline: deliveries of one subscription are processed one at a time.
                Some(Ok(delivery)) => {
                    process_delivery::<T, H>(&handler, &queue_name, delivery).await
                }
            }
        }
    };

    if channel.is_open() {
        if let Err(e) = channel.close().await {
            tracing::warn!(error = ?e, "Failed to close the subscription channel");
        }
    }
    outcome
}

/// Deserialize, handle, then ack or nack a single delivery.
#[tracing::instrument(
    name = "process_message",
    skip_all,
    fields(
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        retry_cycles = delivery.properties.death_count(queue_name),
    ),
    level = "debug"
)]
async fn process_delivery<T, H>(handler: &H, queue_name: &str, delivery: Delivery)
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let action = match serde_json::from_slice::<Envelope<T>>(&delivery.data) {
        Err(e) => {
            tracing::error!(error = %e, "Failed to deserialize the envelope, dead-lettering the message");
            BrokerAction::Nack
        }
        Ok(envelope) => {
            let message_id = envelope.id();
            match AssertUnwindSafe(handler.handle(envelope))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => BrokerAction::Ack,
                Ok(Err(e)) => {
                    tracing::warn!(%message_id, error = %e, "Handler failed, dead-lettering the message");
                    BrokerAction::Nack
                }
                Err(_) => {
                    tracing::error!(%message_id, "Handler panicked, dead-lettering the message");
                    BrokerAction::Nack
                }
            }
        }
    };

    let settled = match action {
        BrokerAction::Ack => delivery.acker.ack().await,
        BrokerAction::Nack => delivery.acker.nack(false).await,
    };
    if let Err(e) = settled {
        tracing::error!(error = ?e, "Failed to settle the delivery with the broker");
    }
}
