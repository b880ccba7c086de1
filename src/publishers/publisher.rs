use std::sync::Arc;
use std::time::Duration;

use lapin::publisher_confirm::Confirmation;
use lapin::BasicProperties;
use serde::Serialize;
use uuid::Uuid;

use crate::amqp::configuration::BackoffSettings;
use crate::amqp::transport::{BrokerChannel, TransportFactory};
use crate::amqp::{ConnectionError, ConnectionFactory, ConnectionSupervisor};
use crate::backoff::{AttemptFailure, Backoff, BackoffError, BackoffObserver};
use crate::envelope::Envelope;

/// Delivers [`Envelope`]s to the broker.
///
/// Every publish goes through the shared [`ConnectionSupervisor`]: the connection is opened
/// (or repaired) on demand and the queue topology is checked before writing.
/// Messages are persistent JSON, published on the default exchange with the target queue name
/// as routing key, and confirmed by the broker.
///
/// # Publishing modes
///
/// - [`Publisher::publish`]: one attempt, to any queue.
/// - [`Publisher::publish_with_backoff`]: retries with exponential delay on the default queue.
///   Giving up does *not* escalate the envelope: call
///   [`Publisher::escalate_to_final_queue`] yourself if that is what you want.
/// - [`Publisher::escalate_to_final_queue`]: marks the envelope as a final failure and parks it
///   in the terminal dead-letter queue.
/// - [`Publisher::publish_to_retry_queue`]: forces a delayed retry through the delay queue.
///
/// # How do I build a `Publisher`?
///
/// Start from [`Publisher::builder`].
pub struct Publisher<F: TransportFactory = ConnectionFactory> {
    supervisor: Arc<ConnectionSupervisor<F>>,
    default_queue: String,
    backoff: Backoff,
    timeout: Duration,
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Could not get a healthy channel to the RabbitMq broker")]
    Connection(#[from] ConnectionError),
    #[error("Failed to serialize the message envelope")]
    Serialization(#[source] serde_json::Error),
    #[error("Generic error encountered when publishing to the RabbitMq broker")]
    Publish(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    Timeout,
    #[error("The message could not be routed to `{routing_key}`")]
    Unroutable { routing_key: String },
    #[error("The RabbitMq broker nacked the publishing of the message")]
    NegativeAck,
    #[error("Envelope {0} has been escalated to the terminal queue and cannot be published again")]
    FinalEnvelope(Uuid),
    #[error("Publishing failed, retries exhausted")]
    BackoffExhausted(#[source] Box<BackoffError<PublisherError>>),
}

impl<F: TransportFactory> Publisher<F> {
    /// Start building a [`Publisher`] on top of a shared supervisor.
    ///
    /// # Example
    ///
    /// ```rust
    /// use notify_relay::amqp::configuration::MessagingSettings;
    /// use notify_relay::amqp::{ConnectionFactory, ConnectionSupervisor};
    /// use notify_relay::publishers::Publisher;
    /// use std::sync::Arc;
    ///
    /// fn get_publisher(settings: &MessagingSettings) -> anyhow::Result<Publisher> {
    ///     let factory = ConnectionFactory::new_from_config(&settings.rabbitmq)?;
    ///     let supervisor = Arc::new(ConnectionSupervisor::new(factory, settings.queues.clone()));
    ///     Ok(Publisher::builder(supervisor)
    ///         .backoff_settings(&settings.backoff)
    ///         .publish_timeout(std::time::Duration::from_secs(3))
    ///         .build())
    /// }
    /// ```
    pub fn builder(supervisor: Arc<ConnectionSupervisor<F>>) -> PublisherBuilder<F> {
        PublisherBuilder::new(supervisor)
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Publish `envelope` to `queue_name` with a single attempt.
    #[tracing::instrument(skip_all, fields(queue_name = %queue_name, message_id = %envelope.id()))]
    pub async fn publish<T: Serialize>(
        &self,
        queue_name: &str,
        envelope: &mut Envelope<T>,
    ) -> Result<(), PublisherError> {
        let properties = stamp_for_publishing(envelope)?;
        let payload = serialize(envelope)?;
        self.publish_payload(queue_name, queue_name, &payload, properties)
            .await
    }

    /// Publish `envelope` to the default queue, retrying with exponential backoff.
    ///
    /// Each attempt serializes the envelope and repairs the connection first if needed. Once
    /// the budget is spent, the last failure comes back wrapped in
    /// [`PublisherError::BackoffExhausted`], whatever it was.
    #[tracing::instrument(skip_all, fields(queue_name = %self.default_queue, message_id = %envelope.id()))]
    pub async fn publish_with_backoff<T: Serialize>(
        &self,
        envelope: &mut Envelope<T>,
    ) -> Result<(), PublisherError> {
        let properties = stamp_for_publishing(envelope)?;
        let envelope = &*envelope;
        let queue_name = self.default_queue.as_str();
        let observer = LogAttempts {
            queue_name,
            message_id: envelope.id(),
        };
        self.backoff
            .execute(
                envelope,
                |envelope| {
                    let properties = properties.clone();
                    async move {
                        let payload = serialize(envelope)?;
                        self.publish_payload(queue_name, queue_name, &payload, properties)
                            .await
                            .map(|()| true)
                    }
                },
                &observer,
            )
            .await
            .map_err(|e| PublisherError::BackoffExhausted(Box::new(e)))
    }

    /// Mark `envelope` as permanently failed and publish it, once, to the terminal queue of the
    /// default queue.
    ///
    /// This is the only way `final_failure` ever becomes `true`.
    #[tracing::instrument(skip_all, fields(queue_name = %self.default_queue, message_id = %envelope.id()))]
    pub async fn escalate_to_final_queue<T: Serialize>(
        &self,
        envelope: &mut Envelope<T>,
    ) -> Result<(), PublisherError> {
        envelope.mark_final_failure();
        envelope.stamp_created_at();
        let payload = serialize(envelope)?;
        let topology = self.supervisor.topology(&self.default_queue);
        self.publish_payload(
            topology.main_queue(),
            topology.final_queue(),
            &payload,
            properties_for(envelope),
        )
        .await?;
        tracing::warn!(
            final_queue = topology.final_queue(),
            "Message escalated to the terminal dead-letter queue"
        );
        Ok(())
    }

    /// Send `envelope` through the delay queue of the default queue: it reaches the main queue
    /// again once the delay queue TTL expires.
    #[tracing::instrument(skip_all, fields(queue_name = %self.default_queue, message_id = %envelope.id()))]
    pub async fn publish_to_retry_queue<T: Serialize>(
        &self,
        envelope: &mut Envelope<T>,
    ) -> Result<(), PublisherError> {
        let properties = stamp_for_publishing(envelope)?;
        let payload = serialize(envelope)?;
        let topology = self.supervisor.topology(&self.default_queue);
        self.publish_payload(
            topology.main_queue(),
            topology.retry_queue(),
            &payload,
            properties,
        )
        .await
    }

    /// Write `payload` to `routing_key` once the topology of `topology_queue` is in place.
    async fn publish_payload(
        &self,
        topology_queue: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), PublisherError> {
        let _permit = self.supervisor.publish_permit().await;
        let channel = self.supervisor.shared_channel(topology_queue).await?;

        let publish = channel.publish(routing_key, payload, properties);
        let confirmation = match tokio::time::timeout(self.timeout, publish).await {
            Ok(result) => result.map_err(PublisherError::Publish)?,
            Err(_) => return Err(PublisherError::Timeout),
        };

        match confirmation {
            Confirmation::Ack(Some(returned)) if returned.reply_code == NO_ROUTE => {
                Err(PublisherError::Unroutable {
                    routing_key: routing_key.to_owned(),
                })
            }
            Confirmation::Ack(_) | Confirmation::NotRequested => {
                tracing::debug!(routing_key, "Message published");
                Ok(())
            }
            Confirmation::Nack(_) => Err(PublisherError::NegativeAck),
        }
    }
}

// Reply Code 312 - NO_ROUTE
// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;

/// Validate and stamp an envelope headed for the main or the delay queue.
fn stamp_for_publishing<T>(envelope: &mut Envelope<T>) -> Result<BasicProperties, PublisherError> {
    if envelope.is_final_failure() {
        return Err(PublisherError::FinalEnvelope(envelope.id()));
    }
    envelope.stamp_created_at();
    Ok(properties_for(envelope))
}

fn serialize<T: Serialize>(envelope: &Envelope<T>) -> Result<Vec<u8>, PublisherError> {
    serde_json::to_vec(envelope).map_err(PublisherError::Serialization)
}

fn properties_for<T>(envelope: &Envelope<T>) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        // Delivery mode: Non-persistent (1) or persistent (2).
        .with_delivery_mode(2)
        .with_message_id(envelope.id().to_string().into())
        .with_kind(envelope.message_type().into());
    match envelope
        .created_at()
        .and_then(|created_at| u64::try_from(created_at.timestamp()).ok())
    {
        Some(timestamp) => properties.with_timestamp(timestamp),
        None => properties,
    }
}

/// `delay` in milliseconds, capped at `u64::MAX`.
fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Logs the outcome of each publishing attempt.
struct LogAttempts<'a> {
    queue_name: &'a str,
    message_id: Uuid,
}

impl BackoffObserver<PublisherError> for LogAttempts<'_> {
    fn on_success(&self, attempt: u32) {
        if attempt > 0 {
            tracing::info!(
                queue_name = self.queue_name,
                message_id = %self.message_id,
                attempt,
                "Message published after retrying"
            );
        }
    }

    fn on_retry(&self, attempt: u32, failure: &AttemptFailure<PublisherError>, delay: Duration) {
        tracing::warn!(
            queue_name = self.queue_name,
            message_id = %self.message_id,
            attempt,
            delay_ms = saturating_millis(delay),
            error = %failure,
            "Failed to publish message, retrying"
        );
    }

    fn on_final_error(&self, attempt: u32, failure: &AttemptFailure<PublisherError>) {
        tracing::error!(
            queue_name = self.queue_name,
            message_id = %self.message_id,
            attempt,
            error = %failure,
            "Failed to publish message, giving up"
        );
    }
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<F: TransportFactory> {
    supervisor: Arc<ConnectionSupervisor<F>>,
    default_queue: String,
    backoff: Backoff,
    timeout: Duration,
}

impl<F: TransportFactory> PublisherBuilder<F> {
    fn new(supervisor: Arc<ConnectionSupervisor<F>>) -> Self {
        let default_queue = supervisor.queue_settings().default_queue.clone();
        Self {
            supervisor,
            default_queue,
            backoff: Backoff::from_settings(&BackoffSettings::default()),
            timeout: Duration::from_secs(3),
        }
    }

    /// The queue used by the backoff, escalation and retry helpers.
    /// Defaults to the supervisor's `default_queue` setting.
    #[must_use]
    pub fn default_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.default_queue = queue_name.into();
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn backoff_settings(self, settings: &BackoffSettings) -> Self {
        self.backoff(Backoff::from_settings(settings))
    }

    /// Timeout applied to each write to the broker, confirmation included.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Publisher<F> {
        Publisher {
            supervisor: self.supervisor,
            default_queue: self.default_queue,
            backoff: self.backoff,
            timeout: self.timeout,
        }
    }
}
