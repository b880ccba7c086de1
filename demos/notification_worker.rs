use notify_relay::amqp::configuration::MessagingSettings;
use notify_relay::amqp::{ConnectionFactory, ConnectionSupervisor};
use notify_relay::consumers::{ClosureHandler, Consumer, Handler};
use notify_relay::envelope::Envelope;
use notify_relay::publishers::{Publisher, PublisherError};
use serde::{Deserialize, Serialize};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct WelcomeEmail {
    recipient: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // We are using the out-of-the-box parameters for the default RabbitMq Docker image,
    // `email_queue` as default queue and a 200ms / 5 retries publishing backoff.
    let settings = MessagingSettings::default();
    let connection_factory = ConnectionFactory::new_from_config(&settings.rabbitmq)?;

    // The supervisor owns the one connection of the process.
    // It does not connect yet: the first publish or subscription does, and declares
    // `email_queue`, `email_queue.retry` and `email_queue.dlq.final` if they are missing.
    let supervisor = Arc::new(ConnectionSupervisor::new(
        connection_factory,
        settings.queues.clone(),
    ));

    let publisher = Arc::new(
        Publisher::builder(supervisor.clone())
            .backoff_settings(&settings.backoff)
            .publish_timeout(std::time::Duration::from_secs(3))
            .build(),
    );

    // All subscriptions stop on SIGTERM.
    let shutdown = ShutdownHandler::sigterm()?;
    let consumer = Consumer::new(supervisor.clone()).with_shutdown_handler(shutdown.clone());

    // Handling failures is up to the application: here we send the envelope around the delay
    // queue ourselves, counting attempts, and park it in the terminal queue once the budget is
    // spent. Returning an error instead would let the broker dead-letter it into the delay queue
    // without touching `retry_count`.
    let worker = consumer
        .consume(
            publisher.default_queue(),
            WelcomeEmailSender {
                publisher: publisher.clone(),
            },
        )
        .await?;

    // The terminal queue is for humans: log and ack.
    let parking_lot = consumer
        .consume_final_queue(ClosureHandler(|envelope: Envelope<WelcomeEmail>| async move {
            tracing::error!(
                message_id = %envelope.id(),
                failed_at = ?envelope.failed_at(),
                error = envelope.error_message().unwrap_or("unknown"),
                "Welcome email permanently failed"
            );
            Ok::<(), PublisherError>(())
        }))
        .await?;

    let mut envelope = Envelope::new(
        "welcome_email",
        WelcomeEmail {
            recipient: "jane@example.com".into(),
        },
    )
    .with_max_retries(3);
    if let Err(e) = publisher.publish_with_backoff(&mut envelope).await {
        // The broker is out of reach: there is no point in trying the terminal queue too.
        tracing::error!(error = ?e, "Could not enqueue the welcome email");
    }

    worker.closed().await?;
    parking_lot.closed().await?;
    supervisor.close().await;
    Ok(())
}

struct WelcomeEmailSender {
    publisher: Arc<Publisher>,
}

#[async_trait::async_trait]
impl Handler<WelcomeEmail> for WelcomeEmailSender {
    type Error = PublisherError;

    async fn handle(&self, mut envelope: Envelope<WelcomeEmail>) -> Result<(), PublisherError> {
        // Pretend the SMTP server is having a bad day.
        let outcome: Result<(), &str> = Err("SMTP 421: service not available");
        let Err(e) = outcome else {
            tracing::info!(recipient = %envelope.content().recipient, "Welcome email sent");
            return Ok(());
        };

        envelope.set_error_message(e);
        if envelope.retries_exhausted() {
            self.publisher.escalate_to_final_queue(&mut envelope).await
        } else {
            envelope.record_retry();
            self.publisher.publish_to_retry_queue(&mut envelope).await
        }
    }
}
