//! The three cooperating queues behind every logical queue name.
//!
//! ```text
//!            nack/reject                 TTL expiry
//!   Q  ───────────────────▶ Q.retry ───────────────────▶ Q
//!
//!   escalate_to_final_queue ──────────▶ Q.dlq.final   (terminal, no dead-lettering)
//! ```
//!
//! All three queues are durable, non-exclusive and never auto-deleted.
//! Dead-lettering goes through the default exchange (`x-dead-letter-exchange = ""`), with the
//! partner queue's name as routing key.
use amq_protocol_types::{AMQPValue, FieldTable, LongString};
use lapin::options::QueueDeclareOptions;

use crate::amqp::configuration::QueueSettings;
use crate::amqp::transport::BrokerChannel;

/// The physical queues and their cross-wiring for one logical queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    main: String,
    retry: String,
    final_queue: String,
    retry_ttl_ms: u32,
}

impl QueueTopology {
    pub fn new(queue_name: &str, settings: &QueueSettings) -> Self {
        Self {
            main: queue_name.to_owned(),
            retry: format!("{queue_name}{}", settings.retry_suffix),
            final_queue: format!("{queue_name}{}", settings.final_suffix),
            retry_ttl_ms: settings.retry_ttl_ms,
        }
    }

    pub fn main_queue(&self) -> &str {
        &self.main
    }

    pub fn retry_queue(&self) -> &str {
        &self.retry
    }

    pub fn final_queue(&self) -> &str {
        &self.final_queue
    }

    /// Rejected messages go to the delay queue.
    pub fn main_queue_arguments(&self) -> FieldTable {
        dead_letter_to(&self.retry)
    }

    /// Messages sit in the delay queue for the TTL, then go back to the main queue.
    pub fn retry_queue_arguments(&self) -> FieldTable {
        let mut arguments = dead_letter_to(&self.main);
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(i64::from(self.retry_ttl_ms)),
        );
        arguments
    }

    pub fn final_queue_arguments(&self) -> FieldTable {
        FieldTable::default()
    }

    /// Passive declaration of the main queue: succeeds only if it already exists.
    pub async fn exists(&self, channel: &impl BrokerChannel) -> Result<(), anyhow::Error> {
        channel
            .queue_declare(
                &self.main,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
    }

    /// Declare the three queues.
    ///
    /// The order matters: the dead-letter targets must exist before the queues pointing at
    /// them, so the terminal queue comes first, then the delay queue, then the main queue.
    #[tracing::instrument(skip_all, fields(queue_name = %self.main))]
    pub async fn declare(&self, channel: &impl BrokerChannel) -> Result<(), anyhow::Error> {
        for (queue_name, arguments) in [
            (&self.final_queue, self.final_queue_arguments()),
            (&self.retry, self.retry_queue_arguments()),
            (&self.main, self.main_queue_arguments()),
        ] {
            channel
                .queue_declare(queue_name, durable(), arguments)
                .await?;
            tracing::debug!(queue = %queue_name, "Queue declared");
        }
        Ok(())
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: true,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

fn dead_letter_to(queue_name: &str) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(LongString::from("")),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(LongString::from(queue_name)),
    );
    arguments
}
