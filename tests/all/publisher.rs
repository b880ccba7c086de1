use crate::helpers::{Event, FakeBroker};
use fake::faker::internet::en::SafeEmail;
use fake::Fake;
use notify_relay::amqp::ConnectionError;
use notify_relay::backoff::{AttemptFailure, Backoff};
use notify_relay::envelope::Envelope;
use notify_relay::publishers::{Publisher, PublisherError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WelcomeEmail {
    recipient: String,
}

fn welcome_email() -> Envelope<WelcomeEmail> {
    Envelope::new(
        "welcome_email",
        WelcomeEmail {
            recipient: SafeEmail().fake(),
        },
    )
}

#[tokio::test]
async fn envelopes_are_published_as_persistent_json() {
    // Arrange
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor()).build();
    let mut envelope = welcome_email();

    // Act
    publisher.publish("email_queue", &mut envelope).await.unwrap();

    // Assert
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "email_queue");

    let body = published[0].json();
    assert_eq!(body["id"], envelope.id().to_string());
    assert_eq!(body["messageType"], "welcome_email");
    assert_eq!(body["content"]["recipient"], envelope.content().recipient);
    assert_eq!(body["retryCount"], 0);
    assert_eq!(body["finalFailure"], false);
    assert!(body["createdAt"].is_string());
    assert!(envelope.created_at().is_some());

    let properties = &published[0].properties;
    assert_eq!(*properties.delivery_mode(), Some(2));
    assert_eq!(
        properties.content_type().as_ref().map(|c| c.as_str()),
        Some("application/json")
    );
}

#[tokio::test]
async fn the_topology_is_declared_on_first_publish() {
    let broker = FakeBroker::default();
    let publisher = Publisher::builder(broker.supervisor()).build();

    publisher
        .publish("sms_queue", &mut welcome_email())
        .await
        .unwrap();

    assert_eq!(broker.count(|e| matches!(e, Event::Declare(_))), 3);
    assert!(broker.queue_arguments("sms_queue.retry").is_some());
    assert!(broker.queue_arguments("sms_queue.dlq.final").is_some());
}

#[tokio::test]
async fn escalation_parks_the_envelope_in_the_terminal_queue() {
    // Arrange
    let broker = FakeBroker::default();
    let publisher = Publisher::builder(broker.supervisor()).build();
    let mut envelope = welcome_email().with_error_message("SMTP 550: mailbox unavailable");

    // Act
    publisher
        .escalate_to_final_queue(&mut envelope)
        .await
        .unwrap();

    // Assert
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "email_queue.dlq.final");

    let body = published[0].json();
    assert_eq!(body["finalFailure"], true);
    assert!(body["failedAt"].is_string());
    assert_eq!(body["errorMessage"], "SMTP 550: mailbox unavailable");
    assert!(envelope.is_final_failure());
    assert!(envelope.failed_at().is_some());

    // Only the topology of the default queue exists.
    assert_eq!(broker.count(|e| matches!(e, Event::Declare(_))), 3);
    assert!(broker.queue_arguments("email_queue.dlq.final.retry").is_none());
}

#[tokio::test]
async fn escalated_envelopes_cannot_be_published_again() {
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor()).build();
    let mut envelope = welcome_email();
    publisher
        .escalate_to_final_queue(&mut envelope)
        .await
        .unwrap();

    let outcome = publisher.publish("email_queue", &mut envelope).await;
    assert!(matches!(outcome, Err(PublisherError::FinalEnvelope(id)) if id == envelope.id()));

    let outcome = publisher.publish_to_retry_queue(&mut envelope).await;
    assert!(matches!(outcome, Err(PublisherError::FinalEnvelope(_))));

    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn retry_queue_publishing_targets_the_delay_queue() {
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor()).build();

    publisher
        .publish_to_retry_queue(&mut welcome_email())
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "email_queue.retry");
}

#[tokio::test(start_paused = true)]
async fn transient_publish_failures_are_retried_with_backoff() {
    // Arrange
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor())
        .backoff(Backoff::new(Duration::from_millis(200), 5))
        .build();
    broker.fail_publishes(2);
    let started = tokio::time::Instant::now();

    // Act
    publisher
        .publish_with_backoff(&mut welcome_email())
        .await
        .unwrap();

    // Assert
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(broker.count(|e| matches!(e, Event::Publish(_))), 3);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn giving_up_does_not_escalate() {
    // Arrange
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor())
        .backoff(Backoff::new(Duration::from_millis(10), 2))
        .build();
    broker.fail_publishes(10);
    let mut envelope = welcome_email();

    // Act
    let outcome = publisher.publish_with_backoff(&mut envelope).await;

    // Assert
    match outcome {
        Err(PublisherError::BackoffExhausted(e)) => assert_eq!(e.attempts, 3),
        other => panic!("Expected the backoff to give up, got {other:?}"),
    }
    assert_eq!(broker.count(|e| matches!(e, Event::Publish(_))), 3);
    assert!(broker.published().is_empty());
    assert!(!envelope.is_final_failure());
}

#[tokio::test(start_paused = true)]
async fn unserializable_envelopes_exhaust_the_backoff_like_any_other_failure() {
    // Arrange
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor())
        .backoff(Backoff::new(Duration::from_millis(10), 2))
        .build();
    // JSON object keys must be strings.
    let recipients = HashMap::from([((1, 2), SafeEmail().fake::<String>())]);
    let mut envelope = Envelope::new("welcome_email", recipients);

    // Act
    let outcome = publisher.publish_with_backoff(&mut envelope).await;

    // Assert
    match outcome {
        Err(PublisherError::BackoffExhausted(e)) => {
            assert_eq!(e.attempts, 3);
            assert!(matches!(
                e.last_failure,
                AttemptFailure::Error(PublisherError::Serialization(_))
            ));
        }
        other => panic!("Expected the backoff to give up, got {other:?}"),
    }
    assert_eq!(broker.count(|e| matches!(e, Event::Publish(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn connection_failures_are_retried_with_backoff() {
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor()).build();
    broker.fail_connects(3);

    publisher
        .publish_with_backoff(&mut welcome_email())
        .await
        .unwrap();

    assert_eq!(broker.count(|e| matches!(e, Event::Connect)), 4);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn a_single_publish_surfaces_connection_failures() {
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor()).build();
    broker.fail_connects(1);

    let outcome = publisher.publish("email_queue", &mut welcome_email()).await;

    assert!(matches!(
        outcome,
        Err(PublisherError::Connection(ConnectionError::Connect(_)))
    ));
}

#[tokio::test]
async fn publishing_after_a_dropped_connection_reconnects() {
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = Publisher::builder(broker.supervisor()).build();
    publisher
        .publish("email_queue", &mut welcome_email())
        .await
        .unwrap();

    broker.sever();
    publisher
        .publish("email_queue", &mut welcome_email())
        .await
        .unwrap();

    assert_eq!(broker.count(|e| matches!(e, Event::Connect)), 2);
    assert_eq!(broker.published().len(), 2);
}

#[tokio::test]
async fn concurrent_publishes_all_reach_the_broker() {
    let broker = FakeBroker::provisioned("email_queue");
    let publisher = std::sync::Arc::new(Publisher::builder(broker.supervisor()).build());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher
                    .publish("email_queue", &mut welcome_email())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(broker.published().len(), 10);
    assert_eq!(broker.count(|e| matches!(e, Event::Connect)), 1);
}
