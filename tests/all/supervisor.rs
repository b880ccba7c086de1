use crate::helpers::{Event, FakeBroker};
use amq_protocol_types::{AMQPValue, LongString};
use notify_relay::amqp::transport::BrokerChannel;
use notify_relay::amqp::ConnectionError;

#[tokio::test]
async fn nothing_is_opened_until_first_use() {
    let broker = FakeBroker::default();
    let supervisor = broker.supervisor();

    assert!(!supervisor.is_connected().await);
    assert!(broker.events().is_empty());
}

#[tokio::test]
async fn missing_topology_is_declared_terminal_queue_first() {
    // Arrange
    let broker = FakeBroker::default();
    let supervisor = broker.supervisor();

    // Act
    supervisor.ensure_connected("email_queue").await.unwrap();

    // Assert
    let declared: Vec<_> = broker
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Declare(queue) => Some(queue),
            _ => None,
        })
        .collect();
    assert_eq!(
        declared,
        ["email_queue.dlq.final", "email_queue.retry", "email_queue"]
    );
    assert!(supervisor.is_connected().await);

    let main = broker.queue_arguments("email_queue").unwrap();
    assert_eq!(
        main.inner().get("x-dead-letter-routing-key"),
        Some(&AMQPValue::LongString(LongString::from("email_queue.retry")))
    );
    let retry = broker.queue_arguments("email_queue.retry").unwrap();
    assert_eq!(
        retry.inner().get("x-dead-letter-routing-key"),
        Some(&AMQPValue::LongString(LongString::from("email_queue")))
    );
    assert_eq!(
        retry.inner().get("x-message-ttl"),
        Some(&AMQPValue::LongLongInt(60_000))
    );
    assert!(broker
        .queue_arguments("email_queue.dlq.final")
        .unwrap()
        .inner()
        .is_empty());
}

#[tokio::test]
async fn provisioned_topology_is_only_checked_passively() {
    // Arrange
    let broker = FakeBroker::provisioned("email_queue");
    let supervisor = broker.supervisor();

    // Act
    supervisor.ensure_connected("email_queue").await.unwrap();
    supervisor.ensure_connected("email_queue").await.unwrap();

    // Assert
    let is_passive_check = |e: &Event| matches!(e, Event::PassiveCheck(q) if q == "email_queue");
    assert_eq!(broker.count(is_passive_check), 2);
    assert_eq!(broker.count(|e| matches!(e, Event::Declare(_))), 0);
    assert_eq!(broker.count(|e| matches!(e, Event::Connect)), 1);
}

#[tokio::test]
async fn a_second_call_after_declaring_does_not_redeclare() {
    let broker = FakeBroker::default();
    let supervisor = broker.supervisor();
    supervisor.ensure_connected("email_queue").await.unwrap();
    broker.clear_events();

    supervisor.ensure_connected("email_queue").await.unwrap();

    assert_eq!(
        broker.events(),
        vec![Event::PassiveCheck("email_queue".into())]
    );
}

#[tokio::test]
async fn subscription_channels_check_the_topology_without_touching_the_shared_channel() {
    // Arrange
    let broker = FakeBroker::provisioned("email_queue");
    let supervisor = broker.supervisor();
    let shared = supervisor.ensure_connected("email_queue").await.unwrap();

    // Act
    let subscription = supervisor
        .open_subscription_channel("sms_queue")
        .await
        .unwrap();

    // Assert
    assert!(shared.is_open());
    assert!(subscription.is_open());
    assert_eq!(broker.count(|e| matches!(e, Event::Declare(q) if q == "sms_queue")), 1);
    assert_eq!(broker.count(|e| matches!(e, Event::Connect)), 1);
}

#[tokio::test]
async fn a_broken_connection_is_replaced() {
    // Arrange
    let broker = FakeBroker::provisioned("email_queue");
    let supervisor = broker.supervisor();
    supervisor.ensure_connected("email_queue").await.unwrap();

    // Act
    broker.sever();
    assert!(!supervisor.is_connected().await);
    let channel = supervisor.ensure_connected("email_queue").await;

    // Assert
    assert!(channel.is_ok());
    assert!(supervisor.is_connected().await);
    assert_eq!(broker.count(|e| matches!(e, Event::Connect)), 2);
}

#[tokio::test]
async fn connection_failures_are_reported_and_the_next_call_retries() {
    let broker = FakeBroker::provisioned("email_queue");
    broker.fail_connects(1);
    let supervisor = broker.supervisor();

    let outcome = supervisor.ensure_connected("email_queue").await;
    assert!(matches!(outcome, Err(ConnectionError::Connect(_))));

    assert!(supervisor.ensure_connected("email_queue").await.is_ok());
}

#[tokio::test]
async fn close_shuts_everything_down_once() {
    // Arrange
    let broker = FakeBroker::provisioned("email_queue");
    let supervisor = broker.supervisor();
    supervisor.ensure_connected("email_queue").await.unwrap();

    // Act
    supervisor.close().await;
    supervisor.close().await;

    // Assert
    assert_eq!(broker.count(|e| matches!(e, Event::CloseChannel)), 1);
    assert_eq!(broker.count(|e| matches!(e, Event::CloseConnection)), 1);
    assert!(!supervisor.is_connected().await);
    assert!(matches!(
        supervisor.ensure_connected("email_queue").await,
        Err(ConnectionError::ShutDown)
    ));
}

#[tokio::test]
async fn closing_an_unused_supervisor_is_a_no_op() {
    let broker = FakeBroker::default();
    let supervisor = broker.supervisor();

    supervisor.close().await;

    assert!(broker.events().is_empty());
}
