//! `notify-relay` is the resilient delivery core of the notification pipeline, built on top of
//! [`lapin`], to move messages through RabbitMQ without losing them.
//!
//! Every message travels in an [`Envelope`](crate::envelope::Envelope) and every queue comes
//! with a delayed-retry loop and a terminal dead-letter queue, declared lazily by the shared
//! [`ConnectionSupervisor`](crate::amqp::ConnectionSupervisor).
//!
//! [`Publisher`](crate::publishers::Publisher) and [`Consumer`](crate::consumers::Consumer)
//! are the best starting points to learn more about what `notify-relay` provides and how
//! to leverage it.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod backoff;
pub mod consumers;
pub mod envelope;
pub mod publishers;

pub mod amqp;
