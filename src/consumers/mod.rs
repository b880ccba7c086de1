//! Facilities to consume envelopes from RabbitMq. Check out [`Consumer`] as a starting point.
mod consumer;
mod handler;
mod incoming_message;

pub use consumer::{Consumer, ConsumerError, Subscription};
pub use handler::{ClosureHandler, Handler};
pub use incoming_message::{Acknowledger, Delivery};
