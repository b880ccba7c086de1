//! Facilities to publish envelopes to RabbitMq. Check out [`Publisher`] as a starting point.
mod publisher;

pub use publisher::{Publisher, PublisherBuilder, PublisherError};
