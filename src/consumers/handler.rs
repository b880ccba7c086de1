//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use std::fmt;
use std::future::Future;

use crate::envelope::Envelope;

/// Implementers of the `Handler` trait process the envelopes delivered to a
/// [`Subscription`](super::Subscription).
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The framework acks the message if `handle` returns `Ok`, and nacks it without requeueing
/// otherwise, which sends it through the delayed-retry loop of the queue topology.
///
/// # Idempotency
///
/// Delivery is at-least-once and failed messages come back after the retry delay: the same
/// envelope can reach `handle` more than once.
/// Handlers that want to stop the retry loop check [`Envelope::retries_exhausted`] and call
/// [`Publisher::escalate_to_final_queue`](crate::publishers::Publisher::escalate_to_final_queue)
/// before returning `Ok`.
///
/// # Blocking
///
/// Deliveries of a subscription are handled one at a time: a handler that never returns stalls
/// the whole subscription.
///
/// # Implementers
///
/// Most of the time you will wrap an async function or closure in [`ClosureHandler`].
#[async_trait::async_trait]
pub trait Handler<T: Send + 'static>: Send + Sync + 'static {
    type Error: fmt::Display + Send + 'static;

    async fn handle(&self, envelope: Envelope<T>) -> Result<(), Self::Error>;
}

/// Wrapper type to turn an async function into a [`Handler`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<T, F, Fut, E> Handler<T> for ClosureHandler<F>
where
    T: Send + 'static,
    F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    type Error = E;

    async fn handle(&self, envelope: Envelope<T>) -> Result<(), E> {
        // `self.0` is a function, which we are calling on its argument using parenthesis notation.
        (self.0)(envelope).await
    }
}
