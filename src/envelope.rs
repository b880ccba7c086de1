//! The unit of work moved through the broker.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A notification job together with its retry and failure bookkeeping.
///
/// `content` is opaque: neither the publisher nor the consumer look inside it.
/// It is serialized as JSON, field names in camelCase.
///
/// # Final failure
///
/// `final_failure` starts as `false` and only ever becomes `true` when the envelope is
/// escalated to the terminal dead-letter queue via
/// [`Publisher::escalate_to_final_queue`](crate::publishers::Publisher::escalate_to_final_queue),
/// which also stamps `failed_at`.
/// Envelopes coming off the wire that claim a final failure without a `failedAt` timestamp are
/// rejected at deserialization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    rename_all = "camelCase",
    try_from = "EnvelopeRepr<T>",
    bound(deserialize = "T: serde::de::DeserializeOwned")
)]
pub struct Envelope<T> {
    id: Uuid,
    content: T,
    message_type: String,
    retry_count: u32,
    max_retries: u32,
    created_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    final_failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl<T> Envelope<T> {
    /// Wrap `content` in a fresh envelope.
    ///
    /// `created_at` stays empty until the envelope is published for the first time.
    pub fn new(message_type: impl Into<String>, content: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            message_type: message_type.into(),
            retry_count: 0,
            max_retries: 0,
            created_at: None,
            failed_at: None,
            final_failure: false,
            error_message: None,
        }
    }

    /// Set the application-level retry budget, see [`Envelope::retries_exhausted`].
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn content(&self) -> &T {
        &self.content
    }

    pub fn into_content(self) -> T {
        self.content
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    pub fn is_final_failure(&self) -> bool {
        self.final_failure
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    /// Bump the advisory retry counter.
    ///
    /// Nothing in this crate calls it: handlers that want payload-level retry limits
    /// (on top of the broker's delayed-retry loop) increment it before re-publishing.
    pub fn record_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// `true` once `retry_count` has reached `max_retries`.
    ///
    /// A handler seeing this is expected to escalate the envelope instead of failing again.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub(crate) fn stamp_created_at(&mut self) {
        if self.created_at.is_none() {
            self.created_at = Some(Utc::now());
        }
    }

    /// Mark the envelope as permanently failed.
    ///
    /// `failed_at` is only ever set once: marking an already failed envelope again is a no-op.
    pub(crate) fn mark_final_failure(&mut self) {
        if !self.final_failure {
            self.failed_at = Some(Utc::now());
            self.final_failure = true;
        }
    }
}

/// Error returned when a wire envelope breaks the final-failure invariant.
#[derive(thiserror::Error, Debug)]
#[error("envelope {id} is marked as a final failure but carries no `failedAt` timestamp")]
pub struct EnvelopeError {
    pub id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRepr<T> {
    id: Uuid,
    content: T,
    message_type: String,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    final_failure: bool,
    #[serde(default)]
    error_message: Option<String>,
}

impl<T> TryFrom<EnvelopeRepr<T>> for Envelope<T> {
    type Error = EnvelopeError;

    fn try_from(repr: EnvelopeRepr<T>) -> Result<Self, Self::Error> {
        if repr.final_failure && repr.failed_at.is_none() {
            return Err(EnvelopeError { id: repr.id });
        }
        Ok(Self {
            id: repr.id,
            content: repr.content,
            message_type: repr.message_type,
            retry_count: repr.retry_count,
            max_retries: repr.max_retries,
            created_at: repr.created_at,
            failed_at: repr.failed_at,
            final_failure: repr.final_failure,
            error_message: repr.error_message,
        })
    }
}
