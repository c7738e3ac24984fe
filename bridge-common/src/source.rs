use async_trait::async_trait;
use thiserror::Error;

use crate::binding::Binding;
use crate::payload::MessagePayload;

/// Defaults applied when a binding declares no batching policy.
pub const DEFAULT_FETCH_MESSAGES: usize = 1;
pub const DEFAULT_FETCH_WAIT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SourceError {
    /// The already-materialized durable subscription no longer matches the
    /// binding's declared policy. Unrecoverable without manual
    /// intervention; the binding's worker must stop.
    #[error("consumer {consumer} configuration does not match binding")]
    ConsumerMismatch { consumer: String },
    /// Transient transport failure; callers retry the fetch.
    #[error("stream transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
#[error("failed to settle message: {0}")]
pub struct AckError(pub String);

/// One message pulled from the source stream.
///
/// `ack`/`nak` are idempotent from the caller's perspective; settling a
/// message twice is harmless.
#[async_trait]
pub trait StreamMessage: Send + Sync {
    fn payload(&self) -> MessagePayload;
    async fn ack(&self) -> Result<(), AckError>;
    async fn nak(&self) -> Result<(), AckError>;
}

/// Per-binding batched access to the source stream.
///
/// Implementations lazily materialize one durable subscription per binding
/// keyed by [`Binding::consumer_name`], and block up to the binding's
/// batch-latency bound before returning whatever arrived. An empty batch
/// is not an error.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch(&self, binding: &Binding) -> Result<Vec<Box<dyn StreamMessage>>, SourceError>;
}
