use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by an invocation attempt. A logical function error is
/// distinct from a transport failure but both reject the implicated
/// messages.
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("failed to marshal invocation payload: {0}")]
    Marshal(#[source] serde_json::Error),
    #[error("invocation transport failed: {0}")]
    Transport(String),
    #[error("invocation returned status {0}")]
    Status(u16),
    /// The target ran but reported an application-level failure.
    #[error("function error: {0}")]
    Function(String),
}

/// The compute target. `target` is the binding's compute-target reference;
/// the payload bytes are the JSON shapes from [`crate::payload`].
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, target: &str, payload: Vec<u8>) -> Result<(), InvokeError>;
}
