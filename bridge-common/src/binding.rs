use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A declared mapping from one source-stream subject filter to one
/// compute-target invocation.
///
/// Bindings are immutable after creation except for delete. Assignment is
/// not part of the record: which peer runs a binding is always recomputed
/// from the live-peer set, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub id: Uuid,
    /// Compute-target reference. For the HTTP invoker this is the
    /// invocation URL.
    pub target: String,
    /// Name of the source stream the durable consumer is created against.
    pub stream: String,
    pub subject_filter: String,
    #[serde(default)]
    pub start_position: StartPosition,
    pub batching: Option<BatchingPolicy>,
}

impl Binding {
    /// Durable consumer name, derived deterministically from the binding id
    /// so the subscription survives worker restarts and reassignment.
    pub fn consumer_name(&self) -> String {
        format!("bridge-{}", self.id)
    }
}

/// Fields supplied by the caller when creating a binding; the store mints
/// the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBinding {
    pub target: String,
    pub stream: String,
    pub subject_filter: String,
    #[serde(default)]
    pub start_position: StartPosition,
    pub batching: Option<BatchingPolicy>,
}

/// Where the durable consumer starts reading when it is first
/// materialized. Has no effect once the subscription exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "position", content = "sequence")]
pub enum StartPosition {
    #[default]
    All,
    New,
    Sequence(u64),
}

/// Batch fetch policy: up to `max_messages` per fetch, waiting at most
/// `max_latency` for the batch to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingPolicy {
    pub max_messages: usize,
    #[serde(with = "duration_ms", rename = "max_latency_ms")]
    pub max_latency: Duration,
}

/// Serialize `Duration` as integer milliseconds, matching the env-config
/// convention used across the workspace.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
