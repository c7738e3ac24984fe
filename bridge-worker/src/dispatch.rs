//! Marshals fetched batches into compute-target invocations and settles
//! the messages that cannot be delivered.
//!
//! Responsibility split: the dispatcher naks, the caller acks. Everything
//! in `DispatchReport::delivered` was invoked successfully and is the
//! caller's to acknowledge; everything else has already been rejected so
//! the stream redelivers it. At-least-once, never exactly-once.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use bridge_common::binding::Binding;
use bridge_common::invoke::{InvokeError, Invoker};
use bridge_common::payload::{encode_batch, encode_single};
use bridge_common::source::StreamMessage;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

pub struct DispatchReport {
    /// Successfully invoked messages, in stream order, awaiting ack by the
    /// caller.
    pub delivered: Vec<Box<dyn StreamMessage>>,
    pub error: Option<DispatchError>,
}

#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<dyn Invoker>,
}

impl Dispatcher {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self { invoker }
    }

    /// Dispatch a non-empty batch for a binding.
    ///
    /// With a batching policy the whole batch is one invocation and fails
    /// as a unit. Without one, messages are invoked individually in
    /// order, and the first failure short-circuits: the failing message
    /// and every message after it are rejected without further invocation
    /// attempts, preserving ordering for the redelivered tail.
    pub async fn dispatch(
        &self,
        binding: &Binding,
        messages: Vec<Box<dyn StreamMessage>>,
    ) -> DispatchReport {
        let labels = [("binding_id", binding.id.to_string())];
        metrics::counter!("bridge_dispatch_batches_total", &labels).increment(1);
        metrics::counter!("bridge_dispatch_messages_total", &labels)
            .increment(messages.len() as u64);

        let report = if binding.batching.is_some() {
            self.dispatch_batched(binding, messages).await
        } else {
            self.dispatch_each(binding, messages).await
        };

        if report.error.is_some() {
            metrics::counter!("bridge_dispatch_failures_total", &labels).increment(1);
        }
        report
    }

    async fn dispatch_batched(
        &self,
        binding: &Binding,
        messages: Vec<Box<dyn StreamMessage>>,
    ) -> DispatchReport {
        let payloads: Vec<_> = messages.iter().map(|message| message.payload()).collect();

        let encoded = match encode_batch(&payloads) {
            Ok(encoded) => encoded,
            Err(invoke_error) => {
                reject_all(&messages).await;
                return DispatchReport {
                    delivered: Vec::new(),
                    error: Some(invoke_error.into()),
                };
            }
        };

        match self.invoker.invoke(&binding.target, encoded).await {
            Ok(()) => DispatchReport {
                delivered: messages,
                error: None,
            },
            Err(invoke_error) => {
                reject_all(&messages).await;
                DispatchReport {
                    delivered: Vec::new(),
                    error: Some(invoke_error.into()),
                }
            }
        }
    }

    async fn dispatch_each(
        &self,
        binding: &Binding,
        messages: Vec<Box<dyn StreamMessage>>,
    ) -> DispatchReport {
        let mut delivered = Vec::with_capacity(messages.len());
        let mut error: Option<DispatchError> = None;

        for message in messages {
            if error.is_some() {
                reject(message.as_ref()).await;
                continue;
            }

            let encoded = match encode_single(&message.payload()) {
                Ok(encoded) => encoded,
                Err(invoke_error) => {
                    reject(message.as_ref()).await;
                    error = Some(invoke_error.into());
                    continue;
                }
            };

            match self.invoker.invoke(&binding.target, encoded).await {
                Ok(()) => delivered.push(message),
                Err(invoke_error) => {
                    reject(message.as_ref()).await;
                    error = Some(invoke_error.into());
                }
            }
        }

        DispatchReport { delivered, error }
    }
}

async fn reject_all(messages: &[Box<dyn StreamMessage>]) {
    for message in messages {
        reject(message.as_ref()).await;
    }
}

async fn reject(message: &dyn StreamMessage) {
    if let Err(ack_error) = message.nak().await {
        warn!("failed to reject message: {}", ack_error);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use bridge_common::binding::{BatchingPolicy, StartPosition};
    use bridge_common::memory::{MemoryMessage, MemorySource, RecordingInvoker, Settlement};
    use bridge_common::source::MessageSource;

    use super::*;

    fn binding(batching: Option<BatchingPolicy>) -> Binding {
        Binding {
            id: Uuid::new_v4(),
            target: "https://functions.example.com/handle".to_owned(),
            stream: "EVENTS".to_owned(),
            subject_filter: "events.>".to_owned(),
            start_position: StartPosition::All,
            batching,
        }
    }

    fn batching(max_messages: usize) -> BatchingPolicy {
        BatchingPolicy {
            max_messages,
            max_latency: Duration::from_millis(50),
        }
    }

    async fn fetch_pushed(
        source: &MemorySource,
        binding: &Binding,
        count: usize,
    ) -> (Vec<MemoryMessage>, Vec<Box<dyn StreamMessage>>) {
        let handles: Vec<MemoryMessage> = (1..=count)
            .map(|n| source.push(binding.id, &format!("m{n}"), b"payload"))
            .collect();
        let batch = source.fetch(binding).await.unwrap();
        assert_eq!(batch.len(), count);
        (handles, batch)
    }

    #[tokio::test]
    async fn batched_success_delivers_everything_unsettled() {
        let binding = binding(Some(batching(5)));
        let source = MemorySource::new();
        let invoker = Arc::new(RecordingInvoker::new());
        let dispatcher = Dispatcher::new(invoker.clone());

        let (handles, batch) = fetch_pushed(&source, &binding, 5).await;
        let report = dispatcher.dispatch(&binding, batch).await;

        assert!(report.error.is_none());
        assert_eq!(report.delivered.len(), 5);
        // One invocation for the whole batch.
        assert_eq!(invoker.calls().len(), 1);
        // Settlement is the caller's job on success.
        assert!(handles.iter().all(|message| !message.is_settled()));
    }

    #[tokio::test]
    async fn batched_failure_rejects_all_and_acks_none() {
        let binding = binding(Some(batching(5)));
        let source = MemorySource::new();
        let invoker = Arc::new(RecordingInvoker::new());
        invoker.fail_all();
        let dispatcher = Dispatcher::new(invoker.clone());

        let (handles, batch) = fetch_pushed(&source, &binding, 5).await;
        let report = dispatcher.dispatch(&binding, batch).await;

        assert!(report.error.is_some());
        assert!(report.delivered.is_empty());
        assert!(handles.iter().all(|message| message.is_naked()));
        assert!(handles.iter().all(|message| !message.is_acked()));
    }

    #[tokio::test]
    async fn unbatched_failure_short_circuits_the_tail() {
        let binding = binding(None);
        let source = MemorySource::new();
        let invoker = Arc::new(RecordingInvoker::new());
        invoker.fail_on_call(3);
        let dispatcher = Dispatcher::new(invoker.clone());

        let handles: Vec<MemoryMessage> = (1..=5)
            .map(|n| source.push(binding.id, &format!("m{n}"), b"payload"))
            .collect();
        // Unbatched bindings fetch one at a time; hand all five to the
        // dispatcher directly to exercise the short-circuit.
        let batch: Vec<Box<dyn StreamMessage>> = handles
            .iter()
            .map(|message| -> Box<dyn StreamMessage> { Box::new(message.clone()) })
            .collect();

        let report = dispatcher.dispatch(&binding, batch).await;
        assert!(report.error.is_some());
        assert_eq!(report.delivered.len(), 2);

        // Messages 3..5 rejected without invocation attempts.
        assert_eq!(invoker.calls().len(), 3);
        assert!(handles[0..2].iter().all(|message| !message.is_settled()));
        assert!(handles[2..].iter().all(|message| message.is_naked()));

        // Caller acks the delivered prefix, in order.
        for message in &report.delivered {
            message.ack().await.unwrap();
        }
        assert_eq!(
            source.settlements(),
            vec![
                ("m3".to_owned(), Settlement::Naked),
                ("m4".to_owned(), Settlement::Naked),
                ("m5".to_owned(), Settlement::Naked),
                ("m1".to_owned(), Settlement::Acked),
                ("m2".to_owned(), Settlement::Acked),
            ]
        );
    }

    #[tokio::test]
    async fn unbatched_success_invokes_in_order() {
        let binding = binding(None);
        let source = MemorySource::new();
        let invoker = Arc::new(RecordingInvoker::new());
        let dispatcher = Dispatcher::new(invoker.clone());

        let handles: Vec<MemoryMessage> = (1..=3)
            .map(|n| source.push(binding.id, &format!("m{n}"), b"payload"))
            .collect();
        let batch: Vec<Box<dyn StreamMessage>> = handles
            .iter()
            .map(|message| -> Box<dyn StreamMessage> { Box::new(message.clone()) })
            .collect();

        let report = dispatcher.dispatch(&binding, batch).await;
        assert!(report.error.is_none());
        assert_eq!(report.delivered.len(), 3);
        assert_eq!(invoker.calls().len(), 3);

        // Each invocation carried a single-message payload, in order.
        for (n, (_, payload)) in invoker.calls().iter().enumerate() {
            let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
            assert_eq!(value["subject"], format!("m{}", n + 1));
        }
    }
}
