//! The per-binding worker loop: fetch, dispatch, acknowledge, repeat.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bridge_common::binding::Binding;
use bridge_common::source::{MessageSource, SourceError};

use crate::dispatch::Dispatcher;

/// Drive one binding until its scope is cancelled.
///
/// Fetch errors are transient and the loop simply tries again, except for
/// a consumer mismatch: the durable consumer's configuration no longer
/// matches the binding, which no amount of retrying will fix, so the
/// worker stops and leaves the binding idle until an operator intervenes.
///
/// Cancellation is only observed between batches. A batch that has been
/// fetched is always dispatched and settled first, so shutdown never
/// strands messages in an unacknowledged limbo longer than necessary.
pub async fn run_binding(
    binding: Binding,
    source: Arc<dyn MessageSource>,
    dispatcher: Dispatcher,
    scope: CancellationToken,
) {
    info!(binding_id = %binding.id, target = %binding.target, "binding worker started");

    loop {
        let batch = tokio::select! {
            _ = scope.cancelled() => break,
            fetched = source.fetch(&binding) => match fetched {
                Ok(batch) => batch,
                Err(SourceError::ConsumerMismatch { consumer }) => {
                    error!(
                        binding_id = %binding.id,
                        consumer = %consumer,
                        "consumer configuration does not match the binding, stopping worker"
                    );
                    metrics::counter!("bridge_consumer_mismatches_total").increment(1);
                    break;
                }
                Err(source_error) => {
                    warn!(binding_id = %binding.id, "fetch failed: {}", source_error);
                    continue;
                }
            }
        };

        if batch.is_empty() {
            continue;
        }

        let report = dispatcher.dispatch(&binding, batch).await;
        for message in &report.delivered {
            if let Err(ack_error) = message.ack().await {
                warn!(binding_id = %binding.id, "failed to acknowledge message: {}", ack_error);
            }
        }
        if let Some(dispatch_error) = report.error {
            warn!(binding_id = %binding.id, "dispatch failed: {}", dispatch_error);
        }
    }

    info!(binding_id = %binding.id, "binding worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use bridge_common::binding::{BatchingPolicy, StartPosition};
    use bridge_common::memory::{MemorySource, RecordingInvoker};
    use bridge_common::source::StreamMessage;

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

    #[tokio::test]
    async fn delivers_and_acks_until_cancelled() {
        let binding = binding(Some(BatchingPolicy {
            max_messages: 2,
            max_latency: Duration::from_millis(10),
        }));
        let source = Arc::new(MemorySource::new());
        let invoker = Arc::new(RecordingInvoker::new());
        let dispatcher = Dispatcher::new(invoker.clone());

        let handles: Vec<_> = (1..=4)
            .map(|n| source.push(binding.id, &format!("m{n}"), b"payload"))
            .collect();

        let scope = CancellationToken::new();
        let worker = tokio::spawn(run_binding(
            binding,
            source.clone(),
            dispatcher,
            scope.clone(),
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !handles.iter().all(|message| message.is_acked()) {
            assert!(tokio::time::Instant::now() < deadline, "messages not acked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Two messages per fetch.
        assert_eq!(invoker.calls().len(), 2);

        scope.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn failed_messages_stay_unacked() {
        let binding = binding(None);
        let source = Arc::new(MemorySource::new());
        let invoker = Arc::new(RecordingInvoker::new());
        invoker.fail_all();
        let dispatcher = Dispatcher::new(invoker.clone());

        let handle = source.push(binding.id, "m1", b"payload");

        let scope = CancellationToken::new();
        let worker = tokio::spawn(run_binding(
            binding,
            source.clone(),
            dispatcher,
            scope.clone(),
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !handle.is_naked() {
            assert!(tokio::time::Instant::now() < deadline, "message not naked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_acked());

        scope.cancel();
        worker.await.unwrap();
    }

    struct MismatchSource;

    #[async_trait]
    impl MessageSource for MismatchSource {
        async fn fetch(
            &self,
            binding: &Binding,
        ) -> Result<Vec<Box<dyn StreamMessage>>, SourceError> {
            Err(SourceError::ConsumerMismatch {
                consumer: binding.consumer_name(),
            })
        }
    }

    #[tokio::test]
    async fn consumer_mismatch_stops_the_worker() {
        let binding = binding(None);
        let invoker = Arc::new(RecordingInvoker::new());
        let dispatcher = Dispatcher::new(invoker.clone());

        // Returns without external cancellation.
        run_binding(
            binding,
            Arc::new(MismatchSource),
            dispatcher,
            CancellationToken::new(),
        )
        .await;
        assert!(invoker.calls().is_empty());
    }
}
