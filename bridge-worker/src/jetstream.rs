//! Pull-consumer message source backed by NATS JetStream.
//!
//! One durable consumer per binding, named by [`Binding::consumer_name`]
//! and created lazily on first fetch. The durable survives worker
//! restarts and reassignment to another peer, which is what makes
//! delivery at-least-once across the fleet: an unacknowledged message is
//! simply redelivered to whichever peer fetches next.

use std::collections::HashMap;
use std::sync::Mutex;

use async_nats::jetstream::consumer::{self, pull, AckPolicy, Consumer, DeliverPolicy};
use async_nats::jetstream::{AckKind, Context, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::warn;
use uuid::Uuid;

use bridge_common::binding::{Binding, StartPosition};
use bridge_common::payload::MessagePayload;
use bridge_common::source::{
    AckError, MessageSource, SourceError, StreamMessage, DEFAULT_FETCH_MESSAGES,
    DEFAULT_FETCH_WAIT,
};

pub struct JetStreamSource {
    context: Context,
    consumers: Mutex<HashMap<Uuid, Consumer<pull::Config>>>,
}

impl JetStreamSource {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    async fn consumer(&self, binding: &Binding) -> Result<Consumer<pull::Config>, SourceError> {
        {
            let consumers = self
                .consumers
                .lock()
                .expect("poisoned JetStreamSource mutex");
            if let Some(consumer) = consumers.get(&binding.id) {
                return Ok(consumer.clone());
            }
        }

        let stream = self
            .context
            .get_stream(&binding.stream)
            .await
            .map_err(|stream_error| SourceError::Transport(stream_error.to_string()))?;

        let desired = consumer_config(binding);
        let consumer = stream
            .get_or_create_consumer(&binding.consumer_name(), desired.clone())
            .await
            .map_err(|consumer_error| SourceError::Transport(consumer_error.to_string()))?;

        // `get_or_create` hands back an existing durable as-is. A durable
        // whose configuration no longer matches the binding would silently
        // deliver under the wrong policy, so refuse to use it.
        if config_drifted(&consumer.cached_info().config, &desired) {
            return Err(SourceError::ConsumerMismatch {
                consumer: binding.consumer_name(),
            });
        }

        let mut consumers = self
            .consumers
            .lock()
            .expect("poisoned JetStreamSource mutex");
        Ok(consumers
            .entry(binding.id)
            .or_insert(consumer)
            .clone())
    }
}

#[async_trait]
impl MessageSource for JetStreamSource {
    async fn fetch(&self, binding: &Binding) -> Result<Vec<Box<dyn StreamMessage>>, SourceError> {
        let consumer = self.consumer(binding).await?;

        let (max_messages, wait) = match binding.batching {
            Some(policy) => (policy.max_messages, policy.max_latency),
            None => (DEFAULT_FETCH_MESSAGES, DEFAULT_FETCH_WAIT),
        };

        let mut fetched = consumer
            .fetch()
            .max_messages(max_messages)
            .expires(wait)
            .messages()
            .await
            .map_err(|batch_error| SourceError::Transport(batch_error.to_string()))?;

        let mut batch: Vec<JetStreamMessage> = Vec::with_capacity(max_messages);
        while let Some(next) = fetched.next().await {
            let wrapped = next
                .map_err(|message_error| SourceError::Transport(message_error.to_string()))
                .and_then(JetStreamMessage::wrap);
            match wrapped {
                Ok(message) => batch.push(message),
                Err(source_error) => {
                    // A partial batch cannot be handed to the caller;
                    // release what was pulled so it is redelivered.
                    reject_fetched(&batch).await;
                    return Err(source_error);
                }
            }
        }
        Ok(batch
            .into_iter()
            .map(|message| -> Box<dyn StreamMessage> { Box::new(message) })
            .collect())
    }
}

async fn reject_fetched(batch: &[JetStreamMessage]) {
    for message in batch {
        if let Err(ack_error) = message.nak().await {
            warn!("failed to release fetched message: {}", ack_error);
        }
    }
}

/// The consumer configuration a binding's durable is expected to carry.
fn consumer_config(binding: &Binding) -> pull::Config {
    let deliver_policy = match binding.start_position {
        StartPosition::All => DeliverPolicy::All,
        StartPosition::New => DeliverPolicy::New,
        StartPosition::Sequence(start_sequence) => DeliverPolicy::ByStartSequence { start_sequence },
    };

    let max_messages = binding
        .batching
        .map(|policy| policy.max_messages)
        .unwrap_or(DEFAULT_FETCH_MESSAGES) as i64;

    pull::Config {
        durable_name: Some(binding.consumer_name()),
        description: Some(format!("bridge consumer for {}", binding.target)),
        filter_subject: binding.subject_filter.clone(),
        deliver_policy,
        ack_policy: AckPolicy::Explicit,
        ack_wait: std::time::Duration::from_secs(60),
        max_deliver: -1,
        // One outstanding pull: a binding is worked by exactly one peer.
        max_waiting: 1,
        max_ack_pending: max_messages,
        max_batch: max_messages,
        ..Default::default()
    }
}

/// Compare the policy-bearing fields only; server-populated fields like
/// `name` differ harmlessly from the desired config.
fn config_drifted(current: &consumer::Config, desired: &pull::Config) -> bool {
    current.filter_subject != desired.filter_subject
        || current.deliver_policy != desired.deliver_policy
        || current.ack_policy != desired.ack_policy
        || current.max_ack_pending != desired.max_ack_pending
        || current.max_batch != desired.max_batch
}

struct JetStreamMessage {
    payload: MessagePayload,
    message: Message,
}

impl JetStreamMessage {
    fn wrap(message: Message) -> Result<Self, SourceError> {
        let info = message
            .info()
            .map_err(|info_error| SourceError::Transport(info_error.to_string()))?;

        let mut headers = HashMap::new();
        if let Some(message_headers) = &message.headers {
            for (name, values) in message_headers.iter() {
                headers.insert(
                    name.to_string(),
                    values.iter().map(|value| value.to_string()).collect(),
                );
            }
        }

        let published = DateTime::<Utc>::from_timestamp(
            info.published.unix_timestamp(),
            info.published.nanosecond(),
        )
        .unwrap_or_default();

        let payload = MessagePayload {
            subject: message.subject.to_string(),
            headers,
            data: message.payload.to_vec(),
            stream_sequence: info.stream_sequence,
            consumer_sequence: info.consumer_sequence,
            delivered: info.delivered as u64,
            published,
        };

        Ok(Self { payload, message })
    }
}

#[async_trait]
impl StreamMessage for JetStreamMessage {
    fn payload(&self) -> MessagePayload {
        self.payload.clone()
    }

    async fn ack(&self) -> Result<(), AckError> {
        self.message
            .ack()
            .await
            .map_err(|ack_error| AckError(ack_error.to_string()))
    }

    async fn nak(&self) -> Result<(), AckError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|ack_error| AckError(ack_error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bridge_common::binding::BatchingPolicy;

    use super::*;

    fn binding(start_position: StartPosition, batching: Option<BatchingPolicy>) -> Binding {
        Binding {
            id: Uuid::new_v4(),
            target: "https://functions.example.com/handle".to_owned(),
            stream: "EVENTS".to_owned(),
            subject_filter: "events.orders.>".to_owned(),
            start_position,
            batching,
        }
    }

    #[test]
    fn config_defaults_to_single_message_pulls() {
        let binding = binding(StartPosition::All, None);
        let config = consumer_config(&binding);

        assert_eq!(config.durable_name, Some(binding.consumer_name()));
        assert_eq!(config.filter_subject, "events.orders.>");
        assert_eq!(config.deliver_policy, DeliverPolicy::All);
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
        assert_eq!(config.max_batch, 1);
        assert_eq!(config.max_ack_pending, 1);
        assert_eq!(config.max_waiting, 1);
    }

    #[test]
    fn config_follows_the_batching_policy() {
        let binding = binding(
            StartPosition::Sequence(42),
            Some(BatchingPolicy {
                max_messages: 25,
                max_latency: Duration::from_secs(2),
            }),
        );
        let config = consumer_config(&binding);

        assert_eq!(
            config.deliver_policy,
            DeliverPolicy::ByStartSequence { start_sequence: 42 }
        );
        assert_eq!(config.max_batch, 25);
        assert_eq!(config.max_ack_pending, 25);
    }

    #[test]
    fn drift_detection_ignores_server_populated_fields() {
        let binding = binding(StartPosition::All, None);
        let desired = consumer_config(&binding);

        let mut current = consumer::Config {
            durable_name: desired.durable_name.clone(),
            name: Some("server-assigned".to_owned()),
            filter_subject: desired.filter_subject.clone(),
            deliver_policy: desired.deliver_policy,
            ack_policy: desired.ack_policy,
            ack_wait: desired.ack_wait,
            max_deliver: desired.max_deliver,
            max_waiting: desired.max_waiting,
            max_ack_pending: desired.max_ack_pending,
            max_batch: desired.max_batch,
            ..Default::default()
        };
        assert!(!config_drifted(&current, &desired));

        current.max_batch = 100;
        assert!(config_drifted(&current, &desired));

        current.max_batch = desired.max_batch;
        current.filter_subject = "events.refunds.>".to_owned();
        assert!(config_drifted(&current, &desired));
    }
}
