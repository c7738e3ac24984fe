//! In-memory implementations of the capability set.
//!
//! One per trait, next to the production implementation, so every crate in
//! the workspace can exercise membership, scheduling and dispatch logic
//! without Postgres, NATS or a live compute target. The message and
//! invoker types record enough to assert the ack/nak contracts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::binding::{Binding, NewBinding};
use crate::invoke::{InvokeError, Invoker};
use crate::payload::MessagePayload;
use crate::peer::Peer;
use crate::source::{AckError, MessageSource, SourceError, StreamMessage};
use crate::store::{BindingStore, PeerStore, StoreError};

pub struct MemoryPeerStore {
    lease_ttl: Duration,
    peers: Mutex<HashMap<Uuid, Peer>>,
    fail_joins: AtomicBool,
    fail_renews: AtomicBool,
    fail_lists: AtomicBool,
}

impl MemoryPeerStore {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            lease_ttl,
            peers: Mutex::new(HashMap::new()),
            fail_joins: AtomicBool::new(false),
            fail_renews: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
        }
    }

    /// Make every subsequent join fail, as if the store rejected the write.
    pub fn fail_joins(&self) {
        self.fail_joins.store(true, Ordering::SeqCst);
    }

    /// Make every subsequent renewal fail, simulating a lost lease.
    pub fn fail_renews(&self) {
        self.fail_renews.store(true, Ordering::SeqCst);
    }

    /// Make every subsequent live-peer listing fail, as if the store were
    /// unreachable.
    pub fn fail_lists(&self) {
        self.fail_lists.store(true, Ordering::SeqCst);
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or_else(|_| chrono::Duration::seconds(5))
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn join(&self) -> Result<Peer, StoreError> {
        if self.fail_joins.load(Ordering::SeqCst) {
            return Err(StoreError::AlreadyExists);
        }

        let now = Utc::now();
        let peer = Peer {
            id: Uuid::new_v4(),
            hostname: "memory".to_owned(),
            joined_at: now,
            last_seen_at: now,
            lease_expires_at: now + self.ttl(),
        };

        let mut peers = self.peers.lock().expect("poisoned MemoryPeerStore mutex");
        peers.insert(peer.id, peer.clone());
        Ok(peer)
    }

    async fn renew(&self, id: Uuid) -> Result<Peer, StoreError> {
        if self.fail_renews.load(Ordering::SeqCst) {
            return Err(StoreError::NotFound);
        }

        let now = Utc::now();
        let mut peers = self.peers.lock().expect("poisoned MemoryPeerStore mutex");
        match peers.get_mut(&id) {
            Some(peer) if now < peer.lease_expires_at => {
                peer.last_seen_at = now;
                peer.lease_expires_at = now + self.ttl();
                Ok(peer.clone())
            }
            // A lapsed lease cannot be renewed, only rejoined.
            _ => Err(StoreError::NotFound),
        }
    }

    async fn leave(&self, id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut peers = self.peers.lock().expect("poisoned MemoryPeerStore mutex");
        if let Some(peer) = peers.get_mut(&id) {
            peer.last_seen_at = now;
            peer.lease_expires_at = now;
        }
        Ok(())
    }

    async fn list_live(&self) -> Result<Vec<Peer>, StoreError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(sqlx::Error::PoolClosed));
        }

        let now = Utc::now();
        let peers = self.peers.lock().expect("poisoned MemoryPeerStore mutex");
        let mut live: Vec<Peer> = peers
            .values()
            .filter(|peer| now < peer.lease_expires_at)
            .cloned()
            .collect();
        live.sort_by_key(|peer| peer.joined_at);
        Ok(live)
    }
}

#[derive(Default)]
pub struct MemoryBindingStore {
    bindings: Mutex<Vec<Binding>>,
}

impl MemoryBindingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BindingStore for MemoryBindingStore {
    async fn create(&self, new: NewBinding) -> Result<Binding, StoreError> {
        let binding = Binding {
            id: Uuid::new_v4(),
            target: new.target,
            stream: new.stream,
            subject_filter: new.subject_filter,
            start_position: new.start_position,
            batching: new.batching,
        };

        let mut bindings = self
            .bindings
            .lock()
            .expect("poisoned MemoryBindingStore mutex");
        bindings.push(binding.clone());
        Ok(binding)
    }

    async fn get(&self, id: Uuid) -> Result<Binding, StoreError> {
        let bindings = self
            .bindings
            .lock()
            .expect("poisoned MemoryBindingStore mutex");
        bindings
            .iter()
            .find(|binding| binding.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Binding>, StoreError> {
        let bindings = self
            .bindings
            .lock()
            .expect("poisoned MemoryBindingStore mutex");
        Ok(bindings.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut bindings = self
            .bindings
            .lock()
            .expect("poisoned MemoryBindingStore mutex");
        let before = bindings.len();
        bindings.retain(|binding| binding.id != id);
        if bindings.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// How a message was settled, in settlement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Naked,
}

type Journal = Arc<Mutex<Vec<(String, Settlement)>>>;

struct MessageState {
    label: String,
    acked: AtomicBool,
    naked: AtomicBool,
    journal: Journal,
}

/// A stream message whose settlement is observable from the test.
#[derive(Clone)]
pub struct MemoryMessage {
    payload: MessagePayload,
    state: Arc<MessageState>,
}

impl MemoryMessage {
    pub fn is_acked(&self) -> bool {
        self.state.acked.load(Ordering::SeqCst)
    }

    pub fn is_naked(&self) -> bool {
        self.state.naked.load(Ordering::SeqCst)
    }

    pub fn is_settled(&self) -> bool {
        self.is_acked() || self.is_naked()
    }
}

#[async_trait]
impl StreamMessage for MemoryMessage {
    fn payload(&self) -> MessagePayload {
        self.payload.clone()
    }

    async fn ack(&self) -> Result<(), AckError> {
        if !self.state.acked.swap(true, Ordering::SeqCst) {
            let mut journal = self.state.journal.lock().expect("poisoned journal mutex");
            journal.push((self.state.label.clone(), Settlement::Acked));
        }
        Ok(())
    }

    async fn nak(&self) -> Result<(), AckError> {
        if !self.state.naked.swap(true, Ordering::SeqCst) {
            let mut journal = self.state.journal.lock().expect("poisoned journal mutex");
            journal.push((self.state.label.clone(), Settlement::Naked));
        }
        Ok(())
    }
}

/// In-memory message source: per-binding queues, no durable state.
#[derive(Default)]
pub struct MemorySource {
    queues: Mutex<HashMap<Uuid, VecDeque<MemoryMessage>>>,
    journal: Journal,
    fetches: AtomicUsize,
    sequence: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for a binding, returning a handle the test can use
    /// to observe its settlement.
    pub fn push(&self, binding_id: Uuid, label: &str, data: &[u8]) -> MemoryMessage {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let message = MemoryMessage {
            payload: MessagePayload {
                subject: label.to_owned(),
                headers: HashMap::new(),
                data: data.to_vec(),
                stream_sequence: sequence,
                consumer_sequence: sequence,
                delivered: 1,
                published: Utc::now(),
            },
            state: Arc::new(MessageState {
                label: label.to_owned(),
                acked: AtomicBool::new(false),
                naked: AtomicBool::new(false),
                journal: self.journal.clone(),
            }),
        };

        let mut queues = self.queues.lock().expect("poisoned MemorySource mutex");
        queues
            .entry(binding_id)
            .or_default()
            .push_back(message.clone());
        message
    }

    /// Settlements across all messages, in the order they happened.
    pub fn settlements(&self) -> Vec<(String, Settlement)> {
        self.journal.lock().expect("poisoned journal mutex").clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn fetch(&self, binding: &Binding) -> Result<Vec<Box<dyn StreamMessage>>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let max_messages = binding
            .batching
            .map(|policy| policy.max_messages)
            .unwrap_or(crate::source::DEFAULT_FETCH_MESSAGES);

        let batch: Vec<Box<dyn StreamMessage>> = {
            let mut queues = self.queues.lock().expect("poisoned MemorySource mutex");
            let queue = queues.entry(binding.id).or_default();
            let take = max_messages.min(queue.len());
            queue
                .drain(..take)
                .map(|message| -> Box<dyn StreamMessage> { Box::new(message) })
                .collect()
        };

        if batch.is_empty() {
            // Stand-in for the batch-latency wait, kept short for tests.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(batch)
    }
}

/// Records invocations and optionally fails them, either wholesale or on
/// the nth call (1-indexed).
#[derive(Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<(String, Vec<u8>)>>,
    counter: AtomicUsize,
    fail_all: AtomicBool,
    fail_on_call: Mutex<Option<usize>>,
}

impl RecordingInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn fail_on_call(&self, n: usize) {
        *self
            .fail_on_call
            .lock()
            .expect("poisoned RecordingInvoker mutex") = Some(n);
    }

    pub fn calls(&self) -> Vec<(String, Vec<u8>)> {
        self.calls
            .lock()
            .expect("poisoned RecordingInvoker mutex")
            .clone()
    }
}

#[async_trait]
impl Invoker for RecordingInvoker {
    async fn invoke(&self, target: &str, payload: Vec<u8>) -> Result<(), InvokeError> {
        let call = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .lock()
            .expect("poisoned RecordingInvoker mutex")
            .push((target.to_owned(), payload));

        let fail_on = *self
            .fail_on_call
            .lock()
            .expect("poisoned RecordingInvoker mutex");
        if self.fail_all.load(Ordering::SeqCst) || fail_on == Some(call) {
            return Err(InvokeError::Function("injected failure".to_owned()));
        }
        Ok(())
    }
}
