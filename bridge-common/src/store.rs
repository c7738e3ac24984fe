use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::binding::{Binding, NewBinding};
use crate::peer::Peer;

/// Errors for operations against the durable stores. Database errors can
/// originate from sqlx and are wrapped to provide context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record already exists")]
    AlreadyExists,
    #[error("record not found")]
    NotFound,
    #[error("{command} query failed with: {error}")]
    Database {
        command: String,
        #[source]
        error: sqlx::Error,
    },
    #[error("store connection failed with: {0}")]
    Connection(#[source] sqlx::Error),
}

/// Lease-based membership records for the worker fleet.
///
/// All cross-process mutation goes through the store's conditional-write
/// primitives; there is no in-process locking between peers.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Create a new peer record with a fresh lease. Fails with
    /// [`StoreError::AlreadyExists`] if the minted id collides.
    async fn join(&self) -> Result<Peer, StoreError>;

    /// Renew the lease for a live peer, updating `last_seen_at` and
    /// `lease_expires_at`. Fails with [`StoreError::NotFound`] when the
    /// peer is unknown or its lease has already lapsed; a peer that lost
    /// its lease must not silently resurrect.
    async fn renew(&self, id: Uuid) -> Result<Peer, StoreError>;

    /// Expire the lease immediately. Best-effort shutdown path; the lease
    /// would expire naturally anyway.
    async fn leave(&self, id: Uuid) -> Result<(), StoreError>;

    /// All peers whose lease has not expired.
    async fn list_live(&self) -> Result<Vec<Peer>, StoreError>;
}

/// Durable binding records. The store does not track assignment; owners
/// are recomputed from the live-peer snapshot on every read.
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn create(&self, new: NewBinding) -> Result<Binding, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Binding, StoreError>;
    async fn list(&self) -> Result<Vec<Binding>, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}
