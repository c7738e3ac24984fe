use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A member of the worker fleet, identified by a lease record in the peer
/// store. A peer is live only while its lease has not expired; expiry is a
/// logical delete, readers never see lapsed peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    pub hostname: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl Peer {
    pub fn is_live(&self) -> bool {
        Utc::now() < self.lease_expires_at
    }
}
