//! PostgreSQL implementations of the peer and binding stores.
//!
//! Expiry is logical: lapsed peers stay in the table but every read
//! filters on `lease_expires_at > now()`, and renewal requires the lease
//! to still be live. That mirrors the conditional-write discipline the
//! bridge relies on instead of cross-process locks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::binding::{BatchingPolicy, Binding, NewBinding, StartPosition};
use crate::peer::Peer;
use crate::store::{BindingStore, PeerStore, StoreError};

/// Open a lazily-connecting pool for the bridge stores.
pub async fn connect_pool(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(StoreError::Connection)
}

fn query_error(command: &str, error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        error => StoreError::Database {
            command: command.to_owned(),
            error,
        },
    }
}

#[derive(sqlx::FromRow)]
struct PeerRow {
    id: Uuid,
    hostname: String,
    joined_at: chrono::DateTime<Utc>,
    last_seen_at: chrono::DateTime<Utc>,
    lease_expires_at: chrono::DateTime<Utc>,
}

impl From<PeerRow> for Peer {
    fn from(row: PeerRow) -> Self {
        Peer {
            id: row.id,
            hostname: row.hostname,
            joined_at: row.joined_at,
            last_seen_at: row.last_seen_at,
            lease_expires_at: row.lease_expires_at,
        }
    }
}

#[derive(Clone)]
pub struct PgPeerStore {
    pool: PgPool,
    lease_ttl: Duration,
}

impl PgPeerStore {
    pub fn new(pool: PgPool, lease_ttl: Duration) -> Self {
        Self { pool, lease_ttl }
    }

    fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or_else(|_| chrono::Duration::seconds(5))
    }

    fn hostname() -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
    }
}

#[async_trait]
impl PeerStore for PgPeerStore {
    async fn join(&self) -> Result<Peer, StoreError> {
        let now = Utc::now();
        let row: PeerRow = sqlx::query_as(
            r#"
INSERT INTO peers (id, hostname, joined_at, last_seen_at, lease_expires_at)
VALUES ($1, $2, $3, $3, $4)
RETURNING id, hostname, joined_at, last_seen_at, lease_expires_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(Self::hostname())
        .bind(now)
        .bind(now + self.lease_ttl())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| match error {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::AlreadyExists,
            error => query_error("INSERT peers", error),
        })?;

        Ok(row.into())
    }

    async fn renew(&self, id: Uuid) -> Result<Peer, StoreError> {
        let now = Utc::now();
        let row: PeerRow = sqlx::query_as(
            r#"
UPDATE peers
SET last_seen_at = $2, lease_expires_at = $3
WHERE id = $1 AND lease_expires_at > $2
RETURNING id, hostname, joined_at, last_seen_at, lease_expires_at
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now + self.lease_ttl())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| query_error("UPDATE peers", error))?;

        Ok(row.into())
    }

    async fn leave(&self, id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
UPDATE peers
SET last_seen_at = $2, lease_expires_at = $2
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|error| query_error("UPDATE peers", error))?;

        Ok(())
    }

    async fn list_live(&self) -> Result<Vec<Peer>, StoreError> {
        let rows: Vec<PeerRow> = sqlx::query_as(
            r#"
SELECT id, hostname, joined_at, last_seen_at, lease_expires_at
FROM peers
WHERE lease_expires_at > $1
ORDER BY joined_at
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| query_error("SELECT peers", error))?;

        Ok(rows.into_iter().map(Peer::from).collect())
    }
}

#[derive(Clone)]
pub struct PgBindingStore {
    pool: PgPool,
}

impl PgBindingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn binding_from_row(row: &sqlx::postgres::PgRow) -> Result<Binding, StoreError> {
        let start_position: sqlx::types::Json<StartPosition> = row
            .try_get("start_position")
            .map_err(|error| query_error("SELECT bindings", error))?;
        let batching: Option<sqlx::types::Json<BatchingPolicy>> = row
            .try_get("batching")
            .map_err(|error| query_error("SELECT bindings", error))?;

        Ok(Binding {
            id: row
                .try_get("id")
                .map_err(|error| query_error("SELECT bindings", error))?,
            target: row
                .try_get("target")
                .map_err(|error| query_error("SELECT bindings", error))?,
            stream: row
                .try_get("stream")
                .map_err(|error| query_error("SELECT bindings", error))?,
            subject_filter: row
                .try_get("subject_filter")
                .map_err(|error| query_error("SELECT bindings", error))?,
            start_position: start_position.0,
            batching: batching.map(|json| json.0),
        })
    }
}

#[async_trait]
impl BindingStore for PgBindingStore {
    async fn create(&self, new: NewBinding) -> Result<Binding, StoreError> {
        let row = sqlx::query(
            r#"
INSERT INTO bindings (id, target, stream, subject_filter, start_position, batching, created_at)
VALUES ($1, $2, $3, $4, $5, $6, NOW())
RETURNING id, target, stream, subject_filter, start_position, batching
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.target)
        .bind(&new.stream)
        .bind(&new.subject_filter)
        .bind(sqlx::types::Json(new.start_position))
        .bind(new.batching.map(sqlx::types::Json))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| match error {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::AlreadyExists,
            error => query_error("INSERT bindings", error),
        })?;

        Self::binding_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Binding, StoreError> {
        let row = sqlx::query(
            r#"
SELECT id, target, stream, subject_filter, start_position, batching
FROM bindings
WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| query_error("SELECT bindings", error))?;

        Self::binding_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<Binding>, StoreError> {
        let rows = sqlx::query(
            r#"
SELECT id, target, stream, subject_filter, start_position, batching
FROM bindings
ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| query_error("SELECT bindings", error))?;

        rows.iter().map(Self::binding_from_row).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM bindings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| query_error("DELETE bindings", error))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
