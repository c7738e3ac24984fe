//! Lease-based fleet membership for one peer process.
//!
//! `join` creates the peer record and starts a background renewal task
//! that sleeps half the remaining lease each round, so a slow renewal
//! still has half the TTL of margin before expiry. A failed renewal is
//! never retried: the rendezvous assigner may already have handed this
//! peer's bindings to someone else, so the only safe move is to cancel
//! the lease context and stop all work immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use bridge_common::health::HealthHandle;
use bridge_common::peer::Peer;
use bridge_common::store::PeerStore;

use crate::error::{MembershipError, TaskError};

const LEAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// A joined peer plus its fail-fast task group. Registered children
/// inherit the lease context; the first child error cancels the rest and
/// becomes the overall result.
pub struct PeerMembership {
    peer: Peer,
    context: CancellationToken,
    tasks: JoinSet<Result<(), TaskError>>,
}

impl PeerMembership {
    /// Join the fleet. Failure here is fatal to the process: a peer that
    /// cannot join cannot safely take ownership of work.
    pub async fn join(
        store: Arc<dyn PeerStore>,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) -> Result<Self, MembershipError> {
        let peer = store.join().await.map_err(MembershipError::Join)?;
        info!(peer_id = %peer.id, hostname = %peer.hostname, "joined peer fleet");
        liveness.report_healthy().await;

        let context = shutdown.child_token();
        let mut tasks = JoinSet::new();

        tasks.spawn(renewal_loop(
            store.clone(),
            peer.clone(),
            context.clone(),
            liveness,
        ));
        tasks.spawn(leave_on_cancel(store, peer.id, context.clone()));

        Ok(Self {
            peer,
            context,
            tasks,
        })
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer.id
    }

    /// The lease context. Cancelled when renewal fails, a child fails, or
    /// the process is shut down from outside.
    pub fn context(&self) -> CancellationToken {
        self.context.clone()
    }

    /// Register a child task. Children should watch the lease context and
    /// return promptly once it is cancelled.
    pub fn go<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Run the task group to completion, fail-fast: the first child error
    /// cancels the lease context and is returned after the remaining
    /// children (including the best-effort leave) have wound down.
    pub async fn wait(mut self) -> Result<(), TaskError> {
        let mut first_error: Option<TaskError> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => Err(TaskError::Panic(join_error.to_string())),
            };

            if let Err(task_error) = result {
                error!("membership task failed: {}", task_error);
                self.context.cancel();
                first_error.get_or_insert(task_error);
            }
        }

        match first_error {
            Some(task_error) => Err(task_error),
            None => Ok(()),
        }
    }
}

async fn renewal_loop(
    store: Arc<dyn PeerStore>,
    peer: Peer,
    context: CancellationToken,
    liveness: HealthHandle,
) -> Result<(), TaskError> {
    let mut due_by = peer.lease_expires_at;

    loop {
        let remaining = (due_by - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = context.cancelled() => return Ok(()),
            _ = tokio::time::sleep(remaining / 2) => {
                match store.renew(peer.id).await {
                    Ok(renewed) => {
                        metrics::counter!("bridge_lease_renewals_total").increment(1);
                        liveness.report_healthy().await;
                        due_by = renewed.lease_expires_at;
                    }
                    Err(store_error) => {
                        // No retry: liveness can no longer be proven, so
                        // every dependent task has to stop now.
                        metrics::counter!("bridge_lease_renewal_failures_total").increment(1);
                        context.cancel();
                        return Err(MembershipError::Renew(store_error).into());
                    }
                }
            }
        }
    }
}

/// Best-effort leave once the lease context is cancelled. Failure is
/// logged, not propagated; the lease expires naturally anyway.
async fn leave_on_cancel(
    store: Arc<dyn PeerStore>,
    peer_id: Uuid,
    context: CancellationToken,
) -> Result<(), TaskError> {
    context.cancelled().await;

    match tokio::time::timeout(LEAVE_TIMEOUT, store.leave(peer_id)).await {
        Ok(Ok(())) => info!(peer_id = %peer_id, "left peer fleet"),
        Ok(Err(store_error)) => {
            warn!(peer_id = %peer_id, "failed to leave peer fleet: {}", store_error)
        }
        Err(_) => warn!(peer_id = %peer_id, "timed out leaving peer fleet"),
    }
    Ok(())
}
