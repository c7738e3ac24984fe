//! Decides which bindings this peer runs and keeps worker tasks in line
//! with that decision.
//!
//! Every poll cycle re-lists the bindings and the live peers, recomputes
//! rendezvous ownership from scratch and reconciles the running worker
//! set. Ownership is never persisted anywhere; two peers with the same
//! view of the fleet always reach the same answer independently.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use bridge_common::assignment;
use bridge_common::binding::Binding;
use bridge_common::health::HealthHandle;
use bridge_common::source::MessageSource;
use bridge_common::store::{BindingStore, PeerStore};

use crate::dispatch::Dispatcher;
use crate::error::SchedulerError;
use crate::worker;

/// Worker tasks for the bindings this peer currently owns, scoped to a
/// single cancellation token so an ownership change swaps the whole set.
struct WorkerSet {
    scope: CancellationToken,
    tasks: JoinSet<()>,
    ids: BTreeSet<Uuid>,
}

impl WorkerSet {
    fn new() -> Self {
        Self {
            scope: CancellationToken::new(),
            tasks: JoinSet::new(),
            ids: BTreeSet::new(),
        }
    }

    /// Bring the running workers in line with `owned`; returns whether the
    /// set was swapped.
    ///
    /// An unchanged id set leaves the running workers untouched so their
    /// consumers keep an uninterrupted fetch cadence. Any change cancels
    /// the old scope and starts a fresh worker per binding under a new
    /// one. Workers only observe cancellation between batches, so work
    /// already fetched by the old set still settles.
    fn reconcile<F, Fut>(&mut self, parent: &CancellationToken, owned: Vec<Binding>, start: F) -> bool
    where
        F: Fn(Binding, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ids: BTreeSet<Uuid> = owned.iter().map(|binding| binding.id).collect();
        if ids.len() != owned.len() {
            // The store should never hand out duplicate ids; run each
            // binding once regardless.
            error!("binding listing contains duplicate ids");
        }
        if ids == self.ids {
            return false;
        }

        self.scope.cancel();
        self.scope = parent.child_token();

        let mut started = BTreeSet::new();
        for binding in owned {
            if started.insert(binding.id) {
                self.tasks.spawn(start(binding, self.scope.clone()));
            }
        }
        self.ids = ids;
        true
    }

    /// Reap finished workers; a panic in any of them is fatal.
    fn reap(&mut self) -> Result<(), SchedulerError> {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(join_error) = joined {
                return Err(SchedulerError::TaskPanic(join_error.to_string()));
            }
        }
        Ok(())
    }

    async fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.scope.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(join_error) = joined {
                return Err(SchedulerError::TaskPanic(join_error.to_string()));
            }
        }
        Ok(())
    }
}

pub struct BindingScheduler {
    bindings: Arc<dyn BindingStore>,
    peers: Arc<dyn PeerStore>,
    source: Arc<dyn MessageSource>,
    dispatcher: Dispatcher,
    poll_interval: Duration,
    liveness: HealthHandle,
}

impl BindingScheduler {
    pub fn new(
        bindings: Arc<dyn BindingStore>,
        peers: Arc<dyn PeerStore>,
        source: Arc<dyn MessageSource>,
        dispatcher: Dispatcher,
        poll_interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            bindings,
            peers,
            source,
            dispatcher,
            poll_interval,
            liveness,
        }
    }

    /// Poll until the context is cancelled, then wind the workers down.
    ///
    /// A failed listing is logged and the cycle skipped; the previous
    /// worker set keeps running on the last good view of the fleet.
    pub async fn run(
        self,
        peer_id: Uuid,
        context: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut workers = WorkerSet::new();

        loop {
            tokio::select! {
                _ = context.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(scheduler_error) = workers.reap() {
                error!("binding worker panicked: {}", scheduler_error);
                return Err(scheduler_error);
            }

            let listed = tokio::try_join!(self.bindings.list(), self.peers.list_live());
            let (bindings, peers) = match listed {
                Ok(listed) => listed,
                Err(store_error) => {
                    warn!("scheduler poll failed: {}", store_error);
                    continue;
                }
            };
            self.liveness.report_healthy().await;

            let peer_ids: Vec<Uuid> = peers.iter().map(|peer| peer.id).collect();
            let owned: Vec<Binding> = bindings
                .into_iter()
                .filter(|binding| assignment::owner(&peer_ids, binding.id) == Some(peer_id))
                .collect();

            metrics::gauge!("bridge_assigned_bindings").set(owned.len() as f64);

            let source = self.source.clone();
            let dispatcher = self.dispatcher.clone();
            let swapped = workers.reconcile(&context, owned, move |binding, scope| {
                worker::run_binding(binding, source.clone(), dispatcher.clone(), scope)
            });
            if swapped {
                info!(
                    peer_id = %peer_id,
                    bindings = workers.ids.len(),
                    "assigned binding set changed, workers restarted"
                );
                metrics::counter!("bridge_worker_set_swaps_total").increment(1);
            }
        }

        workers.shutdown().await
    }
}
