//! Run one bridge peer: join the fleet, schedule owned bindings, pump
//! their messages into compute-target invocations.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use bridge_common::health::HealthRegistry;
use bridge_common::metrics::{serve, setup_metrics_router};
use bridge_common::pgstore::{connect_pool, PgBindingStore, PgPeerStore};
use bridge_common::store::{BindingStore, PeerStore};
use bridge_worker::config::Config;
use bridge_worker::dispatch::Dispatcher;
use bridge_worker::invoker::HttpInvoker;
use bridge_worker::jetstream::JetStreamSource;
use bridge_worker::membership::PeerMembership;
use bridge_worker::scheduler::BindingScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration:");

    let pool = connect_pool(&config.database_url, config.max_pg_connections).await?;
    let peer_store: Arc<dyn PeerStore> =
        Arc::new(PgPeerStore::new(pool.clone(), config.peer_lease_ttl.0));
    let binding_store: Arc<dyn BindingStore> = Arc::new(PgBindingStore::new(pool));

    let nats = async_nats::connect(&config.nats_url).await?;
    let source = Arc::new(JetStreamSource::new(async_nats::jetstream::new(nats)));

    let invoker = Arc::new(HttpInvoker::new(config.invoke_timeout.0)?);

    let liveness = HealthRegistry::new("bridge-worker");
    let scheduler_liveness = liveness
        .register("scheduler".to_string(), time::Duration::seconds(30))
        .await;
    let membership_liveness = liveness
        .register("membership".to_string(), time::Duration::seconds(30))
        .await;

    let router = setup_metrics_router()
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::task::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for interrupt");
        info!("interrupt received, shutting down");
        interrupt.cancel();
    });

    let mut membership =
        PeerMembership::join(peer_store.clone(), shutdown, membership_liveness).await?;
    let peer_id = membership.peer_id();
    let context = membership.context();

    let scheduler = BindingScheduler::new(
        binding_store,
        peer_store,
        source,
        Dispatcher::new(invoker),
        config.poll_interval.0,
        scheduler_liveness,
    );
    membership.go(async move { scheduler.run(peer_id, context).await.map_err(Into::into) });

    membership.wait().await?;
    Ok(())
}
