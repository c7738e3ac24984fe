//! HTTP control plane for the bridge: manage bindings, inspect the peer
//! fleet, and see which peer each binding is assigned to right now.
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use bridge_common::metrics::setup_metrics_router;
use bridge_common::pgstore::{connect_pool, PgBindingStore, PgPeerStore};
use handlers::AppState;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = connect_pool(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to database");
    let state = AppState {
        peers: Arc::new(PgPeerStore::new(
            pool.clone(),
            Duration::from_millis(config.peer_lease_ttl_ms),
        )),
        bindings: Arc::new(PgBindingStore::new(pool)),
    };

    let app = handlers::add_routes(Router::new(), state);
    let app = app.merge(setup_metrics_router());

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start bridge-api http server, {}", e),
    }
}
