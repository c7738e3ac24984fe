use std::sync::Arc;

use bridge_common::store::{BindingStore, PeerStore};

pub mod app;
pub mod bindings;
pub mod peers;

pub use app::add_routes;

#[derive(Clone)]
pub struct AppState {
    pub peers: Arc<dyn PeerStore>,
    pub bindings: Arc<dyn BindingStore>,
}
