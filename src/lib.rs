pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;

pub use api::handlers;
pub use api::routes;
pub use error::{CoreError, CoreResult};
pub use logic::{
    ForceSyncReconciler, InstanceTopologyTreeBuilder, ModelTopologyOverlay, RemoteCall,
    ServiceDifferenceClassifier, ServiceInstanceLocks, ServiceInstanceOperations, SyncPlan,
    SyncReport, TemplateDiffEngine,
};
pub use model::*;
pub use store::{MemoryStore, PostgresStore, Store};

use crate::api::AppContext;
use crate::config::{AppConfig, StoreBackend};

/// Router with its state attached, ready to serve.
pub fn build_app<S: Store + 'static>(store: Arc<S>, config: &AppConfig) -> Router {
    let remote = RemoteCall::new(config.reconcile.remote_call_timeout());
    log::info!("Store calls time out after {:?}", remote.timeout());
    let context = AppContext::new(store, remote, config.reconcile.list_page_limit);
    api::routes::create_router::<S>().with_state(Arc::new(context))
}

/// Open the configured store and serve until the listener closes.
pub async fn run_server(config: &AppConfig) -> anyhow::Result<()> {
    let app = match config.store.backend {
        StoreBackend::Memory => {
            log::info!("Using in-memory store");
            let store = MemoryStore::new();
            if config.store.load_seed_data {
                seed::load_seed_data(&store).await?;
            }
            build_app(Arc::new(store), config)
        }
        StoreBackend::Postgres => {
            log::info!("Connecting to PostgreSQL...");
            let database_url = config.database_url()?;
            let store = PostgresStore::new(&database_url, config.max_connections()).await?;
            log::info!("Running database migrations...");
            store.migrate().await?;
            if config.store.load_seed_data {
                log::warn!("Seed data is only loaded into the in-memory store, skipping");
            }
            build_app(Arc::new(store), config)
        }
    };

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("CMDB reconcile server running on http://{}", bind_address);
    axum::serve(listener, app).await?;

    Ok(())
}
